//! XMPP server implementation.
//!
//! The server listens on TCP (port 5222 by default) for client-to-server
//! connections. Each accepted socket gets its own [`ConnectionActor`]; the
//! shared [`AccountManager`] routes between them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::{ConnectionActor, SessionServices};
use crate::extensions::ExtensionPipeline;
use crate::keepalive::KeepaliveConfig;
use crate::metrics;
use crate::registry::{AccountManager, RegistryBus};
use crate::XmppError;

/// How long sessions get to say goodbye once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// XMPP server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Address to bind for C2S connections (default: 0.0.0.0:5222)
    pub addr: SocketAddr,
    /// Whether clients must negotiate STARTTLS before authenticating
    pub tls_required: bool,
    /// TLS certificate path (PEM format)
    pub tls_cert_path: Option<String>,
    /// TLS private key path (PEM format)
    pub tls_key_path: Option<String>,
    /// Idle-read deadline for bound sessions
    pub keepalive: KeepaliveConfig,
    /// Log every inbound stanza at debug level
    pub debug_stanzas: bool,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            tls_required: false,
            tls_cert_path: None,
            tls_key_path: None,
            keepalive: KeepaliveConfig::default(),
            debug_stanzas: false,
        }
    }
}

/// XMPP server instance.
pub struct XmppServer {
    config: XmppServerConfig,
    listener: TcpListener,
    services: SessionServices,
}

impl XmppServer {
    /// Bind the listener and load TLS material.
    ///
    /// The registry loops behind `bus` must already be running. A listener
    /// with `tls_required` needs a certificate from the config or from
    /// [`XmppServer::with_tls_acceptor`] before [`XmppServer::run`].
    pub async fn bind(
        config: XmppServerConfig,
        accounts: Arc<AccountManager>,
        bus: RegistryBus,
        shutdown: CancellationToken,
    ) -> Result<Self, XmppError> {
        let tls_acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Some(load_tls_config(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(XmppError::config(
                    "TLS certificate and key must be configured together",
                ))
            }
        };
        let listener = TcpListener::bind(config.addr).await?;
        info!(addr = %config.addr, domain = %accounts.config().domain, "XMPP listener bound");

        let extensions =
            ExtensionPipeline::standard(Arc::clone(&accounts), bus.clone(), config.debug_stanzas);
        let services = SessionServices {
            accounts,
            bus,
            extensions,
            tls_acceptor,
            tls_required: config.tls_required,
            keepalive: config.keepalive,
            shutdown,
        };

        Ok(Self {
            config,
            listener,
            services,
        })
    }

    /// Replace the TLS acceptor loaded from disk.
    pub fn with_tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.services.tls_acceptor = Some(acceptor);
        self
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is requested.
    pub async fn run(self) -> Result<(), XmppError> {
        if self.config.tls_required && self.services.tls_acceptor.is_none() {
            return Err(XmppError::config("TLS required but no certificate configured"));
        }
        let transport = if self.config.tls_required {
            "tcp+starttls"
        } else {
            "tcp"
        };
        info!(
            addr = %self.local_addr()?,
            tls_required = self.config.tls_required,
            "XMPP server accepting connections"
        );

        let shutdown = self.services.shutdown.clone();
        let mut sessions = JoinSet::new();

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            metrics::record_connection(transport);
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Could not set TCP_NODELAY");
            }

            let services = self.services.clone();
            sessions.spawn(
                async move {
                    if let Err(e) =
                        ConnectionActor::handle_connection(stream, peer_addr, services).await
                    {
                        debug!(error = %e, "Connection ended with error");
                    }
                }
                .instrument(info_span!(
                    "xmpp.connection.lifecycle",
                    client_ip = %peer_addr,
                    transport = transport,
                )),
            );

            // Reap finished sessions so the set does not grow unbounded.
            while sessions.try_join_next().is_some() {}
        }

        info!(sessions = sessions.len(), "XMPP server shutting down");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "Sessions did not finish in time, aborting");
            sessions.abort_all();
        }
        Ok(())
    }
}

/// Build a TLS acceptor from PEM files.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, XmppError> {
    use rustls_pemfile::{certs, private_key};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls::ServerConfig;

    let cert_file = File::open(cert_path)
        .map_err(|e| XmppError::config(format!("Failed to open cert file {}: {}", cert_path, e)))?;
    let key_file = File::open(key_path)
        .map_err(|e| XmppError::config(format!("Failed to open key file {}: {}", key_path, e)))?;

    let certs: Vec<_> = certs(&mut BufReader::new(cert_file))
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(XmppError::config(format!("No certificates found in {}", cert_path)));
    }

    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| XmppError::config(format!("Failed to read key file {}: {}", key_path, e)))?
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| XmppError::config(format!("TLS config error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

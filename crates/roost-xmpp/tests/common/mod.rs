//! Test utilities for end-to-end XMPP testing.
//!
//! Provides helpers for starting test servers, generating TLS certificates,
//! and driving raw XMPP client connections.

#![allow(dead_code)]

use std::io::{BufReader, Cursor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::{
    rustls::{ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector,
};
use tokio_util::sync::CancellationToken;

use roost_xmpp::bus::PublishedMessage;
use roost_xmpp::{
    AccountConfig, AccountManager, AdminIdentity, InMemoryStatusStore, LocalBus, XmppServer,
    XmppServerConfig,
};

/// Domain every test server runs as.
pub const DOMAIN: &str = "localhost";

/// Shared secret every test server accepts.
pub const PASSWORD: &str = "secret";

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the ring crypto provider for rustls.
/// Must be called once before any TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install crypto provider");
    });
}

/// Account settings used by [`TestServer::start`].
pub fn test_account_config() -> AccountConfig {
    AccountConfig {
        domain: DOMAIN.to_string(),
        admin: AdminIdentity {
            password: PASSWORD.to_string(),
            ..AdminIdentity::default()
        },
        ..AccountConfig::default()
    }
}

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: CertificateDer<'static>,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for testing.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .expect("Failed to generate test certificate");

        Self {
            cert_pem: cert.pem().into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
        }
    }

    /// Create a TLS acceptor (server-side) from these credentials.
    pub fn tls_acceptor(&self) -> TlsAcceptor {
        use rustls_pemfile::{certs, private_key};

        let certs: Vec<CertificateDer> = certs(&mut BufReader::new(Cursor::new(&self.cert_pem)))
            .filter_map(|r| r.ok())
            .collect();
        let key = private_key(&mut BufReader::new(Cursor::new(&self.key_pem)))
            .expect("Failed to read key")
            .expect("No private key");

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .expect("Failed to create server config");

        TlsAcceptor::from(Arc::new(server_config))
    }

    /// Create a TLS connector (client-side) that trusts this certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.add(self.cert_der.clone()).expect("Failed to add cert");

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    }
}

/// Test server handle. The server shuts down when this is dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub accounts: Arc<AccountManager>,
    pub store: Arc<InMemoryStatusStore>,
    pub bus: Arc<LocalBus>,
    pub tls_credentials: Option<TestTlsCredentials>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a plaintext test server on an available port.
    pub async fn start() -> Self {
        Self::start_with(test_account_config(), XmppServerConfig::default()).await
    }

    /// Start a test server that requires STARTTLS.
    pub async fn start_tls() -> Self {
        install_crypto_provider();
        let listener = XmppServerConfig {
            tls_required: true,
            ..XmppServerConfig::default()
        };
        Self::start_with(test_account_config(), listener).await
    }

    /// Start a test server with custom settings. The listen address is
    /// always replaced by an ephemeral loopback port.
    pub async fn start_with(account: AccountConfig, listener: XmppServerConfig) -> Self {
        let shutdown = CancellationToken::new();
        let store = Arc::new(InMemoryStatusStore::new());
        let (bus, deliveries) = LocalBus::new(64);
        let bus = Arc::new(bus);

        let accounts = Arc::new(
            AccountManager::new(account)
                .with_store(store.clone())
                .with_publisher(bus.clone()),
        );
        let registry_bus = accounts.start(shutdown.clone());
        accounts.spawn_bus_consumer(deliveries, registry_bus.clone(), shutdown.clone());

        let tls_required = listener.tls_required;
        let listener = XmppServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..listener
        };
        let mut server = XmppServer::bind(listener, Arc::clone(&accounts), registry_bus, shutdown.clone())
            .await
            .expect("Failed to bind test server");

        let tls_credentials = if tls_required {
            let credentials = TestTlsCredentials::generate(DOMAIN);
            server = server.with_tls_acceptor(credentials.tls_acceptor());
            Some(credentials)
        } else {
            None
        };

        let addr = server.local_addr().expect("Failed to get local addr");
        tokio::spawn(server.run());

        Self {
            addr,
            accounts,
            store,
            bus,
            tls_credentials,
            shutdown,
        }
    }

    /// Open a raw client connection.
    pub async fn connect(&self) -> RawXmppClient {
        RawXmppClient::connect(self.addr)
            .await
            .expect("Failed to connect to test server")
    }

    /// Connect and run the full plaintext handshake, binding `user@localhost/resource`.
    pub async fn login(&self, user: &str, resource: &str) -> RawXmppClient {
        let mut client = self.connect().await;
        client
            .handshake(user, PASSWORD, resource)
            .await
            .expect("Login failed");
        self.wait_online(user, resource).await;
        client
    }

    /// Wait until the registry lists `user@localhost/resource` as online.
    pub async fn wait_online(&self, user: &str, resource: &str) {
        let jid: jid::FullJid = format!("{}@{}/{}", user, DOMAIN, resource)
            .parse()
            .expect("Invalid JID");
        let accounts = Arc::clone(&self.accounts);
        timeout(DEFAULT_TIMEOUT, async move {
            while !accounts.is_online(&jid) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Session never came online");
    }

    /// Wait until the registry no longer lists `user@localhost/resource`.
    pub async fn wait_offline(&self, user: &str, resource: &str) {
        let jid: jid::FullJid = format!("{}@{}/{}", user, DOMAIN, resource)
            .parse()
            .expect("Invalid JID");
        let accounts = Arc::clone(&self.accounts);
        timeout(DEFAULT_TIMEOUT, async move {
            while accounts.is_online(&jid) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Session never went offline");
    }

    /// Observe messages the server publishes on its bus.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.bus.subscribe()
    }

    /// Stop the server.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait for the next published message on `topic`.
pub async fn next_published(
    rx: &mut broadcast::Receiver<PublishedMessage>,
    topic: &str,
    timeout_dur: Duration,
) -> serde_json::Value {
    timeout(timeout_dur, async {
        loop {
            let message = rx.recv().await.expect("Bus closed");
            if message.topic == topic {
                return serde_json::from_slice(&message.payload).expect("Payload is not JSON");
            }
        }
    })
    .await
    .expect("Timed out waiting for a published message")
}

/// A client that operates directly on the socket for precise control.
pub struct RawXmppClient {
    tcp: Option<TcpStream>,
    tls: Option<tokio_rustls::client::TlsStream<TcpStream>>,
    buffer: String,
}

impl RawXmppClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp: Some(tcp),
            tls: None,
            buffer: String::new(),
        })
    }

    /// Send raw data.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if let Some(ref mut tls) = self.tls {
            tls.write_all(data.as_bytes()).await?;
            tls.flush().await?;
        } else if let Some(ref mut tcp) = self.tcp {
            tcp.write_all(data.as_bytes()).await?;
            tcp.flush().await?;
        }
        Ok(())
    }

    /// Read one chunk with timeout. Returns the number of bytes read.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<usize> {
        let mut buf = [0u8; 4096];
        let n = timeout(timeout_dur, async {
            if let Some(ref mut tls) = self.tls {
                tls.read(&mut buf).await
            } else if let Some(ref mut tcp) = self.tcp {
                tcp.read(&mut buf).await
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "Not connected"))
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout"))??;

        self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        Ok(n)
    }

    /// Read until `pattern` appears in the buffer, then return and clear it.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        loop {
            if self.buffer.contains(pattern) {
                return Ok(std::mem::take(&mut self.buffer));
            }

            let remaining = timeout_dur.checked_sub(start.elapsed()).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for {:?}, have {:?}", pattern, self.buffer),
                )
            })?;

            if self.read(remaining).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed waiting for {:?}, have {:?}", pattern, self.buffer),
                ));
            }
        }
    }

    /// Read until the server closes the connection. Returns everything received.
    pub async fn read_to_close(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        loop {
            let remaining = timeout_dur.checked_sub(start.elapsed()).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "Connection stayed open")
            })?;
            match self.read(remaining).await {
                Ok(0) => return Ok(std::mem::take(&mut self.buffer)),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(e),
                // A reset also counts as closed.
                Err(_) => return Ok(std::mem::take(&mut self.buffer)),
            }
        }
    }

    /// Assert nothing arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        match self.read(window).await {
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            other => panic!("Expected silence, got {:?} with buffer {:?}", other, self.buffer),
        }
    }

    /// Send the opening stream header.
    pub async fn send_stream_header(&mut self) -> std::io::Result<()> {
        self.send(&format!(
            "<?xml version='1.0'?>\
            <stream:stream xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams' \
            to='{}' version='1.0'>",
            DOMAIN
        ))
        .await
    }

    /// Send SASL PLAIN credentials.
    pub async fn send_sasl_plain(&mut self, user: &str, password: &str) -> std::io::Result<()> {
        let encoded = BASE64_STANDARD.encode(format!("\0{}\0{}", user, password));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            encoded
        ))
        .await
    }

    /// Send a resource bind request.
    pub async fn send_bind(&mut self, resource: &str) -> std::io::Result<()> {
        self.send(&format!(
            "<iq xmlns='jabber:client' type='set' id='bind_1'>\
                <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{}</resource></bind>\
            </iq>",
            resource
        ))
        .await
    }

    /// Authenticate, restart the stream and bind. The initial stream header
    /// must not have been sent yet (or must be resent after STARTTLS).
    pub async fn handshake(&mut self, user: &str, password: &str, resource: &str) -> std::io::Result<String> {
        self.send_stream_header().await?;
        self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;

        self.send_sasl_plain(user, password).await?;
        self.read_until("<success", DEFAULT_TIMEOUT).await?;

        self.send_stream_header().await?;
        self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;

        self.send_bind(resource).await?;
        self.read_until("</iq>", DEFAULT_TIMEOUT).await
    }

    /// Upgrade to TLS after `<proceed/>`.
    pub async fn upgrade_to_tls(&mut self, connector: TlsConnector) -> std::io::Result<()> {
        let tcp = self
            .tcp
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "No TCP stream"))?;
        let server_name = ServerName::try_from(DOMAIN.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        self.tls = Some(connector.connect(server_name, tcp).await?);
        self.buffer.clear();
        Ok(())
    }
}

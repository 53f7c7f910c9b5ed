//! Protocol state machine for the stream handshake.
//!
//! A session walks one of two static tables, with or without the STARTTLS
//! branch. Each handshake state has one dispatch function; the terminal
//! `Normal` state is run by [`crate::connection::ConnectionActor`].

use std::fmt;

use jid::FullJid;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::auth::{decode_plain, SaslMechanism};
use crate::connection::SessionServices;
use crate::keepalive::IdleDeadline;
use crate::metrics;
use crate::registry::{ConnectEvent, Mailbox, Outbound};
use crate::stanza::Stanza;
use crate::stream::{Transport, XmppStream};
use crate::XmppError;

/// Handshake and session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Read the opening stream tag, announce features
    Start,
    /// Consume `<starttls/>`
    TlsUpgradeRequest,
    /// Send `<proceed/>` and run the TLS handshake
    TlsUpgrade,
    /// Restart the stream over TLS, announce SASL
    TlsStartStream,
    /// SASL over TLS
    TlsAuth,
    /// SASL over plaintext
    Auth,
    /// Restart the stream after SASL, announce bind
    AuthedStart,
    /// Resource binding
    AuthedStream,
    /// Long-lived duplex loop
    Normal,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// States for a listener without TLS.
pub const PLAIN_STATES: &[State] = &[
    State::Start,
    State::Auth,
    State::AuthedStart,
    State::AuthedStream,
    State::Normal,
];

/// States for a listener requiring STARTTLS.
pub const TLS_STATES: &[State] = &[
    State::Start,
    State::TlsUpgradeRequest,
    State::TlsUpgrade,
    State::TlsStartStream,
    State::TlsAuth,
    State::AuthedStart,
    State::AuthedStream,
    State::Normal,
];

/// The state table for a listener.
pub fn state_table(tls_required: bool) -> &'static [State] {
    if tls_required {
        TLS_STATES
    } else {
        PLAIN_STATES
    }
}

/// A bound session, produced by `AuthedStream`.
#[derive(Debug)]
pub struct BoundSession {
    pub jid: FullJid,
    pub local_part: String,
    pub mailbox: Mailbox,
    pub receiver: mpsc::Receiver<Outbound>,
}

/// What the handshake has learned about the client so far.
#[derive(Debug, Default)]
pub struct Handshake {
    /// Authenticated username
    pub local_part: Option<String>,
    /// Set once the resource is bound
    pub bound: Option<BoundSession>,
}

/// Run one handshake state.
pub async fn dispatch<S: Transport>(
    state: State,
    stream: &mut XmppStream<S>,
    services: &SessionServices,
    handshake: &mut Handshake,
) -> Result<(), XmppError> {
    debug!(state = %state, "Entering state");
    match state {
        State::Start => start(stream, services).await,
        State::TlsUpgradeRequest => tls_upgrade_request(stream).await,
        State::TlsUpgrade => tls_upgrade(stream, services).await,
        State::TlsStartStream => tls_start_stream(stream).await,
        State::TlsAuth | State::Auth => auth(stream, services, handshake).await,
        State::AuthedStart => authed_start(stream).await,
        State::AuthedStream => authed_stream(stream, services, handshake).await,
        State::Normal => Err(XmppError::internal("Normal state is not a handshake state")),
    }
}

async fn start<S: Transport>(
    stream: &mut XmppStream<S>,
    services: &SessionServices,
) -> Result<(), XmppError> {
    let header = stream.read_stream_header().await?;
    if let Some(to) = &header.to {
        if to != stream.domain() {
            debug!(expected = %stream.domain(), got = %to, "Domain mismatch in stream header");
        }
    }

    stream.send_stream_header().await?;
    if services.tls_required {
        stream.send_features_starttls().await
    } else {
        stream.send_features_sasl().await
    }
}

async fn tls_upgrade_request<S: Transport>(stream: &mut XmppStream<S>) -> Result<(), XmppError> {
    match stream.read_stanza().await? {
        Stanza::StartTls => Ok(()),
        other => Err(XmppError::stream(format!(
            "expected starttls, got {}",
            other.name()
        ))),
    }
}

async fn tls_upgrade<S: Transport>(
    stream: &mut XmppStream<S>,
    services: &SessionServices,
) -> Result<(), XmppError> {
    let acceptor = services
        .tls_acceptor
        .as_ref()
        .ok_or_else(|| XmppError::config("TLS required but no certificate loaded"))?;
    stream.upgrade_tls(acceptor).await
}

async fn tls_start_stream<S: Transport>(stream: &mut XmppStream<S>) -> Result<(), XmppError> {
    stream.read_stream_header().await?;
    stream.send_stream_header().await?;
    stream.send_features_sasl().await
}

#[instrument(skip_all, name = "xmpp.auth.plain", fields(username = tracing::field::Empty))]
async fn auth<S: Transport>(
    stream: &mut XmppStream<S>,
    services: &SessionServices,
    handshake: &mut Handshake,
) -> Result<(), XmppError> {
    let auth = match stream.read_stanza().await? {
        Stanza::Auth(auth) => auth,
        other => {
            return Err(XmppError::stream(format!("expected auth, got {}", other.name())));
        }
    };

    if SaslMechanism::from_name(&auth.mechanism) != Some(SaslMechanism::Plain) {
        stream.send_sasl_failure().await?;
        metrics::record_auth_attempt(&auth.mechanism, false);
        return Err(XmppError::auth_failed(format!(
            "unsupported mechanism {}",
            auth.mechanism
        )));
    }

    let credentials = match decode_plain(&auth.payload) {
        Ok(credentials) => credentials,
        Err(e) => {
            stream.send_sasl_failure().await?;
            metrics::record_auth_attempt("PLAIN", false);
            return Err(e);
        }
    };

    let local_part = credentials.local_part().to_string();
    if !services.accounts.authenticate(&local_part, &credentials.password) {
        stream.send_sasl_failure().await?;
        metrics::record_auth_attempt("PLAIN", false);
        return Err(XmppError::auth_failed(local_part));
    }

    stream.send_sasl_success().await?;
    metrics::record_auth_attempt("PLAIN", true);
    tracing::Span::current().record("username", local_part.as_str());
    handshake.local_part = Some(local_part);
    Ok(())
}

async fn authed_start<S: Transport>(stream: &mut XmppStream<S>) -> Result<(), XmppError> {
    stream.read_stream_header().await?;
    stream.send_stream_header().await?;
    stream.send_features_bind().await
}

#[instrument(skip_all, name = "xmpp.bind")]
async fn authed_stream<S: Transport>(
    stream: &mut XmppStream<S>,
    services: &SessionServices,
    handshake: &mut Handshake,
) -> Result<(), XmppError> {
    let local_part = handshake
        .local_part
        .clone()
        .ok_or_else(|| XmppError::internal("bind before authentication"))?;

    let iq = match stream.read_stanza().await? {
        Stanza::Iq(iq) => iq,
        other => {
            return Err(XmppError::stream(format!("expected bind, got {}", other.name())));
        }
    };
    let requested = iq
        .bind_resource()
        .ok_or_else(|| XmppError::stream("expected a bind request"))?;

    let resource = if requested.is_empty() {
        generate_resource()
    } else {
        requested
    };

    let domain = &services.accounts.config().domain;
    let jid: FullJid = format!("{}@{}/{}", local_part, domain, resource)
        .parse()
        .map_err(|e| XmppError::stream(format!("invalid JID: {}", e)))?;

    stream.send_bind_result(&iq.id, &jid.to_string()).await?;
    info!(jid = %jid, "Resource bound");

    let (mailbox, receiver) = Mailbox::channel(services.accounts.config().mailbox_capacity);
    if !services.bus.connect(ConnectEvent {
        jid: jid.clone(),
        local_part: local_part.clone(),
        mailbox: mailbox.clone(),
    }) {
        warn!(jid = %jid, "Registry unavailable");
        return Err(XmppError::internal("registry stopped"));
    }

    stream.set_idle_deadline(IdleDeadline::arm(&services.keepalive));
    handshake.bound = Some(BoundSession {
        jid,
        local_part,
        mailbox,
        receiver,
    });
    Ok(())
}

/// Random resource for a bind request without one.
fn generate_resource() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_end_in_normal() {
        assert_eq!(PLAIN_STATES.last(), Some(&State::Normal));
        assert_eq!(TLS_STATES.last(), Some(&State::Normal));
        assert_eq!(PLAIN_STATES.first(), Some(&State::Start));
    }

    #[test]
    fn test_tls_table_has_upgrade_branch() {
        assert!(state_table(true).contains(&State::TlsUpgrade));
        assert!(!state_table(false).contains(&State::TlsUpgrade));
        assert!(state_table(false).contains(&State::Auth));
        assert!(!state_table(true).contains(&State::Auth));
    }

    #[test]
    fn test_generated_resource() {
        let resource = generate_resource();
        assert_eq!(resource.len(), 16);
        assert!(resource.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(resource, generate_resource());
    }
}

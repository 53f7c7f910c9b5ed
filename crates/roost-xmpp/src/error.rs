//! Error types for the XMPP server.

use thiserror::Error;

use crate::parser::{escape, ns};

/// XMPP server errors.
///
/// Every variant is stream-fatal when it escapes a handshake state or the
/// Normal-state reader; business outcomes such as a message to an offline
/// JID are never represented here.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Element name not present in the stanza registry
    #[error("Unknown stanza: {0}")]
    UnknownStanza(String),

    /// SASL PLAIN payload could not be decoded
    #[error("Malformed auth payload: {0}")]
    MalformedAuth(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Protocol violation on the stream
    #[error("Stream error: {0}")]
    Stream(String),

    /// Idle read deadline expired
    #[error("Read deadline expired")]
    Timeout,

    /// Peer closed the stream or the socket
    #[error("Stream closed by peer")]
    StreamClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new unknown stanza error.
    pub fn unknown_stanza(name: impl Into<String>) -> Self {
        Self::UnknownStanza(name.into())
    }

    /// Create a new malformed auth error.
    pub fn malformed_auth(msg: impl Into<String>) -> Self {
        Self::MalformedAuth(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stream error condition to send before closing, if the peer should get one.
    pub fn stream_condition(&self) -> Option<&'static str> {
        match self {
            Self::XmlParse(_) => Some(stream_errors::NOT_WELL_FORMED),
            Self::UnknownStanza(_) => Some(stream_errors::UNSUPPORTED_STANZA_TYPE),
            Self::Stream(_) => Some(stream_errors::POLICY_VIOLATION),
            Self::Internal(_) => Some(stream_errors::INTERNAL_SERVER_ERROR),
            _ => None,
        }
    }
}

/// XMPP stanza error conditions used by this server (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request
    BadRequest,
    /// Conflict
    Conflict,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate an IQ error response.
pub fn generate_iq_error(
    id: &str,
    to: Option<&str>,
    from: Option<&str>,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
) -> String {
    let mut iq = format!("<iq type='error' id='{}'", escape(id));

    if let Some(to) = to {
        iq.push_str(&format!(" to='{}'", escape(to)));
    }

    if let Some(from) = from {
        iq.push_str(&format!(" from='{}'", escape(from)));
    }

    iq.push_str(&format!(
        "><error type='{}'><{} xmlns='{}'/></error></iq>",
        error_type.as_str(),
        condition.as_str(),
        ns::STANZAS,
    ));

    iq
}

/// Generate a stream error and close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str) -> String {
    format!(
        "<stream:error><{} xmlns='{}'/></stream:error></stream:stream>",
        condition,
        ns::STREAM_ERRORS
    )
}

/// Stream error conditions the server emits.
pub mod stream_errors {
    /// Stream error: internal server error
    pub const INTERNAL_SERVER_ERROR: &str = "internal-server-error";
    /// Stream error: not well-formed
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    /// Stream error: policy violation
    pub const POLICY_VIOLATION: &str = "policy-violation";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    /// Stream error: unsupported stanza type
    pub const UNSUPPORTED_STANZA_TYPE: &str = "unsupported-stanza-type";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iq_error_generation() {
        let error = generate_iq_error(
            "cr001",
            Some("admin@example.com/roost"),
            Some("dev1@example.com/roost"),
            StanzaErrorCondition::ResourceConstraint,
            StanzaErrorType::Wait,
        );

        assert!(error.contains("type='error'"));
        assert!(error.contains("id='cr001'"));
        assert!(error.contains("to='admin@example.com/roost'"));
        assert!(error.contains("from='dev1@example.com/roost'"));
        assert!(error.contains("<error type='wait'>"));
        assert!(error.contains("<resource-constraint xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>"));
    }

    #[test]
    fn test_iq_error_escapes_attributes() {
        let error = generate_iq_error(
            "a'b",
            None,
            None,
            StanzaErrorCondition::BadRequest,
            StanzaErrorType::Modify,
        );
        assert!(error.contains("id='a&apos;b'"));
        assert!(!error.contains(" to="));
    }

    #[test]
    fn test_stream_error_generation() {
        let error = generate_stream_error(stream_errors::NOT_WELL_FORMED);
        assert!(error.starts_with("<stream:error><not-well-formed"));
        assert!(error.ends_with("</stream:stream>"));
    }

    #[test]
    fn test_stream_condition_mapping() {
        assert_eq!(
            XmppError::xml_parse("bad").stream_condition(),
            Some(stream_errors::NOT_WELL_FORMED)
        );
        assert_eq!(
            XmppError::unknown_stanza("r").stream_condition(),
            Some(stream_errors::UNSUPPORTED_STANZA_TYPE)
        );
        assert_eq!(XmppError::Timeout.stream_condition(), None);
        assert_eq!(XmppError::StreamClosed.stream_condition(), None);
    }
}

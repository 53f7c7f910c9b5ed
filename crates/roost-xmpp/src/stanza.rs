//! Stanza type registry and the decoded stanza sum type.
//!
//! The registry maps a qualified element name to the shape it decodes into.
//! The opening `stream:stream` tag never forms a complete element and is
//! framed separately by [`crate::parser::XmlParser`].

use minidom::Element;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::parser::{element_to_string, ns};
use crate::XmppError;

/// Shapes known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// `<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>`
    StartTls,
    /// SASL `<auth/>`
    Auth,
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// `<iq/>`, including resource binding
    Iq,
}

/// Static mapping from (namespace, local name) to stanza shape.
const REGISTRY: &[(&str, &str, StanzaKind)] = &[
    (ns::TLS, "starttls", StanzaKind::StartTls),
    (ns::SASL, "auth", StanzaKind::Auth),
    (ns::JABBER_CLIENT, "message", StanzaKind::Message),
    (ns::JABBER_CLIENT, "presence", StanzaKind::Presence),
    (ns::JABBER_CLIENT, "iq", StanzaKind::Iq),
];

/// Look up the registered shape of an element.
pub fn lookup(name: &str, namespace: &str) -> Option<StanzaKind> {
    REGISTRY
        .iter()
        .find(|(n, local, _)| *n == namespace && *local == name)
        .map(|(_, _, kind)| *kind)
}

/// A decoded top-level element.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// STARTTLS request
    StartTls,
    /// SASL auth request
    Auth(SaslAuth),
    /// Message stanza
    Message(Message),
    /// Presence stanza
    Presence(Presence),
    /// IQ stanza
    Iq(ClientIq),
}

impl Stanza {
    /// Decode an element through the registry.
    pub fn decode(element: Element) -> Result<Self, XmppError> {
        let namespace = element.ns();
        let kind = lookup(element.name(), &namespace).ok_or_else(|| {
            XmppError::unknown_stanza(format!("{{{}}}{}", namespace, element.name()))
        })?;

        match kind {
            StanzaKind::StartTls => Ok(Stanza::StartTls),
            StanzaKind::Auth => Ok(Stanza::Auth(SaslAuth {
                mechanism: element.attr("mechanism").unwrap_or_default().to_string(),
                payload: element.text().trim().to_string(),
            })),
            StanzaKind::Message => Message::try_from(element)
                .map(Stanza::Message)
                .map_err(|e| XmppError::xml_parse(format!("invalid message: {}", e))),
            StanzaKind::Presence => Presence::try_from(element)
                .map(Stanza::Presence)
                .map_err(|e| XmppError::xml_parse(format!("invalid presence: {}", e))),
            StanzaKind::Iq => ClientIq::from_element(element).map(Stanza::Iq),
        }
    }

    /// Get the stanza name for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::StartTls => "starttls",
            Stanza::Auth(_) => "auth",
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    /// Serialize back into XML.
    pub fn to_xml(&self) -> Result<String, XmppError> {
        let element = match self {
            Stanza::StartTls => Element::builder("starttls", ns::TLS).build(),
            Stanza::Auth(auth) => Element::builder("auth", ns::SASL)
                .attr("mechanism", auth.mechanism.as_str())
                .append(auth.payload.as_str())
                .build(),
            Stanza::Message(msg) => Element::from(msg.clone()),
            Stanza::Presence(pres) => Element::from(pres.clone()),
            Stanza::Iq(iq) => iq.element.clone(),
        };
        element_to_string(&element)
    }
}

/// SASL `<auth mechanism='...'>payload</auth>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslAuth {
    /// Requested mechanism
    pub mechanism: String,
    /// Base64 initial response
    pub payload: String,
}

/// IQ type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error,
}

impl IqKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "get" => Some(Self::Get),
            "set" => Some(Self::Set),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// An IQ from a client.
///
/// Kept close to the wire: addresses stay as the client wrote them, and the
/// children are matched structurally by the extensions. Error bounces from
/// devices do not always carry a well-formed RFC 6120 error, so this is not
/// the strict `xmpp_parsers::iq::Iq`.
#[derive(Debug, Clone)]
pub struct ClientIq {
    pub id: String,
    pub kind: IqKind,
    pub from: Option<String>,
    pub to: Option<String>,
    element: Element,
}

impl ClientIq {
    fn from_element(element: Element) -> Result<Self, XmppError> {
        let kind = element
            .attr("type")
            .and_then(IqKind::parse)
            .ok_or_else(|| XmppError::xml_parse("iq without a valid type"))?;
        Ok(Self {
            id: element.attr("id").unwrap_or_default().to_string(),
            kind,
            from: element.attr("from").map(str::to_string),
            to: element.attr("to").map(str::to_string),
            element,
        })
    }

    /// Child with the given name and namespace.
    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.get_child(name, namespace)
    }

    /// The `<error/>` child regardless of namespace.
    pub fn error(&self) -> Option<&Element> {
        self.element.children().find(|c| c.name() == "error")
    }

    /// The requested resource when this is a bind request.
    ///
    /// `Some("")` means a bind without a resource.
    pub fn bind_resource(&self) -> Option<String> {
        if self.kind != IqKind::Set {
            return None;
        }
        let bind = self.child("bind", ns::BIND)?;
        Some(
            bind.children()
                .find(|c| c.name() == "resource")
                .map(|r| r.text().trim().to_string())
                .unwrap_or_default(),
        )
    }

    /// The underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }
}

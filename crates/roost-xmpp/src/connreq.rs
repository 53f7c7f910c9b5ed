//! TR-069 connection requests over XMPP.
//!
//! A management system asks a device to call home by sending it an IQ
//! carrying `<connectionRequest xmlns='urn:broadband-forum-org:cwmp:xmppConnReq-1-0'/>`
//! with a fixed id. The device answers with an empty `result`, or bounces a
//! `<resource-constraint/>` error when it is busy.

use std::fmt;

use jid::{BareJid, Jid};

use crate::error::{generate_iq_error, StanzaErrorCondition, StanzaErrorType};
use crate::parser::escape;
use crate::stanza::{ClientIq, IqKind};

/// Namespace of the connection request payload.
pub const NS_CONNREQ: &str = "urn:broadband-forum-org:cwmp:xmppConnReq-1-0";

/// IQ id used for every connection request and its answer.
pub const CONNREQ_ID: &str = "cr001";

/// Where a wake request came from, and so where its outcome goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Consumed from the message bus; the outcome is published back.
    Bus {
        /// Task id echoed in the acknowledgement
        task_id: String,
        /// Topic the acknowledgement is published on
        topic_id: String,
    },
    /// Sent by a connected client; the outcome is returned as an IQ.
    Client,
}

/// A request to wake a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Who asked
    pub origin: RequestOrigin,
    /// Requester JID, used as `from` on the wake IQ
    pub from_jid: Jid,
    /// Target JID
    pub to_jid: Jid,
    /// Target local part, used as the endpoint id
    pub to_local_part: String,
    /// Connection request username
    pub username: String,
    /// Connection request password
    pub password: String,
}

impl ConnectionRequest {
    /// Build a request from a client's `cr001` get.
    ///
    /// Returns `None` when the IQ has no usable target.
    pub fn from_client_iq(iq: &ClientIq, requester: &Jid) -> Option<Self> {
        let to_jid: Jid = iq.to.as_deref()?.parse().ok()?;
        let to_local_part = to_jid.node().map(|n| n.to_string())?;

        let (username, password) = match iq.element().get_child("connectionRequest", NS_CONNREQ) {
            Some(cr) => (
                child_text(cr, "username"),
                child_text(cr, "password"),
            ),
            None => (String::new(), String::new()),
        };

        Some(Self {
            origin: RequestOrigin::Client,
            from_jid: requester.clone(),
            to_jid,
            to_local_part,
            username,
            password,
        })
    }

    /// Correlation key: the target's bare JID, so an answer from any
    /// resource of the device resolves the request.
    pub fn target_key(&self) -> BareJid {
        self.to_jid.to_bare()
    }

    /// The IQ delivered to the target session.
    pub fn to_iq(&self) -> String {
        format!(
            "<iq from='{}' to='{}' id='{}' type='get'>\
                <connectionRequest xmlns='{}'>\
                    <username>{}</username>\
                    <password>{}</password>\
                </connectionRequest>\
            </iq>",
            escape(&self.from_jid.to_string()),
            escape(&self.to_jid.to_string()),
            CONNREQ_ID,
            NS_CONNREQ,
            escape(&self.username),
            escape(&self.password),
        )
    }
}

fn child_text(parent: &minidom::Element, name: &str) -> String {
    parent
        .children()
        .find(|c| c.name() == name)
        .map(|c| c.text().trim().to_string())
        .unwrap_or_default()
}

/// A client asking the server to wake a device.
pub fn is_request(iq: &ClientIq) -> bool {
    iq.id == CONNREQ_ID && iq.kind == IqKind::Get
}

/// A device acknowledging a connection request.
pub fn is_result(iq: &ClientIq) -> bool {
    iq.id == CONNREQ_ID && iq.kind == IqKind::Result
}

/// A device reporting it is busy: `<error type='wait'><resource-constraint/></error>`.
pub fn is_busy_bounce(iq: &ClientIq) -> bool {
    iq.error().is_some_and(|error| {
        error.attr("type") == Some("wait")
            && error.children().any(|c| c.name() == "resource-constraint")
    })
}

/// How a wake request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The device acknowledged
    Success,
    /// The device reported it is busy
    Busy,
    /// No answer within the correlation window
    Timeout,
    /// The target was not online
    Offline,
    /// A newer request for the same target replaced this one
    Superseded,
}

impl WakeOutcome {
    /// Failure reason carried in acknowledgements, `None` on success.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            WakeOutcome::Success => None,
            WakeOutcome::Busy => Some("busy"),
            WakeOutcome::Timeout => Some("timeout"),
            WakeOutcome::Offline => Some("offline"),
            WakeOutcome::Superseded => Some("superseded"),
        }
    }

    /// Outcome IQ for a client-originated request.
    pub fn client_reply(&self, request: &ConnectionRequest) -> String {
        let to = request.from_jid.to_string();
        let from = request.to_jid.to_string();
        let (condition, error_type) = match self {
            WakeOutcome::Success => {
                return format!(
                    "<iq type='result' id='{}' to='{}' from='{}'/>",
                    CONNREQ_ID,
                    escape(&to),
                    escape(&from)
                );
            }
            WakeOutcome::Busy => (StanzaErrorCondition::ResourceConstraint, StanzaErrorType::Wait),
            WakeOutcome::Timeout => (StanzaErrorCondition::RemoteServerTimeout, StanzaErrorType::Wait),
            WakeOutcome::Offline => (StanzaErrorCondition::RecipientUnavailable, StanzaErrorType::Wait),
            WakeOutcome::Superseded => (StanzaErrorCondition::Conflict, StanzaErrorType::Cancel),
        };
        generate_iq_error(CONNREQ_ID, Some(&to), Some(&from), condition, error_type)
    }
}

impl fmt::Display for WakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason().unwrap_or("success"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_element;
    use crate::stanza::Stanza;

    fn iq(xml: &str) -> ClientIq {
        match Stanza::decode(parse_element(xml).unwrap()).unwrap() {
            Stanza::Iq(iq) => iq,
            other => panic!("expected iq, got {:?}", other),
        }
    }

    fn requester() -> Jid {
        "admin@example.com/roost".parse().unwrap()
    }

    #[test]
    fn test_request_from_client_iq() {
        let get = iq("<iq xmlns='jabber:client' type='get' id='cr001' to='dev1@example.com/roost'>\
            <connectionRequest xmlns='urn:broadband-forum-org:cwmp:xmppConnReq-1-0'>\
            <username>acs</username><password>pw</password></connectionRequest></iq>");
        assert!(is_request(&get));

        let request = ConnectionRequest::from_client_iq(&get, &requester()).unwrap();
        assert_eq!(request.origin, RequestOrigin::Client);
        assert_eq!(request.to_local_part, "dev1");
        assert_eq!(request.username, "acs");
        assert_eq!(request.password, "pw");
        assert_eq!(request.target_key().to_string(), "dev1@example.com");
    }

    #[test]
    fn test_request_without_target() {
        let get = iq("<iq xmlns='jabber:client' type='get' id='cr001'/>");
        assert!(ConnectionRequest::from_client_iq(&get, &requester()).is_none());

        let get = iq("<iq xmlns='jabber:client' type='get' id='cr001' to='example.com'/>");
        assert!(ConnectionRequest::from_client_iq(&get, &requester()).is_none());
    }

    #[test]
    fn test_wake_iq_payload() {
        let request = ConnectionRequest {
            origin: RequestOrigin::Client,
            from_jid: requester(),
            to_jid: "dev1@example.com/roost".parse().unwrap(),
            to_local_part: "dev1".to_string(),
            username: "acs".to_string(),
            password: "p&w".to_string(),
        };
        let el = parse_element(&request.to_iq().replace("<iq ", "<iq xmlns='jabber:client' ")).unwrap();
        assert_eq!(el.attr("id"), Some("cr001"));
        assert_eq!(el.attr("type"), Some("get"));
        assert_eq!(el.attr("to"), Some("dev1@example.com/roost"));
        let cr = el.get_child("connectionRequest", NS_CONNREQ).unwrap();
        assert_eq!(child_text(cr, "password"), "p&w");
    }

    #[test]
    fn test_result_and_busy_recognition() {
        assert!(is_result(&iq("<iq xmlns='jabber:client' type='result' id='cr001'/>")));
        assert!(!is_result(&iq("<iq xmlns='jabber:client' type='result' id='other'/>")));

        let busy = iq("<iq xmlns='jabber:client' type='error' id='cr001'><error type='wait'><resource-constraint/></error></iq>");
        assert!(is_busy_bounce(&busy));

        let cancel = iq("<iq xmlns='jabber:client' type='error' id='cr001'><error type='cancel'><resource-constraint/></error></iq>");
        assert!(!is_busy_bounce(&cancel));
    }

    #[test]
    fn test_outcome_reasons() {
        assert_eq!(WakeOutcome::Success.reason(), None);
        assert_eq!(WakeOutcome::Busy.reason(), Some("busy"));
        assert_eq!(WakeOutcome::Timeout.reason(), Some("timeout"));
        assert_eq!(WakeOutcome::Offline.to_string(), "offline");
    }

    #[test]
    fn test_client_reply() {
        let request = ConnectionRequest {
            origin: RequestOrigin::Client,
            from_jid: requester(),
            to_jid: "dev1@example.com/roost".parse().unwrap(),
            to_local_part: "dev1".to_string(),
            username: String::new(),
            password: String::new(),
        };
        let ok = WakeOutcome::Success.client_reply(&request);
        assert_eq!(
            ok,
            "<iq type='result' id='cr001' to='admin@example.com/roost' from='dev1@example.com/roost'/>"
        );
        assert!(WakeOutcome::Busy.client_reply(&request).contains("resource-constraint"));
        assert!(WakeOutcome::Timeout.client_reply(&request).contains("remote-server-timeout"));
    }
}

use std::sync::Arc;

use jid::Jid;
use tracing::{debug, info, warn};

use super::{Extension, SessionContext};
use crate::connreq::{self, ConnectionRequest};
use crate::error::{generate_iq_error, StanzaErrorCondition, StanzaErrorType};
use crate::parser::{escape, ns};
use crate::registry::{AccountManager, RegistryBus};
use crate::stanza::{ClientIq, IqKind, Stanza};
use crate::xep::xep0199;

/// Handles roster queries, legacy session establishment, pings and the
/// connection-request IQs.
pub struct RosterExtension {
    accounts: Arc<AccountManager>,
    bus: RegistryBus,
}

impl RosterExtension {
    pub fn new(accounts: Arc<AccountManager>, bus: RegistryBus) -> Self {
        Self { accounts, bus }
    }

    fn roster_reply(&self, iq: &ClientIq, session: &SessionContext) -> String {
        let mut reply = format!(
            "<iq id='{}' to='{}' type='result'><query xmlns='{}' ver='ver7'>",
            escape(&iq.id),
            escape(&session.jid.to_string()),
            ns::ROSTER
        );
        for jid in self.accounts.online_roster(&session.jid) {
            reply.push_str(&format!("<item jid='{}'/>", escape(&jid.to_string())));
        }
        reply.push_str("</query></iq>");
        reply
    }

    fn session_reply(iq: &ClientIq, session: &SessionContext) -> String {
        format!(
            "<iq xml:lang='en' to='{}' from='{}' type='result' id='{}'/>",
            escape(&session.jid.to_string()),
            escape(&session.jid.to_bare().to_string()),
            escape(&iq.id)
        )
    }

    fn start_connection_request(&self, iq: &ClientIq, session: &SessionContext) {
        let requester = Jid::from(session.jid.clone());
        match ConnectionRequest::from_client_iq(iq, &requester) {
            Some(request) => {
                info!(from = %session.jid, to = %request.to_jid, "Client connection request");
                self.bus.request_connection(request);
            }
            None => {
                warn!(from = %session.jid, "Connection request without a usable target");
                session.mailbox.deliver_raw(generate_iq_error(
                    &iq.id,
                    Some(&session.jid.to_string()),
                    iq.to.as_deref(),
                    StanzaErrorCondition::BadRequest,
                    StanzaErrorType::Modify,
                ));
            }
        }
    }
}

impl Extension for RosterExtension {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn process(&self, stanza: &Stanza, session: &SessionContext) {
        let Stanza::Iq(iq) = stanza else {
            return;
        };

        if connreq::is_request(iq) {
            self.start_connection_request(iq, session);
            return;
        }

        if connreq::is_result(iq) {
            self.accounts
                .connection_request_result(&session.jid, &session.local_part, true);
            return;
        }

        if connreq::is_busy_bounce(iq) {
            info!(jid = %session.jid, "Device busy");
            self.accounts
                .connection_request_result(&session.jid, &session.local_part, false);
            return;
        }

        // c2s1 is answered inline by the session reader.
        if xep0199::is_ping(iq) && !xep0199::is_fast_path_ping(iq) {
            session.mailbox.deliver_raw(xep0199::build_ping_result(iq));
            return;
        }

        if iq.kind == IqKind::Get && iq.child("query", ns::ROSTER).is_some() {
            debug!(jid = %session.jid, "Roster query");
            session.mailbox.deliver_raw(self.roster_reply(iq, session));
            return;
        }

        if iq.kind == IqKind::Set && iq.child("session", ns::SESSION).is_some() {
            session.mailbox.deliver_raw(Self::session_reply(iq, session));
        }
    }
}

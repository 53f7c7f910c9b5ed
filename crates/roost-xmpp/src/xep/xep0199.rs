//! XEP-0199: XMPP Ping
//!
//! Provides helpers for detecting ping IQs and building responses.

use crate::parser::{escape, ns};
use crate::stanza::{ClientIq, IqKind};

/// Namespace for XEP-0199 Ping.
pub const NS_PING: &str = ns::PING;

/// IQ id that deployed clients use for their periodic ping. These are
/// answered inline by the session reader without waiting for the extensions.
pub const C2S_PING_ID: &str = "c2s1";

/// Check if an IQ stanza is a ping request.
pub fn is_ping(iq: &ClientIq) -> bool {
    iq.kind == IqKind::Get && (iq.id == C2S_PING_ID || iq.child("ping", NS_PING).is_some())
}

/// Check if an IQ is the fixed-id client ping answered inline.
pub fn is_fast_path_ping(iq: &ClientIq) -> bool {
    iq.kind == IqKind::Get && iq.id == C2S_PING_ID
}

/// Build an empty result IQ for a ping request, with to/from swapped.
pub fn build_ping_result(iq: &ClientIq) -> String {
    let mut result = String::from("<iq");
    if let Some(to) = &iq.to {
        result.push_str(&format!(" from='{}'", escape(to)));
    }
    if let Some(from) = &iq.from {
        result.push_str(&format!(" to='{}'", escape(from)));
    }
    result.push_str(&format!(" id='{}' type='result'/>", escape(&iq.id)));
    result
}

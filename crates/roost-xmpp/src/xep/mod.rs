//! XMPP Extension Protocols (XEPs) used by the server.
//!
//! - **XEP-0199**: XMPP Ping - application-level keepalive.

pub mod xep0199;

pub use xep0199::{build_ping_result, is_fast_path_ping, is_ping, C2S_PING_ID, NS_PING};

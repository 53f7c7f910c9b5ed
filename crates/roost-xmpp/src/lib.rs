//! # roost-xmpp
//!
//! XMPP session server for device fleets.
//!
//! Devices log in over a small XMPP subset (SASL PLAIN, resource binding,
//! messages, presence, roster and ping), and a management side can ask the
//! server to wake a device with a TR-069 style connection request.
//!
//! ## Architecture
//!
//! - **Server**: TCP listener on port 5222 with optional mandatory STARTTLS
//! - **Connection Actors**: each client runs the handshake state table, then
//!   a duplex loop that drains its mailbox while a reader task dispatches
//! - **Extensions**: an ordered pipeline (debug, message, roster, presence)
//!   sees every inbound stanza
//! - **Account Management**: a registry of online sessions fed by routing
//!   loops, plus timed correlation of connection requests
//! - **Collaborators**: a status store and a message bus behind traits
//!
//! ## XEP Support
//!
//! - RFC 6120/6121 subset (stream, SASL PLAIN, bind, session, roster query)
//! - XEP-0199 (XMPP Ping)
//! - TR-069 Annex K connection requests over XMPP

pub mod auth;
pub mod bus;
pub mod connection;
pub mod connreq;
pub mod extensions;
pub mod keepalive;
pub mod metrics;
pub mod parser;
pub mod registry;
pub mod server;
pub mod stanza;
pub mod state;
pub mod store;
pub mod stream;
pub mod xep;

mod error;

pub use bus::{
    spawn_amqp_consumer, AdminIdentity, AmqpConsumerConfig, AmqpPublisher, BusDelivery, LocalBus,
    StatusPublisher,
};
pub use connreq::{ConnectionRequest, RequestOrigin, WakeOutcome};
pub use error::{
    generate_iq_error, generate_stream_error, stream_errors, StanzaErrorCondition, StanzaErrorType,
    XmppError,
};
pub use keepalive::KeepaliveConfig;
pub use parser::{ns, StreamHeader};
pub use registry::{AccountConfig, AccountManager, RegistryBus};
pub use server::{XmppServer, XmppServerConfig};
pub use stanza::Stanza;
pub use store::{InMemoryStatusStore, RedisStatusStore, StatusStore};

//! Session registry.
//!
//! The [`AccountManager`] owns the table of online sessions and the
//! connection-request correlation table. Sessions and extensions reach it
//! through a [`RegistryBus`], whose channels feed the registry's routing
//! loops.

mod accounts;
mod correlation;
mod mailbox;

use std::fmt;

use jid::{FullJid, Jid};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::connreq::ConnectionRequest;
use crate::stanza::Stanza;

pub use accounts::{AccountConfig, AccountManager};
pub use correlation::PendingRequests;
pub use mailbox::{Mailbox, Outbound, SendResult};

/// Emitted once per session, after resource binding.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub jid: FullJid,
    pub local_part: String,
    pub mailbox: Mailbox,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed its stream or the TCP connection
    StreamClosed,
    /// The idle deadline expired
    Timeout,
    /// Reading or decoding failed
    ReadError(String),
    /// Writing to the client failed
    WriteError(String),
    /// The server is shutting down
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::StreamClosed => write!(f, "stream closed"),
            DisconnectReason::Timeout => write!(f, "idle timeout"),
            DisconnectReason::ReadError(e) => write!(f, "read error: {}", e),
            DisconnectReason::WriteError(e) => write!(f, "write error: {}", e),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Emitted exactly once when a bound session ends.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub jid: FullJid,
    pub local_part: String,
    /// Identifies the mailbox registered by this session
    pub session_id: Uuid,
    pub reason: DisconnectReason,
}

/// A stanza addressed to a JID.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: Jid,
    pub payload: Stanza,
}

/// Inputs of the registry's routing loops.
///
/// Cheap to clone; one copy lives in every session and extension.
#[derive(Debug, Clone)]
pub struct RegistryBus {
    pub(crate) connect: mpsc::UnboundedSender<ConnectEvent>,
    pub(crate) disconnect: mpsc::UnboundedSender<DisconnectEvent>,
    pub(crate) message: mpsc::UnboundedSender<Envelope>,
    pub(crate) presence: mpsc::UnboundedSender<Envelope>,
    pub(crate) connection_request: mpsc::UnboundedSender<ConnectionRequest>,
}

impl RegistryBus {
    /// Announce a bound session.
    pub fn connect(&self, event: ConnectEvent) -> bool {
        forward(&self.connect, event, "connect")
    }

    /// Announce that a session ended.
    pub fn disconnect(&self, event: DisconnectEvent) -> bool {
        forward(&self.disconnect, event, "disconnect")
    }

    /// Hand a message to the route loop.
    pub fn route_message(&self, envelope: Envelope) -> bool {
        forward(&self.message, envelope, "message")
    }

    /// Hand a presence to the fanout loop.
    pub fn fanout_presence(&self, envelope: Envelope) -> bool {
        forward(&self.presence, envelope, "presence")
    }

    /// Queue a wake request.
    pub fn request_connection(&self, request: ConnectionRequest) -> bool {
        forward(&self.connection_request, request, "connection_request")
    }
}

fn forward<T>(tx: &mpsc::UnboundedSender<T>, item: T, routine: &'static str) -> bool {
    if tx.send(item).is_err() {
        warn!(routine, "Registry routine stopped, dropping event");
        return false;
    }
    true
}

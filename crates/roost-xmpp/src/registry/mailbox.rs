//! Per-session outbound mailbox.

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics;
use crate::stanza::Stanza;

/// Something to write to a session's stream.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A decoded stanza, marshalled on write
    Stanza(Stanza),
    /// Pre-rendered XML
    Raw(String),
}

/// Result of attempting to queue into a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Queued for delivery
    Sent,
    /// The mailbox is full (backpressure)
    ChannelFull,
    /// The session's writer has gone away
    ChannelClosed,
}

impl SendResult {
    /// Whether the item was queued.
    pub fn is_sent(&self) -> bool {
        matches!(self, SendResult::Sent)
    }
}

/// Sending side of a session's bounded outbound channel.
///
/// Cloned into the registry and the extensions; the session's writer loop
/// owns the receiver. Delivery never blocks: a full mailbox rejects.
#[derive(Debug, Clone)]
pub struct Mailbox {
    session_id: Uuid,
    sender: mpsc::Sender<Outbound>,
}

impl Mailbox {
    /// Create a mailbox and its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                session_id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    /// Identity of the session owning this mailbox.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Queue an item without waiting.
    pub fn deliver(&self, item: Outbound) -> SendResult {
        match self.sender.try_send(item) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %self.session_id, "Mailbox full, dropping stanza");
                metrics::record_dropped("full");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Mailbox closed, session may have dropped");
                metrics::record_dropped("closed");
                SendResult::ChannelClosed
            }
        }
    }

    /// Queue a decoded stanza.
    pub fn deliver_stanza(&self, stanza: Stanza) -> SendResult {
        self.deliver(Outbound::Stanza(stanza))
    }

    /// Queue pre-rendered XML.
    pub fn deliver_raw(&self, xml: impl Into<String>) -> SendResult {
        self.deliver(Outbound::Raw(xml.into()))
    }
}

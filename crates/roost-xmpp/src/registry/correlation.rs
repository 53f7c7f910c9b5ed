//! Connection-request correlation table.
//!
//! One single-slot result channel per target bare JID. Every entry carries a
//! ticket so that the timeout path only removes the entry it created: a
//! result that lands first wins, and a request that overwrote the entry is
//! left alone.

use std::collections::HashMap;

use jid::BareJid;
use tokio::sync::oneshot;

struct PendingEntry {
    ticket: u64,
    slot: oneshot::Sender<bool>,
}

/// Outstanding wake requests, keyed by target.
///
/// Not synchronized; the registry keeps it under its lock.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<BareJid, PendingEntry>,
    next_ticket: u64,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request for `key`, replacing any prior entry.
    ///
    /// The replaced waiter observes a closed channel.
    pub fn insert(&mut self, key: BareJid) -> (u64, oneshot::Receiver<bool>) {
        let (slot, rx) = oneshot::channel();
        self.next_ticket = self.next_ticket.wrapping_add(1);
        let ticket = self.next_ticket;
        self.entries.insert(key, PendingEntry { ticket, slot });
        (ticket, rx)
    }

    /// Deliver a result to the waiter for `key`, consuming the entry.
    ///
    /// Returns false when no request is pending.
    pub fn resolve(&mut self, key: &BareJid, result: bool) -> bool {
        match self.entries.remove(key) {
            // A waiter that already gave up dropped its receiver.
            Some(entry) => entry.slot.send(result).is_ok(),
            None => false,
        }
    }

    /// Remove the entry for `key` if it is still the one identified by `ticket`.
    pub fn expire(&mut self, key: &BareJid, ticket: u64) -> bool {
        if self.entries.get(key).is_some_and(|e| e.ticket == ticket) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Whether a request is pending for `key`.
    pub fn contains(&self, key: &BareJid) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let mut table = PendingRequests::new();
        let (_, rx) = table.insert(key("dev1@example.com"));
        assert!(table.contains(&key("dev1@example.com")));

        assert!(table.resolve(&key("dev1@example.com"), true));
        assert!(rx.await.unwrap());
        assert!(table.is_empty());

        assert!(!table.resolve(&key("dev1@example.com"), false));
    }

    #[test]
    fn test_expire_requires_matching_ticket() {
        let mut table = PendingRequests::new();
        let (first, _rx1) = table.insert(key("dev1@example.com"));
        let (second, _rx2) = table.insert(key("dev1@example.com"));
        assert_ne!(first, second);
        assert_eq!(table.len(), 1);

        assert!(!table.expire(&key("dev1@example.com"), first));
        assert!(table.contains(&key("dev1@example.com")));
        assert!(table.expire(&key("dev1@example.com"), second));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_closes_prior_waiter() {
        let mut table = PendingRequests::new();
        let (_, rx1) = table.insert(key("dev1@example.com"));
        let (_, _rx2) = table.insert(key("dev1@example.com"));
        assert!(rx1.await.is_err());
    }

    #[test]
    fn test_resolve_after_waiter_dropped() {
        let mut table = PendingRequests::new();
        let (_, rx) = table.insert(key("dev1@example.com"));
        drop(rx);
        assert!(!table.resolve(&key("dev1@example.com"), true));
        assert!(table.is_empty());
    }
}

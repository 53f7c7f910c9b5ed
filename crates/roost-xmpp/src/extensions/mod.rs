//! Extension pipeline.
//!
//! Every stanza decoded in the Normal state is offered to each registered
//! extension in registration order. Extensions match the shapes they care
//! about and ignore the rest. They run on the session's reader task and must
//! not block it: registry inputs are unbounded channels and mailboxes reject
//! when full.

mod debug;
mod message;
mod presence;
mod roster;

use std::sync::Arc;

use jid::FullJid;

use crate::registry::{AccountManager, Mailbox, RegistryBus};
use crate::stanza::Stanza;

pub use debug::DebugExtension;
pub use message::MessageExtension;
pub use presence::PresenceExtension;
pub use roster::RosterExtension;

/// The session a stanza arrived on.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Bound JID
    pub jid: FullJid,
    /// Authenticated username
    pub local_part: String,
    /// The session's own mailbox, for replies
    pub mailbox: Mailbox,
}

/// A pluggable stanza handler.
pub trait Extension: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &'static str;

    /// Handle one decoded stanza.
    fn process(&self, stanza: &Stanza, session: &SessionContext);
}

/// Ordered set of extensions shared by all sessions.
#[derive(Clone, Default)]
pub struct ExtensionPipeline {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionPipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard pipeline: optional Debug, then Message, Roster/IQ and Presence.
    pub fn standard(accounts: Arc<AccountManager>, bus: RegistryBus, debug_stanzas: bool) -> Self {
        let mut pipeline = Self::new();
        if debug_stanzas {
            pipeline = pipeline.with(DebugExtension);
        }
        pipeline
            .with(MessageExtension::new(bus.clone()))
            .with(RosterExtension::new(accounts, bus.clone()))
            .with(PresenceExtension::new(bus))
    }

    /// Append an extension.
    pub fn with(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Offer a stanza to every extension.
    pub fn dispatch(&self, stanza: &Stanza, session: &SessionContext) {
        for extension in &self.extensions {
            extension.process(stanza, session);
        }
    }

    /// Registered extension names, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }
}

impl std::fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl Extension for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn process(&self, _stanza: &Stanza, _session: &SessionContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispatch_reaches_every_extension() {
        let count = Arc::new(AtomicUsize::new(0));
        let pipeline = ExtensionPipeline::new()
            .with(Counting(count.clone()))
            .with(Counting(count.clone()));
        let (session, _rx) = test_support::session("alice@example.com/r1");

        pipeline.dispatch(&test_support::decode("<presence xmlns='jabber:client'/>"), &session);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_standard_pipeline_order() {
        let accounts = Arc::new(AccountManager::new(Default::default()));
        let bus = accounts.start(tokio_util::sync::CancellationToken::new());
        let pipeline = ExtensionPipeline::standard(accounts, bus, true);
        assert_eq!(pipeline.names(), vec!["debug", "message", "roster", "presence"]);
    }
}

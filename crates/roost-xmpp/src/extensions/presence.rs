use tracing::debug;

use super::{Extension, SessionContext};
use crate::registry::{Envelope, RegistryBus};
use crate::stanza::Stanza;

/// Forwards addressed presence to the registry's fanout loop.
#[derive(Debug, Clone)]
pub struct PresenceExtension {
    bus: RegistryBus,
}

impl PresenceExtension {
    pub fn new(bus: RegistryBus) -> Self {
        Self { bus }
    }
}

impl Extension for PresenceExtension {
    fn name(&self) -> &'static str {
        "presence"
    }

    fn process(&self, stanza: &Stanza, session: &SessionContext) {
        let Stanza::Presence(presence) = stanza else {
            return;
        };
        // Nothing to address without a recipient.
        let Some(to) = presence.to.clone() else {
            debug!(from = %session.jid, "Dropping presence without recipient");
            return;
        };

        debug!(from = %session.jid, to = %to, "Fanning out presence");
        self.bus.fanout_presence(Envelope {
            to,
            payload: stanza.clone(),
        });
    }
}

use tracing::debug;

use super::{Extension, SessionContext};
use crate::registry::{Envelope, RegistryBus};
use crate::stanza::Stanza;

/// Forwards addressed messages to the registry's route loop.
#[derive(Debug, Clone)]
pub struct MessageExtension {
    bus: RegistryBus,
}

impl MessageExtension {
    pub fn new(bus: RegistryBus) -> Self {
        Self { bus }
    }
}

impl Extension for MessageExtension {
    fn name(&self) -> &'static str {
        "message"
    }

    fn process(&self, stanza: &Stanza, session: &SessionContext) {
        let Stanza::Message(message) = stanza else {
            return;
        };
        let Some(to) = message.to.clone() else {
            debug!(from = %session.jid, "Message without recipient");
            return;
        };

        debug!(from = %session.jid, to = %to, "Routing message");
        self.bus.route_message(Envelope {
            to,
            payload: stanza.clone(),
        });
    }
}

use tracing::{debug, warn};

use super::{Extension, SessionContext};
use crate::stanza::Stanza;

/// Logs every stanza.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugExtension;

impl Extension for DebugExtension {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn process(&self, stanza: &Stanza, session: &SessionContext) {
        match stanza.to_xml() {
            Ok(xml) => debug!(jid = %session.jid, stanza = %xml, "Processing stanza"),
            Err(e) => warn!(jid = %session.jid, error = %e, "Failed to serialize stanza"),
        }
    }
}

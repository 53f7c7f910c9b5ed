//! Account management: authentication, the online table, routing loops and
//! connection-request correlation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jid::{BareJid, FullJid, Jid};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::correlation::PendingRequests;
use super::mailbox::Mailbox;
use super::{ConnectEvent, DisconnectEvent, Envelope, RegistryBus};
use crate::auth::AuthPolicy;
use crate::bus::{
    publish_json, wake_request_from_delivery, AdminIdentity, BusDelivery, ConnectionRequestAck,
    ConnectionStatus, ConnectionStatusEvent, StatusPublisher,
};
use crate::connreq::{ConnectionRequest, RequestOrigin, WakeOutcome};
use crate::metrics;
use crate::store::StatusStore;

/// Registry settings.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Server domain bound into JIDs
    pub domain: String,
    /// Accept every credential
    pub skip_password: bool,
    /// Admin credential, also used for bus-originated wake requests
    pub admin: AdminIdentity,
    /// Recorded in the store for online endpoints and used as `From` of acks
    pub node_id: String,
    /// Bounded mailbox size per session
    pub mailbox_capacity: usize,
    /// How long a wake request waits for the device
    pub connection_request_timeout: Duration,
    /// Topic for connection-status events
    pub status_topic: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            skip_password: false,
            admin: AdminIdentity::default(),
            node_id: "roost-node".to_string(),
            mailbox_capacity: 256,
            connection_request_timeout: Duration::from_secs(10),
            status_topic: "device-connection-topic".to_string(),
        }
    }
}

impl AccountConfig {
    /// The authentication policy these settings describe.
    pub fn auth_policy(&self) -> AuthPolicy {
        if self.skip_password {
            AuthPolicy::Bypass
        } else {
            AuthPolicy::AdminSecret(self.admin.password.clone())
        }
    }
}

#[derive(Default)]
struct RegistryState {
    online: HashMap<FullJid, Mailbox>,
    pending: PendingRequests,
}

impl RegistryState {
    /// Mailboxes addressed by `to`: exact for a full JID, every resource for a bare one.
    fn targets(&self, to: &Jid) -> Vec<(FullJid, Mailbox)> {
        match to.clone().try_into_full() {
            Ok(full) => self
                .online
                .get(&full)
                .map(|mailbox| (full, mailbox.clone()))
                .into_iter()
                .collect(),
            Err(bare) => self
                .online
                .iter()
                .filter(|(jid, _)| jid.to_bare() == bare)
                .map(|(jid, mailbox)| (jid.clone(), mailbox.clone()))
                .collect(),
        }
    }
}

/// Process-wide session registry.
///
/// The online table and the correlation table share one lock. Critical
/// sections only snapshot or mutate the tables; mailbox delivery and the
/// store/bus calls happen after the lock is released.
pub struct AccountManager {
    config: AccountConfig,
    auth: AuthPolicy,
    state: Mutex<RegistryState>,
    store: Option<Arc<dyn StatusStore>>,
    publisher: Option<Arc<dyn StatusPublisher>>,
}

impl AccountManager {
    /// Create a registry without external collaborators.
    pub fn new(config: AccountConfig) -> Self {
        let auth = config.auth_policy();
        Self {
            config,
            auth,
            state: Mutex::new(RegistryState::default()),
            store: None,
            publisher: None,
        }
    }

    /// Mirror online status into `store`.
    pub fn with_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish status events and acknowledgements through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Registry settings.
    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check a SASL PLAIN credential.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let ok = self.auth.check(username, password);
        if ok {
            info!(username = %username, "Authentication succeeded");
        } else {
            warn!(username = %username, "Authentication failed");
        }
        ok
    }

    /// Every online JID. No ordering guarantee.
    pub fn online_roster(&self, jid: &FullJid) -> Vec<FullJid> {
        debug!(jid = %jid, "Retrieving online roster");
        self.lock().online.keys().cloned().collect()
    }

    /// Whether a full JID is online.
    pub fn is_online(&self, jid: &FullJid) -> bool {
        self.lock().online.contains_key(jid)
    }

    /// Number of online sessions.
    pub fn online_count(&self) -> usize {
        self.lock().online.len()
    }

    /// Whether a wake request is pending for `key`.
    pub fn has_pending_request(&self, key: &BareJid) -> bool {
        self.lock().pending.contains(key)
    }

    /// Number of pending wake requests.
    pub fn pending_request_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Spawn the routing loops and return their inputs.
    ///
    /// The loops run until `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> RegistryBus {
        let (connect, connect_rx) = mpsc::unbounded_channel();
        let (disconnect, disconnect_rx) = mpsc::unbounded_channel();
        let (message, message_rx) = mpsc::unbounded_channel();
        let (presence, presence_rx) = mpsc::unbounded_channel();
        let (connection_request, connection_request_rx) = mpsc::unbounded_channel();

        let manager = Arc::clone(self);
        tokio::spawn(run_routine("connect", connect_rx, shutdown.clone(), move |event| {
            let manager = Arc::clone(&manager);
            async move { manager.handle_connect(event).await }
        }));

        let manager = Arc::clone(self);
        tokio::spawn(run_routine("disconnect", disconnect_rx, shutdown.clone(), move |event| {
            let manager = Arc::clone(&manager);
            async move { manager.handle_disconnect(event).await }
        }));

        let manager = Arc::clone(self);
        tokio::spawn(run_routine("route", message_rx, shutdown.clone(), move |envelope| {
            manager.route_message(envelope);
            std::future::ready(())
        }));

        let manager = Arc::clone(self);
        tokio::spawn(run_routine("presence", presence_rx, shutdown.clone(), move |envelope| {
            manager.fanout_presence(envelope);
            std::future::ready(())
        }));

        let manager = Arc::clone(self);
        tokio::spawn(run_routine(
            "connection_request",
            connection_request_rx,
            shutdown,
            move |request| {
                let manager = Arc::clone(&manager);
                async move { manager.request_connection(request).await }
            },
        ));

        RegistryBus {
            connect,
            disconnect,
            message,
            presence,
            connection_request,
        }
    }

    /// Spawn the bus consumer: `connreq` deliveries become wake requests.
    pub fn spawn_bus_consumer(
        self: &Arc<Self>,
        mut deliveries: mpsc::Receiver<BusDelivery>,
        bus: RegistryBus,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("Bus consumer started");
            loop {
                let delivery = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                let config = &manager.config;
                if let Some(request) =
                    wake_request_from_delivery(&delivery, &config.domain, &config.admin)
                {
                    bus.request_connection(request);
                }
            }
            debug!("Bus consumer stopped");
        })
    }

    /// Register a bound session and record it as online.
    #[instrument(skip(self, event), fields(jid = %event.jid))]
    pub async fn handle_connect(&self, event: ConnectEvent) {
        let count = {
            let mut state = self.lock();
            // The session ended before its connect was processed; its
            // disconnect has already been handled or is queued behind a
            // check that would find nothing to remove.
            if event.mailbox.is_closed() {
                debug!("Session already gone, skipping registration");
                return;
            }
            if state.online.insert(event.jid.clone(), event.mailbox).is_some() {
                debug!("Replaced existing session");
            }
            state.online.len()
        };
        info!(online = count, "Session online");
        metrics::record_session_count(count as i64);

        self.save_online(&event.local_part).await;
        self.publish_status(&event.local_part, ConnectionStatus::Online)
            .await;
    }

    /// Remove a session and record it as offline.
    ///
    /// A disconnect from a session whose JID has since been bound again by a
    /// newer session leaves the newer one in place.
    #[instrument(skip(self, event), fields(jid = %event.jid, reason = %event.reason))]
    pub async fn handle_disconnect(&self, event: DisconnectEvent) {
        let (removed, bare_still_online, count) = {
            let mut state = self.lock();
            let owned = state
                .online
                .get(&event.jid)
                .is_some_and(|mailbox| mailbox.session_id() == event.session_id);
            if owned {
                state.online.remove(&event.jid);
            }
            let bare = event.jid.to_bare();
            let still_online = state.online.keys().any(|jid| jid.to_bare() == bare);
            (owned, still_online, state.online.len())
        };

        if !removed {
            debug!("Disconnect for a replaced session, keeping registration");
            return;
        }
        info!(online = count, "Session offline");
        metrics::record_session_count(count as i64);

        if bare_still_online {
            debug!("Another resource is still online, keeping online status");
            return;
        }
        self.save_offline(&event.local_part).await;
        self.publish_status(&event.local_part, ConnectionStatus::Offline)
            .await;
    }

    /// Deliver a message to the sessions addressed by its `to`.
    ///
    /// Returns how many mailboxes accepted it. Offline recipients are a
    /// silent drop.
    pub fn route_message(&self, envelope: Envelope) -> usize {
        let targets = self.lock().targets(&envelope.to);
        if targets.is_empty() {
            debug!(to = %envelope.to, "Recipient offline, dropping message");
            return 0;
        }

        targets
            .iter()
            .filter(|(_, mailbox)| mailbox.deliver_stanza(envelope.payload.clone()).is_sent())
            .count()
    }

    /// Deliver a presence to every online session.
    pub fn fanout_presence(&self, envelope: Envelope) -> usize {
        let sessions: Vec<(FullJid, Mailbox)> = self
            .lock()
            .online
            .iter()
            .map(|(jid, mailbox)| (jid.clone(), mailbox.clone()))
            .collect();

        let mut delivered = 0;
        for (jid, mailbox) in sessions {
            if mailbox.is_closed() {
                warn!(jid = %jid, "Skipping closed mailbox during presence fanout");
                continue;
            }
            if mailbox.deliver_stanza(envelope.payload.clone()).is_sent() {
                delivered += 1;
            }
        }
        debug!(to = %envelope.to, delivered, "Presence fanned out");
        delivered
    }

    /// Deliver the wake IQ to the target session(s).
    ///
    /// Returns false when the target is not online or no mailbox accepted it.
    pub fn send_connection_request(&self, request: &ConnectionRequest) -> bool {
        let targets = self.lock().targets(&request.to_jid);
        if targets.is_empty() {
            warn!(to = %request.to_jid, "Connection request undeliverable, target offline");
            return false;
        }

        let iq = request.to_iq();
        let delivered = targets
            .iter()
            .filter(|(_, mailbox)| mailbox.deliver_raw(iq.clone()).is_sent())
            .count();
        debug!(
            to = %request.to_jid,
            from = %request.from_jid,
            delivered,
            "Connection request sent"
        );
        delivered > 0
    }

    /// Start a wake request: register the correlation entry, deliver the
    /// wake IQ and wait for the answer on a separate task.
    #[instrument(skip(self, request), fields(to = %request.to_jid))]
    pub async fn request_connection(self: &Arc<Self>, request: ConnectionRequest) {
        let key = request.target_key();
        let registered = {
            let mut state = self.lock();
            if state.targets(&request.to_jid).is_empty() {
                None
            } else {
                Some(state.pending.insert(key.clone()))
            }
        };

        let Some((ticket, rx)) = registered else {
            warn!("Connection request target is offline");
            self.finish(&request, WakeOutcome::Offline, None).await;
            return;
        };

        if !self.send_connection_request(&request) {
            self.expire_pending(&key, ticket);
            self.finish(&request, WakeOutcome::Offline, None).await;
            return;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.await_outcome(request, key, ticket, rx).await;
        });
    }

    /// Deliver a device's answer to the pending request for its bare JID.
    ///
    /// Returns false when nothing was pending, which is harmless.
    pub fn connection_request_result(&self, jid: &FullJid, local_part: &str, result: bool) -> bool {
        let key = jid.to_bare();
        let resolved = self.lock().pending.resolve(&key, result);
        if resolved {
            debug!(jid = %jid, local_part = %local_part, result, "Connection request answered");
        } else {
            debug!(jid = %jid, local_part = %local_part, "No such pending connection request");
        }
        resolved
    }

    fn expire_pending(&self, key: &BareJid, ticket: u64) -> bool {
        self.lock().pending.expire(key, ticket)
    }

    async fn await_outcome(
        self: Arc<Self>,
        request: ConnectionRequest,
        key: BareJid,
        ticket: u64,
        mut rx: oneshot::Receiver<bool>,
    ) {
        let started = Instant::now();
        let timeout = self.config.connection_request_timeout;
        debug!(to = %request.to_jid, ?timeout, "Waiting for connection request result");

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => outcome_of(result),
            Ok(Err(_)) => WakeOutcome::Superseded,
            Err(_) => {
                if self.expire_pending(&key, ticket) {
                    WakeOutcome::Timeout
                } else {
                    // Resolved or replaced between the timer firing and the lock.
                    match rx.try_recv() {
                        Ok(result) => outcome_of(result),
                        Err(_) => WakeOutcome::Superseded,
                    }
                }
            }
        };

        self.finish(&request, outcome, Some(started)).await;
    }

    async fn finish(&self, request: &ConnectionRequest, outcome: WakeOutcome, started: Option<Instant>) {
        let latency_ms = started.map(|s| s.elapsed().as_secs_f64() * 1000.0);
        metrics::record_connection_request(&outcome.to_string(), latency_ms);
        info!(
            to = %request.to_jid,
            local_part = %request.to_local_part,
            outcome = %outcome,
            "Connection request finished"
        );

        match &request.origin {
            RequestOrigin::Bus { task_id, topic_id } => {
                let ack = ConnectionRequestAck {
                    id: task_id.clone(),
                    from: self.config.node_id.clone(),
                    to: request.to_local_part.clone(),
                    error: outcome.reason().map(str::to_string),
                };
                let Some(publisher) = &self.publisher else {
                    debug!("No publisher configured, dropping acknowledgement");
                    return;
                };
                if let Err(e) = publish_json(publisher.as_ref(), topic_id, &ack).await {
                    warn!(error = %e, topic = %topic_id, "Failed to publish connection request ack");
                }
            }
            RequestOrigin::Client => {
                let reply = outcome.client_reply(request);
                let requester = self.lock().targets(&request.from_jid);
                match requester.first() {
                    Some((_, mailbox)) => {
                        mailbox.deliver_raw(reply);
                    }
                    None => {
                        debug!(from = %request.from_jid, "Requester offline, dropping outcome");
                    }
                }
            }
        }
    }

    async fn save_online(&self, key: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.connect().await {
            warn!(error = %e, "Status store unavailable");
            return;
        }
        match store.exists_key(key).await {
            Ok(count) if count <= 0 => {
                if let Err(e) = store.set_data(key, &self.config.node_id, None).await {
                    warn!(error = %e, key = %key, "Failed to record online status");
                }
            }
            Ok(_) => debug!(key = %key, "Online status already recorded"),
            Err(e) => warn!(error = %e, key = %key, "Failed to read online status"),
        }
    }

    async fn save_offline(&self, key: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.del_data(key).await {
            warn!(error = %e, key = %key, "Failed to clear online status");
        }
    }

    async fn publish_status(&self, endpoint_id: &str, status: ConnectionStatus) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let event = ConnectionStatusEvent {
            endpoint_id: endpoint_id.to_string(),
            connection_status: status,
        };
        if let Err(e) = publish_json(publisher.as_ref(), &self.config.status_topic, &event).await {
            warn!(error = %e, endpoint_id = %endpoint_id, "Failed to publish connection status");
        }
    }
}

fn outcome_of(result: bool) -> WakeOutcome {
    if result {
        WakeOutcome::Success
    } else {
        WakeOutcome::Busy
    }
}

/// Consume one input stream until it closes or `shutdown` fires.
async fn run_routine<T, F, Fut>(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<T>,
    shutdown: CancellationToken,
    mut handle: F,
) where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    info!(routine = name, "Registry routine started");
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        handle(item).await;
    }
    debug!(routine = name, "Registry routine stopped");
}

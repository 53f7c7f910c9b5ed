//! Message-bus boundary.
//!
//! Outbound, the registry publishes JSON connection-status events and
//! connection-request acknowledgements. Inbound, deliveries carrying a
//! `method: connreq` header are translated into wake requests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::connreq::{ConnectionRequest, RequestOrigin};

mod amqp;

pub use amqp::{spawn_amqp_consumer, AmqpConsumerConfig, AmqpPublisher};

/// Header naming the requested operation.
pub const HEADER_METHOD: &str = "method";
/// Header carrying the target endpoint id.
pub const HEADER_ENDPOINT_ID: &str = "endPointID";
/// Header carrying the task id.
pub const HEADER_TASK_ID: &str = "taskId";
/// Header carrying the acknowledgement topic.
pub const HEADER_TOPIC_ID: &str = "topicId";
/// `method` value for connection requests.
pub const METHOD_CONNREQ: &str = "connreq";

/// Error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Endpoint connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Published when an endpoint binds or disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusEvent {
    pub endpoint_id: String,
    pub connection_status: ConnectionStatus,
}

/// Published when a bus-originated connection request resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequestAck {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Publishing side of the bus.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    publisher: &dyn StatusPublisher,
    topic: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(value)?;
    publisher.publish(topic, payload).await
}

/// A message consumed from the bus.
#[derive(Debug, Clone, Default)]
pub struct BusDelivery {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl BusDelivery {
    /// Build a delivery from header pairs.
    pub fn with_headers<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    fn header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or_default()
    }
}

/// Identity used for wake requests that arrive over the bus.
#[derive(Clone)]
pub struct AdminIdentity {
    /// Admin local part, the `from` of bus-originated wake IQs
    pub name: String,
    /// Shared secret, also the connection-request password
    pub password: String,
    /// Resource used on both sides of bus-originated wake IQs
    pub resource: String,
}

impl std::fmt::Debug for AdminIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminIdentity")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl Default for AdminIdentity {
    fn default() -> Self {
        Self {
            name: "admin".to_string(),
            password: String::new(),
            resource: "roost".to_string(),
        }
    }
}

/// Translate a `connreq` delivery into a wake request.
///
/// Deliveries with any other method, or without an endpoint id, yield `None`.
pub fn wake_request_from_delivery(
    delivery: &BusDelivery,
    domain: &str,
    admin: &AdminIdentity,
) -> Option<ConnectionRequest> {
    if delivery.header(HEADER_METHOD) != METHOD_CONNREQ {
        debug!(method = %delivery.header(HEADER_METHOD), "Ignoring bus delivery");
        return None;
    }

    let endpoint_id = delivery.header(HEADER_ENDPOINT_ID);
    if endpoint_id.is_empty() {
        warn!("connreq delivery without endPointID");
        return None;
    }

    let to_jid = format!("{}@{}/{}", endpoint_id, domain, admin.resource);
    let from_jid = format!("{}@{}/{}", admin.name, domain, admin.resource);
    let (Ok(to_jid), Ok(from_jid)) = (to_jid.parse(), from_jid.parse()) else {
        warn!(endpoint_id = %endpoint_id, "connreq delivery with an invalid JID");
        return None;
    };

    let task_id = delivery.header(HEADER_TASK_ID);
    let origin = if task_id.is_empty() {
        RequestOrigin::Client
    } else {
        RequestOrigin::Bus {
            task_id: task_id.to_string(),
            topic_id: delivery.header(HEADER_TOPIC_ID).to_string(),
        }
    };

    Some(ConnectionRequest {
        origin,
        from_jid,
        to_jid,
        to_local_part: endpoint_id.to_string(),
        username: admin.name.clone(),
        password: admin.password.clone(),
    })
}

/// A message published on the [`LocalBus`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// In-process bus for single-node deployments and tests.
///
/// Published messages are broadcast to subscribers; deliveries injected with
/// [`LocalBus::deliver`] are handed to the registry's consumer.
#[derive(Clone)]
pub struct LocalBus {
    published: broadcast::Sender<PublishedMessage>,
    inbound: mpsc::Sender<BusDelivery>,
}

impl LocalBus {
    /// Create a bus and the receiving end of its inbound deliveries.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BusDelivery>) {
        let (published, _) = broadcast::channel(capacity);
        let (inbound, rx) = mpsc::channel(capacity);
        (Self { published, inbound }, rx)
    }

    /// Observe published messages.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.published.subscribe()
    }

    /// Inject an inbound delivery.
    pub async fn deliver(&self, delivery: BusDelivery) -> Result<(), BusError> {
        self.inbound
            .send(delivery)
            .await
            .map_err(|_| BusError::Unavailable("consumer stopped".to_string()))
    }
}

#[async_trait]
impl StatusPublisher for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        debug!(
            topic = %topic,
            payload = %String::from_utf8_lossy(&payload),
            "Publishing to local bus"
        );
        // No subscribers is not an error.
        let _ = self.published.send(PublishedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

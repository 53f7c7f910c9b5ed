//! Status store and message bus selection.

use std::sync::Arc;

use anyhow::Result;
use roost_xmpp::{
    spawn_amqp_consumer, AmqpPublisher, BusDelivery, InMemoryStatusStore, LocalBus,
    RedisStatusStore, StatusPublisher, StatusStore,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BusBackend, StoreBackend};

/// Inbound bus deliveries buffered before the consumer applies backpressure.
const BUS_CAPACITY: usize = 1024;

/// The bus as seen by the registry.
pub struct Bus {
    pub publisher: Arc<dyn StatusPublisher>,
    pub deliveries: mpsc::Receiver<BusDelivery>,
    /// Task feeding `deliveries` from the broker, if any.
    pub feeder: Option<JoinHandle<()>>,
}

pub async fn open_store(backend: &StoreBackend) -> Result<Arc<dyn StatusStore>> {
    let store: Arc<dyn StatusStore> = match backend {
        StoreBackend::Memory => Arc::new(InMemoryStatusStore::new()),
        StoreBackend::Redis(url) => Arc::new(
            RedisStatusStore::open(url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open Redis status store: {}", e))?,
        ),
        StoreBackend::RedisCluster(nodes) => Arc::new(
            RedisStatusStore::open_cluster(nodes)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open Redis cluster status store: {}", e))?,
        ),
    };
    Ok(store)
}

pub fn open_bus(backend: &BusBackend, shutdown: CancellationToken) -> Bus {
    match backend {
        BusBackend::Local => {
            let (bus, deliveries) = LocalBus::new(BUS_CAPACITY);
            Bus {
                publisher: Arc::new(bus),
                deliveries,
                feeder: None,
            }
        }
        BusBackend::Amqp { url, consumer } => {
            let (tx, deliveries) = mpsc::channel(BUS_CAPACITY);
            let feeder = spawn_amqp_consumer(consumer.clone(), tx, shutdown);
            info!(queue = %consumer.queue, "AMQP bus enabled");
            Bus {
                publisher: Arc::new(AmqpPublisher::new(url.clone())),
                deliveries,
                feeder: Some(feeder),
            }
        }
    }
}

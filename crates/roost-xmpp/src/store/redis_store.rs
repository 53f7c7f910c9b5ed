//! Redis-backed status store for clustered deployments.
//!
//! Every node mirrors its online endpoints into the same Redis (single
//! instance or cluster), so the management side can tell which node holds a
//! device's session.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{AsyncCommands, RedisError};
use tracing::{debug, info};

use super::{StatusStore, StoreError};

/// Status store over a Redis connection.
///
/// `C` is either a reconnecting single-instance [`ConnectionManager`] or a
/// [`ClusterConnection`]; both are cheap to clone per command.
#[derive(Clone)]
pub struct RedisStatusStore<C> {
    conn: C,
}

impl RedisStatusStore<ConnectionManager> {
    /// Connect to a single Redis instance, e.g. `redis://:password@host:6379/0`.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        info!("Connected to Redis");
        Ok(Self { conn })
    }
}

impl RedisStatusStore<ClusterConnection> {
    /// Connect to a Redis cluster through any of its seed nodes.
    pub async fn open_cluster(nodes: &[String]) -> Result<Self, StoreError> {
        if nodes.is_empty() {
            return Err(StoreError::Operation("no cluster nodes configured".to_string()));
        }
        let client = ClusterClient::new(nodes.to_vec()).map_err(store_error)?;
        let conn = client.get_async_connection().await.map_err(store_error)?;
        info!(nodes = nodes.len(), "Connected to Redis cluster");
        Ok(Self { conn })
    }
}

#[async_trait]
impl<C> StatusStore for RedisStatusStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn connect(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }

    async fn exists_key(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.exists(key).await.map_err(store_error)?;
        debug!(key = %key, count, "Redis EXISTS");
        Ok(count)
    }

    async fn set_data(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match ttl.filter(|t| !t.is_zero()) {
            Some(ttl) => {
                let seconds = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value, seconds)
                    .await
                    .map_err(store_error)?;
            }
            None => conn.set::<_, _, ()>(key, value).await.map_err(store_error)?,
        }
        debug!(key = %key, value = %value, "Redis SET");
        Ok(())
    }

    async fn del_data(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(store_error)?;
        debug!(key = %key, removed, "Redis DEL");
        Ok(())
    }
}

fn store_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Operation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        match RedisStatusStore::open("not a redis url").await {
            Err(StoreError::Operation(_)) => {}
            Err(other) => panic!("expected a configuration error, got {}", other),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[tokio::test]
    async fn test_cluster_requires_nodes() {
        assert!(matches!(
            RedisStatusStore::open_cluster(&[]).await,
            Err(StoreError::Operation(_))
        ));
    }
}

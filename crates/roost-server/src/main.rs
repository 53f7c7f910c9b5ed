use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use roost_xmpp::{AccountManager, XmppServer};

mod backends;
mod config;
mod telemetry;

use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider for rustls (required for STARTTLS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let server_config = ServerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load server configuration: {}", e))?;

    telemetry::init(server_config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Roost Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    server_config.log_config();

    let shutdown = CancellationToken::new();

    let store = backends::open_store(&server_config.store).await?;
    let bus = backends::open_bus(&server_config.bus, shutdown.clone());
    let accounts = Arc::new(
        AccountManager::new(server_config.account_config())
            .with_store(store)
            .with_publisher(bus.publisher),
    );

    let registry_bus = accounts.start(shutdown.clone());
    let consumer =
        accounts.spawn_bus_consumer(bus.deliveries, registry_bus.clone(), shutdown.clone());

    let server = XmppServer::bind(
        server_config.xmpp_config(),
        Arc::clone(&accounts),
        registry_bus,
        shutdown.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to start XMPP server: {}", e))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let result = server.run().await;
    shutdown.cancel();
    if let Err(e) = consumer.await {
        warn!(error = %e, "Bus consumer task failed");
    }
    if let Some(feeder) = bus.feeder {
        if let Err(e) = feeder.await {
            warn!(error = %e, "AMQP consumer task failed");
        }
    }

    telemetry::shutdown();
    result.map_err(|e| anyhow::anyhow!("XMPP server error: {}", e))
}

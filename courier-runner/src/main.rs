use std::sync::Arc;

use anyhow::Result;
use courier_core::{Config, CourierContext};
use courier_delivery::SenderRegistry;
use courier_queue::{QueuePoller, QueueProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting notification courier");

    let config = Config::from_env();
    let ctx = CourierContext::new(config).await?;
    let store = ctx.store();

    tracing::info!("Courier context initialized");

    let senders = SenderRegistry::from_config(&ctx.config.delivery, store.clone())?;
    let processor = Arc::new(QueueProcessor::from_store(store.clone(), senders, &ctx.config.queue));
    let poller = QueuePoller::new(processor, store, ctx.config.queue.clone());

    poller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    Ok(())
}

//! Mesh Processor
//!
//! Subscribes to the configured mesh endpoints, keeps node state in the keyed
//! store and posts consolidated text messages to Telegram.

use anyhow::{Context, Result};
use mesh_processor::adapter::{spawn_adapters, AdapterExit};
use mesh_processor::formatter::FormatOptions;
use mesh_processor::{
    CorrelationWindow, LogSink, MeshtasticDecoder, NotificationSink, Notifier, PacketDecoder,
    Pipeline, StateAggregator, TelegramSink,
};
use mesh_shared::{Config, KeyedStore, MemoryStore, RedisStore, StoreBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Time given to the notifier to deliver flushed groups on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    mesh_shared::init_tracing();

    tracing::info!("Starting Mesh Processor...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    let store: Arc<dyn KeyedStore> = match config.store {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis.connection_url())
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Connected to Redis");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, node state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let sink: Arc<dyn NotificationSink> = match TelegramSink::from_config(&config.telegram)
        .context("Failed to configure Telegram sink")?
    {
        Some(sink) => {
            tracing::info!("Telegram notifications enabled");
            Arc::new(sink)
        }
        None => {
            tracing::info!("Telegram disabled or not configured, notifications are logged");
            Arc::new(LogSink)
        }
    };

    let (window, groups) = CorrelationWindow::new(config.correlation, &config.endpoints);

    let notifier = Notifier::new(
        Arc::clone(&store),
        sink,
        FormatOptions {
            bot_username: config.telegram.bot_username.clone(),
        },
    );
    let notifier_handle = tokio::spawn(notifier.run(groups));

    let pipeline = Arc::new(Pipeline::new(
        config.classifier,
        StateAggregator::new(Arc::clone(&store), config.series_max_len),
        window.clone(),
    ));

    // Start one adapter per endpoint
    let cancel = CancellationToken::new();
    let decoder: Arc<dyn PacketDecoder> = Arc::new(MeshtasticDecoder::new());
    let (tx, rx) = mpsc::channel(config.adapter.channel_capacity.max(1));

    let adapters = spawn_adapters(&config.endpoints, &config.adapter, decoder, tx, &cancel);
    tracing::info!(endpoints = adapters.len(), "Source adapters started");

    let mut pipeline_handle = tokio::spawn(pipeline.run(rx));

    // Wait for either shutdown signal OR every adapter giving up
    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received, stopping Mesh Processor...");
        }
        result = &mut pipeline_handle => {
            if let Err(e) = result {
                tracing::error!("Pipeline task panicked: {}", e);
                anyhow::bail!("Pipeline task panicked: {}", e);
            }
            tracing::warn!("All source adapters stopped, shutting down");
        }
    }

    cancel.cancel();
    for adapter in adapters {
        match adapter.await {
            Ok(AdapterExit::RetriesExhausted) => {
                tracing::warn!("Adapter had exhausted its reconnection attempts");
            }
            Ok(AdapterExit::Cancelled) => {}
            Err(e) => tracing::error!("Adapter task panicked: {}", e),
        }
    }

    if !pipeline_handle.is_finished() {
        let _ = pipeline_handle.await;
    }

    // Emit groups still waiting for their timer
    window.flush();
    drop(window);

    if tokio::time::timeout(SHUTDOWN_GRACE, notifier_handle)
        .await
        .is_err()
    {
        tracing::warn!("Notifier did not finish within the shutdown grace period");
    }

    tracing::info!("Mesh Processor stopped");

    Ok(())
}

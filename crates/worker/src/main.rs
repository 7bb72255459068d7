//! Composition root for the idea processing worker.
//!
//! Wires the stores, queue, AI clients and event publisher into the
//! Dispatcher and Clustering Coordinator, then runs the intake loop with
//! graceful shutdown. Horizontal scaling is a matter of running more
//! worker processes against the shared queue and lock service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use idearoom_core::config::AppConfig;
use idearoom_core::embedder::HttpEmbeddingClient;
use idearoom_core::events::{NatsEventPublisher, connect_with_retry};
use idearoom_core::formatter::HttpFormattingClient;
use idearoom_core::queue::ValkeyQueue;
use idearoom_core::stores::postgres::{self, PgDiscussionStore, PgIdeaStore, PgTopicStore};
use idearoom_core::summarizer::LlmSummarizer;
use idearoom_worker::coordinator::ClusteringCoordinator;
use idearoom_worker::dispatcher::Dispatcher;
use idearoom_worker::embedding::ParallelEmbeddingProcessor;
use idearoom_worker::{admin, logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    logging::init(&config.observability)?;
    info!(service = %config.observability.service_name, "Starting worker");

    let pool = postgres::connect(&config.database).await?;
    let idea_store = Arc::new(PgIdeaStore::new(pool.clone()));
    let topic_store = Arc::new(PgTopicStore::new(pool.clone()));
    let discussion_store = Arc::new(PgDiscussionStore::new(pool));

    let queue = Arc::new(ValkeyQueue::connect(config.valkey.clone()).await?);

    let nats_client = connect_with_retry(&config.nats.url).await?;
    let events = Arc::new(NatsEventPublisher::new(nats_client));

    let embedder = Arc::new(HttpEmbeddingClient::new(config.embedding.clone()));
    let formatter = Arc::new(HttpFormattingClient::new(config.enrichment.clone()));
    let summarizer = Arc::new(LlmSummarizer::new(config.enrichment.clone()));

    let processor = Arc::new(ParallelEmbeddingProcessor::new(
        idea_store.clone(),
        formatter,
        embedder,
        config.embedding.max_concurrent,
    ));

    let coordinator = Arc::new(ClusteringCoordinator::new(
        idea_store.clone(),
        topic_store,
        discussion_store.clone(),
        queue.clone(),
        summarizer,
        events,
        config.clustering.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        queue,
        idea_store.clone(),
        discussion_store,
        processor,
        coordinator,
        config.dispatcher.clone(),
    ));

    let watchdog_shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn(admin::run_stuck_watchdog(
        idea_store,
        config.dispatcher.stuck_after,
        config.dispatcher.cleanup_interval,
        watchdog_shutdown.clone(),
    ));
    tokio::spawn(Arc::clone(&dispatcher).run_cleanup_loop());
    tokio::spawn(Arc::clone(&dispatcher).run_throttle_loop());

    tokio::select! {
        result = Arc::clone(&dispatcher).run() => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
            dispatcher.shutdown();
            watchdog_shutdown.store(true, Ordering::SeqCst);

            while dispatcher.in_flight() > 0 {
                info!(remaining = dispatcher.in_flight(), "Waiting for in-flight batches");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            info!("Graceful shutdown complete");
            Ok(())
        }
    }
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

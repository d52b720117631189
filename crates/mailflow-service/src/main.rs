//! Email delivery worker service.
//!
//! Composition root: loads configuration, declares the queue topology on the
//! broker, selects the delivery transport, and runs a pool of delivery
//! workers until a shutdown signal arrives.

use anyhow::Context;
use mailflow_core::routing::QueueRouter;
use mailflow_core::transport::{HttpApiTransport, LogTransport, Transport};
use mailflow_core::worker::{DeliveryWorker, WorkerPool};
use mailflow_core::PipelineMetrics;
use mailflow_runtime::{BrokerClient, InMemoryBroker, SystemClock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use crate::config::{ServiceConfig, TransportKind};

/// How often queue depths are sampled into the gauge
const DEPTH_SAMPLE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::load().context("failed to load configuration")?;
    let topology = config.queues.topology()?;

    info!(
        concurrency = config.worker.concurrency,
        transport = ?config.transport.kind,
        primary = %topology.primary,
        "starting mailflow service"
    );

    let broker = Arc::new(InMemoryBroker::new(topology.broker_config()));
    let router = Arc::new(QueueRouter::new(broker.clone(), topology.clone()));
    let metrics = Arc::new(PipelineMetrics::new().context("failed to register metrics")?);

    let http = reqwest::Client::new();
    let transport: Arc<dyn Transport> = match config.transport.kind {
        TransportKind::Log => Arc::new(LogTransport),
        TransportKind::Http => {
            let base_url = config
                .transport
                .base_url
                .clone()
                .context("transport.base_url missing for http transport")?;
            Arc::new(HttpApiTransport::new(
                http.clone(),
                base_url,
                config.transport.api_token.clone(),
            ))
        }
    };

    let worker = Arc::new(DeliveryWorker::with_clock(
        broker.clone(),
        router,
        transport,
        metrics.clone(),
        Arc::new(SystemClock),
        chrono::Duration::seconds(config.worker.receive_timeout_secs as i64),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::spawn(worker, config.worker.concurrency, shutdown_rx.clone());

    let sampler = tokio::spawn(sample_queue_depths(
        broker,
        topology,
        metrics,
        shutdown_rx,
    ));

    info!("mailflow service started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining workers");

    if shutdown_tx.send(true).is_err() {
        warn!("all workers already stopped");
    }

    pool.join().await;
    let _ = sampler.await;

    info!("mailflow service stopped");
    Ok(())
}

/// Periodically record queue depths into the metrics gauge
async fn sample_queue_depths(
    broker: Arc<InMemoryBroker>,
    topology: mailflow_core::routing::QueueTopology,
    metrics: Arc<PipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queues = [topology.primary, topology.retry, topology.dead_letter];
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(DEPTH_SAMPLE_SECS));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                for queue in &queues {
                    match broker.queue_depth(queue).await {
                        Ok(depth) => {
                            metrics
                                .queue_depth
                                .with_label_values(&[queue.as_str()])
                                .set(depth as i64);
                        }
                        Err(e) => error!(queue = %queue, error = %e, "queue depth sample failed"),
                    }
                }
            }
        }
    }
}

//! Rollouts service controller (development binary)
//!
//! Runs the full reconciliation loop against the in-memory store. An optional
//! JSON fixture path can be passed as the first argument to seed the store:
//!
//! ```text
//! {"services": [...], "rollouts": [...]}
//! ```
//!
//! ## Architecture
//!
//! - **Event Translator**: applies watch events to the cache and enqueues Services
//! - **Service Controller**: workers draining the service queue, plus periodic resync
//! - **Rollout Queue**: drained by a logging consumer standing in for the rollout pipeline
//! - **Store**: in-memory; patches re-enter the watch stream

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rollouts_reconcile::{default_controller_limiter, WorkQueue};
use rollouts_service_controller::{
    Config, ControllerConfig, ControllerMetrics, EventTranslator, InMemoryStore, LocalCache,
    ObjectKey, Rollout, Service, ServiceController,
};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    services: Vec<Service>,
    #[serde(default)]
    rollouts: Vec<Rollout>,
}

fn load_fixture(path: &Path) -> Result<Fixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse fixture {}", path.display()))
}

fn queue(name: &str, config: &Config) -> Arc<WorkQueue<ObjectKey>> {
    Arc::new(WorkQueue::new(
        name,
        default_controller_limiter(config.backoff_policy(), config.queue_qps, config.queue_burst),
    ))
}

async fn drain_rollout_queue(queue: Arc<WorkQueue<ObjectKey>>) {
    while let Some(key) = queue.get().await {
        info!(rollout = %key.object, "Rollout requires reconciliation");
        queue.forget(&key);
        queue.done(&key);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        service_threads = config.service_threads,
        instance_id = ?config.instance_id,
        resync_secs = config.resync_period_secs,
        "Starting rollouts service controller"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(LocalCache::new());
    let service_queue = queue("services", &config);
    let rollout_queue = queue("rollouts", &config);

    // Subscribe before seeding so the fixture flows through the translator.
    let events = store.subscribe();
    let translator = EventTranslator::new(
        Arc::clone(&cache),
        Arc::clone(&service_queue),
        config.instance_id.clone(),
    );
    let translator_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { translator.run_event_loop(events, shutdown_rx).await }
    });

    if let Some(path) = std::env::args_os().nth(1) {
        let fixture = load_fixture(Path::new(&path))?;
        info!(
            services = fixture.services.len(),
            rollouts = fixture.rollouts.len(),
            "Seeding store"
        );
        for rollout in fixture.rollouts {
            store.apply_rollout(rollout);
        }
        for service in fixture.services {
            store.apply_service(service);
        }
    }

    let controller = Arc::new(ServiceController::new(ControllerConfig {
        cache,
        store,
        service_queue: Arc::clone(&service_queue),
        rollout_queue: Arc::clone(&rollout_queue),
        resync_period: config.resync_period(),
        metrics: Arc::new(ControllerMetrics::new()),
    }));
    let controller_handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        let threads = config.service_threads;
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(threads, shutdown_rx).await }
    });

    let rollout_handle = tokio::spawn(drain_rollout_queue(Arc::clone(&rollout_queue)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown; the controller stops its own queue.
    let _ = shutdown_tx.send(true);
    rollout_queue.shut_down();

    for (name, handle) in [
        ("event translator", translator_handle),
        ("service controller", controller_handle),
        ("rollout consumer", rollout_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task panicked");
        }
    }

    info!("Service controller shutdown complete");
    Ok(())
}

//! Service reconciliation.
//!
//! A Service carrying the traffic-selector label must be claimed by some
//! Rollout. When no Rollout in scope references it, and no Rollout named by
//! its managed-by annotation exists outside scope, the selector (and the
//! annotation) are removed so the Service stops pinning traffic to a revision
//! nobody manages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollouts_reconcile::{Reconciler, WorkQueue, WorkerObserver, WorkerPool};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace};

use crate::cache::CacheStore;
use crate::error::{ControllerError, ControllerResult};
use crate::events::enqueue_all_services;
use crate::metrics::ControllerMetrics;
use crate::model::{Kind, Object, ObjectKey, ObjectRef, Service};
use crate::patch::{generate_remove_patch, JsonPatch};
use crate::store::{StoreClient, StoreError};

/// Collaborators injected into the controller.
pub struct ControllerConfig {
    pub cache: Arc<dyn CacheStore>,
    pub store: Arc<dyn StoreClient>,
    pub service_queue: Arc<WorkQueue<ObjectKey>>,

    /// Queue owned by the rollout pipeline; referencing Rollouts are pushed here.
    pub rollout_queue: Arc<WorkQueue<ObjectKey>>,

    /// Interval for re-enqueueing every cached Service. Zero disables resync.
    pub resync_period: Duration,

    pub metrics: Arc<ControllerMetrics>,
}

/// What a single sync decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Service is not in the cache.
    Deleted,

    /// No referencing Rollout and no traffic selector.
    Clean,

    /// Referenced by Rollouts in scope; they were enqueued.
    Owned { rollouts: usize },

    /// The managed-by Rollout exists outside this controller's scope.
    ScopedOwner { rollout: ObjectRef },

    /// Orphaned selector removed with this patch.
    Patched(JsonPatch),

    /// Service disappeared before the patch landed.
    Vanished,

    /// Patch targeted a field that was already gone.
    AlreadyClean,
}

/// Reconciles Services against the Rollouts that reference them.
pub struct ServiceController {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn StoreClient>,
    service_queue: Arc<WorkQueue<ObjectKey>>,
    rollout_queue: Arc<WorkQueue<ObjectKey>>,
    resync_period: Duration,
    metrics: Arc<ControllerMetrics>,
}

impl ServiceController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            cache: config.cache,
            store: config.store,
            service_queue: config.service_queue,
            rollout_queue: config.rollout_queue,
            resync_period: config.resync_period,
            metrics: config.metrics,
        }
    }

    pub fn service_queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.service_queue
    }

    /// Reconcile one Service.
    #[instrument(skip_all, fields(service = %object))]
    pub async fn sync_service(&self, object: &ObjectRef) -> ControllerResult<SyncAction> {
        let Some(cached) = self.cache.get(Kind::Service, object)? else {
            debug!("Service has been deleted");
            return Ok(SyncAction::Deleted);
        };
        let Object::Service(service) = &cached else {
            return Err(ControllerError::UnsupportedKind {
                kind: cached.kind(),
                operation: "selector patch",
            });
        };

        let rollouts = self.cache.rollouts_by_service(object)?;
        for rollout in &rollouts {
            let key = ObjectKey::rollout(rollout.object_ref());
            trace!(rollout = %key.object, "Enqueueing referencing rollout");
            self.rollout_queue.add_rate_limited(key);
        }

        if !rollouts.is_empty() {
            return Ok(SyncAction::Owned {
                rollouts: rollouts.len(),
            });
        }

        let Some(hash) = service.traffic_selector() else {
            return Ok(SyncAction::Clean);
        };

        // The cache only holds Rollouts in this instance's scope; ask the
        // store before treating an annotated Service as orphaned.
        if let Some(managed_by) = service.managed_by() {
            match owner_ref(service, managed_by) {
                Some(owner) => match self.store.get(Kind::Rollout, &owner).await {
                    Ok(_) => {
                        debug!(rollout = %owner, "Owning rollout exists outside controller scope");
                        return Ok(SyncAction::ScopedOwner { rollout: owner });
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(rollout = %owner, "Owning rollout not found");
                    }
                    Err(e) => return Err(e.into()),
                },
                None => {
                    debug!(managed_by, "Managed-by names a rollout in another namespace");
                }
            }
        }

        let patch = generate_remove_patch(service);
        match self.store.patch(Kind::Service, object, &patch).await {
            Ok(_) => {
                self.metrics.record_patch(&patch);
                info!(hash, patch = %patch, "Removed orphaned traffic selector");
                Ok(SyncAction::Patched(patch))
            }
            Err(e) if e.is_not_found() => {
                debug!("Service deleted before patch");
                Ok(SyncAction::Vanished)
            }
            Err(StoreError::PathNotFound { path, .. }) => {
                debug!(path = %path, "Patched field already absent");
                Ok(SyncAction::AlreadyClean)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Enqueue every cached Service. Returns the number enqueued.
    pub fn resync(&self) -> usize {
        enqueue_all_services(&*self.cache, &self.service_queue)
    }

    async fn resync_loop(&self, mut shutdown: watch::Receiver<bool>) {
        if self.resync_period.is_zero() {
            debug!("Periodic resync disabled");
            return;
        }

        let mut ticker = interval_at(Instant::now() + self.resync_period, self.resync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let enqueued = self.resync();
                    debug!(enqueued, "Periodic resync");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Run workers and periodic resync until shutdown is signaled.
    pub async fn run(self: &Arc<Self>, threadiness: usize, shutdown: watch::Receiver<bool>) {
        info!(
            threadiness,
            resync_secs = self.resync_period.as_secs(),
            "Starting service controller"
        );

        let resync = tokio::spawn({
            let controller = Arc::clone(self);
            let shutdown = shutdown.clone();
            async move { controller.resync_loop(shutdown).await }
        });

        let observer: Arc<dyn WorkerObserver<ObjectKey>> = self.metrics.clone();
        let pool = WorkerPool::new(Arc::clone(&self.service_queue), Arc::clone(self), observer);
        pool.run(threadiness, shutdown).await;

        if let Err(e) = resync.await {
            error!(error = %e, "Resync task failed");
        }

        info!("Service controller stopped");
    }
}

/// Rollout named by a managed-by annotation, always in the Service's
/// namespace. A `namespace/name` value naming another namespace resolves to
/// `None`: Rollouts only reference Services in their own namespace.
fn owner_ref(service: &Service, value: &str) -> Option<ObjectRef> {
    let namespace = service.metadata.namespace.as_str();
    match value.split_once('/') {
        Some((prefix, name)) if !prefix.is_empty() && !name.is_empty() => {
            (prefix == namespace).then(|| ObjectRef::new(prefix, name))
        }
        _ => Some(ObjectRef::new(namespace, value)),
    }
}

#[async_trait]
impl Reconciler<ObjectKey> for ServiceController {
    type Error = ControllerError;

    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        if key.kind != Kind::Service {
            return Err(ControllerError::UnsupportedKind {
                kind: key.kind,
                operation: "service sync",
            });
        }
        self.sync_service(&key.object).await.map(|_| ())
    }
}

//! Watch event translation.
//!
//! The translator is the single writer of the [`LocalCache`]. It applies
//! watch notifications to the cache and turns Service notifications into
//! service queue entries. Rollout notifications only update the cache and
//! the reverse index; rollout-level reconciliation is driven by the service
//! controller when a Service it references is synced.

use std::sync::Arc;

use rollouts_reconcile::WorkQueue;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheStore, LocalCache};
use crate::model::{ObjectKey, Rollout, Service};

/// A watch notification for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Updated(T),
    Deleted(T),
}

/// A watch notification for either watched kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Service(WatchEvent<Service>),
    Rollout(WatchEvent<Rollout>),
}

/// Applies watch events to the cache and enqueues Service keys.
pub struct EventTranslator {
    cache: Arc<LocalCache>,
    service_queue: Arc<WorkQueue<ObjectKey>>,

    /// Only Rollouts labeled with this instance id are cached.
    instance_id: Option<String>,
}

impl EventTranslator {
    pub fn new(
        cache: Arc<LocalCache>,
        service_queue: Arc<WorkQueue<ObjectKey>>,
        instance_id: Option<String>,
    ) -> Self {
        Self {
            cache,
            service_queue,
            instance_id,
        }
    }

    /// Apply a single event.
    pub fn handle(&self, event: StoreEvent) {
        match event {
            StoreEvent::Service(event) => self.handle_service_event(event),
            StoreEvent::Rollout(event) => self.handle_rollout_event(event),
        }
    }

    /// Every Service add, update, and delete is reconciled.
    pub fn handle_service_event(&self, event: WatchEvent<Service>) {
        let key = match event {
            WatchEvent::Added(svc) | WatchEvent::Updated(svc) => {
                let key = svc.object_ref();
                self.cache.upsert_service(svc);
                key
            }
            WatchEvent::Deleted(svc) => {
                let key = svc.object_ref();
                self.cache.remove_service(&key);
                key
            }
        };
        trace!(service = %key, "Enqueueing service");
        self.service_queue.add(ObjectKey::service(key));
    }

    /// Rollout events maintain the cache and reverse index only.
    pub fn handle_rollout_event(&self, event: WatchEvent<Rollout>) {
        match event {
            WatchEvent::Added(ro) | WatchEvent::Updated(ro) => {
                if self.in_scope(&ro) {
                    self.cache.upsert_rollout(ro);
                } else {
                    // Out of scope: forget it as if it were deleted.
                    let key = ro.object_ref();
                    if self.cache.remove_rollout(&key).is_some() {
                        debug!(
                            rollout = %key,
                            instance_id = ?ro.instance_id(),
                            "Rollout left controller scope"
                        );
                    }
                }
            }
            WatchEvent::Deleted(ro) => {
                self.cache.remove_rollout(&ro.object_ref());
            }
        }
    }

    fn in_scope(&self, rollout: &Rollout) -> bool {
        rollout.instance_id() == self.instance_id.as_deref()
    }

    /// Drain a watch stream into the cache until shutdown or stream close.
    pub async fn run_event_loop(
        &self,
        mut events: broadcast::Receiver<StoreEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(instance_id = ?self.instance_id, "Starting event translator");

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let enqueued = enqueue_all_services(&*self.cache, &self.service_queue);
                            warn!(missed, enqueued, "Watch stream lagged, resynced all services");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Watch stream closed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event translator shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Enqueue every cached Service. Returns the number enqueued.
pub fn enqueue_all_services(cache: &dyn CacheStore, queue: &WorkQueue<ObjectKey>) -> usize {
    let services = cache.list_services();
    let count = services.len();
    for service in services {
        queue.add(ObjectKey::service(service));
    }
    count
}

//! In-memory object store.
//!
//! Implements [`StoreClient`] over plain maps and publishes every write as a
//! [`StoreEvent`] on a broadcast channel, so patches made by the controller
//! flow back through the event translator the same way cluster writes would.
//! Events are published while the write lock is held, so the stream carries
//! writes to one kind in the order they were applied.
//! Used by the development binary and by tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::events::{StoreEvent, WatchEvent};
use crate::model::{Kind, Object, ObjectRef, Rollout, Service};
use crate::patch::{JsonPatch, PatchOperation, PatchTarget};
use crate::store::{StoreClient, StoreError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Store backed by in-process maps.
pub struct InMemoryStore {
    services: RwLock<BTreeMap<ObjectRef, Service>>,
    rollouts: RwLock<BTreeMap<ObjectRef, Rollout>>,
    events: broadcast::Sender<StoreEvent>,
    resource_version: AtomicU64,

    /// Errors returned by upcoming `patch` calls, in order.
    patch_failures: Mutex<VecDeque<StoreError>>,

    /// Errors returned by upcoming `get` calls, in order.
    get_failures: Mutex<VecDeque<StoreError>>,

    patch_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            services: RwLock::new(BTreeMap::new()),
            rollouts: RwLock::new(BTreeMap::new()),
            events,
            resource_version: AtomicU64::new(0),
            patch_failures: Mutex::new(VecDeque::new()),
            get_failures: Mutex::new(VecDeque::new()),
            patch_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    /// Subscribe to the watch stream. Only writes after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn next_resource_version(&self) -> u64 {
        self.resource_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine; nothing is watching yet.
        if self.events.send(event).is_err() {
            trace!("No watch subscribers");
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Create or replace a Service.
    pub fn apply_service(&self, mut service: Service) -> Service {
        let mut services = self.services.write();
        service.metadata.resource_version = self.next_resource_version();
        let previous = services.insert(service.object_ref(), service.clone());
        self.publish(StoreEvent::Service(match previous {
            Some(_) => WatchEvent::Updated(service.clone()),
            None => WatchEvent::Added(service.clone()),
        }));
        service
    }

    /// Delete a Service. Returns the deleted object.
    pub fn delete_service(&self, object: &ObjectRef) -> Option<Service> {
        let mut services = self.services.write();
        let removed = services.remove(object);
        if let Some(service) = &removed {
            self.publish(StoreEvent::Service(WatchEvent::Deleted(service.clone())));
        }
        removed
    }

    /// Create or replace a Rollout.
    pub fn apply_rollout(&self, mut rollout: Rollout) -> Rollout {
        let mut rollouts = self.rollouts.write();
        rollout.metadata.resource_version = self.next_resource_version();
        let previous = rollouts.insert(rollout.object_ref(), rollout.clone());
        self.publish(StoreEvent::Rollout(match previous {
            Some(_) => WatchEvent::Updated(rollout.clone()),
            None => WatchEvent::Added(rollout.clone()),
        }));
        rollout
    }

    /// Delete a Rollout. Returns the deleted object.
    pub fn delete_rollout(&self, object: &ObjectRef) -> Option<Rollout> {
        let mut rollouts = self.rollouts.write();
        let removed = rollouts.remove(object);
        if let Some(rollout) = &removed {
            self.publish(StoreEvent::Rollout(WatchEvent::Deleted(rollout.clone())));
        }
        removed
    }

    // =========================================================================
    // Fault injection and inspection
    // =========================================================================

    /// Fail the next `patch` calls with these errors, in order.
    pub fn fail_next_patches(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.patch_failures.lock().extend(errors);
    }

    /// Fail the next `get` calls with these errors, in order.
    pub fn fail_next_gets(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.get_failures.lock().extend(errors);
    }

    /// Patch calls that reached the store, including failed ones.
    pub fn patch_count(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn service(&self, object: &ObjectRef) -> Option<Service> {
        self.services.read().get(object).cloned()
    }

    fn patch_service(&self, object: &ObjectRef, patch: &JsonPatch) -> Result<Service, StoreError> {
        let mut services = self.services.write();
        let current = services.get(object).ok_or_else(|| StoreError::NotFound {
            kind: Kind::Service,
            object: object.clone(),
        })?;

        // Apply to a copy so a failing operation leaves the object untouched.
        let mut updated = current.clone();
        for op in patch.operations() {
            let PatchOperation::Remove { path } = op;
            let removed = match PatchTarget::parse(path) {
                Some(PatchTarget::SelectorLabel(key)) => updated.spec.selector.remove(key),
                Some(PatchTarget::Annotation(key)) => updated.metadata.annotations.remove(key),
                None => {
                    return Err(StoreError::InvalidPatch {
                        kind: Kind::Service,
                        object: object.clone(),
                        reason: format!("unsupported path {path}"),
                    })
                }
            };
            if removed.is_none() {
                return Err(StoreError::PathNotFound {
                    kind: Kind::Service,
                    object: object.clone(),
                    path: path.clone(),
                });
            }
        }

        updated.metadata.resource_version = self.next_resource_version();
        services.insert(object.clone(), updated.clone());
        debug!(service = %object, patch = %patch, "Patched service");
        self.publish(StoreEvent::Service(WatchEvent::Updated(updated.clone())));
        Ok(updated)
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn get(&self, kind: Kind, object: &ObjectRef) -> Result<Object, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.get_failures.lock().pop_front() {
            return Err(err);
        }

        let found = match kind {
            Kind::Service => self
                .services
                .read()
                .get(object)
                .map(|svc| Object::Service(Arc::new(svc.clone()))),
            Kind::Rollout => self
                .rollouts
                .read()
                .get(object)
                .map(|ro| Object::Rollout(Arc::new(ro.clone()))),
        };
        found.ok_or_else(|| StoreError::NotFound {
            kind,
            object: object.clone(),
        })
    }

    async fn patch(
        &self,
        kind: Kind,
        object: &ObjectRef,
        patch: &JsonPatch,
    ) -> Result<Object, StoreError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.patch_failures.lock().pop_front() {
            return Err(err);
        }

        match kind {
            Kind::Service => self
                .patch_service(object, patch)
                .map(|updated| Object::Service(Arc::new(updated))),
            Kind::Rollout => Err(StoreError::InvalidPatch {
                kind,
                object: object.clone(),
                reason: "rollouts have no patchable selector".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectMeta, DEFAULT_ROLLOUT_UNIQUE_LABEL_KEY, MANAGED_BY_ROLLOUTS_KEY};
    use crate::patch::generate_remove_patch;

    fn selected_service(name: &str) -> Service {
        let mut svc = Service {
            metadata: ObjectMeta {
                namespace: "team".to_string(),
                name: name.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        svc.spec
            .selector
            .insert(DEFAULT_ROLLOUT_UNIQUE_LABEL_KEY.to_string(), "abc123".to_string());
        svc.spec.selector.insert("app".to_string(), name.to_string());
        svc
    }

    #[tokio::test]
    async fn test_apply_emits_added_then_updated() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe();

        store.apply_service(selected_service("web"));
        store.apply_service(selected_service("web"));

        assert!(matches!(
            rx.recv().await.unwrap(),
            StoreEvent::Service(WatchEvent::Added(_))
        ));
        match rx.recv().await.unwrap() {
            StoreEvent::Service(WatchEvent::Updated(svc)) => {
                assert_eq!(svc.metadata.resource_version, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_patch_removes_fields_and_publishes() {
        let store = InMemoryStore::new();
        let mut svc = selected_service("web");
        svc.metadata
            .annotations
            .insert(MANAGED_BY_ROLLOUTS_KEY.to_string(), "canary-rollout".to_string());
        store.apply_service(svc.clone());
        let mut rx = store.subscribe();

        let key = svc.object_ref();
        let patched = store
            .patch(Kind::Service, &key, &generate_remove_patch(&svc))
            .await
            .unwrap();

        let Object::Service(patched) = patched else {
            panic!("expected a service");
        };
        assert_eq!(patched.traffic_selector(), None);
        assert!(!patched.has_managed_by_annotation());
        assert_eq!(patched.spec.selector.get("app").map(String::as_str), Some("web"));
        assert_eq!(store.service(&key).as_ref(), Some(&*patched));
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::Service(WatchEvent::Updated(Service::clone(&patched)))
        );
        assert_eq!(store.patch_count(), 1);
    }

    #[tokio::test]
    async fn test_patch_missing_path_is_atomic() {
        let store = InMemoryStore::new();
        let svc = selected_service("web");
        store.apply_service(svc.clone());

        // Annotation is absent, so the second operation fails.
        let patch = JsonPatch(vec![
            PatchOperation::Remove {
                path: crate::patch::selector_path(DEFAULT_ROLLOUT_UNIQUE_LABEL_KEY),
            },
            PatchOperation::Remove {
                path: crate::patch::annotation_path(MANAGED_BY_ROLLOUTS_KEY),
            },
        ]);
        let err = store
            .patch(Kind::Service, &svc.object_ref(), &patch)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::PathNotFound { .. }));
        assert_eq!(
            store.service(&svc.object_ref()).unwrap().traffic_selector(),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let store = InMemoryStore::new();
        let key = ObjectRef::new("team", "missing");

        let err = store.get(Kind::Rollout, &key).await.unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .patch(Kind::Service, &key, &generate_remove_patch(&selected_service("missing")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let store = InMemoryStore::new();
        let svc = selected_service("web");
        store.apply_service(svc.clone());
        store.fail_next_gets([StoreError::Unavailable("timeout".to_string())]);

        let err = store.get(Kind::Service, &svc.object_ref()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.get(Kind::Service, &svc.object_ref()).await.is_ok());
        assert_eq!(store.get_count(), 2);
    }

    #[test]
    fn test_delete_without_subscribers() {
        let store = InMemoryStore::new();
        let svc = store.apply_service(selected_service("web"));
        assert_eq!(store.delete_service(&svc.object_ref()), Some(svc));
        assert_eq!(store.delete_service(&ObjectRef::new("team", "web")), None);
    }

    #[test]
    fn test_concurrent_writes_publish_in_write_order() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe();

        std::thread::scope(|s| {
            for writer in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..50 {
                        let mut svc = selected_service("web");
                        svc.spec
                            .selector
                            .insert("writer".to_string(), format!("{writer}-{i}"));
                        store.apply_service(svc);
                    }
                });
            }
        });

        let mut last_version = 0;
        let mut last_seen = None;
        while let Ok(StoreEvent::Service(WatchEvent::Added(svc) | WatchEvent::Updated(svc))) =
            rx.try_recv()
        {
            assert!(svc.metadata.resource_version > last_version);
            last_version = svc.metadata.resource_version;
            last_seen = Some(svc);
        }

        assert_eq!(last_version, 200);
        assert_eq!(last_seen, store.service(&ObjectRef::new("team", "web")));
    }
}

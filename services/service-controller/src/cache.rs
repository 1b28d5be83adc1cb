//! Local cache of watched objects plus the Service → Rollout reverse index.
//!
//! The cache is written by a single path (the event translator) and read by
//! every reconciliation worker. Both maps and the index are `DashMap`s, so
//! readers only contend on the shard they touch and never wait for a whole
//! index rebuild.
//!
//! The reverse index is always derivable by scanning the cached Rollouts
//! ([`LocalCache::derive_index`]). It is maintained incrementally: each
//! Rollout write diffs the Rollout's previous referenced-service set against
//! the new one and touches only the affected buckets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::model::{Kind, Object, ObjectRef, Rollout, Service};

/// Errors from a cache provider.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The index could not be queried.
    #[error("index {index} unavailable: {reason}")]
    IndexUnavailable { index: &'static str, reason: String },
}

/// Read side of the local cache, injected into the controller.
pub trait CacheStore: Send + Sync {
    /// Get a cached object of the given kind.
    fn get(&self, kind: Kind, object: &ObjectRef) -> Result<Option<Object>, CacheError>;

    /// Cached Rollouts referencing the Service.
    fn rollouts_by_service(&self, service: &ObjectRef) -> Result<Vec<Arc<Rollout>>, CacheError>;

    /// Identities of every cached Service.
    fn list_services(&self) -> Vec<ObjectRef>;
}

/// Name of the reverse index, for errors and logs.
pub const SERVICE_INDEX_NAME: &str = "byService";

/// In-memory cache backed by concurrent maps.
#[derive(Default)]
pub struct LocalCache {
    services: DashMap<ObjectRef, Arc<Service>>,
    rollouts: DashMap<ObjectRef, Arc<Rollout>>,

    /// Rollout -> Services it referenced when last indexed.
    rollout_refs: DashMap<ObjectRef, BTreeSet<ObjectRef>>,

    /// Service -> Rollouts referencing it.
    by_service: DashMap<ObjectRef, BTreeSet<ObjectRef>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a Service.
    pub fn upsert_service(&self, service: Service) {
        let key = service.object_ref();
        trace!(service = %key, "Caching service");
        self.services.insert(key, Arc::new(service));
    }

    /// Remove a Service. Returns the removed object.
    pub fn remove_service(&self, object: &ObjectRef) -> Option<Arc<Service>> {
        self.services.remove(object).map(|(_, svc)| svc)
    }

    /// Insert or replace a Rollout and re-index its Service references.
    pub fn upsert_rollout(&self, rollout: Rollout) {
        let key = rollout.object_ref();
        let refs = rollout.referenced_services();

        self.rollouts.insert(key.clone(), Arc::new(rollout));

        let previous = self
            .rollout_refs
            .insert(key.clone(), refs.clone())
            .unwrap_or_default();

        for service in previous.difference(&refs) {
            self.unindex(service, &key);
        }
        for service in refs.difference(&previous) {
            self.by_service
                .entry(service.clone())
                .or_default()
                .insert(key.clone());
        }

        debug!(rollout = %key, services = refs.len(), "Indexed rollout");
    }

    /// Remove a Rollout and drop it from every index bucket.
    pub fn remove_rollout(&self, object: &ObjectRef) -> Option<Arc<Rollout>> {
        if let Some((_, refs)) = self.rollout_refs.remove(object) {
            for service in &refs {
                self.unindex(service, object);
            }
        }
        self.rollouts.remove(object).map(|(_, ro)| ro)
    }

    fn unindex(&self, service: &ObjectRef, rollout: &ObjectRef) {
        let now_empty = match self.by_service.get_mut(service) {
            Some(mut bucket) => {
                bucket.remove(rollout);
                bucket.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_service.remove_if(service, |_, bucket| bucket.is_empty());
        }
    }

    /// Rollout identities in the Service's index bucket.
    pub fn query_rollouts_by_service(&self, service: &ObjectRef) -> BTreeSet<ObjectRef> {
        self.by_service
            .get(service)
            .map(|bucket| bucket.value().clone())
            .unwrap_or_default()
    }

    /// Current incremental index.
    pub fn index_snapshot(&self) -> BTreeMap<ObjectRef, BTreeSet<ObjectRef>> {
        self.by_service
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Index rebuilt from scratch by scanning every cached Rollout.
    pub fn derive_index(&self) -> BTreeMap<ObjectRef, BTreeSet<ObjectRef>> {
        let mut index: BTreeMap<ObjectRef, BTreeSet<ObjectRef>> = BTreeMap::new();
        for entry in self.rollouts.iter() {
            for service in entry.value().referenced_services() {
                index.entry(service).or_default().insert(entry.key().clone());
            }
        }
        index
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn rollout_count(&self) -> usize {
        self.rollouts.len()
    }
}

impl CacheStore for LocalCache {
    fn get(&self, kind: Kind, object: &ObjectRef) -> Result<Option<Object>, CacheError> {
        let found = match kind {
            Kind::Service => self
                .services
                .get(object)
                .map(|svc| Object::Service(Arc::clone(svc.value()))),
            Kind::Rollout => self
                .rollouts
                .get(object)
                .map(|ro| Object::Rollout(Arc::clone(ro.value()))),
        };
        Ok(found)
    }

    fn rollouts_by_service(&self, service: &ObjectRef) -> Result<Vec<Arc<Rollout>>, CacheError> {
        let rollouts = self
            .query_rollouts_by_service(service)
            .into_iter()
            .filter_map(|key| match self.rollouts.get(&key) {
                Some(ro) => Some(Arc::clone(ro.value())),
                None => {
                    // Stale bucket entry: the Rollout left the cache mid-update.
                    debug!(service = %service, rollout = %key, "Skipping stale index entry");
                    None
                }
            })
            .collect();
        Ok(rollouts)
    }

    fn list_services(&self) -> Vec<ObjectRef> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }
}

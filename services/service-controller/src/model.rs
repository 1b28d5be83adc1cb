//! Watched object types.
//!
//! Only the fields the service controller reads are modeled. Field names
//! follow the wire (camelCase) form so fixtures can be written as JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Selector label pinning a Service to one rollout-managed revision.
pub const DEFAULT_ROLLOUT_UNIQUE_LABEL_KEY: &str = "rollouts-pod-template-hash";

/// Annotation naming the Rollout that claims a Service.
pub const MANAGED_BY_ROLLOUTS_KEY: &str = "argo-rollouts.argoproj.io/managed-by-rollouts";

/// Label scoping a Rollout to one controller instance.
pub const CONTROLLER_INSTANCE_ID_LABEL: &str = "argo-rollouts.argoproj.io/controller-instance-id";

/// Object kinds the controller watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Service,
    Rollout,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "Service",
            Self::Rollout => "Rollout",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespaced object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Work queue key: an object identity plus its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: Kind,
    pub object: ObjectRef,
}

impl ObjectKey {
    pub fn service(object: ObjectRef) -> Self {
        Self {
            kind: Kind::Service,
            object,
        }
    }

    pub fn rollout(object: ObjectRef) -> Self {
        Self {
            kind: Kind::Rollout,
            object,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.object)
    }
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Store version, bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl Service {
    pub fn object_ref(&self) -> ObjectRef {
        self.metadata.object_ref()
    }

    /// Revision hash the Service is pinned to, if any.
    pub fn traffic_selector(&self) -> Option<&str> {
        self.spec
            .selector
            .get(DEFAULT_ROLLOUT_UNIQUE_LABEL_KEY)
            .map(String::as_str)
    }

    /// Name of the Rollout claiming this Service, if annotated.
    pub fn managed_by(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(MANAGED_BY_ROLLOUTS_KEY)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn has_managed_by_annotation(&self) -> bool {
        self.metadata
            .annotations
            .contains_key(MANAGED_BY_ROLLOUTS_KEY)
    }
}

// =============================================================================
// Rollout
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollout {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RolloutSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutSpec {
    #[serde(default)]
    pub strategy: RolloutStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStrategy {
    pub active_service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_service: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<TrafficRouting>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRouting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alb: Option<AlbTrafficRouting>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbTrafficRouting {
    pub ingress: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_service: Option<String>,
}

impl Rollout {
    pub fn object_ref(&self) -> ObjectRef {
        self.metadata.object_ref()
    }

    /// Controller instance this Rollout is scoped to, if labeled.
    pub fn instance_id(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(CONTROLLER_INSTANCE_ID_LABEL)
            .map(String::as_str)
    }

    /// Services referenced by the strategy, in the Rollout's namespace.
    pub fn referenced_services(&self) -> BTreeSet<ObjectRef> {
        let strategy = &self.spec.strategy;
        let mut names: Vec<&str> = Vec::new();

        if let Some(blue_green) = &strategy.blue_green {
            names.push(&blue_green.active_service);
            names.extend(blue_green.preview_service.as_deref());
        } else if let Some(canary) = &strategy.canary {
            names.extend(canary.stable_service.as_deref());
            names.extend(canary.canary_service.as_deref());
            let root_service = canary
                .traffic_routing
                .as_ref()
                .and_then(|routing| routing.alb.as_ref())
                .and_then(|alb| alb.root_service.as_deref());
            names.extend(root_service);
        }

        names
            .into_iter()
            .filter(|name| !name.is_empty())
            .map(|name| ObjectRef::new(&self.metadata.namespace, name))
            .collect()
    }
}

// =============================================================================
// Object
// =============================================================================

/// An object resolved from the cache or the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Service(Arc<Service>),
    Rollout(Arc<Rollout>),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Service(_) => Kind::Service,
            Self::Rollout(_) => Kind::Rollout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollout(strategy: serde_json::Value) -> Rollout {
        serde_json::from_value(serde_json::json!({
            "metadata": {"namespace": "team", "name": "canary-rollout"},
            "spec": {"strategy": strategy},
        }))
        .unwrap()
    }

    fn names(refs: BTreeSet<ObjectRef>) -> Vec<String> {
        refs.into_iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_blue_green_references() {
        let ro = rollout(serde_json::json!({
            "blueGreen": {"activeService": "active", "previewService": "preview"}
        }));
        assert_eq!(names(ro.referenced_services()), ["team/active", "team/preview"]);
    }

    #[test]
    fn test_canary_references_include_alb_root() {
        let ro = rollout(serde_json::json!({
            "canary": {
                "stableService": "stable",
                "canaryService": "canary",
                "trafficRouting": {"alb": {"ingress": "ing", "rootService": "root"}}
            }
        }));
        assert_eq!(
            names(ro.referenced_services()),
            ["team/canary", "team/root", "team/stable"]
        );
    }

    #[test]
    fn test_empty_and_duplicate_names_collapse() {
        let ro = rollout(serde_json::json!({
            "canary": {"stableService": "web", "canaryService": "web"}
        }));
        assert_eq!(names(ro.referenced_services()), ["team/web"]);

        let ro = rollout(serde_json::json!({"blueGreen": {"activeService": ""}}));
        assert!(ro.referenced_services().is_empty());

        let ro = rollout(serde_json::json!({}));
        assert!(ro.referenced_services().is_empty());
    }

    #[test]
    fn test_service_selector_and_annotation() {
        let svc: Service = serde_json::from_value(serde_json::json!({
            "metadata": {
                "namespace": "team",
                "name": "web",
                "annotations": {"argo-rollouts.argoproj.io/managed-by-rollouts": "canary-rollout"}
            },
            "spec": {"selector": {"app": "web", "rollouts-pod-template-hash": "abc123"}}
        }))
        .unwrap();

        assert_eq!(svc.traffic_selector(), Some("abc123"));
        assert_eq!(svc.managed_by(), Some("canary-rollout"));
        assert_eq!(svc.object_ref().to_string(), "team/web");
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::service(ObjectRef::new("team", "web"));
        assert_eq!(key.to_string(), "Service:team/web");
        assert_eq!(ObjectRef::new("", "web").to_string(), "web");
    }
}

//! CRD document cleanup.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

const SCHEMA_POINTER: &str = "/spec/validation/openAPIV3Schema";
const KIND_POINTER: &str = "/spec/names/kind";
const NESTED_ITEMS_POINTER: &str = "/properties/items/items";

/// Fields newer API servers add that older ones reject.
const LIST_FIELDS: &[&str] = &["x-kubernetes-list-type", "x-kubernetes-list-map-keys"];

/// Custom resource kinds this tool knows how to clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CrdKind {
    Rollout,
    Experiment,
    AnalysisTemplate,
    AnalysisRun,
}

impl CrdKind {
    pub const ALL: [CrdKind; 4] = [
        CrdKind::Rollout,
        CrdKind::Experiment,
        CrdKind::AnalysisTemplate,
        CrdKind::AnalysisRun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rollout => "Rollout",
            Self::Experiment => "Experiment",
            Self::AnalysisTemplate => "AnalysisTemplate",
            Self::AnalysisRun => "AnalysisRun",
        }
    }

    /// Manifest path, relative to the repository root.
    pub fn manifest_path(&self) -> &'static str {
        match self {
            Self::Rollout => "manifests/crds/rollout-crd.yaml",
            Self::Experiment => "manifests/crds/experiment-crd.yaml",
            Self::AnalysisTemplate => "manifests/crds/analysis-template-crd.yaml",
            Self::AnalysisRun => "manifests/crds/analysis-run-crd.yaml",
        }
    }

    /// Schema fields removed for this kind.
    pub fn stripped_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Rollout => LIST_FIELDS,
            Self::Experiment => LIST_FIELDS,
            Self::AnalysisTemplate | Self::AnalysisRun => LIST_FIELDS,
        }
    }
}

impl fmt::Display for CrdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrdKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow!("unknown kind: {s}"))
    }
}

/// Split multi-document YAML on `\n---`, skipping empty documents.
pub fn split_documents(raw: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for (i, part) in raw.split("\n---").enumerate() {
        if part.trim().is_empty() {
            continue;
        }
        let doc: Value = serde_yaml::from_str(part)
            .with_context(|| format!("invalid YAML in document {i}"))?;
        let empty = match &doc {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => bail!("document {i} is not a mapping"),
        };
        if !empty {
            docs.push(doc);
        }
    }
    Ok(docs)
}

pub fn crd_kind(doc: &Value) -> Result<CrdKind> {
    doc.pointer(KIND_POINTER)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("kind not found"))?
        .parse()
}

/// Remove every property whose schema has a nested `items` field.
pub fn remove_nested_items(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    map.retain(|_, child| child.pointer(NESTED_ITEMS_POINTER).is_none());
    for child in map.values_mut() {
        remove_nested_items(child);
    }
}

/// Remove `field` from every mapping, recursively.
pub fn remove_field(value: &mut Value, field: &str) {
    let Value::Object(map) = value else {
        return;
    };
    map.remove(field);
    for child in map.values_mut() {
        remove_field(child, field);
    }
}

/// Clean one CRD document in place and return its kind.
pub fn process(doc: &mut Value) -> Result<CrdKind> {
    let kind = crd_kind(doc)?;

    if let Some(schema) = doc.pointer_mut(SCHEMA_POINTER) {
        remove_nested_items(schema);
        remove_field(schema, "description");
        for field in kind.stripped_fields() {
            remove_field(schema, field);
        }
    }

    let root = doc
        .as_object_mut()
        .ok_or_else(|| anyhow!("{kind} CRD is not a mapping"))?;
    root.remove("status");
    if let Some(Value::Object(metadata)) = root.get_mut("metadata") {
        metadata.remove("creationTimestamp");
    }
    match root.get_mut("spec") {
        Some(Value::Object(spec)) => {
            spec.insert("scope".to_string(), Value::String("Namespaced".to_string()));
        }
        _ => bail!("{kind} CRD has no spec"),
    }

    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CRDS: &str = r#"
apiVersion: apiextensions.k8s.io/v1beta1
kind: CustomResourceDefinition
metadata:
  name: rollouts.argoproj.io
  creationTimestamp: null
spec:
  scope: Cluster
  names:
    kind: Rollout
  validation:
    openAPIV3Schema:
      description: Rollout is a specification for a Rollout resource
      properties:
        spec:
          description: desired state
          properties:
            template:
              properties:
                items:
                  items:
                    type: string
            ports:
              type: array
              x-kubernetes-list-type: map
              x-kubernetes-list-map-keys:
                - containerPort
status:
  acceptedNames:
    kind: ""
---
---
apiVersion: apiextensions.k8s.io/v1beta1
kind: CustomResourceDefinition
metadata:
  name: experiments.argoproj.io
spec:
  names:
    kind: Experiment
"#;

    #[test]
    fn test_split_skips_empty_documents() {
        let docs = split_documents(CRDS).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(crd_kind(&docs[1]).unwrap(), CrdKind::Experiment);
    }

    #[test]
    fn test_process_cleans_rollout() {
        let mut doc = split_documents(CRDS).unwrap().remove(0);
        assert_eq!(process(&mut doc).unwrap(), CrdKind::Rollout);

        assert_eq!(
            doc.pointer(SCHEMA_POINTER).unwrap(),
            &json!({
                "properties": {
                    "spec": {
                        "properties": {
                            "ports": {"type": "array"}
                        }
                    }
                }
            })
        );
        assert_eq!(doc.pointer("/spec/scope"), Some(&json!("Namespaced")));
        assert!(doc.get("status").is_none());
        assert!(doc.pointer("/metadata/creationTimestamp").is_none());
        assert_eq!(doc.pointer("/metadata/name"), Some(&json!("rollouts.argoproj.io")));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut doc = json!({"spec": {"names": {"kind": "Widget"}}});
        let err = process(&mut doc).unwrap_err();
        assert!(err.to_string().contains("unknown kind: Widget"));

        let mut doc = json!({"spec": {}});
        assert!(process(&mut doc).is_err());
    }

    #[test]
    fn test_every_kind_has_a_manifest() {
        for kind in CrdKind::ALL {
            assert_eq!(kind.as_str().parse::<CrdKind>().unwrap(), kind);
            assert!(kind.manifest_path().starts_with("manifests/crds/"));
            assert_eq!(kind.stripped_fields(), LIST_FIELDS);
        }
    }
}

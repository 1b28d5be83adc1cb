//! Corrective patch generation.
//!
//! The only mutation the controller ever makes is removing the traffic
//! selector from an orphaned Service, plus the managed-by annotation when
//! present. The wire form is a JSON patch list of `remove` operations with
//! the keys inserted verbatim:
//!
//! ```text
//! [{"op":"remove","path":"/spec/selector/rollouts-pod-template-hash"}]
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Service, DEFAULT_ROLLOUT_UNIQUE_LABEL_KEY, MANAGED_BY_ROLLOUTS_KEY};

const SELECTOR_PATH_PREFIX: &str = "/spec/selector/";
const ANNOTATIONS_PATH_PREFIX: &str = "/annotations/";

/// A single JSON patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Remove { path: String },
}

/// Ordered list of patch operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPatch(pub Vec<PatchOperation>);

impl JsonPatch {
    pub fn operations(&self) -> &[PatchOperation] {
        &self.0
    }

    /// Serialized patch body.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        if self.0.len() > 1 {
            "selector_and_managed_by"
        } else {
            "selector"
        }
    }
}

impl fmt::Display for JsonPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.to_json().map_err(|_| fmt::Error)?;
        f.write_str(&body)
    }
}

/// Field a patch path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTarget<'a> {
    SelectorLabel(&'a str),
    Annotation(&'a str),
}

impl<'a> PatchTarget<'a> {
    /// Parse a path produced by this module.
    pub fn parse(path: &'a str) -> Option<Self> {
        if let Some(key) = path.strip_prefix(SELECTOR_PATH_PREFIX) {
            return Some(Self::SelectorLabel(key));
        }
        path.strip_prefix(ANNOTATIONS_PATH_PREFIX)
            .map(Self::Annotation)
    }
}

pub fn selector_path(key: &str) -> String {
    format!("{SELECTOR_PATH_PREFIX}{key}")
}

pub fn annotation_path(key: &str) -> String {
    format!("{ANNOTATIONS_PATH_PREFIX}{key}")
}

/// Patch removing the traffic selector, and the managed-by annotation if present.
pub fn generate_remove_patch(service: &Service) -> JsonPatch {
    let mut ops = vec![PatchOperation::Remove {
        path: selector_path(DEFAULT_ROLLOUT_UNIQUE_LABEL_KEY),
    }];
    if service.has_managed_by_annotation() {
        ops.push(PatchOperation::Remove {
            path: annotation_path(MANAGED_BY_ROLLOUTS_KEY),
        });
    }
    JsonPatch(ops)
}

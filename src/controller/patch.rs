//! # Patch Building
//!
//! Builds RFC 6902 JSON-Patch documents for updating managed objects in
//! place: an optional `test` guard on the generation, the stamped metadata,
//! then a wholesale replace of the object body.

use json_patch::{
    AddOperation, Patch, PatchOperation, RemoveOperation, ReplaceOperation, TestOperation,
};
use jsonptr::PointerBuf;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::Value;

/// Ordered JSON-Patch operations for one object
#[derive(Debug, Default, Clone)]
pub struct PatchBuilder {
    ops: Vec<PatchOperation>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard the patch on the object still being at `generation`
    pub fn test_generation(mut self, generation: Option<i64>) -> Self {
        if let Some(generation) = generation {
            self.ops.push(PatchOperation::Test(TestOperation {
                path: PointerBuf::from_tokens(["metadata", "generation"]),
                value: Value::from(generation),
            }));
        }
        self
    }

    /// Guard the patch on `field` still holding `value`
    pub fn test(mut self, field: &str, value: Value) -> Self {
        self.ops.push(PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens([field]),
            value,
        }));
        self
    }

    /// Set labels, annotations and owner references from `meta`
    ///
    /// `add` on an existing member replaces it, so the object ends up with
    /// exactly the desired maps.
    pub fn metadata(mut self, meta: &ObjectMeta) -> Result<Self, serde_json::Error> {
        if let Some(labels) = &meta.labels {
            self.ops.push(add(["metadata", "labels"], serde_json::to_value(labels)?));
        }
        if let Some(annotations) = &meta.annotations {
            self.ops.push(add(
                ["metadata", "annotations"],
                serde_json::to_value(annotations)?,
            ));
        }
        if let Some(owners) = &meta.owner_references {
            self.ops.push(add(
                ["metadata", "ownerReferences"],
                serde_json::to_value(owners)?,
            ));
        }
        Ok(self)
    }

    /// Replace the top-level `field` (e.g. `spec`, `webhooks`, `data`)
    pub fn replace<T: Serialize>(mut self, field: &str, value: &T) -> Result<Self, serde_json::Error> {
        self.ops.push(PatchOperation::Replace(ReplaceOperation {
            path: PointerBuf::from_tokens([field]),
            value: serde_json::to_value(value)?,
        }));
        Ok(self)
    }

    /// Set the top-level `field`, creating it when the live object lacks it
    pub fn insert<T: Serialize>(mut self, field: &str, value: &T) -> Result<Self, serde_json::Error> {
        self.ops.push(add([field], serde_json::to_value(value)?));
        Ok(self)
    }

    /// Guard the patch on the object still carrying exactly `finalizers`
    pub fn test_finalizers(mut self, finalizers: &[String]) -> Self {
        self.ops.push(PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens(["metadata", "finalizers"]),
            value: Value::from(finalizers.to_vec()),
        }));
        self
    }

    /// Set `metadata.finalizers`, or drop the list when `finalizers` is empty
    pub fn finalizers(mut self, finalizers: &[String]) -> Self {
        if finalizers.is_empty() {
            self.ops.push(PatchOperation::Remove(RemoveOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers"]),
            }));
        } else {
            self.ops.push(add(["metadata", "finalizers"], Value::from(finalizers.to_vec())));
        }
        self
    }

    /// Whether any non-guard operation was added
    pub fn is_empty(&self) -> bool {
        !self
            .ops
            .iter()
            .any(|op| !matches!(op, PatchOperation::Test(_)))
    }

    pub fn build(self) -> Patch {
        Patch(self.ops)
    }
}

fn add<const N: usize>(tokens: [&str; N], value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(tokens),
        value,
    })
}

/// Whether `cached` is missing any label, annotation or owner reference that
/// `desired` declares
pub fn metadata_needs_update(desired: &ObjectMeta, cached: &ObjectMeta) -> bool {
    let map_missing = |want: &Option<std::collections::BTreeMap<String, String>>,
                       have: &Option<std::collections::BTreeMap<String, String>>| {
        want.iter().flatten().any(|(key, value)| {
            have.as_ref().and_then(|have| have.get(key)) != Some(value)
        })
    };

    if map_missing(&desired.labels, &cached.labels)
        || map_missing(&desired.annotations, &cached.annotations)
    {
        return true;
    }

    desired.owner_references.iter().flatten().any(|want| {
        !cached
            .owner_references
            .iter()
            .flatten()
            .any(|have| have.uid == want.uid)
    })
}

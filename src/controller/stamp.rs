//! # Metadata Stamping
//!
//! Every object the operator writes carries provenance labels and the
//! install-strategy annotations of the version that produced it. The
//! [`Stamp::matches`] predicate is how the rest of the operator decides an
//! object already belongs to the targeted version.

use crate::constants::{
    APP_COMPONENT_LABEL, APP_PART_OF_LABEL, APP_VERSION_LABEL, DEFAULT_APP_COMPONENT,
    GENERATION_ANNOTATION, INSTALL_STRATEGY_IDENTIFIER_ANNOTATION,
    INSTALL_STRATEGY_REGISTRY_ANNOTATION, INSTALL_STRATEGY_VERSION_ANNOTATION, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE,
};
use crate::crd::KubeVirt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

const MAX_LABEL_VALUE_LEN: usize = 63;

/// Identity of an install strategy plus the product labels to apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stamp {
    pub version: String,
    pub registry: String,
    pub id: String,
    /// Generation of the managed resource that produced this stamp
    pub generation: i64,
    pub product_name: Option<String>,
    pub product_version: Option<String>,
    pub product_component: Option<String>,
}

impl Stamp {
    pub fn new(
        version: impl Into<String>,
        registry: impl Into<String>,
        id: impl Into<String>,
        generation: i64,
    ) -> Self {
        Self {
            version: version.into(),
            registry: registry.into(),
            id: id.into(),
            generation,
            ..Self::default()
        }
    }

    /// Stamp for the version the resource is currently targeting
    pub fn target(kv: &KubeVirt) -> Self {
        let status = kv.status.clone().unwrap_or_default();
        Self {
            version: status.target_kube_virt_version.unwrap_or_default(),
            registry: status.target_kube_virt_registry.unwrap_or_default(),
            id: status.target_deployment_id.unwrap_or_default(),
            generation: kv.metadata.generation.unwrap_or_default(),
            product_name: kv.spec.product_name.clone(),
            product_version: kv.spec.product_version.clone(),
            product_component: kv.spec.product_component.clone(),
        }
    }

    /// Stamp for the version that was installed before the current target
    pub fn observed(kv: &KubeVirt) -> Self {
        let status = kv.status.clone().unwrap_or_default();
        Self {
            version: status.observed_kube_virt_version.unwrap_or_default(),
            registry: status.observed_kube_virt_registry.unwrap_or_default(),
            id: status.observed_deployment_id.unwrap_or_default(),
            ..Self::target(kv)
        }
    }

    /// Write provenance labels and install-strategy annotations into `meta`
    pub fn apply(&self, meta: &mut ObjectMeta, inject_generation: bool) {
        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        if let Some(version) = valid_label(self.product_version.as_deref()) {
            labels.insert(APP_VERSION_LABEL.to_string(), version.to_string());
        }
        if let Some(name) = valid_label(self.product_name.as_deref()) {
            labels.insert(APP_PART_OF_LABEL.to_string(), name.to_string());
        }
        let component =
            valid_label(self.product_component.as_deref()).unwrap_or(DEFAULT_APP_COMPONENT);
        labels.insert(APP_COMPONENT_LABEL.to_string(), component.to_string());

        let annotations = meta.annotations.get_or_insert_with(Default::default);
        annotations.insert(
            INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(),
            self.version.clone(),
        );
        annotations.insert(
            INSTALL_STRATEGY_REGISTRY_ANNOTATION.to_string(),
            self.registry.clone(),
        );
        annotations.insert(
            INSTALL_STRATEGY_IDENTIFIER_ANNOTATION.to_string(),
            self.id.clone(),
        );
        if inject_generation {
            annotations.insert(
                GENERATION_ANNOTATION.to_string(),
                self.generation.to_string(),
            );
        }
    }

    /// Whether `meta` was written by this exact install strategy
    ///
    /// The generation annotation is only compared when the object carries one.
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        let Some(annotations) = meta.annotations.as_ref() else {
            return false;
        };

        if let Some(generation) = annotations.get(GENERATION_ANNOTATION) {
            if *generation != self.generation.to_string() {
                return false;
            }
        }

        let managed = meta
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MANAGED_BY_LABEL))
            .is_some();

        managed
            && annotations.get(INSTALL_STRATEGY_VERSION_ANNOTATION) == Some(&self.version)
            && annotations.get(INSTALL_STRATEGY_REGISTRY_ANNOTATION) == Some(&self.registry)
            && annotations.get(INSTALL_STRATEGY_IDENTIFIER_ANNOTATION) == Some(&self.id)
    }

    /// Product fields that are set but cannot be used as label values
    pub fn invalid_product_fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("productName", self.product_name.as_deref()),
            ("productVersion", self.product_version.as_deref()),
            ("productComponent", self.product_component.as_deref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            value
                .filter(|v| !is_valid_label_value(v))
                .map(|v| (field, v))
        })
        .collect()
    }
}

fn valid_label(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty() && is_valid_label_value(v))
}

/// Kubernetes label value syntax: at most 63 characters, alphanumeric at both
/// ends, with `-`, `_` and `.` allowed in between. The empty string is valid.
pub fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    if value.len() > MAX_LABEL_VALUE_LEN {
        return false;
    }
    let bytes = value.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> Stamp {
        Stamp::new("v1.4.0", "quay.io/kubevirt", "abc123", 3)
    }

    #[test]
    fn test_apply_then_matches() {
        for inject in [true, false] {
            let mut meta = ObjectMeta::default();
            stamp().apply(&mut meta, inject);
            assert!(stamp().matches(&meta), "inject_generation={inject}");
        }
    }

    #[test]
    fn test_matches_requires_annotations_and_label() {
        assert!(!stamp().matches(&ObjectMeta::default()));

        let mut meta = ObjectMeta::default();
        stamp().apply(&mut meta, true);
        meta.labels.as_mut().unwrap().remove(MANAGED_BY_LABEL);
        assert!(!stamp().matches(&meta));
    }

    #[test]
    fn test_generation_only_compared_when_present() {
        let mut meta = ObjectMeta::default();
        stamp().apply(&mut meta, false);
        let newer = Stamp {
            generation: 4,
            ..stamp()
        };
        assert!(newer.matches(&meta));

        let mut meta = ObjectMeta::default();
        stamp().apply(&mut meta, true);
        assert!(!newer.matches(&meta));
    }

    #[test]
    fn test_version_registry_and_id_must_match() {
        let mut meta = ObjectMeta::default();
        stamp().apply(&mut meta, true);
        assert!(!Stamp::new("v1.5.0", "quay.io/kubevirt", "abc123", 3).matches(&meta));
        assert!(!Stamp::new("v1.4.0", "registry.local", "abc123", 3).matches(&meta));
        assert!(!Stamp::new("v1.4.0", "quay.io/kubevirt", "other", 3).matches(&meta));
    }

    #[test]
    fn test_product_labels() {
        let mut s = stamp();
        s.product_name = Some("acme-virt".to_string());
        s.product_version = Some("not valid!".to_string());
        let mut meta = ObjectMeta::default();
        s.apply(&mut meta, false);
        let labels = meta.labels.unwrap();
        assert_eq!(labels[APP_PART_OF_LABEL], "acme-virt");
        assert!(!labels.contains_key(APP_VERSION_LABEL));
        assert_eq!(labels[APP_COMPONENT_LABEL], DEFAULT_APP_COMPONENT);
        assert_eq!(s.invalid_product_fields(), vec![("productVersion", "not valid!")]);
    }

    #[test]
    fn test_label_value_validity() {
        assert!(is_valid_label_value(""));
        assert!(is_valid_label_value("v1.4.0"));
        assert!(is_valid_label_value("a_b-c.d"));
        assert!(!is_valid_label_value("-leading"));
        assert!(!is_valid_label_value("trailing."));
        assert!(!is_valid_label_value("has space"));
        assert!(!is_valid_label_value(&"a".repeat(64)));
        assert!(is_valid_label_value(&"a".repeat(63)));
    }
}

//! # Webhooks and CA Bundle Consumers
//!
//! Admission webhooks, aggregated APIServices and the export Route all carry
//! a copy of a CA bundle; they are synced with the bundle injected. Also
//! manages the temporary validating webhook that blocks creation of new
//! custom resources until the new API server is ready to serve them.

use crate::constants::{
    TMP_WEBHOOK_GENERATE_NAME, TMP_WEBHOOK_PATH_PREFIX, TMP_WEBHOOK_SERVICE_NAME,
};
use crate::controller::kinds::{ManagedKind, ObjectKind};
use crate::controller::pki::CertificateRequest;
use crate::controller::reconciler::Reconciler;
use crate::controller::syncer::name_of;
use crate::error::ReconcileError;
use crate::observability::metrics;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::time::Duration;
use tracing::info;

fn bundle_bytes(bundle: &str) -> Option<ByteString> {
    Some(ByteString(bundle.as_bytes().to_vec()))
}

pub(crate) fn is_tmp_webhook(webhook: &ValidatingWebhookConfiguration) -> bool {
    webhook
        .metadata
        .name
        .as_deref()
        .is_some_and(|name| name.starts_with(TMP_WEBHOOK_GENERATE_NAME))
}

/// Blocking rule for one custom resource definition
fn tmp_webhook_for(crd: &CustomResourceDefinition, namespace: &str, ca_bundle: &str) -> ValidatingWebhook {
    let name = name_of(&crd.metadata);
    ValidatingWebhook {
        name: format!("{name}-tmp-validator"),
        admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Fail".to_string()),
        rules: Some(vec![RuleWithOperations {
            operations: Some(vec!["CREATE".to_string()]),
            api_groups: Some(vec![crd.spec.group.clone()]),
            api_versions: Some(crd.spec.versions.iter().map(|v| v.name.clone()).collect()),
            resources: Some(vec![crd.spec.names.plural.clone()]),
            ..RuleWithOperations::default()
        }]),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                namespace: namespace.to_string(),
                name: TMP_WEBHOOK_SERVICE_NAME.to_string(),
                path: Some(format!("{TMP_WEBHOOK_PATH_PREFIX}/{name}")),
                port: None,
            }),
            ca_bundle: bundle_bytes(ca_bundle),
            url: None,
        },
        ..ValidatingWebhook::default()
    }
}

impl Reconciler {
    pub(crate) async fn sync_validating_webhooks(
        &mut self,
        bundle: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let mut desired = self.strategy.validating_webhooks.clone();
        if let Some(bundle) = bundle {
            for hook in desired.iter_mut().flat_map(|w| w.webhooks.iter_mut().flatten()) {
                hook.client_config.ca_bundle = bundle_bytes(bundle);
            }
        }
        self.sync_all(&desired).await.map(|_| ())
    }

    pub(crate) async fn sync_mutating_webhooks(
        &mut self,
        bundle: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let mut desired: Vec<MutatingWebhookConfiguration> = self.strategy.mutating_webhooks.clone();
        if let Some(bundle) = bundle {
            for hook in desired.iter_mut().flat_map(|w| w.webhooks.iter_mut().flatten()) {
                hook.client_config.ca_bundle = bundle_bytes(bundle);
            }
        }
        self.sync_all(&desired).await.map(|_| ())
    }

    pub(crate) async fn sync_api_services(&mut self, bundle: Option<&str>) -> Result<(), ReconcileError> {
        let mut desired = self.strategy.api_services.clone();
        if let Some(bundle) = bundle {
            for service in &mut desired {
                service.spec.get_or_insert_with(Default::default).ca_bundle = bundle_bytes(bundle);
            }
        }
        self.sync_all(&desired).await.map(|_| ())
    }

    pub(crate) async fn sync_routes(&mut self, bundle: Option<&str>) -> Result<(), ReconcileError> {
        let mut desired = self.strategy.routes.clone();
        if let Some(bundle) = bundle {
            for route in &mut desired {
                route
                    .spec
                    .tls
                    .get_or_insert_with(Default::default)
                    .destination_ca_certificate = Some(bundle.to_string());
            }
        }
        self.sync_all(&desired).await.map(|_| ())
    }

    /// Block creation of resources whose definitions are new in this version
    ///
    /// One webhook configuration per target stamp; nothing is created when
    /// every definition already exists.
    pub(crate) async fn create_tmp_webhook(&mut self) -> Result<(), ReconcileError> {
        let handle = ValidatingWebhookConfiguration::handle(&self.cluster).clone();
        let exists = handle
            .store
            .list()
            .iter()
            .any(|w| is_tmp_webhook(w) && self.stamp.matches(&w.metadata));
        if exists {
            return Ok(());
        }

        let new_crds: Vec<&CustomResourceDefinition> = self
            .strategy
            .crds
            .iter()
            .filter(|crd| {
                CustomResourceDefinition::handle(&self.cluster)
                    .store
                    .get(None, name_of(&crd.metadata))
                    .is_none()
            })
            .collect();
        if new_crds.is_empty() {
            return Ok(());
        }

        // the API server only wants a parseable bundle; nothing ever dials this service
        let fake_ca = self
            .issuer
            .issue(
                &CertificateRequest::authority("fake.kubevirt.io"),
                None,
                Duration::from_secs(24 * 3600),
            )
            .map_err(|source| ReconcileError::Certificate {
                name: TMP_WEBHOOK_GENERATE_NAME.to_string(),
                source,
            })?;

        let mut webhook = ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                generate_name: Some(TMP_WEBHOOK_GENERATE_NAME.to_string()),
                ..ObjectMeta::default()
            },
            webhooks: Some(
                new_crds
                    .iter()
                    .map(|crd| tmp_webhook_for(crd, &self.namespace, &fake_ca.cert_pem))
                    .collect(),
            ),
        };
        self.stamp.apply(&mut webhook.metadata, true);

        let kind = ObjectKind::ValidatingWebhookConfiguration;
        self.expectations.raise(kind, &self.owner, 1, 0);
        if let Err(e) = handle.client.create(&webhook).await {
            self.expectations.lower(kind, &self.owner, 1, 0);
            return Err(ReconcileError::api("create", kind, TMP_WEBHOOK_GENERATE_NAME, e));
        }
        metrics::increment_object_writes(kind.as_str(), "create");
        info!(
            version = %self.stamp.version,
            registry = %self.stamp.registry,
            "created temporary validating webhook"
        );
        Ok(())
    }

    pub(crate) async fn delete_tmp_webhooks(&self) -> Result<(), ReconcileError> {
        let cached = ValidatingWebhookConfiguration::handle(&self.cluster)
            .store
            .list();
        for webhook in cached {
            if is_tmp_webhook(&webhook) && webhook.metadata.deletion_timestamp.is_none() {
                self.delete_object(webhook.as_ref()).await?;
            }
        }
        Ok(())
    }
}

//! # Certificate Scheduler
//!
//! Keeps the CA secrets, the CA bundle config maps and every leaf certificate
//! secret valid, rotating them ahead of expiry and asking to be woken up again
//! before the next deadline. The resulting bundles are injected into the
//! webhooks, APIServices and Routes that need them.

use crate::config::{format_duration, parse_kubernetes_duration};
use crate::constants::{
    CA_BUNDLE_KEY, CERT_BYTES_KEY, CERT_DURATION_ANNOTATION, DEFAULT_CA_OVERLAP_INTERVAL,
    DEFAULT_CA_ROTATE_INTERVAL, DEFAULT_CERT_RENEW_BEFORE, DEFAULT_CERT_ROTATE_INTERVAL,
    EXPORT_PROXY_CERT_SECRET_NAME, KEY_BYTES_KEY, KUBEVIRT_CA_NAME, KUBEVIRT_EXPORT_CA_NAME,
};
use crate::controller::kinds::ObjectKind;
use crate::controller::patch::{metadata_needs_update, PatchBuilder};
use crate::controller::pki::{
    load_certificate, merge_ca_bundle, rotation_deadline, unix_now, CertificateRequest,
    IssuedCertificate, ParsedCertificate, PkiError,
};
use crate::controller::queue::RequeueQueue;
use crate::controller::reconciler::Reconciler;
use crate::controller::syncer::name_of;
use crate::crd::KubeVirt;
use crate::error::ReconcileError;
use crate::observability::metrics;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifetimes of the self-signed certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateDurations {
    pub ca: Duration,
    /// Also how long a previous CA stays in the bundle
    pub ca_renew_before: Duration,
    pub cert: Duration,
    pub cert_renew_before: Duration,
}

fn duration_or_default(field: &str, value: Option<&str>, default: &str) -> Duration {
    let fallback = || parse_kubernetes_duration(default).unwrap_or(Duration::from_secs(3600));
    match value {
        Some(value) => parse_kubernetes_duration(value).unwrap_or_else(|e| {
            warn!(field, value, error = %e, "invalid certificate duration, using default");
            fallback()
        }),
        None => fallback(),
    }
}

impl CertificateDurations {
    pub fn from_kv(kv: &KubeVirt) -> Self {
        let strategy = kv
            .spec
            .certificate_rotate_strategy
            .self_signed
            .clone()
            .unwrap_or_default();
        Self {
            ca: duration_or_default(
                "caRotateInterval",
                strategy.ca_rotate_interval.as_deref(),
                DEFAULT_CA_ROTATE_INTERVAL,
            ),
            ca_renew_before: duration_or_default(
                "caOverlapInterval",
                strategy.ca_overlap_interval.as_deref(),
                DEFAULT_CA_OVERLAP_INTERVAL,
            ),
            cert: duration_or_default(
                "certRotateInterval",
                strategy.cert_rotate_interval.as_deref(),
                DEFAULT_CERT_ROTATE_INTERVAL,
            ),
            cert_renew_before: duration_or_default(
                "certRenewBefore",
                strategy.cert_renew_before.as_deref(),
                DEFAULT_CERT_RENEW_BEFORE,
            ),
        }
    }
}

/// Lifetime settings for one secret
#[derive(Debug, Clone, Copy)]
struct SecretSchedule {
    duration: Duration,
    renew_before: Duration,
    ca_renew_before: Option<Duration>,
}

fn service_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ]
}

fn pod_server(service: &str, namespace: &str) -> CertificateRequest {
    CertificateRequest::server(
        format!("{service}.{namespace}.pod.cluster.local"),
        service_names(service, namespace),
    )
}

/// Subject of the certificate stored in the secret called `name`
pub fn certificate_request(name: &str, namespace: &str) -> Option<CertificateRequest> {
    let request = match name {
        KUBEVIRT_CA_NAME => CertificateRequest::authority("kubevirt.io"),
        KUBEVIRT_EXPORT_CA_NAME => CertificateRequest::authority("export.kubevirt.io"),
        "kubevirt-operator-certs" => pod_server("kubevirt-operator-webhook", namespace),
        "kubevirt-virt-api-certs" => pod_server("virt-api", namespace),
        "kubevirt-controller-certs" => pod_server("virt-controller", namespace),
        EXPORT_PROXY_CERT_SECRET_NAME => pod_server("virt-exportproxy", namespace),
        "kubevirt-virt-handler-server-certs" => CertificateRequest::server(
            "kubevirt.io:system:node:virt-handler",
            service_names("virt-handler", namespace),
        ),
        "kubevirt-virt-handler-certs" => {
            CertificateRequest::client("kubevirt.io:system:client:virt-handler")
        }
        "kubevirt-virt-handler-migration-client-certs" => {
            CertificateRequest::client("kubevirt.io:system:client:migration")
        }
        "kubevirt-virt-handler-vsock-client-certs" => {
            CertificateRequest::client("kubevirt.io:system:client:vsock")
        }
        "kubevirt-synchronization-controller-certs" => CertificateRequest::client(
            "kubevirt.io:system:client:virt-synchronization-controller",
        ),
        "kubevirt-synchronization-controller-server-certs" => CertificateRequest::server(
            "kubevirt.io:system:node:virt-synchronization-controller",
            service_names("virt-synchronization-controller", namespace),
        ),
        _ => return None,
    };
    Some(request)
}

/// Read the certificate and key out of a secret
pub fn issued_from_secret(secret: &Secret) -> Result<IssuedCertificate, PkiError> {
    let name = name_of(&secret.metadata);
    let field = |key: &str| {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or_else(|| PkiError::Parse(format!("{key} not found in secret {name}")))?;
        String::from_utf8(bytes.0.clone())
            .map_err(|e| PkiError::Parse(format!("{key} in secret {name} is not UTF-8: {e}")))
    };
    Ok(IssuedCertificate {
        cert_pem: field(CERT_BYTES_KEY)?,
        key_pem: field(KEY_BYTES_KEY)?,
    })
}

fn secret_data(issued: &IssuedCertificate) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (
            CERT_BYTES_KEY.to_string(),
            ByteString(issued.cert_pem.clone().into_bytes()),
        ),
        (
            KEY_BYTES_KEY.to_string(),
            ByteString(issued.key_pem.clone().into_bytes()),
        ),
    ])
}

fn needs_rotation(
    cached: &Secret,
    duration: &str,
    ca: Option<&ParsedCertificate>,
    schedule: SecretSchedule,
    now: i64,
) -> bool {
    let name = name_of(&cached.metadata);
    let loaded = issued_from_secret(cached)
        .and_then(|issued| load_certificate(&issued.cert_pem, &issued.key_pem));
    let cert = match loaded {
        Ok(cert) => cert,
        Err(e) => {
            info!(secret = %name, error = %e, "failed to load certificate, rotating");
            return true;
        }
    };

    let annotation = cached
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CERT_DURATION_ANNOTATION));
    if annotation.map(String::as_str) != Some(duration) {
        return true;
    }

    rotation_deadline(&cert, ca, schedule.renew_before, schedule.ca_renew_before, now) <= now
}

fn wait_until(deadline: i64, now: i64) -> Duration {
    Duration::from_secs(u64::try_from(deadline - now).unwrap_or(0))
}

impl Reconciler {
    fn certificate_error(name: &str, source: PkiError) -> ReconcileError {
        ReconcileError::Certificate {
            name: name.to_string(),
            source,
        }
    }

    /// Create, keep or rotate one certificate secret
    async fn sync_certificate_secret(
        &mut self,
        queue: &dyn RequeueQueue,
        desired: &Secret,
        ca: Option<&IssuedCertificate>,
        schedule: SecretSchedule,
    ) -> Result<IssuedCertificate, ReconcileError> {
        let mut secret = self.stamped(desired);
        let name = name_of(&secret.metadata).to_string();
        let namespace = secret.metadata.namespace.clone();
        let cert_err = |e| Self::certificate_error(&name, e);

        let request = certificate_request(&name, namespace.as_deref().unwrap_or(&self.namespace))
            .ok_or_else(|| ReconcileError::InvalidObject {
                kind: ObjectKind::Secret,
                message: format!("no certificate profile for secret {name}"),
            })?;
        debug!(secret = %name, "checking certificate");

        let cached = self.lookup::<Secret>(namespace.as_deref(), &name).await?;
        let ca_cert = ca
            .map(|ca| ParsedCertificate::from_pem(&ca.cert_pem))
            .transpose()
            .map_err(cert_err)?;
        let duration = format_duration(schedule.duration);
        let now = unix_now();

        let rotate = cached
            .as_ref()
            .is_some_and(|c| needs_rotation(c, &duration, ca_cert.as_ref(), schedule, now));

        let issued = match cached.as_ref() {
            Some(cached) if !rotate => {
                secret.data.clone_from(&cached.data);
                issued_from_secret(cached).map_err(cert_err)?
            }
            _ => {
                let issued = self
                    .issuer
                    .issue(&request, ca, schedule.duration)
                    .map_err(cert_err)?;
                secret.data = Some(secret_data(&issued));
                if rotate {
                    metrics::increment_certificate_rotations(&name);
                    info!(secret = %name, "rotating certificate");
                }
                issued
            }
        };
        secret
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(CERT_DURATION_ANNOTATION.to_string(), duration);

        let cert = ParsedCertificate::from_pem(&issued.cert_pem).map_err(cert_err)?;
        let deadline = rotation_deadline(
            &cert,
            ca_cert.as_ref(),
            schedule.renew_before,
            schedule.ca_renew_before,
            now,
        );
        queue.add_after(&self.owner, wait_until(deadline, now));

        let Some(cached) = cached else {
            self.create_object(&secret).await?;
            return Ok(issued);
        };

        if !rotate && !metadata_needs_update(&secret.metadata, &cached.metadata) {
            debug!(secret = %name, "secret is up-to-date");
            return Ok(issued);
        }

        let ser = |e| ReconcileError::serialization(ObjectKind::Secret, &name, e);
        let patch = PatchBuilder::new()
            .metadata(&secret.metadata)
            .map_err(ser)?
            .insert("data", &secret.data)
            .map_err(ser)?
            .build();
        self.patch_object::<Secret>(namespace.as_deref(), &name, patch)
            .await?;
        info!(secret = %name, "secret updated");
        Ok(issued)
    }

    /// CA secret named `name`, if the strategy declares it
    async fn sync_ca_secret(
        &mut self,
        queue: &dyn RequeueQueue,
        name: &str,
        durations: CertificateDurations,
    ) -> Result<Option<IssuedCertificate>, ReconcileError> {
        let Some(desired) = self.strategy.ca_secret(name).cloned() else {
            return Ok(None);
        };
        let schedule = SecretSchedule {
            duration: durations.ca,
            renew_before: durations.ca_renew_before,
            ca_renew_before: None,
        };
        self.sync_certificate_secret(queue, &desired, None, schedule)
            .await
            .map(Some)
    }

    /// Bring the CA bundle config map for `name` in line with `ca`,
    /// returning the bundle
    async fn sync_ca_config_map(
        &mut self,
        queue: &dyn RequeueQueue,
        name: &str,
        ca: &IssuedCertificate,
        overlap: Duration,
    ) -> Result<Option<String>, ReconcileError> {
        let Some(desired) = self.strategy.ca_config_map(name).cloned() else {
            return Ok(None);
        };
        let mut config_map = self.stamped(&desired);
        let namespace = config_map.metadata.namespace.clone();
        let current = ParsedCertificate::from_pem(&ca.cert_pem)
            .map_err(|e| Self::certificate_error(name, e))?;
        let current_pem = current.to_pem();
        let bundle_data = |bundle: &str| BTreeMap::from([(CA_BUNDLE_KEY.to_string(), bundle.to_string())]);

        let Some(existing) = self.lookup::<ConfigMap>(namespace.as_deref(), name).await? else {
            config_map.data = Some(bundle_data(&current_pem));
            self.create_object(&config_map).await?;
            return Ok(Some(current_pem));
        };

        let existing_bundle = existing
            .data
            .as_ref()
            .and_then(|d| d.get(CA_BUNDLE_KEY))
            .map(String::as_str)
            .unwrap_or_default();
        let bundle = match merge_ca_bundle(&current, existing_bundle, overlap, unix_now()) {
            Ok(merged) => {
                if merged.count > 1 {
                    queue.add_after(&self.owner, overlap);
                }
                merged.pem
            }
            Err(e) => {
                info!(config_map = %name, error = %e, "CA bundle is invalid, replacing it");
                current_pem
            }
        };
        config_map.data = Some(bundle_data(&bundle));

        if config_map.data == existing.data
            && !metadata_needs_update(&config_map.metadata, &existing.metadata)
        {
            debug!(config_map = %name, "CA config map is up-to-date");
            return Ok(Some(bundle));
        }

        let ser = |e| ReconcileError::serialization(ObjectKind::ConfigMap, name, e);
        let patch = PatchBuilder::new()
            .metadata(&config_map.metadata)
            .map_err(ser)?
            .insert("data", &config_map.data)
            .map_err(ser)?
            .build();
        self.patch_object::<ConfigMap>(namespace.as_deref(), name, patch)
            .await?;
        info!(config_map = %name, "CA bundle updated");
        Ok(Some(bundle))
    }

    /// CAs, bundles, bundle consumers and leaf certificates, in that order
    pub(crate) async fn sync_certificates(
        &mut self,
        queue: &dyn RequeueQueue,
    ) -> Result<(), ReconcileError> {
        let durations = CertificateDurations::from_kv(&self.kv);

        let ca = self.sync_ca_secret(queue, KUBEVIRT_CA_NAME, durations).await?;
        let export_ca = self
            .sync_ca_secret(queue, KUBEVIRT_EXPORT_CA_NAME, durations)
            .await?;

        let mut bundle = None;
        if let Some(ca) = ca.as_ref() {
            bundle = self
                .sync_ca_config_map(queue, KUBEVIRT_CA_NAME, ca, durations.ca_renew_before)
                .await?;
        }
        if let Some(export_ca) = export_ca.as_ref() {
            self.sync_ca_config_map(
                queue,
                KUBEVIRT_EXPORT_CA_NAME,
                export_ca,
                durations.ca_renew_before,
            )
            .await?;
        }

        self.sync_validating_webhooks(bundle.as_deref()).await?;
        self.sync_mutating_webhooks(bundle.as_deref()).await?;
        self.sync_api_services(bundle.as_deref()).await?;
        self.sync_routes(bundle.as_deref()).await?;

        let schedule = SecretSchedule {
            duration: durations.cert,
            renew_before: durations.cert_renew_before,
            ca_renew_before: Some(durations.ca_renew_before),
        };
        let secrets: Vec<Secret> = self.strategy.certificate_secrets().cloned().collect();
        for secret in &secrets {
            let Some(signer) = ca.as_ref() else {
                return Err(Self::certificate_error(
                    name_of(&secret.metadata),
                    PkiError::MissingCa(name_of(&secret.metadata).to_string()),
                ));
            };
            self.sync_certificate_secret(queue, secret, Some(signer), schedule)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::{FakeCluster, Verb};
    use crate::controller::queue::DelayedRequeue;
    use crate::controller::reconciler::tests::reconciler;
    use crate::controller::strategy::TargetStrategy;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kubevirt".to_string()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kubevirt".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    fn strategy() -> Arc<TargetStrategy> {
        Arc::new(TargetStrategy {
            secrets: vec![
                secret(KUBEVIRT_CA_NAME),
                secret(KUBEVIRT_EXPORT_CA_NAME),
                secret("kubevirt-virt-api-certs"),
                secret(EXPORT_PROXY_CERT_SECRET_NAME),
            ],
            config_maps: vec![config_map(KUBEVIRT_CA_NAME), config_map(KUBEVIRT_EXPORT_CA_NAME)],
            ..TargetStrategy::default()
        })
    }

    fn cert_of(fake: &FakeCluster, name: &str) -> ParsedCertificate {
        let secret = fake.kind::<Secret>().object(Some("kubevirt"), name).unwrap();
        ParsedCertificate::from_pem(&issued_from_secret(&secret).unwrap().cert_pem).unwrap()
    }

    #[test]
    fn test_default_durations() {
        let kv = KubeVirt::new("kubevirt", crate::crd::KubeVirtSpec::default());
        let d = CertificateDurations::from_kv(&kv);
        assert_eq!(d.ca, Duration::from_secs(168 * 3600));
        assert_eq!(d.ca_renew_before, Duration::from_secs(24 * 3600));
        assert_eq!(d.cert, Duration::from_secs(24 * 3600));
        assert_eq!(d.cert_renew_before, Duration::from_secs(18 * 3600));
    }

    #[test]
    fn test_certificate_profiles() {
        let api = certificate_request("kubevirt-virt-api-certs", "kubevirt").unwrap();
        assert_eq!(api.common_name, "virt-api.kubevirt.pod.cluster.local");
        assert!(api.dns_names.contains(&"virt-api.kubevirt.svc.cluster.local".to_string()));
        let handler = certificate_request("kubevirt-virt-handler-certs", "kubevirt").unwrap();
        assert_eq!(handler.common_name, "kubevirt.io:system:client:virt-handler");
        assert!(certificate_request("unknown", "kubevirt").is_none());
    }

    #[tokio::test]
    async fn test_certificates_are_issued_then_kept() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, strategy());
        let queue = DelayedRequeue::new();

        r.sync_certificates(&queue).await.unwrap();

        let ca = cert_of(&fake, KUBEVIRT_CA_NAME);
        let export_ca = cert_of(&fake, KUBEVIRT_EXPORT_CA_NAME);
        assert!(cert_of(&fake, "kubevirt-virt-api-certs").is_signed_by(&ca));
        let proxy = cert_of(&fake, EXPORT_PROXY_CERT_SECRET_NAME);
        assert!(proxy.is_signed_by(&ca));
        assert!(!proxy.is_signed_by(&export_ca));

        let bundle = fake
            .kind::<ConfigMap>()
            .object(Some("kubevirt"), KUBEVIRT_CA_NAME)
            .unwrap();
        assert_eq!(bundle.data.unwrap()[CA_BUNDLE_KEY], ca.to_pem());

        // leaf renewal is due 6h from now, before anything else
        let next = queue.next().unwrap();
        assert!(next <= Duration::from_secs(6 * 3600));
        assert!(next > Duration::from_secs(5 * 3600));

        fake.calls.clear();
        r.sync_certificates(&DelayedRequeue::new()).await.unwrap();
        assert!(fake.calls.writes().is_empty());
    }

    #[tokio::test]
    async fn test_changed_duration_rotates() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, strategy());
        r.sync_certificates(&DelayedRequeue::new()).await.unwrap();
        let before = cert_of(&fake, "kubevirt-virt-api-certs");

        r.kv.spec.certificate_rotate_strategy.self_signed = Some(crate::crd::SelfSignedStrategy {
            cert_rotate_interval: Some("48h".to_string()),
            ..Default::default()
        });
        fake.calls.clear();
        r.sync_certificates(&DelayedRequeue::new()).await.unwrap();

        let after = cert_of(&fake, "kubevirt-virt-api-certs");
        assert_ne!(before, after);
        let secret = fake
            .kind::<Secret>()
            .object(Some("kubevirt"), "kubevirt-virt-api-certs")
            .unwrap();
        assert_eq!(
            secret.metadata.annotations.unwrap()[CERT_DURATION_ANNOTATION],
            "48h0m0s"
        );
        let patched: Vec<String> = fake
            .calls
            .writes()
            .into_iter()
            .filter(|c| c.verb == Verb::Patch)
            .map(|c| c.name)
            .collect();
        assert!(patched.contains(&"kubevirt-virt-api-certs".to_string()));
        assert!(!patched.contains(&KUBEVIRT_CA_NAME.to_string()));
    }

    #[tokio::test]
    async fn test_rotated_ca_is_bundled_with_previous() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, strategy());
        r.sync_certificates(&DelayedRequeue::new()).await.unwrap();
        let old_ca = cert_of(&fake, KUBEVIRT_CA_NAME);

        // corrupt the CA so it has to be reissued
        fake.kind::<Secret>()
            .modify(Some("kubevirt"), KUBEVIRT_CA_NAME, |s| {
                s.data = Some(BTreeMap::from([(
                    CERT_BYTES_KEY.to_string(),
                    ByteString(b"garbage".to_vec()),
                )]));
            });
        let queue = DelayedRequeue::new();
        r.sync_certificates(&queue).await.unwrap();

        let new_ca = cert_of(&fake, KUBEVIRT_CA_NAME);
        assert_ne!(new_ca, old_ca);
        let bundle = fake
            .kind::<ConfigMap>()
            .object(Some("kubevirt"), KUBEVIRT_CA_NAME)
            .unwrap()
            .data
            .unwrap()[CA_BUNDLE_KEY]
            .clone();
        assert_eq!(bundle, format!("{}{}", new_ca.to_pem(), old_ca.to_pem()));
        // leaf certificates follow the new CA
        assert!(cert_of(&fake, "kubevirt-virt-api-certs").is_signed_by(&new_ca));
    }
}

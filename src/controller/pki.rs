//! # PKI
//!
//! Self-signed certificate authorities and the leaf certificates they sign,
//! plus the parsing needed to decide when a certificate must be rotated and
//! which CAs stay in a trust bundle.
//!
//! Timestamps are Unix seconds throughout.

use crate::constants::MAX_CERTIFICATES_IN_BUNDLE;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// A leaf certificate was requested without a CA to sign it
    #[error("no CA available to sign {0}")]
    MissingCa(String),
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// A certificate and its private key, both PEM encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateUsage {
    Authority,
    Server,
    Client,
}

/// Subject and usage of a certificate to issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub usage: CertificateUsage,
}

impl CertificateRequest {
    pub fn authority(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            dns_names: Vec::new(),
            usage: CertificateUsage::Authority,
        }
    }

    pub fn server(common_name: impl Into<String>, dns_names: Vec<String>) -> Self {
        Self {
            common_name: common_name.into(),
            dns_names,
            usage: CertificateUsage::Server,
        }
    }

    pub fn client(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            dns_names: Vec::new(),
            usage: CertificateUsage::Client,
        }
    }
}

/// Issues key pairs and certificates
pub trait CertificateIssuer: Send + Sync + Debug {
    /// Issue a certificate valid for `validity` from now, signed by `ca`
    /// (self-signed for authorities)
    fn issue(
        &self,
        request: &CertificateRequest,
        ca: Option<&IssuedCertificate>,
        validity: Duration,
    ) -> Result<IssuedCertificate>;
}

/// [`CertificateIssuer`] backed by `rcgen`
#[derive(Debug, Default, Clone, Copy)]
pub struct RcgenIssuer;

impl RcgenIssuer {
    /// Issue with an explicit start of validity
    pub fn issue_at(
        &self,
        request: &CertificateRequest,
        ca: Option<&IssuedCertificate>,
        not_before: ::time::OffsetDateTime,
        validity: Duration,
    ) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(request.common_name.clone()),
        );
        params.distinguished_name = dn;

        let validity = ::time::Duration::try_from(validity)
            .map_err(|e| PkiError::Generation(format!("invalid validity: {e}")))?;
        params.not_before = not_before;
        params.not_after = not_before + validity;

        params.subject_alt_names = request
            .dns_names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| PkiError::Generation(format!("invalid DNS name '{name}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        match request.usage {
            CertificateUsage::Authority => {
                params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::CrlSign,
                    KeyUsagePurpose::DigitalSignature,
                ];
            }
            CertificateUsage::Server | CertificateUsage::Client => {
                params.is_ca = IsCa::NoCa;
                params.key_usages = vec![
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::KeyEncipherment,
                ];
                params.extended_key_usages = vec![if request.usage == CertificateUsage::Server {
                    ExtendedKeyUsagePurpose::ServerAuth
                } else {
                    ExtendedKeyUsagePurpose::ClientAuth
                }];
            }
        }

        let key = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate key: {e}")))?;
        let key_pem = key.serialize_pem();

        let cert = match (request.usage, ca) {
            (CertificateUsage::Authority, _) => params.self_signed(&key),
            (_, Some(ca)) => {
                let ca_key = KeyPair::from_pem(&ca.key_pem)
                    .map_err(|e| PkiError::Parse(format!("failed to load CA key: {e}")))?;
                let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
                    .map_err(|e| PkiError::Parse(format!("failed to create issuer: {e}")))?;
                params.signed_by(&key, &issuer)
            }
            (_, None) => return Err(PkiError::MissingCa(request.common_name.clone())),
        }
        .map_err(|e| PkiError::Generation(format!("failed to sign {}: {e}", request.common_name)))?;

        debug!(common_name = %request.common_name, "issued certificate");
        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem,
        })
    }
}

impl CertificateIssuer for RcgenIssuer {
    fn issue(
        &self,
        request: &CertificateRequest,
        ca: Option<&IssuedCertificate>,
        validity: Duration,
    ) -> Result<IssuedCertificate> {
        self.issue_at(request, ca, ::time::OffsetDateTime::now_utc(), validity)
    }
}

/// Validity and subject of a parsed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_before: i64,
    pub not_after: i64,
    pub common_name: String,
}

/// A DER certificate with its parsed validity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    pub der: Vec<u8>,
    pub info: CertificateInfo,
}

impl ParsedCertificate {
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;
        let info = CertificateInfo {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name: cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_string(),
        };
        Ok(Self { der, info })
    }

    /// Parse the first certificate of a PEM document
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        Self::from_der(parse_pem(pem_data)?)
    }

    /// Whether this certificate's signature verifies against `ca`'s key
    pub fn is_signed_by(&self, ca: &ParsedCertificate) -> bool {
        let (Ok((_, cert)), Ok((_, ca_cert))) = (
            X509Certificate::from_der(&self.der),
            X509Certificate::from_der(&ca.der),
        ) else {
            return false;
        };
        cert.verify_signature(Some(ca_cert.public_key())).is_ok()
    }

    pub fn to_pem(&self) -> String {
        encode_certificate(&self.der)
    }
}

/// Parse a certificate and check its key is usable
pub fn load_certificate(cert_pem: &str, key_pem: &str) -> Result<ParsedCertificate> {
    KeyPair::from_pem(key_pem).map_err(|e| PkiError::Parse(format!("failed to parse key: {e}")))?;
    ParsedCertificate::from_pem(cert_pem)
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

/// Every certificate in a PEM bundle
pub fn parse_bundle(bundle: &str) -> Result<Vec<ParsedCertificate>> {
    ::pem::parse_many(bundle.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse CA bundle: {e}")))?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| ParsedCertificate::from_der(p.into_contents()))
        .collect()
}

pub fn encode_certificate(der: &[u8]) -> String {
    ::pem::encode_config(
        &::pem::Pem::new("CERTIFICATE", der.to_vec()),
        ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
    )
}

pub fn unix_now() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

/// When `cert` should be replaced
///
/// A certificate not signed by `ca` is due immediately. One that would
/// outlive its CA is rotated halfway through the CA's renewal window.
pub fn rotation_deadline(
    cert: &ParsedCertificate,
    ca: Option<&ParsedCertificate>,
    renew_before: Duration,
    ca_renew_before: Option<Duration>,
    now: i64,
) -> i64 {
    let mut deadline = cert.info.not_after.saturating_sub(secs(renew_before));

    if let Some(ca) = ca {
        if !cert.is_signed_by(ca) {
            info!(
                common_name = %cert.info.common_name,
                "certificate is not signed by the current CA, rotating"
            );
            return now;
        }
        if ca.info.not_after < cert.info.not_after {
            deadline = ca.info.not_after - ca_renew_before.map_or(0, |d| secs(d) / 2);
        }
    }
    deadline
}

/// A merged trust bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaBundle {
    pub pem: String,
    pub count: usize,
}

/// Current CA first, then older CAs that are still within the overlap window
///
/// Expired entries are dropped and at most [`MAX_CERTIFICATES_IN_BUNDLE`] are
/// considered, newest first. Walking from newest to oldest, the walk stops as
/// soon as the previous (newer) CA has been around longer than `overlap`.
pub fn merge_ca_bundle(
    current: &ParsedCertificate,
    bundle: &str,
    overlap: Duration,
    now: i64,
) -> Result<CaBundle> {
    let mut certs: Vec<ParsedCertificate> = parse_bundle(bundle)?
        .into_iter()
        .filter(|c| c.info.not_after > now)
        .collect();
    certs.sort_by(|a, b| b.info.not_before.cmp(&a.info.not_before));
    certs.truncate(MAX_CERTIFICATES_IN_BUNDLE);

    let overlap = secs(overlap);
    let mut pem = current.to_pem();
    let mut count = 1;
    for (i, cert) in certs.iter().enumerate() {
        let newer = if i == 0 { current } else { &certs[i - 1] };
        if newer.info.not_before.saturating_add(overlap) < now {
            debug!("dropping CA certificates older than the overlap window");
            break;
        }
        if cert.der == current.der {
            continue;
        }
        pem.push_str(&cert.to_pem());
        count += 1;
    }

    Ok(CaBundle { pem, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn ca_at(issuer: &RcgenIssuer, hours_ago: i64) -> IssuedCertificate {
        let start = ::time::OffsetDateTime::now_utc() - ::time::Duration::hours(hours_ago);
        issuer
            .issue_at(
                &CertificateRequest::authority("kubevirt.io"),
                None,
                start,
                HOUR * 168,
            )
            .unwrap()
    }

    #[test]
    fn test_leaf_is_signed_by_ca() {
        let issuer = RcgenIssuer;
        let ca = issuer
            .issue(&CertificateRequest::authority("kubevirt.io"), None, HOUR * 168)
            .unwrap();
        let leaf = issuer
            .issue(
                &CertificateRequest::server(
                    "virt-api.kubevirt.pod.cluster.local",
                    vec!["virt-api".to_string(), "virt-api.kubevirt.svc".to_string()],
                ),
                Some(&ca),
                HOUR * 24,
            )
            .unwrap();

        let ca = load_certificate(&ca.cert_pem, &ca.key_pem).unwrap();
        let parsed = load_certificate(&leaf.cert_pem, &leaf.key_pem).unwrap();
        assert_eq!(parsed.info.common_name, "virt-api.kubevirt.pod.cluster.local");
        assert!(parsed.is_signed_by(&ca));

        let other = ParsedCertificate::from_pem(&ca_at(&issuer, 0).cert_pem).unwrap();
        assert!(!parsed.is_signed_by(&other));
    }

    #[test]
    fn test_leaf_requires_ca() {
        let err = RcgenIssuer
            .issue(&CertificateRequest::client("kubevirt.io:system:client:virt-handler"), None, HOUR)
            .unwrap_err();
        assert!(matches!(err, PkiError::MissingCa(_)));
    }

    #[test]
    fn test_rotation_deadline() {
        let issuer = RcgenIssuer;
        let ca_pair = issuer
            .issue(&CertificateRequest::authority("kubevirt.io"), None, HOUR * 168)
            .unwrap();
        let ca = ParsedCertificate::from_pem(&ca_pair.cert_pem).unwrap();
        let leaf = ParsedCertificate::from_pem(
            &issuer
                .issue(&CertificateRequest::client("client"), Some(&ca_pair), HOUR * 24)
                .unwrap()
                .cert_pem,
        )
        .unwrap();
        let now = unix_now();

        let deadline = rotation_deadline(&leaf, Some(&ca), HOUR * 18, Some(HOUR * 24), now);
        assert_eq!(deadline, leaf.info.not_after - 18 * 3600);

        // outliving the CA
        let long = ParsedCertificate::from_pem(
            &issuer
                .issue(&CertificateRequest::client("client"), Some(&ca_pair), HOUR * 200)
                .unwrap()
                .cert_pem,
        )
        .unwrap();
        let deadline = rotation_deadline(&long, Some(&ca), HOUR * 18, Some(HOUR * 24), now);
        assert_eq!(deadline, ca.info.not_after - 12 * 3600);

        // signed by someone else
        let foreign = ParsedCertificate::from_pem(&ca_at(&issuer, 0).cert_pem).unwrap();
        assert_eq!(rotation_deadline(&leaf, Some(&foreign), HOUR, None, now), now);
    }

    #[test]
    fn test_merge_keeps_recent_previous_ca() {
        let issuer = RcgenIssuer;
        let old = ParsedCertificate::from_pem(&ca_at(&issuer, 30).cert_pem).unwrap();
        let current = ParsedCertificate::from_pem(&ca_at(&issuer, 1).cert_pem).unwrap();
        let now = unix_now();

        let merged = merge_ca_bundle(&current, &old.to_pem(), HOUR * 24, now).unwrap();
        assert_eq!(merged.count, 2);
        let certs = parse_bundle(&merged.pem).unwrap();
        assert_eq!(certs[0].der, current.der);
        assert_eq!(certs[1].der, old.der);

        // merging again is stable
        let again = merge_ca_bundle(&current, &merged.pem, HOUR * 24, now).unwrap();
        assert_eq!(again, merged);
    }

    #[test]
    fn test_merge_drops_ca_after_overlap() {
        let issuer = RcgenIssuer;
        let old = ParsedCertificate::from_pem(&ca_at(&issuer, 60).cert_pem).unwrap();
        let current = ParsedCertificate::from_pem(&ca_at(&issuer, 30).cert_pem).unwrap();

        let merged = merge_ca_bundle(&current, &old.to_pem(), HOUR * 24, unix_now()).unwrap();
        assert_eq!(merged.count, 1);
        assert_eq!(merged.pem, current.to_pem());
    }

    #[test]
    fn test_unparseable_bundle_is_an_error() {
        let current = ParsedCertificate::from_pem(&ca_at(&RcgenIssuer, 0).cert_pem).unwrap();
        assert!(merge_ca_bundle(&current, "-----BEGIN CERTIFICATE-----\nnot base64\n-----END CERTIFICATE-----\n", HOUR, unix_now()).is_err());
    }
}

//! Certificate authority: load or generate an RSA root CA and issue cached,
//! per-host leaf certificates for TLS interception.
//!
//! Grounded on the original proxy's `mitm.go` (RSA-only CA/leaf issuance,
//! 24h leaf TTL, chain = `[leaf, CA]`) combined with the idiomatic rcgen
//! certificate-templating pattern used for MITM CAs elsewhere in the corpus
//! (`codex-rs/network-proxy/src/certs.rs`). rcgen itself cannot *generate*
//! RSA keys, so key material comes from the `rsa` crate and is handed to
//! rcgen as an externally-supplied signing key (`KeyPair::from_pkcs8_der_and_sign_algo`
//! with `PKCS_RSA_SHA256`).

use crate::error::{CoreError, Result};
use rand::rngs::OsRng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, LineEnding};
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

const RSA_BITS: usize = 2048;
const LEAF_TTL_HOURS: i64 = 24;

/// A freshly issued (or cache-hit) leaf certificate, PEM-encoded.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    /// Leaf certificate only.
    pub cert_pem: String,
    /// Leaf private key, PKCS#8 PEM.
    pub key_pem: String,
    /// Leaf followed by the CA certificate, concatenated PEM — the chain a
    /// TLS server config should present.
    pub chain_pem: String,
}

fn rsa_key_to_rcgen_keypair(key: &RsaPrivateKey) -> Result<KeyPair> {
    let pkcs8_der = key
        .to_pkcs8_der()
        .map_err(|e| CoreError::CaGenerateFailed(format!("pkcs8 encode: {e}")))?;
    KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8_der.into(), &PKCS_RSA_SHA256)
        .map_err(|e| CoreError::CaGenerateFailed(format!("rcgen keypair: {e}")))
}

fn host_is_ip(host: &str) -> Option<IpAddr> {
    host.parse::<IpAddr>().ok()
}

/// Strips a trailing `:port` from a host string, same normalization the
/// original applies before cache lookup and template construction.
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

struct Inner {
    ca_key: RsaPrivateKey,
    ca_cert_pem: String,
    cache: HashMap<String, IssuedCert>,
}

pub struct CertAuthority {
    inner: Mutex<Inner>,
    leaf_ttl: Duration,
}

impl CertAuthority {
    /// Loads a CA from PEM bytes. Accepts RSA keys in PKCS#1 (`RSA PRIVATE
    /// KEY`) or PKCS#8 (`PRIVATE KEY`) form; any other key type is rejected.
    pub fn load_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_str = std::str::from_utf8(cert_pem)
            .map_err(|e| CoreError::CaGenerateFailed(format!("cert pem not utf8: {e}")))?;
        let key_str = std::str::from_utf8(key_pem)
            .map_err(|e| CoreError::CaGenerateFailed(format!("key pem not utf8: {e}")))?;

        let ca_key = if key_str.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(key_str)
                .map_err(|e| CoreError::CaGenerateFailed(format!("pkcs1 parse: {e}")))?
        } else if key_str.contains("BEGIN PRIVATE KEY") {
            RsaPrivateKey::from_pkcs8_pem(key_str)
                .map_err(|_| CoreError::CaGenerateFailed("only RSA keys are supported for CA".into()))?
        } else {
            return Err(CoreError::CaGenerateFailed(
                "unknown CA key PEM block type".into(),
            ));
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                ca_key,
                ca_cert_pem: cert_str.to_string(),
                cache: HashMap::new(),
            }),
            leaf_ttl: Duration::from_secs(LEAF_TTL_HOURS as u64 * 3600),
        })
    }

    pub fn load_from_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert = std::fs::read(cert_path)?;
        let key = std::fs::read(key_path)?;
        Self::load_from_pem(&cert, &key)
    }

    /// Generates a 2048-bit RSA self-signed dev CA, valid for `years_valid`
    /// years (default 5 when `<= 0`). Returns `(cert_pem, key_pem)`; the key
    /// is PKCS#1 PEM, matching the original's `MarshalPKCS1PrivateKey`.
    pub fn generate_dev_ca(cn: &str, years_valid: i64) -> Result<(String, String)> {
        let years = if years_valid <= 0 { 5 } else { years_valid };
        let mut rng = OsRng;
        let key = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| CoreError::CaGenerateFailed(format!("rsa keygen: {e}")))?;
        let key_pair = rsa_key_to_rcgen_keypair(&key)?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365 * years);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CoreError::CaGenerateFailed(format!("self-sign: {e}")))?;

        let cert_pem = cert.pem();
        let key_pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CoreError::CaGenerateFailed(format!("pkcs1 pem encode: {e}")))?
            .to_string();
        Ok((cert_pem, key_pem))
    }

    pub fn ca_cert_pem(&self) -> String {
        self.inner.lock().expect("ca lock poisoned").ca_cert_pem.clone()
    }

    /// Issues (or returns a cached) leaf certificate for `host`.
    pub fn issue_for(&self, host: &str) -> Result<IssuedCert> {
        let host = strip_port(host.trim());

        {
            let inner = self.inner.lock().expect("ca lock poisoned");
            if let Some(cached) = inner.cache.get(host) {
                return Ok(cached.clone());
            }
        }

        let mut rng = OsRng;
        let leaf_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| CoreError::CaGenerateFailed(format!("rsa keygen: {e}")))?;
        let leaf_key_pair = rsa_key_to_rcgen_keypair(&leaf_key)?;

        let mut params = if let Some(ip) = host_is_ip(host) {
            let mut p = CertificateParams::new(Vec::<String>::new())
                .map_err(|e| CoreError::CaGenerateFailed(format!("cert params: {e}")))?;
            p.subject_alt_names = vec![SanType::IpAddress(ip)];
            p
        } else {
            CertificateParams::new(vec![host.to_string()])
                .map_err(|e| CoreError::CaGenerateFailed(format!("cert params: {e}")))?
        };
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::KeyEncipherment, KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::NoCa;
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(5);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::hours(LEAF_TTL_HOURS);

        let issued = {
            let inner = self.inner.lock().expect("ca lock poisoned");
            let ca_key_pair = rsa_key_to_rcgen_keypair(&inner.ca_key)?;
            let issuer = Issuer::from_ca_cert_pem(&inner.ca_cert_pem, ca_key_pair)
                .map_err(|e| CoreError::CaGenerateFailed(format!("issuer: {e}")))?;
            let cert = params
                .signed_by(&leaf_key_pair, &issuer)
                .map_err(|e| CoreError::CaGenerateFailed(format!("sign leaf: {e}")))?;
            let cert_pem = cert.pem();
            let key_pem = leaf_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CoreError::CaGenerateFailed(format!("pkcs8 pem: {e}")))?
                .to_string();
            let chain_pem = format!("{cert_pem}{}", inner.ca_cert_pem);
            IssuedCert {
                cert_pem,
                key_pem,
                chain_pem,
            }
        };

        self.inner
            .lock()
            .expect("ca lock poisoned")
            .cache
            .insert(host.to_string(), issued.clone());
        Ok(issued)
    }

    pub fn swap_ca(&self, cert_pem: String, key_pem: &[u8]) -> Result<()> {
        let replacement = Self::load_from_pem(cert_pem.as_bytes(), key_pem)?;
        let mut inner = self.inner.lock().expect("ca lock poisoned");
        let mut replacement_inner = replacement.inner.into_inner().expect("ca lock poisoned");
        inner.ca_key = replacement_inner.ca_key;
        inner.ca_cert_pem = std::mem::take(&mut replacement_inner.ca_cert_pem);
        inner.cache.clear();
        Ok(())
    }

    pub fn leaf_ttl(&self) -> Duration {
        self.leaf_ttl
    }
}

/// `AllowSuffix`/`DenySuffix` host filter for MITM eligibility. Deny wins
/// over allow; an empty allow list means "allow everything not denied".
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    pub allow_suffix: Vec<String>,
    pub deny_suffix: Vec<String>,
}

fn suffix_matches(host: &str, entry: &str) -> bool {
    let entry = entry.trim().to_lowercase();
    !entry.is_empty() && (host == entry || host.ends_with(&format!(".{entry}")) || host.ends_with(&entry))
}

impl DomainFilter {
    pub fn should_intercept(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = strip_port(host).to_lowercase();
        if self.deny_suffix.iter().any(|d| suffix_matches(&host, d)) {
            return false;
        }
        if self.allow_suffix.is_empty() {
            return true;
        }
        self.allow_suffix.iter().any(|a| suffix_matches(&host, a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_issues_leaf() {
        let (cert_pem, key_pem) = CertAuthority::generate_dev_ca("test CA", 5).unwrap();
        let ca = CertAuthority::load_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        let issued = ca.issue_for("example.com:443").unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.chain_pem.contains(&issued.cert_pem));
    }

    #[test]
    fn issuance_is_cached() {
        let (cert_pem, key_pem) = CertAuthority::generate_dev_ca("test CA", 5).unwrap();
        let ca = CertAuthority::load_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        let a = ca.issue_for("example.com").unwrap();
        let b = ca.issue_for("example.com").unwrap();
        assert_eq!(a.cert_pem, b.cert_pem);
    }

    #[test]
    fn domain_filter_deny_wins_over_allow() {
        let f = DomainFilter {
            allow_suffix: vec!["example.com".to_string()],
            deny_suffix: vec!["blocked.example.com".to_string()],
        };
        assert!(f.should_intercept("api.example.com"));
        assert!(!f.should_intercept("blocked.example.com"));
        assert!(!f.should_intercept("other.com"));
    }

    #[test]
    fn empty_allow_means_allow_all_not_denied() {
        let f = DomainFilter {
            allow_suffix: vec![],
            deny_suffix: vec!["bad.com".to_string()],
        };
        assert!(f.should_intercept("anything.com"));
        assert!(!f.should_intercept("bad.com"));
    }
}

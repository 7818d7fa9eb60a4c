use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use tokio::sync::OnceCell;

use crate::error::Error;
use crate::http::strip_port;

pub const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A certificate issued for one intercepted host.
pub struct LeafCert {
    pub host: String,
    pub cert: CertificateDer<'static>,
    pub key: PrivatePkcs8KeyDer<'static>,
    pub issued_at: Instant,
    server_config: Arc<ServerConfig>,
}

impl LeafCert {
    /// TLS server configuration presenting this leaf. Only `http/1.1` is
    /// offered over ALPN.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }
}

impl fmt::Debug for LeafCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCert")
            .field("host", &self.host)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

type Slot = Arc<OnceCell<Arc<LeafCert>>>;

/// Wraps a CA certificate and key pair used to sign per-host certificates.
///
/// Leaves are cached by host name. Concurrent requests for the same host
/// share one signing operation and receive the same [`LeafCert`].
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_pem: String,
    leaf_validity: Duration,
    cache_ttl: Option<Duration>,
    cache: Mutex<HashMap<String, Slot>>,
    issued: AtomicU64,
}

impl CertificateAuthority {
    fn new(cert: rcgen::Certificate, key: KeyPair, cert_pem: String) -> Self {
        Self {
            cert,
            key,
            cert_pem,
            leaf_validity: DEFAULT_LEAF_VALIDITY,
            cache_ttl: None,
            cache: Mutex::new(HashMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    /// Create from PEM-encoded strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, Error> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let cert = params.self_signed(&key)?;
        Ok(Self::new(cert, key, cert_pem.to_string()))
    }

    /// Create from PEM files on disk.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Create a fresh self-signed root. Used by the `--generate` flag and by
    /// tests; the proxy itself never creates a root.
    pub fn generate() -> Result<Self, Error> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params
            .distinguished_name
            .push(DnType::CommonName, "interpose CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "interpose");
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(3650);

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        Ok(Self::new(cert, key, cert_pem))
    }

    /// Write the root certificate and key as PEM files.
    pub fn to_pem_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), Error> {
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, self.key.serialize_pem())?;
        Ok(())
    }

    /// How long issued leaves are valid for.
    pub fn with_leaf_validity(mut self, validity: Duration) -> Self {
        self.leaf_validity = validity;
        self
    }

    /// Reissue a cached leaf once it is older than `ttl`.
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER encoding of the root, for building client trust stores.
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Return the cached leaf for `host` or issue one. The port, if any, is
    /// ignored and the name is matched case-insensitively.
    pub async fn fetch_or_generate(&self, host: &str) -> Result<Arc<LeafCert>, Error> {
        let name = normalize_host(host);
        if name.is_empty() {
            return Err(Error::Issuance {
                host: host.to_string(),
                reason: "empty host name".into(),
            });
        }
        let slot = self.slot(&name);
        let leaf = slot.get_or_try_init(|| async { self.issue(&name) }).await?;
        Ok(leaf.clone())
    }

    fn slot(&self, name: &str) -> Slot {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = cache.entry(name.to_string()).or_default();
        let expired = match (self.cache_ttl, slot.get()) {
            (Some(ttl), Some(leaf)) => leaf.issued_at.elapsed() >= ttl,
            _ => false,
        };
        if expired {
            tracing::debug!(host = %name, "leaf certificate expired from cache");
            *slot = Slot::default();
        }
        slot.clone()
    }

    fn issue(&self, host: &str) -> Result<Arc<LeafCert>, Error> {
        let fail = |reason: String| Error::Issuance {
            host: host.to_string(),
            reason,
        };

        let mut params =
            CertificateParams::new(vec![host.to_string()]).map_err(|e| fail(e.to_string()))?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.distinguished_name.push(DnType::CommonName, host);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + self.leaf_validity;

        let key_pair =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| fail(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.cert, &self.key)
            .map_err(|e| fail(e.to_string()))?;
        let cert_der = cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

        let mut server_config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| fail(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(
            vec![cert_der.clone()],
            PrivateKeyDer::Pkcs8(key_der.clone_key()),
        )
        .map_err(|e| fail(e.to_string()))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let issued = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(host = %host, issued, "issued leaf certificate");

        Ok(Arc::new(LeafCert {
            host: host.to_string(),
            cert: cert_der,
            key: key_der,
            issued_at: Instant::now(),
            server_config: Arc::new(server_config),
        }))
    }

    /// Drop the cached leaf for `host`, if any.
    pub fn evict(&self, host: &str) -> bool {
        let name = normalize_host(host);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name)
            .is_some()
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of hosts with a cached (or in-flight) leaf.
    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of leaves signed so far.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("leaf_validity", &self.leaf_validity)
            .field("cache_ttl", &self.cache_ttl)
            .field("issued", &self.issued_count())
            .finish_non_exhaustive()
    }
}

fn normalize_host(host: &str) -> String {
    strip_port(host.trim()).to_ascii_lowercase()
}

//! Certificate Authority (CA) engine
//!
//! The root CA is loaded from the [`CertStore`] or, on first run, generated
//! and persisted there. Leaf certificates are issued lazily per intercepted
//! domain, signed by the root, persisted, and kept hot in a
//! [`moka::future::Cache`] as ready-to-serve rustls [`CertifiedKey`]s.
//!
//! First issuance for a domain is single-flight: concurrent handshakes for
//! the same unseen domain wait on one generation instead of racing.

use crate::error::{Error, Result};
use crate::store::{CaEntry, CertStore};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use rustls_pki_types::CertificateDer;
use tokio_rustls::rustls::sign::CertifiedKey;
use x509_parser::prelude::{parse_x509_certificate, FromDer, SubjectPublicKeyInfo};

/// Store name of the root identity. `@` never appears in a host name, so it
/// cannot collide with a leaf.
pub const ROOT_NAME: &str = "@root-ca";
/// Common name of a freshly generated root
pub const ROOT_COMMON_NAME: &str = "VProxy MITM Root CA";
/// Root file name used by [`CertificateAuthority::install_root`] when no path is given
pub const ROOT_EXPORT_FILE: &str = "vproxy-root-ca.crt";

const DAY: i64 = 24 * 60 * 60;
const YEAR: i64 = 365 * DAY;
/// Hot leaf cache size
const LEAF_CACHE_CAPACITY: u64 = 4096;

/// Which identity a [`CertificateProfile`] describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateRole {
  /// Self-signed signing root
  Root,
  /// End-entity certificate for one host
  Leaf(String),
}

/// The fixed extension set for a certificate role.
///
/// Every field maps to exactly one X.509 attribute; [`CertificateProfile::to_params`]
/// compiles it into rcgen parameters.
#[derive(Debug, Clone)]
pub struct CertificateProfile {
  /// Root or leaf
  pub role: CertificateRole,
  /// Subject distinguished name, in push order
  pub subject: Vec<(DnType, String)>,
  /// basicConstraints: `Some(path_len)` marks a CA, `None` an end entity
  pub ca_path_len: Option<u8>,
  /// keyUsage bits
  pub key_usages: Vec<KeyUsagePurpose>,
  /// extendedKeyUsage purposes
  pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
  /// subjectAltName entries
  pub subject_alt_names: Vec<SanType>,
  /// How far before "now" the certificate becomes valid, in seconds
  pub backdate_secs: i64,
  /// How far after "now" the certificate stays valid, in seconds
  pub lifetime_secs: i64,
  /// Emit authorityKeyIdentifier pointing at the issuer
  pub authority_key_identifier: bool,
}

impl CertificateProfile {
  /// Signing root: CA with path length 0, may only sign certificates and
  /// CRLs, valid from five years ago to twenty years ahead.
  pub fn root() -> Self {
    Self {
      role: CertificateRole::Root,
      subject: vec![
        (DnType::CommonName, ROOT_COMMON_NAME.to_string()),
        (DnType::OrganizationName, "VProxy".to_string()),
        (DnType::CountryName, "CN".to_string()),
        (DnType::LocalityName, "Internet".to_string()),
        (DnType::StateOrProvinceName, "World".to_string()),
      ],
      ca_path_len: Some(0),
      key_usages: vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign],
      extended_key_usages: Vec::new(),
      subject_alt_names: Vec::new(),
      backdate_secs: 5 * YEAR,
      lifetime_secs: 20 * YEAR,
      authority_key_identifier: false,
    }
  }

  /// Leaf for `domain`: end entity, server (and client) auth, valid one year
  /// either side of now. IP literals get an IP SAN, anything else a DNS SAN.
  pub fn leaf(domain: &str) -> Result<Self> {
    let san = match domain.parse::<IpAddr>() {
      Ok(ip) => SanType::IpAddress(ip),
      Err(_) => SanType::DnsName(domain.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", domain))
      })?),
    };
    Ok(Self {
      role: CertificateRole::Leaf(domain.to_string()),
      subject: vec![(DnType::CommonName, domain.to_string())],
      ca_path_len: None,
      key_usages: vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
      ],
      extended_key_usages: vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
      ],
      subject_alt_names: vec![san],
      backdate_secs: YEAR,
      lifetime_secs: YEAR,
      authority_key_identifier: true,
    })
  }

  /// Compile into rcgen parameters, anchoring the validity window at `now`.
  pub fn to_params(&self, now: OffsetDateTime) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    for (ty, value) in &self.subject {
      dn.push(ty.clone(), value.as_str());
    }
    params.distinguished_name = dn;

    params.is_ca = match self.ca_path_len {
      Some(len) => IsCa::Ca(BasicConstraints::Constrained(len)),
      None => IsCa::NoCa,
    };
    params.key_usages = self.key_usages.clone();
    params.extended_key_usages = self.extended_key_usages.clone();
    params.subject_alt_names = self.subject_alt_names.clone();
    params.not_before = now - Duration::seconds(self.backdate_secs);
    params.not_after = now + Duration::seconds(self.lifetime_secs);
    params.use_authority_key_identifier_extension = self.authority_key_identifier;
    params
  }
}

/// Root key material plus the leaf cache.
pub struct CertificateAuthority {
  store: Arc<dyn CertStore>,
  /// Root signer; read-only after bootstrap
  issuer: Issuer<'static, KeyPair>,
  root_cert_der: CertificateDer<'static>,
  root_cert_pem: String,
  /// Root SubjectPublicKeyInfo, DER
  root_spki: Vec<u8>,
  leaves: Cache<String, Arc<CertifiedKey>>,
  issued: AtomicUsize,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("leaves", &self.leaves.entry_count())
      .field("issued", &self.issued.load(Ordering::Relaxed))
      .finish()
  }
}

impl CertificateAuthority {
  /// Load the root from `store`, or generate and persist one if absent.
  ///
  /// Any failure here is fatal: without a root nothing can be intercepted.
  pub async fn bootstrap(store: Arc<dyn CertStore>) -> Result<Self> {
    let (issuer, root) = match store.get(ROOT_NAME).await? {
      Some(entry) => {
        tracing::debug!("Loading root CA from store");
        let key_pair = KeyPair::from_pem(&entry.key_pem)
          .map_err(|e| Error::certificate_error(format!("Failed to parse root key: {}", e)))?;
        let cert_der = pem_to_cert_der(&entry.cert_pem)?;
        if !key_matches_cert(&cert_der, &key_pair) {
          return Err(Error::certificate_error(
            "Stored root certificate does not match its private key",
          ));
        }
        let issuer = Issuer::from_ca_cert_pem(&entry.cert_pem, key_pair).map_err(|e| {
          Error::certificate_error(format!("Failed to create issuer from root: {}", e))
        })?;
        (issuer, entry)
      }
      None => {
        tracing::info!("No root CA in store, generating a new one");
        let params = CertificateProfile::root().to_params(OffsetDateTime::now_utc());
        let key_pair = KeyPair::generate()
          .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
        let cert = params
          .self_signed(&key_pair)
          .map_err(|e| Error::certificate_error(format!("Failed to generate root: {}", e)))?;
        let entry = CaEntry::new(ROOT_NAME, cert.pem(), key_pair.serialize_pem());
        store.save(&entry).await?;
        (Issuer::new(params, key_pair), entry)
      }
    };

    let root_cert_der = pem_to_cert_der(&root.cert_pem)?;
    let root_spki = issuer.key().subject_public_key_info();
    let leaves = Cache::builder().max_capacity(LEAF_CACHE_CAPACITY).build();

    Ok(Self {
      store,
      issuer,
      root_cert_der,
      root_cert_pem: root.cert_pem,
      root_spki,
      leaves,
      issued: AtomicUsize::new(0),
    })
  }

  /// Root certificate, DER
  pub fn root_certificate(&self) -> &CertificateDer<'static> {
    &self.root_cert_der
  }

  /// Root certificate, PEM
  pub fn root_cert_pem(&self) -> &str {
    &self.root_cert_pem
  }

  /// Number of leaves generated (not loaded) by this instance
  pub fn issued_count(&self) -> usize {
    self.issued.load(Ordering::Relaxed)
  }

  /// Certificate and key for `domain`, from the store or freshly issued.
  ///
  /// A stored pair that is broken, expired, or signed by some other root is
  /// replaced.
  pub async fn certificate_for(&self, domain: &str) -> Result<CaEntry> {
    let domain = normalize_domain(domain)?;
    self
      .load_or_issue(&domain)
      .await
      .map_err(|e| Error::certificate_unavailable(format!("{}: {}", domain, e)))
  }

  /// Serving identity for `domain`: leaf plus root chain and signing key.
  ///
  /// Concurrent first calls for the same domain share one issuance.
  pub async fn certified_key_for(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
    let domain = normalize_domain(domain)?;
    self
      .leaves
      .try_get_with(domain.clone(), async {
        let entry = self.load_or_issue(&domain).await?;
        self.certified_key(&entry).map(Arc::new)
      })
      .await
      .map_err(|e| Error::certificate_unavailable(format!("{}: {}", domain, e)))
  }

  async fn load_or_issue(&self, domain: &str) -> Result<CaEntry> {
    if let Some(entry) = self.store.get(domain).await? {
      if self.is_usable_leaf(&entry) {
        return Ok(entry);
      }
      tracing::warn!("Stored certificate for {} is unusable, reissuing", domain);
    }
    let entry = self.issue(domain)?;
    self.store.save(&entry).await?;
    Ok(entry)
  }

  fn issue(&self, domain: &str) -> Result<CaEntry> {
    let params = CertificateProfile::leaf(domain)?.to_params(OffsetDateTime::now_utc());
    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign leaf for {}: {}", domain, e)))?;
    self.issued.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("Issued leaf certificate for {}", domain);
    Ok(CaEntry::new(domain, cert.pem(), key_pair.serialize_pem()))
  }

  fn is_usable_leaf(&self, entry: &CaEntry) -> bool {
    let Ok(cert_der) = pem_to_cert_der(&entry.cert_pem) else {
      return false;
    };
    let Ok(key_pair) = KeyPair::from_pem(&entry.key_pem) else {
      return false;
    };
    if !key_matches_cert(&cert_der, &key_pair) {
      return false;
    }
    let Ok((_, cert)) = parse_x509_certificate(&cert_der) else {
      return false;
    };
    let Ok((_, root_key)) = SubjectPublicKeyInfo::from_der(&self.root_spki) else {
      return false;
    };
    cert.validity().is_valid() && cert.verify_signature(Some(&root_key)).is_ok()
  }

  fn certified_key(&self, entry: &CaEntry) -> Result<CertifiedKey> {
    let leaf = pem_to_cert_der(&entry.cert_pem)?;
    let key = rustls_pemfile::private_key(&mut entry.key_pem.as_bytes())?
      .ok_or_else(|| Error::certificate_error("No private key found in PEM"))?;
    let signing_key = any_supported_type(&key)
      .map_err(|e| Error::certificate_error(format!("Unsupported leaf key: {}", e)))?;
    Ok(CertifiedKey::new(
      vec![leaf, self.root_cert_der.clone()],
      signing_key,
    ))
  }

  /// Export the root certificate as PEM and print trust-store instructions.
  ///
  /// Writes to `path`, or `<temp dir>/vproxy-root-ca.crt` when `None`.
  /// Returns the path written.
  pub async fn install_root(&self, path: Option<&Path>) -> Result<PathBuf> {
    let path = path
      .map(Path::to_path_buf)
      .unwrap_or_else(|| std::env::temp_dir().join(ROOT_EXPORT_FILE));
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, self.root_cert_pem.as_bytes()).await?;
    tracing::info!("Root CA certificate exported to {}", path.display());
    println!("{}", install_instructions(&path));
    Ok(path)
  }
}

/// Operator-facing commands to trust the root certificate at `path`.
pub fn install_instructions(path: &Path) -> String {
  let path = path.display();
  format!(
    "Root CA certificate written to {path}\n\
     Trust it on your platform:\n\
     \x20 macOS:          sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {path}\n\
     \x20 Windows:        certmgr /c /add {path} /s root\n\
     \x20 Debian/Ubuntu:  sudo cp {path} /usr/local/share/ca-certificates/vproxy-root-ca.crt && sudo update-ca-certificates"
  )
}

fn normalize_domain(domain: &str) -> Result<String> {
  let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
  if domain.is_empty() || domain == ROOT_NAME {
    return Err(Error::certificate_unavailable(format!(
      "Refusing to issue for {:?}",
      domain
    )));
  }
  Ok(domain)
}

fn pem_to_cert_der(pem: &str) -> Result<CertificateDer<'static>> {
  rustls_pemfile::certs(&mut pem.as_bytes())
    .next()
    .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
    .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))
}

fn key_matches_cert(cert_der: &CertificateDer<'_>, key_pair: &KeyPair) -> bool {
  match parse_x509_certificate(cert_der.as_ref()) {
    Ok((_, cert)) => cert.public_key().raw == key_pair.subject_public_key_info().as_slice(),
    Err(_) => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryCertStore;

  #[test]
  fn test_root_profile() {
    let now = OffsetDateTime::now_utc();
    let params = CertificateProfile::root().to_params(now);
    assert_eq!(params.is_ca, IsCa::Ca(BasicConstraints::Constrained(0)));
    assert!(params.key_usages.contains(&KeyUsagePurpose::KeyCertSign));
    assert!(params.not_before <= now - Duration::days(5 * 365));
    assert!(params.not_after >= now + Duration::days(20 * 365));
  }

  #[test]
  fn test_leaf_profile() {
    let profile = CertificateProfile::leaf("example.com").unwrap();
    let params = profile.to_params(OffsetDateTime::now_utc());
    assert_eq!(params.is_ca, IsCa::NoCa);
    assert!(!params.key_usages.contains(&KeyUsagePurpose::KeyCertSign));
    assert!(params
      .extended_key_usages
      .contains(&ExtendedKeyUsagePurpose::ServerAuth));
    assert_eq!(profile.role, CertificateRole::Leaf("example.com".into()));

    let ip = CertificateProfile::leaf("10.0.0.1").unwrap();
    assert_eq!(
      ip.subject_alt_names,
      vec![SanType::IpAddress("10.0.0.1".parse().unwrap())]
    );
  }

  #[tokio::test]
  async fn test_root_is_reserved() {
    let ca = CertificateAuthority::bootstrap(Arc::new(MemoryCertStore::new()))
      .await
      .unwrap();
    assert!(matches!(
      ca.certificate_for(ROOT_NAME).await,
      Err(Error::CertificateUnavailable(_))
    ));
    assert!(ca.certificate_for("").await.is_err());
  }

  #[tokio::test]
  async fn test_domain_is_normalized() {
    let ca = CertificateAuthority::bootstrap(Arc::new(MemoryCertStore::new()))
      .await
      .unwrap();
    let a = ca.certificate_for("Example.COM.").await.unwrap();
    let b = ca.certificate_for("example.com").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(ca.issued_count(), 1);
  }

  #[tokio::test]
  async fn test_mismatched_stored_leaf_is_reissued() {
    let store = Arc::new(MemoryCertStore::new());
    let ca = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
    let good = ca.certificate_for("pair.example.com").await.unwrap();
    let other = ca.certificate_for("other.example.com").await.unwrap();
    // certificate of one leaf with the key of another
    store
      .save(&CaEntry::new("pair.example.com", good.cert_pem.clone(), other.key_pem))
      .await
      .unwrap();
    let fresh = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
    let reissued = fresh.certificate_for("pair.example.com").await.unwrap();
    assert_ne!(reissued.cert_pem, good.cert_pem);
    assert_eq!(fresh.issued_count(), 1);
    assert_eq!(store.get("pair.example.com").await.unwrap(), Some(reissued));
  }

  #[tokio::test]
  async fn test_leaf_of_foreign_root_is_reissued() {
    let store = Arc::new(MemoryCertStore::new());
    let foreign = CertificateAuthority::bootstrap(Arc::new(MemoryCertStore::new()))
      .await
      .unwrap();
    store
      .save(&foreign.certificate_for("shop.example.com").await.unwrap())
      .await
      .unwrap();
    let ca = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
    assert!(ca.certificate_for("shop.example.com").await.is_ok());
    assert_eq!(ca.issued_count(), 1);
    // a valid stored leaf of the same root is loaded, not reissued
    let again = CertificateAuthority::bootstrap(store).await.unwrap();
    again.certificate_for("shop.example.com").await.unwrap();
    assert_eq!(again.issued_count(), 0);
  }

  #[tokio::test]
  async fn test_root_with_wrong_key_fails_bootstrap() {
    let store = Arc::new(MemoryCertStore::new());
    let ca = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
    let leaf = ca.certificate_for("k.example.com").await.unwrap();
    store
      .save(&CaEntry::new(ROOT_NAME, ca.root_cert_pem(), leaf.key_pem))
      .await
      .unwrap();
    assert!(matches!(
      CertificateAuthority::bootstrap(store).await,
      Err(Error::Certificate(_))
    ));
  }

  #[tokio::test]
  async fn test_root_without_certificate_is_regenerated() {
    let dir = std::env::temp_dir().join(format!("vproxy-ca-{}", rand::random::<u32>()));
    let store = Arc::new(crate::store::FsCertStore::new(&dir));
    let first = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
    // an interrupted root replacement leaves a key and no certificate
    std::fs::remove_file(dir.join(format!("{}.crt", ROOT_NAME))).unwrap();
    std::fs::write(dir.join(format!("{}.key", ROOT_NAME)), "junk").unwrap();
    let second = CertificateAuthority::bootstrap(store.clone()).await.unwrap();
    assert_ne!(first.root_cert_pem(), second.root_cert_pem());
    let third = CertificateAuthority::bootstrap(store).await.unwrap();
    assert_eq!(second.root_cert_pem(), third.root_cert_pem());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn test_install_instructions() {
    let text = install_instructions(Path::new("/tmp/root.crt"));
    assert!(text.contains("security add-trusted-cert"));
    assert!(text.contains("certmgr /c /add /tmp/root.crt /s root"));
    assert!(text.contains("update-ca-certificates"));
  }
}

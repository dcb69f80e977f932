//! Certificate Authority (CA) management
//!
//! [`RootTrust`] holds the locally controlled root key and certificate.
//! [`CertificateAuthority`] forges leaf certificates that impersonate an
//! origin's subject and caches one identity per subject for the life of the
//! process.
//!

use crate::errors::{Error, Result};
use crate::tls::{self, AltName, PeerCertificate, Subject};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::ServerConfig;

/// Forged certificate validity period (1 year)
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Generated root validity period (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Root key and certificate used to sign every forged identity.
pub struct RootTrust {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
  key_pem: String,
}

impl RootTrust {
  /// Build from a PEM private key (PKCS#8) and a PEM X.509 certificate.
  pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse root key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from root cert: {}", e))
    })?;

    // Parse PEM to DER for rustls
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;

    Ok(Self {
      issuer,
      cert_der,
      cert_pem: cert_pem.to_string(),
      key_pem: key_pem.to_string(),
    })
  }

  /// Read the root key and certificate from disk.
  pub async fn load(key_path: impl AsRef<Path>, cert_path: impl AsRef<Path>) -> Result<Self> {
    let (key_path, cert_path) = (key_path.as_ref(), cert_path.as_ref());
    let key_pem = fs::read_to_string(key_path).await.map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", key_path.display(), e))
    })?;
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", cert_path.display(), e))
    })?;
    Self::from_pem(&key_pem, &cert_pem)
  }

  /// Load the root if both files exist, otherwise generate one and write it
  /// out so it can be installed in the client's trust store.
  pub async fn load_or_generate(
    key_path: impl AsRef<Path>,
    cert_path: impl AsRef<Path>,
  ) -> Result<Self> {
    let (key_path, cert_path) = (key_path.as_ref(), cert_path.as_ref());
    match (key_path.exists(), cert_path.exists()) {
      (true, true) => Self::load(key_path, cert_path).await,
      (false, false) => {
        let root = Self::generate("sslproxy Root CA")?;
        root.write(key_path, cert_path).await?;
        tracing::info!(
          cert = %cert_path.display(),
          "generated a new root certificate; install it in the client's trust store"
        );
        Ok(root)
      }
      _ => Err(Error::config_error(format!(
        "root key {} and certificate {} must both exist or both be absent",
        key_path.display(),
        cert_path.display()
      ))),
    }
  }

  /// Generate a fresh self-signed root.
  pub fn generate(common_name: &str) -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "sslproxy");
    params.distinguished_name = dn;
    // Configure as CA
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate root: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let cert_der = cert.der().clone();
    let issuer = Issuer::new(params, key_pair);

    Ok(Self {
      issuer,
      cert_der,
      cert_pem,
      key_pem,
    })
  }

  /// Write the key and certificate as PEM files.
  pub async fn write(&self, key_path: impl AsRef<Path>, cert_path: impl AsRef<Path>) -> Result<()> {
    fs::write(key_path, self.key_pem.as_bytes()).await?;
    fs::write(cert_path, self.cert_pem.as_bytes()).await?;
    Ok(())
  }

  /// Root certificate in PEM format, for client installation
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Root certificate in DER format
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }
}

/// A forged leaf certificate and the TLS server context presenting it.
pub struct ForgedIdentity {
  subject: String,
  cert_der: CertificateDer<'static>,
  server_config: Arc<ServerConfig>,
}

impl ForgedIdentity {
  fn generate(root: &RootTrust, subject: &Subject) -> Result<Self> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    for attr in &subject.attributes {
      dn.push(
        DnType::from_oid(&attr.oid),
        DnValue::Utf8String(attr.value.clone()),
      );
    }
    params.distinguished_name = dn;

    params.subject_alt_names = subject
      .alt_names
      .iter()
      .filter_map(|name| match name {
        AltName::Dns(dns) => dns.clone().try_into().ok().map(SanType::DnsName),
        AltName::Ip(ip) => Some(SanType::IpAddress(*ip)),
      })
      .collect();

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.is_ca = IsCa::ExplicitNoCa;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &root.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign forged cert: {}", e)))?;

    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize forged key"))?;

    let chain = vec![cert_der.clone(), root.cert_der.clone()];
    let server_config = tls::server_config(chain, key_der)?;

    Ok(Self {
      subject: subject.dn.clone(),
      cert_der,
      server_config: Arc::new(server_config),
    })
  }

  /// Subject DN this identity impersonates
  pub fn subject(&self) -> &str {
    &self.subject
  }

  /// Leaf certificate in DER format
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// TLS server context presenting `[leaf, root]`
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

/// Forges and caches identities against a [`RootTrust`].
pub struct CertificateAuthority {
  root: Arc<RootTrust>,
  /// subject DN -> identity; entries live until process exit
  cache: Cache<String, Arc<ForgedIdentity>>,
  issued: AtomicU64,
}

impl CertificateAuthority {
  /// Create a new certificate authority signing with `root`
  pub fn new(root: RootTrust) -> Self {
    Self {
      root: Arc::new(root),
      cache: Cache::builder().build(),
      issued: AtomicU64::new(0),
    }
  }

  /// Forge an identity matching the subject of an origin's certificate.
  pub async fn forge(&self, origin: &PeerCertificate) -> Result<Arc<ForgedIdentity>> {
    self.forge_subject(origin.subject()?).await
  }

  /// Return the cached identity for `subject`, generating it on first use.
  ///
  /// Concurrent first-time calls for the same subject wait on a single
  /// generation and all receive the same identity.
  pub async fn forge_subject(&self, subject: Subject) -> Result<Arc<ForgedIdentity>> {
    let root = self.root.clone();
    let key = subject.dn.clone();
    let dn = subject.dn.clone();
    let init = async move {
      let identity = tokio::task::spawn_blocking(move || ForgedIdentity::generate(&root, &subject))
        .await
        .map_err(|e| Error::Other(format!("certificate generation task failed: {}", e)))??;
      self.issued.fetch_add(1, Ordering::Relaxed);
      tracing::debug!(subject = %identity.subject, "forged certificate");
      Ok::<_, Error>(Arc::new(identity))
    };
    self
      .cache
      .try_get_with(key, init)
      .await
      .map_err(|e| Error::Certificate(format!("forging {} failed: {}", dn, e)))
  }

  /// Number of identities generated so far
  pub fn issued(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }

  /// The root this authority signs with
  pub fn root(&self) -> &RootTrust {
    &self.root
  }

  /// Root certificate in DER format
  pub fn root_cert_der(&self) -> &CertificateDer<'static> {
    self.root.cert_der()
  }

  /// Number of cached identities
  pub fn len(&self) -> u64 {
    self.cache.entry_count()
  }

  /// No identity has been cached yet
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tls::SubjectAttribute;
  use x509_parser::prelude::{FromDer, X509Certificate};

  fn subject(cn: &str) -> Subject {
    Subject {
      dn: format!("CN={}, O=Example Corp", cn),
      attributes: vec![
        SubjectAttribute {
          oid: vec![2, 5, 4, 3],
          value: cn.to_string(),
        },
        SubjectAttribute {
          oid: vec![2, 5, 4, 10],
          value: "Example Corp".to_string(),
        },
      ],
      alt_names: vec![AltName::Dns(cn.to_string())],
    }
  }

  fn authority() -> CertificateAuthority {
    CertificateAuthority::new(RootTrust::generate("Test Root").unwrap())
  }

  #[tokio::test]
  async fn forged_cert_matches_root_and_subject() {
    let ca = authority();
    let identity = ca.forge_subject(subject("example.com")).await.unwrap();

    let (_, root) = X509Certificate::from_der(ca.root().cert_der().as_ref()).unwrap();
    let (_, leaf) = X509Certificate::from_der(identity.cert_der().as_ref()).unwrap();

    assert_eq!(leaf.issuer().to_string(), root.subject().to_string());
    assert!(leaf.subject().to_string().contains("CN=example.com"));
    assert!(leaf.subject().to_string().contains("O=Example Corp"));

    let validity = leaf.validity();
    let lifetime = validity.not_after.to_datetime() - validity.not_before.to_datetime();
    assert!((lifetime - Duration::days(365)).abs() <= Duration::days(1));

    leaf
      .verify_signature(Some(root.public_key()))
      .expect("forged cert must verify against the root key");

    let key_usage = leaf.key_usage().unwrap().expect("keyUsage present");
    assert!(key_usage.critical);
    assert!(key_usage.value.digital_signature());
    let constraints = leaf
      .basic_constraints()
      .unwrap()
      .expect("basicConstraints present");
    assert!(!constraints.value.ca);
  }

  #[tokio::test]
  async fn same_subject_hits_cache() {
    let ca = authority();
    assert!(ca.is_empty());
    let first = ca.forge_subject(subject("example.com")).await.unwrap();
    let second = ca.forge_subject(subject("example.com")).await.unwrap();
    assert_eq!(first.cert_der(), second.cert_der());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(ca.issued(), 1);

    let other = ca.forge_subject(subject("example.org")).await.unwrap();
    assert_ne!(first.cert_der(), other.cert_der());
    assert_eq!(ca.issued(), 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_first_forge_generates_once() {
    let ca = Arc::new(authority());
    let tasks = (0..16).map(|_| {
      let ca = ca.clone();
      tokio::spawn(async move { ca.forge_subject(subject("race.example")).await.unwrap() })
    });
    let identities = futures::future::join_all(tasks).await;
    let first = identities[0].as_ref().unwrap().clone();
    for identity in identities {
      assert!(Arc::ptr_eq(&first, &identity.unwrap()));
    }
    assert_eq!(ca.issued(), 1);
    ca.cache.run_pending_tasks().await;
    assert_eq!(ca.len(), 1);
  }

  #[test]
  fn root_round_trips_through_pem() {
    let root = RootTrust::generate("Round Trip Root").unwrap();
    let loaded = RootTrust::from_pem(&root.key_pem, root.cert_pem()).unwrap();
    assert_eq!(loaded.cert_der(), root.cert_der());
  }

  #[test]
  fn bad_root_material_is_rejected() {
    assert!(matches!(
      RootTrust::from_pem("not a key", "not a cert"),
      Err(Error::Certificate(_))
    ));
  }

  #[tokio::test]
  async fn load_or_generate_writes_and_reloads() {
    let dir = std::env::temp_dir().join(format!("sslproxy-root-{}", rand::random::<u32>()));
    std::fs::create_dir_all(&dir).unwrap();
    let key = dir.join("root.key");
    let cert = dir.join("root.pem");

    let generated = RootTrust::load_or_generate(&key, &cert).await.unwrap();
    assert!(key.exists() && cert.exists());
    let reloaded = RootTrust::load_or_generate(&key, &cert).await.unwrap();
    assert_eq!(generated.cert_der(), reloaded.cert_der());

    std::fs::remove_file(&key).unwrap();
    assert!(matches!(
      RootTrust::load_or_generate(&key, &cert).await,
      Err(Error::Config(_))
    ));

    std::fs::remove_dir_all(&dir).ok();
  }
}

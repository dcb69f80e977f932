//! TLS configuration and types
//!
use crate::errors::{Error, Result};
use crate::socket::Socket;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Leaf certificate presented by a peer during a client-side handshake.
#[derive(Clone, Debug)]
pub struct PeerCertificate {
  pub(crate) inner: CertificateDer<'static>,
}

/// One subject attribute, kept as its OID arcs so it can be re-encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectAttribute {
  /// OID arcs, e.g. `[2, 5, 4, 3]` for commonName
  pub oid: Vec<u64>,
  /// Attribute value
  pub value: String,
}

/// Alternative names copied from an origin certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AltName {
  /// dNSName entry
  Dns(String),
  /// iPAddress entry
  Ip(IpAddr),
}

/// What the forger needs to know about an origin certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
  /// RFC 4514 rendering of the subject DN, used as the cache key
  pub dn: String,
  /// Attributes in certificate order
  pub attributes: Vec<SubjectAttribute>,
  /// subjectAltName entries
  pub alt_names: Vec<AltName>,
}

impl PeerCertificate {
  /// Wrap a DER encoded certificate.
  pub fn from_der(der: impl Into<CertificateDer<'static>>) -> Self {
    PeerCertificate { inner: der.into() }
  }

  /// Parse the subject and alternative names out of the certificate.
  pub fn subject(&self) -> Result<Subject> {
    let (_, cert) = X509Certificate::from_der(self.inner.as_ref())
      .map_err(|e| Error::certificate_error(format!("Failed to parse peer certificate: {}", e)))?;
    let mut attributes = Vec::new();
    for attr in cert.subject().iter_attributes() {
      let oid = match attr.attr_type().iter() {
        Some(arcs) => arcs.collect::<Vec<u64>>(),
        None => continue,
      };
      if let Ok(value) = attr.as_str() {
        attributes.push(SubjectAttribute {
          oid,
          value: value.to_string(),
        });
      }
    }
    let mut alt_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
      for name in &san.value.general_names {
        match name {
          GeneralName::DNSName(dns) => alt_names.push(AltName::Dns(dns.to_string())),
          GeneralName::IPAddress(bytes) => {
            if let Some(ip) = ip_from_bytes(bytes) {
              alt_names.push(AltName::Ip(ip));
            }
          }
          _ => {}
        }
      }
    }
    Ok(Subject {
      dn: cert.subject().to_string(),
      attributes,
      alt_names,
    })
  }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
  match bytes.len() {
    4 => {
      let octets: [u8; 4] = bytes.try_into().ok()?;
      Some(IpAddr::V4(Ipv4Addr::from(octets)))
    }
    16 => {
      let octets: [u8; 16] = bytes.try_into().ok()?;
      Some(IpAddr::V6(Ipv6Addr::from(octets)))
    }
    _ => None,
  }
}

/// Accepts whatever the origin presents: the proxy only needs to learn the
/// origin's identity, the client is the one that decides whom to trust.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

/// Client config used to dial origins.
pub(crate) fn origin_connector() -> Result<TlsConnector> {
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let config = rustls::ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Other(format!("invalid TLS versions: {}", e)))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  Ok(TlsConnector::from(Arc::new(config)))
}

/// Create TLS server configuration
pub(crate) fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  rustls::ServerConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Other(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::certificate_error(format!("Failed to create TLS config: {}", e)))
}

/// Run the client-side handshake over `socket`, returning the TLS socket and
/// the origin's leaf certificate.
pub(crate) async fn connect(
  connector: &TlsConnector,
  socket: Socket,
  host: &str,
) -> Result<(Socket, PeerCertificate)> {
  let domain = ServerName::try_from(host.to_owned())
    .map_err(|e| Error::handshake_error(format!("invalid server name {}: {}", host, e)))?;
  let connector = connector.clone();
  let mut peer = None;
  let slot = &mut peer;
  let socket = socket
    .upgrade(move |stream| async move {
      let tls = connector.connect(domain, stream).await?;
      *slot = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| PeerCertificate::from_der(cert.clone().into_owned()));
      Ok::<_, std::io::Error>(tls)
    })
    .await
    .map_err(|e| Error::handshake_error(format!("{} (client role, {})", e, host)))?;
  let peer = peer
    .ok_or_else(|| Error::handshake_error(format!("{} presented no certificate", host)))?;
  Ok((socket, peer))
}

/// Wrap `socket` as a TLS server endpoint and complete the handshake.
pub async fn accept(config: Arc<rustls::ServerConfig>, socket: Socket) -> Result<Socket> {
  let acceptor = TlsAcceptor::from(config);
  socket
    .upgrade(|stream| acceptor.accept(stream))
    .await
    .map_err(|e| Error::handshake_error(format!("{} (server role)", e)))
}

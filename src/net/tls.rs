//! TLS and mTLS configuration for outbound channels.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TLS Configuration                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │   SecurityProfile  - Named, serializable profile            │
//! │   TlsIdentity      - Loaded client certificate chain + key  │
//! │   TrustStore       - Loaded CA bundle                       │
//! │   TlsClientBuilder - Builds rustls ClientConfig             │
//! │   SecurityContext  - What a Connector receives              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A profile is either plaintext or TLS. TLS profiles verify the server against a
//! CA bundle, or trust every certificate (development only). Supplying a client
//! certificate and key turns on mutual TLS.

use crate::core::error::{ClientError, ClientResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// ALPN protocol for gRPC.
pub const ALPN_H2: &[u8] = b"h2";

/// TLS version enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    /// TLS 1.2
    #[default]
    Tls12,
    /// TLS 1.3
    Tls13,
}

/// Security profile shared by one or more endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    /// Use TLS. When false every other field is ignored.
    #[serde(default)]
    pub tls: bool,

    /// CA bundle used to verify servers.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Accept any server certificate.
    #[serde(default)]
    pub trust_all: bool,

    /// Client certificate chain for mutual TLS.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// Client private key for mutual TLS.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Override the name used for SNI and certificate verification.
    #[serde(default)]
    pub server_name: Option<String>,

    /// Minimum protocol version.
    #[serde(default)]
    pub min_tls_version: TlsVersion,
}

impl SecurityProfile {
    /// A plaintext profile.
    pub fn plaintext() -> Self {
        Self::default()
    }

    /// A TLS profile verifying servers against `ca_file`.
    pub fn tls_with_ca(ca_file: impl Into<PathBuf>) -> Self {
        Self {
            tls: true,
            ca_file: Some(ca_file.into()),
            ..Self::default()
        }
    }

    /// A TLS profile that accepts any server certificate.
    pub fn tls_trust_all() -> Self {
        Self {
            tls: true,
            trust_all: true,
            ..Self::default()
        }
    }

    /// Enable mutual TLS with the given client identity.
    pub fn with_identity(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    /// Override the server name.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the minimum TLS version.
    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_tls_version = version;
        self
    }

    /// Check if this profile uses mutual TLS.
    pub fn is_mtls(&self) -> bool {
        self.tls && self.cert_file.is_some()
    }

    /// Files whose contents feed the built context, for change detection.
    pub fn watched_files(&self) -> Vec<&Path> {
        if !self.tls {
            return Vec::new();
        }
        [&self.ca_file, &self.cert_file, &self.key_file]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect()
    }

    /// Validate profile consistency without touching the filesystem.
    pub fn validate(&self) -> ClientResult<()> {
        if !self.tls {
            return Ok(());
        }
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) => return Err(ClientError::tls("key_file required when cert_file is set")),
            (None, Some(_)) => return Err(ClientError::tls("cert_file required when key_file is set")),
            _ => {}
        }
        if self.ca_file.is_none() && !self.trust_all {
            return Err(ClientError::tls("tls profile needs ca_file or trust_all"));
        }
        Ok(())
    }

    /// Load material and build the context handed to connectors.
    pub fn build(&self, name: &str) -> ClientResult<SecurityContext> {
        self.validate()?;
        if !self.tls {
            return Ok(SecurityContext::plaintext(name));
        }

        let mut builder = TlsClientBuilder::new().min_version(self.min_tls_version);
        builder = match &self.ca_file {
            Some(ca) if !self.trust_all => builder.server_ca(TrustStore::load(ca)?),
            _ => builder.trust_all(),
        };
        if let (Some(cert), Some(key)) = (&self.cert_file, &self.key_file) {
            builder = builder.identity(TlsIdentity::load(cert, key)?);
        }
        let config = builder.build()?;

        Ok(SecurityContext {
            profile: name.to_string(),
            tls: Some(Arc::new(config)),
            server_name: self.server_name.clone(),
        })
    }
}

/// Built security material for one profile.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    /// Profile name the context was built from.
    pub profile: String,
    /// rustls configuration; `None` for plaintext.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// SNI / verification name override.
    pub server_name: Option<String>,
}

impl SecurityContext {
    /// A plaintext context.
    pub fn plaintext(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            tls: None,
            server_name: None,
        }
    }

    /// Check if the context uses TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// Loaded client identity (certificate chain + private key).
#[derive(Debug)]
pub struct TlsIdentity {
    /// Certificate chain.
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key.
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load a TLS identity from PEM files.
    pub fn load(cert_chain_path: &Path, key_path: &Path) -> ClientResult<Self> {
        let cert_chain = load_certs(cert_chain_path)?;
        if cert_chain.is_empty() {
            return Err(ClientError::tls(format!(
                "no certificates in {}",
                cert_chain_path.display()
            )));
        }
        let pem = read_file(key_path)?;
        let key = rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| ClientError::tls(format!("bad private key {}: {}", key_path.display(), e)))?
            .ok_or_else(|| ClientError::tls(format!("no private key in {}", key_path.display())))?;
        Ok(Self { cert_chain, key })
    }
}

/// Trust store for CA certificates.
#[derive(Debug, Clone)]
pub struct TrustStore {
    /// CA certificates.
    pub certs: Vec<CertificateDer<'static>>,
}

impl TrustStore {
    /// Load a trust store from a PEM CA bundle.
    pub fn load(ca_path: &Path) -> ClientResult<Self> {
        let certs = load_certs(ca_path)?;
        if certs.is_empty() {
            return Err(ClientError::tls(format!(
                "no certificates in CA bundle {}",
                ca_path.display()
            )));
        }
        Ok(Self { certs })
    }

    /// Number of certificates loaded.
    pub fn cert_count(&self) -> usize {
        self.certs.len()
    }
}

fn read_file(path: &Path) -> ClientResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| ClientError::tls(format!("failed to read {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> ClientResult<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::tls(format!("bad certificate {}: {}", path.display(), e)))
}

#[derive(Debug)]
enum ServerTrust {
    Roots(TrustStore),
    Any,
}

/// Builder for rustls client configuration.
#[derive(Debug)]
pub struct TlsClientBuilder {
    /// Client identity (for mTLS).
    identity: Option<TlsIdentity>,
    /// How to verify the server.
    trust: ServerTrust,
    /// Minimum TLS version.
    min_version: TlsVersion,
}

impl TlsClientBuilder {
    /// Create a new TLS client builder trusting nothing.
    pub fn new() -> Self {
        Self {
            identity: None,
            trust: ServerTrust::Roots(TrustStore { certs: Vec::new() }),
            min_version: TlsVersion::Tls12,
        }
    }

    /// Set the client identity for mTLS.
    pub fn identity(mut self, identity: TlsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the server CA trust store.
    pub fn server_ca(mut self, trust_store: TrustStore) -> Self {
        self.trust = ServerTrust::Roots(trust_store);
        self
    }

    /// Accept any server certificate.
    pub fn trust_all(mut self) -> Self {
        self.trust = ServerTrust::Any;
        self
    }

    /// Set minimum TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Build the rustls client configuration with ALPN `h2`.
    pub fn build(self) -> ClientResult<rustls::ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions: &[&'static rustls::SupportedProtocolVersion] = match self.min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .map_err(|e| ClientError::tls(e.to_string()))?;

        let builder = match self.trust {
            ServerTrust::Roots(store) => {
                let mut roots = RootCertStore::empty();
                for cert in store.certs {
                    roots
                        .add(cert)
                        .map_err(|e| ClientError::tls(format!("bad CA certificate: {}", e)))?;
                }
                builder.with_root_certificates(roots)
            }
            ServerTrust::Any => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier { provider })),
        };

        let mut config = match self.identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert_chain, identity.key)
                .map_err(|e| ClientError::tls(format!("bad client identity: {}", e)))?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(config)
    }
}

impl Default for TlsClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts every server certificate but still checks handshake signatures.
#[derive(Debug)]
struct TrustAllVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_profile_builds_without_tls() {
        let ctx = SecurityProfile::plaintext().build("default").unwrap();
        assert!(!ctx.is_tls());
        assert_eq!(ctx.profile, "default");
    }

    #[test]
    fn test_trust_all_profile_builds() {
        let ctx = SecurityProfile::tls_trust_all()
            .with_server_name("kv.internal")
            .build("dev")
            .unwrap();
        let tls = ctx.tls.as_ref().expect("tls config");
        assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(ctx.server_name.as_deref(), Some("kv.internal"));
    }

    #[test]
    fn test_tls_requires_trust_source() {
        let profile = SecurityProfile {
            tls: true,
            ..SecurityProfile::default()
        };
        assert!(matches!(profile.validate(), Err(ClientError::Tls { .. })));
    }

    #[test]
    fn test_half_identity_rejected() {
        let mut profile = SecurityProfile::tls_trust_all();
        profile.cert_file = Some(PathBuf::from("client.pem"));
        assert!(profile.validate().is_err());
        assert!(!SecurityProfile::plaintext().is_mtls());
    }

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let err = SecurityProfile::tls_with_ca("/nonexistent/ca.pem")
            .build("prod")
            .unwrap_err();
        assert!(matches!(err, ClientError::Tls { .. }));
    }

    #[test]
    fn test_empty_ca_bundle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, b"not a certificate\n").unwrap();
        assert!(TrustStore::load(&path).is_err());
    }

    #[test]
    fn test_watched_files() {
        let profile = SecurityProfile::tls_with_ca("ca.pem").with_identity("c.pem", "k.pem");
        assert_eq!(profile.watched_files().len(), 3);
        assert!(profile.is_mtls());
        assert!(SecurityProfile::plaintext().watched_files().is_empty());
    }
}

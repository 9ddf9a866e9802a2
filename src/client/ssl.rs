//! TLS settings shared by the HTTP client and WebSocket connections
//!
//! Certificates are checked against the system store (falling back to the
//! bundled webpki roots for WebSockets), plus any extra PEM roots given here.
//! Only TLS 1.2 and 1.3 are available through rustls.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::ClientConfig;
use tracing::warn;

use crate::errors::{PulsewireError, Result};

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// TLS protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// Auto-negotiate
    #[default]
    Auto,
    Tls1_2,
    Tls1_3,
}

impl TlsVersion {
    /// Parse a TLS version string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(TlsVersion::Auto),
            "tls1.2" | "tlsv1.2" => Some(TlsVersion::Tls1_2),
            "tls1.3" | "tlsv1.3" => Some(TlsVersion::Tls1_3),
            _ => None,
        }
    }

    /// Get the minimum TLS version for reqwest
    pub fn min_tls_version(&self) -> Option<reqwest::tls::Version> {
        match self {
            TlsVersion::Auto => None,
            TlsVersion::Tls1_2 => Some(reqwest::tls::Version::TLS_1_2),
            TlsVersion::Tls1_3 => Some(reqwest::tls::Version::TLS_1_3),
        }
    }

    fn rustls_versions(&self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls1_3 => TLS13_ONLY,
            TlsVersion::Auto | TlsVersion::Tls1_2 => rustls::ALL_VERSIONS,
        }
    }
}

/// TLS configuration options
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub min_version: TlsVersion,
    /// Whether to verify server certificates
    pub verify: bool,
    /// Extra trusted roots, DER-encoded
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Auto,
            verify: true,
            extra_roots: Vec::new(),
        }
    }
}

impl TlsSettings {
    /// Trust every certificate in a PEM bundle
    pub fn add_pem_bundle(&mut self, pem: &[u8]) -> Result<()> {
        let mut reader = std::io::BufReader::new(pem);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| PulsewireError::Config(format!("Failed to parse CA bundle: {}", e)))?;
            self.extra_roots.push(cert);
            added += 1;
        }
        if added == 0 {
            return Err(PulsewireError::Config("CA bundle contains no certificates".to_string()));
        }
        Ok(())
    }

    /// Apply to a reqwest ClientBuilder
    pub fn apply_to_builder(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder> {
        if let Some(min_version) = self.min_version.min_tls_version() {
            builder = builder.min_tls_version(min_version);
        }
        if !self.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        for cert in &self.extra_roots {
            let cert = reqwest::Certificate::from_der(cert)
                .map_err(|e| PulsewireError::Config(format!("Failed to load CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(builder)
    }

    /// Client config for WebSocket connections
    pub fn rustls_config(&self) -> Arc<ClientConfig> {
        // More than one provider may be compiled in; an existing default wins
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let builder = ClientConfig::builder_with_protocol_versions(self.min_version.rustls_versions());

        let config = if !self.verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            if !native.errors.is_empty() {
                warn!(errors = native.errors.len(), "some native certificates could not be loaded");
            }
            for cert in native.certs {
                root_store.add(cert).ok();
            }
            if root_store.is_empty() {
                root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            for cert in &self.extra_roots {
                root_store.add(cert.clone()).ok();
            }
            builder.with_root_certificates(root_store).with_no_client_auth()
        };

        Arc::new(config)
    }
}

/// Certificate verifier that accepts all certificates (insecure)
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

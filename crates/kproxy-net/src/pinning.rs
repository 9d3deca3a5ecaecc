//! Certificate Pinning
//!
//! Every certificate chain goes through webpki root verification. For the
//! pinned host the end-entity certificate's SubjectPublicKeyInfo must also
//! hash (SHA-256) to the configured pin.
//!
//! Pins are written `sha256/<base64>` for display; parsing also accepts
//! the bare base64 form and 64 hex characters.

use crate::client::HttpError;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use x509_parser::prelude::*;

const PIN_PREFIX: &str = "sha256/";

/// SHA-256 hash of a certificate's SubjectPublicKeyInfo
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertificatePin([u8; 32]);

impl CertificatePin {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse `sha256/<base64>`, bare base64, or hex
    pub fn parse(s: &str) -> Result<Self, PinError> {
        let s = s.trim();
        let s = s.strip_prefix(PIN_PREFIX).unwrap_or(s);

        let bytes = if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            hex::decode(s).map_err(|e| PinError::Encoding(e.to_string()))?
        } else {
            BASE64
                .decode(s)
                .map_err(|e| PinError::Encoding(e.to_string()))?
        };

        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PinError::Length(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Compute the pin of a DER-encoded certificate
    pub fn from_certificate(der: &[u8]) -> Result<Self, PinError> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|_| PinError::BadCertificate)?;

        let digest = Sha256::digest(cert.public_key().raw);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CertificatePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PIN_PREFIX, BASE64.encode(self.0))
    }
}

impl fmt::Debug for CertificatePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificatePin({})", self)
    }
}

impl std::str::FromStr for CertificatePin {
    type Err = PinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Pin parsing errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PinError {
    #[error("Invalid pin encoding: {0}")]
    Encoding(String),

    #[error("Invalid pin length (expected 32 bytes, got {0})")]
    Length(usize),

    #[error("Certificate could not be parsed")]
    BadCertificate,
}

/// Webpki verifier that additionally enforces a pin for one host
#[derive(Debug)]
pub struct PinnedVerifier {
    host: ServerName<'static>,
    pin: CertificatePin,
    inner: Arc<WebPkiServerVerifier>,
}

impl PinnedVerifier {
    pub fn new(host: &str, pin: CertificatePin, roots: Arc<RootCertStore>) -> Result<Self, HttpError> {
        let host = ServerName::try_from(host.to_string())
            .map_err(|_| HttpError::TlsError(format!("Invalid pinned host: {}", host)))?;
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| HttpError::TlsError(e.to_string()))?;

        Ok(Self { host, pin, inner })
    }

    fn applies_to(&self, server_name: &ServerName<'_>) -> bool {
        self.host == server_name.to_owned()
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let verified = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        if !self.applies_to(server_name) {
            return Ok(verified);
        }

        let presented = CertificatePin::from_certificate(end_entity.as_ref())
            .map_err(|_| Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;

        if presented == self.pin {
            Ok(verified)
        } else {
            warn!(
                "Certificate pin mismatch for {:?}: expected {}, got {}",
                server_name, self.pin, presented
            );
            Err(Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Root store with the bundled webpki roots
pub fn webpki_roots() -> Arc<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(root_store)
}

/// Client TLS configuration, pinned to `host` when a pin is given
pub fn tls_config(pin: Option<(&str, CertificatePin)>) -> Result<Arc<ClientConfig>, HttpError> {
    let roots = webpki_roots();

    let config = match pin {
        Some((host, pin)) => {
            let verifier = PinnedVerifier::new(host, pin, roots)?;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth()
        }
        None => ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

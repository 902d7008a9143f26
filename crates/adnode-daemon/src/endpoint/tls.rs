//! TLS server configuration from the provisioned `cert.pem` / `key.pem`,
//! plus loading of pinned root certificates for outbound update calls.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use zeroize::Zeroizing;

/// TLS setup failures.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The certificate chain is empty or malformed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The private key is missing or malformed.
    #[error("private key error: {0}")]
    PrivateKey(String),

    /// rustls rejected the certificate/key pair.
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Builds a server config from PEM bytes.
///
/// # Errors
///
/// Returns an error if either PEM input is invalid or the key does not
/// match the certificate.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = certificates_from_pem(cert_pem)?;
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Parses every certificate in a PEM bundle.
///
/// # Errors
///
/// Returns [`TlsError::Certificate`] if the bundle is malformed or empty.
pub fn certificates_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("no certificates found".into()));
    }
    Ok(certs)
}

/// Reads a PEM bundle of root certificates.
///
/// # Errors
///
/// Returns an error if the file is unreadable or holds no certificate.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    certificates_from_pem(&pem)
}

/// Loads the certificate chain and key from disk.
///
/// # Errors
///
/// Returns an error if either file is unreadable or invalid.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_pem = std::fs::read(cert_path).map_err(|source| TlsError::Read {
        path: cert_path.display().to_string(),
        source,
    })?;
    let key_pem = Zeroizing::new(std::fs::read(key_path).map_err(|source| TlsError::Read {
        path: key_path.display().to_string(),
        source,
    })?);
    Ok(TlsAcceptor::from(server_config_from_pem(&cert_pem, &key_pem)?))
}

//! TLS acceptor for the RPC listener.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use super::ServerError;

/// Build an acceptor from PEM certificate chain and key files.
pub fn load_acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor, ServerError> {
    let cert_pem = std::fs::read(certfile)
        .map_err(|e| ServerError::Tls(format!("failed to read {}: {}", certfile.display(), e)))?;
    let key_pem = std::fs::read(keyfile)
        .map_err(|e| ServerError::Tls(format!("failed to read {}: {}", keyfile.display(), e)))?;
    acceptor_from_pem(&cert_pem, &key_pem)
}

/// Build an acceptor from in-memory PEM data.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, ServerError> {
    let certs = parse_certificates(cert_pem)?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificates found".into()));
    }
    let key = parse_private_key(key_pem)?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(format!("protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("server config error: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ServerError> {
    PrivateKeyDer::from_pem_slice(pem).map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use std::io::Write;

    fn self_signed() -> (String, String) {
        let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn test_acceptor_from_files() {
        let (cert, key) = self_signed();
        let mut certfile = tempfile::NamedTempFile::new().unwrap();
        certfile.write_all(cert.as_bytes()).unwrap();
        let mut keyfile = tempfile::NamedTempFile::new().unwrap();
        keyfile.write_all(key.as_bytes()).unwrap();

        assert!(load_acceptor(certfile.path(), keyfile.path()).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = load_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("cert.pem"));
    }

    #[test]
    fn test_empty_certificate_pem_rejected() {
        let (_, key) = self_signed();
        assert!(acceptor_from_pem(b"", key.as_bytes()).is_err());
    }

    #[test]
    fn test_missing_key_rejected() {
        let (cert, _) = self_signed();
        assert!(acceptor_from_pem(cert.as_bytes(), cert.as_bytes()).is_err());
    }
}

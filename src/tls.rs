//! TLS material loading.
//!
//! Certificate and key are loaded once at server construction. Every
//! failure mode — missing paths, unreadable files, invalid material, an
//! unsupported passphrase — disables TLS with a warning rather than
//! failing the server.
use std::sync::Arc;

use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig as TlsServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::{ServerConfig, Verbosity};

pub(crate) fn load_acceptor(config: &ServerConfig) -> Option<TlsAcceptor> {
    let (cert_path, key_path) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => (cert_path, key_path),
        _ => {
            if config.logs(Verbosity::Debug) {
                debug!("no private key or certificate file path given, TLS disabled");
            }
            return None;
        }
    };

    let cert_bytes = match std::fs::read(cert_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            if config.logs(Verbosity::Warning) {
                warn!(
                    "failed to open TLS certificate file {} ({}), disabling TLS",
                    cert_path.display(),
                    err
                );
            }
            return None;
        }
    };
    let certs: Vec<Certificate> = match rustls_pemfile::certs(&mut &cert_bytes[..]) {
        Ok(certs) if !certs.is_empty() => certs.into_iter().map(Certificate).collect(),
        _ => {
            if config.logs(Verbosity::Warning) {
                warn!(
                    "invalid TLS certificate file {}, disabling TLS",
                    cert_path.display()
                );
            }
            return None;
        }
    };

    let key_bytes = match std::fs::read(key_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            if config.logs(Verbosity::Warning) {
                warn!(
                    "failed to open private TLS key file {} ({}), disabling TLS",
                    key_path.display(),
                    err
                );
            }
            return None;
        }
    };
    let key = match private_key(&key_bytes) {
        Some(key) => key,
        None => {
            if config.logs(Verbosity::Warning) {
                if config.tls_key_passphrase.is_some() {
                    warn!(
                        "unable to load private TLS key {}: encrypted PEM keys are not supported, disabling TLS",
                        key_path.display()
                    );
                } else {
                    warn!(
                        "invalid private TLS key {}, disabling TLS",
                        key_path.display()
                    );
                }
            }
            return None;
        }
    };

    // Safe defaults restrict protocols to TLS 1.2 and newer; the server
    // does not verify clients.
    let tls_config = TlsServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key);
    match tls_config {
        Ok(tls_config) => {
            if config.logs(Verbosity::Debug) {
                debug!("successfully set up TLS configuration, HTTPS enabled");
            }
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        Err(err) => {
            if config.logs(Verbosity::Warning) {
                warn!("invalid TLS material ({}), disabling TLS", err);
            }
            None
        }
    }
}

fn private_key(key_bytes: &[u8]) -> Option<PrivateKey> {
    if let Ok(mut keys) = rustls_pemfile::pkcs8_private_keys(&mut &key_bytes[..]) {
        if !keys.is_empty() {
            return Some(PrivateKey(keys.remove(0)));
        }
    }
    if let Ok(mut keys) = rustls_pemfile::rsa_private_keys(&mut &key_bytes[..]) {
        if !keys.is_empty() {
            return Some(PrivateKey(keys.remove(0)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::load_acceptor;
    use crate::config::ServerConfig;

    #[test]
    fn absent_paths_disable_tls() {
        let config = ServerConfig::default();
        assert!(load_acceptor(&config).is_none());
    }

    #[test]
    fn missing_files_disable_tls() {
        let config = ServerConfig {
            tls_cert_path: Some("/no/such/cert.pem".into()),
            tls_key_path: Some("/no/such/key.pem".into()),
            ..ServerConfig::default()
        };
        assert!(load_acceptor(&config).is_none());
    }

    #[test]
    fn invalid_material_disables_tls() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let config = ServerConfig {
            tls_cert_path: Some(cert),
            tls_key_path: Some(key),
            ..ServerConfig::default()
        };
        assert!(load_acceptor(&config).is_none());
    }
}

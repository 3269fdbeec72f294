//! TLS connector setup
//!
//! Loads the CA bundle and optional client certificate from PEM files and
//! builds the connector used by `mqtts` links.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::LinkError;
use crate::config::BridgeTlsConfig;

/// A ready-to-use TLS connector plus the name to verify the server against
#[derive(Clone)]
pub struct TlsSettings {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsSettings {
    /// Build settings from configuration. The server name defaults to `host`.
    pub fn from_config(config: &BridgeTlsConfig, host: &str) -> Result<Self, LinkError> {
        let roots = load_ca_certs(&config.ca_cert)?;
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let client_config = match (&config.client_cert, &config.client_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| LinkError::Tls(format!("Invalid client certificate: {}", e)))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(LinkError::InvalidConfig(
                    "client_cert and client_key must be set together".to_string(),
                ))
            }
        };

        let name = config.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|e| LinkError::InvalidConfig(format!("Invalid server name: {}", e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }
}

fn open(path: &str) -> Result<BufReader<File>, LinkError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| LinkError::Tls(format!("Failed to open {}: {}", path, e)))
}

/// Load certificates from a PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, LinkError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LinkError::Tls(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(LinkError::Tls(format!("No certificates found in {}", path)));
    }

    Ok(certs)
}

/// Load private key from a PEM file
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, LinkError> {
    PrivateKeyDer::from_pem_reader(open(path)?)
        .map_err(|e| LinkError::Tls(format!("Failed to parse private key: {}", e)))
}

/// Load CA certificates into a root store
fn load_ca_certs(path: &str) -> Result<RootCertStore, LinkError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .map_err(|e| LinkError::Tls(format!("Failed to add CA certificate: {}", e)))?;
    }
    Ok(root_store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tls_config(ca_cert: &str) -> BridgeTlsConfig {
        BridgeTlsConfig {
            ca_cert: ca_cert.to_string(),
            client_cert: None,
            client_key: None,
            server_name: None,
        }
    }

    #[test]
    fn test_missing_ca_file() {
        let err = TlsSettings::from_config(&tls_config("/nonexistent/ca.pem"), "host").unwrap_err();
        assert!(matches!(err, LinkError::Tls(msg) if msg.contains("Failed to open")));
    }

    #[test]
    fn test_empty_ca_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let path = file.path().to_str().unwrap();
        let err = TlsSettings::from_config(&tls_config(path), "host").unwrap_err();
        assert!(matches!(err, LinkError::Tls(msg) if msg.contains("No certificates")));
    }
}

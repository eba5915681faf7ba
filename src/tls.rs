//! Mutual-TLS identity shared by every node.
//!
//! A symmetric setup: one CA signs a server certificate and a client
//! certificate, and every node presents both sides. Outbound connections
//! verify the fixed server name `orange-bot` against the CA; inbound
//! connections require a client certificate signed by the same CA.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Result, SyncError};

/// Server name every certificate is issued for and every client checks.
pub const SERVER_NAME: &str = "orange-bot";

pub const CA_CERT: &str = "ca.crt";
pub const SERVER_CERT: &str = "orange-bot.crt";
pub const SERVER_KEY: &str = "orange-bot.key";
pub const CLIENT_CERT: &str = "orange-bot-client.crt";
pub const CLIENT_KEY: &str = "orange-bot-client.key";

/// Credentials bundle handed to the sync handler at startup.
#[derive(Debug)]
pub struct TlsIdentity {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
}

impl TlsIdentity {
    /// Load the five PEM files from `dir`. Any failure here is fatal to
    /// startup; there is no point running the mesh unauthenticated.
    pub fn load(dir: &Path) -> Result<Self> {
        ensure_crypto_provider();

        let ca = load_certs(&dir.join(CA_CERT))?;
        let mut roots = RootCertStore::empty();
        for cert in ca {
            roots
                .add(cert)
                .map_err(|e| SyncError::Config(format!("bad CA certificate: {e}")))?;
        }
        let roots = Arc::new(roots);

        let verifier = WebPkiClientVerifier::builder(roots.clone())
            .build()
            .map_err(|e| SyncError::Config(format!("client verifier: {e}")))?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                load_certs(&dir.join(SERVER_CERT))?,
                load_key(&dir.join(SERVER_KEY))?,
            )?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                load_certs(&dir.join(CLIENT_CERT))?,
                load_key(&dir.join(CLIENT_KEY))?,
            )?;

        Ok(TlsIdentity {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }

    pub fn server_name() -> ServerName<'static> {
        ServerName::try_from(SERVER_NAME).expect("fixed server name is a valid DNS name")
    }
}

/// Install the process-wide crypto provider once.
fn ensure_crypto_provider() {
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| SyncError::Config(format!("open {}: {e}", path.display())))?;
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs =
        certs.map_err(|e| SyncError::Config(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(SyncError::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| SyncError::Config(format!("open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| SyncError::Config(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| SyncError::Config(format!("no private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_parses() {
        let name = TlsIdentity::server_name();
        assert_eq!(format!("{name:?}"), "DnsName(\"orange-bot\")");
    }

    #[test]
    fn missing_cert_dir_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TlsIdentity::load(dir.path()).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)), "{err}");
    }

    #[test]
    fn garbage_pem_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CA_CERT), b"not a pem").unwrap();
        let err = TlsIdentity::load(dir.path()).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)), "{err}");
    }
}

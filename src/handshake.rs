use async_trait::async_trait;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsListenerConfig;
use crate::error::ProxyError;

/// Byte stream to a client, whatever it is wrapped in.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type ClientStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Handshake: Send + Sync {
    async fn accept(&self, stream: TcpStream) -> io::Result<ClientStream>;
}

/// Clients on the plain listener speak MQTT straight away.
pub struct PlainHandshake;

#[async_trait]
impl Handshake for PlainHandshake {
    async fn accept(&self, stream: TcpStream) -> io::Result<ClientStream> {
        Ok(Box::new(stream))
    }
}

pub struct TlsHandshake {
    acceptor: TlsAcceptor,
}

impl TlsHandshake {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Build from the PEM certificate chain and private key named in the
    /// listener config.
    pub fn from_config(config: &TlsListenerConfig) -> Result<Self, ProxyError> {
        let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) else {
            return Err(ProxyError::Configuration(
                "tls.cert_path and tls.key_path are required".to_string(),
            ));
        };

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::Tls(format!("invalid certificate or key: {}", e)))?;

        info!("Loaded TLS certificate from {}", cert_path.display());
        Ok(Self::new(server_config))
    }
}

#[async_trait]
impl Handshake for TlsHandshake {
    async fn accept(&self, stream: TcpStream) -> io::Result<ClientStream> {
        let tls = self.acceptor.accept(stream).await?;
        Ok(Box::new(tls))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("read certificates from {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls(format!("read private key from {}: {}", path.display(), e)))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn tls_config(cert: &Path, key: &Path) -> TlsListenerConfig {
        TlsListenerConfig {
            enabled: true,
            port: 8883,
            cert_path: Some(cert.to_path_buf()),
            key_path: Some(key.to_path_buf()),
        }
    }

    #[test]
    fn test_load_self_signed_certificate() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = pem_file(&generated.cert.pem());
        let key = pem_file(&generated.key_pair.serialize_pem());

        assert!(TlsHandshake::from_config(&tls_config(cert.path(), key.path())).is_ok());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = pem_file(&generated.cert.pem());
        let empty = pem_file("");

        assert!(matches!(
            TlsHandshake::from_config(&tls_config(cert.path(), empty.path())),
            Err(ProxyError::Tls(_))
        ));
        assert!(matches!(
            TlsHandshake::from_config(&tls_config(
                cert.path(),
                &PathBuf::from("/nonexistent/key.pem")
            )),
            Err(ProxyError::Tls(_))
        ));

        let mut config = tls_config(cert.path(), empty.path());
        config.key_path = None;
        assert!(matches!(
            TlsHandshake::from_config(&config),
            Err(ProxyError::Configuration(_))
        ));
    }
}

//! Outbound connections to connector endpoints.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};

use crate::config::TlsConfig;
use crate::connector::{ConnectorError, ConnectorWorkerConfig};

/// Byte stream to a connector endpoint.
pub trait ConnectorStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnectorStream for T {}

/// Capability that opens connections to connector endpoints.
#[async_trait::async_trait]
pub trait ConnectorTransport: Send + Sync + 'static {
    /// Connect to `address` (`host:port`), performing any handshake.
    async fn connect(&self, address: &str) -> Result<Box<dyn ConnectorStream>, ConnectorError>;
}

/// TLS over TCP, or plain TCP when no TLS material is configured.
///
/// Outbound sockets are bound to the configured source IP.
#[derive(Clone)]
pub struct TlsTransport {
    connector: Option<TlsConnector>,
    server_name: Option<String>,
    source_ip: Option<IpAddr>,
    timeout: Duration,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("tls", &self.connector.is_some())
            .field("server_name", &self.server_name)
            .field("source_ip", &self.source_ip)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TlsTransport {
    /// Load TLS material and build the transport.
    ///
    /// Fails when a PEM file cannot be read or holds no usable certificate
    /// or key.
    pub fn new(config: &ConnectorWorkerConfig) -> Result<Self, ConnectorError> {
        let connector = config
            .tls
            .as_ref()
            .map(|tls| client_config(tls).map(|c| TlsConnector::from(Arc::new(c))))
            .transpose()?;

        Ok(Self {
            connector,
            server_name: config.tls.as_ref().and_then(|t| t.server_name.clone()),
            source_ip: config.source_ip,
            timeout: config.timeout,
        })
    }

    /// Whether connections are encrypted.
    pub fn is_tls(&self) -> bool {
        self.connector.is_some()
    }
}

#[async_trait::async_trait]
impl ConnectorTransport for TlsTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn ConnectorStream>, ConnectorError> {
        let connect = crate::net::connect_from(address, self.source_ip);
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout))?
            .map_err(|source| ConnectorError::Connect {
                address: address.to_string(),
                source,
            })?;

        let Some(connector) = &self.connector else {
            return Ok(Box::new(stream));
        };

        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => host_of(address)?.to_string(),
        };
        let server_name = ServerName::try_from(name)
            .map_err(|_| ConnectorError::InvalidAddress(address.to_string()))?;

        let tls = tokio::time::timeout(self.timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout))?
            .map_err(|source| ConnectorError::Handshake {
                address: address.to_string(),
                source,
            })?;

        Ok(Box::new(tls))
    }
}

fn client_config(tls: &TlsConfig) -> Result<ClientConfig, ConnectorError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&tls.ca)? {
        roots
            .add(cert)
            .map_err(|e| ConnectorError::Tls(format!("invalid CA certificate in {}: {e}", tls.ca.display())))?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectorError::Tls(e.to_string()))?
        .with_root_certificates(roots);

    match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => {
            let chain = read_certs(cert)?;
            let pem = read_file(key)?;
            let key = PrivateKeyDer::from_pem_slice(&pem)
                .map_err(|e| ConnectorError::Tls(format!("invalid private key in {}: {e}", key.display())))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| ConnectorError::Tls(e.to_string()))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ConnectorError::Tls(
            "client certificate and key must be configured together".to_string(),
        )),
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConnectorError> {
    let pem = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectorError::Tls(format!("invalid certificate in {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(ConnectorError::Tls(format!("no certificate found in {}", path.display())));
    }
    Ok(certs)
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConnectorError> {
    std::fs::read(path).map_err(|e| ConnectorError::Tls(format!("cannot read {}: {e}", path.display())))
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(address: &str) -> Result<&str, ConnectorError> {
    address
        .rsplit_once(':')
        .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConnectorError::InvalidAddress(address.to_string()))
}

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::router::RouteTarget;

/// Byte stream the proxy can relay over, plain or TLS.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// Opens outbound streams to upstream targets.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &RouteTarget) -> ConnectFuture;
}

/// TCP connector; wraps `https` targets in TLS.
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> io::Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::with_tls_config(Arc::new(config), connect_timeout))
    }

    pub fn with_tls_config(config: Arc<ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: TlsConnector::from(config),
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, target: &RouteTarget) -> ConnectFuture {
        let target = target.clone();
        let tls = self.tls.clone();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            trace!("connecting to {}", target);
            let addr = (target.host.as_str(), target.port);
            let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(res) => res?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", target),
                    ))
                }
            };
            stream.set_nodelay(true)?;
            if !target.is_tls() {
                return Ok(Box::new(stream) as BoxedStream);
            }
            let name = ServerName::try_from(target.host.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = tls.connect(name, stream).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

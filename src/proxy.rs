use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::config::ProxyConfig;
use crate::connection::{ProxyConnection, ProxyContext};
use crate::filter::{FilterChain, PipelineFactory};
use crate::message::Response;
use crate::router::{RoundRobinRouter, Router};
use crate::transport::{Connector, TcpConnector};

/// Value of the `Server` header on responses the proxy generates itself.
pub const SERVER: &str = concat!("rusty-interceptor/", env!("CARGO_PKG_VERSION"));

// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub const CONTINUE_100: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Reply to a CONNECT request once the tunnel is up.
pub fn connect_established(version: &str) -> Vec<u8> {
    format!("HTTP/{} 200 Connection established\r\n\r\n", version).into_bytes()
}

fn canned(status: &str) -> Response {
    let mut response = Response::with_status(status);
    response.headers.get_or_set("Server", SERVER);
    response.headers.get_or_set("Content-Length", 0u64);
    response
}

/// Sent when the upstream fails. Each call returns a fresh copy.
pub fn bad_gateway() -> Response {
    static RESPONSE: OnceLock<Response> = OnceLock::new();
    RESPONSE.get_or_init(|| canned("502 Bad Gateway")).clone()
}

/// Sent when the router has no upstream for a request.
pub fn service_unavailable() -> Response {
    static RESPONSE: OnceLock<Response> = OnceLock::new();
    RESPONSE.get_or_init(|| canned("503 Service Unavailable")).clone()
}

/// A listening proxy. Each accepted client gets its own task.
pub struct Proxy {
    config: ProxyConfig,
    context: ProxyContext,
}

impl Proxy {
    /// Proxy over TCP/TLS with round-robin routing across the configured
    /// upstreams and no filters.
    pub fn new(config: ProxyConfig) -> io::Result<Self> {
        let connector = TcpConnector::new(config.connect_timeout())?;
        let router = RoundRobinRouter::new(config.upstreams.clone());
        Ok(Self::with_parts(config, Arc::new(router), Arc::new(connector)))
    }

    pub fn with_parts(config: ProxyConfig, router: Arc<dyn Router>, connector: Arc<dyn Connector>) -> Self {
        let context = ProxyContext {
            router,
            connector,
            downstream_pipeline: FilterChain::passthrough(),
            upstream_pipeline: FilterChain::passthrough(),
            read_buffer_size: config.read_buffer_size,
        };
        Self { config, context }
    }

    /// Sets the factories for the response-side (`upstream`) and
    /// request-side (`downstream`) pipelines.
    pub fn with_pipelines(mut self, upstream: PipelineFactory, downstream: PipelineFactory) -> Self {
        self.context.upstream_pipeline = upstream;
        self.context.downstream_pipeline = downstream;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.context.router = router;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.context.connector = connector;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn context(&self) -> &ProxyContext {
        &self.context
    }

    /// Binds the configured address. The port is shared with other
    /// workers through `SO_REUSEPORT`.
    pub fn bind(&self) -> io::Result<TcpListener> {
        bind_reuse(self.config.bind, self.config.backlog)
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind()?;
        info!("starting server on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accepts clients on `listener` forever.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("error setting nodelay for {}: {}", addr, e);
            }
            let connection = ProxyConnection::new(&self.context, Box::new(stream), addr);
            tokio::spawn(connection.run());
        }
    }
}

fn bind_reuse(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    trace!("attempting to listen on {}", addr);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

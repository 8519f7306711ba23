#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rusty_interceptor::transport::ConnectFuture;
use rusty_interceptor::{
    BoxedStream, Connector, FilterChain, PipelineFactory, ProxyConnection, ProxyContext, RoundRobinRouter,
    RouteTarget,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Connector handing out in-memory pipes. The far end of every pipe shows
/// up on the `servers` channel.
pub struct MemoryConnector {
    servers: mpsc::UnboundedSender<(RouteTarget, DuplexStream)>,
    opened: Mutex<Vec<RouteTarget>>,
    failing: Mutex<HashSet<RouteTarget>>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(RouteTarget, DuplexStream)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers: tx,
            opened: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        });
        (connector, rx)
    }

    /// Connects to `target` are refused from now on.
    pub fn fail(&self, target: RouteTarget) {
        self.failing.lock().unwrap().insert(target);
    }

    pub fn opened(&self) -> Vec<RouteTarget> {
        self.opened.lock().unwrap().clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, target: &RouteTarget) -> ConnectFuture {
        self.opened.lock().unwrap().push(target.clone());
        if self.failing.lock().unwrap().contains(target) {
            return Box::pin(async { Err::<BoxedStream, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")) });
        }
        let (near, far) = duplex(1 << 16);
        let _ = self.servers.send((target.clone(), far));
        Box::pin(async move { Ok(Box::new(near) as BoxedStream) })
    }
}

pub struct Harness {
    pub client: DuplexStream,
    pub servers: mpsc::UnboundedReceiver<(RouteTarget, DuplexStream)>,
    pub connector: Arc<MemoryConnector>,
    pub task: JoinHandle<()>,
}

impl Harness {
    /// Next upstream the proxy opened.
    pub async fn server(&mut self) -> (RouteTarget, DuplexStream) {
        tokio::time::timeout(TIMEOUT, self.servers.recv())
            .await
            .expect("timed out waiting for an upstream")
            .expect("connector dropped")
    }
}

pub fn origin() -> RouteTarget {
    RouteTarget::http("origin.test", 80)
}

pub fn start(upstreams: Vec<RouteTarget>) -> Harness {
    start_with(upstreams, FilterChain::passthrough(), FilterChain::passthrough())
}

/// Runs one proxied connection over an in-memory client pipe.
pub fn start_with(upstreams: Vec<RouteTarget>, downstream: PipelineFactory, upstream: PipelineFactory) -> Harness {
    let (connector, servers) = MemoryConnector::new();
    let context = ProxyContext {
        router: Arc::new(RoundRobinRouter::new(upstreams)),
        connector: connector.clone() as Arc<dyn Connector>,
        downstream_pipeline: downstream,
        upstream_pipeline: upstream,
        read_buffer_size: 1024,
    };
    let (client, proxy_side) = duplex(1 << 16);
    let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    let connection = ProxyConnection::new(&context, Box::new(proxy_side), addr);
    let task = tokio::spawn(connection.run());
    Harness {
        client,
        servers,
        connector,
        task,
    }
}

/// Reads up to and including the blank line ending a message head.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let fut = async {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert_ne!(n, 0, "eof inside head: {:?}", String::from_utf8_lossy(&head));
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    };
    tokio::time::timeout(TIMEOUT, fut).await.expect("timed out reading head")
}

pub async fn read_n<S: AsyncRead + Unpin>(stream: &mut S, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading body")
        .unwrap();
    buf
}

pub async fn read_rest<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("timed out waiting for eof")
        .unwrap();
    buf
}

pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) {
    stream.write_all(data).await.unwrap();
    stream.flush().await.unwrap();
}

//! An HTTP/1.x intercepting proxy.
//!
//! Filters see every request and response at head and body boundaries and
//! may rewrite them, answer locally, or send the exchange to another
//! upstream, all while bodies stream through without being buffered whole.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod handler;
pub mod message;
pub mod parser;
pub mod proxy;
pub mod router;
pub mod tracker;
pub mod transport;
pub mod writer;

pub use config::ProxyConfig;
pub use connection::{ProxyConnection, ProxyContext};
pub use error::{ConfigError, ProxyError};
pub use filter::{BodySource, FilterAction, FilterChain, FilterError, FilterPipeline, FilterResult, HttpFilter, PipelineFactory};
pub use message::{Header, HeaderCollection, HttpMessage, Request, Response};
pub use proxy::Proxy;
pub use router::{Protocol, RoundRobinRouter, RouteTarget, Router};
pub use transport::{BoxedStream, Connector, TcpConnector};

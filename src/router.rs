use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::message::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http
    }
}

/// An upstream origin. Equal targets share one tracked socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct RouteTarget {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl RouteTarget {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Protocol::Http)
    }

    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, Protocol::Https)
    }

    pub fn is_tls(&self) -> bool {
        self.protocol == Protocol::Https
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = match self.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

// Accepts "host:port", "http://host[:port]" and "https://host[:port]"
impl FromStr for RouteTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTarget(s.to_owned());
        let (protocol, rest) = if let Some(rest) = s.strip_prefix("https://") {
            (Protocol::Https, rest)
        } else if let Some(rest) = s.strip_prefix("http://") {
            (Protocol::Http, rest)
        } else {
            (Protocol::Http, s)
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None if rest.len() < s.len() => (rest, protocol.default_port()),
            None => return Err(invalid()),
        };
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(host, port, protocol))
    }
}

/// Picks the upstream for a request. Shared by every connection of a worker;
/// connections only call [`Router::route`].
pub trait Router: Send + Sync {
    /// `None` when no upstream is available.
    fn get_next(&self, request: &Request) -> Option<RouteTarget>;

    /// Makes the following `get_next` call return `target`.
    fn set_next(&self, target: RouteTarget);

    /// Picks the target for `request`, or `forced` when a filter named
    /// one. Implementations shared across threads should override this so
    /// another connection cannot take the override in between.
    fn route(&self, request: &Request, forced: Option<RouteTarget>) -> Option<RouteTarget> {
        if let Some(target) = forced {
            self.set_next(target);
        }
        self.get_next(request)
    }
}

/// Cycles through a fixed list of targets.
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    targets: Vec<RouteTarget>,
    cursor: AtomicUsize,
    next: Mutex<Option<RouteTarget>>,
}

impl RoundRobinRouter {
    pub fn new(targets: Vec<RouteTarget>) -> Self {
        Self {
            targets,
            cursor: AtomicUsize::new(0),
            next: Mutex::new(None),
        }
    }

    pub fn targets(&self) -> &[RouteTarget] {
        &self.targets
    }
}

impl RoundRobinRouter {
    fn rotate(&self) -> Option<RouteTarget> {
        if self.targets.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        Some(self.targets[idx].clone())
    }
}

impl Router for RoundRobinRouter {
    fn get_next(&self, _request: &Request) -> Option<RouteTarget> {
        let forced = self.next.lock().unwrap_or_else(|e| e.into_inner()).take();
        if forced.is_some() {
            return forced;
        }
        self.rotate()
    }

    // The forced target goes straight back to the caller and never sits in
    // the shared slot.
    fn route(&self, request: &Request, forced: Option<RouteTarget>) -> Option<RouteTarget> {
        match forced {
            Some(target) => Some(target),
            None => self.get_next(request),
        }
    }

    fn set_next(&self, target: RouteTarget) {
        *self.next.lock().unwrap_or_else(|e| e.into_inner()) = Some(target);
    }
}

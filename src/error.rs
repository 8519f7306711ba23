use std::io;

use thiserror::Error;

pub use crate::filter::FilterError;
pub use crate::parser::ParseError;

/// Errors that end a proxied connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A response filter asked to reject or reroute after response bytes
    /// already reached the client.
    #[error("filter {0} after the response was committed to the client")]
    LateDecision(&'static str),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config: {0}")]
    Io(#[from] io::Error),

    #[error("error parsing config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid route target {0:?}")]
    InvalidTarget(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

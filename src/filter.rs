use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncRead;

use crate::buffer::Accumulator;
use crate::message::{Request, Response};
use crate::router::RouteTarget;

/// Failure inside a filter hook. Ends the connection.
#[derive(Debug, Error)]
#[error("filter error: {0}")]
pub struct FilterError(pub String);

impl FilterError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Body of a locally generated response.
pub enum BodySource {
    Bytes(Vec<u8>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BodySource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            BodySource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Vec<u8>> for BodySource {
    fn from(bytes: Vec<u8>) -> Self {
        BodySource::Bytes(bytes)
    }
}

impl From<&[u8]> for BodySource {
    fn from(bytes: &[u8]) -> Self {
        BodySource::Bytes(bytes.to_vec())
    }
}

impl From<&str> for BodySource {
    fn from(s: &str) -> Self {
        BodySource::Bytes(s.as_bytes().to_vec())
    }
}

/// What a filter decided to do with the current message.
#[derive(Debug)]
pub enum FilterAction {
    Continue,
    /// Answer the client locally; nothing more goes to or comes from the
    /// upstream for this exchange.
    Reject {
        response: Response,
        body: Option<BodySource>,
    },
    /// Send the exchange to another upstream.
    Reroute { target: RouteTarget },
}

impl FilterAction {
    pub fn reject(response: Response) -> Self {
        FilterAction::Reject { response, body: None }
    }

    pub fn reject_with_body(response: Response, body: impl Into<BodySource>) -> Self {
        FilterAction::Reject {
            response,
            body: Some(body.into()),
        }
    }

    pub fn reroute(target: RouteTarget) -> Self {
        FilterAction::Reroute { target }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, FilterAction::Continue)
    }
}

pub type FilterResult = Result<FilterAction, FilterError>;

/// Hooks the proxy runs at head and body boundaries of each message.
pub trait FilterPipeline: Send {
    fn on_request_head(&mut self, request: &mut Request) -> FilterResult;

    fn on_request_body(&mut self, chunk: &[u8], out: &mut Accumulator, request: &mut Request) -> FilterResult;

    /// Whether request bodies may be rewritten, which forces chunked
    /// encoding towards the upstream.
    fn intercepts_request_body(&self) -> bool;

    fn on_response_head(&mut self, response: &mut Response, request: &Request) -> FilterResult;

    fn on_response_body(
        &mut self,
        chunk: &[u8],
        out: &mut Accumulator,
        response: &mut Response,
        request: &Request,
    ) -> FilterResult;

    fn intercepts_response_body(&self) -> bool;
}

/// Builds the pipeline instance for one connection.
pub type PipelineFactory = Arc<dyn Fn() -> Box<dyn FilterPipeline> + Send + Sync>;

/// One link of a [`FilterChain`]. Every hook defaults to `Continue`.
pub trait HttpFilter: Send {
    fn on_request_head(&mut self, _request: &mut Request) -> FilterResult {
        Ok(FilterAction::Continue)
    }

    fn on_request_body(&mut self, _chunk: &[u8], _out: &mut Accumulator, _request: &mut Request) -> FilterResult {
        Ok(FilterAction::Continue)
    }

    fn intercepts_request_body(&self) -> bool {
        false
    }

    fn on_response_head(&mut self, _response: &mut Response, _request: &Request) -> FilterResult {
        Ok(FilterAction::Continue)
    }

    fn on_response_body(
        &mut self,
        _chunk: &[u8],
        _out: &mut Accumulator,
        _response: &mut Response,
        _request: &Request,
    ) -> FilterResult {
        Ok(FilterAction::Continue)
    }

    fn intercepts_response_body(&self) -> bool {
        false
    }
}

/// Runs filters in order. The first non-`Continue` action wins; body
/// filters see the output of the filters before them.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn HttpFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl HttpFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn push(&mut self, filter: Box<dyn HttpFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Factory producing empty chains.
    pub fn passthrough() -> PipelineFactory {
        Arc::new(|| Box::new(FilterChain::new()) as Box<dyn FilterPipeline>)
    }

    fn run_body<F>(&mut self, chunk: &[u8], out: &mut Accumulator, mut hook: F) -> FilterResult
    where
        F: FnMut(&mut dyn HttpFilter, &[u8], &mut Accumulator) -> FilterResult,
    {
        let mut current: Option<Vec<u8>> = None;
        let mut scratch = Accumulator::new();
        let mut action = FilterAction::Continue;
        for filter in self.filters.iter_mut() {
            scratch.reset();
            let input = current.as_deref().unwrap_or(chunk);
            action = hook(filter.as_mut(), input, &mut scratch)?;
            if !scratch.is_empty() {
                current = Some(scratch.take());
            }
            if !action.is_continue() {
                break;
            }
        }
        if let Some(data) = current {
            out.write(&data);
        }
        Ok(action)
    }
}

impl FilterPipeline for FilterChain {
    fn on_request_head(&mut self, request: &mut Request) -> FilterResult {
        for filter in self.filters.iter_mut() {
            let action = filter.on_request_head(request)?;
            if !action.is_continue() {
                return Ok(action);
            }
        }
        Ok(FilterAction::Continue)
    }

    fn on_request_body(&mut self, chunk: &[u8], out: &mut Accumulator, request: &mut Request) -> FilterResult {
        self.run_body(chunk, out, |f, input, scratch| f.on_request_body(input, scratch, request))
    }

    fn intercepts_request_body(&self) -> bool {
        self.filters.iter().any(|f| f.intercepts_request_body())
    }

    fn on_response_head(&mut self, response: &mut Response, request: &Request) -> FilterResult {
        for filter in self.filters.iter_mut() {
            let action = filter.on_response_head(response, request)?;
            if !action.is_continue() {
                return Ok(action);
            }
        }
        Ok(FilterAction::Continue)
    }

    fn on_response_body(
        &mut self,
        chunk: &[u8],
        out: &mut Accumulator,
        response: &mut Response,
        request: &Request,
    ) -> FilterResult {
        self.run_body(chunk, out, |f, input, scratch| {
            f.on_response_body(input, scratch, response, request)
        })
    }

    fn intercepts_response_body(&self) -> bool {
        self.filters.iter().any(|f| f.intercepts_response_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl HttpFilter for Upper {
        fn on_request_body(&mut self, chunk: &[u8], out: &mut Accumulator, _request: &mut Request) -> FilterResult {
            out.write(&chunk.to_ascii_uppercase());
            Ok(FilterAction::Continue)
        }

        fn intercepts_request_body(&self) -> bool {
            true
        }
    }

    struct Wrap;

    impl HttpFilter for Wrap {
        fn on_request_body(&mut self, chunk: &[u8], out: &mut Accumulator, _request: &mut Request) -> FilterResult {
            out.write(b"[");
            out.write(chunk);
            out.write(b"]");
            Ok(FilterAction::Continue)
        }
    }

    struct Deny;

    impl HttpFilter for Deny {
        fn on_request_head(&mut self, request: &mut Request) -> FilterResult {
            if request.url.starts_with("/admin") {
                return Ok(FilterAction::reject(Response::with_status("403 Forbidden")));
            }
            Ok(FilterAction::Continue)
        }
    }

    struct Tag;

    impl HttpFilter for Tag {
        fn on_request_head(&mut self, request: &mut Request) -> FilterResult {
            request.headers.get_or_create("X-Tagged").push("1");
            Ok(FilterAction::Continue)
        }
    }

    struct Broken;

    impl HttpFilter for Broken {
        fn on_request_head(&mut self, _request: &mut Request) -> FilterResult {
            Err(FilterError::new("boom"))
        }
    }

    #[test]
    fn body_filters_compose_in_order() {
        let mut chain = FilterChain::new().with(Upper).with(Wrap);
        let mut out = Accumulator::new();
        let mut request = Request::new();
        let action = chain.on_request_body(b"abc", &mut out, &mut request).unwrap();
        assert!(action.is_continue());
        assert_eq!(out.data(), b"[ABC]");
        assert!(chain.intercepts_request_body());
        assert!(!chain.intercepts_response_body());
    }

    #[test]
    fn untouched_body_leaves_output_empty() {
        let mut chain = FilterChain::new().with(Tag);
        let mut out = Accumulator::new();
        let mut request = Request::new();
        chain.on_request_body(b"abc", &mut out, &mut request).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn first_decision_stops_the_chain() {
        let mut chain = FilterChain::new().with(Deny).with(Tag);
        let mut request = Request::new();
        request.url = "/admin/users".into();
        match chain.on_request_head(&mut request).unwrap() {
            FilterAction::Reject { response, body } => {
                assert_eq!(response.status, "403 Forbidden");
                assert!(body.is_none());
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(request.headers.get("x-tagged").is_none());

        request.url = "/".into();
        assert!(chain.on_request_head(&mut request).unwrap().is_continue());
        assert!(request.headers.contains("X-Tagged"));
    }

    #[test]
    fn errors_propagate() {
        let mut chain = FilterChain::new().with(Broken).with(Tag);
        let mut request = Request::new();
        let err = chain.on_request_head(&mut request).unwrap_err();
        assert_eq!(err.to_string(), "filter error: boom");
    }
}

//! Parser delegates implementing the proxying policy for each side of a
//! connection.
//!
//! Handlers never touch sockets. Every decision becomes an [`Effect`] in the
//! handler's outbox, and the parser yields as soon as the outbox is
//! non-empty so the connection can carry the effects out, in order, before
//! any more bytes are parsed.
use std::mem;
use std::net::SocketAddr;

use log::{debug, info, warn};

use crate::buffer::{self, Accumulator, ByteSink, PeekBuffer, CHUNK_CLOSE};
use crate::error::ProxyError;
use crate::filter::{BodySource, FilterAction, FilterPipeline};
use crate::message::{HttpMessage, Request, Response};
use crate::parser::ParserDelegate;
use crate::proxy::{connect_established, CONTINUE_100};
use crate::router::RouteTarget;

/// Work a handler asks the connection to carry out.
#[derive(Debug)]
pub enum Effect {
    WriteDownstream(Vec<u8>),
    WriteUpstream(Vec<u8>),
    PauseDownstream,
    ResumeDownstream,
    PauseUpstream,
    /// Route the request and connect to its upstream. `route` forces the
    /// target.
    ConnectUpstream {
        request: Request,
        route: Option<RouteTarget>,
    },
    /// Drop the current upstream and send the request to `route` instead.
    Reroute { request: Request, route: RouteTarget },
    /// Drop the current upstream without a replacement.
    AbandonUpstream,
    /// Write a locally generated response to the client.
    SendResponse {
        response: Response,
        body: Option<BodySource>,
    },
    /// The upstream finished a response and stays open.
    ResponseComplete,
    CloseDownstream,
    CloseUpstream,
    /// Switch the connection to a raw byte tunnel.
    Tunnel,
}

#[derive(Debug, Default)]
struct Outbox(Vec<Effect>);

impl Outbox {
    fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn take(&mut self) -> Vec<Effect> {
        mem::take(&mut self.0)
    }
}

// Bytes written through the outbox go to the client.
impl ByteSink for Outbox {
    fn write_bytes(&mut self, data: &[u8]) {
        self.0.push(Effect::WriteDownstream(data.to_vec()));
    }
}

/// Per-message state both handlers keep.
#[derive(Debug, Default)]
struct ExchangeState {
    expect: Option<String>,
    /// Body is re-framed as chunked because a filter may rewrite it.
    chunked: bool,
    last_header_field: Option<String>,
    /// Answered locally.
    intercepted: bool,
    rerouted: bool,
    keep_alive: bool,
    rejection: Option<(Response, Option<BodySource>)>,
}

impl ExchangeState {
    fn header_field(&mut self, field: &str) {
        self.last_header_field = Some(field.to_owned());
    }

    /// Returns the field the value belongs to.
    fn header_value(&mut self, value: &str) -> Option<String> {
        let field = self.last_header_field.take()?;
        if field.eq_ignore_ascii_case("expect") {
            self.expect = Some(value.to_ascii_lowercase());
        }
        Some(field)
    }

    fn reject(&mut self, response: Response, body: Option<BodySource>) {
        self.intercepted = true;
        self.rejection = Some((response, body));
    }
}

/// Drops `Content-Length` and switches the message to chunked encoding.
/// Returns false if there was no length to replace.
fn negotiate_chunked<M: HttpMessage>(msg: &mut M) -> bool {
    if !msg.headers_mut().remove("content-length") {
        return false;
    }
    msg.headers_mut().replace("Transfer-Encoding", "chunked");
    true
}

fn version_string(major: u8, minor: u8) -> String {
    format!("{}.{}", major, minor)
}

/// Client-facing side: parses requests and relays them upstream.
pub struct DownstreamHandler {
    pipeline: Box<dyn FilterPipeline>,
    client_addr: SocketAddr,
    request: Request,
    state: ExchangeState,
    accumulator: Accumulator,
    /// Framed body bytes waiting for the upstream to come up.
    preread: Vec<u8>,
    upstream_live: bool,
    /// The request went upstream and its response hasn't finished.
    awaiting_response: bool,
    request_complete: bool,
    outbox: Outbox,
}

impl DownstreamHandler {
    pub fn new(pipeline: Box<dyn FilterPipeline>, client_addr: SocketAddr) -> Self {
        Self {
            pipeline,
            client_addr,
            request: Request::with_client(client_addr),
            state: ExchangeState::default(),
            accumulator: Accumulator::new(),
            preread: Vec::new(),
            upstream_live: false,
            awaiting_response: false,
            request_complete: false,
            outbox: Outbox::default(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.outbox.take()
    }

    fn is_chunked(&self, parser_chunked: bool) -> bool {
        parser_chunked || self.state.chunked
    }

    fn send_upstream(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if self.upstream_live {
            self.outbox.push(Effect::WriteUpstream(data));
        } else {
            self.preread.extend_from_slice(&data);
        }
    }

    /// The upstream for the current request is connected.
    pub fn on_upstream_connect(&mut self) -> Vec<Effect> {
        if self.upstream_live {
            debug!("{}: upstream already live", self.client_addr);
        } else if self.state.rerouted {
            debug!("{}: replacement upstream is live", self.client_addr);
        }
        self.upstream_live = true;
        self.state.rerouted = false;

        if self.request.is_connect() {
            let ok = connect_established(&self.request.version);
            self.outbox.push(Effect::WriteDownstream(ok));
            self.outbox.push(Effect::Tunnel);
            return self.outbox.take();
        }
        if !self.preread.is_empty() {
            let data = mem::take(&mut self.preread);
            self.outbox.push(Effect::WriteUpstream(data));
        }
        if !self.request_complete {
            self.outbox.push(Effect::ResumeDownstream);
        }
        self.outbox.take()
    }

    /// The upstream went away and a replacement is being connected.
    pub fn detach_upstream(&mut self) {
        self.upstream_live = false;
    }

    /// The router had nothing for the request and the client has been
    /// answered already.
    pub fn mark_unrouted(&mut self) -> Vec<Effect> {
        self.state.intercepted = true;
        self.upstream_live = false;
        self.awaiting_response = false;
        self.preread.clear();
        if self.request_complete {
            self.finish();
        } else {
            self.outbox.push(Effect::ResumeDownstream);
        }
        self.outbox.take()
    }

    /// The upstream finished answering the current request.
    pub fn on_response_complete(&mut self) -> Vec<Effect> {
        self.awaiting_response = false;
        if self.request_complete {
            self.finish();
        }
        self.outbox.take()
    }

    /// Ends the exchange: either wait for the next request or hang up.
    fn finish(&mut self) {
        if self.state.keep_alive && !self.request.is_connect() {
            self.request = Request::with_client(self.client_addr);
            self.state = ExchangeState::default();
            self.preread.clear();
            self.upstream_live = false;
            self.request_complete = false;
            self.outbox.push(Effect::ResumeDownstream);
        } else {
            self.outbox.push(Effect::CloseDownstream);
        }
    }
}

impl ParserDelegate for DownstreamHandler {
    type Error = ProxyError;

    fn on_req_method(&mut self, method: &str) {
        self.request.method = method.to_owned();
    }

    fn on_req_path(&mut self, url: &str) {
        self.request.url = url.to_owned();
    }

    fn on_http_version(&mut self, major: u8, minor: u8) {
        self.request.version = version_string(major, minor);
    }

    fn on_header_field(&mut self, field: &str) {
        self.state.header_field(field);
    }

    fn on_header_value(&mut self, value: &str) {
        if let Some(field) = self.state.header_value(value) {
            self.request.headers.get_or_create(&field).push(value);
        }
    }

    fn on_headers_complete(&mut self) -> Result<(), ProxyError> {
        let action = self.pipeline.on_request_head(&mut self.request)?;

        if self.state.expect.as_deref() == Some("100-continue") {
            self.outbox.write_bytes(CONTINUE_100);
            // answered here; the origin must not send a second 100
            self.request.headers.remove("expect");
        }

        if self.pipeline.intercepts_request_body() && negotiate_chunked(&mut self.request) {
            self.state.chunked = true;
        }

        match action {
            FilterAction::Reject { response, body } => {
                debug!("{}: request rejected by filter", self.client_addr);
                self.state.reject(response, body);
            }
            FilterAction::Reroute { target } => {
                info!("{}: routing request to {}", self.client_addr, target);
                self.awaiting_response = true;
                self.outbox.push(Effect::ConnectUpstream {
                    request: self.request.clone(),
                    route: Some(target),
                });
            }
            FilterAction::Continue => {
                self.awaiting_response = true;
                self.outbox.push(Effect::ConnectUpstream {
                    request: self.request.clone(),
                    route: None,
                });
            }
        }
        Ok(())
    }

    fn on_body(&mut self, chunk: &[u8], is_chunked: bool) -> Result<(), ProxyError> {
        if self.state.intercepted {
            return Ok(());
        }

        self.accumulator.reset();
        let action = self
            .pipeline
            .on_request_body(chunk, &mut self.accumulator, &mut self.request)?;
        let data = if self.accumulator.is_empty() {
            chunk
        } else {
            self.accumulator.data()
        };
        let mut framed = Vec::with_capacity(data.len() + 16);
        buffer::write_body(&mut framed, data, is_chunked || self.state.chunked);

        match action {
            FilterAction::Continue => self.send_upstream(framed),
            FilterAction::Reroute { target } => {
                info!("{}: rerouting request to {}", self.client_addr, target);
                self.state.rerouted = true;
                self.upstream_live = false;
                self.preread.extend_from_slice(&framed);
                self.outbox.push(Effect::Reroute {
                    request: self.request.clone(),
                    route: target,
                });
            }
            FilterAction::Reject { response, body } => {
                debug!("{}: request body rejected by filter", self.client_addr);
                self.state.reject(response, body);
                self.awaiting_response = false;
                self.upstream_live = false;
                self.preread.clear();
                self.outbox.push(Effect::AbandonUpstream);
            }
        }
        Ok(())
    }

    fn on_message_complete(&mut self, is_chunked: bool, keep_alive: bool) -> Result<(), ProxyError> {
        self.state.keep_alive = keep_alive;
        self.request_complete = true;

        if self.state.intercepted {
            if let Some((response, body)) = self.state.rejection.take() {
                self.outbox.push(Effect::SendResponse { response, body });
            }
            self.awaiting_response = false;
            self.finish();
            return Ok(());
        }
        if self.request.is_connect() {
            // the tunnel takes over once the upstream is live
            return Ok(());
        }

        if self.is_chunked(is_chunked) {
            self.send_upstream(CHUNK_CLOSE.to_vec());
        }
        if self.awaiting_response {
            self.outbox.push(Effect::PauseDownstream);
        } else {
            self.finish();
        }
        Ok(())
    }

    fn should_yield(&self) -> bool {
        !self.outbox.is_empty()
    }
}

/// Origin-facing side: parses responses and relays them to the client.
pub struct UpstreamHandler {
    pipeline: Box<dyn FilterPipeline>,
    /// The request the current response answers.
    request: Request,
    response: Response,
    state: ExchangeState,
    peek: Option<PeekBuffer>,
    outbox: Outbox,
}

impl UpstreamHandler {
    pub fn new(pipeline: Box<dyn FilterPipeline>) -> Self {
        Self {
            pipeline,
            request: Request::new(),
            response: Response::new(),
            state: ExchangeState::default(),
            peek: None,
            outbox: Outbox::default(),
        }
    }

    /// Starts waiting for the response to `request`.
    pub fn attach(&mut self, request: Request) {
        self.request = request;
        self.reset();
    }

    fn reset(&mut self) {
        self.response = Response::new();
        self.state = ExchangeState::default();
        self.peek = None;
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        self.outbox.take()
    }

    /// Some of the current response already reached the client.
    pub fn is_committed(&self) -> bool {
        self.peek.as_ref().map_or(false, |p| !p.is_peeking())
    }

    fn reroute(&mut self, target: RouteTarget) {
        self.state.rerouted = true;
        if let Some(peek) = self.peek.as_mut() {
            peek.discard();
        }
        self.outbox.push(Effect::Reroute {
            request: self.request.clone(),
            route: target,
        });
    }

    fn reject(&mut self, response: Response, body: Option<BodySource>) {
        if let Some(peek) = self.peek.as_mut() {
            peek.discard();
        }
        self.state.reject(response, body);
    }
}

impl ParserDelegate for UpstreamHandler {
    type Error = ProxyError;

    fn on_status(&mut self, code: u16, reason: &str) {
        self.response.status = if reason.is_empty() {
            code.to_string()
        } else {
            format!("{} {}", code, reason)
        };
    }

    fn on_http_version(&mut self, major: u8, minor: u8) {
        self.response.version = version_string(major, minor);
    }

    fn on_header_field(&mut self, field: &str) {
        self.state.header_field(field);
    }

    fn on_header_value(&mut self, value: &str) {
        if let Some(field) = self.state.header_value(value) {
            self.response.headers.get_or_create(&field).push(value);
        }
    }

    fn on_headers_complete(&mut self) -> Result<(), ProxyError> {
        let action = self.pipeline.on_response_head(&mut self.response, &self.request)?;

        if let FilterAction::Reroute { target } = action {
            info!("response filter rerouting {} to {}", self.request.url, target);
            self.reroute(target);
            return Ok(());
        }

        if self.pipeline.intercepts_response_body() && negotiate_chunked(&mut self.response) {
            self.state.chunked = true;
        }

        if let FilterAction::Reject { response, body } = action {
            debug!("response to {} rejected by filter", self.request.url);
            self.reject(response, body);
            return Ok(());
        }

        if self.request.peek_size > 0 {
            self.response.peek_size = self.request.peek_size;
        }
        if self.response.peek_size > 0 {
            info!("peeking response size={}", self.response.peek_size);
        }
        let mut peek = PeekBuffer::new(self.response.peek_size);
        peek.write(&self.response.to_bytes(), &mut self.outbox);
        self.peek = Some(peek);
        Ok(())
    }

    fn on_body(&mut self, chunk: &[u8], is_chunked: bool) -> Result<(), ProxyError> {
        if self.state.intercepted || self.state.rerouted {
            return Ok(());
        }

        let mut accumulator = Accumulator::new();
        let action = self
            .pipeline
            .on_response_body(chunk, &mut accumulator, &mut self.response, &self.request)?;

        let peeking = self.peek.as_ref().map_or(false, PeekBuffer::is_peeking);
        match action {
            FilterAction::Continue => {}
            FilterAction::Reroute { target } if peeking => {
                info!("rerouting {} to {} while peeking", self.request.url, target);
                self.reroute(target);
                return Ok(());
            }
            FilterAction::Reject { response, body } if peeking => {
                info!("rejecting response to {} while peeking", self.request.url);
                self.reject(response, body);
                return Ok(());
            }
            FilterAction::Reroute { .. } => {
                warn!("response filter rerouted {} after it was committed", self.request.url);
                return Err(ProxyError::LateDecision("reroute"));
            }
            FilterAction::Reject { .. } => {
                warn!("response filter rejected {} after it was committed", self.request.url);
                return Err(ProxyError::LateDecision("reject"));
            }
        }

        let data = if accumulator.is_empty() {
            chunk
        } else {
            accumulator.data()
        };
        let chunked = is_chunked || self.state.chunked;
        if let Some(peek) = self.peek.as_mut() {
            peek.write_body(data, chunked, &mut self.outbox);
        }
        Ok(())
    }

    fn on_message_complete(&mut self, is_chunked: bool, keep_alive: bool) -> Result<(), ProxyError> {
        let informational = self.response.is_informational();

        if self.state.rerouted {
            // the connection already moved to another upstream
            return Ok(());
        }

        if self.state.intercepted {
            if let Some((response, body)) = self.state.rejection.take() {
                self.outbox.push(Effect::SendResponse { response, body });
            }
        } else if let Some(peek) = self.peek.as_mut() {
            if is_chunked || self.state.chunked {
                peek.write(CHUNK_CLOSE, &mut self.outbox);
            }
            peek.flush(&mut self.outbox);
        }

        if informational {
            // the final response follows on the same stream
            self.reset();
            return Ok(());
        }

        self.outbox.push(Effect::PauseUpstream);
        if keep_alive {
            self.outbox.push(Effect::ResponseComplete);
        } else {
            self.outbox.push(Effect::CloseUpstream);
        }
        self.reset();
        Ok(())
    }

    fn should_yield(&self) -> bool {
        !self.outbox.is_empty()
    }
}

//! Drives one client connection.
//!
//! A single task owns both sockets, both parsers and both handlers. Reading
//! from a side is an explicit switch: bytes already read stay queued while
//! the side is paused and are parsed only once it resumes, so at most one
//! chunk per direction is in flight.
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;

use crate::error::ProxyError;
use crate::filter::PipelineFactory;
use crate::handler::{DownstreamHandler, Effect, UpstreamHandler};
use crate::message::{HttpMessage, Request};
use crate::parser::Parser;
use crate::proxy::{bad_gateway, service_unavailable};
use crate::router::{RouteTarget, Router};
use crate::tracker::{ConnectResult, ConnectionTracker, TrackerEvent};
use crate::transport::{BoxedStream, Connector};
use crate::writer::ResponseWriter;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 1 << 12;

/// What every connection of a server shares.
#[derive(Clone)]
pub struct ProxyContext {
    pub router: Arc<dyn Router>,
    pub connector: Arc<dyn Connector>,
    /// Builds the request-side pipeline of each connection.
    pub downstream_pipeline: PipelineFactory,
    /// Builds the response-side pipeline of each connection.
    pub upstream_pipeline: PipelineFactory,
    pub read_buffer_size: usize,
}

enum Io {
    Downstream(io::Result<usize>),
    Upstream(io::Result<usize>),
    /// Read from the in-use upstream between exchanges.
    IdleUpstream(io::Result<usize>),
    Connected(Result<ConnectResult, JoinError>),
    Idle,
}

pub struct ProxyConnection {
    client_addr: SocketAddr,
    router: Arc<dyn Router>,
    read_buffer_size: usize,

    downstream: BoxedStream,
    ds_parser: Parser,
    ds_handler: DownstreamHandler,
    ds_input: Vec<u8>,
    ds_reading: bool,
    ds_eof: bool,

    us_parser: Parser,
    us_handler: UpstreamHandler,
    us_input: Vec<u8>,
    us_reading: bool,
    us_eof: bool,

    tracker: ConnectionTracker,
    /// Request headed upstream. Sent again when the upstream changes.
    request: Option<Request>,
    effects: VecDeque<Effect>,
    tunnel: bool,
    closed: bool,
}

impl ProxyConnection {
    pub fn new(context: &ProxyContext, downstream: BoxedStream, client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            router: Arc::clone(&context.router),
            read_buffer_size: context.read_buffer_size.max(1),
            downstream,
            ds_parser: Parser::request(),
            ds_handler: DownstreamHandler::new((context.downstream_pipeline)(), client_addr),
            ds_input: Vec::new(),
            ds_reading: true,
            ds_eof: false,
            us_parser: Parser::response(),
            us_handler: UpstreamHandler::new((context.upstream_pipeline)()),
            us_input: Vec::new(),
            us_reading: false,
            us_eof: false,
            tracker: ConnectionTracker::new(Arc::clone(&context.connector)),
            request: None,
            effects: VecDeque::new(),
            tunnel: false,
            closed: false,
        }
    }

    pub async fn run(mut self) {
        let addr = self.client_addr;
        trace!("handling connection from {}", addr);
        match self.serve().await {
            Ok(()) => {}
            Err(ProxyError::Io(e)) if is_disconnect(&e) => debug!("{}: client went away: {}", addr, e),
            Err(ProxyError::Io(e)) => error!("{}: downstream error: {}", addr, e),
            Err(e) => warn!("{}: abandoning connection: {}", addr, e),
        }
        self.tracker.destroy();
        if !self.closed {
            let _ = self.downstream.shutdown().await;
        }
        trace!("connection from {} closed", addr);
    }

    async fn serve(&mut self) -> Result<(), ProxyError> {
        let mut ds_buf = vec![0u8; self.read_buffer_size];
        let mut us_buf = vec![0u8; self.read_buffer_size];
        loop {
            if self.closed {
                return Ok(());
            }
            if let Some(event) = self.tracker.next_ready() {
                self.on_tracker_event(event).await?;
                continue;
            }
            if self.tunnel {
                return self.run_tunnel().await;
            }

            if self.ds_reading && !self.ds_parser.is_tunnel() {
                if !self.ds_input.is_empty() || self.ds_parser.has_pending() {
                    self.drive_downstream().await?;
                    continue;
                }
                if self.ds_eof {
                    self.ds_parser.finish(&mut self.ds_handler)?;
                    debug!("{}: client closed the connection", self.client_addr);
                    return Ok(());
                }
            }
            if self.us_reading {
                if !self.us_input.is_empty() || self.us_parser.has_pending() {
                    self.drive_upstream().await?;
                    continue;
                }
                if self.us_eof {
                    self.on_upstream_eof().await?;
                    continue;
                }
            }

            match self.wait_io(&mut ds_buf, &mut us_buf).await {
                Io::Downstream(Ok(0)) => self.ds_eof = true,
                Io::Downstream(Ok(n)) => self.ds_input.extend_from_slice(&ds_buf[..n]),
                Io::Downstream(Err(e)) => return Err(e.into()),
                Io::Upstream(Ok(0)) => self.us_eof = true,
                Io::Upstream(Ok(n)) => self.us_input.extend_from_slice(&us_buf[..n]),
                Io::Upstream(Err(e)) => self.upstream_failed(e),
                Io::IdleUpstream(res) => self.on_idle_upstream(res),
                Io::Connected(res) => self.tracker.on_connect_result(res),
                Io::Idle => {
                    debug!("{}: nothing left to wait on", self.client_addr);
                    return Ok(());
                }
            }
        }
    }

    /// Waits on the enabled sources, checking the upstream first. A live upstream
    /// is watched even while paused so an idle close is noticed before the
    /// socket is reused.
    async fn wait_io(&mut self, ds_buf: &mut [u8], us_buf: &mut [u8]) -> Io {
        let ds_can_read = self.ds_reading && !self.ds_eof;
        let us_idle = !self.us_reading;
        let us_wants_read = us_idle || !self.us_eof;
        let connecting = self.tracker.is_connecting();
        let (active, pending) = self.tracker.io_parts();
        let us_can_read = us_wants_read && active.is_some();
        let downstream = &mut self.downstream;

        // upstream first, so a close that raced the next request is seen
        // before that request is routed
        tokio::select! {
            biased;
            res = read_upstream(active, us_buf), if us_can_read => {
                if us_idle {
                    Io::IdleUpstream(res)
                } else {
                    Io::Upstream(res)
                }
            }
            res = downstream.read(ds_buf), if ds_can_read => Io::Downstream(res),
            Some(res) = pending.join_next(), if connecting => Io::Connected(res),
            else => Io::Idle,
        }
    }

    /// The in-use upstream closed, failed or sent unrequested bytes while
    /// no response was expected. It is dropped without ending the client
    /// connection; the next request opens a fresh socket.
    fn on_idle_upstream(&mut self, res: io::Result<usize>) {
        match res {
            Ok(0) => debug!("{}: idle upstream closed", self.client_addr),
            Ok(n) => debug!("{}: idle upstream sent {} unexpected bytes", self.client_addr, n),
            Err(e) => debug!("{}: idle upstream error: {}", self.client_addr, e),
        }
        self.abandon_upstream();
    }

    async fn drive_downstream(&mut self) -> Result<(), ProxyError> {
        let consumed = self.ds_parser.execute(&self.ds_input, &mut self.ds_handler)?;
        self.ds_input.drain(..consumed);
        let effects = self.ds_handler.take_effects();
        self.apply(effects).await
    }

    async fn drive_upstream(&mut self) -> Result<(), ProxyError> {
        let consumed = self.us_parser.execute(&self.us_input, &mut self.us_handler)?;
        self.us_input.drain(..consumed);
        let effects = self.us_handler.take_effects();
        self.apply(effects).await
    }

    async fn on_upstream_eof(&mut self) -> Result<(), ProxyError> {
        self.us_eof = false;
        self.us_reading = false;
        self.us_parser.finish(&mut self.us_handler)?;
        let effects = self.us_handler.take_effects();
        self.apply(effects).await?;
        if let Some(target) = self.tracker.in_use().cloned() {
            self.tracker.stream_closed(&target);
        }
        Ok(())
    }

    async fn on_tracker_event(&mut self, event: TrackerEvent) -> Result<(), ProxyError> {
        match event {
            TrackerEvent::Live { target, id } => {
                trace!("{}: upstream {} is live ({})", self.client_addr, target, id);
                self.on_upstream_live().await
            }
            TrackerEvent::Closed { target } => {
                info!("{}: upstream {} closed", self.client_addr, target);
                self.close_downstream().await;
                Ok(())
            }
            TrackerEvent::Error { target, error } => {
                error!("{}: upstream {} error: {}", self.client_addr, target, error);
                if !self.closed && !self.us_handler.is_committed() {
                    let writer = ResponseWriter::new(bad_gateway(), None);
                    if let Err(e) = writer.commit(&mut self.downstream).await {
                        debug!("{}: error writing 502: {}", self.client_addr, e);
                    }
                }
                self.close_downstream().await;
                Ok(())
            }
        }
    }

    async fn on_upstream_live(&mut self) -> Result<(), ProxyError> {
        let request = match &self.request {
            Some(r) => r.clone(),
            None => return Ok(()),
        };
        self.us_parser.reset();
        self.us_parser.set_skip_body(request.method.eq_ignore_ascii_case("HEAD"));
        self.us_input.clear();
        self.us_eof = false;

        if !request.is_connect() {
            self.us_reading = true;
            self.write_upstream(&request.to_bytes()).await;
        }
        self.us_handler.attach(request);

        let effects = self.ds_handler.on_upstream_connect();
        self.apply(effects).await
    }

    /// Carries out handler effects in order. Effects queued while applying
    /// run in the same pass.
    async fn apply(&mut self, effects: Vec<Effect>) -> Result<(), ProxyError> {
        self.effects.extend(effects);
        while let Some(effect) = self.effects.pop_front() {
            if self.closed {
                self.effects.clear();
                break;
            }
            match effect {
                Effect::WriteDownstream(data) => write_all_flush(&mut self.downstream, &data).await?,
                Effect::WriteUpstream(data) => self.write_upstream(&data).await,
                Effect::PauseDownstream => self.ds_reading = false,
                Effect::ResumeDownstream => self.ds_reading = true,
                Effect::PauseUpstream => self.us_reading = false,
                Effect::ConnectUpstream { request, route } => self.connect_upstream(request, route),
                Effect::Reroute { request, route } => {
                    info!("{}: connecting to new upstream {}", self.client_addr, route);
                    self.abandon_upstream();
                    self.ds_handler.detach_upstream();
                    self.connect_upstream(request, Some(route));
                }
                Effect::AbandonUpstream => self.abandon_upstream(),
                Effect::SendResponse { response, body } => {
                    ResponseWriter::new(response, body)
                        .commit(&mut self.downstream)
                        .await?
                }
                Effect::ResponseComplete => {
                    let next = self.ds_handler.on_response_complete();
                    self.effects.extend(next);
                }
                Effect::CloseDownstream => self.close_downstream().await,
                Effect::CloseUpstream => {
                    self.us_reading = false;
                    self.tracker.close_in_use().await;
                }
                Effect::Tunnel => self.tunnel = true,
            }
        }
        Ok(())
    }

    fn connect_upstream(&mut self, request: Request, route: Option<RouteTarget>) {
        let target = match self.router.route(&request, route) {
            Some(t) => t,
            None => {
                warn!(
                    "{}: no upstream available for {} {}",
                    self.client_addr, request.method, request.url
                );
                let unavailable = service_unavailable().to_bytes();
                self.effects.push_back(Effect::WriteDownstream(unavailable));
                let next = self.ds_handler.mark_unrouted();
                self.effects.extend(next);
                return;
            }
        };
        debug!("{}: {} {} -> {}", self.client_addr, request.method, request.url, target);
        self.ds_reading = false;
        self.request = Some(request);
        self.tracker.connect(target);
    }

    /// Drops the in-use upstream along with anything read from it.
    fn abandon_upstream(&mut self) {
        self.tracker.abandon_in_use();
        self.us_parser.reset();
        self.us_input.clear();
        self.us_reading = false;
        self.us_eof = false;
    }

    async fn write_upstream(&mut self, data: &[u8]) {
        let res = match self.tracker.active_mut() {
            Some(stream) => write_all_flush(stream, data).await,
            None => {
                debug!("{}: no live upstream for {} bytes", self.client_addr, data.len());
                return;
            }
        };
        if let Err(e) = res {
            self.upstream_failed(e);
        }
    }

    fn upstream_failed(&mut self, error: io::Error) {
        if let Some(target) = self.tracker.in_use().cloned() {
            self.tracker.stream_failed(&target, error);
        }
    }

    async fn close_downstream(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.downstream.shutdown().await {
            trace!("{}: error shutting down: {}", self.client_addr, e);
        }
    }

    async fn run_tunnel(&mut self) -> Result<(), ProxyError> {
        let upstream = match self.tracker.active_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        if !self.ds_input.is_empty() {
            write_all_flush(&mut *upstream, &self.ds_input).await?;
            self.ds_input.clear();
        }
        let (sent, received) = tokio::io::copy_bidirectional(&mut self.downstream, upstream).await?;
        debug!(
            "{}: tunnel closed after {} bytes up, {} bytes down",
            self.client_addr, sent, received
        );
        Ok(())
    }
}

async fn read_upstream(stream: Option<&mut BoxedStream>, buf: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_all_flush<W>(stream: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(data).await?;
    stream.flush().await
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

//! Incremental HTTP/1.x parser.
//!
//! Bytes may arrive split anywhere. Heads are parsed with `httparse` once
//! complete, bodies are framed by Content-Length, chunked encoding or
//! connection close. Every event is delivered to a [`ParserDelegate`].
use httparse::Status;
use thiserror::Error;

/// Largest head accepted, start line and headers together.
pub const MAX_HEAD_SIZE: usize = 80 * 1024;

const MAX_HEADERS: usize = 100;
const MAX_LINE_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed message head: {0}")]
    Head(httparse::Error),
    #[error("message head exceeds {} bytes", MAX_HEAD_SIZE)]
    HeadTooLarge,
    #[error("invalid content-length")]
    BadContentLength,
    #[error("invalid chunk size")]
    BadChunkSize,
    #[error("unexpected data after chunk")]
    BadDataAfterChunk,
    #[error("stream ended in the middle of a message")]
    UnexpectedEof,
}

/// Receives parser events.
///
/// Head callbacks can't fail. Head-complete, body and message-complete
/// callbacks run filters and may end the connection.
pub trait ParserDelegate {
    type Error: From<ParseError>;

    fn on_req_method(&mut self, _method: &str) {}
    fn on_req_path(&mut self, _url: &str) {}
    fn on_status(&mut self, _code: u16, _reason: &str) {}
    fn on_http_version(&mut self, _major: u8, _minor: u8) {}
    fn on_header_field(&mut self, _field: &str) {}
    fn on_header_value(&mut self, _value: &str) {}

    fn on_headers_complete(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_body(&mut self, _chunk: &[u8], _is_chunked: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_message_complete(&mut self, _is_chunked: bool, _keep_alive: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Checked after each head-complete, body and message-complete event.
    /// Returning true makes `execute` stop and report how much it consumed.
    fn should_yield(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    UntilClose,
    /// Message fully read; completion not delivered yet.
    Complete,
    /// CONNECT accepted; the rest of the stream isn't HTTP.
    Tunnel,
}

#[derive(Debug)]
pub struct Parser {
    kind: ParserKind,
    state: State,
    buf: Vec<u8>,
    chunked: bool,
    keep_alive: bool,
    skip_body: bool,
    tunnel: bool,
}

impl Parser {
    pub fn new(kind: ParserKind) -> Self {
        Self {
            kind,
            state: State::Head,
            buf: Vec::new(),
            chunked: false,
            keep_alive: false,
            skip_body: false,
            tunnel: false,
        }
    }

    pub fn request() -> Self {
        Self::new(ParserKind::Request)
    }

    pub fn response() -> Self {
        Self::new(ParserKind::Response)
    }

    /// The next response has no body (it answers a HEAD request).
    pub fn set_skip_body(&mut self, skip: bool) {
        self.skip_body = skip;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.kind);
    }

    /// A message-complete event is waiting for the next `execute` call.
    pub fn has_pending(&self) -> bool {
        self.state == State::Complete
    }

    pub fn is_tunnel(&self) -> bool {
        self.state == State::Tunnel
    }

    /// Feeds `data`, returning how many bytes were consumed. Fewer than
    /// `data.len()` are consumed when the delegate yields or a tunnel starts.
    pub fn execute<D: ParserDelegate>(&mut self, data: &[u8], delegate: &mut D) -> Result<usize, D::Error> {
        let mut pos = 0;
        loop {
            match self.state {
                State::Tunnel => return Ok(pos),
                State::Complete => {
                    let (chunked, keep_alive) = (self.chunked, self.keep_alive);
                    self.state = if self.tunnel { State::Tunnel } else { State::Head };
                    self.chunked = false;
                    delegate.on_message_complete(chunked, keep_alive)?;
                    if delegate.should_yield() {
                        return Ok(pos);
                    }
                }
                _ if pos == data.len() => return Ok(pos),
                State::Head => {
                    let prev = self.buf.len();
                    self.buf.extend_from_slice(&data[pos..]);
                    match self.parse_head(delegate)? {
                        Some(head_len) => {
                            pos += head_len.saturating_sub(prev);
                            self.buf.clear();
                            if delegate.should_yield() {
                                return Ok(pos);
                            }
                        }
                        None => {
                            if self.buf.len() > MAX_HEAD_SIZE {
                                return Err(ParseError::HeadTooLarge.into());
                            }
                            return Ok(data.len());
                        }
                    }
                }
                State::Body { remaining } => {
                    let take = remaining.min((data.len() - pos) as u64) as usize;
                    let left = remaining - take as u64;
                    self.state = if left == 0 { State::Complete } else { State::Body { remaining: left } };
                    delegate.on_body(&data[pos..pos + take], false)?;
                    pos += take;
                    if delegate.should_yield() {
                        return Ok(pos);
                    }
                }
                State::ChunkSize => {
                    if let Some(line_end) = self.read_line(data, &mut pos)? {
                        let size = match httparse::parse_chunk_size(&self.buf[..line_end]) {
                            Ok(Status::Complete((_, size))) => size,
                            _ => return Err(ParseError::BadChunkSize.into()),
                        };
                        self.buf.clear();
                        self.state = if size == 0 { State::Trailers } else { State::ChunkData { remaining: size } };
                    }
                }
                State::ChunkData { remaining } => {
                    let take = remaining.min((data.len() - pos) as u64) as usize;
                    let left = remaining - take as u64;
                    self.state = if left == 0 { State::ChunkEnd } else { State::ChunkData { remaining: left } };
                    delegate.on_body(&data[pos..pos + take], true)?;
                    pos += take;
                    if delegate.should_yield() {
                        return Ok(pos);
                    }
                }
                State::ChunkEnd => {
                    if let Some(line_end) = self.read_line(data, &mut pos)? {
                        if !is_blank_line(&self.buf[..line_end]) {
                            return Err(ParseError::BadDataAfterChunk.into());
                        }
                        self.buf.clear();
                        self.state = State::ChunkSize;
                    }
                }
                State::Trailers => {
                    if let Some(line_end) = self.read_line(data, &mut pos)? {
                        // trailer fields are dropped
                        if is_blank_line(&self.buf[..line_end]) {
                            self.state = State::Complete;
                        }
                        self.buf.clear();
                    }
                }
                State::UntilClose => {
                    let chunk = &data[pos..];
                    pos = data.len();
                    delegate.on_body(chunk, false)?;
                    if delegate.should_yield() {
                        return Ok(pos);
                    }
                }
            }
        }
    }

    /// Signals end of stream. Completes a close-delimited message; any other
    /// partially read message is an error.
    pub fn finish<D: ParserDelegate>(&mut self, delegate: &mut D) -> Result<(), D::Error> {
        match self.state {
            State::UntilClose | State::Complete => {
                let chunked = self.chunked;
                let keep_alive = self.keep_alive && self.state == State::Complete;
                self.state = State::Head;
                self.chunked = false;
                delegate.on_message_complete(chunked, keep_alive)
            }
            State::Head if self.buf.iter().all(|b| b.is_ascii_whitespace()) => Ok(()),
            State::Tunnel => Ok(()),
            _ => Err(ParseError::UnexpectedEof.into()),
        }
    }

    /// Appends bytes up to and including the next `\n` to the line buffer.
    /// Returns the line length once the line is complete.
    fn read_line(&mut self, data: &[u8], pos: &mut usize) -> Result<Option<usize>, ParseError> {
        let rest = &data[*pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(i) => {
                self.buf.extend_from_slice(&rest[..=i]);
                *pos += i + 1;
                Ok(Some(self.buf.len()))
            }
            None => {
                self.buf.extend_from_slice(rest);
                *pos = data.len();
                if self.buf.len() > MAX_LINE_SIZE {
                    return Err(ParseError::BadChunkSize);
                }
                Ok(None)
            }
        }
    }

    /// Parses the buffered head. Returns its length once complete.
    fn parse_head<D: ParserDelegate>(&mut self, delegate: &mut D) -> Result<Option<usize>, D::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let head = match self.kind {
            ParserKind::Request => {
                let mut req = httparse::Request::new(&mut headers);
                let len = match req.parse(&self.buf).map_err(ParseError::Head)? {
                    Status::Complete(len) => len,
                    Status::Partial => return Ok(None),
                };
                let method = req.method.unwrap_or_default();
                delegate.on_req_method(method);
                delegate.on_req_path(req.path.unwrap_or_default());
                Head {
                    len,
                    minor: req.version.unwrap_or(1),
                    is_connect: method.eq_ignore_ascii_case("CONNECT"),
                    status: None,
                    framing: emit_headers(req.headers, delegate)?,
                }
            }
            ParserKind::Response => {
                let mut resp = httparse::Response::new(&mut headers);
                let len = match resp.parse(&self.buf).map_err(ParseError::Head)? {
                    Status::Complete(len) => len,
                    Status::Partial => return Ok(None),
                };
                let code = resp.code.unwrap_or_default();
                delegate.on_status(code, resp.reason.unwrap_or_default());
                Head {
                    len,
                    minor: resp.version.unwrap_or(1),
                    is_connect: false,
                    status: Some(code),
                    framing: emit_headers(resp.headers, delegate)?,
                }
            }
        };
        delegate.on_http_version(1, head.minor);

        let framing = head.framing;
        self.keep_alive = if head.minor >= 1 {
            !framing.close
        } else {
            framing.keep_alive
        };
        self.chunked = framing.chunked;
        self.state = match head.status {
            None if head.is_connect => {
                self.tunnel = true;
                State::Complete
            }
            None => body_state(&framing).unwrap_or(State::Complete),
            Some(code) if self.skip_body || (100..200).contains(&code) || code == 204 || code == 304 => {
                self.chunked = false;
                State::Complete
            }
            Some(_) => body_state(&framing).unwrap_or_else(|| {
                self.keep_alive = false;
                State::UntilClose
            }),
        };

        delegate.on_headers_complete()?;
        Ok(Some(head.len))
    }
}

struct Head {
    len: usize,
    minor: u8,
    is_connect: bool,
    status: Option<u16>,
    framing: Framing,
}

#[derive(Debug, Default)]
struct Framing {
    content_length: Option<u64>,
    chunked: bool,
    close: bool,
    keep_alive: bool,
}

fn body_state(framing: &Framing) -> Option<State> {
    if framing.chunked {
        return Some(State::ChunkSize);
    }
    match framing.content_length {
        Some(0) => Some(State::Complete),
        Some(n) => Some(State::Body { remaining: n }),
        None => None,
    }
}

fn emit_headers<D: ParserDelegate>(headers: &[httparse::Header<'_>], delegate: &mut D) -> Result<Framing, ParseError> {
    let mut framing = Framing::default();
    for header in headers {
        let value = String::from_utf8_lossy(header.value);
        let value = value.trim();
        delegate.on_header_field(header.name);
        delegate.on_header_value(value);

        if header.name.eq_ignore_ascii_case("content-length") {
            let len = value.parse::<u64>().map_err(|_| ParseError::BadContentLength)?;
            if framing.content_length.map_or(false, |prev| prev != len) {
                return Err(ParseError::BadContentLength);
            }
            framing.content_length = Some(len);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            framing.chunked = value
                .rsplit(',')
                .next()
                .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"));
        } else if header.name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    framing.close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    framing.keep_alive = true;
                }
            }
        }
    }
    Ok(framing)
}

fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

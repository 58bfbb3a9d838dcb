//! HTTP/1.x decoder
//!
//! Requests and responses are parsed with httparse as soon as the header
//! block is complete, then the body is tracked (Content-Length, chunked or
//! read-until-close) without being retained. Requests and responses pair in
//! arrival order, so pipelined requests are supported.

use crate::stream::{Half, Phase};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use tracing::trace;
use wiretap_core::message::{DecodeEvent, Message, MessageKind};
use wiretap_core::packet::Direction;

pub const PROTOCOL: &str = "http";

const MAX_HEADERS: usize = 64;
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4096;

/// Parsed request line or status line plus headers
#[derive(Debug, Clone)]
enum Head {
    Request {
        method: String,
        path: String,
        version: u8,
        headers: Vec<(String, String)>,
    },
    Response {
        code: u16,
        reason: String,
        version: u8,
        headers: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, Copy)]
enum ChunkStep {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy)]
enum Body {
    Length(usize),
    Chunked(ChunkStep),
    UntilClose,
}

#[derive(Debug)]
struct Pending {
    message: Message,
    body: Body,
    body_bytes: usize,
}

#[derive(Debug, Default)]
struct Side {
    io: Half,
    pending: Option<Pending>,
}

/// Stream decoder for one HTTP/1.x connection
#[derive(Debug)]
pub struct HttpDecoder {
    sides: [Side; 2],
    /// Methods of requests still waiting for a response, oldest first
    methods: VecDeque<String>,
    capture_headers: Vec<String>,
}

impl HttpDecoder {
    /// `capture_headers` names extra headers copied into the message fields
    pub fn new(capture_headers: &[String]) -> Self {
        Self {
            sides: Default::default(),
            methods: VecDeque::new(),
            capture_headers: capture_headers.iter().map(|h| h.to_lowercase()).collect(),
        }
    }

    pub fn phase(&self, direction: Direction) -> Phase {
        self.sides[direction.index()].io.phase
    }

    pub fn consume(&mut self, bytes: &[u8], direction: Direction, ts: u64) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if self.sides[direction.index()].io.accept(bytes, ts) {
            self.drive(direction, &mut events);
        }
        events
    }

    /// Bytes missing from the stream. A gap inside a body of known length is
    /// skipped; anywhere else the message boundary is lost.
    pub fn on_gap(&mut self, direction: Direction, len: usize) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        let side = &mut self.sides[direction.index()];
        if !side.io.is_open() {
            return events;
        }

        let skipped = match side.pending.as_mut() {
            Some(pending) if side.io.buf.is_empty() => match &mut pending.body {
                Body::Length(remaining) if len <= *remaining => {
                    *remaining -= len;
                    true
                }
                Body::Chunked(ChunkStep::Data(remaining)) if len <= *remaining => {
                    *remaining -= len;
                    if *remaining == 0 {
                        pending.body = Body::Chunked(ChunkStep::DataEnd);
                    }
                    true
                }
                Body::UntilClose => true,
                _ => false,
            },
            _ => false,
        };

        if skipped {
            if let Some(pending) = side.pending.as_mut() {
                pending.body_bytes += len;
                pending.message.set("truncated", true);
            }
            side.io.consumed += len;
            if matches!(
                side.pending.as_ref().map(|p| p.body),
                Some(Body::Length(0))
            ) {
                self.complete_pending(direction, &mut events);
            }
            self.drive(direction, &mut events);
        } else {
            side.pending = None;
            events.push(side.io.corrupt(
                PROTOCOL,
                direction,
                format!("stream gap of {} bytes outside a message body", len),
            ));
        }
        events
    }

    /// Connection closed: finish read-until-close responses and report
    /// anything left half-parsed.
    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        for direction in [Direction::ToServer, Direction::ToClient] {
            let side = &mut self.sides[direction.index()];
            let until_close = matches!(
                side.pending.as_ref().map(|p| p.body),
                Some(Body::UntilClose)
            );
            if until_close {
                self.complete_pending(direction, &mut events);
                self.sides[direction.index()].io.complete();
            } else if side.io.has_partial() {
                side.pending = None;
                events.push(side.io.corrupt(
                    PROTOCOL,
                    direction,
                    "connection closed mid-message",
                ));
            }
        }
        events
    }

    pub fn reset(&mut self) {
        self.sides = Default::default();
        self.methods.clear();
    }

    fn drive(&mut self, direction: Direction, events: &mut Vec<DecodeEvent>) {
        loop {
            let side = &mut self.sides[direction.index()];
            let result = match side.io.phase {
                Phase::AwaitingHeader if side.io.buf.is_empty() => return,
                Phase::AwaitingHeader => self.read_head(direction, events),
                Phase::ReadingBody => match read_body(side) {
                    Ok(true) => {
                        self.complete_pending(direction, events);
                        Ok(true)
                    }
                    other => other,
                },
                Phase::Complete | Phase::Corrupt => return,
            };

            match result {
                Ok(true) => continue,
                Ok(false) => return,
                Err(reason) => {
                    let side = &mut self.sides[direction.index()];
                    side.pending = None;
                    events.push(side.io.corrupt(PROTOCOL, direction, reason));
                    return;
                }
            }
        }
    }

    /// Parse a header block if one is buffered. Ok(true) means progress was made.
    fn read_head(&mut self, direction: Direction, events: &mut Vec<DecodeEvent>) -> Result<bool, String> {
        let side = &mut self.sides[direction.index()];
        let Some((head_len, head)) = parse_head(&side.io.buf, direction)? else {
            if side.io.buf.len() > MAX_HEADER_BYTES {
                return Err(format!("header block exceeds {} bytes", MAX_HEADER_BYTES));
            }
            return Ok(false);
        };
        side.io.advance(head_len);
        let start_ns = side.io.start_ts;

        let (mut message, body, upgrade) = match head {
            Head::Request {
                method,
                path,
                version,
                headers,
            } => {
                let mut message = Message::new(PROTOCOL, MessageKind::Request, direction, start_ns);
                message.set("method", method.clone());
                message.set("path", path);
                message.set("version", format!("HTTP/1.{}", version));
                message.set("host", header(&headers, "host"));
                message.set("user_agent", header(&headers, "user-agent"));
                message.set("content_type", header(&headers, "content-type"));
                self.capture(&mut message, &headers);

                let body = request_body(&headers)?;
                self.methods.push_back(method);
                (message, body, false)
            }
            Head::Response {
                code,
                reason,
                version,
                headers,
            } => {
                if (100..200).contains(&code) && code != 101 {
                    // Interim response, the final one follows on the same stream
                    trace!(code, "Skipping interim HTTP response");
                    let side = &mut self.sides[direction.index()];
                    side.io.finish_message();
                    return Ok(true);
                }

                let method = self.methods.pop_front();
                let mut message = Message::new(PROTOCOL, MessageKind::Response, direction, start_ns)
                    .with_error(code >= 400);
                message.set("status_code", code);
                message.set("status_phrase", reason);
                message.set("version", format!("HTTP/1.{}", version));
                message.set("content_type", header(&headers, "content-type"));
                self.capture(&mut message, &headers);

                let tunnel = code == 101
                    || (method.as_deref() == Some("CONNECT") && (200..300).contains(&code));
                let body = response_body(method.as_deref(), code, &headers)?;
                (message, body, tunnel)
            }
        };

        let side = &mut self.sides[direction.index()];
        match body {
            None => {
                message.set("body_bytes", 0);
                let size = side.io.finish_message();
                let message = message.with_end(side.io.last_ts).with_size(size);
                events.push(DecodeEvent::Message(message));
            }
            Some(body) => {
                side.io.phase = Phase::ReadingBody;
                side.pending = Some(Pending {
                    message,
                    body,
                    body_bytes: 0,
                });
            }
        }

        if upgrade {
            // Whatever follows is not HTTP anymore
            for side in &mut self.sides {
                side.pending = None;
                side.io.complete();
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn complete_pending(&mut self, direction: Direction, events: &mut Vec<DecodeEvent>) {
        let side = &mut self.sides[direction.index()];
        if let Some(pending) = side.pending.take() {
            let mut message = pending.message;
            message.set("body_bytes", pending.body_bytes);
            let size = side.io.finish_message();
            let message = message.with_end(side.io.last_ts).with_size(size);
            events.push(DecodeEvent::Message(message));
        }
    }

    fn capture(&self, message: &mut Message, headers: &[(String, String)]) {
        if self.capture_headers.is_empty() {
            return;
        }
        let captured: Map<String, Value> = headers
            .iter()
            .filter(|(name, _)| self.capture_headers.contains(name))
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        if !captured.is_empty() {
            message.set("headers", Value::Object(captured));
        }
    }
}

/// Parse a request (to server) or status line (to client) with its headers
fn parse_head(data: &[u8], direction: Direction) -> Result<Option<(usize, Head)>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match direction {
        Direction::ToServer => {
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(data) {
                Ok(httparse::Status::Complete(len)) => Ok(Some((
                    len,
                    Head::Request {
                        method: req.method.unwrap_or_default().to_string(),
                        path: req.path.unwrap_or_default().to_string(),
                        version: req.version.unwrap_or(1),
                        headers: collect_headers(req.headers),
                    },
                ))),
                Ok(httparse::Status::Partial) => Ok(None),
                Err(e) => Err(format!("invalid request head: {}", e)),
            }
        }
        Direction::ToClient => {
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(data) {
                Ok(httparse::Status::Complete(len)) => Ok(Some((
                    len,
                    Head::Response {
                        code: resp.code.unwrap_or_default(),
                        reason: resp.reason.unwrap_or_default().to_string(),
                        version: resp.version.unwrap_or(1),
                        headers: collect_headers(resp.headers),
                    },
                ))),
                Ok(httparse::Status::Partial) => Ok(None),
                Err(e) => Err(format!("invalid response head: {}", e)),
            }
        }
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

fn header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header(headers, "transfer-encoding")
        .and_then(|te| te.rsplit(',').next().map(|last| last.trim().eq_ignore_ascii_case("chunked")))
        .unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, String> {
    match header(headers, "content-length") {
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| format!("invalid content-length '{}'", value)),
        None => Ok(None),
    }
}

/// Requests without a length have no body
fn request_body(headers: &[(String, String)]) -> Result<Option<Body>, String> {
    if is_chunked(headers) {
        return Ok(Some(Body::Chunked(ChunkStep::Size)));
    }
    Ok(match content_length(headers)? {
        Some(0) | None => None,
        Some(n) => Some(Body::Length(n)),
    })
}

fn response_body(
    method: Option<&str>,
    code: u16,
    headers: &[(String, String)],
) -> Result<Option<Body>, String> {
    if method == Some("HEAD") || (100..200).contains(&code) || code == 204 || code == 304 {
        return Ok(None);
    }
    if is_chunked(headers) {
        return Ok(Some(Body::Chunked(ChunkStep::Size)));
    }
    Ok(match content_length(headers)? {
        Some(0) => None,
        Some(n) => Some(Body::Length(n)),
        None => Some(Body::UntilClose),
    })
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(line).map_err(|_| "non-ascii chunk size".to_string())?;
    let size = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16).map_err(|_| format!("invalid chunk size '{}'", size))
}

/// Advance through the body. Ok(true) once the body is complete.
fn read_body(side: &mut Side) -> Result<bool, String> {
    let Side { io, pending } = side;
    let Some(pending) = pending.as_mut() else {
        return Err("body without a message".to_string());
    };

    loop {
        match &mut pending.body {
            Body::Length(remaining) => {
                let take = (*remaining).min(io.buf.len());
                io.advance(take);
                pending.body_bytes += take;
                *remaining -= take;
                return Ok(*remaining == 0);
            }
            Body::UntilClose => {
                let take = io.buf.len();
                io.advance(take);
                pending.body_bytes += take;
                return Ok(false);
            }
            Body::Chunked(step) => match *step {
                ChunkStep::Size => {
                    let Some(end) = find_crlf(&io.buf) else {
                        if io.buf.len() > MAX_CHUNK_LINE {
                            return Err("chunk size line too long".to_string());
                        }
                        return Ok(false);
                    };
                    let size = parse_chunk_size(&io.buf[..end])?;
                    io.advance(end + 2);
                    *step = if size == 0 {
                        ChunkStep::Trailer
                    } else {
                        ChunkStep::Data(size)
                    };
                }
                ChunkStep::Data(remaining) => {
                    let take = remaining.min(io.buf.len());
                    io.advance(take);
                    pending.body_bytes += take;
                    if take < remaining {
                        *step = ChunkStep::Data(remaining - take);
                        return Ok(false);
                    }
                    *step = ChunkStep::DataEnd;
                }
                ChunkStep::DataEnd => {
                    if io.buf.len() < 2 {
                        return Ok(false);
                    }
                    if &io.buf[..2] != b"\r\n" {
                        return Err("missing CRLF after chunk data".to_string());
                    }
                    io.advance(2);
                    *step = ChunkStep::Size;
                }
                ChunkStep::Trailer => {
                    let Some(end) = find_crlf(&io.buf) else {
                        if io.buf.len() > MAX_HEADER_BYTES {
                            return Err("trailer block too long".to_string());
                        }
                        return Ok(false);
                    };
                    io.advance(end + 2);
                    if end == 0 {
                        return Ok(true);
                    }
                }
            },
        }
    }
}

//! Thrift binary protocol decoder
//!
//! Handles framed (4-byte length prefix) and unframed transports, strict
//! (versioned) and legacy message headers. Arguments and results are not
//! materialized: the struct body is walked only to find the message end and
//! to pull out the TApplicationException details.

use crate::stream::{Half, Incomplete, Phase, Reader};
use wiretap_core::config::ThriftTransport;
use wiretap_core::message::{Correlation, DecodeEvent, Diagnostic, Message, MessageKind};
use wiretap_core::packet::Direction;

pub const PROTOCOL: &str = "thrift";

const VERSION_MASK: u32 = 0xffff_0000;
const VERSION_1: u32 = 0x8001_0000;
const MAX_DEPTH: usize = 64;
const MAX_NAME_LEN: i32 = 64 * 1024;

const T_STOP: u8 = 0;
const T_BOOL: u8 = 2;
const T_BYTE: u8 = 3;
const T_DOUBLE: u8 = 4;
const T_I16: u8 = 6;
const T_I32: u8 = 8;
const T_I64: u8 = 10;
const T_STRING: u8 = 11;
const T_STRUCT: u8 = 12;
const T_MAP: u8 = 13;
const T_SET: u8 = 14;
const T_LIST: u8 = 15;
const T_UUID: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call,
    Reply,
    Exception,
    Oneway,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Call),
            2 => Some(MessageType::Reply),
            3 => Some(MessageType::Exception),
            4 => Some(MessageType::Oneway),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Call => "call",
            MessageType::Reply => "reply",
            MessageType::Exception => "exception",
            MessageType::Oneway => "oneway",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Framed,
    Unframed,
}

impl Framing {
    fn as_str(&self) -> &'static str {
        match self {
            Framing::Framed => "framed",
            Framing::Unframed => "unframed",
        }
    }
}

/// Name of a TApplicationException type code
fn application_exception_name(code: i32) -> &'static str {
    match code {
        1 => "UNKNOWN_METHOD",
        2 => "INVALID_MESSAGE_TYPE",
        3 => "WRONG_METHOD_NAME",
        4 => "BAD_SEQUENCE_ID",
        5 => "MISSING_RESULT",
        6 => "INTERNAL_ERROR",
        7 => "PROTOCOL_ERROR",
        8 => "INVALID_TRANSFORM",
        9 => "INVALID_PROTOCOL",
        10 => "UNSUPPORTED_CLIENT_TYPE",
        _ => "UNKNOWN",
    }
}

#[derive(Debug)]
struct ParsedMessage {
    name: String,
    message_type: MessageType,
    seq_id: i32,
    strict: bool,
    /// TApplicationException message and type code
    exception: Option<(Option<String>, Option<i32>)>,
    /// Field id of a declared exception in a reply (0 is the success field)
    declared_exception: Option<i16>,
}

#[derive(Debug)]
enum ParseError {
    Incomplete,
    Malformed(String),
}

impl From<Incomplete> for ParseError {
    fn from(_: Incomplete) -> Self {
        ParseError::Incomplete
    }
}

fn malformed<T>(reason: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError::Malformed(reason.into()))
}

fn read_string(r: &mut Reader<'_>, len: i32) -> Result<String, ParseError> {
    if len < 0 {
        return malformed(format!("negative string length {}", len));
    }
    let bytes = r.bytes(len as usize)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn read_i16(r: &mut Reader<'_>) -> Result<i16, Incomplete> {
    Ok(r.u16()? as i16)
}

fn skip_struct(r: &mut Reader<'_>, depth: usize) -> Result<(), ParseError> {
    loop {
        let field_type = r.u8()?;
        if field_type == T_STOP {
            return Ok(());
        }
        read_i16(r)?;
        skip(r, field_type, depth)?;
    }
}

fn skip_count(r: &mut Reader<'_>) -> Result<usize, ParseError> {
    let count = r.i32()?;
    if count < 0 {
        return malformed(format!("negative container size {}", count));
    }
    Ok(count as usize)
}

/// Skip one value of `field_type`
fn skip(r: &mut Reader<'_>, field_type: u8, depth: usize) -> Result<(), ParseError> {
    if depth > MAX_DEPTH {
        return malformed("struct nesting too deep");
    }
    match field_type {
        T_BOOL | T_BYTE => r.skip(1)?,
        T_I16 => r.skip(2)?,
        T_I32 => r.skip(4)?,
        T_DOUBLE | T_I64 => r.skip(8)?,
        T_UUID => r.skip(16)?,
        T_STRING => {
            let len = r.i32()?;
            if len < 0 {
                return malformed(format!("negative string length {}", len));
            }
            r.skip(len as usize)?;
        }
        T_STRUCT => skip_struct(r, depth + 1)?,
        T_MAP => {
            let key = r.u8()?;
            let value = r.u8()?;
            for _ in 0..skip_count(r)? {
                skip(r, key, depth + 1)?;
                skip(r, value, depth + 1)?;
            }
        }
        T_SET | T_LIST => {
            let elem = r.u8()?;
            for _ in 0..skip_count(r)? {
                skip(r, elem, depth + 1)?;
            }
        }
        other => return malformed(format!("unknown field type {}", other)),
    }
    Ok(())
}

/// Pull message and type out of a TApplicationException struct
fn read_application_exception(r: &mut Reader<'_>) -> Result<(Option<String>, Option<i32>), ParseError> {
    let mut message = None;
    let mut code = None;
    loop {
        let field_type = r.u8()?;
        if field_type == T_STOP {
            return Ok((message, code));
        }
        let id = read_i16(r)?;
        match (id, field_type) {
            (1, T_STRING) => {
                let len = r.i32()?;
                message = Some(read_string(r, len)?);
            }
            (2, T_I32) => code = Some(r.i32()?),
            _ => skip(r, field_type, 1)?,
        }
    }
}

/// First field id of a reply struct; anything but 0 is a declared exception
fn read_reply(r: &mut Reader<'_>) -> Result<Option<i16>, ParseError> {
    let mut declared = None;
    loop {
        let field_type = r.u8()?;
        if field_type == T_STOP {
            return Ok(declared);
        }
        let id = read_i16(r)?;
        if id != 0 && declared.is_none() {
            declared = Some(id);
        }
        skip(r, field_type, 1)?;
    }
}

/// Parse one complete message. Returns it with the number of bytes used.
fn parse_message(data: &[u8]) -> Result<(ParsedMessage, usize), ParseError> {
    let mut r = Reader::new(data);
    let first = r.i32()?;

    let (strict, type_byte, name) = if first < 0 {
        let version = first as u32;
        if version & VERSION_MASK != VERSION_1 {
            return malformed(format!("bad protocol version 0x{:08x}", version));
        }
        let len = r.i32()?;
        if len > MAX_NAME_LEN {
            return malformed("method name too long");
        }
        let name = read_string(&mut r, len)?;
        (true, (version & 0xff) as u8, name)
    } else {
        if first > MAX_NAME_LEN {
            return malformed("method name too long");
        }
        let name = read_string(&mut r, first)?;
        (false, r.u8()?, name)
    };

    let Some(message_type) = MessageType::from_u8(type_byte) else {
        return malformed(format!("unknown message type {}", type_byte));
    };
    let seq_id = r.i32()?;

    let mut exception = None;
    let mut declared_exception = None;
    match message_type {
        MessageType::Exception => exception = Some(read_application_exception(&mut r)?),
        MessageType::Reply => declared_exception = read_reply(&mut r)?,
        MessageType::Call | MessageType::Oneway => skip_struct(&mut r, 0)?,
    }

    Ok((
        ParsedMessage {
            name,
            message_type,
            seq_id,
            strict,
            exception,
            declared_exception,
        },
        r.position(),
    ))
}

/// Guess the transport from the first bytes of a direction
fn detect_framing(buf: &[u8]) -> Option<Framing> {
    if buf.len() >= 2 && buf[0] == 0x80 && buf[1] == 0x01 {
        return Some(Framing::Unframed);
    }
    if buf.len() >= 6 && buf[4] == 0x80 && buf[5] == 0x01 {
        return Some(Framing::Framed);
    }
    if buf.len() < 8 {
        return None;
    }
    // Legacy header: framed starts with the frame length then the name
    // length, unframed starts with the name length then the name itself.
    let frame_len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let name_len = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if frame_len > 0 && name_len >= 0 && name_len.saturating_add(9) <= frame_len {
        Some(Framing::Framed)
    } else {
        Some(Framing::Unframed)
    }
}

#[derive(Debug, Default)]
struct Side {
    io: Half,
    framing: Option<Framing>,
    /// Bytes of a frame lost to a gap still to be thrown away
    skip: usize,
}

/// Stream decoder for one Thrift connection
#[derive(Debug)]
pub struct ThriftDecoder {
    sides: [Side; 2],
    transport: ThriftTransport,
    max_message_bytes: usize,
}

impl ThriftDecoder {
    pub fn new(transport: ThriftTransport, max_message_bytes: usize) -> Self {
        let mut decoder = Self {
            sides: Default::default(),
            transport,
            max_message_bytes,
        };
        decoder.reset();
        decoder
    }

    pub fn phase(&self, direction: Direction) -> Phase {
        self.sides[direction.index()].io.phase
    }

    pub fn reset(&mut self) {
        let framing = match self.transport {
            ThriftTransport::Auto => None,
            ThriftTransport::Framed => Some(Framing::Framed),
            ThriftTransport::Unframed => Some(Framing::Unframed),
        };
        for side in &mut self.sides {
            side.io.reset();
            side.framing = framing;
            side.skip = 0;
        }
    }

    pub fn consume(&mut self, bytes: &[u8], direction: Direction, ts: u64) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        let max = self.max_message_bytes;
        let side = &mut self.sides[direction.index()];

        let bytes = if side.skip > 0 {
            let n = side.skip.min(bytes.len());
            side.skip -= n;
            &bytes[n..]
        } else {
            bytes
        };
        if bytes.is_empty() || !side.io.accept(bytes, ts) {
            return events;
        }

        loop {
            if side.io.buf.is_empty() {
                side.io.phase = Phase::AwaitingHeader;
                break;
            }
            let framing = match side.framing {
                Some(framing) => framing,
                None => match detect_framing(&side.io.buf) {
                    Some(framing) => {
                        side.framing = Some(framing);
                        framing
                    }
                    None => break,
                },
            };

            let outcome = match framing {
                Framing::Framed => {
                    if side.io.buf.len() < 4 {
                        break;
                    }
                    let b = &side.io.buf;
                    let len = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                    if len <= 0 || len as usize > max {
                        events.push(side.io.corrupt(
                            PROTOCOL,
                            direction,
                            format!("invalid frame length {}", len),
                        ));
                        break;
                    }
                    let total = 4 + len as usize;
                    side.io.phase = Phase::ReadingBody;
                    if side.io.buf.len() < total {
                        break;
                    }
                    match parse_message(&side.io.buf[4..total]) {
                        Ok((parsed, _)) => Ok((parsed, total)),
                        Err(ParseError::Incomplete) => Err("message truncated inside frame".to_string()),
                        Err(ParseError::Malformed(reason)) => Err(reason),
                    }
                }
                Framing::Unframed => match parse_message(&side.io.buf) {
                    Ok(done) => Ok(done),
                    Err(ParseError::Incomplete) => {
                        if side.io.buf.len() > max {
                            Err(format!("message exceeds {} bytes", max))
                        } else {
                            side.io.phase = Phase::ReadingBody;
                            break;
                        }
                    }
                    Err(ParseError::Malformed(reason)) => Err(reason),
                },
            };

            match outcome {
                Ok((parsed, used)) => {
                    let start_ns = side.io.start_ts;
                    side.io.advance(used);
                    let size = side.io.finish_message();
                    events.push(DecodeEvent::Message(build_message(
                        parsed,
                        framing,
                        direction,
                        start_ns,
                        side.io.last_ts,
                        size,
                    )));
                }
                Err(reason) => {
                    events.push(side.io.corrupt(PROTOCOL, direction, reason));
                    break;
                }
            }
        }
        events
    }

    /// A gap inside a frame of known length loses that message only
    pub fn on_gap(&mut self, direction: Direction, len: usize) -> Vec<DecodeEvent> {
        let side = &mut self.sides[direction.index()];
        if !side.io.is_open() {
            return Vec::new();
        }

        if side.framing == Some(Framing::Framed) && side.io.buf.len() >= 4 {
            let b = &side.io.buf;
            let frame = i32::from_be_bytes([b[0], b[1], b[2], b[3]]).max(0) as usize + 4;
            let buffered = side.io.buf.len();
            if buffered < frame && buffered + len <= frame {
                side.skip = frame - buffered - len;
                let diagnostic = Diagnostic {
                    protocol: PROTOCOL.to_string(),
                    direction,
                    timestamp_ns: side.io.last_ts,
                    reason: format!("message lost to a stream gap of {} bytes", len),
                    discarded: buffered,
                };
                side.io.buf.clear();
                side.io.finish_message();
                return vec![DecodeEvent::Diagnostic(diagnostic)];
            }
        }

        vec![side.io.corrupt(
            PROTOCOL,
            direction,
            format!("stream gap of {} bytes outside a frame", len),
        )]
    }

    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        for direction in [Direction::ToServer, Direction::ToClient] {
            let side = &mut self.sides[direction.index()];
            if side.io.has_partial() {
                events.push(side.io.corrupt(
                    PROTOCOL,
                    direction,
                    "connection closed mid-message",
                ));
            }
        }
        events
    }
}

fn build_message(
    parsed: ParsedMessage,
    framing: Framing,
    direction: Direction,
    start_ns: u64,
    end_ns: u64,
    size: usize,
) -> Message {
    let kind = match parsed.message_type {
        MessageType::Call => MessageKind::Request,
        MessageType::Reply | MessageType::Exception => MessageKind::Response,
        MessageType::Oneway => MessageKind::OneWay,
    };
    let is_error = parsed.message_type == MessageType::Exception || parsed.declared_exception.is_some();

    let mut message = Message::new(PROTOCOL, kind, direction, start_ns)
        .with_correlation(Correlation::id(parsed.seq_id))
        .with_end(end_ns)
        .with_size(size)
        .with_error(is_error);
    message.set("method", parsed.name);
    message.set("seq_id", parsed.seq_id);
    message.set("message_type", parsed.message_type.as_str());
    message.set("transport", framing.as_str());
    message.set("header", if parsed.strict { "strict" } else { "legacy" });
    if let Some((text, code)) = parsed.exception {
        message.set("exception_message", text);
        message.set("exception_type", code.map(application_exception_name));
        message.set("exception_code", code);
    }
    message.set("declared_exception", parsed.declared_exception);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict_header(message_type: u8, name: &str, seq_id: i32) -> Vec<u8> {
        let mut out = vec![0x80, 0x01, 0x00, message_type];
        out.extend_from_slice(&(name.len() as i32).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&seq_id.to_be_bytes());
        out
    }

    fn legacy_header(message_type: u8, name: &str, seq_id: i32) -> Vec<u8> {
        let mut out = (name.len() as i32).to_be_bytes().to_vec();
        out.extend_from_slice(name.as_bytes());
        out.push(message_type);
        out.extend_from_slice(&seq_id.to_be_bytes());
        out
    }

    fn framed(msg: Vec<u8>) -> Vec<u8> {
        let mut out = (msg.len() as i32).to_be_bytes().to_vec();
        out.extend(msg);
        out
    }

    fn call(name: &str, seq_id: i32) -> Vec<u8> {
        let mut msg = strict_header(1, name, seq_id);
        // field 1: string, field 2: list<i32>, field 3: map<string,struct{}>
        msg.extend_from_slice(&[T_STRING, 0, 1, 0, 0, 0, 3]);
        msg.extend_from_slice(b"abc");
        msg.extend_from_slice(&[T_LIST, 0, 2, T_I32, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2]);
        msg.extend_from_slice(&[T_MAP, 0, 3, T_STRING, T_STRUCT, 0, 0, 0, 1, 0, 0, 0, 1, b'k', T_STOP]);
        msg.push(T_STOP);
        msg
    }

    fn decoder() -> ThriftDecoder {
        ThriftDecoder::new(ThriftTransport::Auto, 1024 * 1024)
    }

    fn messages(events: Vec<DecodeEvent>) -> Vec<Message> {
        events
            .into_iter()
            .filter_map(|e| match e {
                DecodeEvent::Message(m) => Some(m),
                DecodeEvent::Diagnostic(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_framed_call_and_reply() {
        let mut d = decoder();
        let req = framed(call("getUser", 7));
        let out = messages(d.consume(&req, Direction::ToServer, 10));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, MessageKind::Request);
        assert_eq!(out[0].field_str("method"), Some("getUser"));
        assert_eq!(out[0].field_str("transport"), Some("framed"));
        assert_eq!(out[0].correlation, Correlation::id(7));
        assert_eq!(out[0].size, req.len());

        let mut reply = strict_header(2, "getUser", 7);
        reply.extend_from_slice(&[T_STRING, 0, 0, 0, 0, 0, 2, b'o', b'k', T_STOP]);
        let out = messages(d.consume(&framed(reply), Direction::ToClient, 20));
        assert_eq!(out[0].kind, MessageKind::Response);
        assert_eq!(out[0].field_str("message_type"), Some("reply"));
        assert!(!out[0].is_error);
    }

    #[test]
    fn test_oneway_and_declared_exception() {
        let mut d = decoder();
        let mut oneway = strict_header(4, "logEvent", 3);
        oneway.push(T_STOP);
        let out = messages(d.consume(&framed(oneway), Direction::ToServer, 1));
        assert_eq!(out[0].kind, MessageKind::OneWay);

        // Reply carrying exception field 1 instead of the success field
        let mut reply = strict_header(2, "getUser", 4);
        reply.extend_from_slice(&[T_STRUCT, 0, 1, T_STOP, T_STOP]);
        let out = messages(d.consume(&framed(reply), Direction::ToClient, 2));
        assert!(out[0].is_error);
        assert_eq!(out[0].fields["declared_exception"], 1);
    }

    #[test]
    fn test_application_exception() {
        let mut d = decoder();
        let mut exc = strict_header(3, "getUser", 9);
        exc.extend_from_slice(&[T_STRING, 0, 1, 0, 0, 0, 4]);
        exc.extend_from_slice(b"boom");
        exc.extend_from_slice(&[T_I32, 0, 2, 0, 0, 0, 6, T_STOP]);
        let out = messages(d.consume(&framed(exc), Direction::ToClient, 5));
        assert!(out[0].is_error);
        assert_eq!(out[0].field_str("exception_message"), Some("boom"));
        assert_eq!(out[0].field_str("exception_type"), Some("INTERNAL_ERROR"));
        assert_eq!(out[0].fields["exception_code"], 6);
    }

    #[test]
    fn test_legacy_unframed_split() {
        let mut d = decoder();
        let mut msg = legacy_header(1, "ping", 1);
        msg.push(T_STOP);
        let mut second = legacy_header(1, "ping", 2);
        second.push(T_STOP);
        msg.extend(second);

        let mut out = Vec::new();
        for (i, piece) in msg.chunks(3).enumerate() {
            out.extend(messages(d.consume(piece, Direction::ToServer, i as u64)));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].field_str("header"), Some("legacy"));
        assert_eq!(out[0].field_str("transport"), Some("unframed"));
        assert_eq!(out[1].correlation, Correlation::id(2));
    }

    #[test]
    fn test_strict_unframed() {
        let mut d = ThriftDecoder::new(ThriftTransport::Unframed, 1024);
        let out = messages(d.consume(&call("a", 1), Direction::ToServer, 1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field_str("transport"), Some("unframed"));
    }

    #[test]
    fn test_malformed_and_limits() {
        let mut d = decoder();
        let events = d.consume(&framed(strict_header(9, "x", 1)), Direction::ToServer, 1);
        assert!(matches!(events.as_slice(), [DecodeEvent::Diagnostic(_)]));
        assert_eq!(d.phase(Direction::ToServer), Phase::Corrupt);

        let mut d = ThriftDecoder::new(ThriftTransport::Framed, 16);
        let events = d.consume(&framed(call("tooBigForLimit", 1)), Direction::ToServer, 1);
        assert!(matches!(events.as_slice(), [DecodeEvent::Diagnostic(d)] if d.reason.contains("frame length")));
    }

    #[test]
    fn test_depth_limit() {
        let mut msg = strict_header(1, "deep", 1);
        for _ in 0..(MAX_DEPTH + 2) {
            msg.extend_from_slice(&[T_STRUCT, 0, 1]);
        }
        msg.extend(std::iter::repeat(T_STOP).take(MAX_DEPTH + 3));
        let mut d = decoder();
        let events = d.consume(&framed(msg), Direction::ToServer, 1);
        assert!(matches!(events.as_slice(), [DecodeEvent::Diagnostic(d)] if d.reason.contains("too deep")));
    }

    #[test]
    fn test_gap_inside_frame_loses_one_message() {
        let mut d = decoder();
        let first = framed(call("first", 1));
        let second = framed(call("second", 2));

        assert!(d.consume(&first[..10], Direction::ToServer, 1).is_empty());
        let events = d.on_gap(Direction::ToServer, 5);
        assert!(matches!(events.as_slice(), [DecodeEvent::Diagnostic(_)]));

        let mut rest = first[15..].to_vec();
        rest.extend_from_slice(&second);
        let out = messages(d.consume(&rest, Direction::ToServer, 2));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field_str("method"), Some("second"));
        assert_eq!(d.phase(Direction::ToServer), Phase::AwaitingHeader);
    }
}

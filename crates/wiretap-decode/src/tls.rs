//! TLS handshake metadata decoder
//!
//! Only the cleartext part of the handshake is looked at: the ClientHello
//! becomes the request and the ServerHello the response. Once a direction
//! switches to encrypted records (ChangeCipherSpec or application data) it is
//! marked complete and the rest of its bytes are ignored.

use crate::stream::{Half, Incomplete, Phase, Reader};
use serde_json::Value;
use wiretap_core::message::{DecodeEvent, Message, MessageKind};
use wiretap_core::packet::Direction;

pub const PROTOCOL: &str = "tls";

const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_ALERT: u8 = 21;
const CONTENT_HANDSHAKE: u8 = 22;
const CONTENT_APPLICATION_DATA: u8 = 23;
const CONTENT_HEARTBEAT: u8 = 24;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

const MAX_RECORD: usize = 16384 + 2048;
const MAX_HANDSHAKE: usize = 256 * 1024;

fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && (value >> 8) == (value & 0xff)
}

pub fn version_name(version: u16) -> String {
    match version {
        0x0300 => "SSL 3.0".to_string(),
        0x0301 => "TLS 1.0".to_string(),
        0x0302 => "TLS 1.1".to_string(),
        0x0303 => "TLS 1.2".to_string(),
        0x0304 => "TLS 1.3".to_string(),
        other => format!("0x{:04x}", other),
    }
}

fn cipher_suite_name(suite: u16) -> Option<&'static str> {
    Some(match suite {
        0x1301 => "TLS_AES_128_GCM_SHA256",
        0x1302 => "TLS_AES_256_GCM_SHA384",
        0x1303 => "TLS_CHACHA20_POLY1305_SHA256",
        0xc02b => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        0xc02c => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        0xc02f => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        0xc030 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        0xcca8 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        0xcca9 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        0x009c => "TLS_RSA_WITH_AES_128_GCM_SHA256",
        0x009d => "TLS_RSA_WITH_AES_256_GCM_SHA384",
        0x002f => "TLS_RSA_WITH_AES_128_CBC_SHA",
        0x0035 => "TLS_RSA_WITH_AES_256_CBC_SHA",
        _ => return None,
    })
}

fn alert_description(code: u8) -> String {
    let name = match code {
        0 => "close_notify",
        10 => "unexpected_message",
        20 => "bad_record_mac",
        22 => "record_overflow",
        40 => "handshake_failure",
        42 => "bad_certificate",
        43 => "unsupported_certificate",
        44 => "certificate_revoked",
        45 => "certificate_expired",
        46 => "certificate_unknown",
        47 => "illegal_parameter",
        48 => "unknown_ca",
        49 => "access_denied",
        50 => "decode_error",
        51 => "decrypt_error",
        70 => "protocol_version",
        71 => "insufficient_security",
        80 => "internal_error",
        86 => "inappropriate_fallback",
        90 => "user_canceled",
        109 => "missing_extension",
        110 => "unsupported_extension",
        112 => "unrecognized_name",
        116 => "certificate_required",
        120 => "no_application_protocol",
        other => return format!("alert_{}", other),
    };
    name.to_string()
}

#[derive(Debug, Default)]
struct ClientHello {
    version: u16,
    session_id: Vec<u8>,
    cipher_suites: usize,
    server_name: Option<String>,
    alpn: Vec<String>,
    supported_versions: Vec<u16>,
}

#[derive(Debug, Default)]
struct ServerHello {
    version: u16,
    session_id: Vec<u8>,
    cipher_suite: u16,
    alpn: Option<String>,
    selected_version: Option<u16>,
}

/// Walk an extensions block, calling `f` with each type and payload
fn for_each_extension(
    r: &mut Reader<'_>,
    mut f: impl FnMut(u16, &[u8]) -> Result<(), Incomplete>,
) -> Result<(), Incomplete> {
    if r.remaining() == 0 {
        return Ok(());
    }
    let total = r.u16()? as usize;
    let mut exts = Reader::new(r.bytes(total)?);
    while exts.remaining() > 0 {
        let kind = exts.u16()?;
        let len = exts.u16()? as usize;
        f(kind, exts.bytes(len)?)?;
    }
    Ok(())
}

fn parse_alpn(data: &[u8]) -> Result<Vec<String>, Incomplete> {
    let mut r = Reader::new(data);
    let total = r.u16()? as usize;
    let mut list = Reader::new(r.bytes(total)?);
    let mut out = Vec::new();
    while list.remaining() > 0 {
        let len = list.u8()? as usize;
        out.push(String::from_utf8_lossy(list.bytes(len)?).into_owned());
    }
    Ok(out)
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, Incomplete> {
    let mut r = Reader::new(data);
    let total = r.u16()? as usize;
    let mut list = Reader::new(r.bytes(total)?);
    while list.remaining() > 0 {
        let name_type = list.u8()?;
        let len = list.u16()? as usize;
        let name = list.bytes(len)?;
        if name_type == 0 {
            return Ok(Some(String::from_utf8_lossy(name).into_owned()));
        }
    }
    Ok(None)
}

fn parse_client_hello(body: &[u8]) -> Result<ClientHello, Incomplete> {
    let mut r = Reader::new(body);
    let mut hello = ClientHello {
        version: r.u16()?,
        ..Default::default()
    };
    r.skip(32)?;
    let sid_len = r.u8()? as usize;
    hello.session_id = r.bytes(sid_len)?.to_vec();
    let suites = r.u16()? as usize;
    hello.cipher_suites = r
        .bytes(suites)?
        .chunks_exact(2)
        .filter(|c| !is_grease(u16::from_be_bytes([c[0], c[1]])))
        .count();
    let compression = r.u8()? as usize;
    r.skip(compression)?;

    for_each_extension(&mut r, |kind, data| {
        match kind {
            EXT_SERVER_NAME => hello.server_name = parse_server_name(data)?,
            EXT_ALPN => hello.alpn = parse_alpn(data)?,
            EXT_SUPPORTED_VERSIONS => {
                let mut list = Reader::new(data);
                let len = list.u8()? as usize;
                hello.supported_versions = list
                    .bytes(len)?
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .filter(|v| !is_grease(*v))
                    .collect();
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(hello)
}

fn parse_server_hello(body: &[u8]) -> Result<ServerHello, Incomplete> {
    let mut r = Reader::new(body);
    let mut hello = ServerHello {
        version: r.u16()?,
        ..Default::default()
    };
    r.skip(32)?;
    let sid_len = r.u8()? as usize;
    hello.session_id = r.bytes(sid_len)?.to_vec();
    hello.cipher_suite = r.u16()?;
    r.skip(1)?;

    for_each_extension(&mut r, |kind, data| {
        match kind {
            EXT_ALPN => hello.alpn = parse_alpn(data)?.into_iter().next(),
            EXT_SUPPORTED_VERSIONS => hello.selected_version = Some(Reader::new(data).u16()?),
            _ => {}
        }
        Ok(())
    })?;
    Ok(hello)
}

#[derive(Debug, Default)]
struct Side {
    io: Half,
    /// Reassembled handshake bytes not yet parsed
    handshake: Vec<u8>,
    /// The hello for this direction has been reported
    hello_done: bool,
}

/// Stream decoder for one TLS connection
#[derive(Debug, Default)]
pub struct TlsDecoder {
    sides: [Side; 2],
    client_session_id: Vec<u8>,
}

impl TlsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, direction: Direction) -> Phase {
        self.sides[direction.index()].io.phase
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn consume(&mut self, bytes: &[u8], direction: Direction, ts: u64) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if !self.sides[direction.index()].io.accept(bytes, ts) {
            return events;
        }

        loop {
            let side = &mut self.sides[direction.index()];
            if side.io.buf.len() < 5 {
                side.io.phase = if side.io.buf.is_empty() {
                    Phase::AwaitingHeader
                } else {
                    Phase::ReadingBody
                };
                break;
            }
            let b = &side.io.buf;
            let content_type = b[0];
            let len = u16::from_be_bytes([b[3], b[4]]) as usize;
            if !(CONTENT_CHANGE_CIPHER_SPEC..=CONTENT_HEARTBEAT).contains(&content_type)
                || b[1] != 3
                || len > MAX_RECORD
            {
                events.push(side.io.corrupt(PROTOCOL, direction, "not a TLS record"));
                break;
            }
            if side.io.buf.len() < 5 + len {
                side.io.phase = Phase::ReadingBody;
                break;
            }
            let record = side.io.buf[5..5 + len].to_vec();
            side.io.advance(5 + len);

            match content_type {
                CONTENT_HANDSHAKE => {
                    if let Err(reason) = self.handshake(direction, &record, &mut events) {
                        let side = &mut self.sides[direction.index()];
                        events.push(side.io.corrupt(PROTOCOL, direction, reason));
                        break;
                    }
                }
                CONTENT_CHANGE_CIPHER_SPEC | CONTENT_APPLICATION_DATA => {
                    // Encrypted from here on
                    side.io.complete();
                    break;
                }
                CONTENT_ALERT => {
                    if let Some(message) = self.alert(direction, &record) {
                        events.push(DecodeEvent::Message(message));
                        self.sides[direction.index()].io.complete();
                        break;
                    }
                }
                _ => {}
            }
        }
        events
    }

    pub fn on_gap(&mut self, direction: Direction, len: usize) -> Vec<DecodeEvent> {
        let side = &mut self.sides[direction.index()];
        if !side.io.is_open() {
            return Vec::new();
        }
        vec![side.io.corrupt(
            PROTOCOL,
            direction,
            format!("stream gap of {} bytes during handshake", len),
        )]
    }

    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        for direction in [Direction::ToServer, Direction::ToClient] {
            let side = &mut self.sides[direction.index()];
            if side.io.has_partial() && !side.hello_done {
                events.push(side.io.corrupt(
                    PROTOCOL,
                    direction,
                    "connection closed mid-handshake",
                ));
            }
        }
        events
    }

    fn handshake(&mut self, direction: Direction, record: &[u8], events: &mut Vec<DecodeEvent>) -> Result<(), String> {
        let side = &mut self.sides[direction.index()];
        if side.hello_done {
            return Ok(());
        }
        side.handshake.extend_from_slice(record);

        while side.handshake.len() >= 4 {
            let hs = &side.handshake;
            let msg_type = hs[0];
            let len = u32::from_be_bytes([0, hs[1], hs[2], hs[3]]) as usize;
            if len > MAX_HANDSHAKE {
                return Err(format!("handshake message of {} bytes", len));
            }
            if hs.len() < 4 + len {
                break;
            }
            let body = hs[4..4 + len].to_vec();
            side.handshake.drain(..4 + len);

            let message = match (direction, msg_type) {
                (Direction::ToServer, HANDSHAKE_CLIENT_HELLO) => {
                    let hello = parse_client_hello(&body).map_err(|_| "truncated ClientHello".to_string())?;
                    self.client_session_id = hello.session_id.clone();
                    client_hello_message(hello, direction, side)
                }
                (Direction::ToClient, HANDSHAKE_SERVER_HELLO) => {
                    let hello = parse_server_hello(&body).map_err(|_| "truncated ServerHello".to_string())?;
                    server_hello_message(hello, &self.client_session_id, direction, side)
                }
                _ => continue,
            };
            events.push(DecodeEvent::Message(message));
            side.hello_done = true;
            side.handshake = Vec::new();
            break;
        }
        Ok(())
    }

    /// An alert from the server before its hello fails the handshake
    fn alert(&mut self, direction: Direction, record: &[u8]) -> Option<Message> {
        let side = &mut self.sides[direction.index()];
        if direction != Direction::ToClient || side.hello_done || record.len() < 2 {
            return None;
        }
        let start_ns = side.io.start_ts;
        let size = side.io.finish_message();
        let mut message = Message::new(PROTOCOL, MessageKind::Response, direction, start_ns)
            .with_end(side.io.last_ts)
            .with_size(size)
            .with_error(true);
        message.set("alert_level", if record[0] == 2 { "fatal" } else { "warning" });
        message.set("alert_description", alert_description(record[1]));
        side.hello_done = true;
        Some(message)
    }
}

fn client_hello_message(hello: ClientHello, direction: Direction, side: &mut Side) -> Message {
    let start_ns = side.io.start_ts;
    let size = side.io.finish_message();
    let mut message = Message::new(PROTOCOL, MessageKind::Request, direction, start_ns)
        .with_end(side.io.last_ts)
        .with_size(size);
    message.set("handshake", "client_hello");
    message.set("version", version_name(hello.version));
    message.set("server_name", hello.server_name);
    message.set("cipher_suites", hello.cipher_suites);
    if !hello.alpn.is_empty() {
        message.set("alpn", hello.alpn);
    }
    if !hello.supported_versions.is_empty() {
        let versions: Vec<Value> = hello
            .supported_versions
            .iter()
            .map(|v| Value::String(version_name(*v)))
            .collect();
        message.set("supported_versions", versions);
    }
    if !hello.session_id.is_empty() {
        message.set("session_id", hex::encode(&hello.session_id));
    }
    message
}

fn server_hello_message(
    hello: ServerHello,
    client_session_id: &[u8],
    direction: Direction,
    side: &mut Side,
) -> Message {
    let start_ns = side.io.start_ts;
    let size = side.io.finish_message();
    let negotiated = hello.selected_version.unwrap_or(hello.version);
    let mut message = Message::new(PROTOCOL, MessageKind::Response, direction, start_ns)
        .with_end(side.io.last_ts)
        .with_size(size);
    message.set("handshake", "server_hello");
    message.set("version", version_name(negotiated));
    message.set("cipher_suite", format!("0x{:04x}", hello.cipher_suite));
    message.set("cipher_suite_name", cipher_suite_name(hello.cipher_suite));
    message.set("alpn", hello.alpn);
    if !hello.session_id.is_empty() {
        message.set("session_id", hex::encode(&hello.session_id));
    }
    // TLS 1.3 echoes the session id for middlebox compatibility, so only
    // older versions signal resumption this way
    if negotiated < 0x0304 {
        message.set(
            "resumed",
            !hello.session_id.is_empty() && hello.session_id == client_session_id,
        );
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_u16_len(body: Vec<u8>) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend(body);
        out
    }

    fn extension(kind: u16, data: Vec<u8>) -> Vec<u8> {
        let mut out = kind.to_be_bytes().to_vec();
        out.extend(with_u16_len(data));
        out
    }

    fn alpn(protocols: &[&str]) -> Vec<u8> {
        let mut list = Vec::new();
        for p in protocols {
            list.push(p.len() as u8);
            list.extend_from_slice(p.as_bytes());
        }
        extension(EXT_ALPN, with_u16_len(list))
    }

    fn handshake(kind: u8, body: Vec<u8>) -> Vec<u8> {
        let mut hs = vec![kind];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend(body);
        hs
    }

    fn record(content_type: u8, fragment: &[u8]) -> Vec<u8> {
        let mut out = vec![content_type, 3, 1];
        out.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
        out.extend_from_slice(fragment);
        out
    }

    fn client_hello() -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0x11; 32]);
        body.push(4);
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        body.extend(with_u16_len(vec![0x0a, 0x0a, 0x13, 0x01, 0x13, 0x02, 0xc0, 0x2f]));
        body.extend_from_slice(&[1, 0]);

        let mut sni = vec![0];
        sni.extend(with_u16_len(b"api.example.com".to_vec()));
        let mut exts = extension(EXT_SERVER_NAME, with_u16_len(sni));
        exts.extend(alpn(&["h2", "http/1.1"]));
        exts.extend(extension(EXT_SUPPORTED_VERSIONS, vec![6, 0x2a, 0x2a, 0x03, 0x04, 0x03, 0x03]));
        body.extend(with_u16_len(exts));
        handshake(HANDSHAKE_CLIENT_HELLO, body)
    }

    fn server_hello(session_id: &[u8], version_ext: Option<u16>) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0x22; 32]);
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);
        body.extend_from_slice(&[0xc0, 0x2f, 0]);
        let mut exts = alpn(&["h2"]);
        if let Some(v) = version_ext {
            exts.extend(extension(EXT_SUPPORTED_VERSIONS, v.to_be_bytes().to_vec()));
        }
        body.extend(with_u16_len(exts));
        handshake(HANDSHAKE_SERVER_HELLO, body)
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
    fn test_client_hello_fields() {
        let mut d = TlsDecoder::new();
        let out = messages(d.consume(&record(22, &client_hello()), Direction::ToServer, 5));
        assert_eq!(out.len(), 1);
        let hello = &out[0];
        assert_eq!(hello.kind, MessageKind::Request);
        assert_eq!(hello.field_str("server_name"), Some("api.example.com"));
        assert_eq!(hello.field_str("version"), Some("TLS 1.2"));
        // GREASE entries are not counted
        assert_eq!(hello.fields["cipher_suites"], 3);
        assert_eq!(hello.fields["alpn"], serde_json::json!(["h2", "http/1.1"]));
        assert_eq!(hello.fields["supported_versions"], serde_json::json!(["TLS 1.3", "TLS 1.2"]));
        assert_eq!(hello.field_str("session_id"), Some("deadbeef"));
    }

    #[test]
    fn test_handshake_spanning_records() {
        let hs = client_hello();
        let (a, b) = hs.split_at(20);
        let mut data = record(22, a);
        data.extend(record(22, b));

        let mut d = TlsDecoder::new();
        let mut out = Vec::new();
        for piece in data.chunks(7) {
            out.extend(messages(d.consume(piece, Direction::ToServer, 1)));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].size, data.len());
    }

    #[test]
    fn test_server_hello_and_ccs() {
        let mut d = TlsDecoder::new();
        d.consume(&record(22, &client_hello()), Direction::ToServer, 1);

        let mut data = record(22, &server_hello(&[0xde, 0xad, 0xbe, 0xef], None));
        data.extend(record(20, &[1]));
        data.extend(record(23, &[0xff; 40]));
        let out = messages(d.consume(&data, Direction::ToClient, 2));
        assert_eq!(out.len(), 1);
        let hello = &out[0];
        assert_eq!(hello.kind, MessageKind::Response);
        assert_eq!(hello.field_str("version"), Some("TLS 1.2"));
        assert_eq!(hello.field_str("cipher_suite"), Some("0xc02f"));
        assert_eq!(hello.field_str("alpn"), Some("h2"));
        assert_eq!(hello.fields["resumed"], true);
        assert!(!hello.is_error);
        assert_eq!(d.phase(Direction::ToClient), Phase::Complete);

        // Encrypted records are ignored
        assert!(d.consume(&record(23, &[0; 10]), Direction::ToClient, 3).is_empty());
    }

    #[test]
    fn test_supported_versions_override() {
        let mut d = TlsDecoder::new();
        let out = messages(d.consume(
            &record(22, &server_hello(&[], Some(0x0304))),
            Direction::ToClient,
            1,
        ));
        assert_eq!(out[0].field_str("version"), Some("TLS 1.3"));
        assert!(out[0].fields.get("resumed").is_none());
    }

    #[test]
    fn test_alert_before_server_hello() {
        let mut d = TlsDecoder::new();
        d.consume(&record(22, &client_hello()), Direction::ToServer, 1);
        let out = messages(d.consume(&record(21, &[2, 40]), Direction::ToClient, 2));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_error);
        assert_eq!(out[0].field_str("alert_level"), Some("fatal"));
        assert_eq!(out[0].field_str("alert_description"), Some("handshake_failure"));
    }

    #[test]
    fn test_not_tls() {
        let mut d = TlsDecoder::new();
        let events = d.consume(b"GET / HTTP/1.1\r\n\r\n", Direction::ToServer, 1);
        assert!(matches!(events.as_slice(), [DecodeEvent::Diagnostic(_)]));
        assert_eq!(d.phase(Direction::ToServer), Phase::Corrupt);
    }
}

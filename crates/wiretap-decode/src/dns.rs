//! DNS decoder
//!
//! UDP flows carry one message per datagram; TCP flows carry messages with a
//! two-byte length prefix. Parsing is delegated to trust-dns-proto.

use crate::stream::{Half, Phase};
use serde_json::{json, Value};
use trust_dns_proto::op::{Message as DnsMessage, MessageType, ResponseCode};
use wiretap_core::message::{Correlation, DecodeEvent, Diagnostic, Message, MessageKind};
use wiretap_core::packet::{Direction, Transport};

pub const PROTOCOL: &str = "dns";

/// Answers copied into the message fields
const MAX_ANSWERS: usize = 32;

fn trim_root(name: String) -> String {
    match name.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => name,
    }
}

fn to_message(dns: &DnsMessage, direction: Direction, start_ns: u64, end_ns: u64, size: usize) -> Message {
    let (kind, is_error) = match dns.message_type() {
        MessageType::Query => (MessageKind::Request, false),
        MessageType::Response => (MessageKind::Response, dns.response_code() != ResponseCode::NoError),
    };

    let mut message = Message::new(PROTOCOL, kind, direction, start_ns)
        .with_correlation(Correlation::id(dns.id()))
        .with_end(end_ns)
        .with_size(size)
        .with_error(is_error);

    message.set("id", dns.id());
    message.set("opcode", format!("{:?}", dns.op_code()));
    message.set("recursion_desired", dns.recursion_desired());
    if let Some(query) = dns.queries().first() {
        message.set("query_name", trim_root(query.name().to_utf8()));
        message.set("query_type", query.query_type().to_string());
        message.set("query_class", query.query_class().to_string());
    }
    if dns.queries().len() > 1 {
        message.set("query_count", dns.queries().len());
    }

    if kind == MessageKind::Response {
        let rcode = dns.response_code();
        message.set("response_code", format!("{:?}", rcode));
        message.set("rcode", u16::from(rcode));
        message.set("authoritative", dns.authoritative());
        message.set("truncated", dns.truncated());
        message.set("answer_count", dns.answers().len());
        message.set("authority_count", dns.name_servers().len());
        message.set("additional_count", dns.additionals().len());

        let answers: Vec<Value> = dns
            .answers()
            .iter()
            .take(MAX_ANSWERS)
            .map(|record| {
                json!({
                    "name": trim_root(record.name().to_utf8()),
                    "type": record.record_type().to_string(),
                    "ttl": record.ttl(),
                    "data": record.data().map(|data| data.to_string()),
                })
            })
            .collect();
        if !answers.is_empty() {
            message.set("answers", answers);
        }
    }
    message
}

/// Decoder for one DNS flow
#[derive(Debug)]
pub struct DnsDecoder {
    transport: Transport,
    sides: [Half; 2],
}

impl DnsDecoder {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            sides: Default::default(),
        }
    }

    pub fn phase(&self, direction: Direction) -> Phase {
        self.sides[direction.index()].phase
    }

    pub fn reset(&mut self) {
        self.sides = Default::default();
    }

    pub fn consume(&mut self, bytes: &[u8], direction: Direction, ts: u64) -> Vec<DecodeEvent> {
        match self.transport {
            Transport::Udp => self.datagram(bytes, direction, ts),
            Transport::Tcp => self.stream(bytes, direction, ts),
        }
    }

    /// Datagrams are self-delimiting, so a bad one is reported and skipped
    /// without giving up on the direction.
    fn datagram(&mut self, bytes: &[u8], direction: Direction, ts: u64) -> Vec<DecodeEvent> {
        if bytes.is_empty() {
            return Vec::new();
        }
        match DnsMessage::from_vec(bytes) {
            Ok(dns) => vec![DecodeEvent::Message(to_message(&dns, direction, ts, ts, bytes.len()))],
            Err(e) => vec![DecodeEvent::Diagnostic(Diagnostic {
                protocol: PROTOCOL.to_string(),
                direction,
                timestamp_ns: ts,
                reason: format!("malformed datagram: {}", e),
                discarded: bytes.len(),
            })],
        }
    }

    fn stream(&mut self, bytes: &[u8], direction: Direction, ts: u64) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        let side = &mut self.sides[direction.index()];
        if !side.accept(bytes, ts) {
            return events;
        }

        while side.buf.len() >= 2 {
            let len = u16::from_be_bytes([side.buf[0], side.buf[1]]) as usize;
            if len == 0 {
                events.push(side.corrupt(PROTOCOL, direction, "zero-length message"));
                return events;
            }
            if side.buf.len() < 2 + len {
                side.phase = Phase::ReadingBody;
                return events;
            }
            match DnsMessage::from_vec(&side.buf[2..2 + len]) {
                Ok(dns) => {
                    let start_ns = side.start_ts;
                    side.advance(2 + len);
                    let size = side.finish_message();
                    events.push(DecodeEvent::Message(to_message(
                        &dns,
                        direction,
                        start_ns,
                        side.last_ts,
                        size,
                    )));
                }
                Err(e) => {
                    events.push(side.corrupt(PROTOCOL, direction, format!("malformed message: {}", e)));
                    return events;
                }
            }
        }
        side.phase = if side.buf.is_empty() {
            Phase::AwaitingHeader
        } else {
            Phase::ReadingBody
        };
        events
    }

    pub fn on_gap(&mut self, direction: Direction, len: usize) -> Vec<DecodeEvent> {
        let side = &mut self.sides[direction.index()];
        if self.transport == Transport::Udp || !side.is_open() {
            return Vec::new();
        }
        vec![side.corrupt(
            PROTOCOL,
            direction,
            format!("stream gap of {} bytes", len),
        )]
    }

    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        for direction in [Direction::ToServer, Direction::ToClient] {
            let side = &mut self.sides[direction.index()];
            if side.has_partial() {
                events.push(side.corrupt(PROTOCOL, direction, "connection closed mid-message"));
            }
        }
        events
    }
}

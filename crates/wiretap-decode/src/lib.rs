//! Wiretap Decode - application protocol decoders
//!
//! Each decoder consumes the reassembled byte stream of one flow, one
//! direction at a time, and emits complete messages:
//! - HTTP/1.x requests and responses
//! - Thrift binary protocol calls, replies, exceptions and oneway calls
//! - TLS ClientHello / ServerHello metadata
//! - DNS queries and answers over UDP or TCP

pub mod dns;
pub mod http;
pub mod registry;
pub mod stream;
pub mod thrift;
pub mod tls;

pub use dns::DnsDecoder;
pub use http::HttpDecoder;
pub use registry::DecoderRegistry;
pub use stream::Phase;
pub use thrift::ThriftDecoder;
pub use tls::TlsDecoder;

use wiretap_core::message::DecodeEvent;
use wiretap_core::packet::Direction;

/// A decoder attached to one flow
#[derive(Debug)]
pub enum ProtocolDecoder {
    Http(HttpDecoder),
    Thrift(ThriftDecoder),
    Tls(TlsDecoder),
    Dns(DnsDecoder),
}

impl ProtocolDecoder {
    /// Protocol name, as used in configuration and on transactions
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolDecoder::Http(_) => http::PROTOCOL,
            ProtocolDecoder::Thrift(_) => thrift::PROTOCOL,
            ProtocolDecoder::Tls(_) => tls::PROTOCOL,
            ProtocolDecoder::Dns(_) => dns::PROTOCOL,
        }
    }

    /// Feed in-order bytes of one direction
    pub fn consume(&mut self, bytes: &[u8], direction: Direction, ts: u64) -> Vec<DecodeEvent> {
        match self {
            ProtocolDecoder::Http(d) => d.consume(bytes, direction, ts),
            ProtocolDecoder::Thrift(d) => d.consume(bytes, direction, ts),
            ProtocolDecoder::Tls(d) => d.consume(bytes, direction, ts),
            ProtocolDecoder::Dns(d) => d.consume(bytes, direction, ts),
        }
    }

    /// `len` bytes of one direction were never captured
    pub fn on_gap(&mut self, direction: Direction, len: usize) -> Vec<DecodeEvent> {
        match self {
            ProtocolDecoder::Http(d) => d.on_gap(direction, len),
            ProtocolDecoder::Thrift(d) => d.on_gap(direction, len),
            ProtocolDecoder::Tls(d) => d.on_gap(direction, len),
            ProtocolDecoder::Dns(d) => d.on_gap(direction, len),
        }
    }

    /// The flow is closing; flush what can still be completed
    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        match self {
            ProtocolDecoder::Http(d) => d.finish(),
            ProtocolDecoder::Thrift(d) => d.finish(),
            ProtocolDecoder::Tls(d) => d.finish(),
            ProtocolDecoder::Dns(d) => d.finish(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            ProtocolDecoder::Http(d) => d.reset(),
            ProtocolDecoder::Thrift(d) => d.reset(),
            ProtocolDecoder::Tls(d) => d.reset(),
            ProtocolDecoder::Dns(d) => d.reset(),
        }
    }

    pub fn phase(&self, direction: Direction) -> Phase {
        match self {
            ProtocolDecoder::Http(d) => d.phase(direction),
            ProtocolDecoder::Thrift(d) => d.phase(direction),
            ProtocolDecoder::Tls(d) => d.phase(direction),
            ProtocolDecoder::Dns(d) => d.phase(direction),
        }
    }

    /// Both directions are done; further bytes would be ignored
    pub fn is_done(&self) -> bool {
        [Direction::ToServer, Direction::ToClient]
            .iter()
            .all(|d| matches!(self.phase(*d), Phase::Complete | Phase::Corrupt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::message::MessageKind;

    #[test]
    fn test_reset_recovers_corrupt_direction() {
        let mut decoder = ProtocolDecoder::Http(HttpDecoder::new(&[]));
        decoder.consume(b"\x16\x03\x01garbage", Direction::ToServer, 1);
        decoder.consume(b"\x16\x03\x01garbage", Direction::ToClient, 1);
        assert!(decoder.is_done());

        decoder.reset();
        let events = decoder.consume(b"GET / HTTP/1.1\r\n\r\n", Direction::ToServer, 2);
        assert!(matches!(events.as_slice(), [DecodeEvent::Message(m)] if m.kind == MessageKind::Request));
        assert_eq!(decoder.protocol(), "http");
    }
}

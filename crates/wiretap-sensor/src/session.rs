//! Per-flow decoding state
//!
//! A `Session` is the caller state stored in each flow table entry: the
//! flow's protocol decoder (if any port matched) and its correlator.

use tracing::{debug, trace};
use wiretap_core::message::DecodeEvent;
use wiretap_core::metrics::{add, inc, SharedMetrics};
use wiretap_core::packet::Direction;
use wiretap_core::transaction::{FlowInfo, Transaction, TransactionStatus};
use wiretap_correlate::{CorrelationConfig, Correlator, Released};
use wiretap_decode::ProtocolDecoder;
use wiretap_flows::Chunk;

#[derive(Debug)]
pub struct Session {
    decoder: Option<ProtocolDecoder>,
    correlator: Correlator,
}

impl Session {
    pub fn new(decoder: Option<ProtocolDecoder>, correlation: CorrelationConfig) -> Self {
        Self {
            decoder,
            correlator: Correlator::new(correlation),
        }
    }

    pub fn protocol(&self) -> Option<&'static str> {
        self.decoder.as_ref().map(ProtocolDecoder::protocol)
    }

    /// Feed one reassembled chunk
    pub fn on_chunk(
        &mut self,
        flow: &FlowInfo,
        direction: Direction,
        chunk: Chunk,
        metrics: &SharedMetrics,
    ) -> Vec<Transaction> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Vec::new();
        };
        let events = match chunk {
            Chunk::Data { bytes, timestamp_ns } => decoder.consume(&bytes, direction, timestamp_ns),
            Chunk::Gap { len } => {
                trace!(flow_id = flow.flow_id, ?direction, len, "Stream gap");
                decoder.on_gap(direction, len)
            }
        };
        self.absorb(flow, events, metrics)
    }

    /// Time out requests left unanswered
    pub fn expire(&mut self, flow: &FlowInfo, now_ns: u64, metrics: &SharedMetrics) -> Vec<Transaction> {
        let released = self.correlator.expire(flow, now_ns);
        record(released, metrics)
    }

    /// Flow is going away: finish the decoder, then flush the correlator
    pub fn close(&mut self, flow: &FlowInfo, metrics: &SharedMetrics) -> Vec<Transaction> {
        let mut out = match self.decoder.as_mut() {
            Some(decoder) => {
                let events = decoder.finish();
                self.absorb(flow, events, metrics)
            }
            None => Vec::new(),
        };
        out.extend(record(self.correlator.close(flow), metrics));
        out
    }

    fn absorb(&mut self, flow: &FlowInfo, events: Vec<DecodeEvent>, metrics: &SharedMetrics) -> Vec<Transaction> {
        let mut out = Vec::new();
        for event in events {
            match event {
                DecodeEvent::Message(message) => {
                    inc(&metrics.decode.messages);
                    out.extend(record(self.correlator.push(flow, message), metrics));
                }
                DecodeEvent::Diagnostic(diagnostic) => {
                    inc(&metrics.decode.errors);
                    add(&metrics.decode.discarded_bytes, diagnostic.discarded as u64);
                    debug!(
                        flow_id = flow.flow_id,
                        protocol = %diagnostic.protocol,
                        direction = ?diagnostic.direction,
                        discarded = diagnostic.discarded,
                        "Decoder error: {}",
                        diagnostic.reason
                    );
                }
            }
        }
        out
    }
}

fn record(released: Released, metrics: &SharedMetrics) -> Vec<Transaction> {
    add(&metrics.correlate.unmatched_responses, released.unmatched as u64);
    for transaction in &released.transactions {
        inc(&metrics.correlate.transactions);
        match transaction.status {
            TransactionStatus::NoReply => inc(&metrics.correlate.no_reply),
            TransactionStatus::OneWay => inc(&metrics.correlate.one_way),
            TransactionStatus::Ok | TransactionStatus::Error => {}
        }
    }
    released.transactions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use wiretap_core::metrics::create_metrics;
    use wiretap_core::packet::Transport;
    use wiretap_decode::HttpDecoder;

    fn flow() -> FlowInfo {
        FlowInfo {
            flow_id: 1,
            transport: Transport::Tcp,
            client: "10.0.0.1:40000".parse::<SocketAddr>().unwrap().into(),
            server: "10.0.0.2:80".parse::<SocketAddr>().unwrap().into(),
        }
    }

    fn data(bytes: &[u8], timestamp_ns: u64) -> Chunk {
        Chunk::Data {
            bytes: bytes.to_vec(),
            timestamp_ns,
        }
    }

    fn session() -> Session {
        Session::new(
            Some(ProtocolDecoder::Http(HttpDecoder::new(&[]))),
            CorrelationConfig {
                timeout: Duration::from_millis(100),
                max_pending: 8,
            },
        )
    }

    #[test]
    fn test_request_response() {
        let metrics = create_metrics();
        let f = flow();
        let mut s = session();
        assert_eq!(s.protocol(), Some("http"));

        let out = s.on_chunk(&f, Direction::ToServer, data(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n", 1_000), &metrics);
        assert!(out.is_empty());
        let out = s.on_chunk(
            &f,
            Direction::ToClient,
            data(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", 2_000_000),
            &metrics,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, TransactionStatus::Ok);
        assert_eq!(metrics.decode.messages.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.correlate.transactions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_close_flushes_pending_as_no_reply() {
        let metrics = create_metrics();
        let f = flow();
        let mut s = session();
        s.on_chunk(&f, Direction::ToServer, data(b"GET /slow HTTP/1.1\r\n\r\n", 1_000), &metrics);

        let out = s.close(&f, &metrics);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, TransactionStatus::NoReply);
        assert_eq!(metrics.correlate.no_reply.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_garbage_is_counted() {
        let metrics = create_metrics();
        let f = flow();
        let mut s = session();
        s.on_chunk(&f, Direction::ToServer, data(b"\x00\x01\x02 not http\r\n\r\n", 1_000), &metrics);
        assert_eq!(metrics.decode.errors.load(Ordering::Relaxed), 1);
        assert!(s.close(&f, &metrics).is_empty());
    }

    #[test]
    fn test_unclassified_flow_ignores_data() {
        let metrics = create_metrics();
        let f = flow();
        let mut s = Session::new(None, CorrelationConfig::default());
        assert!(s.on_chunk(&f, Direction::ToServer, data(b"anything", 1), &metrics).is_empty());
        assert!(s.close(&f, &metrics).is_empty());
        assert_eq!(metrics.decode.messages.load(Ordering::Relaxed), 0);
    }
}

//! Transaction correlation
//!
//! A `Correlator` lives next to the decoder of one flow and turns its
//! messages into transactions. Requests wait in arrival order; a response is
//! attached to the request carrying the same correlation id, or, when it has
//! none, to the oldest unanswered request without one. Transactions leave in
//! request order: a completed request waits behind older unanswered ones
//! until they are answered or time out.

use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;
use wiretap_core::config::CorrelationSettings;
use wiretap_core::message::{Correlation, Message, MessageKind};
use wiretap_core::transaction::{FlowInfo, Transaction};

/// Correlation limits
#[derive(Debug, Clone, Copy)]
pub struct CorrelationConfig {
    /// Requests unanswered this long after their last byte become no-reply
    pub timeout: Duration,

    /// Maximum outstanding requests per flow
    pub max_pending: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self::from(&CorrelationSettings::default())
    }
}

impl From<&CorrelationSettings> for CorrelationConfig {
    fn from(settings: &CorrelationSettings) -> Self {
        Self {
            timeout: settings.transaction_timeout(),
            max_pending: settings.max_pending.max(1),
        }
    }
}

/// What a correlator call produced
#[derive(Debug, Default)]
pub struct Released {
    /// Finished transactions in request order
    pub transactions: Vec<Transaction>,

    /// Responses that matched no pending request and were dropped
    pub unmatched: usize,
}

impl Released {
    fn extend(&mut self, other: Released) {
        self.transactions.extend(other.transactions);
        self.unmatched += other.unmatched;
    }
}

#[derive(Debug)]
enum State {
    Waiting,
    Answered(Message),
    TimedOut,
    OneWay,
}

#[derive(Debug)]
struct Slot {
    message: Message,
    state: State,
}

impl Slot {
    fn is_ready(&self) -> bool {
        !matches!(self.state, State::Waiting)
    }

    fn into_transaction(self, flow: &FlowInfo) -> Transaction {
        match self.state {
            State::Answered(response) => Transaction::from_pair(flow, self.message, response),
            State::OneWay => Transaction::one_way(flow, self.message),
            State::Waiting | State::TimedOut => Transaction::no_reply(flow, self.message),
        }
    }
}

/// Per-flow request/response pairing
#[derive(Debug)]
pub struct Correlator {
    config: CorrelationConfig,
    slots: VecDeque<Slot>,
}

impl Correlator {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            slots: VecDeque::new(),
        }
    }

    /// Messages still held back
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Feed one decoded message
    pub fn push(&mut self, flow: &FlowInfo, message: Message) -> Released {
        let mut released = Released::default();
        match message.kind {
            MessageKind::Request => released.transactions.extend(self.enqueue(flow, message, State::Waiting)),
            MessageKind::OneWay => released.transactions.extend(self.enqueue(flow, message, State::OneWay)),
            MessageKind::Response => {
                let slot = match &message.correlation {
                    Correlation::Id(id) => self.slots.iter_mut().find(|slot| {
                        matches!(slot.state, State::Waiting)
                            && slot.message.correlation.as_id() == Some(id.as_str())
                    }),
                    Correlation::Fifo => self.slots.iter_mut().find(|slot| {
                        matches!(slot.state, State::Waiting) && slot.message.correlation == Correlation::Fifo
                    }),
                };
                match slot {
                    Some(slot) => slot.state = State::Answered(message),
                    None => {
                        trace!(
                            flow_id = flow.flow_id,
                            protocol = %message.protocol,
                            "Response without a pending request"
                        );
                        released.unmatched += 1;
                    }
                }
            }
        }
        released.extend(self.release_ready(flow));
        released
    }

    /// Time out requests whose last byte is at least `timeout` older than `now_ns`
    pub fn expire(&mut self, flow: &FlowInfo, now_ns: u64) -> Released {
        let timeout = self.config.timeout.as_nanos() as u64;
        for slot in &mut self.slots {
            if matches!(slot.state, State::Waiting) && now_ns >= slot.message.end_ns.saturating_add(timeout) {
                slot.state = State::TimedOut;
            }
        }
        self.release_ready(flow)
    }

    /// Flow is gone: everything still waiting becomes no-reply
    pub fn close(&mut self, flow: &FlowInfo) -> Released {
        Released {
            transactions: self
                .slots
                .drain(..)
                .map(|slot| slot.into_transaction(flow))
                .collect(),
            unmatched: 0,
        }
    }

    /// Queue a slot, first making room by releasing the oldest one if the
    /// queue is at `max_pending`
    fn enqueue(&mut self, flow: &FlowInfo, message: Message, state: State) -> Option<Transaction> {
        let mut overflow = None;
        if self.slots.len() >= self.config.max_pending {
            if let Some(oldest) = self.slots.pop_front() {
                trace!(flow_id = flow.flow_id, "Pending queue full, releasing oldest message");
                overflow = Some(oldest.into_transaction(flow));
            }
        }
        self.slots.push_back(Slot { message, state });
        overflow
    }

    fn release_ready(&mut self, flow: &FlowInfo) -> Released {
        let mut released = Released::default();
        while self.slots.front().is_some_and(Slot::is_ready) {
            if let Some(slot) = self.slots.pop_front() {
                released.transactions.push(slot.into_transaction(flow));
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use wiretap_core::packet::{Direction, Transport};
    use wiretap_core::transaction::TransactionStatus;

    const MS: u64 = 1_000_000;

    fn flow() -> FlowInfo {
        FlowInfo {
            flow_id: 1,
            transport: Transport::Tcp,
            client: "10.0.0.1:40000".parse::<SocketAddr>().unwrap().into(),
            server: "10.0.0.2:8080".parse::<SocketAddr>().unwrap().into(),
        }
    }

    fn request(ts: u64, path: &str) -> Message {
        let mut msg = Message::new("http", MessageKind::Request, Direction::ToServer, ts).with_end(ts);
        msg.set("path", path);
        msg
    }

    fn response(ts: u64, status: u16) -> Message {
        let mut msg = Message::new("http", MessageKind::Response, Direction::ToClient, ts)
            .with_end(ts)
            .with_error(status >= 400);
        msg.set("status_code", status);
        msg
    }

    fn with_id(message: Message, id: i32) -> Message {
        message.with_correlation(Correlation::id(id))
    }

    fn correlator() -> Correlator {
        Correlator::new(CorrelationConfig {
            timeout: Duration::from_millis(100),
            max_pending: 16,
        })
    }

    #[test]
    fn test_single_pair() {
        let mut c = correlator();
        let f = flow();
        assert!(c.push(&f, request(0, "/a")).transactions.is_empty());
        let out = c.push(&f, response(5 * MS, 200)).transactions;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, TransactionStatus::Ok);
        assert_eq!(out[0].latency_ms, Some(5.0));
        assert!(c.is_empty());
    }

    #[test]
    fn test_pipelined_fifo() {
        let mut c = correlator();
        let f = flow();
        for (i, path) in ["/1", "/2", "/3"].iter().enumerate() {
            c.push(&f, request(i as u64 * MS, path));
        }
        let mut out = Vec::new();
        for (i, status) in [200, 500, 404].iter().enumerate() {
            out.extend(c.push(&f, response((10 + i as u64) * MS, *status)).transactions);
        }
        let pairs: Vec<_> = out
            .iter()
            .map(|tx| {
                (
                    tx.request.as_ref().unwrap().fields["path"].clone(),
                    tx.response.as_ref().unwrap().fields["status_code"].clone(),
                )
            })
            .collect();
        assert_eq!(pairs[0], ("/1".into(), 200.into()));
        assert_eq!(pairs[1], ("/2".into(), 500.into()));
        assert_eq!(pairs[2], ("/3".into(), 404.into()));
        assert_eq!(out[1].status, TransactionStatus::Error);
    }

    #[test]
    fn test_id_matching_out_of_order_released_in_request_order() {
        let mut c = correlator();
        let f = flow();
        c.push(&f, with_id(request(0, "first"), 1));
        c.push(&f, with_id(request(MS, "second"), 2));

        // Second answered first: held back behind the first request
        let out = c.push(&f, with_id(response(2 * MS, 200), 2));
        assert!(out.transactions.is_empty());

        let out = c.push(&f, with_id(response(3 * MS, 200), 1)).transactions;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].correlation_key.as_deref(), Some("1"));
        assert_eq!(out[1].correlation_key.as_deref(), Some("2"));
        assert!(out[0].start_ns <= out[1].start_ns);
    }

    #[test]
    fn test_id_takes_precedence_over_fifo() {
        let mut c = correlator();
        let f = flow();
        c.push(&f, request(0, "fifo"));
        c.push(&f, with_id(request(MS, "id"), 9));

        // An id-bearing response never pairs with the id-less request
        let out = c.push(&f, with_id(response(2 * MS, 200), 9));
        assert!(out.transactions.is_empty());
        assert_eq!(c.pending(), 2);

        let out = c.push(&f, response(3 * MS, 200)).transactions;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].request.as_ref().unwrap().fields["path"], "fifo");
        assert_eq!(out[1].request.as_ref().unwrap().fields["path"], "id");
    }

    #[test]
    fn test_unmatched_response_dropped() {
        let mut c = correlator();
        let f = flow();
        let out = c.push(&f, response(0, 200));
        assert_eq!(out.unmatched, 1);
        assert!(out.transactions.is_empty());

        c.push(&f, with_id(request(0, "a"), 1));
        assert_eq!(c.push(&f, with_id(response(MS, 200), 2)).unmatched, 1);
        assert_eq!(c.pending(), 1);
    }

    #[test]
    fn test_timeout_not_before() {
        let mut c = correlator();
        let f = flow();
        c.push(&f, request(1_000 * MS, "/slow"));

        assert!(c.expire(&f, 1_099 * MS).transactions.is_empty());
        let out = c.expire(&f, 1_100 * MS).transactions;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, TransactionStatus::NoReply);
        assert!(out[0].response.is_none());

        // Exactly once
        assert!(c.expire(&f, 5_000 * MS).transactions.is_empty());
        // A late response has nothing left to pair with
        assert_eq!(c.push(&f, response(5_001 * MS, 200)).unmatched, 1);
    }

    #[test]
    fn test_overflow_releases_oldest_as_no_reply() {
        let mut c = Correlator::new(CorrelationConfig {
            timeout: Duration::from_secs(60),
            max_pending: 2,
        });
        let f = flow();
        c.push(&f, request(0, "/1"));
        c.push(&f, request(MS, "/2"));
        let out = c.push(&f, request(2 * MS, "/3")).transactions;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, TransactionStatus::NoReply);
        assert_eq!(out[0].request.as_ref().unwrap().fields["path"], "/1");
        assert_eq!(c.pending(), 2);
    }

    #[test]
    fn test_one_ways_behind_unanswered_call_stay_bounded() {
        let mut c = Correlator::new(CorrelationConfig {
            timeout: Duration::from_secs(60),
            max_pending: 16,
        });
        let f = flow();
        assert!(c.push(&f, with_id(request(0, "call"), 1)).transactions.is_empty());

        let mut released = Vec::new();
        for i in 0..10_000u64 {
            let oneway = Message::new("thrift", MessageKind::OneWay, Direction::ToServer, i * MS);
            released.extend(c.push(&f, oneway).transactions);
            assert!(c.pending() <= 16);
        }

        // Overflow pushes out the stuck call; the one-ways queued behind it
        // are then free to leave in arrival order
        assert_eq!(released.len(), 10_001);
        assert_eq!(released[0].status, TransactionStatus::NoReply);
        assert!(released[1..]
            .iter()
            .all(|tx| tx.status == TransactionStatus::OneWay));
        assert_eq!(released[1].start_ns, 0);
        assert_eq!(released[10_000].start_ns, 9_999 * MS);
        assert!(c.is_empty());
    }

    #[test]
    fn test_one_way_and_close() {
        let mut c = correlator();
        let f = flow();
        let oneway = Message::new("thrift", MessageKind::OneWay, Direction::ToServer, 0);
        let out = c.push(&f, oneway).transactions;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, TransactionStatus::OneWay);

        c.push(&f, request(MS, "/a"));
        c.push(&f, request(2 * MS, "/b"));
        c.push(&f, response(3 * MS, 200));
        let out = c.close(&f).transactions;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, TransactionStatus::NoReply);
        assert!(c.is_empty());
    }
}

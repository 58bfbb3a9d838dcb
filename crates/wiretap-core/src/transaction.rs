//! Transactions - the documents shipped to the indexing backend

use crate::message::{Correlation, Message};
use crate::packet::Transport;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};

/// Convert a capture timestamp to a UTC datetime
pub fn ns_to_datetime(ns: u64) -> DateTime<Utc> {
    let secs = (ns / 1_000_000_000) as i64;
    let nanos = (ns % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}

/// Network endpoint as indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

/// Identity of the flow a transaction belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowInfo {
    pub flow_id: u64,
    pub transport: Transport,
    pub client: Endpoint,
    pub server: Endpoint,
}

/// Final state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Request answered successfully
    Ok,
    /// Request answered with an error
    Error,
    /// Request never answered within the correlation timeout
    NoReply,
    /// Standalone message
    OneWay,
}

/// One half of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPart {
    /// Bytes on the wire
    pub bytes: usize,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl From<Message> for TransactionPart {
    fn from(message: Message) -> Self {
        Self {
            bytes: message.size,
            fields: message.fields,
        }
    }
}

/// A decoded application-level request/response unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier (ULID)
    pub id: String,

    /// Start of the transaction
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,

    pub flow_id: u64,

    pub protocol: String,

    pub transport: Transport,

    pub client: Endpoint,

    pub server: Endpoint,

    pub status: TransactionStatus,

    pub start_ns: u64,

    pub end_ns: u64,

    /// Response latency; only present when both halves were seen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<TransactionPart>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<TransactionPart>,
}

impl Transaction {
    fn base(flow: &FlowInfo, protocol: String, start_ns: u64, status: TransactionStatus) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            timestamp: ns_to_datetime(start_ns),
            flow_id: flow.flow_id,
            protocol,
            transport: flow.transport,
            client: flow.client,
            server: flow.server,
            status,
            start_ns,
            end_ns: start_ns,
            latency_ms: None,
            correlation_key: None,
            request: None,
            response: None,
        }
    }

    /// Build a transaction from a matched request/response pair
    pub fn from_pair(flow: &FlowInfo, request: Message, response: Message) -> Self {
        let status = if response.is_error || request.is_error {
            TransactionStatus::Error
        } else {
            TransactionStatus::Ok
        };
        let mut tx = Self::base(flow, request.protocol.clone(), request.start_ns, status);
        // Latency is measured from the end of the request to the first response byte
        let latency_ns = response.start_ns.saturating_sub(request.end_ns);
        tx.latency_ms = Some(latency_ns as f64 / 1_000_000.0);
        tx.end_ns = response.end_ns.max(request.start_ns);
        tx.correlation_key = correlation_key(&request.correlation);
        tx.request = Some(request.into());
        tx.response = Some(response.into());
        tx
    }

    /// Build a transaction for a request that never got an answer
    pub fn no_reply(flow: &FlowInfo, request: Message) -> Self {
        let mut tx = Self::base(
            flow,
            request.protocol.clone(),
            request.start_ns,
            TransactionStatus::NoReply,
        );
        tx.end_ns = request.end_ns;
        tx.correlation_key = correlation_key(&request.correlation);
        tx.request = Some(request.into());
        tx
    }

    /// Build a transaction from a standalone message
    pub fn one_way(flow: &FlowInfo, message: Message) -> Self {
        let mut tx = Self::base(
            flow,
            message.protocol.clone(),
            message.start_ns,
            TransactionStatus::OneWay,
        );
        tx.end_ns = message.end_ns;
        tx.correlation_key = correlation_key(&message.correlation);
        tx.request = Some(message.into());
        tx
    }

    /// Serialize to the indexed document form
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn correlation_key(correlation: &Correlation) -> Option<String> {
    correlation.as_id().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::packet::Direction;

    fn flow() -> FlowInfo {
        FlowInfo {
            flow_id: 9,
            transport: Transport::Tcp,
            client: "10.0.0.1:50000".parse::<SocketAddr>().unwrap().into(),
            server: "10.0.0.2:80".parse::<SocketAddr>().unwrap().into(),
        }
    }

    #[test]
    fn test_pair_latency_and_status() {
        let mut req = Message::new("http", MessageKind::Request, Direction::ToServer, 1_000_000)
            .with_end(2_000_000);
        req.set("method", "GET");
        let mut resp = Message::new("http", MessageKind::Response, Direction::ToClient, 7_000_000)
            .with_end(8_000_000)
            .with_error(true);
        resp.set("status_code", 500);

        let tx = Transaction::from_pair(&flow(), req, resp);
        assert_eq!(tx.status, TransactionStatus::Error);
        assert_eq!(tx.latency_ms, Some(5.0));
        assert_eq!(tx.start_ns, 1_000_000);
        assert_eq!(tx.end_ns, 8_000_000);
        assert_eq!(tx.flow_id, 9);
    }

    #[test]
    fn test_pair_latency_never_negative() {
        // Response timestamped before the request finished (clock skew between NIC queues)
        let req = Message::new("http", MessageKind::Request, Direction::ToServer, 5_000)
            .with_end(9_000);
        let resp = Message::new("http", MessageKind::Response, Direction::ToClient, 6_000);
        let tx = Transaction::from_pair(&flow(), req, resp);
        assert_eq!(tx.latency_ms, Some(0.0));
        assert!(tx.end_ns >= tx.start_ns);
    }

    #[test]
    fn test_document_shape() {
        let mut req = Message::new("thrift", MessageKind::Request, Direction::ToServer, 0)
            .with_correlation(Correlation::id(42));
        req.set("method", "ping");
        let tx = Transaction::no_reply(&flow(), req);

        let doc = tx.to_document();
        assert_eq!(doc["status"], "no_reply");
        assert_eq!(doc["protocol"], "thrift");
        assert_eq!(doc["correlation_key"], "42");
        assert_eq!(doc["request"]["method"], "ping");
        assert_eq!(doc["server"]["port"], 80);
        assert!(doc.get("response").is_none());
        assert!(doc.get("latency_ms").is_none());
        assert!(doc.get("@timestamp").is_some());
    }

    #[test]
    fn test_ns_to_datetime() {
        let dt = ns_to_datetime(1_700_000_000_500_000_000);
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }
}

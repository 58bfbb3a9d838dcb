//! Decoder output
//!
//! Protocol decoders turn flow byte streams into `DecodeEvent`s: complete
//! application messages (one half of a transaction) or diagnostics when the
//! stream could not be parsed.

use crate::packet::Direction;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Expects a response
    Request,
    /// Answers a request
    Response,
    /// Standalone message, never answered (e.g. Thrift oneway)
    OneWay,
}

/// How a message is paired with its counterpart
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// Pair in arrival order with the oldest unanswered request
    Fifo,
    /// Pair by protocol-level identifier (Thrift seq id, DNS id)
    Id(String),
}

impl Correlation {
    pub fn id(value: impl ToString) -> Self {
        Correlation::Id(value.to_string())
    }

    pub fn as_id(&self) -> Option<&str> {
        match self {
            Correlation::Id(id) => Some(id),
            Correlation::Fifo => None,
        }
    }
}

/// A complete application message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol name (matches the decoder registry key)
    pub protocol: String,

    pub kind: MessageKind,

    pub direction: Direction,

    /// Timestamp of the first byte of the message
    pub start_ns: u64,

    /// Timestamp of the last byte of the message
    pub end_ns: u64,

    pub correlation: Correlation,

    /// Size of the message on the wire
    pub size: usize,

    /// Whether this message reports a failure (HTTP >= 400, Thrift exception, ...)
    pub is_error: bool,

    /// Decoded protocol fields
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(
        protocol: impl Into<String>,
        kind: MessageKind,
        direction: Direction,
        start_ns: u64,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            kind,
            direction,
            start_ns,
            end_ns: start_ns,
            correlation: Correlation::Fifo,
            size: 0,
            is_error: false,
            fields: Map::new(),
        }
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_end(mut self, end_ns: u64) -> Self {
        self.end_ns = end_ns.max(self.start_ns);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// Set a field, skipping nulls
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if !value.is_null() {
            self.fields.insert(key.to_string(), value);
        }
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Decoder failure report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub protocol: String,
    pub direction: Direction,
    pub timestamp_ns: u64,
    pub reason: String,
    /// Bytes discarded when the decoder gave up on the direction
    pub discarded: usize,
}

/// Output of a protocol decoder
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Message(Message),
    Diagnostic(Diagnostic),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let mut msg = Message::new("http", MessageKind::Request, Direction::ToServer, 100)
            .with_end(50)
            .with_size(42)
            .with_correlation(Correlation::id(7));
        msg.set("method", "GET");
        msg.set("missing", Value::Null);

        // End never precedes start
        assert_eq!(msg.end_ns, 100);
        assert_eq!(msg.size, 42);
        assert_eq!(msg.correlation.as_id(), Some("7"));
        assert_eq!(msg.field_str("method"), Some("GET"));
        assert!(!msg.fields.contains_key("missing"));
    }
}

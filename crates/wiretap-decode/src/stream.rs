//! Per-direction decoding state shared by the stream decoders

use wiretap_core::message::{DecodeEvent, Diagnostic};
use wiretap_core::packet::Direction;

/// Where a direction's state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for (the rest of) a message header
    AwaitingHeader,
    /// Header parsed, body still arriving
    ReadingBody,
    /// Nothing more to decode on this direction (e.g. encrypted from here on)
    Complete,
    /// Parsing failed; remaining data is discarded
    Corrupt,
}

/// Buffered bytes and phase of one direction
#[derive(Debug)]
pub(crate) struct Half {
    pub buf: Vec<u8>,
    pub phase: Phase,
    /// Capture time of the first byte of the message being decoded
    pub start_ts: u64,
    /// Capture time of the most recent bytes
    pub last_ts: u64,
    /// Wire bytes attributed to the current message so far
    pub consumed: usize,
}

impl Default for Half {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            phase: Phase::AwaitingHeader,
            start_ts: 0,
            last_ts: 0,
            consumed: 0,
        }
    }
}

impl Half {
    /// Whether this direction still decodes data
    pub fn is_open(&self) -> bool {
        !matches!(self.phase, Phase::Complete | Phase::Corrupt)
    }

    /// Buffer new bytes. Returns false when the direction no longer decodes.
    pub fn accept(&mut self, bytes: &[u8], ts: u64) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.buf.is_empty() && self.phase == Phase::AwaitingHeader && self.consumed == 0 {
            self.start_ts = ts;
        }
        self.last_ts = ts;
        self.buf.extend_from_slice(bytes);
        true
    }

    /// Drop `n` bytes from the front of the buffer and attribute them to the current message
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.consumed += n;
    }

    /// Current message finished; the next one starts with whatever is left
    pub fn finish_message(&mut self) -> usize {
        let size = self.consumed;
        self.consumed = 0;
        self.phase = Phase::AwaitingHeader;
        self.start_ts = self.last_ts;
        size
    }

    /// Give up on this direction
    pub fn corrupt(&mut self, protocol: &str, direction: Direction, reason: impl Into<String>) -> DecodeEvent {
        let discarded = self.buf.len() + self.consumed;
        self.buf = Vec::new();
        self.consumed = 0;
        self.phase = Phase::Corrupt;
        DecodeEvent::Diagnostic(Diagnostic {
            protocol: protocol.to_string(),
            direction,
            timestamp_ns: self.last_ts,
            reason: reason.into(),
            discarded,
        })
    }

    /// Stop decoding without reporting an error
    pub fn complete(&mut self) {
        self.buf = Vec::new();
        self.consumed = 0;
        self.phase = Phase::Complete;
    }

    /// Whether a message is partially buffered
    pub fn has_partial(&self) -> bool {
        self.is_open() && (!self.buf.is_empty() || self.consumed > 0)
    }

    pub fn reset(&mut self) {
        *self = Half::default();
    }
}

/// A pair of halves indexed by direction
#[derive(Debug, Default)]
pub(crate) struct Halves(pub [Half; 2]);

impl Halves {
    pub fn get(&mut self, direction: Direction) -> &mut Half {
        &mut self.0[direction.index()]
    }

    pub fn phase(&self, direction: Direction) -> Phase {
        self.0[direction.index()].phase
    }
}

/// Big-endian cursor over a byte slice
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Ran out of input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Incomplete;

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Incomplete> {
        if self.remaining() < n {
            return Err(Incomplete);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Incomplete> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, Incomplete> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Incomplete> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> Result<u32, Incomplete> {
        let b = self.bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn i32(&mut self) -> Result<i32, Incomplete> {
        let b = self.bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_lifecycle() {
        let mut half = Half::default();
        assert!(half.accept(b"abcdef", 10));
        assert_eq!(half.start_ts, 10);
        half.advance(4);
        assert!(half.accept(b"gh", 20));
        // Start stays with the first byte of the message
        assert_eq!(half.start_ts, 10);
        half.advance(2);
        assert_eq!(half.finish_message(), 6);
        assert_eq!(half.buf, b"gh");

        let DecodeEvent::Diagnostic(diag) = half.corrupt("test", Direction::ToServer, "bad") else {
            panic!("expected diagnostic");
        };
        assert_eq!(diag.discarded, 2);
        assert!(!half.accept(b"more", 30));
        assert!(!half.has_partial());
    }

    #[test]
    fn test_reader() {
        let mut r = Reader::new(&[0, 1, 0, 0, 2, 0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(r.u16(), Ok(1));
        assert_eq!(r.u24(), Ok(2));
        assert_eq!(r.i32(), Ok(-2));
        assert_eq!(r.u8(), Err(Incomplete));
    }
}

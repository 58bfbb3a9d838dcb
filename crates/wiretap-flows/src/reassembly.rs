//! TCP stream reassembly for one direction of a flow
//!
//! Sequence numbers are tracked relative to the next expected byte, so
//! wraparound is handled by signed wrapping arithmetic. Out-of-order segments
//! are parked in a `BTreeMap` keyed by absolute stream offset until the hole
//! before them is filled. A segment that would end more than `window` bytes
//! past the next expected byte is dropped and reported as loss, which keeps
//! the parked data bounded.

use std::collections::BTreeMap;

/// A piece of reassembled stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Contiguous bytes, stamped with the capture time of the segment that carried them
    Data { bytes: Vec<u8>, timestamp_ns: u64 },
    /// Bytes that were never seen
    Gap { len: usize },
}

impl Chunk {
    pub fn data(bytes: impl Into<Vec<u8>>, timestamp_ns: u64) -> Self {
        Chunk::Data {
            bytes: bytes.into(),
            timestamp_ns,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Chunk::Data { bytes, .. } => bytes.len(),
            Chunk::Gap { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of pushing one segment
#[derive(Debug, Default)]
pub struct Pushed {
    /// Bytes now deliverable in order
    pub chunks: Vec<Chunk>,
    /// Bytes discarded as already delivered
    pub retransmitted: usize,
    /// Bytes dropped because they landed outside the reorder window
    pub lost: usize,
}

#[derive(Debug)]
struct Parked {
    bytes: Vec<u8>,
    timestamp_ns: u64,
}

/// Buffer for one direction of a TCP stream
#[derive(Debug)]
pub struct StreamBuffer {
    /// Next expected sequence number, once known
    next_seq: Option<u32>,
    /// Whether the start of the stream came from a SYN
    from_syn: bool,
    /// Stream offset of `next_seq`
    offset: u64,
    /// Out-of-order segments keyed by stream offset
    pending: BTreeMap<u64, Parked>,
    pending_bytes: usize,
    window: u32,
    /// Bytes delivered so far
    delivered: u64,
}

impl StreamBuffer {
    pub fn new(window: u32) -> Self {
        Self {
            next_seq: None,
            from_syn: false,
            offset: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            window,
            delivered: 0,
        }
    }

    /// Set the initial sequence number from a SYN. The SYN itself consumes one.
    pub fn set_initial_seq(&mut self, seq: u32) {
        if self.from_syn || self.delivered > 0 {
            return;
        }
        self.next_seq = Some(seq.wrapping_add(1));
        self.from_syn = true;
        self.pending.clear();
        self.pending_bytes = 0;
    }

    /// Whether any byte position is known yet
    pub fn is_started(&self) -> bool {
        self.next_seq.is_some()
    }

    /// Bytes parked behind a hole
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Bytes delivered in order so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Add a segment
    pub fn push(&mut self, seq: u32, data: &[u8], timestamp_ns: u64) -> Pushed {
        let mut out = Pushed::default();
        if data.is_empty() {
            return out;
        }

        // Mid-stream pickup: the first segment defines the start
        let next = *self.next_seq.get_or_insert(seq);
        let delta = seq.wrapping_sub(next) as i32 as i64;
        let end = delta + data.len() as i64;

        if end <= 0 {
            out.retransmitted = data.len();
            return out;
        }
        if end > self.window as i64 {
            out.lost = data.len();
            return out;
        }

        let (start, data) = if delta < 0 {
            let overlap = (-delta) as usize;
            out.retransmitted = overlap;
            (0u64, &data[overlap..])
        } else {
            (delta as u64, data)
        };

        if start == 0 {
            self.deliver(data.to_vec(), timestamp_ns, &mut out.chunks);
            self.release_pending(&mut out);
        } else {
            let offset = self.offset + start;
            let replace = self
                .pending
                .get(&offset)
                .map_or(true, |parked| parked.bytes.len() < data.len());
            if replace {
                if let Some(old) = self.pending.insert(
                    offset,
                    Parked {
                        bytes: data.to_vec(),
                        timestamp_ns,
                    },
                ) {
                    self.pending_bytes -= old.bytes.len();
                    out.retransmitted += old.bytes.len();
                }
                self.pending_bytes += data.len();
            } else {
                out.retransmitted += data.len();
            }
        }

        out
    }

    /// Release everything still parked, marking holes as gaps
    pub fn flush(&mut self) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some((offset, parked)) = self.pending.pop_first() {
            self.pending_bytes -= parked.bytes.len();
            let parked_end = offset + parked.bytes.len() as u64;
            if parked_end <= self.offset {
                continue;
            }
            if offset > self.offset {
                let gap = (offset - self.offset) as usize;
                chunks.push(Chunk::Gap { len: gap });
                self.skip(gap);
                self.deliver(parked.bytes, parked.timestamp_ns, &mut chunks);
            } else {
                let overlap = (self.offset - offset) as usize;
                self.deliver(parked.bytes[overlap..].to_vec(), parked.timestamp_ns, &mut chunks);
            }
        }
        chunks
    }

    fn deliver(&mut self, bytes: Vec<u8>, timestamp_ns: u64, chunks: &mut Vec<Chunk>) {
        let len = bytes.len();
        if len == 0 {
            return;
        }
        self.skip(len);
        self.delivered += len as u64;
        chunks.push(Chunk::Data {
            bytes,
            timestamp_ns,
        });
    }

    fn skip(&mut self, len: usize) {
        self.offset += len as u64;
        if let Some(next) = self.next_seq.as_mut() {
            *next = next.wrapping_add(len as u32);
        }
    }

    /// Move parked segments that have become contiguous
    fn release_pending(&mut self, out: &mut Pushed) {
        while let Some(entry) = self.pending.first_entry() {
            let offset = *entry.key();
            if offset > self.offset {
                break;
            }
            let parked = entry.remove();
            self.pending_bytes -= parked.bytes.len();

            let overlap = (self.offset - offset) as usize;
            if overlap >= parked.bytes.len() {
                out.retransmitted += parked.bytes.len();
                continue;
            }
            out.retransmitted += overlap;
            self.deliver(
                parked.bytes[overlap..].to_vec(),
                parked.timestamp_ns,
                &mut out.chunks,
            );
        }
    }
}

/// Concatenate the data chunks, ignoring gaps
pub fn concat(chunks: &[Chunk]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks {
        if let Chunk::Data { bytes, .. } = chunk {
            out.extend_from_slice(bytes);
        }
    }
    out
}

//! Captured packet representation
//!
//! A `Packet` is what the packet source hands to the flow table: link and
//! network addressing already decoded, transport header fields extracted and
//! the transport payload copied out of the capture buffer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Transport protocol of a packet or flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of data within a flow, relative to the flow initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client (initiator) to server
    ToServer,
    /// Server to client
    ToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }

    /// Index into per-direction arrays
    pub fn index(self) -> usize {
        match self {
            Direction::ToServer => 0,
            Direction::ToClient => 1,
        }
    }
}

/// TCP control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }
}

/// TCP header fields needed for reassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

/// A 48-bit link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A captured packet. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Capture timestamp in nanoseconds since the Unix epoch
    pub timestamp_ns: u64,

    /// Link-layer source (absent for raw IP captures)
    pub src_mac: Option<MacAddr>,

    /// Link-layer destination
    pub dst_mac: Option<MacAddr>,

    /// Network source address and transport port
    pub src: SocketAddr,

    /// Network destination address and transport port
    pub dst: SocketAddr,

    /// Transport protocol
    pub transport: Transport,

    /// TCP header (only for TCP packets)
    pub tcp: Option<TcpHeader>,

    /// Transport payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a TCP packet
    pub fn tcp(
        timestamp_ns: u64,
        src: SocketAddr,
        dst: SocketAddr,
        header: TcpHeader,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            timestamp_ns,
            src_mac: None,
            dst_mac: None,
            src,
            dst,
            transport: Transport::Tcp,
            tcp: Some(header),
            payload: payload.into(),
        }
    }

    /// Build a UDP packet
    pub fn udp(
        timestamp_ns: u64,
        src: SocketAddr,
        dst: SocketAddr,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            timestamp_ns,
            src_mac: None,
            dst_mac: None,
            src,
            dst,
            transport: Transport::Udp,
            tcp: None,
            payload: payload.into(),
        }
    }

    /// Attach link-layer addresses
    pub fn with_macs(mut self, src: MacAddr, dst: MacAddr) -> Self {
        self.src_mac = Some(src);
        self.dst_mac = Some(dst);
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

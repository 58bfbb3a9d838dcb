//! Bidirectional flows

use crate::reassembly::{Chunk, Pushed, StreamBuffer};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use wiretap_core::packet::{Direction, Packet, Transport};
use wiretap_core::transaction::FlowInfo;

/// Canonical flow key. Both directions of a connection map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub transport: Transport,
    /// Lower endpoint
    pub a: SocketAddr,
    /// Higher endpoint
    pub b: SocketAddr,
}

impl FlowKey {
    pub fn new(transport: Transport, x: SocketAddr, y: SocketAddr) -> Self {
        let (a, b) = if endpoint_order(&x) <= endpoint_order(&y) {
            (x, y)
        } else {
            (y, x)
        };
        Self { transport, a, b }
    }

    pub fn from_packet(packet: &Packet) -> Self {
        Self::new(packet.transport, packet.src, packet.dst)
    }

    /// Stable hash used to pick a shard
    pub fn shard_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

fn endpoint_order(addr: &SocketAddr) -> (std::net::IpAddr, u16) {
    (addr.ip(), addr.port())
}

/// Per-direction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
}

/// What a single packet did to a flow
#[derive(Debug, Default)]
pub struct Observed {
    pub chunks: Vec<Chunk>,
    pub retransmitted: usize,
    pub lost: usize,
}

/// A bidirectional transport flow carrying caller state `S`
#[derive(Debug)]
pub struct Flow<S> {
    pub id: u64,
    pub key: FlowKey,
    /// Initiator: sender of the SYN, else inferred from the first packet
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    stats: [DirectionStats; 2],
    streams: [StreamBuffer; 2],
    fin: [bool; 2],
    reset: bool,
    pub state: S,
}

impl<S> Flow<S> {
    pub(crate) fn new(
        id: u64,
        key: FlowKey,
        client: SocketAddr,
        server: SocketAddr,
        timestamp_ns: u64,
        window: u32,
        state: S,
    ) -> Self {
        Self {
            id,
            key,
            client,
            server,
            first_seen_ns: timestamp_ns,
            last_seen_ns: timestamp_ns,
            stats: [DirectionStats::default(); 2],
            streams: [StreamBuffer::new(window), StreamBuffer::new(window)],
            fin: [false; 2],
            reset: false,
            state,
        }
    }

    pub fn transport(&self) -> Transport {
        self.key.transport
    }

    pub fn info(&self) -> FlowInfo {
        FlowInfo {
            flow_id: self.id,
            transport: self.key.transport,
            client: self.client.into(),
            server: self.server.into(),
        }
    }

    pub fn stats(&self, direction: Direction) -> DirectionStats {
        self.stats[direction.index()]
    }

    pub fn direction_of(&self, packet: &Packet) -> Direction {
        if packet.src == self.client {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// Both sides sent FIN, or either side sent RST
    pub fn is_closing(&self) -> bool {
        self.reset || (self.fin[0] && self.fin[1])
    }

    pub(crate) fn observe(&mut self, packet: Packet) -> (Direction, Observed) {
        let direction = self.direction_of(&packet);
        let idx = direction.index();
        self.last_seen_ns = self.last_seen_ns.max(packet.timestamp_ns);
        self.stats[idx].packets += 1;
        self.stats[idx].bytes += packet.payload.len() as u64;

        let mut observed = Observed::default();
        match packet.tcp {
            Some(tcp) => {
                let stream = &mut self.streams[idx];
                if tcp.flags.syn() {
                    stream.set_initial_seq(tcp.seq);
                }
                if !packet.payload.is_empty() {
                    let Pushed {
                        chunks,
                        retransmitted,
                        lost,
                    } = stream.push(tcp.seq, &packet.payload, packet.timestamp_ns);
                    observed = Observed {
                        chunks,
                        retransmitted,
                        lost,
                    };
                }
                if tcp.flags.fin() {
                    self.fin[idx] = true;
                }
                if tcp.flags.rst() {
                    self.reset = true;
                }
            }
            None => {
                if !packet.payload.is_empty() {
                    observed.chunks.push(Chunk::Data {
                        bytes: packet.payload,
                        timestamp_ns: packet.timestamp_ns,
                    });
                }
            }
        }

        (direction, observed)
    }

    /// Release data still parked in the reassembly buffers
    pub fn flush(&mut self) -> Vec<(Direction, Chunk)> {
        let mut out = Vec::new();
        for direction in [Direction::ToServer, Direction::ToClient] {
            for chunk in self.streams[direction.index()].flush() {
                out.push((direction, chunk));
            }
        }
        out
    }
}

/// Work out who initiated a flow from its first packet.
///
/// Without a handshake to go by, a flow joined mid-stream is oriented by
/// `server_ports`: a packet sent from a known server port to any other port
/// is travelling towards the client.
pub(crate) fn initiator(packet: &Packet, server_ports: &HashSet<u16>) -> (SocketAddr, SocketAddr) {
    match packet.tcp {
        // Picked up at the SYN-ACK: the sender is the server
        Some(tcp) if tcp.flags.syn() && tcp.flags.ack() => (packet.dst, packet.src),
        Some(tcp) if tcp.flags.syn() => (packet.src, packet.dst),
        _ if server_ports.contains(&packet.src.port())
            && !server_ports.contains(&packet.dst.port()) =>
        {
            (packet.dst, packet.src)
        }
        _ => (packet.src, packet.dst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::packet::{TcpFlags, TcpHeader};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_key_is_direction_independent() {
        let x = addr("10.0.0.1:40000");
        let y = addr("10.0.0.2:80");
        assert_eq!(
            FlowKey::new(Transport::Tcp, x, y),
            FlowKey::new(Transport::Tcp, y, x)
        );
        assert_ne!(
            FlowKey::new(Transport::Tcp, x, y),
            FlowKey::new(Transport::Udp, x, y)
        );
        assert_eq!(
            FlowKey::new(Transport::Tcp, x, y).shard_hash(),
            FlowKey::new(Transport::Tcp, y, x).shard_hash()
        );
    }

    #[test]
    fn test_initiator_from_syn_ack() {
        let server = addr("10.0.0.2:80");
        let client = addr("10.0.0.1:40000");
        let syn_ack = Packet::tcp(
            0,
            server,
            client,
            TcpHeader {
                seq: 1,
                ack: 1,
                flags: TcpFlags(TcpFlags::SYN | TcpFlags::ACK),
            },
            Vec::new(),
        );
        assert_eq!(initiator(&syn_ack, &HashSet::new()), (client, server));

        let data = Packet::udp(0, client, server, b"q".to_vec());
        assert_eq!(initiator(&data, &HashSet::new()), (client, server));
    }

    #[test]
    fn test_initiator_mid_stream_uses_server_ports() {
        let server = addr("10.0.0.2:80");
        let client = addr("10.0.0.1:40000");
        let ports = HashSet::from([80]);
        let ack = TcpHeader {
            seq: 1,
            ack: 1,
            flags: TcpFlags(TcpFlags::ACK),
        };

        let response = Packet::tcp(0, server, client, ack, b"HTTP/1.1 200 OK\r\n".to_vec());
        assert_eq!(initiator(&response, &ports), (client, server));
        // Unknown ports keep the sender as client
        assert_eq!(initiator(&response, &HashSet::new()), (server, client));

        // A SYN is trusted over the port hint
        let syn = Packet::tcp(
            0,
            server,
            client,
            TcpHeader {
                seq: 1,
                ack: 0,
                flags: TcpFlags(TcpFlags::SYN),
            },
            Vec::new(),
        );
        assert_eq!(initiator(&syn, &ports), (server, client));

        // Both ends on server ports: nothing to go by
        let peer = addr("10.0.0.3:443");
        let ports = HashSet::from([80, 443]);
        let between = Packet::tcp(0, server, peer, ack, b"x".to_vec());
        assert_eq!(initiator(&between, &ports), (server, peer));
    }
}

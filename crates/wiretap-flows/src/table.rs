//! Bounded flow table
//!
//! Flows live in an `LruCache` ordered by last activity, so the least
//! recently seen flow is the eviction candidate when the table is full and
//! idle expiry only has to walk from the cold end.

use crate::flow::{initiator, Flow, FlowKey};
use crate::reassembly::Chunk;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::Duration;
use tracing::{debug, trace};
use wiretap_core::config::FlowSettings;
use wiretap_core::packet::{Direction, Packet, Transport};
use wiretap_core::transaction::FlowInfo;

/// Flow table limits
#[derive(Debug, Clone)]
pub struct FlowTableConfig {
    pub tcp_idle_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub reorder_window: u32,
    pub max_flows: usize,
    /// Ports decoders listen on, used to orient flows joined mid-stream
    pub server_ports: HashSet<u16>,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self::from(&FlowSettings::default())
    }
}

impl From<&FlowSettings> for FlowTableConfig {
    fn from(settings: &FlowSettings) -> Self {
        Self {
            tcp_idle_timeout: settings.tcp_idle_timeout(),
            udp_idle_timeout: settings.udp_idle_timeout(),
            reorder_window: settings.reorder_window_bytes,
            max_flows: settings.max_flows,
            server_ports: HashSet::new(),
        }
    }
}

impl FlowTableConfig {
    pub fn with_server_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.server_ports.extend(ports);
        self
    }

    fn idle_timeout_ns(&self, transport: Transport) -> u64 {
        let timeout = match transport {
            Transport::Tcp => self.tcp_idle_timeout,
            Transport::Udp => self.udp_idle_timeout,
        };
        timeout.as_nanos() as u64
    }
}

/// Outcome of feeding one packet to the table
#[derive(Debug)]
pub struct Ingest<'a, S> {
    pub flow: &'a mut Flow<S>,
    pub direction: Direction,
    /// The packet created the flow
    pub opened: bool,
    /// In-order bytes released by this packet
    pub chunks: Vec<Chunk>,
    pub retransmitted: usize,
    pub lost: usize,
    /// The flow saw FIN from both sides or a RST; the caller should remove it
    pub closing: bool,
    /// Flow pushed out to make room for this one
    pub evicted: Option<Flow<S>>,
}

/// Flow table holding caller state `S` per flow
pub struct FlowTable<S> {
    config: FlowTableConfig,
    flows: LruCache<FlowKey, Flow<S>>,
    next_id: u64,
    id_stride: u64,
}

impl<S> FlowTable<S> {
    pub fn new(config: FlowTableConfig) -> Self {
        Self::with_ids(config, 1, 1)
    }

    /// Flow ids are `first_id`, `first_id + stride`, ... so that several
    /// tables can hand out ids without colliding.
    pub fn with_ids(config: FlowTableConfig, first_id: u64, stride: u64) -> Self {
        let capacity = NonZeroUsize::new(config.max_flows).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            flows: LruCache::new(capacity),
            next_id: first_id,
            id_stride: stride.max(1),
        }
    }

    pub fn config(&self) -> &FlowTableConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut Flow<S>> {
        self.flows.peek_mut(key)
    }

    /// Every tracked flow, without touching recency
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Flow<S>> {
        self.flows.iter_mut().map(|(_, flow)| flow)
    }

    /// Feed a packet. `new_state` builds the caller state when the packet opens a flow.
    ///
    /// Returns `None` for a bare TCP control segment (no SYN, no payload) of an
    /// unknown flow. Those are mostly the last ACKs of a connection that was
    /// already closed and removed, and must not bring it back.
    pub fn ingest<F>(&mut self, packet: Packet, new_state: F) -> Option<Ingest<'_, S>>
    where
        F: FnOnce(&FlowInfo) -> S,
    {
        let key = FlowKey::from_packet(&packet);
        if !self.flows.contains(&key) && !opens_flow(&packet) {
            trace!(?key, "Ignoring control segment of untracked flow");
            return None;
        }
        let mut evicted = None;
        let mut opened = false;

        if !self.flows.contains(&key) && self.flows.len() >= self.config.max_flows {
            if let Some((old_key, old)) = self.flows.pop_lru() {
                debug!(flow_id = old.id, ?old_key, "Flow table full, evicting oldest idle flow");
                evicted = Some(old);
            }
        }

        let window = self.config.reorder_window;
        let server_ports = &self.config.server_ports;
        let next_id = &mut self.next_id;
        let stride = self.id_stride;
        let flow = self.flows.get_or_insert_mut(key, || {
            let id = *next_id;
            *next_id += stride;
            let (client, server) = initiator(&packet, server_ports);
            let info = FlowInfo {
                flow_id: id,
                transport: key.transport,
                client: client.into(),
                server: server.into(),
            };
            let state = new_state(&info);
            opened = true;
            trace!(flow_id = id, %client, %server, transport = %key.transport, "Flow opened");
            Flow::new(id, key, client, server, packet.timestamp_ns, window, state)
        });

        let (direction, observed) = flow.observe(packet);
        let closing = flow.is_closing();

        Some(Ingest {
            flow,
            direction,
            opened,
            chunks: observed.chunks,
            retransmitted: observed.retransmitted,
            lost: observed.lost,
            closing,
            evicted,
        })
    }

    /// Remove a flow (closed by the caller)
    pub fn remove(&mut self, key: &FlowKey) -> Option<Flow<S>> {
        self.flows.pop(key)
    }

    /// Remove and return flows idle for longer than their transport's timeout
    pub fn expire(&mut self, now_ns: u64) -> Vec<Flow<S>> {
        let tcp = self.config.idle_timeout_ns(Transport::Tcp);
        let udp = self.config.idle_timeout_ns(Transport::Udp);
        let shortest = tcp.min(udp);

        // Walk from the cold end; once a flow is younger than the shortest
        // timeout nothing warmer can be expired either.
        let mut expired_keys = Vec::new();
        for (key, flow) in self.flows.iter().rev() {
            let idle = now_ns.saturating_sub(flow.last_seen_ns);
            if idle < shortest {
                break;
            }
            if idle >= self.config.idle_timeout_ns(key.transport) {
                expired_keys.push(*key);
            }
        }

        expired_keys
            .iter()
            .filter_map(|key| self.flows.pop(key))
            .collect()
    }

    /// Remove every flow (shutdown)
    pub fn drain(&mut self) -> Vec<Flow<S>> {
        let mut out = Vec::with_capacity(self.flows.len());
        while let Some((_, flow)) = self.flows.pop_lru() {
            out.push(flow);
        }
        out
    }
}

/// Whether a packet for an untracked key starts a new flow
fn opens_flow(packet: &Packet) -> bool {
    match packet.tcp {
        Some(tcp) => tcp.flags.syn() || !packet.payload.is_empty(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::concat;
    use std::net::SocketAddr;
    use wiretap_core::packet::{TcpFlags, TcpHeader};

    const MS: u64 = 1_000_000;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn tcp(ts: u64, src: &str, dst: &str, seq: u32, flags: u8, payload: &[u8]) -> Packet {
        Packet::tcp(
            ts,
            addr(src),
            addr(dst),
            TcpHeader {
                seq,
                ack: 0,
                flags: TcpFlags(flags),
            },
            payload.to_vec(),
        )
    }

    fn config(max_flows: usize) -> FlowTableConfig {
        FlowTableConfig {
            tcp_idle_timeout: Duration::from_millis(1000),
            udp_idle_timeout: Duration::from_millis(100),
            reorder_window: 4096,
            max_flows,
            server_ports: HashSet::new(),
        }
    }

    const C: &str = "10.0.0.1:40000";
    const S: &str = "10.0.0.2:80";

    #[test]
    fn test_handshake_and_bidirectional_data() {
        let mut table: FlowTable<Vec<u8>> = FlowTable::new(config(16));

        let syn = table.ingest(tcp(0, C, S, 100, TcpFlags::SYN, b""), |_| Vec::new()).unwrap();
        assert!(syn.opened);
        assert_eq!(syn.direction, Direction::ToServer);
        assert_eq!(syn.flow.client, addr(C));

        let syn_ack = table.ingest(
            tcp(MS, S, C, 500, TcpFlags::SYN | TcpFlags::ACK, b""),
            |_| unreachable!(),
        ).unwrap();
        assert!(!syn_ack.opened);
        assert_eq!(syn_ack.direction, Direction::ToClient);

        let req = table.ingest(tcp(2 * MS, C, S, 101, TcpFlags::ACK, b"ping"), |_| Vec::new()).unwrap();
        assert_eq!(concat(&req.chunks), b"ping");
        let resp = table.ingest(tcp(3 * MS, S, C, 501, TcpFlags::ACK, b"pong"), |_| Vec::new()).unwrap();
        assert_eq!(resp.direction, Direction::ToClient);
        assert_eq!(concat(&resp.chunks), b"pong");
        assert_eq!(resp.flow.stats(Direction::ToServer).packets, 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_fin_both_sides_closes() {
        let mut table: FlowTable<()> = FlowTable::new(config(16));
        table.ingest(tcp(0, C, S, 1, TcpFlags::ACK, b"x"), |_| ());
        let first_fin = table.ingest(tcp(1, C, S, 2, TcpFlags::FIN | TcpFlags::ACK, b""), |_| ()).unwrap();
        assert!(!first_fin.closing);
        let second_fin = table.ingest(tcp(2, S, C, 9, TcpFlags::FIN | TcpFlags::ACK, b""), |_| ()).unwrap();
        assert!(second_fin.closing);

        let key = FlowKey::new(Transport::Tcp, addr(C), addr(S));
        assert!(table.remove(&key).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_rst_closes() {
        let mut table: FlowTable<()> = FlowTable::new(config(16));
        table.ingest(tcp(0, C, S, 1, TcpFlags::ACK, b"x"), |_| ());
        let rst = table.ingest(tcp(1, S, C, 9, TcpFlags::RST, b""), |_| ()).unwrap();
        assert!(rst.closing);
    }

    #[test]
    fn test_eviction_picks_oldest_idle() {
        let mut table: FlowTable<&'static str> = FlowTable::new(config(2));
        table.ingest(tcp(0, "10.0.0.1:1", S, 1, TcpFlags::ACK, b"a"), |_| "first");
        table.ingest(tcp(1, "10.0.0.1:2", S, 1, TcpFlags::ACK, b"b"), |_| "second");
        // Touch the first flow so the second becomes the coldest
        table.ingest(tcp(2, "10.0.0.1:1", S, 2, TcpFlags::ACK, b"c"), |_| "unused");

        let third = table.ingest(tcp(3, "10.0.0.1:3", S, 1, TcpFlags::ACK, b"d"), |_| "third").unwrap();
        let evicted = third.evicted.expect("table was full");
        assert_eq!(evicted.state, "second");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_expire_uses_transport_timeouts() {
        let mut table: FlowTable<()> = FlowTable::new(config(16));
        table.ingest(tcp(0, C, S, 1, TcpFlags::ACK, b"x"), |_| ());
        table.ingest(
            Packet::udp(0, addr("10.0.0.1:5353"), addr("10.0.0.53:53"), b"q".to_vec()),
            |_| (),
        );

        // Neither timeout reached
        assert!(table.expire(50 * MS).is_empty());

        // UDP timeout (100ms) reached, TCP (1s) not
        let expired = table.expire(150 * MS);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].transport(), Transport::Udp);

        let expired = table.expire(1000 * MS);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].transport(), Transport::Tcp);
        assert!(table.is_empty());
    }

    #[test]
    fn test_udp_datagrams_are_individual_chunks() {
        let mut table: FlowTable<()> = FlowTable::new(config(16));
        let client = "10.0.0.1:5353";
        let server = "10.0.0.53:53";
        let q = table.ingest(Packet::udp(7, addr(client), addr(server), b"query".to_vec()), |_| ()).unwrap();
        assert_eq!(q.chunks, vec![Chunk::data(b"query".to_vec(), 7)]);
        let r = table.ingest(Packet::udp(8, addr(server), addr(client), b"answer".to_vec()), |_| ()).unwrap();
        assert_eq!(r.direction, Direction::ToClient);
        assert_eq!(r.chunks.len(), 1);
    }

    #[test]
    fn test_flow_ids_with_stride() {
        let mut table: FlowTable<u64> = FlowTable::with_ids(config(16), 3, 4);
        let a = table.ingest(tcp(0, "10.0.0.1:1", S, 1, 0, b"a"), |info| info.flow_id).unwrap().flow.id;
        let b = table.ingest(tcp(0, "10.0.0.1:2", S, 1, 0, b"a"), |info| info.flow_id).unwrap().flow.id;
        assert_eq!((a, b), (3, 7));
    }

    #[test]
    fn test_drain_returns_everything() {
        let mut table: FlowTable<()> = FlowTable::new(config(16));
        table.ingest(tcp(0, "10.0.0.1:1", S, 1, 0, b"a"), |_| ());
        table.ingest(tcp(0, "10.0.0.1:2", S, 1, 0, b"a"), |_| ());
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_control_segments_after_close_do_not_reopen() {
        let mut table: FlowTable<()> = FlowTable::new(config(16));
        table.ingest(tcp(0, C, S, 1, TcpFlags::SYN, b""), |_| ()).unwrap();
        table.ingest(tcp(1, C, S, 2, TcpFlags::FIN | TcpFlags::ACK, b""), |_| ());
        let closing = table
            .ingest(tcp(2, S, C, 9, TcpFlags::FIN | TcpFlags::ACK, b""), |_| ())
            .unwrap();
        assert!(closing.closing);
        let key = FlowKey::new(Transport::Tcp, addr(C), addr(S));
        assert!(table.remove(&key).is_some());

        // Final ACK of the teardown, then a stray RST
        assert!(table.ingest(tcp(3, C, S, 3, TcpFlags::ACK, b""), |_| ()).is_none());
        assert!(table.ingest(tcp(4, S, C, 10, TcpFlags::RST, b""), |_| ()).is_none());
        assert!(table.is_empty());

        // Data or a new SYN on the same key still opens a flow
        let data = table.ingest(tcp(5, C, S, 3, TcpFlags::ACK, b"again"), |_| ()).unwrap();
        assert!(data.opened);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_mid_stream_join_at_server_packet() {
        let mut table: FlowTable<()> =
            FlowTable::new(config(16).with_server_ports([80]));

        let response = table
            .ingest(tcp(0, S, C, 500, TcpFlags::ACK, b"HTTP/1.1 200 OK\r\n\r\n"), |info| {
                assert_eq!(info.server.port, 80);
            })
            .unwrap();
        assert!(response.opened);
        assert_eq!(response.direction, Direction::ToClient);
        assert_eq!(response.flow.client, addr(C));
        assert_eq!(response.flow.server, addr(S));

        let request = table
            .ingest(tcp(MS, C, S, 100, TcpFlags::ACK, b"GET / HTTP/1.1\r\n\r\n"), |_| ())
            .unwrap();
        assert_eq!(request.direction, Direction::ToServer);
    }
}

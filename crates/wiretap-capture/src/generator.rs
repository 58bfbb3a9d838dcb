//! Synthetic traffic generator
//!
//! Produces complete conversations for every supported protocol without
//! needing a network interface or capture privileges. Used by `wiretap demo`
//! and by pipeline tests.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info};
use trust_dns_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::rdata::A;
use trust_dns_proto::rr::{Name, RData, Record, RecordType};
use trust_dns_proto::serialize::binary::BinEncodable;
use wiretap_core::metrics::{add, inc, SharedMetrics};
use wiretap_core::packet::{Packet, TcpFlags, TcpHeader};
use wiretap_core::plugins::{
    CapturePlugin, CaptureStats, Plugin, PluginError, PluginInfo, PluginResult,
};

/// Configuration for synthetic traffic
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Pause between conversation rounds in milliseconds
    pub interval_ms: u64,

    /// Number of rounds to generate (0 = until stopped)
    pub rounds: u64,

    /// Every n-th round includes an HTTP request that is never answered (0 = never)
    pub unanswered_every: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            rounds: 0,
            unanswered_every: 4,
        }
    }
}

/// Traffic generator plugin
pub struct TrafficGenerator {
    config: GeneratorConfig,
    metrics: SharedMetrics,
    running: Arc<AtomicBool>,
}

impl TrafficGenerator {
    pub fn new(config: GeneratorConfig, metrics: SharedMetrics) -> Self {
        Self {
            config,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Packets for one round of conversations
pub fn round(round: u64, start_ns: u64, unanswered: bool) -> Vec<Packet> {
    let client_port = 40_000 + (round % 20_000) as u16;
    let client = |last: u8| SocketAddr::from((Ipv4Addr::new(10, 0, 0, last), client_port));
    let mut packets = Vec::new();

    // HTTP with keep-alive pipelining
    let mut http = TcpConversation::new(client(10), server(20, 8080), start_ns);
    packets.extend(http.open());
    packets.push(http.to_server(http_get("/api/users", round)));
    packets.push(http.to_server(http_post("/api/orders", b"{\"item\":42}")));
    packets.push(http.to_client(http_response(200, "OK", b"[{\"id\":1}]")));
    packets.push(http.to_client(http_response(
        if round % 5 == 4 { 503 } else { 201 },
        if round % 5 == 4 { "Service Unavailable" } else { "Created" },
        b"{}",
    )));
    if unanswered {
        packets.push(http.to_server(http_get("/slow", round)));
    } else {
        packets.extend(http.close());
    }

    // Thrift framed binary protocol
    let mut thrift = TcpConversation::new(client(11), server(21, 9090), http.now());
    packets.extend(thrift.open());
    let seq_id = round as i32;
    packets.push(thrift.to_server(thrift_call("getUser", seq_id, 1, false)));
    packets.push(thrift.to_server(thrift_call("logEvent", seq_id + 1, 4, true)));
    packets.push(thrift.to_client(thrift_reply("getUser", seq_id, "alice")));
    packets.extend(thrift.close());

    // TLS handshake, then encrypted records that must be ignored
    let mut tls = TcpConversation::new(client(12), server(22, 443), thrift.now());
    packets.extend(tls.open());
    packets.push(tls.to_server(tls_client_hello("api.example.com", &["h2", "http/1.1"])));
    packets.push(tls.to_client(tls_server_hello("h2")));
    packets.push(tls.to_client(vec![0x14, 0x03, 0x03, 0x00, 0x01, 0x01]));
    packets.push(tls.to_server(vec![0x14, 0x03, 0x03, 0x00, 0x01, 0x01]));
    packets.push(tls.to_server(vec![0x17, 0x03, 0x03, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef]));
    packets.extend(tls.close());

    // DNS over UDP
    let resolver = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 53), 53));
    let dns_client = client(13);
    let id = (round % u16::MAX as u64) as u16;
    let ts = tls.now() + 100_000;
    if let Some(query) = dns_query(id, "db.internal.example.") {
        packets.push(Packet::udp(ts, dns_client, resolver, query));
    }
    if let Some(answer) = dns_answer(id, "db.internal.example.", Ipv4Addr::new(10, 1, 2, 3)) {
        packets.push(Packet::udp(ts + 400_000, resolver, dns_client, answer));
    }

    packets
}

fn server(last: u8, port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(10, 0, 1, last), port))
}

/// Tracks sequence numbers and time for a synthetic TCP connection
pub struct TcpConversation {
    client: SocketAddr,
    server: SocketAddr,
    client_seq: u32,
    server_seq: u32,
    ts: u64,
}

impl TcpConversation {
    pub fn new(client: SocketAddr, server: SocketAddr, start_ns: u64) -> Self {
        Self {
            client,
            server,
            client_seq: 1_000,
            server_seq: 50_000,
            ts: start_ns,
        }
    }

    pub fn now(&self) -> u64 {
        self.ts
    }

    fn tick(&mut self, ns: u64) -> u64 {
        self.ts += ns;
        self.ts
    }

    fn client_packet(&mut self, flags: u8, payload: Vec<u8>) -> Packet {
        let ts = self.tick(100_000);
        let header = TcpHeader {
            seq: self.client_seq,
            ack: self.server_seq,
            flags: TcpFlags(flags),
        };
        self.client_seq = self.client_seq.wrapping_add(payload.len() as u32);
        Packet::tcp(ts, self.client, self.server, header, payload)
    }

    fn server_packet(&mut self, flags: u8, payload: Vec<u8>) -> Packet {
        // Servers take a couple of milliseconds to answer
        let ts = self.tick(2_000_000);
        let header = TcpHeader {
            seq: self.server_seq,
            ack: self.client_seq,
            flags: TcpFlags(flags),
        };
        self.server_seq = self.server_seq.wrapping_add(payload.len() as u32);
        Packet::tcp(ts, self.server, self.client, header, payload)
    }

    /// Three-way handshake
    pub fn open(&mut self) -> Vec<Packet> {
        let syn = self.client_packet(TcpFlags::SYN, Vec::new());
        self.client_seq = self.client_seq.wrapping_add(1);
        let syn_ack = self.server_packet(TcpFlags::SYN | TcpFlags::ACK, Vec::new());
        self.server_seq = self.server_seq.wrapping_add(1);
        let ack = self.client_packet(TcpFlags::ACK, Vec::new());
        vec![syn, syn_ack, ack]
    }

    pub fn to_server(&mut self, payload: Vec<u8>) -> Packet {
        self.client_packet(TcpFlags::PSH | TcpFlags::ACK, payload)
    }

    pub fn to_client(&mut self, payload: Vec<u8>) -> Packet {
        self.server_packet(TcpFlags::PSH | TcpFlags::ACK, payload)
    }

    /// FIN from both sides
    pub fn close(&mut self) -> Vec<Packet> {
        let fin = self.client_packet(TcpFlags::FIN | TcpFlags::ACK, Vec::new());
        let fin_ack = self.server_packet(TcpFlags::FIN | TcpFlags::ACK, Vec::new());
        vec![fin, fin_ack]
    }
}

pub fn http_get(path: &str, round: u64) -> Vec<u8> {
    format!(
        "GET {}?page={} HTTP/1.1\r\nHost: api.internal\r\nUser-Agent: wiretap-demo/1.0\r\nAccept: */*\r\n\r\n",
        path, round
    )
    .into_bytes()
}

pub fn http_post(path: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "POST {} HTTP/1.1\r\nHost: api.internal\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        path,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn http_response(status: u16, reason: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        status,
        reason,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Framed strict-binary Thrift call with a single i32 argument
pub fn thrift_call(method: &str, seq_id: i32, arg: i32, oneway: bool) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&[0x80, 0x01, 0x00, if oneway { 4 } else { 1 }]);
    msg.extend_from_slice(&(method.len() as i32).to_be_bytes());
    msg.extend_from_slice(method.as_bytes());
    msg.extend_from_slice(&seq_id.to_be_bytes());
    // field 1: i32
    msg.extend_from_slice(&[8, 0x00, 0x01]);
    msg.extend_from_slice(&arg.to_be_bytes());
    msg.push(0); // STOP
    framed(msg)
}

/// Framed strict-binary Thrift reply whose success field is a string
pub fn thrift_reply(method: &str, seq_id: i32, value: &str) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&[0x80, 0x01, 0x00, 2]);
    msg.extend_from_slice(&(method.len() as i32).to_be_bytes());
    msg.extend_from_slice(method.as_bytes());
    msg.extend_from_slice(&seq_id.to_be_bytes());
    // field 0: string
    msg.extend_from_slice(&[11, 0x00, 0x00]);
    msg.extend_from_slice(&(value.len() as i32).to_be_bytes());
    msg.extend_from_slice(value.as_bytes());
    msg.push(0);
    framed(msg)
}

fn framed(msg: Vec<u8>) -> Vec<u8> {
    let mut out = (msg.len() as u32).to_be_bytes().to_vec();
    out.extend(msg);
    out
}

fn with_u16_len(body: Vec<u8>) -> Vec<u8> {
    let mut out = (body.len() as u16).to_be_bytes().to_vec();
    out.extend(body);
    out
}

fn handshake_record(handshake_type: u8, body: Vec<u8>) -> Vec<u8> {
    let len = body.len() as u32;
    let mut handshake = vec![handshake_type];
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend(body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend(with_u16_len(handshake));
    record
}

fn extension(kind: u16, data: Vec<u8>) -> Vec<u8> {
    let mut out = kind.to_be_bytes().to_vec();
    out.extend(with_u16_len(data));
    out
}

fn alpn_extension(protocols: &[&str]) -> Vec<u8> {
    let mut list = Vec::new();
    for proto in protocols {
        list.push(proto.len() as u8);
        list.extend_from_slice(proto.as_bytes());
    }
    extension(0x0010, with_u16_len(list))
}

pub fn tls_client_hello(server_name: &str, alpn: &[&str]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x11; 32]); // random
    body.push(32);
    body.extend_from_slice(&[0x22; 32]); // session id
    body.extend(with_u16_len(vec![0x13, 0x01, 0x13, 0x02, 0xc0, 0x2f]));
    body.extend_from_slice(&[1, 0]); // compression: null

    let mut sni = vec![0x00];
    sni.extend(with_u16_len(server_name.as_bytes().to_vec()));
    let mut extensions = extension(0x0000, with_u16_len(sni));
    extensions.extend(alpn_extension(alpn));
    extensions.extend(extension(0x002b, vec![4, 0x03, 0x04, 0x03, 0x03]));
    body.extend(with_u16_len(extensions));

    handshake_record(0x01, body)
}

pub fn tls_server_hello(alpn: &str) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x33; 32]);
    body.push(32);
    body.extend_from_slice(&[0x22; 32]);
    body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    body.push(0);

    let mut extensions = extension(0x002b, vec![0x03, 0x04]);
    extensions.extend(alpn_extension(&[alpn]));
    body.extend(with_u16_len(extensions));

    handshake_record(0x02, body)
}

pub fn dns_query(id: u16, name: &str) -> Option<Vec<u8>> {
    let name = Name::from_ascii(name).ok()?;
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    msg.to_bytes().ok()
}

pub fn dns_answer(id: u16, name: &str, addr: Ipv4Addr) -> Option<Vec<u8>> {
    let name = Name::from_ascii(name).ok()?;
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError)
        .add_query(Query::query(name.clone(), RecordType::A))
        .add_answer(Record::from_rdata(name, 300, RData::A(A(addr))));
    msg.to_bytes().ok()
}

impl PluginInfo for TrafficGenerator {
    fn name(&self) -> &str {
        "generator"
    }

    fn description(&self) -> &str {
        "Generates synthetic HTTP, Thrift, TLS and DNS conversations"
    }
}

impl Plugin for TrafficGenerator {
    fn shutdown(&mut self) -> PluginResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CapturePlugin for TrafficGenerator {
    async fn start(&mut self, tx: mpsc::Sender<Packet>) -> PluginResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PluginError::OperationFailed("Already running".into()));
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_ms = self.config.interval_ms,
            rounds = self.config.rounds,
            "Starting synthetic traffic generator"
        );

        let running = self.running.clone();
        let metrics = self.metrics.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut n = 0u64;
            'rounds: while running.load(Ordering::SeqCst) {
                if config.rounds > 0 && n >= config.rounds {
                    break;
                }

                let unanswered = config.unanswered_every > 0 && n % config.unanswered_every == 0;
                for packet in round(n, now_ns(), unanswered) {
                    inc(&metrics.capture.packets_seen);
                    add(&metrics.capture.bytes, packet.payload.len() as u64);
                    if tx.send(packet).await.is_err() {
                        break 'rounds;
                    }
                }
                debug!(round = n, "Generated conversation round");

                n += 1;
                tokio::time::sleep(std::time::Duration::from_millis(config.interval_ms)).await;
            }

            running.store(false, Ordering::SeqCst);
            info!("Traffic generator stopped after {} rounds", n);
        });

        Ok(())
    }

    async fn stop(&mut self) -> PluginResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            packets_captured: self.metrics.capture.packets_seen.load(Ordering::Relaxed),
            bytes_captured: self.metrics.capture.bytes.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::metrics::create_metrics;

    #[test]
    fn test_round_shape() {
        let packets = round(1, 1_000, false);
        assert!(packets.iter().any(|p| p.dst.port() == 8080));
        assert!(packets.iter().any(|p| p.dst.port() == 9090));
        assert!(packets.iter().any(|p| p.dst.port() == 443));
        assert!(packets.iter().any(|p| p.dst.port() == 53));
        // Timestamps never go backwards within a conversation
        let http: Vec<_> = packets
            .iter()
            .filter(|p| p.dst.port() == 8080 || p.src.port() == 8080)
            .collect();
        assert!(http.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
    }

    #[test]
    fn test_tcp_sequence_tracking() {
        let c: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        let s: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let mut conv = TcpConversation::new(c, s, 0);
        let handshake = conv.open();
        assert!(handshake[0].tcp.unwrap().flags.syn());
        let first = conv.to_server(b"abc".to_vec());
        let second = conv.to_server(b"def".to_vec());
        assert_eq!(first.tcp.unwrap().seq, 1_001);
        assert_eq!(second.tcp.unwrap().seq, 1_004);
    }

    #[test]
    fn test_dns_messages_encode() {
        let query = dns_query(7, "example.com.").unwrap();
        assert_eq!(&query[..2], &[0, 7]);
        let answer = dns_answer(7, "example.com.", Ipv4Addr::new(1, 2, 3, 4)).unwrap();
        let parsed = Message::from_vec(&answer).unwrap();
        assert_eq!(parsed.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_generator_runs() {
        let metrics = create_metrics();
        let mut generator = TrafficGenerator::new(
            GeneratorConfig {
                interval_ms: 1,
                rounds: 2,
                unanswered_every: 0,
            },
            metrics.clone(),
        );
        let (tx, mut rx) = mpsc::channel(1024);
        generator.start(tx).await.unwrap();

        let mut count = 0;
        while let Some(_packet) = rx.recv().await {
            count += 1;
        }
        assert_eq!(count as u64, generator.stats().packets_captured);
        assert_eq!(count, round(0, 0, false).len() * 2);
    }
}

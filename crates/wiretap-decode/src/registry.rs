//! Port-based decoder selection

use crate::{DnsDecoder, HttpDecoder, ProtocolDecoder, ThriftDecoder, TlsDecoder};
use std::collections::HashMap;
use tracing::debug;
use wiretap_core::config::{ProtocolSettings, ThriftTransport};
use wiretap_core::packet::Transport;
use wiretap_core::transaction::FlowInfo;

/// Per-protocol knobs needed to build decoders
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    pub http_capture_headers: Vec<String>,
    pub thrift_transport: ThriftTransport,
    pub thrift_max_message_bytes: usize,
}

impl From<&ProtocolSettings> for DecoderOptions {
    fn from(settings: &ProtocolSettings) -> Self {
        Self {
            http_capture_headers: settings.http.capture_headers.clone(),
            thrift_transport: settings.thrift.transport,
            thrift_max_message_bytes: settings.thrift.max_message_bytes,
        }
    }
}

type Constructor = fn(&DecoderOptions, Transport) -> Option<ProtocolDecoder>;

fn http(options: &DecoderOptions, transport: Transport) -> Option<ProtocolDecoder> {
    (transport == Transport::Tcp).then(|| ProtocolDecoder::Http(HttpDecoder::new(&options.http_capture_headers)))
}

fn thrift(options: &DecoderOptions, transport: Transport) -> Option<ProtocolDecoder> {
    (transport == Transport::Tcp).then(|| {
        ProtocolDecoder::Thrift(ThriftDecoder::new(
            options.thrift_transport,
            options.thrift_max_message_bytes,
        ))
    })
}

fn tls(_: &DecoderOptions, transport: Transport) -> Option<ProtocolDecoder> {
    (transport == Transport::Tcp).then(|| ProtocolDecoder::Tls(TlsDecoder::new()))
}

fn dns(_: &DecoderOptions, transport: Transport) -> Option<ProtocolDecoder> {
    Some(ProtocolDecoder::Dns(DnsDecoder::new(transport)))
}

/// Every decoder this build knows about, keyed by protocol name
const DECODERS: &[(&str, Constructor)] = &[
    (crate::http::PROTOCOL, http),
    (crate::thrift::PROTOCOL, thrift),
    (crate::tls::PROTOCOL, tls),
    (crate::dns::PROTOCOL, dns),
];

/// Maps configured ports to decoder constructors
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    ports: HashMap<u16, &'static str>,
    options: DecoderOptions,
}

impl DecoderRegistry {
    pub fn from_settings(settings: &ProtocolSettings) -> Self {
        let mut ports = HashMap::new();
        for (name, list) in settings.enabled_ports() {
            for &port in list {
                ports.insert(port, name);
            }
        }
        debug!(ports = ports.len(), "Decoder registry built");
        Self {
            ports,
            options: DecoderOptions::from(settings),
        }
    }

    /// Names of all known decoders
    pub fn protocols() -> impl Iterator<Item = &'static str> {
        DECODERS.iter().map(|(name, _)| *name)
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Protocol configured on a port
    pub fn protocol_on(&self, port: u16) -> Option<&'static str> {
        self.ports.get(&port).copied()
    }

    /// Decoder by protocol name
    pub fn create(&self, protocol: &str, transport: Transport) -> Option<ProtocolDecoder> {
        DECODERS
            .iter()
            .find(|(name, _)| *name == protocol)
            .and_then(|(_, constructor)| constructor(&self.options, transport))
    }

    /// Decoder for a new flow. The server port decides; the client port is
    /// tried too for flows picked up mid-stream with the roles inverted.
    pub fn for_flow(&self, flow: &FlowInfo) -> Option<ProtocolDecoder> {
        let protocol = self
            .protocol_on(flow.server.port)
            .or_else(|| self.protocol_on(flow.client.port))?;
        self.create(protocol, flow.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn flow(client: &str, server: &str, transport: Transport) -> FlowInfo {
        FlowInfo {
            flow_id: 1,
            transport,
            client: client.parse::<SocketAddr>().unwrap().into(),
            server: server.parse::<SocketAddr>().unwrap().into(),
        }
    }

    #[test]
    fn test_selection_by_port() {
        let registry = DecoderRegistry::from_settings(&ProtocolSettings::default());

        let d = registry.for_flow(&flow("10.0.0.1:40000", "10.0.0.2:8080", Transport::Tcp));
        assert_eq!(d.map(|d| d.protocol()), Some("http"));

        let d = registry.for_flow(&flow("10.0.0.1:40000", "10.0.0.2:9090", Transport::Tcp));
        assert_eq!(d.map(|d| d.protocol()), Some("thrift"));

        let d = registry.for_flow(&flow("10.0.0.1:40000", "10.0.0.2:443", Transport::Tcp));
        assert_eq!(d.map(|d| d.protocol()), Some("tls"));

        let d = registry.for_flow(&flow("10.0.0.1:40000", "10.0.0.2:53", Transport::Udp));
        assert_eq!(d.map(|d| d.protocol()), Some("dns"));

        // Roles inverted: the server port shows up as the client's
        let d = registry.for_flow(&flow("10.0.0.2:443", "10.0.0.1:40000", Transport::Tcp));
        assert_eq!(d.map(|d| d.protocol()), Some("tls"));

        assert!(registry
            .for_flow(&flow("10.0.0.1:40000", "10.0.0.2:22", Transport::Tcp))
            .is_none());
        // HTTP is never decoded over UDP
        assert!(registry
            .for_flow(&flow("10.0.0.1:40000", "10.0.0.2:80", Transport::Udp))
            .is_none());
    }

    #[test]
    fn test_disabled_protocol() {
        let mut settings = ProtocolSettings::default();
        settings.tls.enabled = false;
        let registry = DecoderRegistry::from_settings(&settings);
        assert!(registry.protocol_on(443).is_none());
        assert_eq!(DecoderRegistry::protocols().count(), 4);
    }
}

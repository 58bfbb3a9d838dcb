//! BPF filter construction
//!
//! When no explicit filter is configured, the kernel filter is derived from
//! the ports of the enabled protocols so that uninteresting traffic never
//! reaches user space.

use wiretap_core::config::{CaptureSettings, ProtocolSettings};

/// Filter to install for a capture, if any
pub fn effective_filter(capture: &CaptureSettings, protocols: &ProtocolSettings) -> Option<String> {
    match &capture.bpf_filter {
        Some(filter) if !filter.trim().is_empty() => Some(filter.clone()),
        _ if capture.auto_bpf => build_port_filter(protocols),
        _ => None,
    }
}

/// `tcp port ... or udp port ...` covering every enabled protocol
pub fn build_port_filter(protocols: &ProtocolSettings) -> Option<String> {
    let mut tcp_ports = Vec::new();
    let mut udp_ports = Vec::new();

    for (name, ports) in protocols.enabled_ports() {
        for &port in ports {
            push_unique(&mut tcp_ports, port);
            // DNS is the only datagram protocol we decode
            if name == "dns" {
                push_unique(&mut udp_ports, port);
            }
        }
    }

    let mut clauses = Vec::new();
    if !tcp_ports.is_empty() {
        clauses.push(format!("(tcp and ({}))", port_list(&tcp_ports)));
    }
    if !udp_ports.is_empty() {
        clauses.push(format!("(udp and ({}))", port_list(&udp_ports)));
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" or "))
    }
}

fn push_unique(ports: &mut Vec<u16>, port: u16) {
    if !ports.contains(&port) {
        ports.push(port);
    }
}

fn port_list(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| format!("port {}", p))
        .collect::<Vec<_>>()
        .join(" or ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_filter() {
        let mut protocols = ProtocolSettings::default();
        protocols.http.ports = vec![80];
        protocols.thrift.ports = vec![9090];
        protocols.tls.enabled = false;
        protocols.dns.ports = vec![53];

        let filter = build_port_filter(&protocols).unwrap();
        assert_eq!(
            filter,
            "(tcp and (port 80 or port 9090 or port 53)) or (udp and (port 53))"
        );
    }

    #[test]
    fn test_no_protocols_no_filter() {
        let mut protocols = ProtocolSettings::default();
        protocols.http.enabled = false;
        protocols.thrift.enabled = false;
        protocols.tls.enabled = false;
        protocols.dns.enabled = false;
        assert!(build_port_filter(&protocols).is_none());
    }

    #[test]
    fn test_explicit_filter_wins() {
        let capture = CaptureSettings {
            bpf_filter: Some("host 10.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(
            effective_filter(&capture, &ProtocolSettings::default()).as_deref(),
            Some("host 10.0.0.1")
        );

        let capture = CaptureSettings {
            auto_bpf: false,
            ..Default::default()
        };
        assert!(effective_filter(&capture, &ProtocolSettings::default()).is_none());
    }
}

//! Link/network/transport decoding of captured frames
//!
//! Turns a raw frame into a `Packet`. Anything that is not TCP or UDP over
//! IPv4/IPv6 is ignored; frames whose headers do not hold together are
//! reported as malformed so the caller can count them.

use pnet_packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::vlan::VlanPacket;
use pnet_packet::Packet as _;
use std::net::{IpAddr, SocketAddr};
use wiretap_core::packet::{MacAddr, Packet, TcpFlags, TcpHeader};

/// Link-layer framing of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Raw IP, version taken from the first nibble
    Raw,
    /// Linux "cooked" capture (the `any` device)
    LinuxSll,
    /// BSD loopback with a 4-byte address family header
    Null,
}

/// Result of decoding one frame
#[derive(Debug, PartialEq)]
pub enum Frame {
    Packet(Packet),
    /// Well-formed but not something flows track (ARP, ICMP, fragments...)
    Ignored,
    Malformed(&'static str),
}

const MAX_VLAN_TAGS: usize = 2;

/// Decode a captured frame
pub fn decode_frame(link: LinkLayer, data: &[u8], timestamp_ns: u64) -> Frame {
    match link {
        LinkLayer::Ethernet => decode_ethernet(data, timestamp_ns),
        LinkLayer::Raw => decode_raw_ip(data, timestamp_ns, None),
        LinkLayer::LinuxSll => {
            // 16-byte header, protocol in the last two bytes
            if data.len() < 16 {
                return Frame::Malformed("short SLL header");
            }
            let ethertype = EtherType(u16::from_be_bytes([data[14], data[15]]));
            decode_network(ethertype, &data[16..], timestamp_ns, None)
        }
        LinkLayer::Null => {
            if data.len() < 4 {
                return Frame::Malformed("short loopback header");
            }
            decode_raw_ip(&data[4..], timestamp_ns, None)
        }
    }
}

fn decode_ethernet(data: &[u8], timestamp_ns: u64) -> Frame {
    let Some(eth) = EthernetPacket::new(data) else {
        return Frame::Malformed("short ethernet header");
    };
    let macs = Some((mac_at(data, 6), mac_at(data, 0)));

    let mut ethertype = eth.get_ethertype();
    let mut payload = eth.payload();
    let mut tags = 0;
    while ethertype == EtherTypes::Vlan || ethertype == EtherTypes::QinQ {
        if tags == MAX_VLAN_TAGS {
            return Frame::Ignored;
        }
        let Some(vlan) = VlanPacket::new(payload) else {
            return Frame::Malformed("short vlan tag");
        };
        ethertype = vlan.get_ethertype();
        payload = &payload[4..];
        tags += 1;
    }

    decode_network(ethertype, payload, timestamp_ns, macs)
}

fn mac_at(data: &[u8], offset: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[offset..offset + 6]);
    MacAddr(mac)
}

fn decode_raw_ip(data: &[u8], timestamp_ns: u64, macs: Option<(MacAddr, MacAddr)>) -> Frame {
    match data.first().map(|b| b >> 4) {
        Some(4) => decode_network(EtherTypes::Ipv4, data, timestamp_ns, macs),
        Some(6) => decode_network(EtherTypes::Ipv6, data, timestamp_ns, macs),
        Some(_) => Frame::Ignored,
        None => Frame::Malformed("empty frame"),
    }
}

fn decode_network(
    ethertype: EtherType,
    data: &[u8],
    timestamp_ns: u64,
    macs: Option<(MacAddr, MacAddr)>,
) -> Frame {
    let decoded = if ethertype == EtherTypes::Ipv4 {
        decode_ipv4(data)
    } else if ethertype == EtherTypes::Ipv6 {
        decode_ipv6(data)
    } else {
        return Frame::Ignored;
    };

    let (src_ip, dst_ip, protocol, segment) = match decoded {
        Ok(Some(parts)) => parts,
        Ok(None) => return Frame::Ignored,
        Err(reason) => return Frame::Malformed(reason),
    };

    let frame = decode_transport(protocol, src_ip, dst_ip, segment, timestamp_ns);
    match (frame, macs) {
        (Frame::Packet(packet), Some((src, dst))) => Frame::Packet(packet.with_macs(src, dst)),
        (frame, _) => frame,
    }
}

type NetworkParts<'a> = (IpAddr, IpAddr, IpNextHeaderProtocol, &'a [u8]);

fn decode_ipv4(data: &[u8]) -> Result<Option<NetworkParts<'_>>, &'static str> {
    let ip = Ipv4Packet::new(data).ok_or("short ipv4 header")?;
    let header_len = ip.get_header_length() as usize * 4;
    let total_len = ip.get_total_length() as usize;
    if header_len < 20 || header_len > data.len() {
        return Err("bad ipv4 header length");
    }
    if total_len < header_len {
        return Err("bad ipv4 total length");
    }

    // More-fragments flag or a non-zero offset: reassembly is not attempted
    if ip.get_flags() & 0b001 != 0 || ip.get_fragment_offset() != 0 {
        return Ok(None);
    }

    // Trim link-layer padding; tolerate snaplen truncation
    let end = total_len.min(data.len());
    Ok(Some((
        IpAddr::V4(ip.get_source()),
        IpAddr::V4(ip.get_destination()),
        ip.get_next_level_protocol(),
        &data[header_len..end],
    )))
}

fn decode_ipv6(data: &[u8]) -> Result<Option<NetworkParts<'_>>, &'static str> {
    let ip = Ipv6Packet::new(data).ok_or("short ipv6 header")?;
    let end = (40 + ip.get_payload_length() as usize).min(data.len());
    let mut next = ip.get_next_header();
    let mut offset = 40;

    // Walk the extension headers that share the generic (next, len) layout
    loop {
        if next == IpNextHeaderProtocols::Hopopt
            || next == IpNextHeaderProtocols::Ipv6Route
            || next == IpNextHeaderProtocols::Ipv6Opts
        {
            if offset + 2 > end {
                return Err("short ipv6 extension header");
            }
            let len = (data[offset + 1] as usize + 1) * 8;
            next = IpNextHeaderProtocol(data[offset]);
            offset += len;
            if offset > end {
                return Err("short ipv6 extension header");
            }
        } else if next == IpNextHeaderProtocols::Ipv6Frag {
            return Ok(None);
        } else {
            break;
        }
    }

    Ok(Some((
        IpAddr::V6(ip.get_source()),
        IpAddr::V6(ip.get_destination()),
        next,
        &data[offset..end],
    )))
}

fn decode_transport(
    protocol: IpNextHeaderProtocol,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    segment: &[u8],
    timestamp_ns: u64,
) -> Frame {
    if protocol == IpNextHeaderProtocols::Tcp {
        let Some(tcp) = TcpPacket::new(segment) else {
            return Frame::Malformed("short tcp header");
        };
        let header_len = tcp.get_data_offset() as usize * 4;
        if header_len < 20 || header_len > segment.len() {
            return Frame::Malformed("bad tcp data offset");
        }
        let header = TcpHeader {
            seq: tcp.get_sequence(),
            ack: tcp.get_acknowledgement(),
            flags: TcpFlags(segment[13]),
        };
        Frame::Packet(Packet::tcp(
            timestamp_ns,
            SocketAddr::new(src_ip, tcp.get_source()),
            SocketAddr::new(dst_ip, tcp.get_destination()),
            header,
            &segment[header_len..],
        ))
    } else if protocol == IpNextHeaderProtocols::Udp {
        let Some(udp) = UdpPacket::new(segment) else {
            return Frame::Malformed("short udp header");
        };
        let len = udp.get_length() as usize;
        if len < 8 {
            return Frame::Malformed("bad udp length");
        }
        let end = len.min(segment.len());
        Frame::Packet(Packet::udp(
            timestamp_ns,
            SocketAddr::new(src_ip, udp.get_source()),
            SocketAddr::new(dst_ip, udp.get_destination()),
            &segment[8..end],
        ))
    } else {
        Frame::Ignored
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use wiretap_core::packet::Transport;

    /// Ethernet + IPv4 + TCP frame with the given payload
    pub(crate) fn ipv4_tcp_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        // Ethernet: dst, src, type
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame.extend_from_slice(&[0x08, 0x00]);

        let total_len = (20 + 20 + payload.len()) as u16;
        // IPv4 header
        frame.extend_from_slice(&[0x45, 0x00]);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, 6, 0, 0]);
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&[10, 0, 0, 2]);
        // TCP header
        frame.extend_from_slice(&40000u16.to_be_bytes());
        frame.extend_from_slice(&80u16.to_be_bytes());
        frame.extend_from_slice(&1000u32.to_be_bytes());
        frame.extend_from_slice(&2000u32.to_be_bytes());
        frame.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_ethernet_ipv4_tcp() {
        let mut frame = ipv4_tcp_frame(TcpFlags::PSH | TcpFlags::ACK, b"GET / HTTP/1.1\r\n\r\n");
        // Ethernet minimum-size padding must not leak into the payload
        frame.extend_from_slice(&[0u8; 6]);

        let Frame::Packet(packet) = decode_frame(LinkLayer::Ethernet, &frame, 42) else {
            panic!("expected packet");
        };
        assert_eq!(packet.timestamp_ns, 42);
        assert_eq!(packet.transport, Transport::Tcp);
        assert_eq!(packet.src, "10.0.0.1:40000".parse().unwrap());
        assert_eq!(packet.dst, "10.0.0.2:80".parse().unwrap());
        assert_eq!(packet.payload, b"GET / HTTP/1.1\r\n\r\n");
        let tcp = packet.tcp.unwrap();
        assert_eq!(tcp.seq, 1000);
        assert!(tcp.flags.ack());
        assert_eq!(packet.src_mac.unwrap().to_string(), "02:00:00:00:00:01");
    }

    #[test]
    fn test_raw_ipv4_udp() {
        let payload = b"dns?";
        let mut frame = Vec::new();
        let total_len = (20 + 8 + payload.len()) as u16;
        frame.extend_from_slice(&[0x45, 0x00]);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0, 64, 17, 0, 0]);
        frame.extend_from_slice(&[192, 168, 1, 10]);
        frame.extend_from_slice(&[192, 168, 1, 1]);
        frame.extend_from_slice(&5353u16.to_be_bytes());
        frame.extend_from_slice(&53u16.to_be_bytes());
        frame.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(payload);

        let Frame::Packet(packet) = decode_frame(LinkLayer::Raw, &frame, 0) else {
            panic!("expected packet");
        };
        assert_eq!(packet.transport, Transport::Udp);
        assert_eq!(packet.dst.port(), 53);
        assert_eq!(packet.payload, payload);
        assert!(packet.src_mac.is_none());
    }

    #[test]
    fn test_malformed_and_ignored() {
        assert!(matches!(
            decode_frame(LinkLayer::Ethernet, &[0u8; 6], 0),
            Frame::Malformed(_)
        ));

        // Truncated TCP header
        let frame = ipv4_tcp_frame(0, b"");
        assert!(matches!(
            decode_frame(LinkLayer::Ethernet, &frame[..14 + 20 + 10], 0),
            Frame::Malformed(_)
        ));

        // ARP
        let mut arp = vec![0u8; 12];
        arp.extend_from_slice(&[0x08, 0x06]);
        arp.extend_from_slice(&[0u8; 28]);
        assert_eq!(decode_frame(LinkLayer::Ethernet, &arp, 0), Frame::Ignored);
    }
}

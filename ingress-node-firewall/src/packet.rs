//! Best-effort decoding of the packet bytes attached to a filtering event.
//!
//! Each layer decoder returns `None` when its layer is absent or truncated;
//! nothing here is an error. Decoding stops at the first missing layer.

use std::net::{Ipv4Addr, Ipv6Addr};

use ingress_node_firewall_common::{
    IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP,
};

const ETH_P_IPV4: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const ETH_P_8021Q: u16 = 0x8100;
const ETH_P_8021AD: u16 = 0x88A8;
const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const MAX_VLAN_TAGS: usize = 2;
const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const MAX_IPV6_EXT_HEADERS: usize = 8;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const SCTP_COMMON_HEADER: usize = 12;
const ICMPV4_HEADER_LEN: usize = 8;
const ICMPV6_HEADER_LEN: usize = 4;

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_DEST_OPTS: u8 = 60;

/// One decoded layer, rendered as an indented audit line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LayerSummary {
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr },
    Ipv6 { src: Ipv6Addr, dst: Ipv6Addr },
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Sctp { src_port: u16, dst_port: u16 },
    Icmpv4 { icmp_type: u8, icmp_code: u8 },
    Icmpv6 { icmp_type: u8, icmp_code: u8 },
}

impl std::fmt::Display for LayerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerSummary::Ipv4 { src, dst } => write!(f, "\tipv4 src addr {src} dst addr {dst}"),
            LayerSummary::Ipv6 { src, dst } => write!(f, "\tipv6 src addr {src} dst addr {dst}"),
            LayerSummary::Tcp { src_port, dst_port } => {
                write!(f, "\ttcp srcPort {src_port} dstPort {dst_port}")
            }
            LayerSummary::Udp { src_port, dst_port } => {
                write!(f, "\tudp srcPort {src_port} dstPort {dst_port}")
            }
            LayerSummary::Sctp { src_port, dst_port } => {
                write!(f, "\tsctp srcPort {src_port} dstPort {dst_port}")
            }
            LayerSummary::Icmpv4 {
                icmp_type,
                icmp_code,
            } => write!(f, "\ticmpv4 type {icmp_type} code {icmp_code}"),
            LayerSummary::Icmpv6 {
                icmp_type,
                icmp_code,
            } => write!(f, "\ticmpv6 type {icmp_type} code {icmp_code}"),
        }
    }
}

struct Ethernet<'a> {
    ether_type: u16,
    payload: &'a [u8],
}

struct Network<'a> {
    summary: LayerSummary,
    /// `None` for non-initial fragments, which carry no transport header.
    transport: Option<(u8, &'a [u8])>,
}

/// Decodes Ethernet, then IPv4 or IPv6, then one transport layer, returning a
/// summary for each network/transport layer found.
pub fn decode_layers(frame: &[u8]) -> Vec<LayerSummary> {
    let mut layers = Vec::with_capacity(2);
    let Some(eth) = parse_ethernet(frame) else {
        return layers;
    };
    let Some(network) = parse_network(&eth) else {
        return layers;
    };
    layers.push(network.summary);
    if let Some(transport) = network
        .transport
        .and_then(|(proto, payload)| parse_transport(proto, payload))
    {
        layers.push(transport);
    }
    layers
}

fn parse_ethernet(frame: &[u8]) -> Option<Ethernet<'_>> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let mut ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = ETH_HEADER_LEN;
    for _ in 0..MAX_VLAN_TAGS {
        if ether_type != ETH_P_8021Q && ether_type != ETH_P_8021AD {
            break;
        }
        let tag = frame.get(offset..offset + VLAN_TAG_LEN)?;
        ether_type = u16::from_be_bytes([tag[2], tag[3]]);
        offset += VLAN_TAG_LEN;
    }
    Some(Ethernet {
        ether_type,
        payload: &frame[offset..],
    })
}

fn parse_network<'a>(eth: &Ethernet<'a>) -> Option<Network<'a>> {
    match eth.ether_type {
        ETH_P_IPV4 => parse_ipv4(eth.payload),
        ETH_P_IPV6 => parse_ipv6(eth.payload),
        _ => None,
    }
}

fn parse_ipv4(payload: &[u8]) -> Option<Network<'_>> {
    if payload.len() < IPV4_MIN_HEADER {
        return None;
    }
    let version_ihl = payload[0];
    if version_ihl >> 4 != 4 {
        return None;
    }
    let ihl_bytes = ((version_ihl & 0x0f) as usize) * 4;
    if payload.len() < ihl_bytes || ihl_bytes < IPV4_MIN_HEADER {
        return None;
    }
    let total_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    let end = if (ihl_bytes..=payload.len()).contains(&total_len) {
        total_len
    } else {
        payload.len()
    };
    let frag_offset = u16::from_be_bytes([payload[6], payload[7]]) & 0x1fff;
    let src: [u8; 4] = payload[12..16].try_into().ok()?;
    let dst: [u8; 4] = payload[16..20].try_into().ok()?;
    Some(Network {
        summary: LayerSummary::Ipv4 {
            src: Ipv4Addr::from(src),
            dst: Ipv4Addr::from(dst),
        },
        transport: (frag_offset == 0).then(|| (payload[9], &payload[ihl_bytes..end])),
    })
}

fn parse_ipv6(payload: &[u8]) -> Option<Network<'_>> {
    if payload.len() < IPV6_HEADER_LEN || payload[0] >> 4 != 6 {
        return None;
    }
    let src: [u8; 16] = payload[8..24].try_into().ok()?;
    let dst: [u8; 16] = payload[24..40].try_into().ok()?;
    let summary = LayerSummary::Ipv6 {
        src: Ipv6Addr::from(src),
        dst: Ipv6Addr::from(dst),
    };

    let mut next_header = payload[6];
    let mut offset = IPV6_HEADER_LEN;
    let mut transport = None;
    for _ in 0..MAX_IPV6_EXT_HEADERS {
        let ext = match payload.get(offset..offset + 2) {
            Some(ext) => ext,
            None => break,
        };
        let ext_len = match next_header {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => (ext[1] as usize + 1) * 8,
            IPV6_AUTH => (ext[1] as usize + 2) * 4,
            IPV6_FRAGMENT => {
                let frag = match payload.get(offset..offset + 8) {
                    Some(frag) => frag,
                    None => break,
                };
                if u16::from_be_bytes([frag[2], frag[3]]) >> 3 != 0 {
                    return Some(Network {
                        summary,
                        transport: None,
                    });
                }
                8
            }
            proto => {
                transport = Some((proto, &payload[offset..]));
                break;
            }
        };
        next_header = ext[0];
        offset += ext_len;
    }
    if transport.is_none() && offset <= payload.len() {
        transport = Some((next_header, &payload[offset..]));
    }
    Some(Network { summary, transport })
}

fn ports(payload: &[u8], min_len: usize) -> Option<(u16, u16)> {
    if payload.len() < min_len {
        return None;
    }
    Some((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
    ))
}

fn parse_transport(proto: u8, payload: &[u8]) -> Option<LayerSummary> {
    match proto {
        IPPROTO_TCP => {
            let (src_port, dst_port) = ports(payload, TCP_MIN_HEADER)?;
            let data_offset = ((payload[12] >> 4) as usize) * 4;
            if data_offset < TCP_MIN_HEADER || data_offset > payload.len() {
                return None;
            }
            Some(LayerSummary::Tcp { src_port, dst_port })
        }
        IPPROTO_UDP => {
            let (src_port, dst_port) = ports(payload, UDP_HEADER_LEN)?;
            Some(LayerSummary::Udp { src_port, dst_port })
        }
        IPPROTO_SCTP => {
            let (src_port, dst_port) = ports(payload, SCTP_COMMON_HEADER)?;
            Some(LayerSummary::Sctp { src_port, dst_port })
        }
        IPPROTO_ICMP if payload.len() >= ICMPV4_HEADER_LEN => Some(LayerSummary::Icmpv4 {
            icmp_type: payload[0],
            icmp_code: payload[1],
        }),
        IPPROTO_ICMPV6 if payload.len() >= ICMPV6_HEADER_LEN => Some(LayerSummary::Icmpv6 {
            icmp_type: payload[0],
            icmp_code: payload[1],
        }),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ethernet(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2];
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    pub(crate) fn ipv4(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = (IPV4_MIN_HEADER + payload.len()) as u16;
        let mut hdr = vec![0x45, 0];
        hdr.extend_from_slice(&total.to_be_bytes());
        hdr.extend_from_slice(&[0, 1, 0x40, 0, 64, proto, 0, 0]);
        hdr.extend_from_slice(&src);
        hdr.extend_from_slice(&dst);
        hdr.extend_from_slice(payload);
        hdr
    }

    pub(crate) fn tcp(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut seg = Vec::with_capacity(TCP_MIN_HEADER);
        seg.extend_from_slice(&src_port.to_be_bytes());
        seg.extend_from_slice(&dst_port.to_be_bytes());
        seg.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
        seg
    }

    fn ipv6(next_header: u8, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
        let mut hdr = vec![0x60, 0, 0, 0];
        hdr.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        hdr.push(next_header);
        hdr.push(64);
        hdr.extend_from_slice(&src.octets());
        hdr.extend_from_slice(&dst.octets());
        hdr.extend_from_slice(payload);
        hdr
    }

    #[test]
    fn ipv4_tcp_frame_yields_two_layers() {
        let frame = ethernet(
            ETH_P_IPV4,
            &ipv4(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], &tcp(40000, 443)),
        );
        let layers = decode_layers(&frame);
        assert_eq!(
            layers,
            vec![
                LayerSummary::Ipv4 {
                    src: Ipv4Addr::new(10, 0, 0, 1),
                    dst: Ipv4Addr::new(10, 0, 0, 2),
                },
                LayerSummary::Tcp {
                    src_port: 40000,
                    dst_port: 443,
                },
            ]
        );
        assert_eq!(layers[0].to_string(), "\tipv4 src addr 10.0.0.1 dst addr 10.0.0.2");
        assert_eq!(layers[1].to_string(), "\ttcp srcPort 40000 dstPort 443");
    }

    #[test]
    fn vlan_tagged_udp_is_decoded() {
        let inner = ipv4(IPPROTO_UDP, [192, 168, 1, 1], [192, 168, 1, 2], &[0, 53, 0x30, 0x39, 0, 8, 0, 0]);
        let mut tagged = vec![0x00, 0x64];
        tagged.extend_from_slice(&ETH_P_IPV4.to_be_bytes());
        tagged.extend_from_slice(&inner);
        let layers = decode_layers(&ethernet(ETH_P_8021Q, &tagged));
        assert_eq!(
            layers[1],
            LayerSummary::Udp {
                src_port: 53,
                dst_port: 12345,
            }
        );
    }

    #[test]
    fn ipv6_icmp_through_hop_by_hop() {
        let src: Ipv6Addr = "fd00::1".parse().unwrap();
        let dst: Ipv6Addr = "fd00::2".parse().unwrap();
        let mut payload = vec![IPPROTO_ICMPV6, 0, 1, 4, 0, 0, 0, 0];
        payload.extend_from_slice(&[128, 0, 0, 0, 0, 1, 0, 1]);
        let layers = decode_layers(&ethernet(ETH_P_IPV6, &ipv6(IPV6_HOP_BY_HOP, src, dst, &payload)));
        assert_eq!(layers[0], LayerSummary::Ipv6 { src, dst });
        assert_eq!(
            layers[1],
            LayerSummary::Icmpv6 {
                icmp_type: 128,
                icmp_code: 0,
            }
        );
        assert_eq!(layers[1].to_string(), "\ticmpv6 type 128 code 0");
    }

    #[test]
    fn sctp_and_icmpv4_are_summarised() {
        let mut sctp = vec![0x0b, 0xb8, 0x23, 0x28];
        sctp.extend_from_slice(&[0; 8]);
        let layers = decode_layers(&ethernet(
            ETH_P_IPV4,
            &ipv4(IPPROTO_SCTP, [1, 1, 1, 1], [2, 2, 2, 2], &sctp),
        ));
        assert_eq!(layers[1].to_string(), "\tsctp srcPort 3000 dstPort 9000");

        let icmp = [8, 0, 0, 0, 0, 1, 0, 1];
        let layers = decode_layers(&ethernet(
            ETH_P_IPV4,
            &ipv4(IPPROTO_ICMP, [1, 1, 1, 1], [2, 2, 2, 2], &icmp),
        ));
        assert_eq!(layers[1].to_string(), "\ticmpv4 type 8 code 0");
    }

    #[test]
    fn truncated_transport_keeps_network_layer() {
        let frame = ethernet(
            ETH_P_IPV4,
            &ipv4(IPPROTO_TCP, [10, 0, 0, 1], [10, 0, 0, 2], &[0, 80]),
        );
        let layers = decode_layers(&frame);
        assert_eq!(layers.len(), 1);
        assert!(matches!(layers[0], LayerSummary::Ipv4 { .. }));
    }

    #[test]
    fn non_initial_fragment_has_no_transport() {
        let mut packet = ipv4(IPPROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], &[0, 53, 0, 53, 0, 8, 0, 0]);
        packet[6] = 0x00;
        packet[7] = 0x10;
        let layers = decode_layers(&ethernet(ETH_P_IPV4, &packet));
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn unknown_ethertype_and_short_frames_yield_nothing() {
        assert!(decode_layers(&ethernet(0x0806, &[0; 28])).is_empty());
        assert!(decode_layers(&[0u8; 10]).is_empty());
        assert!(decode_layers(&ethernet(ETH_P_IPV4, &[0x45, 0, 0])).is_empty());
    }

    #[test]
    fn unsupported_transport_is_skipped() {
        let frame = ethernet(
            ETH_P_IPV4,
            &ipv4(47, [10, 0, 0, 1], [10, 0, 0, 2], &[0; 8]),
        );
        assert_eq!(decode_layers(&frame).len(), 1);
    }
}

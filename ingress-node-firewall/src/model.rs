use std::{fs, net::IpAddr, path::Path};

use anyhow::{Context, Result};
use ingress_node_firewall_common::{
    IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP, XDP_ALLOW, XDP_DENY,
};
use ipnet::IpNet;
use serde::Deserialize;

/// One policy document as delivered by the controller: the source ranges and
/// the rules they share. Protocol and action stay textual until compiled.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FirewallRules {
    #[serde(rename = "sourceCIDRs")]
    pub source_cidrs: Vec<String>,
    pub rules: Vec<RuleSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleSpec {
    pub order: u32,
    pub protocol: String,
    pub action: String,
    pub ports: Option<String>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    Many(Vec<FirewallRules>),
    One(FirewallRules),
}

/// Reads a JSON policy file holding either one document or a list of them.
pub fn load_policies(path: &Path) -> Result<Vec<FirewallRules>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    parse_policies(&raw).with_context(|| format!("invalid policy file {}", path.display()))
}

pub fn parse_policies(raw: &str) -> Result<Vec<FirewallRules>> {
    let parsed: PolicyFile = serde_json::from_str(raw)?;
    Ok(match parsed {
        PolicyFile::Many(docs) => docs,
        PolicyFile::One(doc) => vec![doc],
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn as_xdp(self) -> u8 {
        match self {
            Action::Allow => XDP_ALLOW,
            Action::Deny => XDP_DENY,
        }
    }
}

/// Audit rendering of the action byte reported by the kernel program.
pub fn action_name(action: u8) -> String {
    match action {
        XDP_ALLOW => "Allow".to_string(),
        XDP_DENY => "Drop".to_string(),
        other => format!("Invalid action {other}"),
    }
}

/// Policy tag of an IP protocol number, as accepted by the compiler.
pub fn protocol_name(proto: u8) -> Option<&'static str> {
    match proto {
        IPPROTO_TCP => Some("TCP"),
        IPPROTO_UDP => Some("UDP"),
        IPPROTO_SCTP => Some("SCTP"),
        IPPROTO_ICMP => Some("ICMP"),
        IPPROTO_ICMPV6 => Some("ICMPv6"),
        _ => None,
    }
}

/// Destination port match. `end == 0` means a single port.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct IcmpMatch {
    pub icmp_type: u8,
    pub icmp_code: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ProtocolMatch {
    Tcp(PortRange),
    Udp(PortRange),
    Sctp(PortRange),
    Icmp(IcmpMatch),
    Icmpv6(IcmpMatch),
}

impl ProtocolMatch {
    pub fn ip_proto(&self) -> u8 {
        match self {
            ProtocolMatch::Tcp(_) => IPPROTO_TCP,
            ProtocolMatch::Udp(_) => IPPROTO_UDP,
            ProtocolMatch::Sctp(_) => IPPROTO_SCTP,
            ProtocolMatch::Icmp(_) => IPPROTO_ICMP,
            ProtocolMatch::Icmpv6(_) => IPPROTO_ICMPV6,
        }
    }
}

/// A validated rule: `id` is the match priority reported back in events.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ProtocolRule {
    pub id: u32,
    pub action: Action,
    pub matcher: ProtocolMatch,
}

/// A parsed source range. Host bits are kept as written; the compiler decides
/// how they are laid out in the key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SourceRange {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl SourceRange {
    pub fn parse(cidr: &str) -> Option<Self> {
        let net: IpNet = cidr.trim().parse().ok()?;
        Some(Self {
            addr: net.addr(),
            prefix_len: net.prefix_len(),
        })
    }

    pub fn network(&self) -> IpAddr {
        match IpNet::new(self.addr, self.prefix_len) {
            Ok(net) => net.network(),
            Err(_) => self.addr,
        }
    }
}

impl std::fmt::Display for SourceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_document() {
        let raw = r#"{
            "sourceCIDRs": ["10.0.0.0/8"],
            "rules": [{"order": 1, "protocol": "TCP", "action": "Allow", "ports": "80-443"}]
        }"#;
        let docs = parse_policies(raw).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_cidrs, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(docs[0].rules[0].ports.as_deref(), Some("80-443"));
        assert_eq!(docs[0].rules[0].order, 1);
    }

    #[test]
    fn parses_document_list_with_icmp_fields() {
        let raw = r#"[
            {"sourceCIDRs": ["fd00::/64"], "rules": [
                {"order": 3, "protocol": "ICMPv6", "action": "Deny", "icmpType": 128, "icmpCode": 0}
            ]},
            {"sourceCIDRs": [], "rules": []}
        ]"#;
        let docs = parse_policies(raw).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].rules[0].icmp_type, Some(128));
        assert_eq!(docs[0].rules[0].icmp_code, Some(0));
        assert!(docs[1].rules.is_empty());
    }

    #[test]
    fn action_names_match_audit_format() {
        assert_eq!(action_name(XDP_ALLOW), "Allow");
        assert_eq!(action_name(XDP_DENY), "Drop");
        assert_eq!(action_name(7), "Invalid action 7");
    }

    #[test]
    fn protocol_names_round_trip_through_match() {
        let tcp = ProtocolMatch::Tcp(PortRange { start: 80, end: 0 });
        assert_eq!(protocol_name(tcp.ip_proto()), Some("TCP"));
        assert_eq!(protocol_name(IPPROTO_ICMPV6), Some("ICMPv6"));
        assert_eq!(protocol_name(47), None);
    }

    #[test]
    fn source_range_keeps_family_and_prefix() {
        let v4 = SourceRange::parse("10.1.2.3/8").unwrap();
        assert_eq!(v4.prefix_len, 8);
        assert_eq!(v4.network(), "10.0.0.0".parse::<IpAddr>().unwrap());

        let v6 = SourceRange::parse(" 2001:db8::1/32 ").unwrap();
        assert!(v6.addr.is_ipv6());
        assert_eq!(v6.prefix_len, 32);
    }

    #[test]
    fn source_range_rejects_bare_address() {
        assert!(SourceRange::parse("10.0.0.1").is_none());
        assert!(SourceRange::parse("10.0.0.0/33").is_none());
    }
}

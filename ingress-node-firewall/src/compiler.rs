//! Turns a policy document into LPM keys and the shared rule list the XDP
//! program expects, then applies them to a [`RuleTable`].

use std::{collections::HashSet, net::IpAddr};

use ingress_node_firewall_common::{IP_DATA_LEN, LpmKey, MAX_RULES_PER_TARGET, RuleEntry, RulesValue};
use log::info;

use crate::{
    error::{Error, Result},
    model::{
        Action, FirewallRules, IcmpMatch, PortRange, ProtocolMatch, ProtocolRule, RuleSpec,
        SourceRange,
    },
    store::RuleTable,
};

/// Parses destination ports: `"N"` is a single port (`end == 0`), `"N-M"` a
/// range. Both bounds must fit in 16 bits.
pub fn parse_dst_ports(ports: &str) -> Result<PortRange> {
    match ports.split_once('-') {
        None => Ok(PortRange {
            start: parse_port(ports)
                .ok_or_else(|| Error::config(format!("invalid port number {ports:?}")))?,
            end: 0,
        }),
        Some((start, end)) => {
            let start = parse_port(start).ok_or_else(|| {
                Error::config(format!("invalid start port {start:?} in range {ports:?}"))
            })?;
            let end = parse_port(end).ok_or_else(|| {
                Error::config(format!("invalid end port {end:?} in range {ports:?}"))
            })?;
            Ok(PortRange { start, end })
        }
    }
}

fn parse_port(text: &str) -> Option<u16> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn parse_action(action: &str) -> Result<Action> {
    match action {
        "Allow" => Ok(Action::Allow),
        "Deny" => Ok(Action::Deny),
        other => Err(Error::config(format!("invalid action {other:?}"))),
    }
}

fn port_match(spec: &RuleSpec) -> Result<PortRange> {
    let ports = spec.ports.as_deref().ok_or_else(|| {
        Error::config(format!(
            "rule {} ({}) requires ports",
            spec.order, spec.protocol
        ))
    })?;
    parse_dst_ports(ports).map_err(|err| {
        Error::config(format!(
            "invalid ports {ports:?} for protocol {}: {err}",
            spec.protocol
        ))
    })
}

fn icmp_match(spec: &RuleSpec) -> Result<IcmpMatch> {
    let icmp_type = spec.icmp_type.ok_or_else(|| {
        Error::config(format!(
            "rule {} ({}) requires icmpType",
            spec.order, spec.protocol
        ))
    })?;
    Ok(IcmpMatch {
        icmp_type,
        icmp_code: spec.icmp_code.unwrap_or(0),
    })
}

/// Validates one textual rule into its typed form.
pub fn compile_rule(spec: &RuleSpec) -> Result<ProtocolRule> {
    let matcher = match spec.protocol.as_str() {
        "TCP" => ProtocolMatch::Tcp(port_match(spec)?),
        "UDP" => ProtocolMatch::Udp(port_match(spec)?),
        "SCTP" => ProtocolMatch::Sctp(port_match(spec)?),
        "ICMP" => ProtocolMatch::Icmp(icmp_match(spec)?),
        "ICMPv6" => ProtocolMatch::Icmpv6(icmp_match(spec)?),
        other => return Err(Error::config(format!("invalid protocol {other:?}"))),
    };
    Ok(ProtocolRule {
        id: spec.order,
        action: parse_action(&spec.action)?,
        matcher,
    })
}

pub fn encode_rule(rule: &ProtocolRule) -> RuleEntry {
    let mut entry = RuleEntry {
        rule_id: rule.id,
        protocol: rule.matcher.ip_proto(),
        action: rule.action.as_xdp(),
        ..RuleEntry::default()
    };
    match rule.matcher {
        ProtocolMatch::Tcp(ports) | ProtocolMatch::Udp(ports) | ProtocolMatch::Sctp(ports) => {
            entry.dst_port_start = ports.start;
            entry.dst_port_end = ports.end;
        }
        ProtocolMatch::Icmp(icmp) | ProtocolMatch::Icmpv6(icmp) => {
            entry.icmp_type = icmp.icmp_type;
            entry.icmp_code = icmp.icmp_code;
        }
    }
    entry
}

/// Packs the rules into the fixed-capacity map value. Lists longer than the
/// kernel array are rejected rather than truncated.
pub fn encode_rules(rules: &[ProtocolRule]) -> Result<RulesValue> {
    if rules.len() > MAX_RULES_PER_TARGET {
        return Err(Error::config(format!(
            "{} rules exceed the limit of {MAX_RULES_PER_TARGET} per source range",
            rules.len()
        )));
    }
    let mut value = RulesValue {
        num_rules: rules.len() as u32,
        ..RulesValue::default()
    };
    for (slot, rule) in value.rules.iter_mut().zip(rules) {
        *slot = encode_rule(rule);
    }
    Ok(value)
}

/// Builds the LPM key for a source range. Host bits are cleared; IPv4
/// addresses occupy the first four bytes.
pub fn lpm_key(range: &SourceRange) -> LpmKey {
    let mut ip_data = [0u8; IP_DATA_LEN];
    match range.network() {
        IpAddr::V4(addr) => ip_data[..4].copy_from_slice(&addr.octets()),
        IpAddr::V6(addr) => ip_data.copy_from_slice(&addr.octets()),
    }
    LpmKey::new(range.prefix_len as u32, ip_data)
}

/// A fully validated policy: every key receives the same value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledPolicy {
    pub keys: Vec<(SourceRange, LpmKey)>,
    pub value: RulesValue,
}

/// Validates a whole document. Nothing is returned unless every rule and every
/// source range is valid.
pub fn compile(policy: &FirewallRules) -> Result<CompiledPolicy> {
    let rules = policy
        .rules
        .iter()
        .map(compile_rule)
        .collect::<Result<Vec<_>>>()?;
    let value = encode_rules(&rules)?;

    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(policy.source_cidrs.len());
    for cidr in &policy.source_cidrs {
        let range = SourceRange::parse(cidr)
            .ok_or_else(|| Error::config(format!("failed to parse source CIDR {cidr:?}")))?;
        let key = lpm_key(&range);
        if seen.insert(key) {
            keys.push((range, key));
        }
    }
    Ok(CompiledPolicy { keys, value })
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApplyReport {
    pub upserted: usize,
    pub deleted: usize,
    pub missing: usize,
}

/// Compiles `policy` and writes it to `table`: upserts every source range, or
/// deletes them when `is_delete` is set.
pub fn apply<T: RuleTable + ?Sized>(
    table: &mut T,
    policy: &FirewallRules,
    is_delete: bool,
) -> Result<ApplyReport> {
    let compiled = compile(policy)?;
    let mut report = ApplyReport::default();
    for (range, key) in &compiled.keys {
        if is_delete {
            info!("Deleting ingress firewall rules for {range}");
            if table.delete(key)? {
                report.deleted += 1;
            } else {
                report.missing += 1;
            }
        } else {
            info!(
                "Creating ingress firewall rules for {range} ({} rules)",
                compiled.value.num_rules
            );
            table.upsert(key, &compiled.value)?;
            report.upserted += 1;
        }
    }
    Ok(report)
}

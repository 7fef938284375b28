#![cfg_attr(not(test), no_std)]

// Layouts shared with the pre-compiled XDP filtering program.
// Keep this crate `no_std` friendly so it can be used from eBPF code.
//
// The kernel side reads these structures straight out of map memory, so every
// offset below is part of a fixed ABI. The `#[repr(C)]` structs document the
// C layout and are checked against the explicit offsets at compile time; the
// encode/decode routines never rely on the in-memory layout of the Rust types.

use core::mem::offset_of;

/// Rules carried by a single LPM entry.
pub const MAX_RULES_PER_TARGET: usize = 100;
/// Width of the address part of an LPM key (IPv4 uses the first four bytes).
pub const IP_DATA_LEN: usize = 16;

pub const LPM_KEY_SIZE: usize = 20;
pub const RULE_ENTRY_SIZE: usize = 16;
pub const RULES_VALUE_SIZE: usize = 4 + MAX_RULES_PER_TARGET * RULE_ENTRY_SIZE;
pub const EVENT_HDR_SIZE: usize = 8;

/// XDP_DROP
pub const XDP_DENY: u8 = 1;
/// XDP_PASS
pub const XDP_ALLOW: u8 = 2;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_SCTP: u8 = 132;

/// `struct lpm_ip_key_st`
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct LpmKey {
    pub prefix_len: u32,
    pub ip_data: [u8; IP_DATA_LEN],
}

const KEY_PREFIX_LEN: usize = 0;
const KEY_IP_DATA: usize = 4;

const _: () = {
    assert!(core::mem::size_of::<LpmKey>() == LPM_KEY_SIZE);
    assert!(offset_of!(LpmKey, prefix_len) == KEY_PREFIX_LEN);
    assert!(offset_of!(LpmKey, ip_data) == KEY_IP_DATA);
};

impl LpmKey {
    pub fn new(prefix_len: u32, ip_data: [u8; IP_DATA_LEN]) -> Self {
        Self {
            prefix_len,
            ip_data,
        }
    }

    pub fn to_bytes(&self) -> [u8; LPM_KEY_SIZE] {
        let mut out = [0u8; LPM_KEY_SIZE];
        let prefix_len = self.prefix_len;
        out[KEY_PREFIX_LEN..KEY_IP_DATA].copy_from_slice(&prefix_len.to_le_bytes());
        out[KEY_IP_DATA..].copy_from_slice(&self.ip_data);
        out
    }

    pub fn from_bytes(buf: &[u8; LPM_KEY_SIZE]) -> Self {
        let mut prefix_len = [0u8; 4];
        prefix_len.copy_from_slice(&buf[KEY_PREFIX_LEN..KEY_IP_DATA]);
        let mut ip_data = [0u8; IP_DATA_LEN];
        ip_data.copy_from_slice(&buf[KEY_IP_DATA..]);
        Self {
            prefix_len: u32::from_le_bytes(prefix_len),
            ip_data,
        }
    }
}

/// `struct ruleType_st`
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct RuleEntry {
    pub rule_id: u32,
    pub protocol: u8,
    pub pad0: u8,
    pub dst_port_start: u16,
    pub dst_port_end: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub action: u8,
    pub pad1: [u8; 3],
}

const RULE_ID: usize = 0;
const RULE_PROTOCOL: usize = 4;
const RULE_DST_PORT_START: usize = 6;
const RULE_DST_PORT_END: usize = 8;
const RULE_ICMP_TYPE: usize = 10;
const RULE_ICMP_CODE: usize = 11;
const RULE_ACTION: usize = 12;

const _: () = {
    assert!(core::mem::size_of::<RuleEntry>() == RULE_ENTRY_SIZE);
    assert!(offset_of!(RuleEntry, rule_id) == RULE_ID);
    assert!(offset_of!(RuleEntry, protocol) == RULE_PROTOCOL);
    assert!(offset_of!(RuleEntry, dst_port_start) == RULE_DST_PORT_START);
    assert!(offset_of!(RuleEntry, dst_port_end) == RULE_DST_PORT_END);
    assert!(offset_of!(RuleEntry, icmp_type) == RULE_ICMP_TYPE);
    assert!(offset_of!(RuleEntry, icmp_code) == RULE_ICMP_CODE);
    assert!(offset_of!(RuleEntry, action) == RULE_ACTION);
};

impl RuleEntry {
    pub fn encode_into(&self, out: &mut [u8; RULE_ENTRY_SIZE]) {
        *out = [0u8; RULE_ENTRY_SIZE];
        out[RULE_ID..RULE_ID + 4].copy_from_slice(&self.rule_id.to_le_bytes());
        out[RULE_PROTOCOL] = self.protocol;
        out[RULE_DST_PORT_START..RULE_DST_PORT_START + 2]
            .copy_from_slice(&self.dst_port_start.to_le_bytes());
        out[RULE_DST_PORT_END..RULE_DST_PORT_END + 2]
            .copy_from_slice(&self.dst_port_end.to_le_bytes());
        out[RULE_ICMP_TYPE] = self.icmp_type;
        out[RULE_ICMP_CODE] = self.icmp_code;
        out[RULE_ACTION] = self.action;
    }

    pub fn decode(buf: &[u8; RULE_ENTRY_SIZE]) -> Self {
        Self {
            rule_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            protocol: buf[RULE_PROTOCOL],
            pad0: 0,
            dst_port_start: u16::from_le_bytes([
                buf[RULE_DST_PORT_START],
                buf[RULE_DST_PORT_START + 1],
            ]),
            dst_port_end: u16::from_le_bytes([buf[RULE_DST_PORT_END], buf[RULE_DST_PORT_END + 1]]),
            icmp_type: buf[RULE_ICMP_TYPE],
            icmp_code: buf[RULE_ICMP_CODE],
            action: buf[RULE_ACTION],
            pad1: [0; 3],
        }
    }
}

/// `struct rulesVal_st`
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RulesValue {
    pub num_rules: u32,
    pub rules: [RuleEntry; MAX_RULES_PER_TARGET],
}

const VALUE_NUM_RULES: usize = 0;
const VALUE_RULES: usize = 4;

const _: () = {
    assert!(core::mem::size_of::<RulesValue>() == RULES_VALUE_SIZE);
    assert!(offset_of!(RulesValue, num_rules) == VALUE_NUM_RULES);
    assert!(offset_of!(RulesValue, rules) == VALUE_RULES);
};

impl Default for RulesValue {
    fn default() -> Self {
        Self {
            num_rules: 0,
            rules: [RuleEntry::default(); MAX_RULES_PER_TARGET],
        }
    }
}

impl RulesValue {
    /// Populated prefix of the rule array. A corrupt count is clamped to the
    /// array capacity.
    pub fn active(&self) -> &[RuleEntry] {
        let count = (self.num_rules as usize).min(MAX_RULES_PER_TARGET);
        &self.rules[..count]
    }

    pub fn encode(&self) -> EncodedRules {
        let mut out = [0u8; RULES_VALUE_SIZE];
        out[VALUE_NUM_RULES..VALUE_RULES].copy_from_slice(&self.num_rules.to_le_bytes());
        for (idx, rule) in self.rules.iter().enumerate() {
            let start = VALUE_RULES + idx * RULE_ENTRY_SIZE;
            let mut entry = [0u8; RULE_ENTRY_SIZE];
            rule.encode_into(&mut entry);
            out[start..start + RULE_ENTRY_SIZE].copy_from_slice(&entry);
        }
        EncodedRules(out)
    }

    pub fn decode(encoded: &EncodedRules) -> Self {
        let buf = &encoded.0;
        let mut value = Self {
            num_rules: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            ..Self::default()
        };
        for (idx, rule) in value.rules.iter_mut().enumerate() {
            let start = VALUE_RULES + idx * RULE_ENTRY_SIZE;
            let mut entry = [0u8; RULE_ENTRY_SIZE];
            entry.copy_from_slice(&buf[start..start + RULE_ENTRY_SIZE]);
            *rule = RuleEntry::decode(&entry);
        }
        value
    }
}

/// Map value exactly as the kernel stores it.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EncodedRules(pub [u8; RULES_VALUE_SIZE]);

/// `struct event_hdr_st`
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EventHeader {
    pub if_index: u16,
    pub rule_id: u16,
    pub action: u8,
    pub pad: u8,
    pub pkt_length: u16,
}

const HDR_IF_INDEX: usize = 0;
const HDR_RULE_ID: usize = 2;
const HDR_ACTION: usize = 4;
const HDR_PKT_LENGTH: usize = 6;

const _: () = {
    assert!(core::mem::size_of::<EventHeader>() == EVENT_HDR_SIZE);
    assert!(offset_of!(EventHeader, if_index) == HDR_IF_INDEX);
    assert!(offset_of!(EventHeader, rule_id) == HDR_RULE_ID);
    assert!(offset_of!(EventHeader, action) == HDR_ACTION);
    assert!(offset_of!(EventHeader, pkt_length) == HDR_PKT_LENGTH);
};

impl EventHeader {
    /// Decodes the header at the start of `buf`, or `None` when fewer than
    /// `EVENT_HDR_SIZE` bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < EVENT_HDR_SIZE {
            return None;
        }
        Some(Self {
            if_index: u16::from_le_bytes([buf[HDR_IF_INDEX], buf[HDR_IF_INDEX + 1]]),
            rule_id: u16::from_le_bytes([buf[HDR_RULE_ID], buf[HDR_RULE_ID + 1]]),
            action: buf[HDR_ACTION],
            pad: 0,
            pkt_length: u16::from_le_bytes([buf[HDR_PKT_LENGTH], buf[HDR_PKT_LENGTH + 1]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; EVENT_HDR_SIZE] {
        let mut out = [0u8; EVENT_HDR_SIZE];
        out[HDR_IF_INDEX..HDR_IF_INDEX + 2].copy_from_slice(&self.if_index.to_le_bytes());
        out[HDR_RULE_ID..HDR_RULE_ID + 2].copy_from_slice(&self.rule_id.to_le_bytes());
        out[HDR_ACTION] = self.action;
        out[HDR_PKT_LENGTH..HDR_PKT_LENGTH + 2].copy_from_slice(&self.pkt_length.to_le_bytes());
        out
    }
}

// Userspace only: the encoded map value goes through aya's typed LPM trie.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::EncodedRules;
    use aya::Pod;

    unsafe impl Pod for EncodedRules {}
}

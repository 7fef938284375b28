use std::{
    collections::BTreeMap,
    convert::TryFrom,
    fmt::Write as _,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::Path,
};

use aya::maps::{
    Map, MapData, MapError, MapType,
    lpm_trie::{Key, LpmTrie},
};
use ingress_node_firewall_common::{EncodedRules, IP_DATA_LEN, LpmKey, RulesValue};
use log::debug;

use crate::error::{Error, Result};

/// Metadata of the rule table, for diagnostics only.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

impl std::fmt::Display for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "name: {} id: {} key_size: {} value_size: {} max_entries: {} flags: {:#x}",
            self.name, self.id, self.key_size, self.value_size, self.max_entries, self.map_flags
        )
    }
}

/// Printable forms of a table key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyText {
    /// Best-guess CIDR. Keys carry no address family, so a prefix of at most
    /// 32 bits over an all-zero tail is shown as IPv4.
    pub cidr: String,
    /// The 16 address bytes in hex, exactly as stored.
    pub ip_data: String,
    pub prefix_len: u32,
}

pub fn describe_key(key: &LpmKey) -> KeyText {
    let LpmKey {
        prefix_len,
        ip_data,
    } = *key;
    let addr = if prefix_len <= 32 && ip_data[4..].iter().all(|b| *b == 0) {
        IpAddr::V4(Ipv4Addr::new(ip_data[0], ip_data[1], ip_data[2], ip_data[3]))
    } else {
        IpAddr::V6(Ipv6Addr::from(ip_data))
    };
    let mut hex = String::with_capacity(IP_DATA_LEN * 2);
    for b in ip_data {
        let _ = write!(hex, "{b:02x}");
    }
    KeyText {
        cidr: format!("{addr}/{prefix_len}"),
        ip_data: hex,
        prefix_len,
    }
}

/// Operations against the longest-prefix-match table consumed by the kernel
/// program. Not internally synchronised: callers serialise access.
pub trait RuleTable {
    /// Inserts or replaces the rule list for `key`.
    fn upsert(&mut self, key: &LpmKey, value: &RulesValue) -> Result<()>;

    /// Removes the entry stored under exactly `key`. A missing key is not an
    /// error; the return value tells whether anything was removed.
    fn delete(&mut self, key: &LpmKey) -> Result<bool>;

    /// Longest-prefix lookup, bounded by the prefix length of `key`.
    fn lookup(&self, key: &LpmKey) -> Result<Option<RulesValue>>;

    fn entries(&self) -> Result<Vec<(LpmKey, RulesValue)>>;

    fn info(&self) -> Result<TableInfo>;
}

/// Zeroes every address bit beyond `prefix_len`, which is how the LPM trie
/// compares keys.
pub fn masked(key: &LpmKey) -> LpmKey {
    let LpmKey {
        prefix_len,
        mut ip_data,
    } = *key;
    let prefix_len = prefix_len.min((IP_DATA_LEN * 8) as u32) as usize;
    for (idx, byte) in ip_data.iter_mut().enumerate() {
        let bit_start = idx * 8;
        if bit_start >= prefix_len {
            *byte = 0;
        } else if bit_start + 8 > prefix_len {
            let keep = prefix_len - bit_start;
            *byte &= 0xffu8 << (8 - keep);
        }
    }
    LpmKey::new(prefix_len as u32, ip_data)
}

fn table_key(key: &LpmKey) -> (u32, [u8; IP_DATA_LEN]) {
    let LpmKey {
        prefix_len,
        ip_data,
    } = masked(key);
    (prefix_len, ip_data)
}

/// In-process table with the same key semantics as the kernel LPM trie.
#[derive(Debug, Default)]
pub struct MemoryRuleTable {
    entries: BTreeMap<(u32, [u8; IP_DATA_LEN]), EncodedRules>,
    max_entries: u32,
}

impl MemoryRuleTable {
    pub fn with_max_entries(max_entries: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RuleTable for MemoryRuleTable {
    fn upsert(&mut self, key: &LpmKey, value: &RulesValue) -> Result<()> {
        let slot = table_key(key);
        if self.max_entries > 0
            && !self.entries.contains_key(&slot)
            && self.entries.len() >= self.max_entries as usize
        {
            return Err(Error::kernel(
                "failed to update rule table",
                io::Error::from_raw_os_error(libc::ENOSPC),
            ));
        }
        self.entries.insert(slot, value.encode());
        Ok(())
    }

    fn delete(&mut self, key: &LpmKey) -> Result<bool> {
        let removed = self.entries.remove(&table_key(key)).is_some();
        if !removed {
            debug!("no rule table entry for {:?}", masked(key));
        }
        Ok(removed)
    }

    fn lookup(&self, key: &LpmKey) -> Result<Option<RulesValue>> {
        let wanted = masked(key);
        let (wanted_len, wanted_data) = (wanted.prefix_len, wanted.ip_data);
        let best = self
            .entries
            .iter()
            .filter(|((prefix_len, ip_data), _)| {
                *prefix_len <= wanted_len
                    && masked(&LpmKey::new(*prefix_len, wanted_data)).ip_data == *ip_data
            })
            .max_by_key(|((prefix_len, _), _)| *prefix_len);
        Ok(best.map(|(_, value)| RulesValue::decode(value)))
    }

    fn entries(&self) -> Result<Vec<(LpmKey, RulesValue)>> {
        Ok(self
            .entries
            .iter()
            .map(|((prefix_len, ip_data), value)| {
                (LpmKey::new(*prefix_len, *ip_data), RulesValue::decode(value))
            })
            .collect())
    }

    fn info(&self) -> Result<TableInfo> {
        Ok(TableInfo {
            name: "memory".to_string(),
            id: 0,
            key_size: ingress_node_firewall_common::LPM_KEY_SIZE as u32,
            value_size: ingress_node_firewall_common::RULES_VALUE_SIZE as u32,
            max_entries: self.max_entries,
            map_flags: 0,
        })
    }
}

/// The kernel-resident LPM trie shared with the XDP program.
pub struct LpmRuleTable {
    trie: LpmTrie<MapData, [u8; IP_DATA_LEN], EncodedRules>,
    info: TableInfo,
}

impl LpmRuleTable {
    /// Opens a table previously pinned under `pin_path`.
    pub fn open_pinned<P: AsRef<Path>>(pin_path: P) -> Result<Self> {
        let pin = pin_path.as_ref();
        let data = MapData::from_pin(pin).map_err(|e| {
            Error::kernel(format!("failed to open pinned map {}", pin.display()), e)
        })?;
        Self::from_map_data(data)
    }

    pub fn from_map(map: Map) -> Result<Self> {
        match map {
            Map::LpmTrie(data) => Self::from_map_data(data),
            _ => Err(Error::kernel(
                "rule table has unexpected type",
                io::Error::from(io::ErrorKind::InvalidData),
            )),
        }
    }

    fn from_map_data(data: MapData) -> Result<Self> {
        let info = data
            .info()
            .map_err(|e| Error::kernel("cannot get map info", e))?;
        let map_type = info
            .map_type()
            .map_err(|e| Error::kernel("invalid map type", e))?;
        let info = TableInfo {
            name: info.name_as_str().unwrap_or_default().to_string(),
            id: info.id(),
            key_size: info.key_size(),
            value_size: info.value_size(),
            max_entries: info.max_entries(),
            map_flags: info.map_flags(),
        };
        let map = match map_type {
            MapType::LpmTrie => Map::LpmTrie(data),
            _ => {
                return Err(Error::kernel(
                    "failed to convert to LpmTrie",
                    MapError::InvalidMapType {
                        map_type: map_type as u32,
                    },
                ));
            }
        };
        let trie = LpmTrie::try_from(map)
            .map_err(|e| Error::kernel("failed to convert to LpmTrie", e))?;
        Ok(Self { trie, info })
    }
}

fn trie_key(key: &LpmKey) -> Key<[u8; IP_DATA_LEN]> {
    let LpmKey {
        prefix_len,
        ip_data,
    } = *key;
    Key::new(prefix_len, ip_data)
}

impl RuleTable for LpmRuleTable {
    fn upsert(&mut self, key: &LpmKey, value: &RulesValue) -> Result<()> {
        self.trie
            .insert(&trie_key(key), value.encode(), 0)
            .map_err(|e| Error::kernel("failed adding/updating ingress firewall rules", e))
    }

    fn delete(&mut self, key: &LpmKey) -> Result<bool> {
        match self.trie.remove(&trie_key(key)) {
            Ok(()) => Ok(true),
            Err(MapError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::NotFound => {
                debug!("no rule table entry for {:?}", key);
                Ok(false)
            }
            Err(MapError::KeyNotFound) => Ok(false),
            Err(e) => Err(Error::kernel("failed deleting ingress firewall rules", e)),
        }
    }

    fn lookup(&self, key: &LpmKey) -> Result<Option<RulesValue>> {
        match self.trie.get(&trie_key(key), 0) {
            Ok(value) => Ok(Some(RulesValue::decode(&value))),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(Error::kernel("failed to look up ingress firewall rules", e)),
        }
    }

    fn entries(&self) -> Result<Vec<(LpmKey, RulesValue)>> {
        let mut out = Vec::new();
        for item in self.trie.iter() {
            let (key, value) = item.map_err(|e| Error::kernel("aya iter error", e))?;
            out.push((
                LpmKey::new(key.prefix_len(), key.data()),
                RulesValue::decode(&value),
            ));
        }
        Ok(out)
    }

    fn info(&self) -> Result<TableInfo> {
        Ok(self.info.clone())
    }
}

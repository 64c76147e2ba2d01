//! FTS-0005 nodelist parsing and the compiled per-network index.
//!
//! The raw nodelist is a comma-separated text file; comment lines start
//! with `;`. Compilation emits a binary index of fixed 142-byte records
//! ordered by (zone, net, node, point), fronted at lookup time by binary
//! search plus a small LRU cache. Routing walks HUB → HOST → ZONE until it
//! finds a node that is actually reachable (IBN flag or explicit host).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use super::addr::FtnAddress;
use crate::storage::write_file_atomic;

pub const DEFAULT_BINKP_PORT: u16 = 24554;

const ENTRY_LEN: usize = 142;
const LRU_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Normal,
    Zone,
    Region,
    Host,
    Hub,
    Pvt,
    Hold,
    Down,
}

impl NodeStatus {
    fn from_keyword(kw: &str) -> NodeStatus {
        match kw.to_ascii_lowercase().as_str() {
            "zone" => NodeStatus::Zone,
            "region" => NodeStatus::Region,
            "host" => NodeStatus::Host,
            "hub" => NodeStatus::Hub,
            "pvt" => NodeStatus::Pvt,
            "hold" => NodeStatus::Hold,
            "down" => NodeStatus::Down,
            _ => NodeStatus::Normal,
        }
    }

    fn to_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(b: u8) -> NodeStatus {
        match b {
            1 => NodeStatus::Zone,
            2 => NodeStatus::Region,
            3 => NodeStatus::Host,
            4 => NodeStatus::Hub,
            5 => NodeStatus::Pvt,
            6 => NodeStatus::Hold,
            7 => NodeStatus::Down,
            _ => NodeStatus::Normal,
        }
    }
}

/// Capability flag bits.
pub mod nodeflags {
    pub const CM: u8 = 0x01;
    pub const MO: u8 = 0x02;
    pub const LO: u8 = 0x04;
    pub const IBN: u8 = 0x08;
    pub const ITN: u8 = 0x10;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodelistEntry {
    pub addr: FtnAddress,
    pub status: NodeStatus,
    pub flags: u8,
    /// Node number of this node's hub within its net; 0 when none.
    pub hub_node: u16,
    /// 0 means the default BinkP port.
    pub port: u16,
    pub system_name: String,
    pub sysop: String,
    pub hostname: String,
}

impl NodelistEntry {
    pub fn binkp_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_BINKP_PORT
        } else {
            self.port
        }
    }

    /// Directly dialable: advertises BinkP or carries an explicit host.
    pub fn reachable(&self) -> bool {
        self.flags & nodeflags::IBN != 0 || !self.hostname.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse nodelist text into entries ordered by address. The parser keeps
/// running zone/net/hub context exactly as the list is written.
pub fn parse_nodelist(text: &str, zone_hint: u16) -> Vec<NodelistEntry> {
    let mut entries = Vec::new();
    let mut zone = zone_hint;
    let mut net = zone_hint;
    let mut hub = 0u16;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split(',');
        let keyword = fields.next().unwrap_or_default();
        let number: u16 = match fields.next().and_then(|f| f.trim().parse().ok()) {
            Some(n) => n,
            None => continue,
        };
        let system_name = fields.next().unwrap_or_default().replace('_', " ");
        let _location = fields.next();
        let sysop = fields.next().unwrap_or_default().replace('_', " ");
        let _phone = fields.next();
        let _baud = fields.next();

        let status = NodeStatus::from_keyword(keyword);
        let node = match status {
            NodeStatus::Zone => {
                zone = number;
                net = number;
                hub = 0;
                0
            }
            NodeStatus::Region | NodeStatus::Host => {
                net = number;
                hub = 0;
                0
            }
            NodeStatus::Hub => {
                hub = number;
                number
            }
            _ => number,
        };

        let mut flags = 0u8;
        let mut hostname = String::new();
        let mut port = 0u16;
        for flag in fields {
            let mut parts = flag.split(':');
            match parts.next().unwrap_or_default().to_ascii_uppercase().as_str() {
                "CM" => flags |= nodeflags::CM,
                "MO" => flags |= nodeflags::MO,
                "LO" => flags |= nodeflags::LO,
                "IBN" => {
                    flags |= nodeflags::IBN;
                    if let Some(h) = parts.next() {
                        if let Ok(p) = h.parse() {
                            port = p;
                        } else {
                            hostname = h.to_string();
                        }
                    }
                    if let Some(p) = parts.next().and_then(|p| p.parse().ok()) {
                        port = p;
                    }
                }
                "ITN" => flags |= nodeflags::ITN,
                _ => {}
            }
        }

        let hub_for_entry = match status {
            NodeStatus::Hub | NodeStatus::Host | NodeStatus::Zone | NodeStatus::Region => 0,
            _ => hub,
        };
        entries.push(NodelistEntry {
            addr: FtnAddress::new(zone, net, node, 0),
            status,
            flags,
            hub_node: hub_for_entry,
            port,
            system_name,
            sysop,
            hostname,
        });
    }
    entries.sort_by_key(|e| (e.addr.zone, e.addr.net, e.addr.node, e.addr.point));
    entries.dedup_by_key(|e| e.addr.clone());
    entries
}

// ---------------------------------------------------------------------------
// Binary index
// ---------------------------------------------------------------------------

fn put_fixed_str(out: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let take = bytes.len().min(len);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + len - take, 0);
}

fn get_fixed_str(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn encode_entry(e: &NodelistEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_LEN);
    out.extend_from_slice(&e.addr.zone.to_le_bytes());
    out.extend_from_slice(&e.addr.net.to_le_bytes());
    out.extend_from_slice(&e.addr.node.to_le_bytes());
    out.extend_from_slice(&e.addr.point.to_le_bytes());
    out.push(e.status.to_byte());
    out.push(e.flags);
    out.extend_from_slice(&e.hub_node.to_le_bytes());
    out.extend_from_slice(&e.port.to_le_bytes());
    put_fixed_str(&mut out, &e.system_name, 32);
    put_fixed_str(&mut out, &e.sysop, 32);
    put_fixed_str(&mut out, &e.hostname, 64);
    debug_assert_eq!(out.len(), ENTRY_LEN);
    out
}

fn decode_entry(data: &[u8]) -> NodelistEntry {
    let u16at = |o: usize| u16::from_le_bytes([data[o], data[o + 1]]);
    NodelistEntry {
        addr: FtnAddress::new(u16at(0), u16at(2), u16at(4), u16at(6)),
        status: NodeStatus::from_byte(data[8]),
        flags: data[9],
        hub_node: u16at(10),
        port: u16at(12),
        system_name: get_fixed_str(&data[14..46]),
        sysop: get_fixed_str(&data[46..78]),
        hostname: get_fixed_str(&data[78..142]),
    }
}

/// Compile raw nodelist text into a binary index file. Returns the number
/// of records written.
pub fn compile_index(text: &str, zone_hint: u16, out_path: &Path) -> Result<u32> {
    let entries = parse_nodelist(text, zone_hint);
    let mut blob = Vec::with_capacity(4 + entries.len() * ENTRY_LEN);
    blob.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in &entries {
        blob.extend_from_slice(&encode_entry(e));
    }
    write_file_atomic(out_path, &blob)?;
    Ok(entries.len() as u32)
}

/// Open index with binary-search lookup and a 64-entry LRU in front.
pub struct NodelistIndex {
    path: PathBuf,
    count: u32,
    /// Most-recently-used first.
    cache: Vec<((u16, u16, u16, u16), Option<NodelistEntry>)>,
}

impl NodelistIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let mut f = File::open(path)
            .map_err(|e| anyhow!("cannot open nodelist index {}: {}", path.display(), e))?;
        let mut header = [0u8; 4];
        f.read_exact(&mut header)?;
        Ok(NodelistIndex {
            path: path.to_path_buf(),
            count: u32::from_le_bytes(header),
            cache: Vec::new(),
        })
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn read_at(&self, f: &mut File, idx: u32) -> Result<NodelistEntry> {
        let mut buf = [0u8; ENTRY_LEN];
        f.seek(SeekFrom::Start(4 + idx as u64 * ENTRY_LEN as u64))?;
        f.read_exact(&mut buf)?;
        Ok(decode_entry(&buf))
    }

    pub fn lookup(&mut self, addr: &FtnAddress) -> Result<Option<NodelistEntry>> {
        let key = (addr.zone, addr.net, addr.node, addr.point);
        if let Some(pos) = self.cache.iter().position(|(k, _)| *k == key) {
            let hit = self.cache.remove(pos);
            let result = hit.1.clone();
            self.cache.insert(0, hit);
            return Ok(result);
        }

        let mut f = File::open(&self.path)?;
        let mut lo = 0u32;
        let mut hi = self.count;
        let mut found = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.read_at(&mut f, mid)?;
            let k = (entry.addr.zone, entry.addr.net, entry.addr.node, entry.addr.point);
            match k.cmp(&key) {
                std::cmp::Ordering::Equal => {
                    found = Some(entry);
                    break;
                }
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }

        self.cache.insert(0, (key, found.clone()));
        self.cache.truncate(LRU_CAPACITY);
        Ok(found)
    }

    /// `(hostname or empty, port)` for a node, with the BinkP default
    /// applied.
    pub fn resolve_host(&mut self, addr: &FtnAddress) -> Result<(String, u16)> {
        match self.lookup(addr)? {
            Some(e) => Ok((e.hostname.clone(), e.binkp_port())),
            None => Ok((String::new(), DEFAULT_BINKP_PORT)),
        }
    }

    /// Route toward `dest`: the node itself if reachable, else its hub,
    /// else the net host, else the zone gate.
    pub fn route_to(&mut self, dest: &FtnAddress) -> Result<Option<NodelistEntry>> {
        let dest = dest.boss();
        if let Some(e) = self.lookup(&dest)? {
            if e.reachable() {
                return Ok(Some(e));
            }
            if e.hub_node != 0 {
                let hub = FtnAddress::new(dest.zone, dest.net, e.hub_node, 0);
                if let Some(h) = self.lookup(&hub)? {
                    if h.reachable() {
                        return Ok(Some(h));
                    }
                }
            }
        }
        let host = FtnAddress::new(dest.zone, dest.net, 0, 0);
        if let Some(h) = self.lookup(&host)? {
            if h.reachable() {
                return Ok(Some(h));
            }
        }
        let zone_gate = FtnAddress::new(dest.zone, dest.zone, 0, 0);
        if let Some(z) = self.lookup(&zone_gate)? {
            if z.reachable() {
                return Ok(Some(z));
            }
        }
        Ok(None)
    }
}

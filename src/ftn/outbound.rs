//! Binkley-style outbound queue.
//!
//! The queue is a directory tree: one directory per destination address
//! under the destination domain's outbound root. Entries are plain files
//! whose names encode a monotonic timestamp and whose flavour shows up
//! both as a name prefix and in the extension. The scanner appends, the
//! mailer removes; ordering within a destination is flavour priority
//! first, then (mtime, name).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::addr::FtnAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavour {
    Normal,
    Hold,
    Direct,
    Crash,
    Immediate,
}

impl Flavour {
    pub fn from_name(name: &str) -> Flavour {
        match name.to_ascii_lowercase().as_str() {
            "hold" => Flavour::Hold,
            "direct" => Flavour::Direct,
            "crash" => Flavour::Crash,
            "immediate" => Flavour::Immediate,
            _ => Flavour::Normal,
        }
    }

    /// Filename prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Flavour::Normal => "",
            Flavour::Hold => "h",
            Flavour::Direct => "d",
            Flavour::Crash => "c",
            Flavour::Immediate => "i",
        }
    }

    /// Extension for packet entries.
    pub fn pkt_ext(&self) -> &'static str {
        match self {
            Flavour::Normal => "pkt",
            Flavour::Hold => "hpkt",
            Flavour::Direct => "dpkt",
            Flavour::Crash => "cpkt",
            Flavour::Immediate => "ipkt",
        }
    }

    /// Extension for attached-file entries.
    pub fn file_ext(&self) -> &'static str {
        match self {
            Flavour::Normal => "out",
            Flavour::Hold => "hut",
            Flavour::Direct => "dut",
            Flavour::Crash => "cut",
            Flavour::Immediate => "iut",
        }
    }

    /// Higher sorts earlier. `Immediate` beats everything.
    pub fn priority(&self) -> u8 {
        match self {
            Flavour::Normal => 0,
            Flavour::Hold => 1,
            Flavour::Direct => 2,
            Flavour::Crash => 3,
            Flavour::Immediate => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Packet,
    File,
    Freq,
    Tic,
}

/// One queued outbound artefact.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub path: PathBuf,
    pub dest: FtnAddress,
    pub flavour: Flavour,
    pub kind: QueueKind,
    pub mtime: SystemTime,
}

fn classify(name: &str) -> Option<(Flavour, QueueKind)> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let table: &[(&str, Flavour, QueueKind)] = &[
        ("pkt", Flavour::Normal, QueueKind::Packet),
        ("hpkt", Flavour::Hold, QueueKind::Packet),
        ("dpkt", Flavour::Direct, QueueKind::Packet),
        ("cpkt", Flavour::Crash, QueueKind::Packet),
        ("ipkt", Flavour::Immediate, QueueKind::Packet),
        ("out", Flavour::Normal, QueueKind::File),
        ("hut", Flavour::Hold, QueueKind::File),
        ("dut", Flavour::Direct, QueueKind::File),
        ("cut", Flavour::Crash, QueueKind::File),
        ("iut", Flavour::Immediate, QueueKind::File),
        ("req", Flavour::Crash, QueueKind::Freq),
        ("tic", Flavour::Normal, QueueKind::Tic),
    ];
    table
        .iter()
        .find(|(e, _, _)| *e == ext)
        .map(|&(_, f, k)| (f, k))
}

/// The outbound tree rooted at `FTN/Outbound`.
pub struct OutboundQueue {
    root: PathBuf,
    default_domain: String,
}

impl OutboundQueue {
    pub fn new(root: &Path, default_domain: &str) -> Self {
        OutboundQueue {
            root: root.to_path_buf(),
            default_domain: default_domain.to_string(),
        }
    }

    /// Destination directory for an address:
    /// `<root>/<domain>/<zone>/<net.node[.point]>`.
    pub fn dest_dir(&self, dest: &FtnAddress) -> PathBuf {
        let domain = if dest.domain.is_empty() {
            self.default_domain.as_str()
        } else {
            dest.domain.as_str()
        };
        self.root
            .join(domain)
            .join(dest.zone.to_string())
            .join(dest.spool_dir())
    }

    fn monotonic_name(&self, dir: &Path, flavour: Flavour, ext: &str) -> PathBuf {
        let mut stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        loop {
            let name = format!("{}{:012x}.{}", flavour.prefix(), stamp & 0xFFFF_FFFF_FFFF, ext);
            let candidate = dir.join(name);
            if !candidate.exists() {
                return candidate;
            }
            stamp += 1;
        }
    }

    pub fn enqueue_packet(&self, dest: &FtnAddress, flavour: Flavour, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.dest_dir(dest);
        fs::create_dir_all(&dir)?;
        let path = self.monotonic_name(&dir, flavour, flavour.pkt_ext());
        fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Queue an attached file by copying it into the destination directory
    /// with a flavour-marked sibling name.
    pub fn enqueue_file(&self, dest: &FtnAddress, flavour: Flavour, src: &Path) -> Result<PathBuf> {
        let dir = self.dest_dir(dest);
        fs::create_dir_all(&dir)?;
        let path = self.monotonic_name(&dir, flavour, flavour.file_ext());
        fs::copy(src, &path)?;
        Ok(path)
    }

    /// A `.req` file: one wanted name per line.
    pub fn enqueue_freq(&self, dest: &FtnAddress, names: &[String]) -> Result<PathBuf> {
        let dir = self.dest_dir(dest);
        fs::create_dir_all(&dir)?;
        let path = self.monotonic_name(&dir, Flavour::Crash, "req");
        fs::write(&path, names.join("\r\n") + "\r\n")?;
        Ok(path)
    }

    pub fn enqueue_tic(&self, dest: &FtnAddress, tic_text: &str) -> Result<PathBuf> {
        let dir = self.dest_dir(dest);
        fs::create_dir_all(&dir)?;
        let path = self.monotonic_name(&dir, Flavour::Normal, "tic");
        fs::write(&path, tic_text)?;
        Ok(path)
    }

    /// Everything queued for one destination, flavour priority first, then
    /// (mtime, name). `Hold` entries are included; the mailer decides
    /// whether the session type allows sending them.
    pub fn list(&self, dest: &FtnAddress) -> Result<Vec<QueueEntry>> {
        let dir = self.dest_dir(dest);
        let mut out = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((flavour, kind)) = classify(&name) {
                let meta = entry.metadata()?;
                out.push(QueueEntry {
                    path: entry.path(),
                    dest: dest.clone(),
                    flavour,
                    kind,
                    mtime: meta.modified().unwrap_or(UNIX_EPOCH),
                });
            }
        }
        out.sort_by(|a, b| {
            b.flavour
                .priority()
                .cmp(&a.flavour.priority())
                .then(a.mtime.cmp(&b.mtime))
                .then(a.path.cmp(&b.path))
        });
        Ok(out)
    }

    /// Walk the whole tree and report every destination that has queued
    /// entries, with its most urgent flavour.
    pub fn destinations(&self) -> Result<Vec<(FtnAddress, Flavour)>> {
        let mut out = Vec::new();
        let domains = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(_) => return Ok(out),
        };
        for domain in domains.flatten() {
            if !domain.file_type()?.is_dir() {
                continue;
            }
            let domain_name = domain.file_name().to_string_lossy().into_owned();
            for zone in fs::read_dir(domain.path())?.flatten() {
                if !zone.file_type()?.is_dir() {
                    continue;
                }
                let zone_no: u16 = match zone.file_name().to_string_lossy().parse() {
                    Ok(z) => z,
                    Err(_) => continue,
                };
                for node_dir in fs::read_dir(zone.path())?.flatten() {
                    let dirname = node_dir.file_name().to_string_lossy().into_owned();
                    if let Some(addr) = parse_spool_dir(&dirname, zone_no, &domain_name) {
                        let queued = self.list(&addr)?;
                        if let Some(top) = queued.first() {
                            out.push((addr, top.flavour));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn remove(&self, entry: &QueueEntry) -> Result<()> {
        fs::remove_file(&entry.path)
            .map_err(|e| anyhow!("failed removing {}: {}", entry.path.display(), e))
    }
}

fn parse_spool_dir(name: &str, zone: u16, domain: &str) -> Option<FtnAddress> {
    let mut parts = name.split('.');
    let net = parts.next()?.parse().ok()?;
    let node = parts.next()?.parse().ok()?;
    let point = parts.next().map(|p| p.parse().ok()).unwrap_or(Some(0))?;
    Some(FtnAddress { zone, net, node, point, domain: domain.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> FtnAddress {
        s.parse::<FtnAddress>().unwrap().with_domain("fidonet")
    }

    #[test]
    fn flavour_table() {
        assert_eq!(Flavour::from_name("CRASH"), Flavour::Crash);
        assert_eq!(Flavour::Normal.prefix(), "");
        assert_eq!(Flavour::Immediate.pkt_ext(), "ipkt");
        assert_eq!(Flavour::Hold.file_ext(), "hut");
        assert!(Flavour::Immediate.priority() > Flavour::Crash.priority());
        assert!(Flavour::Crash.priority() > Flavour::Direct.priority());
    }

    #[test]
    fn enqueue_and_priority_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let q = OutboundQueue::new(dir.path(), "fidonet");
        let dest = addr("2:250/0");

        q.enqueue_packet(&dest, Flavour::Normal, b"normal").unwrap();
        q.enqueue_packet(&dest, Flavour::Immediate, b"immediate").unwrap();
        q.enqueue_packet(&dest, Flavour::Crash, b"crash").unwrap();

        let list = q.list(&dest).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].flavour, Flavour::Immediate);
        assert_eq!(list[1].flavour, Flavour::Crash);
        assert_eq!(list[2].flavour, Flavour::Normal);
        assert!(list.iter().all(|e| e.kind == QueueKind::Packet));

        // Names carry the flavour prefix.
        let top = list[0].path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(top.starts_with('i') && top.ends_with(".ipkt"));
    }

    #[test]
    fn destination_directories_by_domain_and_zone() {
        let dir = tempfile::tempdir().unwrap();
        let q = OutboundQueue::new(dir.path(), "fidonet");
        let p = q.dest_dir(&addr("2:250/6.9"));
        let s = p.to_string_lossy().into_owned();
        assert!(s.ends_with("fidonet/2/250.6.9"), "{}", s);

        q.enqueue_packet(&addr("2:250/6.9"), Flavour::Hold, b"x").unwrap();
        let dests = q.destinations().unwrap();
        assert_eq!(dests.len(), 1);
        assert_eq!(dests[0].0.to_string(), "2:250/6.9@fidonet");
        assert_eq!(dests[0].1, Flavour::Hold);
    }

    #[test]
    fn freq_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let q = OutboundQueue::new(dir.path(), "fidonet");
        let dest = addr("2:250/0");
        q.enqueue_freq(&dest, &["NODELIST.Z*".into(), "FILES.BBS".into()]).unwrap();
        let list = q.list(&dest).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, QueueKind::Freq);
        let content = std::fs::read_to_string(&list[0].path).unwrap();
        assert!(content.contains("NODELIST.Z*"));

        q.remove(&list[0]).unwrap();
        assert!(q.list(&dest).unwrap().is_empty());
    }
}

//! Inbound mail tossing.
//!
//! Files landing in `FTN/Inbound/<domain>/<zone>` are either arcmail
//! bundles or loose packets. Bundles are extracted into a scratch
//! directory and each contained packet is tossed recursively. Per message
//! the tosser routes echomail by AREA tag, detects duplicates against a
//! bounded recent-history set, drops echomail whose SEEN-BY already lists
//! one of our AKAs, hands robot netmail to EchoFix, and stores everything
//! else. Good artefacts move to `Processed/`, bad ones to `Bad/`; one bad
//! message never stops the rest of the bundle.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use super::addr::FtnAddress;
use super::arcmail::{is_arcmail_name, is_packet_name, zip_extract};
use super::echofix::{self, FixKind, SubscriptionStore};
use super::packet::{self, PackedMessage};
use crate::config::Config;
use crate::storage::{MessageKind, MessageRecord, Storage};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TossStats {
    pub packets: u32,
    pub stored: u32,
    pub dupes: u32,
    pub loops: u32,
    pub echofix: u32,
    pub bad: u32,
}

/// Bounded recent-message history for duplicate detection.
pub struct DupeHistory {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl DupeHistory {
    pub fn new(capacity: usize) -> Self {
        DupeHistory {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a message; returns true when it was already present.
    pub fn check_and_insert(&mut self, msg: &PackedMessage) -> bool {
        let mut h = DefaultHasher::new();
        msg.orig.to_string().hash(&mut h);
        packet::msgid(&msg.body).hash(&mut h);
        msg.subject.hash(&mut h);
        msg.body.hash(&mut h);
        let key = h.finish();
        if self.seen.contains(&key) {
            return true;
        }
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(key);
        self.seen.insert(key);
        false
    }
}

pub struct Tosser {
    akas: Vec<FtnAddress>,
    dupes: DupeHistory,
}

impl Tosser {
    pub fn new(config: &Config) -> Self {
        Tosser {
            akas: config.akas(),
            dupes: DupeHistory::new(4096),
        }
    }

    /// Process every inbound artefact in every domain/zone directory.
    pub fn toss_all(
        &mut self,
        storage: &mut Storage,
        subs: &mut SubscriptionStore,
        config: &Config,
    ) -> Result<TossStats> {
        let mut stats = TossStats::default();
        let inbound_root = storage.root().join("FTN/Inbound");
        if !inbound_root.exists() {
            return Ok(stats);
        }
        for domain in read_dirs(&inbound_root)? {
            for zone in read_dirs(&domain)? {
                self.toss_dir(&zone, storage, subs, config, &mut stats)?;
            }
        }
        Ok(stats)
    }

    fn toss_dir(
        &mut self,
        dir: &Path,
        storage: &mut Storage,
        subs: &mut SubscriptionStore,
        config: &Config,
        stats: &mut TossStats,
    ) -> Result<()> {
        let mut artefacts: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)?.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                artefacts.push(entry.path());
            }
        }
        artefacts.sort();
        for path in artefacts {
            let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
            let outcome = if is_arcmail_name(&name) {
                self.toss_bundle(&path, dir, storage, subs, config, stats)
            } else if is_packet_name(&name) {
                self.toss_packet_file(&path, storage, subs, config, stats)
            } else {
                continue; // TIC companions and unknown files are not ours here
            };
            match outcome {
                Ok(()) => file_to(dir, &path, "Processed")?,
                Err(e) => {
                    stats.bad += 1;
                    storage.append_log(
                        "FTN",
                        &format!("{} bad artefact {}: {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), name, e),
                    )?;
                    warn!(target: "fidobbs::ftn", "quarantining {}: {}", name, e);
                    file_to(dir, &path, "Bad")?;
                }
            }
        }
        Ok(())
    }

    fn toss_bundle(
        &mut self,
        path: &Path,
        dir: &Path,
        storage: &mut Storage,
        subs: &mut SubscriptionStore,
        config: &Config,
        stats: &mut TossStats,
    ) -> Result<()> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let entries = zip_extract(&data)?;
        // Extract into a scratch directory first so a crash mid-bundle
        // leaves inspectable packets rather than nothing.
        let scratch = dir.join("Temp").join(Uuid::new_v4().to_string());
        fs::create_dir_all(&scratch)?;
        let result = (|| -> Result<()> {
            let mut extracted = Vec::new();
            for (name, bytes) in &entries {
                if !is_packet_name(name) {
                    continue;
                }
                let pkt_path = scratch.join(crate::validation::safe_filename(name));
                fs::write(&pkt_path, bytes)?;
                extracted.push((name.clone(), pkt_path));
            }
            for (name, pkt_path) in extracted {
                let bytes = fs::read(&pkt_path)?;
                self.toss_packet(&bytes, storage, subs, config, stats)
                    .with_context(|| format!("packet {} in bundle", name))?;
            }
            Ok(())
        })();
        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn toss_packet_file(
        &mut self,
        path: &Path,
        storage: &mut Storage,
        subs: &mut SubscriptionStore,
        config: &Config,
        stats: &mut TossStats,
    ) -> Result<()> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        self.toss_packet(&data, storage, subs, config, stats)
    }

    /// Toss one packet's messages. An unknown AREA tag fails the packet
    /// (quarantine) after the remaining messages were still processed.
    pub fn toss_packet(
        &mut self,
        data: &[u8],
        storage: &mut Storage,
        subs: &mut SubscriptionStore,
        config: &Config,
        stats: &mut TossStats,
    ) -> Result<()> {
        let (header, messages) = packet::decode_packet(data)
            .map_err(|e| anyhow::anyhow!("malformed packet: {e}"))?;
        stats.packets += 1;
        let mut unknown_area: Option<String> = None;

        for msg in messages {
            match packet::area_tag(&msg.body) {
                Some(tag) => {
                    if storage.message_area(&tag).is_none() {
                        warn!(target: "fidobbs::ftn", "unknown area {} from {}", tag, header.orig);
                        unknown_area = Some(tag);
                        continue;
                    }
                    self.toss_echomail(&tag, msg, storage, stats)?;
                }
                None => {
                    self.toss_netmail(msg, storage, subs, config, stats)?;
                }
            }
        }
        if let Some(tag) = unknown_area {
            return Err(anyhow::anyhow!("unknown area tag {}", tag));
        }
        Ok(())
    }

    fn is_our_aka(&self, net: u16, node: u16) -> bool {
        self.akas.iter().any(|a| a.net == net && a.node == node && a.point == 0)
    }

    fn toss_echomail(
        &mut self,
        tag: &str,
        msg: PackedMessage,
        storage: &mut Storage,
        stats: &mut TossStats,
    ) -> Result<()> {
        if self.dupes.check_and_insert(&msg) {
            stats.dupes += 1;
            storage.append_log(
                "FTN",
                &format!(
                    "{} dupe dropped area={} from={}",
                    Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    tag,
                    msg.from
                ),
            )?;
            return Ok(());
        }
        // Loop detection: our AKA in SEEN-BY means this message already
        // passed through us once.
        let seen = packet::seen_by_entries(&msg.body);
        if seen.iter().any(|&(net, node)| self.is_our_aka(net, node)) {
            stats.loops += 1;
            storage.append_log(
                "FTN",
                &format!(
                    "{} loop dropped area={} from={} (our AKA in SEEN-BY)",
                    Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    tag,
                    msg.orig
                ),
            )?;
            return Ok(());
        }

        let area = storage.message_area(tag).expect("checked by caller").clone();
        let mut body = msg.body.clone();
        if let Some(primary) = self.akas.first() {
            packet::append_seen_by_and_path(&mut body, primary);
        }
        let record = MessageRecord {
            id: 0,
            base: area.base.clone(),
            area: area.tag.clone(),
            kind: MessageKind::Echo,
            deleted: false,
            access_level: area.read_level,
            keys: 0,
            subject: msg.subject.clone(),
            from_name: msg.from.clone(),
            to_name: msg.to.clone(),
            sender_id: None,
            orig: Some(msg.orig.clone()),
            dest: None,
            imported: Utc::now(),
            sent: None,
            read_at: None,
            read_count: 0,
            body_len: 0,
            // The scanner forwards this to remaining subscribers; SEEN-BY
            // already lists the origin and ourselves, which keeps it from
            // flowing backwards.
            exported: false,
            flags: 0,
        };
        storage.store_message(record, &body)?;
        stats.stored += 1;
        Ok(())
    }

    fn toss_netmail(
        &mut self,
        msg: PackedMessage,
        storage: &mut Storage,
        subs: &mut SubscriptionStore,
        config: &Config,
        stats: &mut TossStats,
    ) -> Result<()> {
        // Robot mail never lands in a base.
        if let Some(kind) = echofix::fix_robot(&msg.to) {
            self.run_echofix(kind, &msg, storage, subs, config)?;
            stats.echofix += 1;
            return Ok(());
        }
        let ours = self
            .akas
            .iter()
            .any(|a| msg.dest.same_node(a) || (msg.dest.zone == 0 && a.net == msg.dest.net && a.node == msg.dest.node));
        let record = MessageRecord {
            id: 0,
            base: String::new(),
            area: String::new(),
            kind: MessageKind::Net,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: msg.subject.clone(),
            from_name: msg.from.clone(),
            to_name: msg.to.clone(),
            sender_id: None,
            orig: Some(msg.orig.clone()),
            dest: Some(msg.dest.clone()),
            imported: Utc::now(),
            sent: None,
            read_at: None,
            read_count: 0,
            body_len: 0,
            // Transit netmail stays unexported so the scanner routes it
            // onward; local netmail is terminal.
            exported: ours,
            flags: msg.attributes,
        };
        storage.store_message(record, &msg.body)?;
        stats.stored += 1;
        info!(
            target: "fidobbs::ftn",
            "netmail {} -> {} ({})",
            msg.orig,
            msg.dest,
            if ours { "local" } else { "transit" }
        );
        Ok(())
    }

    fn run_echofix(
        &self,
        kind: FixKind,
        msg: &PackedMessage,
        storage: &mut Storage,
        subs: &mut SubscriptionStore,
        config: &Config,
    ) -> Result<()> {
        let requester = msg.orig.clone();
        let downlink = config
            .ftn
            .downlinks
            .iter()
            .find(|d| {
                d.address
                    .parse::<FtnAddress>()
                    .map(|a| a.same_node(&requester))
                    .unwrap_or(false)
            })
            .cloned();
        let body_text = String::from_utf8_lossy(&msg.body).into_owned();
        let (reply_subject, reply_text) = match downlink {
            None => {
                warn!(target: "security", "echofix request from unconfigured node {}", requester);
                (
                    "Request denied".to_string(),
                    "Your system is not configured here.\r".to_string(),
                )
            }
            Some(d) => {
                let areas = match kind {
                    FixKind::Area => storage.message_areas().to_vec(),
                    FixKind::File => storage.file_areas().to_vec(),
                };
                let mut state = subs.state(&d.address);
                let reply = echofix::process_request(kind, &d, &mut state, &areas, &body_text);
                if !reply.authenticated {
                    warn!(target: "security", "echofix password failure from {}", requester);
                }
                let changed = reply.changed;
                *subs.state_mut(&d.address) = state;
                if changed {
                    subs.save()?;
                }
                (reply.subject, reply.text)
            }
        };

        // Queue the reply as ordinary unexported netmail; the scanner
        // routes and packs it like anything else.
        let our = self.akas.first().cloned().unwrap_or_else(|| FtnAddress::new(0, 0, 0, 0));
        let reply_body = format!(
            "\x01INTL {} {}\r{}",
            requester, our, reply_text
        );
        let record = MessageRecord {
            id: 0,
            base: String::new(),
            area: String::new(),
            kind: MessageKind::Net,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: reply_subject,
            from_name: match kind {
                FixKind::Area => "AreaFix".into(),
                FixKind::File => "FileFix".into(),
            },
            to_name: msg.from.clone(),
            sender_id: None,
            orig: Some(our),
            dest: Some(requester),
            imported: Utc::now(),
            sent: None,
            read_at: None,
            read_count: 0,
            body_len: 0,
            exported: false,
            flags: 0,
        };
        storage.store_message(record, reply_body.as_bytes())?;
        Ok(())
    }
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(path)?.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name != "Temp" && name != "Processed" && name != "Bad" {
                out.push(entry.path());
            }
        }
    }
    Ok(out)
}

fn file_to(dir: &Path, path: &Path, sub: &str) -> Result<()> {
    let dest_dir = dir.join(sub);
    fs::create_dir_all(&dest_dir)?;
    let mut dest = dest_dir.join(path.file_name().unwrap_or_default());
    // Never clobber an earlier artefact of the same name.
    let mut n = 0;
    while dest.exists() {
        n += 1;
        dest = dest_dir.join(format!(
            "{}.{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            n
        ));
    }
    fs::rename(path, &dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AreaConfig, DownlinkConfig};
    use crate::ftn::packet::{encode_packet, format_datetime, PacketHeader};
    use chrono::TimeZone;
    use std::str::FromStr;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.ftn.enabled = true;
        cfg.ftn.akas = vec!["2:250/0".into()];
        cfg.ftn.message_areas = vec![AreaConfig {
            tag: "TEST".into(),
            name: "Test echo".into(),
            base: "main".into(),
            groups: vec![],
            read_level: 0,
            post_level: 0,
        }];
        cfg.ftn.downlinks = vec![DownlinkConfig {
            address: "2:250/77".into(),
            password: "pw".into(),
            areafix_password: "fixpw".into(),
            allowed_echoes: "*".into(),
            allowed_files: "*".into(),
            allowed_groups: vec![],
            max_echoes: 100,
            subscriptions: vec![],
            file_subscriptions: vec![],
            paused: false,
            flavour: "normal".into(),
        }];
        cfg
    }

    fn fixture(root: &Path, cfg: &Config) -> (Storage, SubscriptionStore) {
        let storage = Storage::open(root, &cfg.ftn.message_areas, &cfg.ftn.file_areas).unwrap();
        let subs = SubscriptionStore::load(&root.join("Subscriptions.json"), &cfg.ftn.downlinks).unwrap();
        (storage, subs)
    }

    fn echomail_packet(body: &[u8]) -> Vec<u8> {
        let ts = Utc.with_ymd_and_hms(2025, 5, 5, 12, 0, 0).unwrap();
        let header = PacketHeader::new(
            FtnAddress::from_str("2:250/99").unwrap(),
            FtnAddress::from_str("2:250/0").unwrap(),
            "",
            ts,
        );
        let msg = PackedMessage {
            orig: FtnAddress::from_str("2:250/99").unwrap(),
            dest: FtnAddress::from_str("2:250/0").unwrap(),
            attributes: 0,
            cost: 0,
            datetime: format_datetime(ts),
            to: "All".into(),
            from: "Someone".into(),
            subject: "a post".into(),
            body: body.to_vec(),
        };
        encode_packet(&header, &[msg])
    }

    #[test]
    fn echomail_is_stored_with_our_seenby() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs) = fixture(dir.path(), &cfg);
        let mut tosser = Tosser::new(&cfg);
        let mut stats = TossStats::default();

        let pkt = echomail_packet(b"\x01AREA:TEST\r\x01MSGID: 2:250/99 0001\rhello\r\x01SEEN-BY: 250/99\r");
        tosser.toss_packet(&pkt, &mut storage, &mut subs, &cfg, &mut stats).unwrap();
        assert_eq!(stats.stored, 1);
        let stored = &storage.messages()[0];
        assert_eq!(stored.area, "TEST");
        assert_eq!(stored.kind, MessageKind::Echo);
        let body = storage.message_body(stored.id).unwrap();
        let seen = packet::seen_by_entries(&body);
        assert!(seen.contains(&(250, 0)), "our AKA appended to SEEN-BY");
    }

    #[test]
    fn loop_detection_drops_message() {
        // A message whose SEEN-BY already lists our AKA 2:250/0 is dropped
        // and logged; it must not appear in the message base.
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs) = fixture(dir.path(), &cfg);
        let mut tosser = Tosser::new(&cfg);
        let mut stats = TossStats::default();

        let pkt = echomail_packet(b"\x01AREA:TEST\r\x01MSGID: 2:250/99 0002\rlooped\r\x01SEEN-BY: 250/0 99\r");
        tosser.toss_packet(&pkt, &mut storage, &mut subs, &cfg, &mut stats).unwrap();
        assert_eq!(stats.loops, 1);
        assert_eq!(stats.stored, 0);
        assert!(storage.messages().is_empty());
        let log = std::fs::read_to_string(dir.path().join("Logs/FTN")).unwrap();
        assert_eq!(log.lines().filter(|l| l.contains("loop dropped")).count(), 1);
    }

    #[test]
    fn duplicates_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs) = fixture(dir.path(), &cfg);
        let mut tosser = Tosser::new(&cfg);
        let mut stats = TossStats::default();

        let pkt = echomail_packet(b"\x01AREA:TEST\r\x01MSGID: 2:250/99 0003\rsame\r");
        tosser.toss_packet(&pkt, &mut storage, &mut subs, &cfg, &mut stats).unwrap();
        tosser.toss_packet(&pkt, &mut storage, &mut subs, &cfg, &mut stats).unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.dupes, 1);
    }

    #[test]
    fn unknown_area_fails_packet() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs) = fixture(dir.path(), &cfg);
        let mut tosser = Tosser::new(&cfg);
        let mut stats = TossStats::default();

        let pkt = echomail_packet(b"\x01AREA:NOSUCH\rtext\r");
        let out = tosser.toss_packet(&pkt, &mut storage, &mut subs, &cfg, &mut stats);
        assert!(out.is_err());
    }

    #[test]
    fn arcmail_bundle_is_extracted_and_tossed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs) = fixture(dir.path(), &cfg);
        let mut tosser = Tosser::new(&cfg);

        let pkt_a = echomail_packet(b"\x01AREA:TEST\r\x01MSGID: 2:250/99 1001\rfirst\r");
        let pkt_b = echomail_packet(b"\x01AREA:TEST\r\x01MSGID: 2:250/99 1002\rsecond\r");
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
        let bundle = crate::ftn::arcmail::zip_create(
            &[("0001.pkt".to_string(), pkt_a), ("0002.pkt".to_string(), pkt_b)],
            ts,
        )
        .unwrap();

        let inbound = dir.path().join("FTN/Inbound/fidonet/2");
        std::fs::create_dir_all(&inbound).unwrap();
        std::fs::write(inbound.join("00fa0063.mo2"), &bundle).unwrap();

        let stats = tosser.toss_all(&mut storage, &mut subs, &cfg).unwrap();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.stored, 2);
        assert!(inbound.join("Processed/00fa0063.mo2").exists());
        // Scratch space is cleaned up afterwards.
        let temp = inbound.join("Temp");
        assert!(!temp.exists() || std::fs::read_dir(temp).unwrap().count() == 0);
    }

    #[test]
    fn netmail_to_us_is_terminal_transit_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs) = fixture(dir.path(), &cfg);
        let mut tosser = Tosser::new(&cfg);
        let mut stats = TossStats::default();

        let ts = Utc.with_ymd_and_hms(2025, 5, 5, 12, 0, 0).unwrap();
        let header = PacketHeader::new(
            FtnAddress::from_str("2:250/99").unwrap(),
            FtnAddress::from_str("2:250/0").unwrap(),
            "",
            ts,
        );
        let mk = |dest: &str| PackedMessage {
            orig: FtnAddress::from_str("2:250/99").unwrap(),
            dest: FtnAddress::from_str(dest).unwrap(),
            attributes: 0x0001,
            cost: 0,
            datetime: format_datetime(ts),
            to: "Sysop".into(),
            from: "Someone".into(),
            subject: "hi".into(),
            body: format!("\x01INTL {} 2:250/99\rtext\r", dest).into_bytes(),
        };
        let pkt = encode_packet(&header, &[mk("2:250/0"), mk("2:99/1")]);
        tosser.toss_packet(&pkt, &mut storage, &mut subs, &cfg, &mut stats).unwrap();
        assert_eq!(stats.stored, 2);
        let local = storage.messages().iter().find(|m| m.dest.as_ref().unwrap().net == 250).unwrap();
        assert!(local.exported);
        let transit = storage.messages().iter().find(|m| m.dest.as_ref().unwrap().net == 99).unwrap();
        assert!(!transit.exported);
    }

    #[test]
    fn areafix_request_mutates_subscriptions_and_queues_reply() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs) = fixture(dir.path(), &cfg);
        let mut tosser = Tosser::new(&cfg);
        let mut stats = TossStats::default();

        let ts = Utc.with_ymd_and_hms(2025, 5, 5, 12, 0, 0).unwrap();
        let header = PacketHeader::new(
            FtnAddress::from_str("2:250/77").unwrap(),
            FtnAddress::from_str("2:250/0").unwrap(),
            "",
            ts,
        );
        let msg = PackedMessage {
            orig: FtnAddress::from_str("2:250/77").unwrap(),
            dest: FtnAddress::from_str("2:250/0").unwrap(),
            attributes: 0x0001,
            cost: 0,
            datetime: format_datetime(ts),
            to: "AreaFix".into(),
            from: "Remote Sysop".into(),
            subject: "fixpw".into(),
            body: b"fixpw\r\n+TEST\r\n".to_vec(),
        };
        let pkt = encode_packet(&header, &[msg]);
        tosser.toss_packet(&pkt, &mut storage, &mut subs, &cfg, &mut stats).unwrap();

        assert_eq!(stats.echofix, 1);
        assert!(subs.subscribed("2:250/77", FixKind::Area, "TEST"));
        // The reply netmail is queued unexported toward the requester.
        let reply = storage.find_unexported();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].to_name, "Remote Sysop");
        assert_eq!(reply[0].dest.as_ref().unwrap().to_string(), "2:250/77");
    }
}

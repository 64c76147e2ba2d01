//! Outbound scanning and packing.
//!
//! The scanner walks every message still flagged unexported. Netmail is
//! routed point-to-point (ours → terminal, uplink match → direct, else the
//! zone-aware default route); echomail fans out to every subscriber whose
//! address is not already in SEEN-BY. Packets are grouped per destination,
//! flavoured, and dropped into the Binkley-style outbound tree; NORMAL
//! packets can afterwards be bundled into arcmail.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use rand::seq::SliceRandom;

use super::addr::FtnAddress;
use super::arcmail::{bundle_name, zip_create};
use super::echofix::{FixKind, SubscriptionStore};
use super::outbound::{Flavour, OutboundQueue, QueueKind};
use super::packet::{
    self, encode_packet, format_datetime, PackedMessage, PacketHeader,
};
use crate::config::{Config, UplinkConfig};
use crate::storage::{msgflags, MessageKind, MessageRecord, Storage};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub scanned: u32,
    pub echo_destinations: u32,
    pub netmail_routed: u32,
    pub netmail_local: u32,
    pub unroutable: u32,
}

/// Flavour for a netmail, from its routing flags with the link default as
/// fallback.
fn netmail_flavour(flags: u16, fallback: Flavour) -> Flavour {
    if flags & msgflags::IMMEDIATE != 0 {
        Flavour::Immediate
    } else if flags & msgflags::CRASH != 0 {
        Flavour::Crash
    } else if flags & msgflags::DIRECT != 0 {
        Flavour::Direct
    } else if flags & msgflags::HOLD != 0 {
        Flavour::Hold
    } else {
        fallback
    }
}

pub struct Scanner {
    akas: Vec<FtnAddress>,
}

struct EchoBatch {
    dest: FtnAddress,
    password: String,
    flavour: Flavour,
    messages: Vec<PackedMessage>,
}

impl Scanner {
    pub fn new(config: &Config) -> Self {
        Scanner { akas: config.akas() }
    }

    fn primary(&self) -> FtnAddress {
        self.akas.first().cloned().unwrap_or_else(|| FtnAddress::new(0, 0, 0, 0))
    }

    fn is_ours(&self, addr: &FtnAddress) -> bool {
        self.akas.iter().any(|a| a.same_node(addr))
    }

    /// Export everything unexported. Returns counters for the log.
    pub fn scan(
        &self,
        storage: &mut Storage,
        subs: &SubscriptionStore,
        outbound: &OutboundQueue,
        config: &Config,
    ) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        let mut batches: HashMap<String, EchoBatch> = HashMap::new();

        for record in storage.find_unexported() {
            stats.scanned += 1;
            let done = match record.kind {
                MessageKind::Net => self.route_netmail(&record, storage, outbound, config, &mut stats)?,
                MessageKind::Echo => {
                    self.collect_echo(&record, storage, subs, config, &mut batches, &mut stats)?
                }
                // Local mail never leaves the system.
                MessageKind::Local => true,
            };
            if done {
                storage.mark_exported(record.id)?;
            } else {
                stats.unroutable += 1;
            }
        }

        for batch in batches.into_values() {
            let header = PacketHeader::new(
                self.primary(),
                batch.dest.clone(),
                &batch.password,
                Utc::now(),
            );
            let bytes = encode_packet(&header, &batch.messages);
            outbound.enqueue_packet(&batch.dest, batch.flavour, &bytes)?;
            stats.echo_destinations += 1;
        }
        Ok(stats)
    }

    // --- netmail --------------------------------------------------------

    /// Route one netmail. Returns false when no route exists (the message
    /// stays unexported and is retried on the next scan).
    fn route_netmail(
        &self,
        record: &MessageRecord,
        storage: &Storage,
        outbound: &OutboundQueue,
        config: &Config,
        stats: &mut ScanStats,
    ) -> Result<bool> {
        let dest = match &record.dest {
            Some(d) => d.clone(),
            None => {
                warn!(target: "fidobbs::ftn", "netmail {} has no destination; dropping", record.id);
                return Ok(true);
            }
        };
        if self.is_ours(&dest) {
            stats.netmail_local += 1;
            return Ok(true);
        }
        // Points deliver through their boss node.
        let routed_dest = dest.boss();
        let via = self.pick_uplink(&routed_dest, config);
        let (via_addr, password, fallback_flavour) = match via {
            Some(up) => (
                FtnAddress::from_str(&up.address).unwrap_or_else(|_| routed_dest.clone()),
                up.password.clone(),
                Flavour::from_name(&up.flavour),
            ),
            None => {
                warn!(target: "fidobbs::ftn", "no route for netmail {} to {}", record.id, dest);
                return Ok(false);
            }
        };

        let mut body = storage.message_body(record.id)?;
        if packet::parse_intl(&body).is_none() {
            let intl = format!("\x01INTL {} {}\r", dest.boss(), self.primary().boss());
            let mut with = intl.into_bytes();
            with.extend_from_slice(&body);
            body = with;
        }
        let msg = PackedMessage {
            orig: record.orig.clone().unwrap_or_else(|| self.primary()),
            dest: dest.clone(),
            attributes: record.flags | msgflags::PRIVATE,
            cost: 0,
            datetime: format_datetime(record.imported),
            to: record.to_name.clone(),
            from: record.from_name.clone(),
            subject: record.subject.clone(),
            body,
        };
        let header = PacketHeader::new(self.primary(), via_addr.clone(), &password, Utc::now());
        let bytes = encode_packet(&header, &[msg]);
        let flavour = netmail_flavour(record.flags, fallback_flavour);
        outbound.enqueue_packet(&via_addr, flavour, &bytes)?;
        stats.netmail_routed += 1;
        info!(
            target: "fidobbs::ftn",
            "netmail {} routed to {} via {} ({:?})",
            record.id, dest, via_addr, flavour
        );
        Ok(true)
    }

    /// Uplink selection: exact address match, then shared zone, then the
    /// configured default route.
    fn pick_uplink<'a>(&self, dest: &FtnAddress, config: &'a Config) -> Option<&'a UplinkConfig> {
        let parsed: Vec<(usize, FtnAddress)> = config
            .ftn
            .uplinks
            .iter()
            .enumerate()
            .filter_map(|(i, u)| FtnAddress::from_str(&u.address).ok().map(|a| (i, a)))
            .collect();
        if let Some((i, _)) = parsed.iter().find(|(_, a)| a.same_node(dest)) {
            return config.ftn.uplinks.get(*i);
        }
        if let Some((i, _)) = parsed.iter().find(|(_, a)| a.zone == dest.zone) {
            return config.ftn.uplinks.get(*i);
        }
        if let Some(u) = config.ftn.uplinks.iter().find(|u| u.default_route) {
            return Some(u);
        }
        config.ftn.uplinks.first()
    }

    // --- echomail -------------------------------------------------------

    fn collect_echo(
        &self,
        record: &MessageRecord,
        storage: &Storage,
        subs: &SubscriptionStore,
        config: &Config,
        batches: &mut HashMap<String, EchoBatch>,
        _stats: &mut ScanStats,
    ) -> Result<bool> {
        let area = match storage.message_area(&record.area) {
            Some(a) => a.clone(),
            None => {
                warn!(target: "fidobbs::ftn", "echo {} references unknown area {}", record.id, record.area);
                return Ok(true);
            }
        };
        let mut body = storage.message_body(record.id)?;
        let local_origin = record.orig.is_none();
        if local_origin {
            body = self.dress_local_echo(&record.area, body, config, record.id);
        }
        let seen = packet::seen_by_entries(&body);

        // Subscribers: uplinks by group overlap, downlinks by AreaFix
        // subscription. Anybody already in SEEN-BY is skipped, which also
        // keeps the mail from flowing back where it came from.
        let mut targets: Vec<(FtnAddress, String, Flavour)> = Vec::new();
        for up in &config.ftn.uplinks {
            let addr = match FtnAddress::from_str(&up.address) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let group_match = up.groups.is_empty()
                || area.groups.is_empty()
                || up.groups.iter().any(|g| area.groups.contains(g));
            if group_match {
                targets.push((addr, up.password.clone(), Flavour::from_name(&up.flavour)));
            }
        }
        for down in &config.ftn.downlinks {
            let addr = match FtnAddress::from_str(&down.address) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let state = subs.state(&down.address);
            if state.paused {
                continue;
            }
            if subs.subscribed(&down.address, FixKind::Area, &area.tag) {
                targets.push((addr, down.password.clone(), Flavour::from_name(&down.flavour)));
            }
        }

        targets.retain(|(addr, _, _)| {
            !self.is_ours(addr) && !seen.contains(&(addr.net, addr.node))
        });
        targets.dedup_by(|a, b| a.0.same_node(&b.0));
        if targets.is_empty() {
            return Ok(true);
        }

        for (addr, password, flavour) in targets.clone() {
            // Each copy's SEEN-BY records the fan-out to the *other*
            // destinations only: the copy sent toward X must never list X,
            // or X's own loop detection would eat it.
            let mut dest_body = body.clone();
            let others: Vec<String> = targets
                .iter()
                .filter(|(a, _, _)| !a.same_node(&addr))
                .map(|(a, _, _)| format!("{}/{}", a.net, a.node))
                .collect();
            if !others.is_empty() {
                dest_body
                    .extend_from_slice(format!("\x01SEEN-BY: {}\r", others.join(" ")).as_bytes());
            }
            let msg = PackedMessage {
                orig: record.orig.clone().unwrap_or_else(|| self.primary()),
                dest: addr.clone(),
                attributes: 0,
                cost: 0,
                datetime: format_datetime(record.imported),
                to: record.to_name.clone(),
                from: record.from_name.clone(),
                subject: record.subject.clone(),
                body: dest_body,
            };
            batches
                .entry(addr.to_string())
                .or_insert_with(|| EchoBatch {
                    dest: addr,
                    password,
                    flavour,
                    messages: Vec::new(),
                })
                .messages
                .push(msg);
        }
        Ok(true)
    }

    /// A locally posted echo needs its kludge dressing: MSGID, tearline,
    /// origin line, our SEEN-BY and PATH.
    fn dress_local_echo(&self, area: &str, text: Vec<u8>, config: &Config, id: u32) -> Vec<u8> {
        let aka = self.primary();
        let serial = (id as u64) ^ ((Utc::now().timestamp() as u64) << 8);
        let origin_line = config
            .ftn
            .origin_lines
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| config.bbs.name.clone());
        let mut body = Vec::with_capacity(text.len() + 160);
        body.extend_from_slice(format!("\x01AREA:{}\r", area.to_ascii_uppercase()).as_bytes());
        body.extend_from_slice(format!("\x01MSGID: {} {:08x}\r", aka, serial & 0xFFFF_FFFF).as_bytes());
        body.extend_from_slice(&text);
        if !body.ends_with(b"\r") {
            body.push(b'\r');
        }
        body.extend_from_slice(format!("--- fidobbs {}\r", env!("CARGO_PKG_VERSION")).as_bytes());
        body.extend_from_slice(format!(" * Origin: {} ({})\r", origin_line, aka).as_bytes());
        packet::append_seen_by_and_path(&mut body, &aka);
        body
    }

    // --- arcmail bundling ----------------------------------------------

    /// Bundle the queued NORMAL packets for `dest` into one arcmail
    /// archive, replacing them in the queue.
    pub fn bundle_normal_packets(
        &self,
        outbound: &OutboundQueue,
        dest: &FtnAddress,
    ) -> Result<Option<std::path::PathBuf>> {
        let entries: Vec<_> = outbound
            .list(dest)?
            .into_iter()
            .filter(|e| e.kind == QueueKind::Packet && e.flavour == Flavour::Normal)
            .collect();
        if entries.len() < 2 {
            return Ok(None);
        }
        let mut zip_entries = Vec::with_capacity(entries.len());
        for e in &entries {
            let name = e.path.file_name().unwrap_or_default().to_string_lossy().into_owned();
            zip_entries.push((name, std::fs::read(&e.path)?));
        }
        let now = Utc::now();
        let archive = zip_create(&zip_entries, now)?;
        let dir = outbound.dest_dir(dest);
        // The day-of-week extension cycles; bump the trailing digit when a
        // bundle of that name already exists today.
        let base = bundle_name(dest, now);
        let mut path = dir.join(&base);
        let mut digit: u8 = base.as_bytes()[base.len() - 1] - b'0';
        for _ in 0..10 {
            if !path.exists() {
                break;
            }
            digit = (digit + 1) % 10;
            let mut name = base.clone();
            name.replace_range(base.len() - 1.., &digit.to_string());
            path = dir.join(name);
        }
        std::fs::write(&path, &archive)?;
        for e in &entries {
            outbound.remove(e)?;
        }
        info!(
            target: "fidobbs::ftn",
            "bundled {} packets for {} into {}",
            entries.len(),
            dest,
            path.display()
        );
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AreaConfig, DownlinkConfig};
    use crate::ftn::packet::decode_packet;
    use crate::storage::Storage;
    use std::path::Path;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.ftn.enabled = true;
        cfg.ftn.akas = vec!["2:250/6".into()];
        cfg.ftn.origin_lines = vec!["Test Origin".into()];
        cfg.ftn.message_areas = vec![AreaConfig {
            tag: "TEST".into(),
            name: "Test".into(),
            base: "main".into(),
            groups: vec![],
            read_level: 0,
            post_level: 0,
        }];
        cfg.ftn.uplinks = vec![crate::config::UplinkConfig {
            address: "2:250/0".into(),
            host: "".into(),
            port: 24554,
            password: "uplinkpw".into(),
            groups: vec![],
            flavour: "normal".into(),
            default_route: true,
        }];
        cfg.ftn.downlinks = vec![DownlinkConfig {
            address: "2:250/77".into(),
            password: "downpw".into(),
            areafix_password: "fixpw".into(),
            allowed_echoes: "*".into(),
            allowed_files: "*".into(),
            allowed_groups: vec![],
            max_echoes: 100,
            subscriptions: vec!["TEST".into()],
            file_subscriptions: vec![],
            paused: false,
            flavour: "crash".into(),
        }];
        cfg
    }

    fn fixture(root: &Path, cfg: &Config) -> (Storage, SubscriptionStore, OutboundQueue) {
        let storage = Storage::open(root, &cfg.ftn.message_areas, &cfg.ftn.file_areas).unwrap();
        let subs = SubscriptionStore::load(&root.join("Subscriptions.json"), &cfg.ftn.downlinks).unwrap();
        let outbound = OutboundQueue::new(&root.join("FTN/Outbound"), &cfg.ftn.default_domain);
        (storage, subs, outbound)
    }

    fn local_echo(storage: &mut Storage) -> u32 {
        let record = MessageRecord {
            id: 0,
            base: "main".into(),
            area: "TEST".into(),
            kind: MessageKind::Echo,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: "local post".into(),
            from_name: "Alice".into(),
            to_name: "All".into(),
            sender_id: Some(1),
            orig: None,
            dest: None,
            imported: Utc::now(),
            sent: None,
            read_at: None,
            read_count: 0,
            body_len: 0,
            exported: false,
            flags: 0,
        };
        storage.store_message(record, b"hello echo world\r").unwrap()
    }

    #[test]
    fn local_echo_fans_out_to_uplink_and_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, subs, outbound) = fixture(dir.path(), &cfg);
        local_echo(&mut storage);

        let scanner = Scanner::new(&cfg);
        let stats = scanner.scan(&mut storage, &subs, &outbound, &cfg).unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.echo_destinations, 2);
        assert!(storage.find_unexported().is_empty());

        // The downlink copy is flavoured crash and carries the dressing.
        let down: FtnAddress = "2:250/77@fidonet".parse().unwrap();
        let queued = outbound.list(&down).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].flavour, Flavour::Crash);
        let bytes = std::fs::read(&queued[0].path).unwrap();
        let (header, msgs) = decode_packet(&bytes).unwrap();
        assert_eq!(header.password, "downpw");
        let body = &msgs[0].body;
        assert_eq!(packet::area_tag(body).as_deref(), Some("TEST"));
        assert!(packet::msgid(body).is_some());
        let text = String::from_utf8_lossy(body);
        assert!(text.contains("--- fidobbs"));
        assert!(text.contains(" * Origin: Test Origin (2:250/6"));
        // SEEN-BY lists us and the other destination, but never the
        // recipient itself.
        let seen = packet::seen_by_entries(body);
        assert!(seen.contains(&(250, 6)));
        assert!(seen.contains(&(250, 0)));
        assert!(!seen.contains(&(250, 77)));
    }

    #[test]
    fn echo_is_not_sent_to_nodes_already_in_seen_by() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, subs, outbound) = fixture(dir.path(), &cfg);

        // An imported message that the uplink has already seen.
        let record = MessageRecord {
            id: 0,
            base: "main".into(),
            area: "TEST".into(),
            kind: MessageKind::Echo,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: "from afar".into(),
            from_name: "Remote".into(),
            to_name: "All".into(),
            sender_id: None,
            orig: Some("2:250/0".parse().unwrap()),
            dest: None,
            imported: Utc::now(),
            sent: None,
            read_at: None,
            read_count: 0,
            body_len: 0,
            exported: false,
            flags: 0,
        };
        storage
            .store_message(record, b"\x01AREA:TEST\rbody\r\x01SEEN-BY: 250/0 6\r\x01PATH: 250/0\r")
            .unwrap();

        let scanner = Scanner::new(&cfg);
        let stats = scanner.scan(&mut storage, &subs, &outbound, &cfg).unwrap();
        // Only the downlink gets a copy; the uplink is in SEEN-BY.
        assert_eq!(stats.echo_destinations, 1);
        let up: FtnAddress = "2:250/0@fidonet".parse().unwrap();
        assert!(outbound.list(&up).unwrap().is_empty());
        let down: FtnAddress = "2:250/77@fidonet".parse().unwrap();
        let queued = outbound.list(&down).unwrap();
        assert_eq!(queued.len(), 1);
        // The copy keeps the origin in SEEN-BY (so it never flows back)
        // and does not list its own recipient.
        let bytes = std::fs::read(&queued[0].path).unwrap();
        let (_, msgs) = decode_packet(&bytes).unwrap();
        let seen = packet::seen_by_entries(&msgs[0].body);
        assert!(seen.contains(&(250, 0)));
        assert!(!seen.contains(&(250, 77)));
    }

    #[test]
    fn netmail_routing_rules() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, subs, outbound) = fixture(dir.path(), &cfg);

        let mk = |dest: &str, flags: u16| MessageRecord {
            id: 0,
            base: String::new(),
            area: String::new(),
            kind: MessageKind::Net,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: "n".into(),
            from_name: "Alice".into(),
            to_name: "Bob".into(),
            sender_id: Some(1),
            orig: None,
            dest: Some(dest.parse().unwrap()),
            imported: Utc::now(),
            sent: None,
            read_at: None,
            read_count: 0,
            body_len: 0,
            exported: false,
            flags,
        };
        // To ourselves: terminal. To the uplink: direct. To a stranger in
        // zone 2: default route. A point resolves to its boss.
        storage.store_message(mk("2:250/6", 0), b"to us\r").unwrap();
        storage.store_message(mk("2:250/0", 0), b"to uplink\r").unwrap();
        storage.store_message(mk("2:999/9", msgflags::CRASH), b"transit\r").unwrap();

        let scanner = Scanner::new(&cfg);
        let stats = scanner.scan(&mut storage, &subs, &outbound, &cfg).unwrap();
        assert_eq!(stats.netmail_local, 1);
        assert_eq!(stats.netmail_routed, 2);
        assert!(storage.find_unexported().is_empty());

        let up: FtnAddress = "2:250/0@fidonet".parse().unwrap();
        let queued = outbound.list(&up).unwrap();
        assert_eq!(queued.len(), 2);
        // Crash outranks normal in the queue ordering.
        assert_eq!(queued[0].flavour, Flavour::Crash);
        let bytes = std::fs::read(&queued[0].path).unwrap();
        let (_, msgs) = decode_packet(&bytes).unwrap();
        assert_eq!(msgs[0].dest.to_string(), "2:999/9");
        assert!(packet::parse_intl(&msgs[0].body).is_some());
    }

    #[test]
    fn paused_downlink_gets_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (mut storage, mut subs, outbound) = fixture(dir.path(), &cfg);
        subs.state_mut("2:250/77").paused = true;
        local_echo(&mut storage);

        let scanner = Scanner::new(&cfg);
        let stats = scanner.scan(&mut storage, &subs, &outbound, &cfg).unwrap();
        assert_eq!(stats.echo_destinations, 1); // uplink only
    }

    #[test]
    fn arcmail_bundling_replaces_normal_packets() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config();
        let (_, _, outbound) = fixture(dir.path(), &cfg);
        let dest: FtnAddress = "2:250/0@fidonet".parse().unwrap();
        outbound.enqueue_packet(&dest, Flavour::Normal, b"pkt one").unwrap();
        outbound.enqueue_packet(&dest, Flavour::Normal, b"pkt two").unwrap();
        outbound.enqueue_packet(&dest, Flavour::Crash, b"urgent").unwrap();

        let scanner = Scanner::new(&cfg);
        let bundled = scanner.bundle_normal_packets(&outbound, &dest).unwrap();
        let path = bundled.expect("bundle created");
        assert!(crate::ftn::arcmail::is_arcmail_name(
            &path.file_name().unwrap().to_string_lossy()
        ));

        // The two NORMAL packets are gone; the crash packet remains.
        let left = outbound.list(&dest).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].flavour, Flavour::Crash);

        let archive = std::fs::read(&path).unwrap();
        let entries = crate::ftn::arcmail::zip_extract(&archive).unwrap();
        assert_eq!(entries.len(), 2);
    }
}

//! The mailer event loop.
//!
//! One [`Mailer`] per process: it tosses inbound mail, scans and packs
//! outbound mail, processes TIC file echoes, answers BinkP calls, and
//! polls uplinks on the configured interval with exponential backoff after
//! failures. It runs beside (not inside) the session runtime; the two
//! share only the object store.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

use super::addr::FtnAddress;
use super::binkp::{self, Endpoint, OutboundFile};
use super::echofix::{FixKind, SubscriptionStore};
use super::nodelist::{NodelistIndex, DEFAULT_BINKP_PORT};
use super::outbound::{Flavour, OutboundQueue};
use super::scanner::Scanner;
use super::tic::TicFile;
use super::tosser::Tosser;
use crate::config::{Config, UplinkConfig};
use crate::storage::{FileRecord, Storage};

pub struct Mailer {
    config: Arc<Config>,
    storage: Arc<Mutex<Storage>>,
    outbound: OutboundQueue,
    subs: SubscriptionStore,
    tosser: Tosser,
    scanner: Scanner,
    /// Consecutive failures per uplink address, for backoff.
    failures: std::collections::HashMap<String, u32>,
    /// Poll rounds still to skip per uplink after failures.
    backoff: std::collections::HashMap<String, u32>,
}

impl Mailer {
    pub fn new(config: Arc<Config>, storage: Arc<Mutex<Storage>>, root: &Path) -> Result<Self> {
        let outbound = OutboundQueue::new(&root.join("FTN/Outbound"), &config.ftn.default_domain);
        let subs = SubscriptionStore::load(&root.join("FTN/Subscriptions.json"), &config.ftn.downlinks)?;
        let tosser = Tosser::new(&config);
        let scanner = Scanner::new(&config);
        Ok(Mailer {
            config,
            storage,
            outbound,
            subs,
            tosser,
            scanner,
            failures: std::collections::HashMap::new(),
            backoff: std::collections::HashMap::new(),
        })
    }

    /// One full maintenance pass: toss, TICs, scan, bundle.
    pub async fn run_once(&mut self) -> Result<()> {
        let storage_arc = self.storage.clone();
        let mut storage = storage_arc.lock().await;
        let stats = self.tosser.toss_all(&mut storage, &mut self.subs, &self.config)?;
        if stats != Default::default() {
            info!(target: "fidobbs::ftn", "toss: {:?}", stats);
        }
        self.process_inbound_tics(&mut storage)?;
        let scan = self.scanner.scan(&mut storage, &self.subs, &self.outbound, &self.config)?;
        if scan != Default::default() {
            info!(target: "fidobbs::ftn", "scan: {:?}", scan);
        }
        drop(storage);
        for (dest, _) in self.outbound.destinations()? {
            let _ = self.scanner.bundle_normal_packets(&self.outbound, &dest);
        }
        Ok(())
    }

    /// The long-running loop: periodic maintenance, a BinkP listener, and
    /// scheduled polls.
    pub async fn run(mut self) -> Result<()> {
        let listener = if self.config.ftn.binkp_port != 0 {
            let bind = format!("0.0.0.0:{}", self.config.ftn.binkp_port);
            Some(TcpListener::bind(&bind).await.context("binding BinkP listener")?)
        } else {
            None
        };
        if let Some(l) = &listener {
            info!(target: "fidobbs::ftn", "BinkP listening on {}", l.local_addr()?);
        }

        let mut maintenance = interval(Duration::from_secs(60));
        let mut poll_tick = interval(Duration::from_secs(self.config.ftn.poll_interval_secs.max(60)));

        loop {
            tokio::select! {
                _ = maintenance.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(target: "fidobbs::ftn", "maintenance pass failed: {e:#}");
                    }
                }
                _ = poll_tick.tick() => {
                    self.poll_all_uplinks().await;
                }
                accepted = async {
                    match &listener {
                        Some(l) => Some(l.accept().await),
                        None => {
                            // No listener: never resolves.
                            std::future::pending::<Option<_>>().await
                        }
                    }
                } => {
                    if let Some(Ok((socket, peer))) = accepted {
                        info!(target: "fidobbs::ftn", "BinkP call from {}", peer);
                        if let Err(e) = self.answer(socket).await {
                            warn!(target: "fidobbs::ftn", "inbound session from {peer} failed: {e}");
                        }
                    }
                }
            }
        }
    }

    // --- outbound sessions ---------------------------------------------

    async fn poll_all_uplinks(&mut self) {
        let uplinks = self.config.ftn.uplinks.clone();
        for uplink in &uplinks {
            let addr = match FtnAddress::from_str(&uplink.address) {
                Ok(a) => a,
                Err(_) => continue,
            };
            if let Some(rounds) = self.backoff.get_mut(&uplink.address) {
                if *rounds > 0 {
                    *rounds -= 1;
                    continue;
                }
            }
            let has_mail = self
                .outbound
                .list(&addr)
                .map(|q| q.iter().any(|e| e.flavour != Flavour::Hold))
                .unwrap_or(false);
            if !has_mail {
                continue;
            }
            match self.poll(uplink).await {
                Ok(_) => {
                    self.failures.remove(&uplink.address);
                    self.backoff.remove(&uplink.address);
                }
                Err(e) => {
                    warn!(target: "fidobbs::ftn", "poll {} failed: {e:#}", uplink.address);
                    let n = self.failures.entry(uplink.address.clone()).or_insert(0);
                    *n += 1;
                    // Exponential backoff in whole poll rounds, capped so a
                    // flapping link is still retried within the interval's
                    // order of magnitude.
                    self.backoff.insert(uplink.address.clone(), (1u32 << (*n).min(5)) - 1);
                }
            }
        }
    }

    /// Dial one uplink and exchange mail.
    pub async fn poll(&mut self, uplink: &UplinkConfig) -> Result<()> {
        let addr = FtnAddress::from_str(&uplink.address).map_err(|e| anyhow!("{e}"))?;
        let (host, port) = self.resolve(uplink, &addr)?;
        if host.is_empty() {
            return Err(anyhow!("no host known for {}", uplink.address));
        }
        info!(target: "fidobbs::ftn", "polling {} at {}:{}", uplink.address, host, port);
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("connecting {}:{}", host, port))?;

        let queued = self.outbound.list(&addr)?;
        let sendable: Vec<_> = queued
            .iter()
            .filter(|e| e.flavour != Flavour::Hold || uplink.default_route)
            .collect();
        let files = sendable
            .iter()
            .map(|e| queue_entry_to_file(&e.path))
            .collect::<Result<Vec<_>>>()?;

        let inbound = {
            let storage = self.storage.lock().await;
            storage.inbound_dir(&self.config.ftn.default_domain, addr.zone)
        };
        fs::create_dir_all(&inbound)?;
        let endpoint = Endpoint {
            akas: self.config.akas(),
            system_name: self.config.bbs.name.clone(),
            sysop: self.config.bbs.sysop.clone(),
            location: self.config.bbs.location.clone(),
            inbound_dir: inbound,
            files,
            freqs: vec![],
            freq_dir: freq_dir(&self.config),
        };
        let outcome = binkp::run_caller(stream, endpoint, &uplink.password)
            .await
            .map_err(|e| anyhow!("session failed: {e}"))?;

        for entry in sendable {
            if outcome.sent.iter().chain(outcome.skipped.iter()).any(|n| {
                entry.path.file_name().map(|f| f.to_string_lossy() == *n).unwrap_or(false)
            }) {
                self.outbound.remove(entry)?;
            }
        }
        info!(
            target: "fidobbs::ftn",
            "poll {} done: sent {}, received {}",
            uplink.address,
            outcome.sent.len(),
            outcome.received.len()
        );
        // Anything received gets tossed on the next maintenance pass.
        Ok(())
    }

    async fn answer(&mut self, socket: TcpStream) -> Result<()> {
        let links: Vec<(FtnAddress, String)> = self
            .config
            .ftn
            .uplinks
            .iter()
            .filter_map(|u| FtnAddress::from_str(&u.address).ok().map(|a| (a, u.password.clone())))
            .chain(self.config.ftn.downlinks.iter().filter_map(|d| {
                FtnAddress::from_str(&d.address).ok().map(|a| (a, d.password.clone()))
            }))
            .collect();

        // We cannot know the caller's address until M_ADR, so offer the
        // union of everything queued for configured links; the remote
        // refuses what is not for it. In practice sessions are per-link
        // and the queue listing below is what that link is owed.
        let inbound = {
            let storage = self.storage.lock().await;
            storage.inbound_dir(&self.config.ftn.default_domain, self.config.primary_aka().map(|a| a.zone).unwrap_or(2))
        };
        fs::create_dir_all(&inbound)?;

        // Hold mail waits to be collected, which is exactly what an
        // inbound call does, so everything queued for the caller's links
        // is offered.
        let mut files = Vec::new();
        for (addr, _) in &links {
            for entry in self.outbound.list(addr)? {
                files.push(queue_entry_to_file(&entry.path)?);
            }
        }

        let endpoint = Endpoint {
            akas: self.config.akas(),
            system_name: self.config.bbs.name.clone(),
            sysop: self.config.bbs.sysop.clone(),
            location: self.config.bbs.location.clone(),
            inbound_dir: inbound,
            files,
            freqs: vec![],
            freq_dir: freq_dir(&self.config),
        };
        let outcome = binkp::run_answerer(socket, endpoint, &links)
            .await
            .map_err(|e| anyhow!("{e}"))?;

        // Remove what the caller acknowledged.
        for (addr, _) in &links {
            for entry in self.outbound.list(addr)? {
                let name = entry.path.file_name().map(|f| f.to_string_lossy().into_owned());
                if let Some(name) = name {
                    if outcome.sent.contains(&name) || outcome.skipped.contains(&name) {
                        self.outbound.remove(&entry)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, uplink: &UplinkConfig, addr: &FtnAddress) -> Result<(String, u16)> {
        if !uplink.host.is_empty() {
            return Ok((uplink.host.clone(), uplink.port));
        }
        let idx_path = {
            // Nodelist indexes live per network under the storage root.
            let root = self.outbound_root_parent();
            root.join("FTN/Nodelists")
                .join(&self.config.ftn.default_domain)
                .join("NodeIDX")
        };
        if idx_path.exists() {
            let mut idx = NodelistIndex::open(&idx_path)?;
            if let Some(route) = idx.route_to(addr)? {
                return Ok((route.hostname.clone(), route.binkp_port()));
            }
        }
        Ok((String::new(), DEFAULT_BINKP_PORT))
    }

    fn outbound_root_parent(&self) -> PathBuf {
        // OutboundQueue root is <storage root>/FTN/Outbound.
        PathBuf::from(&self.config.storage.root)
    }

    // --- TIC processing -------------------------------------------------

    /// Verify and import inbound TIC files, forwarding to subscribers.
    fn process_inbound_tics(&mut self, storage: &mut Storage) -> Result<()> {
        let inbound_root = storage.root().join("FTN/Inbound");
        if !inbound_root.exists() {
            return Ok(());
        }
        let mut tics = Vec::new();
        for domain in read_dirs(&inbound_root)? {
            for zone in read_dirs(&domain)? {
                for entry in fs::read_dir(&zone)?.flatten() {
                    let path = entry.path();
                    if path.extension().map(|e| e.eq_ignore_ascii_case("tic")).unwrap_or(false) {
                        tics.push((zone.clone(), path));
                    }
                }
            }
        }
        for (dir, tic_path) in tics {
            match self.process_one_tic(storage, &dir, &tic_path) {
                Ok(()) => {}
                Err(e) => {
                    warn!(target: "fidobbs::ftn", "bad TIC {}: {e:#}", tic_path.display());
                    storage.append_log(
                        "FTN",
                        &format!("{} bad TIC {}: {e:#}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), tic_path.display()),
                    )?;
                    move_artefact(&dir, &tic_path, "Bad")?;
                }
            }
        }
        Ok(())
    }

    fn process_one_tic(&mut self, storage: &mut Storage, dir: &Path, tic_path: &Path) -> Result<()> {
        let text = fs::read_to_string(tic_path)?;
        let tic = TicFile::parse(&text)?;
        let companion = dir.join(crate::validation::safe_filename(&tic.file));
        let payload = fs::read(&companion)
            .with_context(|| format!("companion file {} missing", tic.file))?;
        if !tic.verify(&payload) {
            return Err(anyhow!("CRC mismatch for {}", tic.file));
        }
        let area = storage
            .file_area(&tic.area)
            .ok_or_else(|| anyhow!("unknown file area {}", tic.area))?
            .clone();

        let record = FileRecord {
            id: 0,
            base: area.base.clone(),
            area: area.tag.clone(),
            deleted: false,
            access_level: area.read_level,
            keys: 0,
            name: tic.file.clone(),
            description: tic.desc.clone(),
            uploader: None,
            uploaded: Utc::now(),
            size: payload.len() as u64,
            downloads: 0,
        };
        storage.add_file(record, &payload)?;
        info!(target: "fidobbs::ftn", "TIC {} filed into {}", tic.file, area.tag);

        // Forward to every FileFix subscriber that has not seen it.
        let our = self.config.primary_aka().unwrap_or_else(|| FtnAddress::new(0, 0, 0, 0));
        for down in &self.config.ftn.downlinks {
            if !self.subs.subscribed(&down.address, FixKind::File, &area.tag) {
                continue;
            }
            if self.subs.state(&down.address).paused {
                continue;
            }
            let dest = match FtnAddress::from_str(&down.address) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let already = tic.seenby.iter().any(|s| {
                FtnAddress::from_str(s).map(|a| a.same_node(&dest)).unwrap_or(false)
            });
            if already {
                continue;
            }
            let fwd = tic.forwarded(&our, &dest);
            self.outbound.enqueue_file(&dest, Flavour::Normal, &companion)?;
            self.outbound.enqueue_tic(&dest, &fwd.emit())?;
        }

        move_artefact(dir, tic_path, "Processed")?;
        move_artefact(dir, &companion, "Processed")?;
        Ok(())
    }
}

fn freq_dir(config: &Config) -> Option<PathBuf> {
    if config.ftn.freq_dir.is_empty() {
        None
    } else {
        Some(PathBuf::from(&config.ftn.freq_dir))
    }
}

fn queue_entry_to_file(path: &Path) -> Result<OutboundFile> {
    let meta = fs::metadata(path)?;
    Ok(OutboundFile {
        path: path.to_path_buf(),
        name: path.file_name().unwrap_or_default().to_string_lossy().into_owned(),
        size: meta.len(),
        mtime: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    })
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

fn move_artefact(dir: &Path, path: &Path, sub: &str) -> Result<()> {
    let dest_dir = dir.join(sub);
    fs::create_dir_all(&dest_dir)?;
    let mut dest = dest_dir.join(path.file_name().unwrap_or_default());
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

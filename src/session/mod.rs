//! Per-line session state.
//!
//! A session walks DISCONNECTED → PRELOGON → AUTHENTICATED and back. It
//! owns the line's ANSI terminal model, the script interpreter driving the
//! menus, and any active file transfer. The scheduler in `bbs::server`
//! advances sessions; nothing here blocks.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::events::UiEvent;
use crate::ftn::addr::FtnAddress;
use crate::logutil::escape_log;
use crate::pipe::PipePlane;
use crate::script::interp::{Interp, ScriptHost};
use crate::script::ScriptError;
use crate::storage::{
    msgflags, AuthOutcome, MessageKind, MessageRecord, Storage, UserRecord,
};
use crate::terminal::Terminal;
use crate::transfer::xmodem::{CheckMode, XmodemReceiver, XmodemSender};
use crate::transfer::ymodem::{YmodemFile, YmodemReceiver, YmodemSender};
use crate::transfer::zmodem::{ZmodemReceiver, ZmodemSender};
use crate::transfer::{BytePipe, Protocol, TransferError, TransferState};
use crate::validation::{clamp_activity, safe_filename};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Disconnected,
    Prelogon,
    Authenticated,
}

/// A running transfer owned by the session.
pub enum ActiveTransfer {
    XmodemSend(XmodemSender),
    XmodemRecv { inner: XmodemReceiver, dest: PathBuf, name: String },
    YmodemSend(YmodemSender),
    YmodemRecv(YmodemReceiver),
    ZmodemSend(ZmodemSender),
    ZmodemRecv(ZmodemReceiver),
}

impl ActiveTransfer {
    pub fn poll(
        &mut self,
        pipe: &mut dyn BytePipe,
        now: Instant,
    ) -> Result<TransferState, TransferError> {
        match self {
            ActiveTransfer::XmodemSend(t) => t.poll(pipe, now),
            ActiveTransfer::XmodemRecv { inner, .. } => inner.poll(pipe, now),
            ActiveTransfer::YmodemSend(t) => t.poll(pipe, now),
            ActiveTransfer::YmodemRecv(t) => t.poll(pipe, now),
            ActiveTransfer::ZmodemSend(t) => t.poll(pipe, now),
            ActiveTransfer::ZmodemRecv(t) => t.poll(pipe, now),
        }
    }

    /// Files landed by a completed receive, `(path, name)` pairs ready to
    /// enter the file base.
    pub fn received_files(&self) -> Vec<(PathBuf, String)> {
        match self {
            ActiveTransfer::XmodemRecv { dest, name, .. } => {
                vec![(dest.clone(), name.clone())]
            }
            ActiveTransfer::YmodemRecv(r) => r
                .received_files()
                .iter()
                .map(|(p, _)| (p.clone(), p.file_name().unwrap_or_default().to_string_lossy().into_owned()))
                .collect(),
            ActiveTransfer::ZmodemRecv(r) => r
                .received_files()
                .iter()
                .map(|(p, _)| (p.clone(), p.file_name().unwrap_or_default().to_string_lossy().into_owned()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_receive(&self) -> bool {
        matches!(
            self,
            ActiveTransfer::XmodemRecv { .. }
                | ActiveTransfer::YmodemRecv(_)
                | ActiveTransfer::ZmodemRecv(_)
        )
    }
}

/// Everything the session owns apart from the interpreter. The split lets
/// the interpreter borrow the rest of the session as its host.
pub struct SessionCore {
    pub line: usize,
    pub state: LineState,
    pub user: Option<UserRecord>,
    pub terminal: Terminal,
    pub transfer: Option<ActiveTransfer>,
    pub activity: String,
    pub peer: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_input: Instant,
    pub auth_failures: u8,
    pub ansi: bool,
    /// Output the pipe could not take yet; flushed before new steps run.
    backlog: Vec<u8>,
    /// Set when something (script, sysop, strikeout) wants the line down.
    pub hangup_requested: bool,
    /// Set while a transfer runs: suppresses the idle timer and switches
    /// the transport to binary mode.
    pub transfer_active: bool,
}

pub struct Session {
    pub core: SessionCore,
    pub interp: Option<Interp>,
}

impl Session {
    pub fn new(line: usize) -> Self {
        Session {
            core: SessionCore {
                line,
                state: LineState::Disconnected,
                user: None,
                terminal: Terminal::new(),
                transfer: None,
                activity: String::new(),
                peer: String::new(),
                connected_at: None,
                last_input: Instant::now(),
                auth_failures: 0,
                ansi: false,
                backlog: Vec::new(),
                hangup_requested: false,
                transfer_active: false,
            },
            interp: None,
        }
    }

    /// Transition into PRELOGON on connect.
    pub fn connect(&mut self, peer: &str, now: Instant) {
        self.core.state = LineState::Prelogon;
        self.core.peer = peer.to_string();
        self.core.connected_at = Some(Utc::now());
        self.core.last_input = now;
        self.core.auth_failures = 0;
        self.core.hangup_requested = false;
        self.core.terminal = Terminal::new();
    }

    /// Tear the session back down to DISCONNECTED. The caller handles the
    /// pipe reset and events.
    pub fn disconnect(&mut self) {
        self.core.state = LineState::Disconnected;
        self.core.user = None;
        self.core.activity.clear();
        self.core.peer.clear();
        self.core.connected_at = None;
        self.core.transfer = None;
        self.core.transfer_active = false;
        self.core.backlog.clear();
        self.core.hangup_requested = false;
        self.interp = None;
    }

    /// Push backlog bytes into the output pipe. Returns true when drained.
    pub fn pump_backlog(&mut self, plane: &PipePlane) -> bool {
        if self.core.backlog.is_empty() {
            return true;
        }
        let taken = plane.enqueue_output(self.core.line, &self.core.backlog);
        self.core.backlog.drain(..taken);
        self.core.backlog.is_empty()
    }
}

impl SessionCore {
    pub fn bound_user_name(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username.as_str())
    }
}

/// The interpreter's view of the world for one scheduler visit. Borrows
/// the session core plus the shared subsystems.
pub struct HostCtx<'a> {
    pub core: &'a mut SessionCore,
    pub storage: &'a mut Storage,
    pub plane: &'a PipePlane,
    pub config: &'a Config,
    /// `(line, username, activity)` of the other bound lines.
    pub online: &'a [(usize, String, String)],
    pub events: &'a mpsc::UnboundedSender<UiEvent>,
    /// Staging directory for inbound uploads on this line.
    pub upload_dir: PathBuf,
}

impl ScriptHost for HostCtx<'_> {
    fn write(&mut self, bytes: &[u8]) {
        self.core.terminal.feed_bytes(bytes);
        if self.core.backlog.is_empty() {
            let taken = self.plane.enqueue_output(self.core.line, bytes);
            if taken < bytes.len() {
                self.core.backlog.extend_from_slice(&bytes[taken..]);
            }
        } else {
            self.core.backlog.extend_from_slice(bytes);
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let b = self.plane.dequeue_input(self.core.line);
        if b.is_some() {
            self.core.last_input = Instant::now();
        }
        b
    }

    fn macro_value(&self, name: &str) -> Option<String> {
        let now = Local::now();
        let user = self.core.user.as_ref();
        let value = match name {
            "accesslevel" => user.map(|u| u.access_level.to_string()).unwrap_or_else(|| "0".into()),
            "userid" => user.map(|u| u.id.to_string()).unwrap_or_else(|| "0".into()),
            "registered" => if user.is_some() { "1".into() } else { "0".into() },
            "sysop" => {
                if user.map(|u| u.sysop).unwrap_or(false) {
                    "1".into()
                } else {
                    "0".into()
                }
            }
            "keys" => user.map(|u| u.key_string()).unwrap_or_default(),
            "hour" => now.hour().to_string(),
            "minute" => now.minute().to_string(),
            // 0 = Sunday.
            "dayofweek" => now.weekday().num_days_from_sunday().to_string(),
            "day" => now.day().to_string(),
            "month" => now.month().to_string(),
            "year" => now.year().to_string(),
            "line" => self.core.line.to_string(),
            "ansi" => if self.core.ansi { "1".into() } else { "0".into() },
            "messagebaseid" | "messagebasename" => {
                user.map(|u| u.msg_base.clone()).unwrap_or_default()
            }
            "messagebaseareaid" => user.map(|u| u.msg_area.clone()).unwrap_or_default(),
            "messagebaseareaname" => {
                let tag = user.map(|u| u.msg_area.clone()).unwrap_or_default();
                self.storage
                    .message_area(&tag)
                    .map(|a| a.name.clone())
                    .unwrap_or(tag)
            }
            "filebaseid" | "filebasename" => {
                user.map(|u| u.file_base.clone()).unwrap_or_default()
            }
            "filebaseareaid" => user.map(|u| u.file_area.clone()).unwrap_or_default(),
            "filebaseareaname" => {
                let tag = user.map(|u| u.file_area.clone()).unwrap_or_default();
                self.storage
                    .file_area(&tag)
                    .map(|a| a.name.clone())
                    .unwrap_or(tag)
            }
            _ => return None,
        };
        Some(value)
    }

    fn screen_height(&self) -> usize {
        self.core
            .user
            .as_ref()
            .map(|u| u.screen_height as usize)
            .unwrap_or(self.config.bbs.screen_height as usize)
            .max(4)
    }

    fn paging_enabled(&self) -> bool {
        self.core.user.as_ref().map(|u| u.paging).unwrap_or(true)
    }

    fn has_key(&self, key: char) -> bool {
        self.core.user.as_ref().map(|u| u.has_key(key)).unwrap_or(false)
    }

    fn random(&mut self, lo: i64, hi: i64) -> i64 {
        use rand::Rng;
        rand::thread_rng().gen_range(lo..=hi)
    }

    fn script_source(&self, name: &str) -> Result<String, ScriptError> {
        let safe = safe_filename(name);
        let path = PathBuf::from(&self.config.script.dir).join(format!("{}.bbs", safe));
        std::fs::read_to_string(&path).map_err(|_| ScriptError::NotFound(name.to_string()))
    }

    fn art(&mut self, name: &str) -> Option<Vec<u8>> {
        let safe = safe_filename(name);
        let path = PathBuf::from(&self.config.script.dir).join(&safe);
        std::fs::read(path).ok()
    }

    fn authenticate(&mut self, username: &str, password: &str) -> (AuthOutcome, Option<UserRecord>) {
        let (outcome, user) = self.storage.authenticate(username, password);
        if outcome != AuthOutcome::Success {
            self.core.auth_failures += 1;
            warn!(
                target: "security",
                "line {}: failed logon for '{}' ({:?}, strike {})",
                self.core.line,
                escape_log(username),
                outcome,
                self.core.auth_failures
            );
            if self.core.auth_failures >= 3 {
                self.core.hangup_requested = true;
            }
        }
        (outcome, user)
    }

    fn bind_user(&mut self, mut user: UserRecord) {
        user.call_count += 1;
        user.last_login = Some(Utc::now());
        if let Err(e) = self.storage.update_user(user.clone()) {
            warn!("line {}: user update failed: {e:#}", self.core.line);
        }
        info!(
            "line {}: user '{}' bound",
            self.core.line,
            escape_log(&user.username)
        );
        let _ = self.events.send(UiEvent::LineUserBound {
            line: self.core.line,
            real_name: user.real_name.clone(),
        });
        self.core.user = Some(user);
        self.core.state = LineState::Authenticated;
        self.core.auth_failures = 0;
    }

    fn username_taken(&self, name: &str) -> bool {
        self.storage.user_by_name(name).is_some()
    }

    fn register_user(
        &mut self,
        username: &str,
        password: &str,
        real_name: &str,
        contact: &str,
    ) -> Result<UserRecord, String> {
        self.storage
            .add_user(username, password, real_name, contact)
            .map_err(|e| e.to_string())
    }

    fn online_list(&self) -> Vec<(usize, String, String)> {
        self.online.to_vec()
    }

    fn set_activity(&mut self, text: &str) {
        self.core.activity = clamp_activity(text);
        let _ = self.events.send(UiEvent::LineActivity {
            line: self.core.line,
            text: self.core.activity.clone(),
        });
    }

    fn begin_send_file(&mut self, id: u32, protocol: Protocol) -> Result<(), String> {
        let record = self
            .storage
            .file(id)
            .filter(|f| !f.deleted)
            .ok_or_else(|| format!("no such file {}", id))?;
        let path = self.storage.file_payload_path(id).map_err(|e| e.to_string())?;
        let file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
        let now = Instant::now();
        let mtime = record.uploaded.timestamp().max(0) as u64;
        let transfer = match protocol {
            Protocol::Xmodem | Protocol::XmodemCrc => {
                ActiveTransfer::XmodemSend(XmodemSender::new(file, record.size, false, now))
            }
            Protocol::Xmodem1k => {
                ActiveTransfer::XmodemSend(XmodemSender::new(file, record.size, true, now))
            }
            Protocol::Ymodem | Protocol::YmodemG => ActiveTransfer::YmodemSend(YmodemSender::new(
                vec![YmodemFile { file, name: record.name.clone(), size: record.size, mtime }],
                now,
            )),
            Protocol::Zmodem => ActiveTransfer::ZmodemSend(ZmodemSender::new(
                file,
                &record.name,
                record.size,
                mtime,
                now,
            )),
        };
        self.storage.bump_downloads(id).map_err(|e| e.to_string())?;
        if let Some(user) = &mut self.core.user {
            user.downloads += 1;
            let _ = self.storage.update_user(user.clone());
        }
        self.start_transfer(transfer);
        Ok(())
    }

    fn begin_receive_file(&mut self, name: Option<&str>, protocol: Protocol) -> Result<(), String> {
        std::fs::create_dir_all(&self.upload_dir).map_err(|e| e.to_string())?;
        let now = Instant::now();
        let transfer = match protocol {
            Protocol::Xmodem | Protocol::XmodemCrc | Protocol::Xmodem1k => {
                let name = safe_filename(name.unwrap_or("upload.dat"));
                let dest = self.upload_dir.join(&name);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&dest)
                    .map_err(|e| e.to_string())?;
                ActiveTransfer::XmodemRecv {
                    inner: XmodemReceiver::new(file, CheckMode::Crc, false, now),
                    dest,
                    name,
                }
            }
            Protocol::Ymodem => {
                ActiveTransfer::YmodemRecv(YmodemReceiver::new(&self.upload_dir, false, now))
            }
            Protocol::YmodemG => {
                ActiveTransfer::YmodemRecv(YmodemReceiver::new(&self.upload_dir, true, now))
            }
            Protocol::Zmodem => {
                ActiveTransfer::ZmodemRecv(ZmodemReceiver::new(&self.upload_dir, now))
            }
        };
        self.start_transfer(transfer);
        Ok(())
    }

    fn send_mail(&mut self, to: &str, subject: &str, body: &str) -> Result<(), String> {
        let recipient = self
            .storage
            .user_by_name(to)
            .ok_or_else(|| format!("no such user '{}'", to))?;
        let from_name = self
            .core
            .bound_user_name()
            .unwrap_or("Guest")
            .to_string();
        let record = MessageRecord {
            id: 0,
            base: String::new(),
            area: String::new(),
            kind: MessageKind::Local,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: subject.to_string(),
            from_name,
            to_name: recipient.username.clone(),
            sender_id: self.core.user.as_ref().map(|u| u.id),
            orig: None,
            dest: None,
            imported: Utc::now(),
            sent: Some(Utc::now()),
            read_at: None,
            read_count: 0,
            body_len: 0,
            exported: true, // local mail never leaves
            flags: msgflags::PRIVATE,
        };
        self.storage
            .store_message(record, body.as_bytes())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn send_netmail(&mut self, addr: &str, to: &str, subject: &str, body: &str) -> Result<(), String> {
        let dest: FtnAddress = addr.parse().map_err(|_| format!("bad address '{}'", addr))?;
        if !self.config.ftn.enabled {
            return Err("FTN mail is not enabled".to_string());
        }
        let from_name = self.core.bound_user_name().unwrap_or("Guest").to_string();
        let record = MessageRecord {
            id: 0,
            base: String::new(),
            area: String::new(),
            kind: MessageKind::Net,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: subject.to_string(),
            from_name,
            to_name: to.to_string(),
            sender_id: self.core.user.as_ref().map(|u| u.id),
            orig: self.config.primary_aka(),
            dest: Some(dest),
            imported: Utc::now(),
            sent: Some(Utc::now()),
            read_at: None,
            read_count: 0,
            body_len: 0,
            exported: false, // the scanner routes it
            flags: msgflags::PRIVATE,
        };
        self.storage
            .store_message(record, body.as_bytes())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn login_scan(&mut self) -> Vec<(String, usize)> {
        let Some(user) = self.core.user.clone() else {
            return Vec::new();
        };
        let since = user.last_scan;
        let mut rows = Vec::new();
        for area in self.storage.message_areas() {
            if area.read_level > user.access_level {
                continue;
            }
            let count = self.storage.messages_since(&area.tag, since);
            if count > 0 {
                rows.push((area.tag.clone(), count));
            }
        }
        for area in self.storage.file_areas() {
            if area.read_level > user.access_level {
                continue;
            }
            let count = self.storage.files_since(&area.tag, since);
            if count > 0 {
                rows.push((format!("{} (files)", area.tag), count));
            }
        }
        let mut updated = user;
        updated.last_scan = Some(Utc::now());
        if let Err(e) = self.storage.update_user(updated.clone()) {
            warn!("line {}: last-scan update failed: {e:#}", self.core.line);
        }
        self.core.user = Some(updated);
        rows
    }

    fn message_areas(&self) -> Vec<(String, String)> {
        let level = self.core.user.as_ref().map(|u| u.access_level).unwrap_or(0);
        self.storage
            .message_areas()
            .iter()
            .filter(|a| a.read_level <= level)
            .map(|a| (a.tag.clone(), a.name.clone()))
            .collect()
    }

    fn file_areas(&self) -> Vec<(String, String)> {
        let level = self.core.user.as_ref().map(|u| u.access_level).unwrap_or(0);
        self.storage
            .file_areas()
            .iter()
            .filter(|a| a.read_level <= level)
            .map(|a| (a.tag.clone(), a.name.clone()))
            .collect()
    }

    fn select_message_area(&mut self, tag: &str) -> bool {
        let Some(area) = self.storage.message_area(tag).cloned() else {
            return false;
        };
        if let Some(user) = &mut self.core.user {
            user.msg_base = area.base.clone();
            user.msg_area = area.tag.clone();
            let _ = self.storage.update_user(user.clone());
        }
        true
    }

    fn select_file_area(&mut self, tag: &str) -> bool {
        let Some(area) = self.storage.file_area(tag).cloned() else {
            return false;
        };
        if let Some(user) = &mut self.core.user {
            user.file_base = area.base.clone();
            user.file_area = area.tag.clone();
            let _ = self.storage.update_user(user.clone());
        }
        true
    }

    fn ansi_detected(&mut self, enabled: bool) {
        self.core.ansi = enabled;
    }
}

impl HostCtx<'_> {
    fn start_transfer(&mut self, transfer: ActiveTransfer) {
        self.core.transfer = Some(transfer);
        self.core.transfer_active = true;
        let _ = self.events.send(UiEvent::TransferActive {
            line: self.core.line,
            active: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut s = Session::new(3);
        assert_eq!(s.core.state, LineState::Disconnected);
        s.connect("203.0.113.9", Instant::now());
        assert_eq!(s.core.state, LineState::Prelogon);
        assert_eq!(s.core.peer, "203.0.113.9");
        s.disconnect();
        assert_eq!(s.core.state, LineState::Disconnected);
        assert!(s.core.user.is_none());
        assert!(s.core.activity.is_empty());
    }

    #[test]
    fn backlog_respects_pipe_capacity() {
        let plane = PipePlane::new(1);
        let mut s = Session::new(0);
        // Fill the pipe, then stash a backlog by hand.
        let big = vec![0u8; crate::pipe::PIPE_CAPACITY];
        assert_eq!(plane.enqueue_output(0, &big), big.len());
        s.core.backlog.extend_from_slice(b"stuck");
        assert!(!s.pump_backlog(&plane));
        // Drain some output; the backlog then flushes.
        let mut sink = vec![0u8; 64];
        plane.read_output(0, &mut sink);
        assert!(s.pump_backlog(&plane));
    }
}

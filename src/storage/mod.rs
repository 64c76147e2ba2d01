//! Persistent object store.
//!
//! A plain-filesystem database with no server process. Each object set
//! (users, messages, files) keeps a **registry** (one JSON file holding the
//! whole record array), an **index** (a plain next-id counter file), and a
//! **payload tree** where message bodies and file blobs live, grouped sixty
//! objects per subdirectory.
//!
//! Mutations follow one rule: read everything, change the one record, write
//! a temp file, rename over the live file. The rename is the atomicity
//! primitive; readers see the pre- or post-mutation registry, never a mix.
//! An exclusive `fs2` lock serialises writers.
//!
//! User credentials are stored under a reversible per-record XOR mask. That
//! is obfuscation at rest, not cryptography; anyone holding the registry
//! file can invert it.
//!
//! On-disk layout under the configured root:
//!
//! ```text
//! Resources/Data/{UserDB, UserIDX, MsgDB, MsgIDX, FileDB, FileIDX, CallCount}
//! MsgBases/<base>/AreaDB            ← area registry
//! MsgBases/<base>/<group>/<id>      ← message bodies
//! FileBases/<base>/AreaDB
//! FileBases/<base>/<group>/<id>     ← file payloads
//! Logs/{System, Calls, Line_<n>, FTN}
//! FTN/Inbound/<domain>/<zone>/{Temp, Processed, Bad}
//! FTN/Outbound/<domain>/<zone>/
//! FTN/Nodelists/<network>/
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::AreaConfig;
use crate::ftn::addr::FtnAddress;
use crate::validation::validate_username;

/// Objects per payload subdirectory, a bound inherited from filesystems
/// with small per-directory limits.
const GROUP_SIZE: u32 = 60;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u32,
    pub username: String,
    pub real_name: String,
    pub contact: String,
    /// XOR-masked password, hex-encoded.
    pub secret: String,
    pub access_level: u8,
    /// 26-slot access-key bitmap, bit 0 = key A.
    pub keys: u32,
    pub sysop: bool,
    pub locked: bool,
    // Selection history.
    pub msg_base: String,
    pub msg_area: String,
    pub file_base: String,
    pub file_area: String,
    // Statistics.
    pub call_count: u32,
    pub last_scan: Option<DateTime<Utc>>,
    pub uploads: u32,
    pub downloads: u32,
    pub created: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    // Preferences consulted by the pager.
    pub screen_height: u8,
    pub paging: bool,
}

impl UserRecord {
    pub fn has_key(&self, key: char) -> bool {
        let k = key.to_ascii_uppercase();
        if !k.is_ascii_uppercase() {
            return false;
        }
        self.keys & (1 << (k as u8 - b'A')) != 0
    }

    pub fn grant_key(&mut self, key: char) {
        let k = key.to_ascii_uppercase();
        if k.is_ascii_uppercase() {
            self.keys |= 1 << (k as u8 - b'A');
        }
    }

    /// Key bitmap as a display string, e.g. `"ACZ"`.
    pub fn key_string(&self) -> String {
        (b'A'..=b'Z')
            .filter(|&k| self.keys & (1 << (k - b'A')) != 0)
            .map(|k| k as char)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthOutcome {
    Success,
    NoUser,
    BadPassword,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Local,
    Echo,
    Net,
}

/// Routing flag bits carried by a message.
pub mod msgflags {
    pub const PRIVATE: u16 = 0x0001;
    pub const CRASH: u16 = 0x0002;
    pub const HOLD: u16 = 0x0004;
    pub const DIRECT: u16 = 0x0008;
    pub const IMMEDIATE: u16 = 0x0010;
    pub const KILLSENT: u16 = 0x0020;
    pub const FILE_ATTACH: u16 = 0x0040;
    pub const FILE_REQUEST: u16 = 0x0080;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: u32,
    pub base: String,
    /// Area tag within the base.
    pub area: String,
    pub kind: MessageKind,
    pub deleted: bool,
    pub access_level: u8,
    pub keys: u32,
    pub subject: String,
    pub from_name: String,
    pub to_name: String,
    /// Local author, when the message originated here.
    pub sender_id: Option<u32>,
    pub orig: Option<FtnAddress>,
    pub dest: Option<FtnAddress>,
    pub imported: DateTime<Utc>,
    pub sent: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub read_count: u32,
    pub body_len: u64,
    pub exported: bool,
    pub flags: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u32,
    pub base: String,
    pub area: String,
    pub deleted: bool,
    pub access_level: u8,
    pub keys: u32,
    pub name: String,
    pub description: String,
    pub uploader: Option<u32>,
    pub uploaded: DateTime<Utc>,
    pub size: u64,
    pub downloads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaRecord {
    pub tag: String,
    pub name: String,
    pub base: String,
    pub groups: Vec<String>,
    pub read_level: u8,
    pub post_level: u8,
}

// ---------------------------------------------------------------------------
// Credential masking
// ---------------------------------------------------------------------------

/// Reversible XOR mask keyed by the record id. xorshift32 keystream; the
/// seed mixes the id so two users with the same password differ at rest.
pub fn mask_secret(id: u32, secret: &[u8]) -> Vec<u8> {
    let mut state = id.wrapping_mul(2_654_435_761) | 1;
    secret
        .iter()
        .map(|&b| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            b ^ (state & 0xFF) as u8
        })
        .collect()
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub struct Storage {
    root: PathBuf,
    users: Vec<UserRecord>,
    messages: Vec<MessageRecord>,
    files: Vec<FileRecord>,
    msg_areas: Vec<AreaRecord>,
    file_areas: Vec<AreaRecord>,
    next_user_id: u32,
    next_msg_id: u32,
    next_file_id: u32,
    call_count: u64,
}

impl Storage {
    /// Open (creating if needed) the store under `root`, seeding area
    /// registries from the configured area lists.
    pub fn open(root: &Path, msg_areas: &[AreaConfig], file_areas: &[AreaConfig]) -> Result<Self> {
        let data = root.join("Resources/Data");
        fs::create_dir_all(&data)?;
        fs::create_dir_all(root.join("Logs"))?;
        fs::create_dir_all(root.join("MsgBases"))?;
        fs::create_dir_all(root.join("FileBases"))?;

        let mut storage = Storage {
            root: root.to_path_buf(),
            users: read_registry(&data.join("UserDB"))?,
            messages: read_registry(&data.join("MsgDB"))?,
            files: read_registry(&data.join("FileDB"))?,
            msg_areas: Vec::new(),
            file_areas: Vec::new(),
            next_user_id: read_counter(&data.join("UserIDX"), 1)?,
            next_msg_id: read_counter(&data.join("MsgIDX"), 1)?,
            next_file_id: read_counter(&data.join("FileIDX"), 1)?,
            call_count: read_counter(&data.join("CallCount"), 0)? as u64,
        };
        storage.sync_areas("MsgBases", msg_areas)?;
        storage.sync_areas("FileBases", file_areas)?;
        storage.msg_areas = storage.load_areas("MsgBases")?;
        storage.file_areas = storage.load_areas("FileBases")?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join("Resources/Data").join(name)
    }

    fn sync_areas(&self, tree: &str, configured: &[AreaConfig]) -> Result<()> {
        use std::collections::HashMap;
        let mut by_base: HashMap<&str, Vec<AreaRecord>> = HashMap::new();
        for a in configured {
            by_base.entry(a.base.as_str()).or_default().push(AreaRecord {
                tag: a.tag.to_ascii_uppercase(),
                name: a.name.clone(),
                base: a.base.clone(),
                groups: a.groups.clone(),
                read_level: a.read_level,
                post_level: a.post_level,
            });
        }
        for (base, areas) in by_base {
            let dir = self.root.join(tree).join(base);
            fs::create_dir_all(&dir)?;
            write_file_atomic(&dir.join("AreaDB"), serde_json::to_string_pretty(&areas)?.as_bytes())?;
        }
        Ok(())
    }

    fn load_areas(&self, tree: &str) -> Result<Vec<AreaRecord>> {
        let mut out = Vec::new();
        let dir = self.root.join(tree);
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let areadb = entry.path().join("AreaDB");
            if !areadb.exists() {
                continue;
            }
            let areas: Vec<AreaRecord> = read_registry(&areadb)?;
            out.extend(areas);
        }
        out.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(out)
    }

    // --- users ----------------------------------------------------------

    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    pub fn user_by_id(&self, id: u32) -> Option<UserRecord> {
        self.users.iter().find(|u| u.id == id).cloned()
    }

    /// Case-insensitive username lookup.
    pub fn user_by_name(&self, name: &str) -> Option<UserRecord> {
        self.users
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn add_user(
        &mut self,
        username: &str,
        password: &str,
        real_name: &str,
        contact: &str,
    ) -> Result<UserRecord> {
        let username = validate_username(username).map_err(|e| anyhow!("{e}"))?;
        if self.user_by_name(&username).is_some() {
            return Err(anyhow!("username '{}' is already taken", username));
        }
        let id = self.next_user_id;
        let user = UserRecord {
            id,
            username,
            real_name: real_name.to_string(),
            contact: contact.to_string(),
            secret: hex_encode(&mask_secret(id, password.as_bytes())),
            access_level: 10,
            keys: 0,
            sysop: false,
            locked: false,
            msg_base: String::new(),
            msg_area: String::new(),
            file_base: String::new(),
            file_area: String::new(),
            call_count: 0,
            last_scan: None,
            uploads: 0,
            downloads: 0,
            created: Utc::now(),
            last_login: None,
            screen_height: 24,
            paging: true,
        };
        self.users.push(user.clone());
        self.next_user_id += 1;
        self.persist_users()?;
        write_counter(&self.data_path("UserIDX"), self.next_user_id)?;
        Ok(user)
    }

    pub fn update_user(&mut self, record: UserRecord) -> Result<()> {
        let slot = self
            .users
            .iter_mut()
            .find(|u| u.id == record.id)
            .ok_or_else(|| anyhow!("no user record {}", record.id))?;
        *slot = record;
        self.persist_users()
    }

    pub fn set_password(&mut self, id: u32, password: &str) -> Result<()> {
        let masked = hex_encode(&mask_secret(id, password.as_bytes()));
        let slot = self
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| anyhow!("no user record {}", id))?;
        slot.secret = masked;
        self.persist_users()
    }

    /// Check credentials. The stored mask is inverted and compared; the
    /// distinct outcomes feed the script failure paths and the security
    /// log.
    pub fn authenticate(&self, username: &str, password: &str) -> (AuthOutcome, Option<UserRecord>) {
        let user = match self.user_by_name(username) {
            Some(u) => u,
            None => return (AuthOutcome::NoUser, None),
        };
        if user.locked {
            return (AuthOutcome::Locked, None);
        }
        let stored = hex_decode(&user.secret)
            .map(|masked| mask_secret(user.id, &masked))
            .unwrap_or_default();
        if stored == password.as_bytes() {
            (AuthOutcome::Success, Some(user))
        } else {
            (AuthOutcome::BadPassword, None)
        }
    }

    fn persist_users(&self) -> Result<()> {
        write_file_atomic(
            &self.data_path("UserDB"),
            serde_json::to_string_pretty(&self.users)?.as_bytes(),
        )
    }

    // --- areas ----------------------------------------------------------

    pub fn message_areas(&self) -> &[AreaRecord] {
        &self.msg_areas
    }

    pub fn file_areas(&self) -> &[AreaRecord] {
        &self.file_areas
    }

    pub fn message_area(&self, tag: &str) -> Option<&AreaRecord> {
        self.msg_areas.iter().find(|a| a.tag.eq_ignore_ascii_case(tag))
    }

    pub fn file_area(&self, tag: &str) -> Option<&AreaRecord> {
        self.file_areas.iter().find(|a| a.tag.eq_ignore_ascii_case(tag))
    }

    // --- messages -------------------------------------------------------

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn message(&self, id: u32) -> Option<MessageRecord> {
        self.messages.iter().find(|m| m.id == id).cloned()
    }

    fn body_path(&self, base: &str, id: u32) -> PathBuf {
        self.root
            .join("MsgBases")
            .join(base)
            .join(format!("{:04}", id / GROUP_SIZE))
            .join(id.to_string())
    }

    fn payload_path(&self, base: &str, id: u32) -> PathBuf {
        self.root
            .join("FileBases")
            .join(base)
            .join(format!("{:04}", id / GROUP_SIZE))
            .join(id.to_string())
    }

    /// Store a message and its body; assigns and returns the new id.
    pub fn store_message(&mut self, mut record: MessageRecord, body: &[u8]) -> Result<u32> {
        let id = self.next_msg_id;
        record.id = id;
        record.body_len = body.len() as u64;
        let path = self.body_path(&record.base, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_file_atomic(&path, body)?;
        self.messages.push(record);
        self.next_msg_id += 1;
        self.persist_messages()?;
        write_counter(&self.data_path("MsgIDX"), self.next_msg_id)?;
        Ok(id)
    }

    pub fn message_body(&self, id: u32) -> Result<Vec<u8>> {
        let record = self.message(id).ok_or_else(|| anyhow!("no message {}", id))?;
        let mut body = Vec::new();
        File::open(self.body_path(&record.base, id))
            .with_context(|| format!("message {} body missing", id))?
            .read_to_end(&mut body)?;
        Ok(body)
    }

    /// Random-access read of a message body.
    pub fn message_block(&self, id: u32, offset: u64, len: usize) -> Result<Vec<u8>> {
        let record = self.message(id).ok_or_else(|| anyhow!("no message {}", id))?;
        let mut f = File::open(self.body_path(&record.base, id))?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let n = f.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn mark_exported(&mut self, id: u32) -> Result<()> {
        let slot = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| anyhow!("no message {}", id))?;
        slot.exported = true;
        self.persist_messages()
    }

    /// Soft-delete. Deleted messages are never visible to the scanner, so
    /// the exported flag is forced on at the same time.
    pub fn delete_message(&mut self, id: u32) -> Result<()> {
        let slot = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| anyhow!("no message {}", id))?;
        slot.deleted = true;
        slot.exported = true;
        self.persist_messages()
    }

    /// Messages the scanner still has to export.
    pub fn find_unexported(&self) -> Vec<MessageRecord> {
        self.messages
            .iter()
            .filter(|m| !m.exported && !m.deleted)
            .cloned()
            .collect()
    }

    /// Count of messages in `area` imported after `since` (login scan).
    pub fn messages_since(&self, area: &str, since: Option<DateTime<Utc>>) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.deleted && m.area.eq_ignore_ascii_case(area))
            .filter(|m| since.map(|t| m.imported > t).unwrap_or(true))
            .count()
    }

    pub fn bump_read_count(&mut self, id: u32) -> Result<()> {
        if let Some(slot) = self.messages.iter_mut().find(|m| m.id == id) {
            slot.read_count += 1;
            slot.read_at = Some(Utc::now());
            self.persist_messages()?;
        }
        Ok(())
    }

    fn persist_messages(&self) -> Result<()> {
        write_file_atomic(
            &self.data_path("MsgDB"),
            serde_json::to_string_pretty(&self.messages)?.as_bytes(),
        )
    }

    // --- files ----------------------------------------------------------

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    /// Look up a file record. A record whose payload blob has gone missing
    /// is reported as deleted.
    pub fn file(&self, id: u32) -> Option<FileRecord> {
        self.files.iter().find(|f| f.id == id).cloned().map(|mut rec| {
            if !rec.deleted && !self.payload_path(&rec.base, rec.id).exists() {
                warn!("file {} payload missing; treating as deleted", rec.id);
                rec.deleted = true;
            }
            rec
        })
    }

    pub fn file_by_name(&self, area: &str, name: &str) -> Option<FileRecord> {
        self.files
            .iter()
            .filter(|f| !f.deleted && f.area.eq_ignore_ascii_case(area))
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Begin an incremental upload; blocks are appended with
    /// [`UploadHandle::write_block`] and the record lands on
    /// [`Storage::upload_end`].
    pub fn upload_begin(&mut self, base: &str) -> Result<UploadHandle> {
        let id = self.next_file_id;
        let path = self.payload_path(base, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("part");
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        Ok(UploadHandle { id, tmp, dest: path, file, written: 0 })
    }

    pub fn upload_end(&mut self, handle: UploadHandle, mut record: FileRecord) -> Result<u32> {
        handle.file.sync_all()?;
        fs::rename(&handle.tmp, &handle.dest)?;
        record.id = handle.id;
        record.size = handle.written;
        self.files.push(record);
        self.next_file_id += 1;
        self.persist_files()?;
        write_counter(&self.data_path("FileIDX"), self.next_file_id)?;
        Ok(handle.id)
    }

    /// Abort an upload, removing the partial blob.
    pub fn upload_abort(&mut self, handle: UploadHandle) {
        let _ = fs::remove_file(&handle.tmp);
    }

    /// Store a complete payload in one call.
    pub fn add_file(&mut self, record: FileRecord, payload: &[u8]) -> Result<u32> {
        let mut handle = self.upload_begin(&record.base)?;
        handle.write_block(payload)?;
        self.upload_end(handle, record)
    }

    pub fn file_payload_path(&self, id: u32) -> Result<PathBuf> {
        let record = self
            .files
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| anyhow!("no file {}", id))?;
        Ok(self.payload_path(&record.base, id))
    }

    /// Random-access read of a file payload.
    pub fn download_block(&self, id: u32, offset: u64, len: usize) -> Result<Vec<u8>> {
        let path = self.file_payload_path(id)?;
        let mut f = File::open(&path)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let n = f.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn bump_downloads(&mut self, id: u32) -> Result<()> {
        if let Some(slot) = self.files.iter_mut().find(|f| f.id == id) {
            slot.downloads += 1;
            self.persist_files()?;
        }
        Ok(())
    }

    pub fn files_since(&self, area: &str, since: Option<DateTime<Utc>>) -> usize {
        self.files
            .iter()
            .filter(|f| !f.deleted && f.area.eq_ignore_ascii_case(area))
            .filter(|f| since.map(|t| f.uploaded > t).unwrap_or(true))
            .count()
    }

    fn persist_files(&self) -> Result<()> {
        write_file_atomic(
            &self.data_path("FileDB"),
            serde_json::to_string_pretty(&self.files)?.as_bytes(),
        )
    }

    // --- call counter and logs -----------------------------------------

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn increment_call_count(&mut self) -> Result<u64> {
        self.call_count += 1;
        write_counter(&self.data_path("CallCount"), self.call_count as u32)?;
        Ok(self.call_count)
    }

    /// Append one line to a log under `Logs/`.
    pub fn append_log(&self, name: &str, line: &str) -> Result<()> {
        let path = self.root.join("Logs").join(name);
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    // --- FTN spool directories -----------------------------------------

    pub fn inbound_dir(&self, domain: &str, zone: u16) -> PathBuf {
        self.root
            .join("FTN/Inbound")
            .join(domain)
            .join(zone.to_string())
    }

    pub fn outbound_dir(&self, domain: &str, zone: u16) -> PathBuf {
        self.root
            .join("FTN/Outbound")
            .join(domain)
            .join(zone.to_string())
    }

    pub fn nodelist_dir(&self, network: &str) -> PathBuf {
        self.root.join("FTN/Nodelists").join(network)
    }
}

/// In-flight incremental upload.
pub struct UploadHandle {
    pub id: u32,
    tmp: PathBuf,
    dest: PathBuf,
    file: File,
    written: u64,
}

impl UploadHandle {
    pub fn write_block(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Atomic file primitives
// ---------------------------------------------------------------------------

fn read_registry<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    match fs::read_to_string(path) {
        Ok(data) => {
            let cleaned = data.trim_start_matches('\0');
            serde_json::from_str(cleaned)
                .with_context(|| format!("corrupt registry {}", path.display()))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(anyhow!("failed reading {}: {}", path.display(), e)),
    }
}

fn read_counter(path: &Path, default: u32) -> Result<u32> {
    match fs::read_to_string(path) {
        Ok(data) => data
            .trim()
            .parse()
            .with_context(|| format!("corrupt counter {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(default),
        Err(e) => Err(anyhow!("failed reading {}: {}", path.display(), e)),
    }
}

fn write_counter(path: &Path, value: u32) -> Result<()> {
    write_file_atomic(path, value.to_string().as_bytes())
}

/// Replace `path` atomically: the new content lands in a `NamedTempFile`
/// beside it and a rename swaps it in, so readers only ever observe whole
/// versions. An exclusive lock on the destination serialises writers; on
/// any failure before the swap the temp file cleans itself up on drop.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path.file_name().and_then(|s| s.to_str()).unwrap_or("registry");
    let writer_lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    writer_lock.lock_exclusive()?;

    let swap_in = || -> Result<()> {
        let mut staged = tempfile::Builder::new()
            .prefix(&format!(".{}.", stem))
            .suffix(".swap")
            .tempfile_in(dir)
            .with_context(|| format!("staging a replacement for {}", path.display()))?;
        staged.write_all(content)?;
        staged.as_file().sync_all()?;
        staged
            .persist(path)
            .map_err(|e| anyhow!("swapping {} into place: {}", path.display(), e.error))?;
        // Persist the rename itself (best effort).
        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }
        Ok(())
    };
    let outcome = swap_in();
    drop(writer_lock);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(tag: &str, base: &str) -> AreaConfig {
        AreaConfig {
            tag: tag.into(),
            name: tag.into(),
            base: base.into(),
            groups: vec![],
            read_level: 0,
            post_level: 0,
        }
    }

    fn open_store(dir: &Path) -> Storage {
        Storage::open(
            dir,
            &[area("TEST", "main"), area("CHAT", "main")],
            &[area("UTILS", "files")],
        )
        .unwrap()
    }

    #[test]
    fn mask_round_trips_any_bytes() {
        let secrets: &[&[u8]] = &[b"hunter2", b"", b"\x00\xFF\x18long passphrase here"];
        for s in secrets {
            for id in [1u32, 42, 0xFFFF_FFFF] {
                assert_eq!(mask_secret(id, &mask_secret(id, s)), *s);
            }
        }
        // Same password, different record: different mask.
        assert_ne!(mask_secret(1, b"same"), mask_secret(2, b"same"));
    }

    #[test]
    fn user_lifecycle_and_auth() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let user = store.add_user("Alice", "letmein99", "Alice Example", "alice@example").unwrap();
        assert_eq!(user.id, 1);
        // Stored secret is not the plaintext.
        assert!(!store.users()[0].secret.contains("letmein99"));

        assert_eq!(store.authenticate("alice", "letmein99").0, AuthOutcome::Success);
        assert_eq!(store.authenticate("ALICE", "wrong").0, AuthOutcome::BadPassword);
        assert_eq!(store.authenticate("bob", "x").0, AuthOutcome::NoUser);

        let mut rec = store.user_by_name("Alice").unwrap();
        rec.locked = true;
        store.update_user(rec).unwrap();
        assert_eq!(store.authenticate("alice", "letmein99").0, AuthOutcome::Locked);

        // Case-insensitive uniqueness.
        assert!(store.add_user("ALICE", "pw123456", "", "").is_err());

        // Survives a reopen.
        drop(store);
        let store = open_store(dir.path());
        assert!(store.user_by_name("alice").is_some());
        assert_eq!(store.users().len(), 1);
    }

    #[test]
    fn key_bitmap() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let mut user = store.add_user("keyuser", "pw123456", "", "").unwrap();
        assert!(!user.has_key('A'));
        user.grant_key('a');
        user.grant_key('Z');
        assert!(user.has_key('A') && user.has_key('z'));
        assert_eq!(user.key_string(), "AZ");
    }

    #[test]
    fn message_store_and_export_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let record = MessageRecord {
            id: 0,
            base: "main".into(),
            area: "TEST".into(),
            kind: MessageKind::Echo,
            deleted: false,
            access_level: 0,
            keys: 0,
            subject: "hi".into(),
            from_name: "alice".into(),
            to_name: "All".into(),
            sender_id: None,
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
        let id = store.store_message(record.clone(), b"hello body").unwrap();
        assert_eq!(store.message_body(id).unwrap(), b"hello body");
        assert_eq!(store.message_block(id, 6, 4).unwrap(), b"body");
        assert_eq!(store.find_unexported().len(), 1);

        store.mark_exported(id).unwrap();
        assert!(store.find_unexported().is_empty());

        // Deleting forces exported so scanners never see the pair
        // (deleted, unexported).
        let id2 = store.store_message(record, b"x").unwrap();
        store.delete_message(id2).unwrap();
        let m = store.message(id2).unwrap();
        assert!(m.deleted && m.exported);
        assert!(store.find_unexported().is_empty());
    }

    #[test]
    fn payload_grouping_sixty_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let p = store.body_path("main", 59);
        assert!(p.to_string_lossy().contains("0000"));
        let p = store.body_path("main", 60);
        assert!(p.to_string_lossy().contains("0001"));
        let p = store.body_path("main", 185);
        assert!(p.to_string_lossy().contains("0003"));
    }

    #[test]
    fn file_upload_and_missing_payload_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        let record = FileRecord {
            id: 0,
            base: "files".into(),
            area: "UTILS".into(),
            deleted: false,
            access_level: 0,
            keys: 0,
            name: "tool.zip".into(),
            description: "a tool".into(),
            uploader: None,
            uploaded: Utc::now(),
            size: 0,
            downloads: 0,
        };
        let id = store.add_file(record, b"PAYLOAD").unwrap();
        let rec = store.file(id).unwrap();
        assert!(!rec.deleted);
        assert_eq!(rec.size, 7);
        assert_eq!(store.download_block(id, 3, 4).unwrap(), b"LOAD");
        assert!(store.file_by_name("utils", "TOOL.ZIP").is_some());

        // Remove the blob out from under the registry.
        fs::remove_file(store.file_payload_path(id).unwrap()).unwrap();
        assert!(store.file(id).unwrap().deleted);
    }

    #[test]
    fn counters_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_store(dir.path());
            store.increment_call_count().unwrap();
            store.increment_call_count().unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.call_count(), 2);
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg");
        write_file_atomic(&path, b"first version").unwrap();
        write_file_atomic(&path, b"v2").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"v2");
        // No staging artefacts remain; the target is the only entry.
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["reg".to_string()]);
    }
}

//! BinkP mailer sessions.
//!
//! A session is a TCP connection carrying two-byte-headed frames: bit 15
//! of the first byte separates commands from data, the low 15 bits are the
//! payload length. Authentication uses CRAM-MD5 when the answerer offers a
//! challenge and falls back to the plain link password otherwise. File
//! data streams without per-frame acknowledgement; M_GOT/M_SKIP/M_GET
//! carry the logical acknowledgements, and mutual M_EOB ends the session.
//!
//! The wire pump is split: a reader task parses frames and hands them to
//! the session logic over an mpsc channel, the logic interleaves its own
//! writes. Idle beyond 60 seconds aborts.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use md5::Md5;
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::addr::FtnAddress;
use crate::logutil::escape_log;
use crate::validation::{safe_filename, wildcard_match};

pub const DEFAULT_PORT: u16 = 24554;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_FRAME: usize = 0x7FFF;
const DATA_CHUNK: usize = 4096;

/// Command ids.
pub mod cmd {
    pub const M_NUL: u8 = 0;
    pub const M_ADR: u8 = 1;
    pub const M_PWD: u8 = 2;
    pub const M_FILE: u8 = 3;
    pub const M_OK: u8 = 4;
    pub const M_EOB: u8 = 5;
    pub const M_GOT: u8 = 6;
    pub const M_ERR: u8 = 7;
    pub const M_BSY: u8 = 8;
    pub const M_GET: u8 = 9;
    pub const M_SKIP: u8 = 10;
}

#[derive(Debug, Error)]
pub enum BinkpError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("remote busy: {0}")]
    Busy(String),
    #[error("session idle too long")]
    Idle,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command(u8, String),
    Data(Vec<u8>),
}

/// Incremental frame extractor.
#[derive(Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, BinkpError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let is_command = self.buf[0] & 0x80 != 0;
        let len = (((self.buf[0] & 0x7F) as usize) << 8) | self.buf[1] as usize;
        if self.buf.len() < 2 + len {
            return Ok(None);
        }
        self.buf.advance(2);
        let payload = self.buf.split_to(len);
        if is_command {
            if payload.is_empty() {
                return Err(BinkpError::Protocol("empty command frame".into()));
            }
            let id = payload[0];
            let args = String::from_utf8_lossy(&payload[1..]).into_owned();
            Ok(Some(Frame::Command(id, args)))
        } else {
            Ok(Some(Frame::Data(payload.to_vec())))
        }
    }
}

pub fn encode_command(id: u8, args: &str) -> Vec<u8> {
    let len = 1 + args.len();
    assert!(len <= MAX_FRAME);
    let mut out = Vec::with_capacity(2 + len);
    out.push(0x80 | (len >> 8) as u8);
    out.push(len as u8);
    out.push(id);
    out.extend_from_slice(args.as_bytes());
    out
}

pub fn encode_data(chunk: &[u8]) -> Vec<u8> {
    assert!(chunk.len() <= MAX_FRAME);
    let mut out = Vec::with_capacity(2 + chunk.len());
    out.push((chunk.len() >> 8) as u8);
    out.push(chunk.len() as u8);
    out.extend_from_slice(chunk);
    out
}

// ---------------------------------------------------------------------------
// CRAM-MD5
// ---------------------------------------------------------------------------

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// `CRAM-MD5-<digest>` response for a hex challenge string. Fails on a
/// malformed challenge or a password the MAC cannot key (an empty link
/// password in the config reaches here), so a bad configuration ends the
/// session instead of the mailer.
pub fn cram_response(password: &str, challenge_hex: &str) -> Result<String, BinkpError> {
    let challenge = unhex(challenge_hex)
        .ok_or_else(|| BinkpError::Auth("malformed CRAM-MD5 challenge".into()))?;
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .map_err(|_| BinkpError::Auth("link password unusable for CRAM-MD5".into()))?;
    mac.update(&challenge);
    Ok(format!("CRAM-MD5-{}", hex(&mac.finalize().into_bytes())))
}

pub fn make_challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

// ---------------------------------------------------------------------------
// Session setup
// ---------------------------------------------------------------------------

/// A file we offer to the remote.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mtime: u64,
}

/// Shared endpoint identity and behaviour for either side of a session.
pub struct Endpoint {
    pub akas: Vec<FtnAddress>,
    pub system_name: String,
    pub sysop: String,
    pub location: String,
    /// Where inbound files land.
    pub inbound_dir: PathBuf,
    /// Files to offer.
    pub files: Vec<OutboundFile>,
    /// Plain FREQ names to request (caller side).
    pub freqs: Vec<String>,
    /// FREQ service directory (answerer side); `None` refuses requests.
    pub freq_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct SessionOutcome {
    pub remote_akas: Vec<FtnAddress>,
    /// Names acknowledged with M_GOT by the remote.
    pub sent: Vec<String>,
    /// Names the remote refused.
    pub skipped: Vec<String>,
    /// Files received into the inbound directory.
    pub received: Vec<PathBuf>,
    pub secure: bool,
}

struct Receiving {
    file: File,
    path: PathBuf,
    name: String,
    size: u64,
    mtime: u64,
    got: u64,
}

struct Wire<W> {
    writer: W,
    rx: mpsc::UnboundedReceiver<Result<Frame, BinkpError>>,
}

impl<W: AsyncWrite + Unpin> Wire<W> {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), BinkpError> {
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn command(&mut self, id: u8, args: &str) -> Result<(), BinkpError> {
        debug!(target: "fidobbs::ftn", "binkp tx cmd {} '{}'", id, escape_log(args));
        self.send(encode_command(id, args)).await
    }

    /// Next frame, failing after the idle timeout.
    async fn recv(&mut self) -> Result<Frame, BinkpError> {
        match timeout(IDLE_TIMEOUT, self.rx.recv()).await {
            Err(_) => Err(BinkpError::Idle),
            Ok(None) => Err(BinkpError::Protocol("connection closed".into())),
            Ok(Some(frame)) => frame,
        }
    }

    fn try_recv(&mut self) -> Option<Result<Frame, BinkpError>> {
        self.rx.try_recv().ok()
    }
}

fn spawn_reader<R>(mut reader: R) -> mpsc::UnboundedReceiver<Result<Frame, BinkpError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut framer = Framer::default();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    framer.push(&buf[..n]);
                    loop {
                        match framer.next_frame() {
                            Ok(Some(frame)) => {
                                if tx.send(Ok(frame)).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                return;
                            }
                        }
                    }
                }
            }
        }
    });
    rx
}

fn greeting_nuls(endpoint: &Endpoint) -> Vec<(String, String)> {
    vec![
        ("SYS".into(), endpoint.system_name.clone()),
        ("ZYZ".into(), endpoint.sysop.clone()),
        ("LOC".into(), endpoint.location.clone()),
        ("NDL".into(), "115200,TCP,BINKP".into()),
        ("TIME".into(), chrono::Utc::now().to_rfc2822()),
        (
            "VER".into(),
            format!("fidobbs/{} binkp/1.0", env!("CARGO_PKG_VERSION")),
        ),
    ]
}

fn addr_list(akas: &[FtnAddress]) -> String {
    akas.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_addr_list(args: &str) -> Vec<FtnAddress> {
    args.split_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// Dial out: authenticate against the answerer and run the exchange.
pub async fn run_caller<S>(
    stream: S,
    endpoint: Endpoint,
    password: &str,
) -> Result<SessionOutcome, BinkpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let rx = spawn_reader(reader);
    let mut wire = Wire { writer, rx };
    let mut outcome = SessionOutcome::default();

    // Greeting: collect the answerer's NULs and address; note a CRAM
    // challenge when one is advertised.
    let mut challenge: Option<String> = None;
    loop {
        match wire.recv().await? {
            Frame::Command(cmd::M_NUL, args) => {
                if let Some(opt) = args.strip_prefix("OPT ") {
                    for token in opt.split_whitespace() {
                        if let Some(c) = token.strip_prefix("CRAM-MD5-") {
                            challenge = Some(c.to_string());
                        }
                    }
                }
            }
            Frame::Command(cmd::M_ADR, args) => {
                outcome.remote_akas = parse_addr_list(&args);
                break;
            }
            Frame::Command(cmd::M_ERR, args) => return Err(BinkpError::Remote(args)),
            Frame::Command(cmd::M_BSY, args) => return Err(BinkpError::Busy(args)),
            _ => {}
        }
    }

    for (name, value) in greeting_nuls(&endpoint) {
        wire.command(cmd::M_NUL, &format!("{} {}", name, value)).await?;
    }
    wire.command(cmd::M_ADR, &addr_list(&endpoint.akas)).await?;
    let pwd = match &challenge {
        Some(c) => cram_response(password, c)?,
        None => password.to_string(),
    };
    wire.command(cmd::M_PWD, &pwd).await?;

    loop {
        match wire.recv().await? {
            Frame::Command(cmd::M_OK, args) => {
                outcome.secure = args.contains("secure");
                break;
            }
            Frame::Command(cmd::M_NUL, _) => {}
            Frame::Command(cmd::M_ERR, args) => return Err(BinkpError::Auth(args)),
            Frame::Command(cmd::M_BSY, args) => return Err(BinkpError::Busy(args)),
            other => return Err(BinkpError::Protocol(format!("unexpected {:?}", other))),
        }
    }

    exchange(&mut wire, endpoint, &mut outcome).await?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Answerer
// ---------------------------------------------------------------------------

/// Answer one inbound connection. `links` maps remote addresses to their
/// session passwords; a caller presenting no known address is refused.
pub async fn run_answerer<S>(
    stream: S,
    endpoint: Endpoint,
    links: &[(FtnAddress, String)],
) -> Result<SessionOutcome, BinkpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let rx = spawn_reader(reader);
    let mut wire = Wire { writer, rx };
    let mut outcome = SessionOutcome::default();

    let challenge = make_challenge();
    wire.command(cmd::M_NUL, &format!("OPT CRAM-MD5-{}", challenge)).await?;
    for (name, value) in greeting_nuls(&endpoint) {
        wire.command(cmd::M_NUL, &format!("{} {}", name, value)).await?;
    }
    wire.command(cmd::M_ADR, &addr_list(&endpoint.akas)).await?;

    // WAIT_ADR then WAIT_PWD.
    loop {
        match wire.recv().await? {
            Frame::Command(cmd::M_ADR, args) => {
                outcome.remote_akas = parse_addr_list(&args);
                break;
            }
            Frame::Command(cmd::M_NUL, _) => {}
            Frame::Command(cmd::M_ERR, args) => return Err(BinkpError::Remote(args)),
            other => return Err(BinkpError::Protocol(format!("unexpected {:?}", other))),
        }
    }
    let presented = loop {
        match wire.recv().await? {
            Frame::Command(cmd::M_PWD, args) => break args,
            Frame::Command(cmd::M_NUL, _) => {}
            Frame::Command(cmd::M_ERR, args) => return Err(BinkpError::Remote(args)),
            other => return Err(BinkpError::Protocol(format!("unexpected {:?}", other))),
        }
    };

    let link = links.iter().find(|(addr, _)| {
        outcome.remote_akas.iter().any(|r| r.same_node(addr))
    });
    let password = match link {
        Some((_, pw)) => pw.clone(),
        None => {
            wire.command(cmd::M_ERR, "unknown address").await?;
            warn!(target: "security", "binkp call from unknown node(s) {:?}", outcome.remote_akas);
            return Err(BinkpError::Auth("unknown address".into()));
        }
    };
    let expected = match cram_response(&password, &challenge) {
        Ok(digest) => digest,
        Err(e) => {
            wire.command(cmd::M_ERR, "authentication unavailable").await?;
            warn!(target: "security", "binkp auth setup failed for {:?}: {}", outcome.remote_akas, e);
            return Err(e);
        }
    };
    let ok = if presented.starts_with("CRAM-MD5-") {
        presented == expected
    } else {
        presented == password
    };
    if !ok {
        wire.command(cmd::M_ERR, "bad password").await?;
        warn!(target: "security", "binkp password failure from {:?}", outcome.remote_akas);
        return Err(BinkpError::Auth("bad password".into()));
    }
    outcome.secure = true;
    wire.command(cmd::M_OK, "secure,CRAM-MD5").await?;

    exchange(&mut wire, endpoint, &mut outcome).await?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

async fn exchange<W: AsyncWrite + Unpin>(
    wire: &mut Wire<W>,
    endpoint: Endpoint,
    outcome: &mut SessionOutcome,
) -> Result<(), BinkpError> {
    let mut state = ExchangeState {
        pending: endpoint.files.into_iter().collect(),
        current: None,
        awaiting_got: Vec::new(),
        receiving: None,
        our_eob: false,
        their_eob: false,
        outstanding_freqs: endpoint.freqs.clone(),
    };

    // FREQs ride along before the first M_EOB.
    for name in &endpoint.freqs {
        wire.command(cmd::M_GET, &format!("{} 0 0 0", name)).await?;
    }

    loop {
        // Drain whatever the reader already has.
        while let Some(frame) = wire.try_recv() {
            handle_frame(
                frame?,
                wire,
                &endpoint.inbound_dir,
                endpoint.freq_dir.as_deref(),
                &mut state,
                outcome,
            )
            .await?;
        }

        if state.done() {
            info!(
                target: "fidobbs::ftn",
                "binkp exchange complete: {} sent, {} received",
                outcome.sent.len(),
                outcome.received.len()
            );
            return Ok(());
        }

        if let Some((file, meta, pos)) = &mut state.current {
            // Stream the next chunk of the current file.
            let remaining = (meta.size - *pos) as usize;
            let take = remaining.min(DATA_CHUNK);
            let mut chunk = vec![0u8; take];
            file.read_exact(&mut chunk)?;
            *pos += take as u64;
            let done = *pos >= meta.size;
            let frame = encode_data(&chunk);
            wire.send(frame).await?;
            if done {
                state.awaiting_got.push(meta.name.clone());
                state.current = None;
            }
            continue;
        }

        if let Some(next) = state.pending.pop_front() {
            let mut file = File::open(&next.path)?;
            file.seek(SeekFrom::Start(0))?;
            wire.command(
                cmd::M_FILE,
                &format!("{} {} {} 0", next.name, next.size, next.mtime),
            )
            .await?;
            state.current = Some((file, next, 0));
            continue;
        }

        if !state.our_eob {
            wire.command(cmd::M_EOB, "").await?;
            state.our_eob = true;
            continue;
        }

        // Nothing to write: block for the next inbound frame.
        let frame = wire.recv().await?;
        handle_frame(
            frame,
            wire,
            &endpoint.inbound_dir,
            endpoint.freq_dir.as_deref(),
            &mut state,
            outcome,
        )
        .await?;
    }
}

struct ExchangeState {
    pending: VecDeque<OutboundFile>,
    current: Option<(File, OutboundFile, u64)>,
    awaiting_got: Vec<String>,
    receiving: Option<Receiving>,
    our_eob: bool,
    their_eob: bool,
    /// FREQ patterns whose answer (M_FILE or M_SKIP) has not arrived yet.
    outstanding_freqs: Vec<String>,
}

impl ExchangeState {
    fn done(&self) -> bool {
        self.our_eob
            && self.their_eob
            && self.receiving.is_none()
            && self.awaiting_got.is_empty()
            && self.outstanding_freqs.is_empty()
    }

    fn settle_freq(&mut self, name: &str) {
        if let Some(pos) = self
            .outstanding_freqs
            .iter()
            .position(|p| p.eq_ignore_ascii_case(name) || wildcard_match(p, name))
        {
            self.outstanding_freqs.remove(pos);
        }
    }
}

async fn handle_frame<W: AsyncWrite + Unpin>(
    frame: Frame,
    wire: &mut Wire<W>,
    inbound_dir: &Path,
    freq_dir: Option<&Path>,
    state: &mut ExchangeState,
    outcome: &mut SessionOutcome,
) -> Result<(), BinkpError> {
    match frame {
        Frame::Data(chunk) => {
            let recv = state
                .receiving
                .as_mut()
                .ok_or_else(|| BinkpError::Protocol("data frame with no open file".into()))?;
            recv.file.write_all(&chunk)?;
            recv.got += chunk.len() as u64;
            if recv.got >= recv.size {
                let done = state.receiving.take().expect("checked above");
                if done.got != done.size {
                    return Err(BinkpError::Protocol(format!(
                        "file {} overran announced size",
                        done.name
                    )));
                }
                done.file.sync_all()?;
                wire.command(
                    cmd::M_GOT,
                    &format!("{} {} {}", done.name, done.size, done.mtime),
                )
                .await?;
                outcome.received.push(done.path);
            }
        }
        Frame::Command(cmd::M_FILE, args) => {
            let mut parts = args.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            let size: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let mtime: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let offset: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            state.settle_freq(&name);
            if offset != 0 {
                // We never ask for offsets; restart at zero.
                wire.command(cmd::M_GET, &format!("{} {} {} 0", name, size, mtime)).await?;
                return Ok(());
            }
            std::fs::create_dir_all(inbound_dir)?;
            let path = inbound_dir.join(safe_filename(&name));
            let file = File::create(&path)?;
            state.receiving = Some(Receiving { file, path, name: name.clone(), size, mtime, got: 0 });
            // A zero-length offer completes immediately.
            if size == 0 {
                let done = state.receiving.take().expect("just set");
                done.file.sync_all()?;
                wire.command(cmd::M_GOT, &format!("{} 0 {}", done.name, done.mtime)).await?;
                outcome.received.push(done.path);
            }
        }
        Frame::Command(id @ (cmd::M_GOT | cmd::M_SKIP), args) => {
            let name = args.split_whitespace().next().unwrap_or_default().to_string();
            if id == cmd::M_SKIP {
                state.settle_freq(&name);
            }
            if let Some(pos) = state.awaiting_got.iter().position(|n| *n == name) {
                state.awaiting_got.remove(pos);
                if id == cmd::M_GOT {
                    outcome.sent.push(name);
                } else {
                    outcome.skipped.push(name);
                }
            } else if let Some(pos) = state.pending.iter().position(|f| f.name == name) {
                // Refused before we even started it.
                state.pending.remove(pos);
                outcome.skipped.push(name);
            } else if state
                .current
                .as_ref()
                .map(|(_, m, _)| m.name == name)
                .unwrap_or(false)
            {
                state.current = None;
                outcome.skipped.push(name);
            }
        }
        Frame::Command(cmd::M_GET, args) => {
            let mut parts = args.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            let size: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let time: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let offset: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let known = state
                .current
                .as_ref()
                .map(|(_, m, _)| m.name == name)
                .unwrap_or(false)
                || state.pending.iter().any(|f| f.name == name);
            if size == 0 && time == 0 && !name.is_empty() && !known {
                // FREQ: look the name up under the service directory.
                serve_freq(wire, freq_dir, &name, &mut state.pending, &mut state.our_eob).await?;
            } else if let Some((file, meta, pos)) = &mut state.current {
                if meta.name == name {
                    file.seek(SeekFrom::Start(offset))?;
                    *pos = offset;
                }
            }
        }
        Frame::Command(cmd::M_EOB, _) => {
            state.their_eob = true;
        }
        Frame::Command(cmd::M_ERR, args) => return Err(BinkpError::Remote(args)),
        Frame::Command(cmd::M_BSY, args) => return Err(BinkpError::Busy(args)),
        Frame::Command(cmd::M_NUL, _) => {}
        Frame::Command(other, args) => {
            return Err(BinkpError::Protocol(format!(
                "unknown command {} '{}'",
                other,
                escape_log(&args)
            )));
        }
    }
    Ok(())
}

/// Expand a FREQ against the service directory, queueing matches and
/// refusing the rest.
async fn serve_freq<W: AsyncWrite + Unpin>(
    wire: &mut Wire<W>,
    freq_dir: Option<&Path>,
    pattern: &str,
    pending: &mut VecDeque<OutboundFile>,
    our_eob: &mut bool,
) -> Result<(), BinkpError> {
    let dir = match freq_dir {
        Some(d) => d,
        None => {
            wire.command(cmd::M_SKIP, &format!("{} 0 0", pattern)).await?;
            return Ok(());
        }
    };
    let mut matched = false;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !wildcard_match(pattern, &name) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if !meta.is_file() {
                    continue;
                }
                matched = true;
                pending.push_back(OutboundFile {
                    path: entry.path(),
                    name,
                    size: meta.len(),
                    mtime: meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0),
                });
            }
        }
    }
    if matched {
        // New offers reopen the batch if we had already closed it.
        *our_eob = false;
    } else {
        wire.command(cmd::M_SKIP, &format!("{} 0 0", pattern)).await?;
    }
    Ok(())
}

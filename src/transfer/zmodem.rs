//! ZMODEM state machines and framing.
//!
//! Headers travel in two wire shapes: ASCII-hex (negotiation) and binary
//! with CRC-32 (everything after). Data moves in ZDLE-escaped subpackets
//! terminated by ZCRCE/ZCRCG/ZCRCQ/ZCRCW, each protected by a CRC-32 that
//! covers the payload plus the terminator byte. Crash recovery is plain
//! ZRPOS repositioning: the receiver can seek the sender anywhere.
//!
//! ESCCTL is negotiated off; we honour it on our transmissions when the
//! peer's ZRINIT requests it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::crc::{crc16_ccitt, crc32, Crc32};
use super::{expired, BytePipe, OutBuf, TransferError, TransferState};
use crate::validation::safe_filename;

pub const ZPAD: u8 = b'*';
pub const ZDLE: u8 = 0x18;
pub const ZHEX: u8 = b'B';
pub const ZBIN32: u8 = b'C';
pub const XON: u8 = 0x11;

pub const ZRQINIT: u8 = 0;
pub const ZRINIT: u8 = 1;
pub const ZSINIT: u8 = 2;
pub const ZACK: u8 = 3;
pub const ZFILE: u8 = 4;
pub const ZSKIP: u8 = 5;
pub const ZNAK: u8 = 6;
pub const ZABORT: u8 = 7;
pub const ZFIN: u8 = 8;
pub const ZRPOS: u8 = 9;
pub const ZDATA: u8 = 10;
pub const ZEOF: u8 = 11;
pub const ZFERR: u8 = 12;
pub const ZCRC: u8 = 13;
pub const ZCOMPL: u8 = 15;
pub const ZCAN: u8 = 16;

pub const ZCRCE: u8 = b'h';
pub const ZCRCG: u8 = b'i';
pub const ZCRCQ: u8 = b'j';
pub const ZCRCW: u8 = b'k';

/// ZRINIT capability flags (ZF0).
pub const CANFDX: u8 = 0x01;
pub const CANOVIO: u8 = 0x02;
pub const CANFC32: u8 = 0x20;
pub const ESCCTL: u8 = 0x40;

pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DATA_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_SUBPACKET: usize = 1024;
const MAX_RETRIES: u32 = 10;

// ---------------------------------------------------------------------------
// Wire encoding
// ---------------------------------------------------------------------------

fn must_escape(b: u8, escape_ctl: bool) -> bool {
    matches!(b, ZDLE | 0x11 | 0x13 | 0x91 | 0x93) || (escape_ctl && b < 0x20)
}

/// ZDLE-escape `data` into `out`.
pub fn zdle_encode(data: &[u8], escape_ctl: bool, out: &mut Vec<u8>) {
    for &b in data {
        if must_escape(b, escape_ctl) {
            out.push(ZDLE);
            out.push(b ^ 0x40);
        } else {
            out.push(b);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZHeader {
    pub typ: u8,
    pub data: [u8; 4],
}

impl ZHeader {
    pub fn new(typ: u8, data: [u8; 4]) -> Self {
        ZHeader { typ, data }
    }

    /// Header carrying a little-endian file position.
    pub fn with_pos(typ: u8, pos: u32) -> Self {
        ZHeader { typ, data: pos.to_le_bytes() }
    }

    pub fn pos(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }

    /// ZRINIT capability byte.
    pub fn zf0(&self) -> u8 {
        self.data[3]
    }
}

fn hex_digit(n: u8) -> u8 {
    b"0123456789abcdef"[n as usize]
}

/// Encode a hex header: `** ZDLE B` + 14 hex digits + CR LF XON.
pub fn encode_hex_header(h: ZHeader) -> Vec<u8> {
    let mut raw = [0u8; 5];
    raw[0] = h.typ;
    raw[1..].copy_from_slice(&h.data);
    let crc = crc16_ccitt(&raw);
    let mut out = vec![ZPAD, ZPAD, ZDLE, ZHEX];
    for b in raw.iter().chain(crc.to_be_bytes().iter()) {
        out.push(hex_digit(b >> 4));
        out.push(hex_digit(b & 0x0F));
    }
    out.extend_from_slice(&[b'\r', b'\n', XON]);
    out
}

/// Encode a binary32 header: `* ZDLE C` + escaped type/data/CRC-32.
pub fn encode_bin32_header(h: ZHeader, escape_ctl: bool) -> Vec<u8> {
    let mut raw = [0u8; 5];
    raw[0] = h.typ;
    raw[1..].copy_from_slice(&h.data);
    let crc = crc32(&raw);
    let mut out = vec![ZPAD, ZDLE, ZBIN32];
    zdle_encode(&raw, escape_ctl, &mut out);
    zdle_encode(&crc.to_le_bytes(), escape_ctl, &mut out);
    out
}

/// Encode one data subpacket with its terminator and CRC-32.
pub fn encode_subpacket(data: &[u8], term: u8, escape_ctl: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2 + 8);
    zdle_encode(data, escape_ctl, &mut out);
    out.push(ZDLE);
    out.push(term);
    let mut crc = Crc32::default();
    crc.update(data);
    crc.update(&[term]);
    zdle_encode(&crc.finalize().to_le_bytes(), escape_ctl, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Incremental decoder
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum ZChunk {
    Header(ZHeader),
    /// Completed data subpacket and its terminator byte.
    Packet(Vec<u8>, u8),
    /// CRC failure in a header or subpacket.
    BadCrc,
    /// A run of five CAN bytes.
    Abort,
}

enum DecodeState {
    Hunt,
    SawPad,
    SawZdle,
    Hex { nibbles: Vec<u8> },
    Bin32 { esc: bool, raw: Vec<u8> },
}

/// Incremental ZMODEM stream decoder. `push` consumes one wire byte and
/// occasionally yields a chunk. Switch to data mode after a ZDATA/ZFILE
/// header to collect subpackets.
pub struct ZFramer {
    state: DecodeState,
    data_mode: bool,
    payload: Vec<u8>,
    esc: bool,
    term: Option<u8>,
    crc_bytes: Vec<u8>,
    can_run: u8,
}

impl Default for ZFramer {
    fn default() -> Self {
        ZFramer {
            state: DecodeState::Hunt,
            data_mode: false,
            payload: Vec::new(),
            esc: false,
            term: None,
            crc_bytes: Vec::new(),
            can_run: 0,
        }
    }
}

impl ZFramer {
    /// Enter data mode: subsequent bytes form data subpackets.
    pub fn expect_data(&mut self) {
        self.data_mode = true;
        self.payload.clear();
        self.esc = false;
        self.term = None;
        self.crc_bytes.clear();
    }

    /// Leave data mode and hunt for the next header.
    pub fn expect_header(&mut self) {
        self.data_mode = false;
        self.state = DecodeState::Hunt;
    }

    pub fn push(&mut self, b: u8) -> Option<ZChunk> {
        // An unescaped run of CANs aborts regardless of mode. ZDLE and CAN
        // share 0x18, so only count runs beyond the escape pairs.
        if b == ZDLE {
            self.can_run += 1;
            if self.can_run >= 5 {
                return Some(ZChunk::Abort);
            }
        } else {
            self.can_run = 0;
        }
        if self.data_mode {
            self.push_data(b)
        } else {
            self.push_header(b)
        }
    }

    fn push_data(&mut self, b: u8) -> Option<ZChunk> {
        if let Some(term) = self.term {
            // Collecting the 4 CRC bytes that follow the terminator.
            if self.esc {
                self.esc = false;
                self.crc_bytes.push(b ^ 0x40);
            } else if b == ZDLE {
                self.esc = true;
                return None;
            } else {
                self.crc_bytes.push(b);
            }
            if self.crc_bytes.len() == 4 {
                let wire = u32::from_le_bytes([
                    self.crc_bytes[0],
                    self.crc_bytes[1],
                    self.crc_bytes[2],
                    self.crc_bytes[3],
                ]);
                let mut crc = Crc32::default();
                crc.update(&self.payload);
                crc.update(&[term]);
                let ok = crc.finalize() == wire;
                let payload = std::mem::take(&mut self.payload);
                self.term = None;
                self.crc_bytes.clear();
                return Some(if ok { ZChunk::Packet(payload, term) } else { ZChunk::BadCrc });
            }
            return None;
        }
        if self.esc {
            self.esc = false;
            match b {
                ZCRCE | ZCRCG | ZCRCQ | ZCRCW => {
                    self.term = Some(b);
                    self.crc_bytes.clear();
                }
                _ => self.payload.push(b ^ 0x40),
            }
            return None;
        }
        match b {
            ZDLE => {
                self.esc = true;
                None
            }
            0x11 | 0x13 | 0x91 | 0x93 => None, // in-band flow control noise
            _ => {
                self.payload.push(b);
                if self.payload.len() > MAX_SUBPACKET + 4 {
                    // Runaway packet; treat as a framing error.
                    self.payload.clear();
                    Some(ZChunk::BadCrc)
                } else {
                    None
                }
            }
        }
    }

    fn push_header(&mut self, b: u8) -> Option<ZChunk> {
        match &mut self.state {
            DecodeState::Hunt => {
                if b == ZPAD {
                    self.state = DecodeState::SawPad;
                }
                None
            }
            DecodeState::SawPad => {
                match b {
                    ZPAD => {}
                    ZDLE => self.state = DecodeState::SawZdle,
                    _ => self.state = DecodeState::Hunt,
                }
                None
            }
            DecodeState::SawZdle => {
                match b {
                    ZHEX => self.state = DecodeState::Hex { nibbles: Vec::with_capacity(14) },
                    ZBIN32 => self.state = DecodeState::Bin32 { esc: false, raw: Vec::with_capacity(9) },
                    _ => self.state = DecodeState::Hunt,
                }
                None
            }
            DecodeState::Hex { nibbles } => {
                let v = match b {
                    b'0'..=b'9' => b - b'0',
                    b'a'..=b'f' => b - b'a' + 10,
                    b'A'..=b'F' => b - b'A' + 10,
                    _ => {
                        self.state = DecodeState::Hunt;
                        return None;
                    }
                };
                nibbles.push(v);
                if nibbles.len() == 14 {
                    let mut raw = [0u8; 7];
                    for (i, pair) in nibbles.chunks(2).enumerate() {
                        raw[i] = (pair[0] << 4) | pair[1];
                    }
                    self.state = DecodeState::Hunt;
                    let crc_wire = u16::from_be_bytes([raw[5], raw[6]]);
                    if crc_wire != crc16_ccitt(&raw[..5]) {
                        return Some(ZChunk::BadCrc);
                    }
                    return Some(ZChunk::Header(ZHeader {
                        typ: raw[0],
                        data: [raw[1], raw[2], raw[3], raw[4]],
                    }));
                }
                None
            }
            DecodeState::Bin32 { esc, raw } => {
                if *esc {
                    *esc = false;
                    raw.push(b ^ 0x40);
                } else if b == ZDLE {
                    *esc = true;
                    return None;
                } else {
                    raw.push(b);
                }
                if raw.len() == 9 {
                    let crc_wire = u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]);
                    let ok = crc_wire == crc32(&raw[..5]);
                    let header = ZHeader {
                        typ: raw[0],
                        data: [raw[1], raw[2], raw[3], raw[4]],
                    };
                    self.state = DecodeState::Hunt;
                    return Some(if ok { ZChunk::Header(header) } else { ZChunk::BadCrc });
                }
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    WaitZrinit,
    WaitFileResponse,
    StreamData,
    WaitEofAck,
    WaitFinAck,
    Complete,
}

pub struct ZmodemSender {
    file: File,
    name: String,
    size: u64,
    mtime: u64,
    pos: u64,
    phase: SendPhase,
    framer: ZFramer,
    out: OutBuf,
    escape_ctl: bool,
    skipped: bool,
    retries: u32,
    deadline: Option<Instant>,
}

impl ZmodemSender {
    pub fn new(file: File, name: &str, size: u64, mtime: u64, now: Instant) -> Self {
        let mut s = ZmodemSender {
            file,
            name: name.to_string(),
            size,
            mtime,
            pos: 0,
            phase: SendPhase::WaitZrinit,
            framer: ZFramer::default(),
            out: OutBuf::default(),
            escape_ctl: false,
            skipped: false,
            retries: 0,
            deadline: Some(now + HEADER_TIMEOUT),
        };
        s.out.stage(&encode_hex_header(ZHeader::new(ZRQINIT, [0; 4])));
        s
    }

    /// True when the receiver answered ZSKIP instead of taking the file.
    pub fn was_skipped(&self) -> bool {
        self.skipped
    }

    pub fn bytes_sent(&self) -> u64 {
        self.pos
    }

    fn stage_zfile(&mut self) {
        let mut frame = encode_bin32_header(ZHeader::new(ZFILE, [0; 4]), self.escape_ctl);
        let mut info = Vec::new();
        info.extend_from_slice(self.name.as_bytes());
        info.push(0);
        info.extend_from_slice(format!("{} {:o}", self.size, self.mtime).as_bytes());
        info.push(0);
        frame.extend_from_slice(&encode_subpacket(&info, ZCRCW, self.escape_ctl));
        self.out.stage(&frame);
    }

    fn stage_data_from(&mut self, pos: u64, now: Instant) -> Result<(), TransferError> {
        self.pos = pos;
        self.file.seek(SeekFrom::Start(pos))?;
        self.out.stage(&encode_bin32_header(
            ZHeader::with_pos(ZDATA, pos as u32),
            self.escape_ctl,
        ));
        self.phase = SendPhase::StreamData;
        self.deadline = Some(now + DATA_TIMEOUT);
        Ok(())
    }

    fn stage_next_subpacket(&mut self, now: Instant) -> Result<(), TransferError> {
        let remaining = (self.size - self.pos) as usize;
        let take = remaining.min(MAX_SUBPACKET);
        let mut chunk = vec![0u8; take];
        self.file.read_exact(&mut chunk)?;
        self.pos += take as u64;
        let last = self.pos >= self.size;
        let term = if last { ZCRCE } else { ZCRCG };
        let mut frame = encode_subpacket(&chunk, term, self.escape_ctl);
        if last {
            frame.extend_from_slice(&encode_bin32_header(
                ZHeader::with_pos(ZEOF, self.pos as u32),
                self.escape_ctl,
            ));
            self.phase = SendPhase::WaitEofAck;
        }
        self.out.stage(&frame);
        self.deadline = Some(now + DATA_TIMEOUT);
        Ok(())
    }

    pub fn poll(&mut self, pipe: &mut dyn BytePipe, now: Instant) -> Result<TransferState, TransferError> {
        if !self.out.flush(pipe) {
            return Ok(TransferState::Active);
        }
        while let Some(b) = pipe.recv() {
            let chunk = match self.framer.push(b) {
                Some(c) => c,
                None => continue,
            };
            match chunk {
                ZChunk::Abort => return Err(TransferError::Cancelled),
                ZChunk::BadCrc => {
                    self.bump_retry()?;
                    self.out.stage(&encode_hex_header(ZHeader::new(ZNAK, [0; 4])));
                    return Ok(TransferState::Active);
                }
                ZChunk::Packet(..) => continue, // senders receive no data
                ZChunk::Header(h) => {
                    if let Some(state) = self.on_header(h, now)? {
                        return Ok(state);
                    }
                    return Ok(TransferState::Active);
                }
            }
        }
        match self.phase {
            SendPhase::StreamData => {
                self.stage_next_subpacket(now)?;
            }
            SendPhase::Complete => return Ok(TransferState::Complete),
            _ => {
                if expired(self.deadline, now) {
                    self.bump_retry()?;
                    self.restate(now)?;
                }
            }
        }
        Ok(TransferState::Active)
    }

    fn on_header(&mut self, h: ZHeader, now: Instant) -> Result<Option<TransferState>, TransferError> {
        match (self.phase, h.typ) {
            (SendPhase::WaitZrinit, ZRINIT) => {
                self.escape_ctl = h.zf0() & ESCCTL != 0;
                self.stage_zfile();
                self.phase = SendPhase::WaitFileResponse;
                self.deadline = Some(now + HEADER_TIMEOUT);
            }
            (SendPhase::WaitFileResponse, ZRPOS) => {
                self.stage_data_from(h.pos() as u64, now)?;
            }
            (SendPhase::WaitFileResponse, ZSKIP) => {
                self.skipped = true;
                self.out.stage(&encode_hex_header(ZHeader::new(ZFIN, [0; 4])));
                self.phase = SendPhase::WaitFinAck;
                self.deadline = Some(now + HEADER_TIMEOUT);
            }
            (SendPhase::WaitFileResponse, ZNAK) => {
                self.bump_retry()?;
                self.stage_zfile();
            }
            (SendPhase::StreamData, ZRPOS) | (SendPhase::WaitEofAck, ZRPOS) => {
                // Receiver lost sync (or resumed): rewind and restart.
                self.bump_retry()?;
                self.stage_data_from(h.pos() as u64, now)?;
            }
            (SendPhase::WaitEofAck, ZRINIT) => {
                // Ready for the next file; single-file session, so finish.
                self.out.stage(&encode_hex_header(ZHeader::new(ZFIN, [0; 4])));
                self.phase = SendPhase::WaitFinAck;
                self.deadline = Some(now + HEADER_TIMEOUT);
            }
            (SendPhase::WaitFinAck, ZFIN) => {
                self.out.stage(b"OO");
                self.phase = SendPhase::Complete;
                return Ok(Some(TransferState::Active));
            }
            (_, ZABORT) | (_, ZCAN) | (_, ZFERR) => return Err(TransferError::Cancelled),
            _ => {} // stale or repeated header; ignore
        }
        Ok(None)
    }

    /// Re-send whatever the current phase is waiting on after a timeout.
    fn restate(&mut self, now: Instant) -> Result<(), TransferError> {
        match self.phase {
            SendPhase::WaitZrinit => {
                self.out.stage(&encode_hex_header(ZHeader::new(ZRQINIT, [0; 4])));
            }
            SendPhase::WaitFileResponse => self.stage_zfile(),
            SendPhase::WaitEofAck => {
                let frame = encode_bin32_header(
                    ZHeader::with_pos(ZEOF, self.pos as u32),
                    self.escape_ctl,
                );
                self.out.stage(&frame);
            }
            SendPhase::WaitFinAck => {
                self.out.stage(&encode_hex_header(ZHeader::new(ZFIN, [0; 4])));
            }
            SendPhase::StreamData | SendPhase::Complete => {}
        }
        self.deadline = Some(now + HEADER_TIMEOUT);
        Ok(())
    }

    fn bump_retry(&mut self) -> Result<(), TransferError> {
        self.retries += 1;
        if self.retries > MAX_RETRIES {
            Err(TransferError::RetriesExhausted)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    WaitZfile,
    /// ZFILE header seen; its info subpacket is inbound.
    ReadFileInfo,
    WaitZdata,
    ReadData,
    Complete,
}

pub struct ZmodemReceiver {
    dest_dir: PathBuf,
    file: Option<File>,
    file_name: String,
    announced_size: u64,
    offset: u64,
    phase: RecvPhase,
    framer: ZFramer,
    out: OutBuf,
    retries: u32,
    deadline: Option<Instant>,
    received: Vec<(PathBuf, u64)>,
}

impl ZmodemReceiver {
    pub fn new(dest_dir: &Path, now: Instant) -> Self {
        let mut r = ZmodemReceiver {
            dest_dir: dest_dir.to_path_buf(),
            file: None,
            file_name: String::new(),
            announced_size: 0,
            offset: 0,
            phase: RecvPhase::WaitZfile,
            framer: ZFramer::default(),
            out: OutBuf::default(),
            retries: 0,
            deadline: Some(now + HEADER_TIMEOUT),
            received: Vec::new(),
        };
        r.stage_zrinit();
        r
    }

    pub fn received_files(&self) -> &[(PathBuf, u64)] {
        &self.received
    }

    fn stage_zrinit(&mut self) {
        self.out.stage(&encode_hex_header(ZHeader::new(
            ZRINIT,
            [0, 0, 0, CANFDX | CANOVIO | CANFC32],
        )));
    }

    pub fn poll(&mut self, pipe: &mut dyn BytePipe, now: Instant) -> Result<TransferState, TransferError> {
        if !self.out.flush(pipe) {
            return Ok(TransferState::Active);
        }
        while let Some(b) = pipe.recv() {
            let chunk = match self.framer.push(b) {
                Some(c) => c,
                None => continue,
            };
            match chunk {
                ZChunk::Abort => return Err(TransferError::Cancelled),
                ZChunk::BadCrc => {
                    self.bump_retry()?;
                    self.recover(now);
                    return Ok(TransferState::Active);
                }
                ZChunk::Header(h) => {
                    if let Some(state) = self.on_header(h, now)? {
                        return Ok(state);
                    }
                    return Ok(TransferState::Active);
                }
                ZChunk::Packet(data, term) => {
                    self.on_packet(data, term, now)?;
                    return Ok(TransferState::Active);
                }
            }
        }
        if self.phase == RecvPhase::Complete {
            return Ok(TransferState::Complete);
        }
        if expired(self.deadline, now) {
            self.bump_retry()?;
            self.recover(now);
        }
        Ok(TransferState::Active)
    }

    fn on_header(&mut self, h: ZHeader, now: Instant) -> Result<Option<TransferState>, TransferError> {
        match (self.phase, h.typ) {
            (RecvPhase::WaitZfile, ZRQINIT) => {
                self.stage_zrinit();
                self.deadline = Some(now + HEADER_TIMEOUT);
            }
            (RecvPhase::WaitZfile, ZFILE) => {
                self.framer.expect_data();
                self.phase = RecvPhase::ReadFileInfo;
                self.deadline = Some(now + DATA_TIMEOUT);
            }
            (RecvPhase::WaitZfile, ZFIN) => {
                self.out.stage(&encode_hex_header(ZHeader::new(ZFIN, [0; 4])));
                self.phase = RecvPhase::Complete;
                return Ok(Some(TransferState::Active));
            }
            (RecvPhase::WaitZdata, ZDATA) => {
                if h.pos() as u64 == self.offset {
                    self.framer.expect_data();
                    self.phase = RecvPhase::ReadData;
                    self.deadline = Some(now + DATA_TIMEOUT);
                } else {
                    self.bump_retry()?;
                    self.stage_zrpos();
                }
            }
            (RecvPhase::WaitZdata, ZEOF) | (RecvPhase::ReadData, ZEOF) => {
                if h.pos() as u64 == self.offset {
                    self.finish_file()?;
                    self.stage_zrinit();
                    self.phase = RecvPhase::WaitZfile;
                    self.deadline = Some(now + HEADER_TIMEOUT);
                } else {
                    self.bump_retry()?;
                    self.stage_zrpos();
                    self.phase = RecvPhase::WaitZdata;
                }
            }
            (_, ZABORT) | (_, ZCAN) => return Err(TransferError::Cancelled),
            _ => {}
        }
        Ok(None)
    }

    fn on_packet(&mut self, data: Vec<u8>, term: u8, now: Instant) -> Result<(), TransferError> {
        match self.phase {
            RecvPhase::ReadFileInfo => {
                // `<name>\0<size> <mtime-octal>\0`
                let name_end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let name = String::from_utf8_lossy(&data[..name_end]).into_owned();
                let rest = data.get(name_end + 1..).unwrap_or(&[]);
                let info_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                let info = String::from_utf8_lossy(&rest[..info_end]).into_owned();
                self.announced_size = info
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                self.file_name = safe_filename(&name);
                let path = self.dest_dir.join(&self.file_name);
                // Crash recovery: offer the length of any partial file.
                let existing = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)?;
                self.offset = if existing > 0 && existing < self.announced_size {
                    existing
                } else {
                    0
                };
                if self.offset == 0 {
                    file.set_len(0)?;
                }
                self.file = Some(file);
                if let Some(f) = self.file.as_mut() {
                    f.seek(SeekFrom::Start(self.offset))?;
                }
                self.framer.expect_header();
                self.stage_zrpos();
                self.phase = RecvPhase::WaitZdata;
                self.deadline = Some(now + HEADER_TIMEOUT);
            }
            RecvPhase::ReadData => {
                if let Some(f) = self.file.as_mut() {
                    f.write_all(&data)?;
                }
                self.offset += data.len() as u64;
                match term {
                    ZCRCG => {
                        // More subpackets follow in the same frame.
                        self.deadline = Some(now + DATA_TIMEOUT);
                    }
                    ZCRCQ | ZCRCW => {
                        self.out.stage(&encode_hex_header(ZHeader::with_pos(
                            ZACK,
                            self.offset as u32,
                        )));
                        self.framer.expect_header();
                        if term == ZCRCW {
                            self.phase = RecvPhase::WaitZdata;
                        }
                        self.deadline = Some(now + DATA_TIMEOUT);
                    }
                    _ => {
                        // ZCRCE ends the frame; ZEOF follows as a header.
                        self.framer.expect_header();
                        self.deadline = Some(now + HEADER_TIMEOUT);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn stage_zrpos(&mut self) {
        self.framer.expect_header();
        self.out.stage(&encode_hex_header(ZHeader::with_pos(
            ZRPOS,
            self.offset as u32,
        )));
        self.phase = RecvPhase::WaitZdata;
    }

    fn finish_file(&mut self) -> Result<(), TransferError> {
        if let Some(mut f) = self.file.take() {
            if self.announced_size > 0 {
                f.set_len(self.announced_size)?;
            }
            f.flush()?;
            self.received.push((
                self.dest_dir.join(&self.file_name),
                self.offset,
            ));
        }
        self.offset = 0;
        self.announced_size = 0;
        Ok(())
    }

    /// After an error or timeout, reconverge on a header boundary.
    fn recover(&mut self, now: Instant) {
        match self.phase {
            RecvPhase::WaitZfile => self.stage_zrinit(),
            RecvPhase::ReadFileInfo => {
                self.framer.expect_header();
                self.out.stage(&encode_hex_header(ZHeader::new(ZNAK, [0; 4])));
                self.phase = RecvPhase::WaitZfile;
            }
            RecvPhase::ReadData | RecvPhase::WaitZdata => self.stage_zrpos(),
            RecvPhase::Complete => {}
        }
        self.deadline = Some(now + HEADER_TIMEOUT);
    }

    fn bump_retry(&mut self) -> Result<(), TransferError> {
        self.retries += 1;
        if self.retries > MAX_RETRIES {
            Err(TransferError::RetriesExhausted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testpipe::TestPipe;
    use super::*;

    fn temp_file_with(content: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    fn drive<F>(mut step: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..20_000 {
            if step() {
                return;
            }
        }
        panic!("session did not converge");
    }

    #[test]
    fn zdle_escaping_round_trips() {
        let nasty = vec![0x18, 0x11, 0x13, 0x91, 0x93, 0x00, 0x41, 0xFF];
        let mut wire = Vec::new();
        zdle_encode(&nasty, false, &mut wire);
        // Every canonical escape target appears doubled.
        assert!(wire.len() > nasty.len());

        // Run it through the framer as a subpacket.
        let mut framer = ZFramer::default();
        framer.expect_data();
        let sub = encode_subpacket(&nasty, ZCRCE, false);
        let mut result = None;
        for b in sub {
            if let Some(c) = framer.push(b) {
                result = Some(c);
            }
        }
        assert_eq!(result, Some(ZChunk::Packet(nasty, ZCRCE)));
    }

    #[test]
    fn hex_header_round_trips() {
        let h = ZHeader::with_pos(ZRPOS, 0x01020304);
        let wire = encode_hex_header(h);
        assert_eq!(&wire[..4], &[ZPAD, ZPAD, ZDLE, ZHEX]);
        let mut framer = ZFramer::default();
        let mut got = None;
        for b in wire {
            if let Some(c) = framer.push(b) {
                got = Some(c);
            }
        }
        assert_eq!(got, Some(ZChunk::Header(h)));
        assert_eq!(h.pos(), 0x01020304);
    }

    #[test]
    fn bin32_header_round_trips_with_escapes() {
        // A position whose LE bytes include ZDLE forces escaping.
        let h = ZHeader::with_pos(ZDATA, 0x18131118);
        let wire = encode_bin32_header(h, false);
        let mut framer = ZFramer::default();
        let mut got = None;
        for b in wire {
            if let Some(c) = framer.push(b) {
                got = Some(c);
            }
        }
        assert_eq!(got, Some(ZChunk::Header(h)));
    }

    #[test]
    fn corrupted_hex_header_reports_bad_crc() {
        let mut wire = encode_hex_header(ZHeader::new(ZRINIT, [1, 2, 3, 4]));
        wire[6] = if wire[6] == b'0' { b'1' } else { b'0' };
        let mut framer = ZFramer::default();
        let mut got = None;
        for b in wire {
            if let Some(c) = framer.push(b) {
                got = Some(c);
            }
        }
        assert_eq!(got, Some(ZChunk::BadCrc));
    }

    #[test]
    fn full_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i * 31) as u8).collect();
        let mut sender = ZmodemSender::new(
            temp_file_with(&payload),
            "data.bin",
            payload.len() as u64,
            0,
            now,
        );
        let mut receiver = ZmodemReceiver::new(dir.path(), now);

        let mut s_pipe = TestPipe::default();
        let mut r_pipe = TestPipe::default();
        drive(|| {
            let ss = sender.poll(&mut s_pipe, now).unwrap();
            r_pipe.feed(&s_pipe.take_outbound());
            let rs = receiver.poll(&mut r_pipe, now).unwrap();
            s_pipe.feed(&r_pipe.take_outbound());
            ss == TransferState::Complete && rs == TransferState::Complete
        });

        assert_eq!(receiver.received_files().len(), 1);
        let mut got = Vec::new();
        File::open(dir.path().join("data.bin"))
            .unwrap()
            .read_to_end(&mut got)
            .unwrap();
        assert_eq!(got, payload);
        assert!(!sender.was_skipped());
    }

    #[test]
    fn resume_offers_partial_length() {
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 199) as u8).collect();
        // Pretend a crash left the first 1500 bytes on disk.
        std::fs::write(dir.path().join("big.bin"), &payload[..1500]).unwrap();

        let mut sender = ZmodemSender::new(
            temp_file_with(&payload),
            "big.bin",
            payload.len() as u64,
            0,
            now,
        );
        let mut receiver = ZmodemReceiver::new(dir.path(), now);

        let mut s_pipe = TestPipe::default();
        let mut r_pipe = TestPipe::default();
        drive(|| {
            let ss = sender.poll(&mut s_pipe, now).unwrap();
            r_pipe.feed(&s_pipe.take_outbound());
            let rs = receiver.poll(&mut r_pipe, now).unwrap();
            s_pipe.feed(&r_pipe.take_outbound());
            ss == TransferState::Complete && rs == TransferState::Complete
        });

        let mut got = Vec::new();
        File::open(dir.path().join("big.bin"))
            .unwrap()
            .read_to_end(&mut got)
            .unwrap();
        assert_eq!(got, payload);
        // Only the tail crossed the wire.
        assert_eq!(sender.bytes_sent(), payload.len() as u64);
    }

    #[test]
    fn all_ff_payload_survives() {
        // 0x91/0x93 are escape targets with the high bit set; a payload of
        // repeated high bytes exercises them.
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();
        let payload = vec![0xFFu8; 2048];
        let mut sender = ZmodemSender::new(
            temp_file_with(&payload),
            "ff.bin",
            payload.len() as u64,
            0,
            now,
        );
        let mut receiver = ZmodemReceiver::new(dir.path(), now);
        let mut s_pipe = TestPipe::default();
        let mut r_pipe = TestPipe::default();
        drive(|| {
            let ss = sender.poll(&mut s_pipe, now).unwrap();
            r_pipe.feed(&s_pipe.take_outbound());
            let rs = receiver.poll(&mut r_pipe, now).unwrap();
            s_pipe.feed(&r_pipe.take_outbound());
            ss == TransferState::Complete && rs == TransferState::Complete
        });
        let mut got = Vec::new();
        File::open(dir.path().join("ff.bin"))
            .unwrap()
            .read_to_end(&mut got)
            .unwrap();
        assert_eq!(got, payload);
    }
}

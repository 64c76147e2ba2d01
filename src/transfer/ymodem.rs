//! YMODEM batch layer.
//!
//! A batch is a sequence of files, each introduced by a block 0 carrying
//! `<filename>\0<size-ascii> <mod-time-octal>\0` and zero padding; the data
//! that follows is ordinary XMODEM-CRC with 1K blocks. An empty block 0
//! terminates the batch. YMODEM-G differs only in the handshake byte (`G`)
//! and the absence of per-block ACKs.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::crc::crc16_ccitt;
use super::xmodem::{
    encode_block, CheckMode, XmodemReceiver, XmodemSender, ACK, BLOCK_TIMEOUT, CAN,
    CRC_HANDSHAKE, G_HANDSHAKE, HANDSHAKE_TIMEOUT, MAX_RETRIES, NAK, SOH, STX,
};
use super::{expired, BytePipe, OutBuf, TransferError, TransferState};
use crate::validation::safe_filename;

/// One outbound batch entry.
pub struct YmodemFile {
    pub file: std::fs::File,
    pub name: String,
    pub size: u64,
    /// Unix mtime, written in octal in block 0.
    pub mtime: u64,
}

fn header_payload(name: &str, size: u64, mtime: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(128);
    data.extend_from_slice(name.as_bytes());
    data.push(0);
    data.extend_from_slice(format!("{} {:o}", size, mtime).as_bytes());
    data.push(0);
    let block = if data.len() > 128 { 1024 } else { 128 };
    data.resize(block, 0);
    data
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

enum SendPhase {
    /// Waiting for `C`/`G` before a header block (file or batch end).
    WaitHeaderHandshake,
    /// Header staged; waiting for its ACK (C mode only; -G streams on).
    WaitHeaderAck,
    Data(XmodemSender),
    WaitFinalAck,
    Complete,
}

pub struct YmodemSender {
    queue: std::collections::VecDeque<YmodemFile>,
    phase: SendPhase,
    streaming: bool,
    out: OutBuf,
    last_header: Vec<u8>,
    retries: u32,
    deadline: Option<Instant>,
}

impl YmodemSender {
    pub fn new(files: Vec<YmodemFile>, now: Instant) -> Self {
        YmodemSender {
            queue: files.into(),
            phase: SendPhase::WaitHeaderHandshake,
            streaming: false,
            out: OutBuf::default(),
            last_header: Vec::new(),
            retries: 0,
            deadline: Some(now + HANDSHAKE_TIMEOUT),
        }
    }

    fn stage_next_header(&mut self, now: Instant) {
        let payload = match self.queue.front() {
            Some(f) => header_payload(&f.name, f.size, f.mtime),
            None => vec![0u8; 128], // empty block 0: end of batch
        };
        self.last_header = encode_block(0, &payload, CheckMode::Crc);
        let header = self.last_header.clone();
        self.out.stage(&header);
        if self.queue.is_empty() {
            self.phase = SendPhase::WaitFinalAck;
        } else if self.streaming {
            // -G: no header ACK; the receiver's G opens the data phase and
            // is consumed by the inner sender's own handshake wait.
            let entry = self.queue.pop_front().expect("queue checked non-empty");
            self.phase = SendPhase::Data(XmodemSender::new(entry.file, entry.size, true, now));
        } else {
            self.phase = SendPhase::WaitHeaderAck;
        }
        self.deadline = Some(now + BLOCK_TIMEOUT);
    }

    pub fn poll(&mut self, pipe: &mut dyn BytePipe, now: Instant) -> Result<TransferState, TransferError> {
        if !self.out.flush(pipe) {
            return Ok(TransferState::Active);
        }
        if let SendPhase::Data(inner) = &mut self.phase {
            if inner.poll(pipe, now)? == TransferState::Complete {
                self.phase = SendPhase::WaitHeaderHandshake;
                self.deadline = Some(now + HANDSHAKE_TIMEOUT);
            }
            return Ok(TransferState::Active);
        }
        match self.phase {
            SendPhase::WaitHeaderHandshake => {
                while let Some(b) = pipe.recv() {
                    match b {
                        CRC_HANDSHAKE => {
                            self.stage_next_header(now);
                            return Ok(TransferState::Active);
                        }
                        G_HANDSHAKE => {
                            self.streaming = true;
                            self.stage_next_header(now);
                            return Ok(TransferState::Active);
                        }
                        CAN => return Err(TransferError::Cancelled),
                        _ => continue,
                    }
                }
                if expired(self.deadline, now) {
                    return Err(TransferError::Timeout);
                }
            }
            SendPhase::WaitHeaderAck => {
                while let Some(b) = pipe.recv() {
                    match b {
                        ACK => {
                            let entry = self.queue.pop_front().expect("header implies entry");
                            self.phase = SendPhase::Data(XmodemSender::new(
                                entry.file, entry.size, true, now,
                            ));
                            return Ok(TransferState::Active);
                        }
                        NAK => {
                            self.bump_retry()?;
                            let header = self.last_header.clone();
                            self.out.stage(&header);
                            self.deadline = Some(now + BLOCK_TIMEOUT);
                            return Ok(TransferState::Active);
                        }
                        CAN => return Err(TransferError::Cancelled),
                        _ => continue,
                    }
                }
                if expired(self.deadline, now) {
                    return Err(TransferError::Timeout);
                }
            }
            SendPhase::WaitFinalAck => {
                while let Some(b) = pipe.recv() {
                    match b {
                        ACK => {
                            self.phase = SendPhase::Complete;
                            return Ok(TransferState::Complete);
                        }
                        NAK => {
                            self.bump_retry()?;
                            let header = self.last_header.clone();
                            self.out.stage(&header);
                            self.deadline = Some(now + BLOCK_TIMEOUT);
                            return Ok(TransferState::Active);
                        }
                        _ => continue,
                    }
                }
                if expired(self.deadline, now) {
                    return Err(TransferError::Timeout);
                }
            }
            SendPhase::Complete => return Ok(TransferState::Complete),
            SendPhase::Data(_) => unreachable!("handled above"),
        }
        Ok(TransferState::Active)
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

/// Metadata parsed from a block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YmodemHeader {
    pub name: String,
    pub size: u64,
    pub mtime: u64,
}

/// Parse a block 0 payload. `None` means the empty end-of-batch header.
pub fn parse_header(payload: &[u8]) -> Option<YmodemHeader> {
    let name_end = payload.iter().position(|&b| b == 0)?;
    if name_end == 0 {
        return None;
    }
    let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();
    let rest_end = payload[name_end + 1..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| name_end + 1 + p)
        .unwrap_or(payload.len());
    let info = String::from_utf8_lossy(&payload[name_end + 1..rest_end]).into_owned();
    let mut parts = info.split_whitespace();
    let size = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let mtime = parts
        .next()
        .and_then(|s| u64::from_str_radix(s, 8).ok())
        .unwrap_or(0);
    Some(YmodemHeader { name, size, mtime })
}

enum RecvPhase {
    /// Collecting the header block (handshake already staged).
    ReadHeader,
    Data {
        inner: XmodemReceiver,
        header: YmodemHeader,
        path: PathBuf,
    },
    Complete,
}

pub struct YmodemReceiver {
    dest_dir: PathBuf,
    streaming: bool,
    phase: RecvPhase,
    buf: Vec<u8>,
    out: OutBuf,
    retries: u32,
    deadline: Option<Instant>,
    handshake_due: bool,
    received: Vec<(PathBuf, u64)>,
}

impl YmodemReceiver {
    pub fn new(dest_dir: &Path, streaming: bool, now: Instant) -> Self {
        YmodemReceiver {
            dest_dir: dest_dir.to_path_buf(),
            streaming,
            phase: RecvPhase::ReadHeader,
            buf: Vec::with_capacity(1024 + 5),
            out: OutBuf::default(),
            retries: 0,
            deadline: Some(now + HANDSHAKE_TIMEOUT),
            handshake_due: true,
            received: Vec::new(),
        }
    }

    pub fn received_files(&self) -> &[(PathBuf, u64)] {
        &self.received
    }

    fn handshake_byte(&self) -> u8 {
        if self.streaming {
            G_HANDSHAKE
        } else {
            CRC_HANDSHAKE
        }
    }

    fn header_block_len(&self) -> Option<usize> {
        match self.buf.first() {
            Some(&SOH) => Some(3 + 128 + 2),
            Some(&STX) => Some(3 + 1024 + 2),
            _ => None,
        }
    }

    pub fn poll(&mut self, pipe: &mut dyn BytePipe, now: Instant) -> Result<TransferState, TransferError> {
        if !self.out.flush(pipe) {
            return Ok(TransferState::Active);
        }

        // Active file: the inner XMODEM machine owns the pipe until EOT.
        let mut finished: Option<(PathBuf, u64)> = None;
        if let RecvPhase::Data { inner, header, path } = &mut self.phase {
            if inner.poll(pipe, now)? == TransferState::Complete {
                let actual = if header.size > 0 {
                    inner.truncate_to(header.size)?;
                    header.size
                } else {
                    inner.bytes_written()
                };
                finished = Some((path.clone(), actual));
            } else {
                return Ok(TransferState::Active);
            }
        }
        if let Some(entry) = finished {
            self.received.push(entry);
            self.phase = RecvPhase::ReadHeader;
            self.handshake_due = true;
            self.deadline = Some(now + HANDSHAKE_TIMEOUT);
            return Ok(TransferState::Active);
        }

        if self.handshake_due {
            self.handshake_due = false;
            self.out.stage(&[self.handshake_byte()]);
            self.deadline = Some(now + BLOCK_TIMEOUT);
            return Ok(TransferState::Active);
        }

        match self.phase {
            RecvPhase::ReadHeader => {
                while let Some(b) = pipe.recv() {
                    if self.buf.is_empty() && !matches!(b, SOH | STX) {
                        continue;
                    }
                    self.buf.push(b);
                    if let Some(need) = self.header_block_len() {
                        if self.buf.len() == need {
                            return self.accept_header(now);
                        }
                    }
                }
                if expired(self.deadline, now) {
                    self.bump_retry()?;
                    self.buf.clear();
                    self.handshake_due = true;
                }
            }
            RecvPhase::Complete => return Ok(TransferState::Complete),
            RecvPhase::Data { .. } => unreachable!("handled above"),
        }
        Ok(TransferState::Active)
    }

    fn accept_header(&mut self, now: Instant) -> Result<TransferState, TransferError> {
        let block = std::mem::take(&mut self.buf);
        let data_len = if block[0] == STX { 1024 } else { 128 };
        let data = &block[3..3 + data_len];
        let crc_wire = u16::from_be_bytes([block[3 + data_len], block[4 + data_len]]);
        let seq_ok = block[1] == 0 && block[2] == 255;
        if !seq_ok || crc_wire != crc16_ccitt(data) {
            if self.streaming {
                self.out.stage(&[CAN, CAN]);
                return Err(TransferError::Protocol("bad batch header".into()));
            }
            self.bump_retry()?;
            self.out.stage(&[NAK]);
            self.deadline = Some(now + BLOCK_TIMEOUT);
            return Ok(TransferState::Active);
        }
        match parse_header(data) {
            None => {
                // Empty block 0: batch complete. ACK it; nothing further is
                // expected from the sender.
                self.out.stage(&[ACK]);
                self.phase = RecvPhase::Complete;
                Ok(TransferState::Active)
            }
            Some(header) => {
                let path = self.dest_dir.join(safe_filename(&header.name));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                let inner =
                    XmodemReceiver::new(file, CheckMode::Crc, self.streaming, now).keep_padding();
                // C mode ACKs the header and the inner receiver then issues
                // its own C; -G skips the ACK and the inner G both opens the
                // data phase and acknowledges the header.
                if !self.streaming {
                    self.out.stage(&[ACK]);
                }
                self.phase = RecvPhase::Data { inner, header, path };
                self.deadline = Some(now + BLOCK_TIMEOUT);
                Ok(TransferState::Active)
            }
        }
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
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};

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
        panic!("batch did not converge");
    }

    #[test]
    fn header_payload_round_trip() {
        let payload = header_payload("readme.txt", 1234, 0o17_000_000_000);
        assert_eq!(payload.len(), 128);
        let parsed = parse_header(&payload).unwrap();
        assert_eq!(parsed.name, "readme.txt");
        assert_eq!(parsed.size, 1234);
        assert_eq!(parsed.mtime, 0o17_000_000_000);
        assert_eq!(parse_header(&[0u8; 128]), None);
    }

    #[test]
    fn two_file_batch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();
        let a: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let b = b"second file".to_vec();
        let mut sender = YmodemSender::new(
            vec![
                YmodemFile { file: temp_file_with(&a), name: "a.dat".into(), size: a.len() as u64, mtime: 0 },
                YmodemFile { file: temp_file_with(&b), name: "b.txt".into(), size: b.len() as u64, mtime: 0 },
            ],
            now,
        );
        let mut receiver = YmodemReceiver::new(dir.path(), false, now);

        let mut s_pipe = TestPipe::default();
        let mut r_pipe = TestPipe::default();
        drive(|| {
            let ss = sender.poll(&mut s_pipe, now).unwrap();
            r_pipe.feed(&s_pipe.take_outbound());
            let rs = receiver.poll(&mut r_pipe, now).unwrap();
            s_pipe.feed(&r_pipe.take_outbound());
            ss == TransferState::Complete && rs == TransferState::Complete
        });

        let files = receiver.received_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].1, a.len() as u64);
        let mut got = Vec::new();
        File::open(dir.path().join("a.dat")).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, a);
        got.clear();
        File::open(dir.path().join("b.txt")).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, b);
    }

    #[test]
    fn empty_header_ends_batch_without_further_data() {
        // After one file, an all-zero block 0 closes the batch; the
        // receiver ACKs and asks for nothing more.
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();
        let payload = b"only file".to_vec();
        let mut sender = YmodemSender::new(
            vec![YmodemFile {
                file: temp_file_with(&payload),
                name: "only.txt".into(),
                size: payload.len() as u64,
                mtime: 0,
            }],
            now,
        );
        let mut receiver = YmodemReceiver::new(dir.path(), false, now);

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
    }

    #[test]
    fn ymodem_g_batch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let now = Instant::now();
        let payload: Vec<u8> = (0..4000u32).map(|i| (i * 13) as u8).collect();
        let mut sender = YmodemSender::new(
            vec![YmodemFile {
                file: temp_file_with(&payload),
                name: "stream.bin".into(),
                size: payload.len() as u64,
                mtime: 0,
            }],
            now,
        );
        let mut receiver = YmodemReceiver::new(dir.path(), true, now);

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
        File::open(dir.path().join("stream.bin")).unwrap().read_to_end(&mut got).unwrap();
        assert_eq!(got, payload);
    }
}

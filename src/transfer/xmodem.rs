//! XMODEM family state machines.
//!
//! Block layout: `[SOH|STX] [seq] [255-seq] [128 or 1024 data bytes]
//! [check]` where the check is a one-byte sum or a big-endian CRC-16
//! depending on the handshake byte the receiver opened with (`C` selects
//! CRC, NAK selects checksum, `G` selects CRC with streaming for
//! YMODEM-G). Short final blocks are padded with 0x1A.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{Duration, Instant};

use super::crc::{checksum8, crc16_ccitt};
use super::{expired, BytePipe, OutBuf, TransferError, TransferState};

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
pub const CRC_HANDSHAKE: u8 = 0x43; // 'C'
pub const G_HANDSHAKE: u8 = 0x47; // 'G'
pub const PAD: u8 = 0x1A;

pub const MAX_RETRIES: u32 = 10;
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Checksum,
    Crc,
}

impl CheckMode {
    fn len(self) -> usize {
        match self {
            CheckMode::Checksum => 1,
            CheckMode::Crc => 2,
        }
    }
}

/// Encode one wire block. `data` must already be padded to 128 or 1024.
pub fn encode_block(seq: u8, data: &[u8], check: CheckMode) -> Vec<u8> {
    debug_assert!(data.len() == 128 || data.len() == 1024);
    let mut out = Vec::with_capacity(3 + data.len() + 2);
    out.push(if data.len() == 1024 { STX } else { SOH });
    out.push(seq);
    out.push(255 - seq);
    out.extend_from_slice(data);
    match check {
        CheckMode::Checksum => out.push(checksum8(data)),
        CheckMode::Crc => out.extend_from_slice(&crc16_ccitt(data).to_be_bytes()),
    }
    out
}

/// Pad a short chunk up to the block size with 0x1A.
pub fn pad_block(chunk: &[u8], size: usize) -> Vec<u8> {
    let mut data = chunk.to_vec();
    data.resize(size, PAD);
    data
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    WaitStart,
    WaitAck,
    WaitEotAck,
    Complete,
}

pub struct XmodemSender {
    file: File,
    size: u64,
    pos: u64,
    seq: u8,
    state: SendState,
    check: CheckMode,
    /// Receiver opened with `G`: no per-block ACKs, any error aborts.
    streaming: bool,
    /// Sender may emit 1024-byte STX blocks.
    use_1k: bool,
    out: OutBuf,
    /// Last encoded block kept for retransmission.
    last_block: Vec<u8>,
    retries: u32,
    deadline: Option<Instant>,
    can_run: u8,
}

impl XmodemSender {
    pub fn new(file: File, size: u64, use_1k: bool, now: Instant) -> Self {
        XmodemSender {
            file,
            size,
            pos: 0,
            seq: 1,
            state: SendState::WaitStart,
            check: CheckMode::Crc,
            streaming: false,
            use_1k,
            out: OutBuf::default(),
            last_block: Vec::new(),
            retries: 0,
            deadline: Some(now + HANDSHAKE_TIMEOUT),
            can_run: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.pos
    }

    fn next_block(&mut self) -> Result<(), TransferError> {
        let remaining = (self.size - self.pos) as usize;
        let block_size = if self.use_1k && remaining > 128 { 1024 } else { 128 };
        let take = remaining.min(block_size);
        let mut chunk = vec![0u8; take];
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut chunk)?;
        let data = pad_block(&chunk, block_size);
        self.last_block = encode_block(self.seq, &data, self.check);
        self.out.stage(&self.last_block);
        self.pos += take as u64;
        Ok(())
    }

    fn track_cancel(&mut self, byte: u8) -> bool {
        if byte == CAN {
            self.can_run += 1;
            self.can_run >= 2
        } else {
            self.can_run = 0;
            false
        }
    }

    /// Advance the state machine by at most one protocol step.
    pub fn poll(&mut self, pipe: &mut dyn BytePipe, now: Instant) -> Result<TransferState, TransferError> {
        if !self.out.flush(pipe) {
            return Ok(TransferState::Active);
        }
        match self.state {
            SendState::WaitStart => {
                while let Some(b) = pipe.recv() {
                    if self.track_cancel(b) {
                        return Err(TransferError::Cancelled);
                    }
                    match b {
                        CRC_HANDSHAKE => self.check = CheckMode::Crc,
                        G_HANDSHAKE => {
                            self.check = CheckMode::Crc;
                            self.streaming = true;
                        }
                        NAK => self.check = CheckMode::Checksum,
                        _ => continue,
                    }
                    self.next_block()?;
                    self.state = SendState::WaitAck;
                    self.deadline = Some(now + BLOCK_TIMEOUT);
                    return Ok(TransferState::Active);
                }
                if expired(self.deadline, now) {
                    return Err(TransferError::Timeout);
                }
            }
            SendState::WaitAck => {
                if self.streaming {
                    // YMODEM-G: stream the next block as soon as the last
                    // one drained; a NAK or CAN from the receiver aborts.
                    while let Some(b) = pipe.recv() {
                        if self.track_cancel(b) || b == NAK {
                            return Err(TransferError::Cancelled);
                        }
                    }
                    self.advance_or_eot(now)?;
                    return Ok(TransferState::Active);
                }
                while let Some(b) = pipe.recv() {
                    if self.track_cancel(b) {
                        return Err(TransferError::Cancelled);
                    }
                    match b {
                        ACK => {
                            self.retries = 0;
                            self.advance_or_eot(now)?;
                            return Ok(TransferState::Active);
                        }
                        NAK => {
                            self.bump_retry()?;
                            self.out.stage(&self.last_block.clone());
                            self.deadline = Some(now + BLOCK_TIMEOUT);
                            return Ok(TransferState::Active);
                        }
                        _ => continue,
                    }
                }
                if expired(self.deadline, now) {
                    self.bump_retry()?;
                    self.out.stage(&self.last_block.clone());
                    self.deadline = Some(now + BLOCK_TIMEOUT);
                }
            }
            SendState::WaitEotAck => {
                while let Some(b) = pipe.recv() {
                    if self.track_cancel(b) {
                        return Err(TransferError::Cancelled);
                    }
                    match b {
                        ACK => {
                            self.state = SendState::Complete;
                            return Ok(TransferState::Complete);
                        }
                        NAK => {
                            self.bump_retry()?;
                            self.out.stage(&[EOT]);
                            self.deadline = Some(now + BLOCK_TIMEOUT);
                            return Ok(TransferState::Active);
                        }
                        _ => continue,
                    }
                }
                if expired(self.deadline, now) {
                    self.bump_retry()?;
                    self.out.stage(&[EOT]);
                    self.deadline = Some(now + BLOCK_TIMEOUT);
                }
            }
            SendState::Complete => return Ok(TransferState::Complete),
        }
        Ok(TransferState::Active)
    }

    fn advance_or_eot(&mut self, now: Instant) -> Result<(), TransferError> {
        if self.pos >= self.size {
            self.out.stage(&[EOT]);
            self.state = SendState::WaitEotAck;
        } else {
            self.seq = self.seq.wrapping_add(1);
            self.next_block()?;
            self.state = SendState::WaitAck;
        }
        self.deadline = Some(now + BLOCK_TIMEOUT);
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
enum RecvState {
    SendStart,
    ReadBlock,
    Complete,
}

pub struct XmodemReceiver {
    file: File,
    expected_seq: u8,
    check: CheckMode,
    streaming: bool,
    state: RecvState,
    buf: Vec<u8>,
    out: OutBuf,
    retries: u32,
    deadline: Option<Instant>,
    written: u64,
    can_run: u8,
    /// Strip trailing 0x1A padding on completion (plain XMODEM has no size
    /// information; YMODEM truncates to the announced size instead).
    trim_padding: bool,
}

impl XmodemReceiver {
    pub fn new(file: File, check: CheckMode, streaming: bool, now: Instant) -> Self {
        XmodemReceiver {
            file,
            expected_seq: 1,
            check,
            streaming,
            state: RecvState::SendStart,
            buf: Vec::with_capacity(1024 + 5),
            out: OutBuf::default(),
            retries: 0,
            deadline: Some(now + HANDSHAKE_TIMEOUT),
            written: 0,
            can_run: 0,
            trim_padding: true,
        }
    }

    pub fn keep_padding(mut self) -> Self {
        self.trim_padding = false;
        self
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Truncate the received file to `size` (used by the YMODEM batch layer
    /// which learns the true length from block 0).
    pub fn truncate_to(&mut self, size: u64) -> Result<(), TransferError> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn handshake_byte(&self) -> u8 {
        if self.streaming {
            G_HANDSHAKE
        } else if self.check == CheckMode::Crc {
            CRC_HANDSHAKE
        } else {
            NAK
        }
    }

    fn expected_len(&self) -> Option<usize> {
        match self.buf.first() {
            Some(&SOH) => Some(3 + 128 + self.check.len()),
            Some(&STX) => Some(3 + 1024 + self.check.len()),
            _ => None,
        }
    }

    pub fn poll(&mut self, pipe: &mut dyn BytePipe, now: Instant) -> Result<TransferState, TransferError> {
        if !self.out.flush(pipe) {
            return Ok(TransferState::Active);
        }
        match self.state {
            RecvState::SendStart => {
                self.out.stage(&[self.handshake_byte()]);
                self.state = RecvState::ReadBlock;
                self.deadline = Some(now + BLOCK_TIMEOUT);
            }
            RecvState::ReadBlock => {
                while let Some(b) = pipe.recv() {
                    if self.buf.is_empty() {
                        match b {
                            EOT => {
                                self.finish()?;
                                self.out.stage(&[ACK]);
                                self.state = RecvState::Complete;
                                return Ok(TransferState::Active);
                            }
                            CAN => {
                                self.can_run += 1;
                                if self.can_run >= 2 {
                                    return Err(TransferError::Cancelled);
                                }
                                continue;
                            }
                            SOH | STX => {
                                self.can_run = 0;
                                self.buf.push(b);
                            }
                            _ => continue, // line noise between blocks
                        }
                    } else {
                        self.buf.push(b);
                    }
                    if let Some(need) = self.expected_len() {
                        if self.buf.len() == need {
                            self.accept_block(now)?;
                            return Ok(TransferState::Active);
                        }
                    }
                }
                if expired(self.deadline, now) {
                    if self.streaming {
                        return Err(TransferError::Timeout);
                    }
                    self.bump_retry()?;
                    self.buf.clear();
                    self.out.stage(&[NAK]);
                    self.deadline = Some(now + BLOCK_TIMEOUT);
                }
            }
            // The flush gate above means the final ACK has fully drained by
            // the time this arm reports completion.
            RecvState::Complete => return Ok(TransferState::Complete),
        }
        Ok(TransferState::Active)
    }

    fn accept_block(&mut self, now: Instant) -> Result<(), TransferError> {
        let block = std::mem::take(&mut self.buf);
        let data_len = if block[0] == STX { 1024 } else { 128 };
        let seq = block[1];
        let seq_cpl = block[2];
        let data = &block[3..3 + data_len];
        let check_ok = match self.check {
            CheckMode::Checksum => block[3 + data_len] == checksum8(data),
            CheckMode::Crc => {
                let wire = u16::from_be_bytes([block[3 + data_len], block[4 + data_len]]);
                wire == crc16_ccitt(data)
            }
        };
        let seq_ok = seq == self.expected_seq && seq == 255 - seq_cpl;
        if !check_ok || !seq_ok {
            if self.streaming {
                // -G cannot recover: two CANs abort the sender.
                self.out.stage(&[CAN, CAN]);
                return Err(TransferError::Protocol("stream block error".into()));
            }
            self.bump_retry()?;
            self.out.stage(&[NAK]);
            self.deadline = Some(now + BLOCK_TIMEOUT);
            return Ok(());
        }
        self.file.write_all(data)?;
        self.written += data_len as u64;
        self.expected_seq = self.expected_seq.wrapping_add(1);
        self.retries = 0;
        if !self.streaming {
            self.out.stage(&[ACK]);
        }
        self.deadline = Some(now + BLOCK_TIMEOUT);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TransferError> {
        if self.trim_padding {
            // Walk the tail of the last block backwards past 0x1A padding.
            let mut len = self.written;
            let mut tail = vec![0u8; 1024.min(self.written as usize)];
            if !tail.is_empty() {
                self.file.seek(SeekFrom::End(-(tail.len() as i64)))?;
                self.file.read_exact(&mut tail)?;
                while len > 0 {
                    let idx = tail.len() - (self.written - len + 1) as usize;
                    if tail[idx] != PAD {
                        break;
                    }
                    len -= 1;
                }
            }
            self.file.set_len(len)?;
        }
        self.file.flush()?;
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

#[cfg(test)]
mod tests {
    use super::super::testpipe::TestPipe;
    use super::*;
    use std::io::Seek;

    fn temp_file_with(content: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    fn drive<F>(mut step: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..10_000 {
            if step() {
                return;
            }
        }
        panic!("state machine did not converge");
    }

    #[test]
    fn single_block_crc_send_matches_spec_bytes() {
        let file = temp_file_with(b"hello world\n");
        let now = Instant::now();
        let mut sender = XmodemSender::new(file, 12, false, now);
        let mut pipe = TestPipe::default();

        pipe.feed(&[CRC_HANDSHAKE]);
        sender.poll(&mut pipe, now).unwrap();
        drive(|| {
            sender.poll(&mut pipe, now).unwrap();
            pipe.outbound.len() >= 133
        });

        let block = pipe.take_outbound();
        assert_eq!(&block[..3], &[SOH, 0x01, 0xFE]);
        assert_eq!(&block[3..15], b"hello world\n");
        assert!(block[15..131].iter().all(|&b| b == PAD));
        assert_eq!(&block[131..133], &[0x0D, 0x79]);

        // ACK the block, expect EOT; ACK that, expect completion.
        pipe.feed(&[ACK]);
        drive(|| {
            sender.poll(&mut pipe, now).unwrap();
            pipe.outbound.ends_with(&[EOT])
        });
        pipe.feed(&[ACK]);
        drive(|| matches!(sender.poll(&mut pipe, now).unwrap(), TransferState::Complete));
    }

    #[test]
    fn end_to_end_sender_to_receiver() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let now = Instant::now();
        let mut sender = XmodemSender::new(temp_file_with(&payload), payload.len() as u64, true, now);
        let out_file = tempfile::tempfile().unwrap();
        let mut receiver = XmodemReceiver::new(out_file.try_clone().unwrap(), CheckMode::Crc, false, now);

        let mut s_pipe = TestPipe::default();
        let mut r_pipe = TestPipe::default();
        drive(|| {
            let ss = sender.poll(&mut s_pipe, now).unwrap();
            r_pipe.feed(&s_pipe.take_outbound());
            let rs = receiver.poll(&mut r_pipe, now).unwrap();
            s_pipe.feed(&r_pipe.take_outbound());
            ss == TransferState::Complete && rs == TransferState::Complete
        });

        let mut result = Vec::new();
        let mut f = out_file;
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut result).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn corrupted_block_is_nakked_and_resent() {
        let payload = vec![0x55u8; 128];
        let now = Instant::now();
        let mut sender = XmodemSender::new(temp_file_with(&payload), 128, false, now);
        let mut pipe = TestPipe::default();

        pipe.feed(&[CRC_HANDSHAKE]);
        drive(|| {
            sender.poll(&mut pipe, now).unwrap();
            pipe.outbound.len() >= 133
        });
        let first = pipe.take_outbound();

        pipe.feed(&[NAK]);
        drive(|| {
            sender.poll(&mut pipe, now).unwrap();
            pipe.outbound.len() >= 133
        });
        let second = pipe.take_outbound();
        assert_eq!(first, second);
    }

    #[test]
    fn receiver_validates_sequence_complement() {
        let now = Instant::now();
        let out_file = tempfile::tempfile().unwrap();
        let mut receiver = XmodemReceiver::new(out_file, CheckMode::Crc, false, now);
        let mut pipe = TestPipe::default();

        // Initial handshake comes out first.
        drive(|| {
            receiver.poll(&mut pipe, now).unwrap();
            pipe.outbound.ends_with(&[CRC_HANDSHAKE])
        });
        pipe.take_outbound();

        // Send a block whose complement byte is wrong.
        let mut bad = encode_block(1, &[0u8; 128], CheckMode::Crc);
        bad[2] = 0x00;
        pipe.feed(&bad);
        drive(|| {
            receiver.poll(&mut pipe, now).unwrap();
            pipe.outbound.ends_with(&[NAK])
        });

        // A correct block is then ACKed.
        pipe.feed(&encode_block(1, &[0u8; 128], CheckMode::Crc));
        drive(|| {
            receiver.poll(&mut pipe, now).unwrap();
            pipe.outbound.ends_with(&[ACK])
        });
    }

    #[test]
    fn sequence_wraps_255_to_0() {
        // 256 blocks of 128 bytes: the 256th block carries seq 0.
        let payload = vec![0xA1u8; 128 * 256];
        let now = Instant::now();
        let mut sender = XmodemSender::new(temp_file_with(&payload), payload.len() as u64, false, now);
        let out_file = tempfile::tempfile().unwrap();
        let mut receiver = XmodemReceiver::new(out_file.try_clone().unwrap(), CheckMode::Crc, false, now);

        let mut s_pipe = TestPipe::default();
        let mut r_pipe = TestPipe::default();
        drive(|| {
            let ss = sender.poll(&mut s_pipe, now).unwrap();
            r_pipe.feed(&s_pipe.take_outbound());
            let rs = receiver.poll(&mut r_pipe, now).unwrap();
            s_pipe.feed(&r_pipe.take_outbound());
            ss == TransferState::Complete && rs == TransferState::Complete
        });
        assert_eq!(receiver.bytes_written(), payload.len() as u64);
    }

    #[test]
    fn double_can_aborts_sender() {
        let now = Instant::now();
        let mut sender = XmodemSender::new(temp_file_with(b"data"), 4, false, now);
        let mut pipe = TestPipe::default();
        pipe.feed(&[CAN, CAN]);
        assert!(matches!(
            sender.poll(&mut pipe, now),
            Err(TransferError::Cancelled)
        ));
    }

    #[test]
    fn trailing_padding_is_trimmed() {
        let payload = b"short".to_vec();
        let now = Instant::now();
        let mut sender = XmodemSender::new(temp_file_with(&payload), 5, false, now);
        let out_file = tempfile::tempfile().unwrap();
        let mut receiver = XmodemReceiver::new(out_file.try_clone().unwrap(), CheckMode::Crc, false, now);

        let mut s_pipe = TestPipe::default();
        let mut r_pipe = TestPipe::default();
        drive(|| {
            let ss = sender.poll(&mut s_pipe, now).unwrap();
            r_pipe.feed(&s_pipe.take_outbound());
            let rs = receiver.poll(&mut r_pipe, now).unwrap();
            s_pipe.feed(&r_pipe.take_outbound());
            ss == TransferState::Complete && rs == TransferState::Complete
        });

        let mut result = Vec::new();
        let mut f = out_file;
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut result).unwrap();
        assert_eq!(result, payload);
    }
}

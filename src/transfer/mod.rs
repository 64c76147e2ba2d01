//! Classic asynchronous file-transfer protocols.
//!
//! XMODEM (checksum/CRC/1K), YMODEM (batch, -G) and ZMODEM are implemented
//! as non-blocking state machines. Each machine is advanced by the session
//! scheduler through `poll`, consuming whatever bytes the line's input pipe
//! holds and emitting into the output pipe; no call ever blocks. Telnet IAC
//! transparency happens below this layer, in the transport.
//!
//! While a machine is active the owning line's transfer-active flag is set,
//! which suppresses the idle timeout and switches the transport to binary
//! mode.

pub mod crc;
pub mod xmodem;
pub mod ymodem;
pub mod zmodem;

use std::io;
use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Xmodem,
    XmodemCrc,
    Xmodem1k,
    Ymodem,
    YmodemG,
    Zmodem,
}

impl Protocol {
    /// Parse a script/menu protocol selector. Unknown names fall back to
    /// ZMODEM, the default offered to callers.
    pub fn from_name(name: &str) -> Protocol {
        match name.to_ascii_lowercase().as_str() {
            "xmodem" => Protocol::Xmodem,
            "xmodem-crc" | "xmodemcrc" => Protocol::XmodemCrc,
            "xmodem-1k" | "xmodem1k" => Protocol::Xmodem1k,
            "ymodem" => Protocol::Ymodem,
            "ymodem-g" | "ymodemg" => Protocol::YmodemG,
            _ => Protocol::Zmodem,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,
    #[error("cancelled by remote")]
    Cancelled,
    #[error("retry budget exhausted")]
    RetriesExhausted,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of one scheduler visit to a transfer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Complete,
}

/// Byte access to one line's pipe pair, as seen from a protocol machine.
/// The session runtime implements this over the pipe plane; tests implement
/// it over in-memory queues.
pub trait BytePipe {
    /// One byte from the remote, or `None` when the input pipe is empty.
    fn recv(&mut self) -> Option<u8>;
    /// Queue bytes toward the remote; returns how many were accepted.
    fn send(&mut self, data: &[u8]) -> usize;
    /// Free space in the outbound direction.
    fn send_free(&self) -> usize;
}

/// Staged outbound bytes that respect pipe backpressure. Machines stage a
/// whole block here and only advance state once it has fully drained.
#[derive(Debug, Default)]
pub struct OutBuf {
    buf: Vec<u8>,
    pos: usize,
}

impl OutBuf {
    pub fn stage(&mut self, data: &[u8]) {
        debug_assert!(self.is_empty());
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.pos = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Push as much staged data as the pipe will take.
    pub fn flush(&mut self, pipe: &mut dyn BytePipe) -> bool {
        if !self.is_empty() {
            self.pos += pipe.send(&self.buf[self.pos..]);
        }
        self.is_empty()
    }
}

/// Deadline helper: `None` deadline never fires.
pub(crate) fn expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map(|d| now >= d).unwrap_or(false)
}

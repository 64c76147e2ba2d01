//! Per-line byte pipe plane.
//!
//! Every line owns a pair of bounded ring buffers: *input* carries bytes from
//! the transport toward the session, *output* carries bytes from the session
//! toward the transport. This plane is the only mutable state shared between
//! the transport tasks and the session runtime; each direction has a single
//! writer and a single reader.
//!
//! Writers fail fast when a ring is full (the caller is told how many bytes
//! were accepted) and readers return `None` on empty rather than blocking.
//! Occupancy is summarised as a [`Watermark`] so idle readers can consult a
//! cheap signal instead of polling exact byte counts.

use std::sync::Mutex;

use thiserror::Error;

/// Upper bound on configured lines.
pub const MAX_LINES: usize = 32;

/// Ring capacity per direction.
pub const PIPE_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipeError {
    #[error("pipe full")]
    Full,
    #[error("no such line {0}")]
    BadLine(usize),
}

/// Cooperative backpressure signal derived from ring occupancy.
///
/// `High` means the writer should pause (ring is three-quarters full or
/// more); `Low` means a previously paused writer may resume (one quarter or
/// less). Between the two marks the signal holds `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    Low,
    Normal,
    High,
}

/// Snapshot of both directions of one line's pipe pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairStatus {
    pub input: Watermark,
    pub output: Watermark,
}

/// Fixed-capacity byte ring. Single producer, single consumer; all access
/// goes through the owning [`PipePair`] mutexes.
struct Ring {
    buf: Box<[u8]>,
    head: usize, // next read position
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Ring {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    fn push(&mut self, byte: u8) -> Result<(), PipeError> {
        if self.len == self.capacity() {
            return Err(PipeError::Full);
        }
        let tail = (self.head + self.len) % self.capacity();
        self.buf[tail] = byte;
        self.len += 1;
        Ok(())
    }

    /// Copy as much of `data` as fits; returns the number of bytes accepted.
    fn push_slice(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.free());
        for &b in &data[..take] {
            let tail = (self.head + self.len) % self.capacity();
            self.buf[tail] = b;
            self.len += 1;
        }
        take
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let b = self.buf[self.head];
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        Some(b)
    }

    fn peek(&self) -> Option<u8> {
        if self.len == 0 {
            None
        } else {
            Some(self.buf[self.head])
        }
    }

    /// Drain into `out`; returns bytes copied. Produces the same sequence a
    /// byte-at-a-time reader would observe.
    fn pop_slice(&mut self, out: &mut [u8]) -> usize {
        let take = out.len().min(self.len);
        for slot in out.iter_mut().take(take) {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % self.capacity();
            self.len -= 1;
        }
        take
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn watermark(&self) -> Watermark {
        let cap = self.capacity();
        if self.len >= cap - cap / 4 {
            Watermark::High
        } else if self.len <= cap / 4 {
            Watermark::Low
        } else {
            Watermark::Normal
        }
    }
}

/// One line's pair of rings.
pub struct PipePair {
    input: Mutex<Ring>,
    output: Mutex<Ring>,
}

impl PipePair {
    fn new(capacity: usize) -> Self {
        PipePair {
            input: Mutex::new(Ring::new(capacity)),
            output: Mutex::new(Ring::new(capacity)),
        }
    }
}

/// The fixed array of pipe pairs, indexed by line number.
pub struct PipePlane {
    pairs: Vec<PipePair>,
}

impl PipePlane {
    pub fn new(lines: usize) -> Self {
        let lines = lines.min(MAX_LINES);
        PipePlane {
            pairs: (0..lines).map(|_| PipePair::new(PIPE_CAPACITY)).collect(),
        }
    }

    pub fn lines(&self) -> usize {
        self.pairs.len()
    }

    fn pair(&self, line: usize) -> Result<&PipePair, PipeError> {
        self.pairs.get(line).ok_or(PipeError::BadLine(line))
    }

    // --- transport -> session -------------------------------------------

    pub fn push_input(&self, line: usize, byte: u8) -> Result<(), PipeError> {
        self.pair(line)?.input.lock().unwrap().push(byte)
    }

    pub fn enqueue_input(&self, line: usize, data: &[u8]) -> usize {
        match self.pair(line) {
            Ok(p) => p.input.lock().unwrap().push_slice(data),
            Err(_) => 0,
        }
    }

    pub fn dequeue_input(&self, line: usize) -> Option<u8> {
        self.pair(line).ok()?.input.lock().unwrap().pop()
    }

    pub fn peek_input(&self, line: usize) -> Option<u8> {
        self.pair(line).ok()?.input.lock().unwrap().peek()
    }

    pub fn read_input(&self, line: usize, out: &mut [u8]) -> usize {
        match self.pair(line) {
            Ok(p) => p.input.lock().unwrap().pop_slice(out),
            Err(_) => 0,
        }
    }

    pub fn input_available(&self, line: usize) -> usize {
        self.pair(line).map(|p| p.input.lock().unwrap().len).unwrap_or(0)
    }

    pub fn input_free(&self, line: usize) -> usize {
        self.pair(line).map(|p| p.input.lock().unwrap().free()).unwrap_or(0)
    }

    // --- session -> transport -------------------------------------------

    pub fn push_output(&self, line: usize, byte: u8) -> Result<(), PipeError> {
        self.pair(line)?.output.lock().unwrap().push(byte)
    }

    pub fn enqueue_output(&self, line: usize, data: &[u8]) -> usize {
        match self.pair(line) {
            Ok(p) => p.output.lock().unwrap().push_slice(data),
            Err(_) => 0,
        }
    }

    pub fn dequeue_output(&self, line: usize) -> Option<u8> {
        self.pair(line).ok()?.output.lock().unwrap().pop()
    }

    pub fn read_output(&self, line: usize, out: &mut [u8]) -> usize {
        match self.pair(line) {
            Ok(p) => p.output.lock().unwrap().pop_slice(out),
            Err(_) => 0,
        }
    }

    pub fn output_available(&self, line: usize) -> usize {
        self.pair(line).map(|p| p.output.lock().unwrap().len).unwrap_or(0)
    }

    pub fn output_free(&self, line: usize) -> usize {
        self.pair(line).map(|p| p.output.lock().unwrap().free()).unwrap_or(0)
    }

    // --- control ---------------------------------------------------------

    /// Empty both rings. Both locks are held together so a reader never sees
    /// one direction cleared and the other not.
    pub fn reset(&self, line: usize) {
        if let Ok(p) = self.pair(line) {
            let mut input = p.input.lock().unwrap();
            let mut output = p.output.lock().unwrap();
            input.clear();
            output.clear();
        }
    }

    pub fn status(&self, line: usize) -> PairStatus {
        match self.pair(line) {
            Ok(p) => PairStatus {
                input: p.input.lock().unwrap().watermark(),
                output: p.output.lock().unwrap().watermark(),
            },
            Err(_) => PairStatus {
                input: Watermark::Low,
                output: Watermark::Low,
            },
        }
    }
}

//! Telnet transport: RFC 854 option handling plus the binary/IAC
//! transparency the file-transfer protocols need.
//!
//! In normal mode incoming telnet commands are stripped and CR NUL becomes
//! CR. While the line's transfer-active flag is up, NUL passes through
//! untouched and `0xFF 0xFF` un-doubles to one `0xFF`; on the way out
//! every `0xFF` doubles, so the send path sizes its buffer for twice the
//! payload.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use super::{LineTable, TransportEvent};
use crate::config::{LineType, TelnetConfig};
use crate::pipe::PipePlane;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_BINARY: u8 = 0;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;

/// Initial negotiation: we echo, we suppress go-ahead, we want binary.
pub fn negotiation() -> Vec<u8> {
    vec![
        IAC, WILL, OPT_SGA,
        IAC, WILL, OPT_ECHO,
        IAC, DO, OPT_BINARY,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Data,
    SawCr,
    SawIac,
    SawVerb(u8),
    SubNeg,
    SubNegIac,
}

/// Incremental telnet stream codec. One per connection.
pub struct TelnetCodec {
    state: DecodeState,
    /// Options we have already answered, so repeated negotiation is
    /// acknowledged at most once.
    answered: HashSet<(u8, u8)>,
}

impl Default for TelnetCodec {
    fn default() -> Self {
        TelnetCodec { state: DecodeState::Data, answered: HashSet::new() }
    }
}

impl TelnetCodec {
    /// Decode inbound bytes. Clean payload lands in `out`; any negotiation
    /// responses we owe the peer land in `replies`.
    pub fn decode(&mut self, input: &[u8], binary: bool, out: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            match self.state {
                DecodeState::Data => match b {
                    IAC => self.state = DecodeState::SawIac,
                    b'\r' if !binary => {
                        out.push(b'\r');
                        self.state = DecodeState::SawCr;
                    }
                    0 if !binary => {} // stray NUL outside binary mode
                    _ => out.push(b),
                },
                DecodeState::SawCr => {
                    // CR NUL is a bare carriage return; CR LF keeps the LF.
                    match b {
                        0 => {}
                        IAC => self.state = DecodeState::SawIac,
                        _ => out.push(b),
                    }
                    if self.state == DecodeState::SawCr {
                        self.state = DecodeState::Data;
                    }
                }
                DecodeState::SawIac => match b {
                    IAC => {
                        // Doubled IAC is a data byte in binary mode and
                        // stripped otherwise.
                        if binary {
                            out.push(IAC);
                        }
                        self.state = DecodeState::Data;
                    }
                    WILL | WONT | DO | DONT => self.state = DecodeState::SawVerb(b),
                    SB => self.state = DecodeState::SubNeg,
                    _ => self.state = DecodeState::Data, // NOP, AYT, etc.
                },
                DecodeState::SawVerb(verb) => {
                    self.respond(verb, b, replies);
                    self.state = DecodeState::Data;
                }
                DecodeState::SubNeg => {
                    if b == IAC {
                        self.state = DecodeState::SubNegIac;
                    }
                }
                DecodeState::SubNegIac => {
                    self.state = if b == SE { DecodeState::Data } else { DecodeState::SubNeg };
                }
            }
        }
    }

    fn respond(&mut self, verb: u8, opt: u8, replies: &mut Vec<u8>) {
        if !self.answered.insert((verb, opt)) {
            return; // already answered this exact request once
        }
        match (verb, opt) {
            // Options we offered: agreement needs no counter-response.
            (DO, OPT_ECHO) | (DO, OPT_SGA) | (WILL, OPT_BINARY) => {}
            (DONT, OPT_ECHO) | (DONT, OPT_SGA) | (WONT, OPT_BINARY) => {}
            (DO, OPT_BINARY) => replies.extend_from_slice(&[IAC, WILL, OPT_BINARY]),
            (WILL, OPT_SGA) => replies.extend_from_slice(&[IAC, DO, OPT_SGA]),
            (DO, other) => replies.extend_from_slice(&[IAC, WONT, other]),
            (WILL, other) => replies.extend_from_slice(&[IAC, DONT, other]),
            _ => {}
        }
    }

    /// Encode outbound payload. Doubling every IAC means the output can be
    /// up to twice the input; the buffer is sized accordingly.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() * 2);
        for &b in payload {
            if b == IAC {
                out.push(IAC);
            }
            out.push(b);
        }
        out
    }
}

/// Accept loop. Each accepted socket claims a free telnet line and pumps
/// it until hangup or cancellation.
pub async fn run_listener(
    config: TelnetConfig,
    plane: Arc<PipePlane>,
    table: Arc<LineTable>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    info!("telnet listening on {}", listener.local_addr()?);
    loop {
        let (socket, peer) = listener.accept().await?;
        if !table.accepting() {
            debug!("rejecting {}: not accepting new connections", peer);
            continue; // dropped socket closes immediately
        }
        let Some(line) = table.claim_free(LineType::Telnet) else {
            debug!("rejecting {}: no free line", peer);
            continue;
        };
        let plane = plane.clone();
        let table = table.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let peer_label = peer.ip().to_string();
            info!("line {}: connect from {}", line, peer_label);
            let _ = events.send(TransportEvent::Connected { line, peer: peer_label });
            pump(socket, line, &plane, &table).await;
            table.lines[line].release();
            let _ = events.send(TransportEvent::Disconnected { line });
            info!("line {}: socket closed", line);
        });
    }
}

/// Move bytes between one socket and one pipe pair until either side goes
/// away. Backpressure: socket reads stall while the input pipe is full,
/// and the peer's TCP window stalls with them.
async fn pump(mut socket: TcpStream, line: usize, plane: &PipePlane, table: &LineTable) {
    let shared = &table.lines[line];
    let mut codec = TelnetCodec::default();
    let _ = socket.write_all(&negotiation()).await;

    let mut rx_buf = [0u8; 2048];
    let mut clean = Vec::with_capacity(2048);
    let mut replies = Vec::new();
    let mut out_buf = [0u8; 2048];
    // Carry-over for decoded input the pipe could not take yet.
    let mut pending_in: Vec<u8> = Vec::new();

    loop {
        if shared.cancel_requested() {
            return;
        }
        let binary = shared.transfer_active();

        // Retry input the pipe refused earlier before reading more.
        if !pending_in.is_empty() {
            let taken = plane.enqueue_input(line, &pending_in);
            pending_in.drain(..taken);
            if !pending_in.is_empty() {
                sleep(Duration::from_millis(5)).await;
                continue;
            }
        }

        // Drain session output toward the socket.
        let n = plane.read_output(line, &mut out_buf);
        if n > 0 {
            let wire = codec.encode(&out_buf[..n]);
            if socket.write_all(&wire).await.is_err() {
                return;
            }
            continue;
        }

        tokio::select! {
            read = socket.read(&mut rx_buf) => {
                match read {
                    Ok(0) | Err(_) => return, // remote hangup
                    Ok(n) => {
                        clean.clear();
                        replies.clear();
                        codec.decode(&rx_buf[..n], binary, &mut clean, &mut replies);
                        if !replies.is_empty() && socket.write_all(&replies).await.is_err() {
                            return;
                        }
                        let taken = plane.enqueue_input(line, &clean);
                        if taken < clean.len() {
                            pending_in.extend_from_slice(&clean[taken..]);
                        }
                    }
                }
            }
            _ = sleep(Duration::from_millis(10)) => {}
        }
    }
}

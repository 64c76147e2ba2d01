//! Serial transport. Each serial-typed line owns a UART opened through the
//! block driver's parameters (baud, word format, flow control). Carrier
//! detect drives the connect/disconnect lifecycle: DCD rising answers the
//! call, DCD falling hangs it up and re-initialises the port.
//!
//! `serialport` is synchronous, so every line gets a plain OS thread; the
//! scheduler sees the same [`TransportEvent`] stream the telnet listener
//! produces.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serialport::{DataBits, FlowControl as SpFlow, Parity, StopBits};
use tokio::sync::mpsc;

use super::{LineTable, TransportEvent};
use crate::config::{parse_word_format, FlowControl, SerialConfig};
use crate::pipe::PipePlane;

fn map_word_format(cfg: &SerialConfig) -> Result<(DataBits, Parity, StopBits)> {
    let (bits, parity, stop) = parse_word_format(&cfg.word_format)
        .ok_or_else(|| anyhow!("bad word format '{}'", cfg.word_format))?;
    let data_bits = match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };
    let parity = match parity {
        'E' => Parity::Even,
        'O' => Parity::Odd,
        _ => Parity::None,
    };
    let stop_bits = if stop == 2 { StopBits::Two } else { StopBits::One };
    Ok((data_bits, parity, stop_bits))
}

fn map_flow(flow: FlowControl) -> SpFlow {
    match flow {
        FlowControl::None => SpFlow::None,
        // DTR/DSR handshaking has no portable serialport selection; the
        // hardware pair is the closest match.
        FlowControl::Rts | FlowControl::Dtr => SpFlow::Hardware,
        FlowControl::Xon => SpFlow::Software,
    }
}

fn open_port(cfg: &SerialConfig) -> Result<Box<dyn serialport::SerialPort>> {
    let (data_bits, parity, stop_bits) = map_word_format(cfg)?;
    serialport::new(&cfg.device, cfg.baud)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(map_flow(cfg.flow))
        .timeout(Duration::from_millis(20))
        .open()
        .with_context(|| format!("opening {} via driver {}", cfg.device, cfg.driver))
}

/// Spawn the pump thread for one serial line.
pub fn spawn_line(
    line: usize,
    cfg: SerialConfig,
    plane: Arc<PipePlane>,
    table: Arc<LineTable>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let spawned = thread::Builder::new()
        .name(format!("serial-line-{}", line))
        .spawn(move || {
            info!(
                "line {}: serial driver {} port {} at {} baud ({}, {:?})",
                line, cfg.driver, cfg.port, cfg.baud, cfg.word_format, cfg.flow
            );
            loop {
                match open_port(&cfg) {
                    Ok(port) => pump(line, port, &plane, &table, &events),
                    Err(e) => {
                        warn!("line {}: {e:#}", line);
                        thread::sleep(Duration::from_secs(10));
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("line {}: serial pump thread failed to start: {}", line, e);
    }
}

/// One carrier lifetime (or one failed open cycle). Returns when the port
/// needs re-initialisation.
fn pump(
    line: usize,
    mut port: Box<dyn serialport::SerialPort>,
    plane: &PipePlane,
    table: &LineTable,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let shared = &table.lines[line];
    let mut carrier = false;
    let mut buf = [0u8; 512];
    let mut out = [0u8; 512];

    loop {
        let dcd = port.read_carrier_detect().unwrap_or(false);
        if dcd && !carrier {
            carrier = true;
            if !table.accepting() || !shared.claim() {
                // Busy or not accepting: drop DTR to refuse the call.
                let _ = port.write_data_terminal_ready(false);
                thread::sleep(Duration::from_secs(1));
                let _ = port.write_data_terminal_ready(true);
                carrier = false;
                continue;
            }
            info!("line {}: carrier up", line);
            let _ = events.send(TransportEvent::Connected { line, peer: "SERIAL".into() });
        }
        if !dcd && carrier {
            carrier = false;
            info!("line {}: carrier lost", line);
            shared.release();
            let _ = events.send(TransportEvent::Disconnected { line });
            // Caller re-initialises the port for the next call.
            return;
        }
        if carrier && shared.cancel_requested() {
            let _ = port.write_data_terminal_ready(false);
            carrier = false;
            shared.release();
            let _ = events.send(TransportEvent::Disconnected { line });
            let _ = port.write_data_terminal_ready(true);
            return;
        }

        if carrier {
            match port.read(&mut buf) {
                Ok(n) if n > 0 => {
                    let mut off = 0;
                    while off < n {
                        let taken = plane.enqueue_input(line, &buf[off..n]);
                        off += taken;
                        if taken == 0 {
                            thread::sleep(Duration::from_millis(5));
                        }
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("line {}: serial read failed: {}", line, e);
                    shared.release();
                    let _ = events.send(TransportEvent::Disconnected { line });
                    return;
                }
            }
            let pending = plane.read_output(line, &mut out);
            if pending > 0 {
                if let Err(e) = port.write_all(&out[..pending]) {
                    warn!("line {}: serial write failed: {}", line, e);
                    shared.release();
                    let _ = events.send(TransportEvent::Disconnected { line });
                    return;
                }
            }
        } else {
            thread::sleep(Duration::from_millis(50));
        }
    }
}

//! The BBS server: one event loop scheduling every line.
//!
//! Each tick the scheduler visits every connected line: it flushes output
//! backlog, advances the active file transfer by one protocol step, or
//! runs a bounded burst of script statements. No visit blocks, which is
//! what lets 32 lines plus transfers share one loop.
//!
//! Cancellation (remote hangup, sysop command, idle timeout, auth
//! strikeout) is a flag checked at the top of each visit: the transfer is
//! failed, the script stack dropped, the user unbound, the pipes cleared,
//! and the line returns to DISCONNECTED.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::{Config, LineType};
use crate::events::{call_log_record, CallStatus, UiCommand, UiEvent};
use crate::logutil::escape_log;
use crate::pipe::PipePlane;
use crate::script::interp::{Interp, StepOutcome};
use crate::script::Script;
use crate::session::{ActiveTransfer, HostCtx, LineState, Session};
use crate::storage::{FileRecord, Storage, UserRecord};
use crate::transfer::TransferState;
use crate::transport::{LineShared, LineTable, TransportEvent};

use super::LinePipe;

/// Script statements executed per line per scheduler visit.
const STEP_BUDGET: usize = 32;
/// Scheduler cadence.
const TICK: Duration = Duration::from_millis(20);
/// Blink cadence (2 Hz).
const BLINK: Duration = Duration::from_millis(500);

/// What the out-of-process shell holds: the event stream out and the
/// command channel in.
pub struct UiHandle {
    pub events: mpsc::UnboundedReceiver<UiEvent>,
    pub commands: mpsc::UnboundedSender<UiCommand>,
}

pub struct BbsServer {
    config: Arc<Config>,
    storage: Arc<Mutex<Storage>>,
    plane: Arc<PipePlane>,
    table: Arc<LineTable>,
    sessions: Vec<Session>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ui_events: mpsc::UnboundedSender<UiEvent>,
    ui_commands: mpsc::UnboundedReceiver<UiCommand>,
    chat_pager: bool,
    started: Instant,
}

impl BbsServer {
    /// Build the server and the handle the shell talks through.
    pub fn new(config: Arc<Config>, storage: Arc<Mutex<Storage>>) -> (Self, UiHandle) {
        let line_count = config.lines.len();
        let plane = Arc::new(PipePlane::new(line_count));
        let shared: Vec<LineShared> = config
            .lines
            .iter()
            .map(|l| LineShared::new(l.line_type, l.enabled))
            .collect();
        let table = Arc::new(LineTable::new(shared));
        let sessions = (0..line_count).map(Session::new).collect();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (ui_events, ui_events_rx) = mpsc::unbounded_channel();
        let (ui_commands_tx, ui_commands) = mpsc::unbounded_channel();
        let server = BbsServer {
            config,
            storage,
            plane,
            table,
            sessions,
            transport_tx,
            transport_rx,
            ui_events,
            ui_commands,
            chat_pager: false,
            started: Instant::now(),
        };
        let handle = UiHandle { events: ui_events_rx, commands: ui_commands_tx };
        (server, handle)
    }

    pub async fn call_total(&self) -> u64 {
        self.storage.lock().await.call_count()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn chat_pager(&self) -> bool {
        self.chat_pager
    }

    /// Run forever: transports, ticks, blink, UI commands.
    pub async fn run(mut self) -> Result<()> {
        for line in 0..self.sessions.len() {
            let _ = self.ui_events.send(UiEvent::LineRegistered { line });
        }

        tokio::spawn(crate::transport::telnet::run_listener(
            self.config.telnet.clone(),
            self.plane.clone(),
            self.table.clone(),
            self.transport_tx.clone(),
        ));

        #[cfg(feature = "serial")]
        for (line, lc) in self.config.lines.iter().enumerate() {
            if lc.line_type == LineType::Serial {
                if let Some(serial) = lc.serial.clone() {
                    crate::transport::serial::spawn_line(
                        line,
                        serial,
                        self.plane.clone(),
                        self.table.clone(),
                        self.transport_tx.clone(),
                    );
                }
            }
        }

        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut blink = interval(BLINK);
        blink.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "session runtime up: {} lines, telnet port {}",
            self.sessions.len(),
            self.config.telnet.port
        );

        let storage = self.storage.clone();
        loop {
            tokio::select! {
                Some(event) = self.transport_rx.recv() => {
                    let mut guard = storage.lock().await;
                    self.on_transport_event(event, &mut guard)?;
                }
                Some(cmd) = self.ui_commands.recv() => {
                    let mut guard = storage.lock().await;
                    self.on_ui_command(cmd, &mut guard)?;
                }
                _ = tick.tick() => {
                    let mut guard = storage.lock().await;
                    self.drive(&mut guard, Instant::now())?;
                }
                _ = blink.tick() => {
                    for session in &mut self.sessions {
                        if session.core.state != LineState::Disconnected {
                            let _ = session.core.terminal.tick_blink();
                        }
                    }
                }
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent, storage: &mut Storage) -> Result<()> {
        match event {
            TransportEvent::Connected { line, peer } => {
                self.begin_session(line, &peer, storage)?;
            }
            TransportEvent::Disconnected { line } => {
                // Transport saw the hangup first; tear the session down if
                // the scheduler has not already done so.
                if self.sessions[line].core.state != LineState::Disconnected {
                    self.end_session(line, CallStatus::Hungup, storage)?;
                }
            }
        }
        Ok(())
    }

    fn on_ui_command(&mut self, cmd: UiCommand, storage: &mut Storage) -> Result<()> {
        match cmd {
            UiCommand::DisconnectLine(line) => {
                if let Some(shared) = self.table.lines.get(line) {
                    shared.request_cancel();
                }
            }
            UiCommand::LogonLine(line) => {
                let is_local = self
                    .config
                    .lines
                    .get(line)
                    .map(|l| l.line_type == LineType::Local)
                    .unwrap_or(false);
                if is_local && self.table.lines[line].claim() {
                    self.begin_session(line, "LOCAL", storage)?;
                }
            }
            UiCommand::ViewLine(_) => {
                // Snoop is the shell's concern; the terminal grid is
                // available through `terminal_snapshot`.
            }
            UiCommand::SetAcceptingConnections(on) => {
                self.table.set_accepting(on);
                info!("accepting new connections: {}", on);
            }
            UiCommand::SetChatPager(on) => {
                self.chat_pager = on;
            }
        }
        Ok(())
    }

    /// The shell's snoop view: one row of the line's terminal grid.
    pub fn terminal_snapshot(&self, line: usize, row: usize) -> Option<String> {
        let session = self.sessions.get(line)?;
        if row >= crate::terminal::ROWS {
            return None;
        }
        let mut out = String::with_capacity(crate::terminal::COLS);
        for col in 0..crate::terminal::COLS {
            out.push(session.core.terminal.cell(row, col).ch);
        }
        Some(out)
    }

    fn begin_session(&mut self, line: usize, peer: &str, storage: &mut Storage) -> Result<()> {
        let now = Instant::now();
        self.sessions[line].connect(peer, now);
        self.plane.reset(line);
        storage.increment_call_count()?;
        let _ = self.ui_events.send(UiEvent::LineConnected {
            line,
            peer: peer.to_string(),
        });

        // Load the entry script; a missing script is a configuration
        // problem that still must not strand the caller.
        let main = &self.config.script.main;
        let path = PathBuf::from(&self.config.script.dir).join(format!("{}.bbs", main));
        match std::fs::read_to_string(&path) {
            Ok(source) => {
                self.sessions[line].interp = Some(Interp::new(Script::parse(main, &source)));
            }
            Err(e) => {
                warn!("line {}: cannot load entry script {}: {}", line, path.display(), e);
                self.plane
                    .enqueue_output(line, b"\r\nThis system is not available right now.\r\n");
                self.table.lines[line].request_cancel();
            }
        }
        info!("line {}: session started for {}", line, escape_log(peer));
        Ok(())
    }

    /// Tear down one line: abort the transfer, drop the script stack,
    /// unbind the user, clear the pipes, log the call.
    fn end_session(&mut self, line: usize, status: CallStatus, storage: &mut Storage) -> Result<()> {
        if self.sessions[line].core.state == LineState::Disconnected {
            return Ok(());
        }
        let user_id = self.sessions[line].core.user.as_ref().map(|u| u.id);
        let had_user = user_id.is_some();
        let was_transferring = self.sessions[line].core.transfer.is_some();
        self.sessions[line].disconnect();
        self.plane.reset(line);
        self.table.lines[line].set_transfer_active(false);
        self.table.lines[line].request_cancel(); // transport closes the socket

        if was_transferring {
            let _ = self.ui_events.send(UiEvent::TransferActive { line, active: false });
        }
        if had_user {
            let _ = self.ui_events.send(UiEvent::LineUserUnbound { line });
        }
        let _ = self.ui_events.send(UiEvent::LineDisconnected { line });

        storage.append_log("Calls", &call_log_record(Utc::now(), line, user_id, status))?;
        storage.append_log(
            &format!("Line_{}", line),
            &format!("{} call ended: {:?}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), status),
        )?;
        info!("line {}: session ended ({:?})", line, status);
        Ok(())
    }

    /// One scheduler pass over every line.
    fn drive(&mut self, storage: &mut Storage, now: Instant) -> Result<()> {
        // Snapshot for the `online` command before mutable iteration.
        let online: Vec<(usize, String, String)> = self
            .sessions
            .iter()
            .filter(|s| s.core.state == LineState::Authenticated)
            .map(|s| {
                (
                    s.core.line,
                    s.core.bound_user_name().unwrap_or("-").to_string(),
                    s.core.activity.clone(),
                )
            })
            .collect();

        for line in 0..self.sessions.len() {
            if self.sessions[line].core.state == LineState::Disconnected {
                continue;
            }

            if self.table.lines[line].cancel_requested()
                || self.sessions[line].core.hangup_requested
            {
                self.end_session(line, CallStatus::Aborted, storage)?;
                continue;
            }

            // Idle timeout, suppressed while a transfer runs.
            if !self.sessions[line].core.transfer_active {
                let idle = now.duration_since(self.sessions[line].core.last_input);
                if idle.as_secs() >= self.config.bbs.idle_timeout_secs {
                    info!("line {}: idle timeout", line);
                    self.plane
                        .enqueue_output(line, b"\r\nIdle too long; goodbye.\r\n");
                    self.end_session(line, CallStatus::Aborted, storage)?;
                    continue;
                }
            }

            if !self.sessions[line].pump_backlog(&self.plane) {
                continue; // output pipe full; let the transport drain it
            }

            if self.sessions[line].core.transfer.is_some() {
                self.advance_transfer(line, storage, now)?;
                continue;
            }

            self.run_script_burst(line, storage, &online, now)?;
        }
        Ok(())
    }

    fn run_script_burst(
        &mut self,
        line: usize,
        storage: &mut Storage,
        online: &[(usize, String, String)],
        now: Instant,
    ) -> Result<()> {
        let upload_dir = storage.root().join("Temp").join(format!("line{}", line));
        let online_filtered: Vec<(usize, String, String)> = online
            .iter()
            .filter(|(l, _, _)| *l != line)
            .cloned()
            .collect();
        let session = &mut self.sessions[line];
        let Some(interp) = session.interp.as_mut() else {
            return Ok(());
        };
        let mut outcome = StepOutcome::Suspended;
        {
            let mut host = HostCtx {
                core: &mut session.core,
                storage,
                plane: &self.plane,
                config: &self.config,
                online: &online_filtered,
                events: &self.ui_events,
                upload_dir,
            };
            for _ in 0..STEP_BUDGET {
                outcome = interp.step(&mut host, now);
                match outcome {
                    StepOutcome::Ran => {
                        if host.core.transfer.is_some() || host.core.hangup_requested {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
        if session.core.transfer.is_some() {
            self.table.lines[line].set_transfer_active(true);
        }
        match outcome {
            StepOutcome::Finished => {
                self.plane.enqueue_output(line, b"\r\nGoodbye!\r\n");
                self.end_session(line, CallStatus::Answered, storage)?;
            }
            StepOutcome::Disconnect => {
                self.end_session(line, CallStatus::Aborted, storage)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Advance the line's transfer by one protocol step.
    fn advance_transfer(&mut self, line: usize, storage: &mut Storage, now: Instant) -> Result<()> {
        let session = &mut self.sessions[line];
        let Some(transfer) = session.core.transfer.as_mut() else {
            return Ok(());
        };
        let mut pipe = LinePipe { plane: &self.plane, line };
        match transfer.poll(&mut pipe, now) {
            Ok(TransferState::Active) => {}
            Ok(TransferState::Complete) => {
                let finished = session.core.transfer.take().expect("polled above");
                session.core.transfer_active = false;
                // The idle clock restarts now that the timer is unsuppressed.
                session.core.last_input = now;
                self.table.lines[line].set_transfer_active(false);
                let _ = self.ui_events.send(UiEvent::TransferActive { line, active: false });
                if finished.is_receive() {
                    self.file_received(line, storage, finished)?;
                }
                if let Some(interp) = self.sessions[line].interp.as_mut() {
                    interp.finish_transfer();
                }
                info!(target: "fidobbs::xfer", "line {}: transfer complete", line);
            }
            Err(e) => {
                warn!(target: "fidobbs::xfer", "line {}: transfer failed: {}", line, e);
                session.core.transfer = None;
                session.core.transfer_active = false;
                session.core.last_input = now;
                self.table.lines[line].set_transfer_active(false);
                let _ = self.ui_events.send(UiEvent::TransferActive { line, active: false });
                self.plane.enqueue_output(line, b"\r\n[transfer failed]\r\n");
                if let Some(interp) = self.sessions[line].interp.as_mut() {
                    interp.finish_transfer();
                }
            }
        }
        Ok(())
    }

    /// Register uploaded files in the caller's selected file area.
    fn file_received(
        &mut self,
        line: usize,
        storage: &mut Storage,
        finished: ActiveTransfer,
    ) -> Result<()> {
        let user: Option<&UserRecord> = self.sessions[line].core.user.as_ref();
        let (base, area) = match user {
            Some(u) if !u.file_area.is_empty() => (u.file_base.clone(), u.file_area.clone()),
            _ => match storage.file_areas().first() {
                Some(a) => (a.base.clone(), a.tag.clone()),
                None => {
                    warn!("line {}: upload with no file area configured", line);
                    return Ok(());
                }
            },
        };
        let uploader = user.map(|u| u.id);
        let mut uploads = 0;
        for (path, name) in finished.received_files() {
            let payload = match std::fs::read(&path) {
                Ok(p) => p,
                Err(e) => {
                    warn!("line {}: uploaded file {} unreadable: {}", line, path.display(), e);
                    continue;
                }
            };
            let record = FileRecord {
                id: 0,
                base: base.clone(),
                area: area.clone(),
                deleted: false,
                access_level: 0,
                keys: 0,
                name,
                description: String::new(),
                uploader,
                uploaded: Utc::now(),
                size: payload.len() as u64,
                downloads: 0,
            };
            storage.add_file(record, &payload).context("filing upload")?;
            let _ = std::fs::remove_file(&path);
            uploads += 1;
        }
        if uploads > 0 {
            if let Some(user) = &mut self.sessions[line].core.user {
                user.uploads += uploads;
                let _ = storage.update_user(user.clone());
            }
        }
        Ok(())
    }
}

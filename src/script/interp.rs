//! Script execution engine.
//!
//! One [`Interp`] per session. The scheduler calls [`Interp::step`]; a
//! step executes at most one statement, or services the current wait
//! state, and returns. A session therefore never blocks the scheduler:
//! prompts, paging, ANSI detection and file transfers all park the
//! interpreter in a [`Wait`] and resume when the condition fires.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::{
    eval_condition, expand, parse_int, process_escapes, tokenize, Script, ScriptError,
};
use crate::storage::{AuthOutcome, UserRecord};
use crate::transfer::Protocol;

pub const MAX_FRAMES: usize = 8;
pub const MAX_IF_DEPTH: usize = 16;
const DEFAULT_ANSI_TIMEOUT_MS: u64 = 3000;

/// Host callbacks the interpreter drives. The session runtime implements
/// this against the pipe plane, terminal model, store and mail queues;
/// tests implement it in memory.
pub trait ScriptHost {
    /// Raw bytes toward the caller (output pipe plus terminal model).
    fn write(&mut self, bytes: &[u8]);
    /// One byte of caller input, if any.
    fn read_byte(&mut self) -> Option<u8>;
    /// System macro lookup (`%{hour}`, `%{userid}`, …).
    fn macro_value(&self, name: &str) -> Option<String>;
    fn screen_height(&self) -> usize {
        24
    }
    fn paging_enabled(&self) -> bool {
        true
    }
    fn has_key(&self, key: char) -> bool;
    fn random(&mut self, lo: i64, hi: i64) -> i64;
    /// Load a subscript's source by name.
    fn script_source(&self, name: &str) -> Result<String, ScriptError>;
    /// Load an ANSI art file for `anykey`.
    fn art(&mut self, name: &str) -> Option<Vec<u8>>;
    fn authenticate(&mut self, username: &str, password: &str) -> (AuthOutcome, Option<UserRecord>);
    fn bind_user(&mut self, user: UserRecord);
    fn username_taken(&self, name: &str) -> bool;
    fn register_user(
        &mut self,
        username: &str,
        password: &str,
        real_name: &str,
        contact: &str,
    ) -> Result<UserRecord, String>;
    /// `(line, username, activity)` for every other bound line.
    fn online_list(&self) -> Vec<(usize, String, String)>;
    fn set_activity(&mut self, text: &str);
    fn begin_send_file(&mut self, id: u32, protocol: Protocol) -> Result<(), String>;
    fn begin_receive_file(&mut self, name: Option<&str>, protocol: Protocol) -> Result<(), String>;
    fn send_mail(&mut self, to: &str, subject: &str, body: &str) -> Result<(), String>;
    fn send_netmail(&mut self, addr: &str, to: &str, subject: &str, body: &str) -> Result<(), String>;
    /// `(area tag, new item count)` rows plus the side effect of advancing
    /// the user's last-scan stamp.
    fn login_scan(&mut self) -> Vec<(String, usize)>;
    fn message_areas(&self) -> Vec<(String, String)>;
    fn file_areas(&self) -> Vec<(String, String)>;
    fn select_message_area(&mut self, tag: &str) -> bool;
    fn select_file_area(&mut self, tag: &str) -> bool;
    fn ansi_detected(&mut self, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One statement ran; call again when the scheduler next visits.
    Ran,
    /// Parked in a wait state.
    Suspended,
    /// Script (and all frames) completed.
    Finished,
    /// The script asked for the line to drop.
    Disconnect,
}

#[derive(Debug, Clone)]
enum Block {
    If,
    For { var: String, end: i64, step: i64, body_pc: usize },
    While { line: usize },
}

struct Frame {
    script: Rc<Script>,
    pc: usize,
    blocks: Vec<Block>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogKind {
    Logon,
    NewUser,
}

#[derive(Debug)]
struct Dialog {
    kind: DialogKind,
    stage: usize,
    echo: bool,
    buf: String,
    attempts: u8,
    fields: Vec<String>,
}

enum Wait {
    Key { var: String, line_mode: bool, echo: bool, buf: String },
    YesNo { var: String },
    AnyKey,
    Paging { pending: Vec<u8> },
    AnsiReply { var: String, deadline: Instant, saw_csi: bool },
    Transfer,
    Dialog(Dialog),
}

enum Flow {
    Next,
    Jump(usize),
    /// A wait state was set; stay on the next line when it clears.
    Stay,
    Return,
    Stop,
}

pub struct Interp {
    frames: Vec<Frame>,
    vars: HashMap<String, String>,
    wait: Option<Wait>,
    lines_since_pause: usize,
    paging_aborted: bool,
    more_override: Option<bool>,
}

impl Interp {
    pub fn new(main: Script) -> Self {
        Interp {
            frames: vec![Frame { script: Rc::new(main), pc: 0, blocks: Vec::new() }],
            vars: HashMap::new(),
            wait: None,
            lines_since_pause: 0,
            paging_aborted: false,
            more_override: None,
        }
    }

    pub fn is_waiting_transfer(&self) -> bool {
        matches!(self.wait, Some(Wait::Transfer))
    }

    /// The session calls this when an active transfer ends.
    pub fn finish_transfer(&mut self) {
        if self.is_waiting_transfer() {
            self.wait = None;
        }
    }

    pub fn var(&self, name: &str) -> Option<&String> {
        self.vars.get(&name.to_ascii_lowercase())
    }

    fn set_var(&mut self, name: &str, value: String) {
        self.vars.insert(name.to_ascii_lowercase(), value);
    }

    fn expand(&self, host: &dyn ScriptHost, s: &str) -> String {
        expand(s, &self.vars, &|name| host.macro_value(name))
    }

    // --- output & paging ------------------------------------------------

    fn paging_active(&self, host: &dyn ScriptHost) -> bool {
        !self.paging_aborted && self.more_override.unwrap_or_else(|| host.paging_enabled())
    }

    /// Write through the pager: suspends with the remainder pending when a
    /// screenful has gone out.
    fn emit(&mut self, host: &mut dyn ScriptHost, data: &[u8]) {
        if !self.paging_active(host) {
            host.write(data);
            return;
        }
        let threshold = host.screen_height().saturating_sub(1).max(1);
        for (i, b) in data.iter().enumerate() {
            if *b == b'\n' {
                self.lines_since_pause += 1;
                if self.lines_since_pause >= threshold {
                    host.write(&data[..=i]);
                    host.write(b"\x1b[7mMore?\x1b[0m");
                    self.wait = Some(Wait::Paging { pending: data[i + 1..].to_vec() });
                    return;
                }
            }
        }
        host.write(data);
    }

    // --- the scheduler entry point --------------------------------------

    pub fn step(&mut self, host: &mut dyn ScriptHost, now: Instant) -> StepOutcome {
        if self.wait.is_some() {
            return self.service_wait(host, now);
        }
        let Some(frame) = self.frames.last_mut() else {
            return StepOutcome::Finished;
        };
        if frame.pc >= frame.script.lines.len() {
            // EOF acts as return.
            self.frames.pop();
            return if self.frames.is_empty() {
                StepOutcome::Finished
            } else {
                StepOutcome::Ran
            };
        }
        let pc = frame.pc;
        let line = frame.script.lines[pc].clone();
        let tokens = tokenize(&line);
        if tokens.is_empty() || line.ends_with(':') && tokens.len() == 1 {
            self.frames.last_mut().expect("checked").pc += 1;
            return StepOutcome::Ran;
        }

        match self.exec(host, &tokens, pc) {
            Ok(Flow::Next) => {
                if let Some(f) = self.frames.last_mut() {
                    if f.pc == pc {
                        f.pc += 1;
                    }
                }
                StepOutcome::Ran
            }
            Ok(Flow::Jump(target)) => {
                if let Some(f) = self.frames.last_mut() {
                    f.pc = target;
                }
                StepOutcome::Ran
            }
            Ok(Flow::Stay) => {
                if let Some(f) = self.frames.last_mut() {
                    if f.pc == pc {
                        f.pc += 1;
                    }
                }
                StepOutcome::Suspended
            }
            Ok(Flow::Return) => {
                self.frames.pop();
                if self.frames.is_empty() {
                    StepOutcome::Finished
                } else {
                    StepOutcome::Ran
                }
            }
            Ok(Flow::Stop) => {
                self.frames.clear();
                StepOutcome::Finished
            }
            Err(e) => self.script_error(host, e),
        }
    }

    /// Script errors print a bracketed token, abandon the erring frame,
    /// and resume the caller; a top-frame error finishes the session.
    fn script_error(&mut self, host: &mut dyn ScriptHost, e: ScriptError) -> StepOutcome {
        host.write(format!("\r\n[script error: {}]\r\n", e).as_bytes());
        self.frames.pop();
        if self.frames.is_empty() {
            StepOutcome::Disconnect
        } else {
            StepOutcome::Ran
        }
    }

    // --- statement execution --------------------------------------------

    fn exec(
        &mut self,
        host: &mut dyn ScriptHost,
        tokens: &[String],
        pc: usize,
    ) -> Result<Flow, ScriptError> {
        let cmd = tokens[0].to_ascii_lowercase();
        match cmd.as_str() {
            "print" => {
                let text = self.expand(host, &tokens[1..].join(" "));
                let bytes = process_escapes(&text).into_bytes();
                self.emit(host, &bytes);
                if self.wait.is_some() {
                    return Ok(Flow::Stay);
                }
                Ok(Flow::Next)
            }
            "set" => {
                if tokens.len() < 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                let value = tokens.get(2..).map(|t| t.join(" ")).unwrap_or_default();
                self.set_var(&tokens[1], value);
                Ok(Flow::Next)
            }
            "add" | "sub" | "mul" | "div" | "mod" => {
                if tokens.len() != 4 {
                    return Err(ScriptError::Syntax(pc));
                }
                let a = parse_int(&self.expand(host, &tokens[2]));
                let b = parse_int(&self.expand(host, &tokens[3]));
                let value = match cmd.as_str() {
                    "add" => a.wrapping_add(b),
                    "sub" => a.wrapping_sub(b),
                    "mul" => a.wrapping_mul(b),
                    // Division and modulo by zero read as zero rather than
                    // erroring.
                    "div" => {
                        if b == 0 {
                            0
                        } else {
                            a.wrapping_div(b)
                        }
                    }
                    _ => {
                        if b == 0 {
                            0
                        } else {
                            a.wrapping_rem(b)
                        }
                    }
                };
                self.set_var(&tokens[1], value.to_string());
                Ok(Flow::Next)
            }
            "random" => {
                if tokens.len() != 4 {
                    return Err(ScriptError::Syntax(pc));
                }
                let lo = parse_int(&self.expand(host, &tokens[2]));
                let hi = parse_int(&self.expand(host, &tokens[3]));
                let value = host.random(lo.min(hi), lo.max(hi));
                self.set_var(&tokens[1], value.to_string());
                Ok(Flow::Next)
            }
            "strlen" => {
                if tokens.len() != 3 {
                    return Err(ScriptError::Syntax(pc));
                }
                let s = self.expand(host, &tokens[2]);
                self.set_var(&tokens[1], s.chars().count().to_string());
                Ok(Flow::Next)
            }
            "haskey" => {
                if tokens.len() != 3 {
                    return Err(ScriptError::Syntax(pc));
                }
                let key = self.expand(host, &tokens[2]).chars().next().unwrap_or(' ');
                let value = if host.has_key(key) { "1" } else { "0" };
                self.set_var(&tokens[1], value.to_string());
                Ok(Flow::Next)
            }
            "detectansi" => {
                if tokens.len() < 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                let ms = tokens
                    .get(2)
                    .map(|t| parse_int(&self.expand(host, t)) as u64)
                    .unwrap_or(DEFAULT_ANSI_TIMEOUT_MS);
                host.write(b"\x1b[6n");
                self.wait = Some(Wait::AnsiReply {
                    var: tokens[1].clone(),
                    deadline: Instant::now() + Duration::from_millis(ms),
                    saw_csi: false,
                });
                Ok(Flow::Stay)
            }
            "cls" => {
                host.write(b"\x1b[2J\x1b[H");
                self.lines_since_pause = 0;
                Ok(Flow::Next)
            }
            "fgbg" => {
                if tokens.len() != 3 {
                    return Err(ScriptError::Syntax(pc));
                }
                let f = parse_int(&self.expand(host, &tokens[1])).clamp(0, 15) as u8;
                let b = parse_int(&self.expand(host, &tokens[2])).clamp(0, 7) as u8;
                let bold = if f >= 8 { 1 } else { 0 };
                host.write(format!("\x1b[{};{};{}m", bold, 30 + (f & 7), 40 + b).as_bytes());
                Ok(Flow::Next)
            }
            "bold" => {
                host.write(b"\x1b[1m");
                Ok(Flow::Next)
            }
            "std" => {
                host.write(b"\x1b[0m");
                Ok(Flow::Next)
            }
            "flash" => {
                let on = tokens.get(1).map(|t| t == "1").unwrap_or(true);
                host.write(if on { &b"\x1b[5m"[..] } else { &b"\x1b[25m"[..] });
                Ok(Flow::Next)
            }
            "prompt" => {
                if tokens.len() < 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                let line_mode = !tokens.iter().any(|t| t.eq_ignore_ascii_case("char"));
                let echo = !tokens.iter().any(|t| t.eq_ignore_ascii_case("noecho"));
                self.wait = Some(Wait::Key {
                    var: tokens[1].clone(),
                    line_mode,
                    echo,
                    buf: String::new(),
                });
                Ok(Flow::Stay)
            }
            "readline" => {
                if tokens.len() < 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                let echo = !tokens.iter().any(|t| t.eq_ignore_ascii_case("noecho"));
                self.wait = Some(Wait::Key {
                    var: tokens[1].clone(),
                    line_mode: true,
                    echo,
                    buf: String::new(),
                });
                Ok(Flow::Stay)
            }
            "yesno" => {
                if tokens.len() != 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                self.wait = Some(Wait::YesNo { var: tokens[1].clone() });
                Ok(Flow::Stay)
            }
            "anykey" => {
                if let Some(name) = tokens.get(1) {
                    let name = self.expand(host, name);
                    if let Some(art) = host.art(&name) {
                        self.emit(host, &art);
                    }
                }
                match self.wait {
                    // Paging fired inside the art; the anykey wait follows
                    // once it drains. Re-running anykey would re-show the
                    // art, so chain via the pager's own key wait instead.
                    Some(_) => Ok(Flow::Stay),
                    None => {
                        self.wait = Some(Wait::AnyKey);
                        Ok(Flow::Stay)
                    }
                }
            }
            "more" => {
                let on = tokens.get(1).map(|t| t == "1").unwrap_or(true);
                self.more_override = Some(on);
                Ok(Flow::Next)
            }
            "logon" => {
                host.write(b"\r\nUsername: ");
                self.wait = Some(Wait::Dialog(Dialog {
                    kind: DialogKind::Logon,
                    stage: 0,
                    echo: true,
                    buf: String::new(),
                    attempts: 0,
                    fields: Vec::new(),
                }));
                Ok(Flow::Stay)
            }
            "newuser" => {
                host.write(b"\r\nChoose a username: ");
                self.wait = Some(Wait::Dialog(Dialog {
                    kind: DialogKind::NewUser,
                    stage: 0,
                    echo: true,
                    buf: String::new(),
                    attempts: 0,
                    fields: Vec::new(),
                }));
                Ok(Flow::Stay)
            }
            "online" => {
                let mut out = String::from("\r\nLine  User             Doing\r\n");
                for (line, user, doing) in host.online_list() {
                    out.push_str(&format!("{:<5} {:<16} {}\r\n", line, user, doing));
                }
                let bytes = out.into_bytes();
                self.emit(host, &bytes);
                if self.wait.is_some() {
                    return Ok(Flow::Stay);
                }
                Ok(Flow::Next)
            }
            "script" => {
                if tokens.len() != 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                if self.frames.len() >= MAX_FRAMES {
                    return Err(ScriptError::StackOverflow);
                }
                let name = self.expand(host, &tokens[1]);
                let source = host.script_source(&name)?;
                let script = Script::parse(&name, &source);
                // Advance the caller past the `script` line first.
                if let Some(f) = self.frames.last_mut() {
                    f.pc += 1;
                }
                self.frames.push(Frame { script: Rc::new(script), pc: 0, blocks: Vec::new() });
                Ok(Flow::Jump(0))
            }
            "return" => Ok(Flow::Return),
            "stop" => Ok(Flow::Stop),
            "doing" => {
                let text = self.expand(host, &tokens[1..].join(" "));
                host.set_activity(&text);
                Ok(Flow::Next)
            }
            "sendfile" => {
                if tokens.len() < 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                let id = parse_int(&self.expand(host, &tokens[1])) as u32;
                let proto = Protocol::from_name(tokens.get(2).map(|s| s.as_str()).unwrap_or(""));
                match host.begin_send_file(id, proto) {
                    Ok(()) => {
                        self.wait = Some(Wait::Transfer);
                        Ok(Flow::Stay)
                    }
                    Err(e) => {
                        host.write(format!("\r\n[{}]\r\n", e).as_bytes());
                        Ok(Flow::Next)
                    }
                }
            }
            "receivefile" => {
                let mut name = None;
                let mut proto = Protocol::Zmodem;
                for t in &tokens[1..] {
                    match t.to_ascii_lowercase().as_str() {
                        "xmodem" | "xmodem-crc" | "xmodem-1k" | "ymodem" | "ymodem-g" | "zmodem" => {
                            proto = Protocol::from_name(t);
                        }
                        _ => name = Some(self.expand(host, t)),
                    }
                }
                match host.begin_receive_file(name.as_deref(), proto) {
                    Ok(()) => {
                        self.wait = Some(Wait::Transfer);
                        Ok(Flow::Stay)
                    }
                    Err(e) => {
                        host.write(format!("\r\n[{}]\r\n", e).as_bytes());
                        Ok(Flow::Next)
                    }
                }
            }
            "sendmail" => {
                if tokens.len() != 4 {
                    return Err(ScriptError::Syntax(pc));
                }
                let to = self.expand(host, &tokens[1]);
                let subject = self.expand(host, &tokens[2]);
                let body = process_escapes(&self.expand(host, &tokens[3]));
                if let Err(e) = host.send_mail(&to, &subject, &body) {
                    host.write(format!("\r\n[{}]\r\n", e).as_bytes());
                }
                Ok(Flow::Next)
            }
            "sendnetmail" => {
                if tokens.len() != 5 {
                    return Err(ScriptError::Syntax(pc));
                }
                let addr = self.expand(host, &tokens[1]);
                let to = self.expand(host, &tokens[2]);
                let subject = self.expand(host, &tokens[3]);
                let body = process_escapes(&self.expand(host, &tokens[4]));
                if let Err(e) = host.send_netmail(&addr, &to, &subject, &body) {
                    host.write(format!("\r\n[{}]\r\n", e).as_bytes());
                }
                Ok(Flow::Next)
            }
            "messagebase" | "filebase" => {
                let is_msg = cmd == "messagebase";
                match tokens.get(1).map(|t| t.to_ascii_lowercase()).as_deref() {
                    Some("select") => {
                        let tag = self.expand(host, tokens.get(2).map(|s| s.as_str()).unwrap_or(""));
                        let ok = if is_msg {
                            host.select_message_area(&tag)
                        } else {
                            host.select_file_area(&tag)
                        };
                        if !ok {
                            host.write(format!("\r\n[no such area: {}]\r\n", tag).as_bytes());
                        }
                        Ok(Flow::Next)
                    }
                    Some("list") => {
                        let areas = if is_msg { host.message_areas() } else { host.file_areas() };
                        let mut out = String::from("\r\n");
                        for (tag, name) in areas {
                            out.push_str(&format!("{:<20} {}\r\n", tag, name));
                        }
                        let bytes = out.into_bytes();
                        self.emit(host, &bytes);
                        if self.wait.is_some() {
                            return Ok(Flow::Stay);
                        }
                        Ok(Flow::Next)
                    }
                    _ => Err(ScriptError::Syntax(pc)),
                }
            }
            "loginscan" => {
                let rows = host.login_scan();
                let mut out = String::from("\r\nNew since your last call:\r\n");
                if rows.is_empty() {
                    out.push_str("  (nothing new)\r\n");
                }
                for (area, count) in rows {
                    out.push_str(&format!("  {:<20} {:>5} new\r\n", area, count));
                }
                let bytes = out.into_bytes();
                self.emit(host, &bytes);
                if self.wait.is_some() {
                    return Ok(Flow::Stay);
                }
                Ok(Flow::Next)
            }
            "goto" => {
                if tokens.len() != 2 {
                    return Err(ScriptError::Syntax(pc));
                }
                let label = tokens[1].to_ascii_lowercase();
                let frame = self.frames.last_mut().expect("in exec");
                match frame.script.labels.get(&label) {
                    Some(&target) => {
                        // A jump abandons any blocks opened on the way.
                        frame.blocks.clear();
                        Ok(Flow::Jump(target))
                    }
                    None => Err(ScriptError::UndefinedLabel(tokens[1].clone())),
                }
            }
            "if" => self.exec_if(host, tokens, pc),
            "else" => {
                let frame = self.frames.last_mut().expect("in exec");
                if !matches!(frame.blocks.last(), Some(Block::If)) {
                    return Err(ScriptError::UnbalancedBlock(pc));
                }
                frame.blocks.pop();
                let end = find_endif(&frame.script, pc + 1)?;
                Ok(Flow::Jump(end + 1))
            }
            "end" if tokens.get(1).map(|t| t.eq_ignore_ascii_case("if")).unwrap_or(false) => {
                self.exec_endif(pc)
            }
            "endif" => self.exec_endif(pc),
            "for" => self.exec_for(host, tokens, pc),
            "endfor" => self.exec_endfor(pc),
            "while" => self.exec_while(host, tokens, pc),
            "endwhile" => {
                let frame = self.frames.last_mut().expect("in exec");
                match frame.blocks.last() {
                    Some(Block::While { line }) => Ok(Flow::Jump(*line)),
                    _ => Err(ScriptError::UnbalancedBlock(pc)),
                }
            }
            "break" => self.exec_break(pc),
            "continue" => self.exec_continue(pc),
            _ => Err(ScriptError::Syntax(pc)),
        }
    }

    // --- control flow ----------------------------------------------------

    fn exec_if(
        &mut self,
        host: &mut dyn ScriptHost,
        tokens: &[String],
        pc: usize,
    ) -> Result<Flow, ScriptError> {
        let then_idx = tokens
            .iter()
            .position(|t| t.eq_ignore_ascii_case("then"))
            .ok_or(ScriptError::Syntax(pc))?;
        let cond = eval_condition(&tokens[1..then_idx], &self.vars, &|n| host.macro_value(n))
            .map_err(|_| ScriptError::Syntax(pc))?;
        let mut rest: &[String] = &tokens[then_idx + 1..];
        // Inline form: `if cond then <statement> [end if]` on one line.
        if !rest.is_empty() {
            if rest.len() >= 2
                && rest[rest.len() - 2].eq_ignore_ascii_case("end")
                && rest[rest.len() - 1].eq_ignore_ascii_case("if")
            {
                rest = &rest[..rest.len() - 2];
            } else if rest.last().map(|t| t.eq_ignore_ascii_case("endif")).unwrap_or(false) {
                rest = &rest[..rest.len() - 1];
            }
            if rest.is_empty() {
                return Err(ScriptError::Syntax(pc));
            }
            if cond {
                return self.exec(host, &rest.to_vec(), pc);
            }
            return Ok(Flow::Next);
        }
        // Block form.
        let frame = self.frames.last_mut().expect("in exec");
        let depth = frame.blocks.iter().filter(|b| matches!(b, Block::If)).count();
        if depth >= MAX_IF_DEPTH {
            return Err(ScriptError::NestingTooDeep(pc));
        }
        if cond {
            frame.blocks.push(Block::If);
            return Ok(Flow::Next);
        }
        match find_else_or_endif(&frame.script, pc + 1)? {
            (target, true) => {
                // Run the else branch; its endif pops the block.
                frame.blocks.push(Block::If);
                Ok(Flow::Jump(target + 1))
            }
            (target, false) => Ok(Flow::Jump(target + 1)),
        }
    }

    fn exec_endif(&mut self, pc: usize) -> Result<Flow, ScriptError> {
        let frame = self.frames.last_mut().expect("in exec");
        match frame.blocks.last() {
            Some(Block::If) => {
                frame.blocks.pop();
                Ok(Flow::Next)
            }
            _ => Err(ScriptError::UnbalancedBlock(pc)),
        }
    }

    fn exec_for(
        &mut self,
        host: &mut dyn ScriptHost,
        tokens: &[String],
        pc: usize,
    ) -> Result<Flow, ScriptError> {
        // for v = a to b [step s]
        if tokens.len() < 6
            || tokens[2] != "="
            || !tokens[4].eq_ignore_ascii_case("to")
        {
            return Err(ScriptError::Syntax(pc));
        }
        let var = tokens[1].clone();
        let start = parse_int(&self.expand(host, &tokens[3]));
        let end = parse_int(&self.expand(host, &tokens[5]));
        let step = if tokens.len() >= 8 && tokens[6].eq_ignore_ascii_case("step") {
            parse_int(&self.expand(host, &tokens[7]))
        } else {
            1
        };
        if step == 0 {
            return Err(ScriptError::Syntax(pc));
        }
        self.set_var(&var, start.to_string());
        let entered = if step > 0 { start <= end } else { start >= end };
        let frame = self.frames.last_mut().expect("in exec");
        if entered {
            frame.blocks.push(Block::For { var, end, step, body_pc: pc + 1 });
            Ok(Flow::Next)
        } else {
            let target = find_loop_end(&frame.script, pc + 1)?;
            Ok(Flow::Jump(target + 1))
        }
    }

    fn exec_endfor(&mut self, pc: usize) -> Result<Flow, ScriptError> {
        let (var, end, step, body_pc) = {
            let frame = self.frames.last().expect("in exec");
            match frame.blocks.last() {
                Some(Block::For { var, end, step, body_pc }) => {
                    (var.clone(), *end, *step, *body_pc)
                }
                _ => return Err(ScriptError::UnbalancedBlock(pc)),
            }
        };
        let next = parse_int(self.vars.get(&var.to_ascii_lowercase()).map(|s| s.as_str()).unwrap_or("0"))
            .wrapping_add(step);
        self.set_var(&var, next.to_string());
        let keep = if step > 0 { next <= end } else { next >= end };
        let frame = self.frames.last_mut().expect("in exec");
        if keep {
            Ok(Flow::Jump(body_pc))
        } else {
            frame.blocks.pop();
            Ok(Flow::Next)
        }
    }

    fn exec_while(
        &mut self,
        host: &mut dyn ScriptHost,
        tokens: &[String],
        pc: usize,
    ) -> Result<Flow, ScriptError> {
        let cond = eval_condition(&tokens[1..], &self.vars, &|n| host.macro_value(n))
            .map_err(|_| ScriptError::Syntax(pc))?;
        let frame = self.frames.last_mut().expect("in exec");
        let looping = matches!(frame.blocks.last(), Some(Block::While { line }) if *line == pc);
        if cond {
            if !looping {
                frame.blocks.push(Block::While { line: pc });
            }
            Ok(Flow::Next)
        } else {
            if looping {
                frame.blocks.pop();
            }
            let target = find_loop_end(&frame.script, pc + 1)?;
            Ok(Flow::Jump(target + 1))
        }
    }

    fn innermost_loop(&self) -> Option<usize> {
        let frame = self.frames.last()?;
        frame
            .blocks
            .iter()
            .rposition(|b| matches!(b, Block::For { .. } | Block::While { .. }))
    }

    fn exec_break(&mut self, pc: usize) -> Result<Flow, ScriptError> {
        let loop_idx = self.innermost_loop().ok_or(ScriptError::UnbalancedBlock(pc))?;
        let frame = self.frames.last_mut().expect("in exec");
        let target = find_loop_end(&frame.script, pc + 1)?;
        frame.blocks.truncate(loop_idx);
        Ok(Flow::Jump(target + 1))
    }

    fn exec_continue(&mut self, pc: usize) -> Result<Flow, ScriptError> {
        let loop_idx = self.innermost_loop().ok_or(ScriptError::UnbalancedBlock(pc))?;
        let frame = self.frames.last_mut().expect("in exec");
        // Drop the if-blocks opened since the loop body began.
        frame.blocks.truncate(loop_idx + 1);
        match &frame.blocks[loop_idx] {
            Block::For { .. } => {
                // Jump to the endfor so the increment and test run.
                let target = find_loop_end(&frame.script, pc + 1)?;
                Ok(Flow::Jump(target))
            }
            Block::While { line } => Ok(Flow::Jump(*line)),
            Block::If => unreachable!("innermost_loop skips if blocks"),
        }
    }

    // --- wait servicing --------------------------------------------------

    fn service_wait(&mut self, host: &mut dyn ScriptHost, now: Instant) -> StepOutcome {
        // Dialogs own multi-stage state and are advanced out-of-band so
        // the wait value can be consumed cleanly.
        if matches!(self.wait, Some(Wait::Dialog(_))) {
            let Some(Wait::Dialog(mut dialog)) = self.wait.take() else {
                unreachable!("just matched");
            };
            if self.collect_input(host, true, dialog.echo, &mut dialog.buf) {
                let line = std::mem::take(&mut dialog.buf);
                return self.advance_dialog(host, dialog, line);
            }
            self.wait = Some(Wait::Dialog(dialog));
            return StepOutcome::Suspended;
        }
        let mut wait = self.wait.take().expect("caller checked");
        let outcome = match &mut wait {
            Wait::Key { var, line_mode, echo, buf } => {
                if self.collect_input(host, *line_mode, *echo, buf) {
                    let var = var.clone();
                    let value = std::mem::take(buf);
                    self.set_var(&var, value);
                    return StepOutcome::Ran;
                }
                StepOutcome::Suspended
            }
            Wait::YesNo { var } => loop {
                match host.read_byte() {
                    Some(b @ (b'Y' | b'y')) | Some(b @ (b'N' | b'n')) => {
                        host.write(&[b]);
                        host.write(b"\r\n");
                        let value = if b.eq_ignore_ascii_case(&b'y') { "1" } else { "0" };
                        let var = var.clone();
                        self.set_var(&var, value.to_string());
                        return StepOutcome::Ran;
                    }
                    Some(_) => continue,
                    None => break StepOutcome::Suspended,
                }
            },
            Wait::AnyKey => {
                if host.read_byte().is_some() {
                    return StepOutcome::Ran;
                }
                StepOutcome::Suspended
            }
            Wait::Paging { pending } => match host.read_byte() {
                Some(b) => {
                    host.write(b"\r\x1b[K");
                    self.lines_since_pause = 0;
                    if matches!(b, b'q' | b'Q' | b'n' | b'N' | 0x03) {
                        // Abandon paging for the rest of the session and
                        // drop what was still queued.
                        self.paging_aborted = true;
                        return StepOutcome::Ran;
                    }
                    let rest = std::mem::take(pending);
                    self.wait = None;
                    self.emit(host, &rest);
                    return StepOutcome::Ran;
                }
                None => StepOutcome::Suspended,
            },
            Wait::AnsiReply { var, deadline, saw_csi } => {
                loop {
                    match host.read_byte() {
                        Some(0x1b) => *saw_csi = false,
                        Some(b'[') => *saw_csi = true,
                        Some(b'R') if *saw_csi => {
                            let var = var.clone();
                            host.ansi_detected(true);
                            self.set_var(&var, "1".to_string());
                            return StepOutcome::Ran;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                if now >= *deadline {
                    let var = var.clone();
                    host.ansi_detected(false);
                    self.set_var(&var, "0".to_string());
                    return StepOutcome::Ran;
                }
                StepOutcome::Suspended
            }
            Wait::Transfer => StepOutcome::Suspended,
            Wait::Dialog(_) => unreachable!("handled above"),
        };
        if matches!(outcome, StepOutcome::Suspended) {
            self.wait = Some(wait);
        }
        outcome
    }

    /// Line/char collection with echo and backspace handling. Returns true
    /// when the input is complete (always for char mode).
    fn collect_input(
        &mut self,
        host: &mut dyn ScriptHost,
        line_mode: bool,
        echo: bool,
        buf: &mut String,
    ) -> bool {
        while let Some(b) = host.read_byte() {
            if !line_mode {
                buf.push(b as char);
                if echo {
                    host.write(&[b]);
                }
                return true;
            }
            match b {
                b'\r' => {
                    host.write(b"\r\n");
                    return true;
                }
                b'\n' => {} // CR already handled; stray LF ignored
                0x08 | 0x7f => {
                    if buf.pop().is_some() && echo {
                        host.write(b"\x08 \x08");
                    }
                }
                0x20..=0x7e => {
                    buf.push(b as char);
                    if echo {
                        host.write(&[b]);
                    } else {
                        host.write(b"*");
                    }
                }
                _ => {}
            }
        }
        false
    }

    fn advance_dialog(
        &mut self,
        host: &mut dyn ScriptHost,
        mut dialog: Dialog,
        line: String,
    ) -> StepOutcome {
        match (dialog.kind, dialog.stage) {
            (DialogKind::Logon, 0) => {
                if line.trim().is_empty() {
                    host.write(b"Username: ");
                    self.wait = Some(Wait::Dialog(dialog));
                    return StepOutcome::Suspended;
                }
                dialog.fields.push(line.trim().to_string());
                dialog.stage = 1;
                dialog.echo = false;
                host.write(b"Password: ");
                self.wait = Some(Wait::Dialog(dialog));
                StepOutcome::Suspended
            }
            (DialogKind::Logon, _) => {
                let name = dialog.fields[0].clone();
                let (outcome, user) = host.authenticate(&name, &line);
                match (outcome, user) {
                    (AuthOutcome::Success, Some(user)) => {
                        host.write(b"\r\n");
                        host.bind_user(user);
                        StepOutcome::Ran
                    }
                    (AuthOutcome::Locked, _) => {
                        host.write(b"\r\nThis account is locked.\r\n");
                        StepOutcome::Ran
                    }
                    _ => {
                        // Fall through to the script's failure path; the
                        // session counts strikes and hangs up at three.
                        host.write(b"\r\nLogin incorrect.\r\n");
                        StepOutcome::Ran
                    }
                }
            }
            (DialogKind::NewUser, 0) => {
                let name = line.trim().to_string();
                let problem = if name.is_empty() {
                    Some("A name is required.")
                } else if host.username_taken(&name) {
                    Some("That name is already taken.")
                } else {
                    None
                };
                if let Some(msg) = problem {
                    dialog.attempts += 1;
                    if dialog.attempts >= 3 {
                        host.write(b"\r\nGiving up.\r\n");
                        return StepOutcome::Ran;
                    }
                    host.write(format!("\r\n{}\r\nChoose a username: ", msg).as_bytes());
                    self.wait = Some(Wait::Dialog(dialog));
                    return StepOutcome::Suspended;
                }
                dialog.fields.push(name);
                dialog.stage = 1;
                dialog.echo = false;
                host.write(b"Choose a password: ");
                self.wait = Some(Wait::Dialog(dialog));
                StepOutcome::Suspended
            }
            (DialogKind::NewUser, 1) => {
                dialog.fields.push(line);
                dialog.stage = 2;
                dialog.echo = true;
                host.write(b"\r\nYour real name: ");
                self.wait = Some(Wait::Dialog(dialog));
                StepOutcome::Suspended
            }
            (DialogKind::NewUser, 2) => {
                dialog.fields.push(line.trim().to_string());
                dialog.stage = 3;
                host.write(b"Contact (e-mail): ");
                self.wait = Some(Wait::Dialog(dialog));
                StepOutcome::Suspended
            }
            (DialogKind::NewUser, _) => {
                let contact = line.trim().to_string();
                let name = dialog.fields[0].clone();
                let pass = dialog.fields[1].clone();
                let real = dialog.fields[2].clone();
                match host.register_user(&name, &pass, &real, &contact) {
                    Ok(user) => {
                        host.write(b"\r\nWelcome aboard!\r\n");
                        host.bind_user(user);
                    }
                    Err(e) => {
                        host.write(format!("\r\n[{}]\r\n", e).as_bytes());
                    }
                }
                StepOutcome::Ran
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Block scanning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    BlockIf,
    Else,
    EndIf,
    For,
    EndFor,
    While,
    EndWhile,
    Other,
}

fn classify(line: &str) -> LineKind {
    let tokens = tokenize(line);
    let Some(first) = tokens.first() else {
        return LineKind::Other;
    };
    match first.to_ascii_lowercase().as_str() {
        "if" => {
            match tokens.iter().position(|t| t.eq_ignore_ascii_case("then")) {
                // Only a block-form if participates in nesting.
                Some(idx) if idx == tokens.len() - 1 => LineKind::BlockIf,
                _ => LineKind::Other,
            }
        }
        "else" => LineKind::Else,
        "end" if tokens.get(1).map(|t| t.eq_ignore_ascii_case("if")).unwrap_or(false) => {
            LineKind::EndIf
        }
        "endif" => LineKind::EndIf,
        "for" => LineKind::For,
        "endfor" => LineKind::EndFor,
        "while" => LineKind::While,
        "endwhile" => LineKind::EndWhile,
        _ => LineKind::Other,
    }
}

fn find_else_or_endif(script: &Script, from: usize) -> Result<(usize, bool), ScriptError> {
    let mut depth = 0usize;
    for (i, line) in script.lines.iter().enumerate().skip(from) {
        match classify(line) {
            LineKind::BlockIf => depth += 1,
            LineKind::Else if depth == 0 => return Ok((i, true)),
            LineKind::EndIf => {
                if depth == 0 {
                    return Ok((i, false));
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Err(ScriptError::UnbalancedBlock(from))
}

fn find_endif(script: &Script, from: usize) -> Result<usize, ScriptError> {
    let mut depth = 0usize;
    for (i, line) in script.lines.iter().enumerate().skip(from) {
        match classify(line) {
            LineKind::BlockIf => depth += 1,
            LineKind::EndIf => {
                if depth == 0 {
                    return Ok(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Err(ScriptError::UnbalancedBlock(from))
}

/// Matching `endfor`/`endwhile` for the loop the scan starts inside.
fn find_loop_end(script: &Script, from: usize) -> Result<usize, ScriptError> {
    let mut depth = 0usize;
    for (i, line) in script.lines.iter().enumerate().skip(from) {
        match classify(line) {
            LineKind::For | LineKind::While => depth += 1,
            LineKind::EndFor | LineKind::EndWhile => {
                if depth == 0 {
                    return Ok(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Err(ScriptError::UnbalancedBlock(from))
}

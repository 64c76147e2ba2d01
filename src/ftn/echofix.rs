//! AreaFix/FileFix request processing.
//!
//! Netmail addressed to one of the robot names is parsed as a request:
//! the first body line is the password, each following line a command
//! (`+TAG`, `-TAG`, bare `TAG` toggles, `%LIST`, `%QUERY`, `%HELP`,
//! `%PAUSE`, `%RESUME`). Subscriptions are runtime state kept beside the
//! spool, seeded from the configured downlink lists; the configuration
//! itself stays immutable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::DownlinkConfig;
use crate::storage::{write_file_atomic, AreaRecord};
use crate::validation::{wildcard_match, wildcard_match_any};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixKind {
    Area,
    File,
}

/// Recognise the robot a netmail is addressed to.
pub fn fix_robot(to_name: &str) -> Option<FixKind> {
    match to_name.to_ascii_lowercase().as_str() {
        "areafix" | "areamgr" | "raid" => Some(FixKind::Area),
        "filefix" | "filemgr" | "filescan" | "allfix" => Some(FixKind::File),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixCommand {
    Subscribe(String),
    Unsubscribe(String),
    Toggle(String),
    List,
    Query,
    Help,
    Pause,
    Resume,
}

/// Split a request body into `(password, commands)`. Processing stops at a
/// tearline.
pub fn parse_request(body: &str) -> (String, Vec<FixCommand>) {
    let mut lines = body.lines().map(|l| l.trim_end_matches('\r'));
    let password = lines.next().unwrap_or_default().trim().to_string();
    let mut commands = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('\x01') {
            continue;
        }
        if line.starts_with("---") {
            break;
        }
        if let Some(cmd) = line.strip_prefix('%') {
            match cmd.split_whitespace().next().unwrap_or_default().to_ascii_uppercase().as_str() {
                "LIST" => commands.push(FixCommand::List),
                "QUERY" => commands.push(FixCommand::Query),
                "HELP" => commands.push(FixCommand::Help),
                "PAUSE" => commands.push(FixCommand::Pause),
                "RESUME" => commands.push(FixCommand::Resume),
                _ => {}
            }
        } else if let Some(tag) = line.strip_prefix('+') {
            commands.push(FixCommand::Subscribe(tag.trim().to_ascii_uppercase()));
        } else if let Some(tag) = line.strip_prefix('-') {
            commands.push(FixCommand::Unsubscribe(tag.trim().to_ascii_uppercase()));
        } else {
            commands.push(FixCommand::Toggle(
                line.split_whitespace().next().unwrap_or_default().to_ascii_uppercase(),
            ));
        }
    }
    (password, commands)
}

// ---------------------------------------------------------------------------
// Runtime subscription state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubState {
    pub echoes: Vec<String>,
    pub files: Vec<String>,
    pub paused: bool,
}

impl SubState {
    pub fn list_for(&self, kind: FixKind) -> &[String] {
        match kind {
            FixKind::Area => &self.echoes,
            FixKind::File => &self.files,
        }
    }

    fn list_mut(&mut self, kind: FixKind) -> &mut Vec<String> {
        match kind {
            FixKind::Area => &mut self.echoes,
            FixKind::File => &mut self.files,
        }
    }
}

/// Subscription state for every downlink, persisted as one JSON file next
/// to the mail spool.
pub struct SubscriptionStore {
    path: PathBuf,
    map: HashMap<String, SubState>,
}

impl SubscriptionStore {
    /// Load, seeding any downlink not yet present from its configured
    /// subscription lists.
    pub fn load(path: &Path, downlinks: &[DownlinkConfig]) -> Result<Self> {
        let map: HashMap<String, SubState> = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        let mut store = SubscriptionStore { path: path.to_path_buf(), map };
        for d in downlinks {
            store.map.entry(d.address.clone()).or_insert_with(|| SubState {
                echoes: d.subscriptions.iter().map(|s| s.to_ascii_uppercase()).collect(),
                files: d.file_subscriptions.iter().map(|s| s.to_ascii_uppercase()).collect(),
                paused: d.paused,
            });
        }
        Ok(store)
    }

    pub fn state(&self, address: &str) -> SubState {
        self.map.get(address).cloned().unwrap_or_default()
    }

    pub fn state_mut(&mut self, address: &str) -> &mut SubState {
        self.map.entry(address.to_string()).or_default()
    }

    /// Is `address` subscribed to `tag`?
    pub fn subscribed(&self, address: &str, kind: FixKind, tag: &str) -> bool {
        self.map
            .get(address)
            .map(|s| s.list_for(kind).iter().any(|t| t.eq_ignore_ascii_case(tag)))
            .unwrap_or(false)
    }

    pub fn save(&self) -> Result<()> {
        write_file_atomic(&self.path, serde_json::to_string_pretty(&self.map)?.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Request processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FixReply {
    pub subject: String,
    pub text: String,
    pub authenticated: bool,
    pub changed: bool,
}

fn area_allowed(kind: FixKind, downlink: &DownlinkConfig, area: &AreaRecord) -> bool {
    let pattern = match kind {
        FixKind::Area => &downlink.allowed_echoes,
        FixKind::File => &downlink.allowed_files,
    };
    if !wildcard_match_any(pattern, &area.tag) {
        return false;
    }
    if downlink.allowed_groups.is_empty() || area.groups.is_empty() {
        return true;
    }
    area.groups
        .iter()
        .any(|g| downlink.allowed_groups.iter().any(|a| wildcard_match(a, g)))
}

/// Run one request against a downlink's subscription state. The reply text
/// reports the outcome of every command line; the caller wraps it in a
/// netmail back to the requester.
pub fn process_request(
    kind: FixKind,
    downlink: &DownlinkConfig,
    state: &mut SubState,
    areas: &[AreaRecord],
    body: &str,
) -> FixReply {
    let robot = match kind {
        FixKind::Area => "AreaFix",
        FixKind::File => "FileFix",
    };
    let (password, commands) = parse_request(body);
    if !password.eq_ignore_ascii_case(&downlink.areafix_password) {
        return FixReply {
            subject: format!("{} request denied", robot),
            text: "Request rejected: bad password.\r".into(),
            authenticated: false,
            changed: false,
        };
    }

    let mut text = String::new();
    let mut changed = false;
    for cmd in commands {
        match cmd {
            FixCommand::Subscribe(tag) | FixCommand::Toggle(tag)
                if !state.list_for(kind).iter().any(|t| t == &tag) =>
            {
                let area = areas.iter().find(|a| a.tag.eq_ignore_ascii_case(&tag));
                match area {
                    None => text.push_str(&format!("{}: no such area\r", tag)),
                    Some(a) if !area_allowed(kind, downlink, a) => {
                        text.push_str(&format!("{}: not available to your system\r", tag));
                    }
                    Some(_) if state.list_for(kind).len() >= downlink.max_echoes => {
                        text.push_str(&format!("{}: subscription limit reached\r", tag));
                    }
                    Some(_) => {
                        state.list_mut(kind).push(tag.clone());
                        state.list_mut(kind).sort();
                        changed = true;
                        text.push_str(&format!("{}: subscribed\r", tag));
                    }
                }
            }
            FixCommand::Subscribe(tag) => {
                text.push_str(&format!("{}: already subscribed\r", tag));
            }
            FixCommand::Unsubscribe(tag) | FixCommand::Toggle(tag) => {
                let list = state.list_mut(kind);
                let before = list.len();
                list.retain(|t| !t.eq_ignore_ascii_case(&tag));
                if list.len() != before {
                    changed = true;
                    text.push_str(&format!("{}: unsubscribed\r", tag));
                } else {
                    text.push_str(&format!("{}: not subscribed\r", tag));
                }
            }
            FixCommand::List => {
                text.push_str("Available areas:\r");
                for a in areas {
                    if !area_allowed(kind, downlink, a) {
                        continue;
                    }
                    let mark = if state.list_for(kind).iter().any(|t| t == &a.tag) {
                        '*'
                    } else {
                        ' '
                    };
                    text.push_str(&format!("{} {:<24} {}\r", mark, a.tag, a.name));
                }
            }
            FixCommand::Query => {
                text.push_str("Current subscriptions:\r");
                for t in state.list_for(kind) {
                    text.push_str(&format!("  {}\r", t));
                }
            }
            FixCommand::Help => {
                text.push_str(concat!(
                    "Commands, one per line after the password line:\r",
                    "  +TAG    subscribe\r",
                    "  -TAG    unsubscribe\r",
                    "  TAG     toggle\r",
                    "  %LIST   list available areas\r",
                    "  %QUERY  list current subscriptions\r",
                    "  %PAUSE  stop receiving mail\r",
                    "  %RESUME resume receiving mail\r",
                ));
            }
            FixCommand::Pause => {
                state.paused = true;
                changed = true;
                text.push_str("Mail paused.\r");
            }
            FixCommand::Resume => {
                state.paused = false;
                changed = true;
                text.push_str("Mail resumed.\r");
            }
        }
    }
    if text.is_empty() {
        text.push_str("No commands found in request.\r");
    }
    FixReply {
        subject: format!("{} results", robot),
        text,
        authenticated: true,
        changed,
    }
}

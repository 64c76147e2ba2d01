//! Configuration management.
//!
//! The whole system is driven by one TOML file parsed into the typed
//! [`Config`]. Workers treat the loaded configuration as immutable; runtime
//! toggles (accepting connections, chat pager) live in the server, not here.
//!
//! Sections:
//! - `[bbs]` - identity, line count, idle timeout
//! - `[[line]]` - per-line type and serial parameters
//! - `[telnet]` - listener binding
//! - `[storage]` - persistent state root
//! - `[script]` - script directory and entry script
//! - `[ftn]` - AKAs, domains, uplinks, downlinks, areas, origin lines
//! - `[logging]` - level and log files

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::ftn::addr::FtnAddress;
use crate::pipe::MAX_LINES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bbs: BbsConfig,
    #[serde(rename = "line", default)]
    pub lines: Vec<LineConfig>,
    #[serde(default)]
    pub telnet: TelnetConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub ftn: FtnConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbsConfig {
    pub name: String,
    pub sysop: String,
    pub location: String,
    /// Seconds of no input before a session is disconnected. Suspended
    /// while a file transfer is active.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Default "More?" paging threshold when a user has no preference.
    #[serde(default = "default_screen_height")]
    pub screen_height: u8,
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_screen_height() -> u8 {
    24
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineType {
    Telnet,
    Serial,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(rename = "type", default = "default_line_type")]
    pub line_type: LineType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Serial parameters; required when `type = "serial"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialConfig>,
}

fn default_line_type() -> LineType {
    LineType::Telnet
}

fn default_true() -> bool {
    true
}

/// Flow control selections for serial lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    /// RTS/CTS hardware handshaking.
    Rts,
    /// XON/XOFF in-band handshaking.
    Xon,
    /// DTR/DSR hardware handshaking.
    Dtr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Block-driver name, kept as an opaque string for log/diagnostic use.
    pub driver: String,
    pub port: u8,
    pub baud: u32,
    /// `[bits][parity][stop]`, e.g. `8N1`, `7E1`.
    #[serde(default = "default_word_format")]
    pub word_format: String,
    #[serde(default = "default_flow")]
    pub flow: FlowControl,
    /// Device path handed to the serial stack, e.g. `/dev/ttyS0`.
    pub device: String,
}

fn default_word_format() -> String {
    "8N1".to_string()
}

fn default_flow() -> FlowControl {
    FlowControl::Rts
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelnetConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        TelnetConfig { bind: "0.0.0.0".into(), port: 23 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the persistent state tree (Resources/, MsgBases/, FTN/, Logs/).
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub dir: String,
    /// Entry script run on connect.
    pub main: String,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        ScriptConfig { dir: "Scripts".into(), main: "main".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FtnConfig {
    pub enabled: bool,
    /// Our addresses, primary first. Parsed into [`FtnAddress`] on load.
    #[serde(default)]
    pub akas: Vec<String>,
    /// Default domain for addresses written without one.
    #[serde(default = "default_domain")]
    pub default_domain: String,
    /// Origin lines appended to exported echomail; one is picked at random.
    #[serde(default)]
    pub origin_lines: Vec<String>,
    /// Seconds between outbound poll attempts.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// BinkP listener; 0 disables answering.
    #[serde(default = "default_binkp_port")]
    pub binkp_port: u16,
    /// Directory of files servable via FREQ.
    #[serde(default)]
    pub freq_dir: String,
    // Sub-tables stay after the scalar keys so the section serializes as
    // valid TOML.
    #[serde(rename = "uplink", default)]
    pub uplinks: Vec<UplinkConfig>,
    #[serde(rename = "downlink", default)]
    pub downlinks: Vec<DownlinkConfig>,
    #[serde(rename = "message_area", default)]
    pub message_areas: Vec<AreaConfig>,
    #[serde(rename = "file_area", default)]
    pub file_areas: Vec<AreaConfig>,
}

fn default_domain() -> String {
    "fidonet".to_string()
}

fn default_poll_interval() -> u64 {
    3600
}

fn default_binkp_port() -> u16 {
    24554
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    pub address: String,
    /// Explicit host; empty means resolve via the nodelist index.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_binkp_port")]
    pub port: u16,
    pub password: String,
    /// Echo groups carried by this uplink; empty means all.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Default flavour for mail routed through this uplink.
    #[serde(default = "default_flavour")]
    pub flavour: String,
    /// Route all otherwise-unroutable netmail here.
    #[serde(default)]
    pub default_route: bool,
}

fn default_flavour() -> String {
    "normal".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownlinkConfig {
    pub address: String,
    pub password: String,
    /// AreaFix/FileFix request password.
    pub areafix_password: String,
    /// Wildcard patterns of echo tags this downlink may subscribe to.
    #[serde(default)]
    pub allowed_echoes: String,
    #[serde(default)]
    pub allowed_files: String,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default = "default_max_echoes")]
    pub max_echoes: usize,
    /// Current echomail subscriptions, maintained by AreaFix.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub file_subscriptions: Vec<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_flavour")]
    pub flavour: String,
}

fn default_max_echoes() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    /// Echo tag, e.g. `R50.SYSOP`. Matched case-insensitively.
    pub tag: String,
    pub name: String,
    /// Message or file base this area belongs to.
    pub base: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub read_level: u8,
    #[serde(default)]
    pub post_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            file: Some("fidobbs.log".into()),
            security_file: Some("fidobbs-security.log".into()),
        }
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    /// Structural checks that cannot be expressed in serde alone.
    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(anyhow!("at least one [[line]] must be configured"));
        }
        if self.lines.len() > MAX_LINES {
            return Err(anyhow!("too many lines configured (maximum {})", MAX_LINES));
        }
        let locals = self.lines.iter().filter(|l| l.line_type == LineType::Local).count();
        if locals != 1 {
            return Err(anyhow!("exactly one local line is required, found {}", locals));
        }
        for (i, line) in self.lines.iter().enumerate() {
            if line.line_type == LineType::Serial {
                let serial = line
                    .serial
                    .as_ref()
                    .ok_or_else(|| anyhow!("line {} is serial but has no [line.serial] table", i))?;
                if !(300..=115_200).contains(&serial.baud) {
                    return Err(anyhow!("line {}: baud {} out of range 300-115200", i, serial.baud));
                }
                parse_word_format(&serial.word_format)
                    .ok_or_else(|| anyhow!("line {}: bad word format '{}'", i, serial.word_format))?;
            }
        }
        if self.ftn.enabled {
            if self.ftn.akas.is_empty() {
                return Err(anyhow!("[ftn] enabled but no akas configured"));
            }
            for aka in &self.ftn.akas {
                FtnAddress::from_str(aka).map_err(|e| anyhow!("bad aka: {e}"))?;
            }
            for up in &self.ftn.uplinks {
                FtnAddress::from_str(&up.address).map_err(|e| anyhow!("bad uplink: {e}"))?;
            }
            for down in &self.ftn.downlinks {
                FtnAddress::from_str(&down.address).map_err(|e| anyhow!("bad downlink: {e}"))?;
            }
        }
        Ok(())
    }

    /// Our parsed AKAs, primary first. `validate` has already checked them.
    pub fn akas(&self) -> Vec<FtnAddress> {
        self.ftn
            .akas
            .iter()
            .filter_map(|s| FtnAddress::from_str(s).ok())
            .map(|a| {
                if a.domain.is_empty() {
                    let domain = self.ftn.default_domain.clone();
                    a.with_domain(&domain)
                } else {
                    a
                }
            })
            .collect()
    }

    pub fn primary_aka(&self) -> Option<FtnAddress> {
        self.akas().into_iter().next()
    }

    /// Message areas indexed by uppercased tag.
    pub fn message_area_map(&self) -> HashMap<String, &AreaConfig> {
        self.ftn
            .message_areas
            .iter()
            .map(|a| (a.tag.to_ascii_uppercase(), a))
            .collect()
    }

    pub fn file_area_map(&self) -> HashMap<String, &AreaConfig> {
        self.ftn
            .file_areas
            .iter()
            .map(|a| (a.tag.to_ascii_uppercase(), a))
            .collect()
    }
}

/// Parse `[bits][parity][stop]` into `(data_bits, parity, stop_bits)`.
/// Bits 5-8, parity N/E/O, stop 1-2.
pub fn parse_word_format(s: &str) -> Option<(u8, char, u8)> {
    let bytes = s.as_bytes();
    if bytes.len() != 3 {
        return None;
    }
    let bits = (bytes[0] as char).to_digit(10)? as u8;
    if !(5..=8).contains(&bits) {
        return None;
    }
    let parity = (bytes[1] as char).to_ascii_uppercase();
    if !matches!(parity, 'N' | 'E' | 'O') {
        return None;
    }
    let stop = (bytes[2] as char).to_digit(10)? as u8;
    if !(1..=2).contains(&stop) {
        return None;
    }
    Some((bits, parity, stop))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bbs: BbsConfig {
                name: "fidobbs".to_string(),
                sysop: "Sysop".to_string(),
                location: "Somewhere".to_string(),
                idle_timeout_secs: default_idle_timeout(),
                screen_height: default_screen_height(),
            },
            lines: vec![
                LineConfig { line_type: LineType::Local, enabled: true, serial: None },
                LineConfig { line_type: LineType::Telnet, enabled: true, serial: None },
                LineConfig { line_type: LineType::Telnet, enabled: true, serial: None },
                LineConfig { line_type: LineType::Telnet, enabled: true, serial: None },
            ],
            telnet: TelnetConfig::default(),
            storage: StorageConfig { root: "./bbs-data".to_string() },
            script: ScriptConfig::default(),
            ftn: FtnConfig {
                enabled: false,
                akas: vec![],
                default_domain: default_domain(),
                uplinks: vec![],
                downlinks: vec![],
                message_areas: vec![],
                file_areas: vec![],
                origin_lines: vec!["fidobbs system".to_string()],
                poll_interval_secs: default_poll_interval(),
                binkp_port: default_binkp_port(),
                freq_dir: String::new(),
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn word_formats() {
        assert_eq!(parse_word_format("8N1"), Some((8, 'N', 1)));
        assert_eq!(parse_word_format("7e2"), Some((7, 'E', 2)));
        assert_eq!(parse_word_format("9N1"), None);
        assert_eq!(parse_word_format("8X1"), None);
        assert_eq!(parse_word_format("8N3"), None);
        assert_eq!(parse_word_format("8N"), None);
    }

    #[test]
    fn rejects_two_local_lines() {
        let mut cfg = Config::default();
        cfg.lines.push(LineConfig {
            line_type: LineType::Local,
            enabled: true,
            serial: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn serial_line_needs_parameters() {
        let mut cfg = Config::default();
        cfg.lines.push(LineConfig {
            line_type: LineType::Serial,
            enabled: true,
            serial: None,
        });
        assert!(cfg.validate().is_err());
        cfg.lines.last_mut().unwrap().serial = Some(SerialConfig {
            driver: "InternalPC".into(),
            port: 1,
            baud: 57_600,
            word_format: "8N1".into(),
            flow: FlowControl::Rts,
            device: "/dev/ttyS0".into(),
        });
        cfg.validate().unwrap();
    }

    #[test]
    fn ftn_section_parses_akas() {
        let mut cfg = Config::default();
        cfg.ftn.enabled = true;
        assert!(cfg.validate().is_err()); // no AKA
        cfg.ftn.akas = vec!["2:250/6".into()];
        cfg.validate().unwrap();
        let akas = cfg.akas();
        assert_eq!(akas[0].domain, "fidonet");
        assert_eq!(cfg.primary_aka().unwrap().to_string(), "2:250/6@fidonet");
    }

    #[test]
    fn toml_round_trip() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.lines.len(), cfg.lines.len());
        assert_eq!(back.telnet.port, 23);
    }
}

//! Shared fixtures for the integration suites.

use std::path::Path;

use fidobbs::config::{AreaConfig, Config, UplinkConfig};
use fidobbs::storage::Storage;

/// A config with one message area, one uplink, and FTN enabled, rooted at
/// the given directory.
pub fn ftn_config(root: &Path, aka: &str, uplink: &str) -> Config {
    let mut cfg = Config::default();
    cfg.storage.root = root.to_string_lossy().into_owned();
    cfg.ftn.enabled = true;
    cfg.ftn.akas = vec![aka.to_string()];
    cfg.ftn.origin_lines = vec!["Integration fixture".into()];
    cfg.ftn.message_areas = vec![AreaConfig {
        tag: "TEST".into(),
        name: "Test echo".into(),
        base: "main".into(),
        groups: vec![],
        read_level: 0,
        post_level: 0,
    }];
    cfg.ftn.uplinks = vec![UplinkConfig {
        address: uplink.to_string(),
        host: String::new(),
        port: 24554,
        password: "linkpw".into(),
        groups: vec![],
        flavour: "normal".into(),
        default_route: true,
    }];
    cfg
}

pub fn open_storage(root: &Path, cfg: &Config) -> Storage {
    Storage::open(root, &cfg.ftn.message_areas, &cfg.ftn.file_areas).unwrap()
}

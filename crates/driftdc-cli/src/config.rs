//! TOML configuration file handling.

use anyhow::Context;
use driftdc_client::Config;
use driftdc_hub::hub::SudpPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// One `[[hubs]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HubEntry {
    /// Hub address (`dchub://`, `nmdcs://`, `adc://`, `adcs://`).
    pub url: String,
    /// Nick override.
    pub nick: Option<String>,
    /// Auto-login password.
    pub password: Option<String>,
    /// NMDC text encoding label.
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClientSection {
    nick: Option<String>,
    active: Option<bool>,
    active_ip: Option<String>,
    active_port: Option<u16>,
    active_udp_port: Option<u16>,
    download_slots: Option<u32>,
    download_rate: Option<u64>,
    upload_rate: Option<u64>,
    hash_rate: Option<u64>,
    download_segment: Option<u64>,
    upload_slots: Option<u32>,
    minislots: Option<u32>,
    minislot_size: Option<u64>,
    max_ul_per_user: Option<u32>,
    disconnect_offline: Option<bool>,
    reconnect_timeout: Option<u64>,
    sudp_policy: Option<String>,
    filelist_maxage: Option<u64>,
    share_hidden: Option<bool>,
    share_symlinks: Option<bool>,
    share_emptydirs: Option<bool>,
    share_exclude: Option<String>,
    download_exclude: Option<String>,
    download_shared: Option<bool>,
    incoming_dir: Option<PathBuf>,
    download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    client: ClientSection,
    #[serde(default)]
    hubs: Vec<HubEntry>,
    /// Virtual name to disk path.
    #[serde(default)]
    share: std::collections::BTreeMap<String, PathBuf>,
}

/// The parsed configuration: the typed core config plus the hub list.
#[derive(Debug, Clone)]
pub struct Loaded {
    /// Core configuration.
    pub config: Config,
    /// Hubs to connect at startup.
    pub hubs: Vec<HubEntry>,
}

/// Default config file location.
#[must_use]
pub fn default_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".config/driftdc/config.toml")
}

/// Load a config file; a missing file yields defaults.
///
/// # Errors
///
/// Unreadable or malformed TOML.
pub fn load(path: &Path) -> anyhow::Result<Loaded> {
    let file: FileConfig = match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let mut cfg = Config::default();
    let c = file.client;
    if let Some(v) = c.nick {
        cfg.nick = v;
    }
    if let Some(v) = c.active {
        cfg.active = v;
    }
    if let Some(v) = c.active_ip {
        cfg.active_ip = Some(v.parse().context("client.active_ip")?);
    }
    if let Some(v) = c.active_port {
        cfg.active_port = v;
    }
    if let Some(v) = c.active_udp_port {
        cfg.active_udp_port = v;
    }
    if let Some(v) = c.download_slots {
        cfg.download_slots = v.max(1);
    }
    if let Some(v) = c.download_rate {
        cfg.download_rate = v;
    }
    if let Some(v) = c.upload_rate {
        cfg.upload_rate = v;
    }
    if let Some(v) = c.hash_rate {
        cfg.hash_rate = v;
    }
    if let Some(v) = c.download_segment {
        cfg.download_segment = v;
    }
    if let Some(v) = c.upload_slots {
        cfg.upload_slots = v.max(1);
    }
    if let Some(v) = c.minislots {
        cfg.minislots = v;
    }
    if let Some(v) = c.minislot_size {
        cfg.minislot_size = v;
    }
    if let Some(v) = c.max_ul_per_user {
        cfg.max_ul_per_user = v;
    }
    if let Some(v) = c.disconnect_offline {
        cfg.disconnect_offline = v;
    }
    if let Some(v) = c.reconnect_timeout {
        cfg.reconnect_timeout = v;
    }
    if let Some(v) = c.sudp_policy.as_deref() {
        cfg.sudp_policy = match v {
            "disabled" => SudpPolicy::Disabled,
            "allow" => SudpPolicy::Allow,
            "prefer" => SudpPolicy::Prefer,
            other => anyhow::bail!("client.sudp_policy: unknown value {other:?}"),
        };
    }
    if let Some(v) = c.filelist_maxage {
        cfg.filelist_maxage = v;
    }
    if let Some(v) = c.share_hidden {
        cfg.share_hidden = v;
    }
    if let Some(v) = c.share_symlinks {
        cfg.share_symlinks = v;
    }
    if let Some(v) = c.share_emptydirs {
        cfg.share_emptydirs = v;
    }
    cfg.share_exclude = c.share_exclude;
    cfg.download_exclude = c.download_exclude;
    if let Some(v) = c.download_shared {
        cfg.download_shared = v;
    }
    if let Some(v) = c.incoming_dir {
        cfg.incoming_dir = v;
    }
    if let Some(v) = c.download_dir {
        cfg.download_dir = v;
    }
    cfg.share_dirs = file.share.into_iter().collect();

    Ok(Loaded {
        config: cfg,
        hubs: file.hubs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = load(Path::new("/nonexistent/driftdc.toml")).unwrap();
        assert!(loaded.hubs.is_empty());
        assert!(loaded.config.share_dirs.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[client]
nick = "tester"
active = true
active_ip = "203.0.113.9"
active_port = 3411
download_slots = 5
sudp_policy = "prefer"

[[hubs]]
url = "adcs://hub.example:511"
password = "pw"

[[hubs]]
url = "dchub://legacy.example"
encoding = "windows-1251"

[share]
music = "/srv/music"
"#,
        )
        .unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.config.nick, "tester");
        assert!(loaded.config.active);
        assert_eq!(loaded.config.download_slots, 5);
        assert_eq!(loaded.config.sudp_policy, SudpPolicy::Prefer);
        assert_eq!(loaded.hubs.len(), 2);
        assert_eq!(loaded.hubs[1].encoding.as_deref(), Some("windows-1251"));
        assert_eq!(
            loaded.config.share_dirs,
            vec![("music".to_owned(), PathBuf::from("/srv/music"))]
        );
    }

    #[test]
    fn bad_sudp_policy_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[client]\nsudp_policy = \"sometimes\"\n").unwrap();
        assert!(load(&path).is_err());
    }
}

//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::session::SessionSettings;

/// Daemon configuration. File: ~/.config/swiftdrop/config.toml or /etc/swiftdrop/config.toml.
/// Env overrides: SWIFTDROP_INTERFACE, SWIFTDROP_WPA_CLI, SWIFTDROP_PEER_POLL_SECS,
/// SWIFTDROP_CONNECT_TIMEOUT_SECS, SWIFTDROP_TRANSFER_PORT, SWIFTDROP_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Wireless interface wpa_supplicant manages (default wlan0).
    #[serde(default = "default_interface")]
    pub interface: String,
    /// wpa_cli binary (default `wpa_cli` from PATH).
    #[serde(default = "default_wpa_cli")]
    pub wpa_cli: String,
    /// Peer list poll interval while discovering (default 4s).
    #[serde(default = "default_peer_poll_secs")]
    pub peer_poll_secs: u64,
    /// How long a negotiation may take before it is reported failed (default 30s).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Group interface poll interval during negotiation (default 500ms).
    #[serde(default = "default_group_poll_millis")]
    pub group_poll_millis: u64,
    /// Per wpa_cli invocation timeout (default 5s).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Buffered events per subscriber before it lags (default 64).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// TCP port the group owner receives files on (default 8888).
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    /// Where received files land (default ~/Downloads/SwiftDrop).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Group owner address for clients when the platform does not report one
    /// (default 192.168.49.1, the Android GO address).
    #[serde(default = "default_group_owner_address")]
    pub group_owner_address: IpAddr,
}

fn default_interface() -> String {
    "wlan0".to_string()
}
fn default_wpa_cli() -> String {
    "wpa_cli".to_string()
}
fn default_peer_poll_secs() -> u64 {
    4
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_group_poll_millis() -> u64 {
    500
}
fn default_command_timeout_secs() -> u64 {
    5
}
fn default_event_capacity() -> usize {
    64
}
fn default_transfer_port() -> u16 {
    8888
}
fn default_group_owner_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            wpa_cli: default_wpa_cli(),
            peer_poll_secs: default_peer_poll_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            group_poll_millis: default_group_poll_millis(),
            command_timeout_secs: default_command_timeout_secs(),
            event_capacity: default_event_capacity(),
            transfer_port: default_transfer_port(),
            download_dir: None,
            group_owner_address: default_group_owner_address(),
        }
    }
}

impl Config {
    pub fn peer_poll_interval(&self) -> Duration {
        Duration::from_secs(self.peer_poll_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn group_poll_interval(&self) -> Duration {
        Duration::from_millis(self.group_poll_millis.max(50))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn download_dir(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join("Downloads").join("SwiftDrop"),
            None => PathBuf::from("SwiftDrop"),
        }
    }

    /// Apply overrides from `lookup` (the process environment in `load`).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("SWIFTDROP_INTERFACE") {
            if !s.is_empty() {
                self.interface = s;
            }
        }
        if let Some(s) = lookup("SWIFTDROP_WPA_CLI") {
            if !s.is_empty() {
                self.wpa_cli = s;
            }
        }
        if let Some(s) = lookup("SWIFTDROP_PEER_POLL_SECS") {
            if let Ok(n) = s.parse::<u64>() {
                self.peer_poll_secs = n;
            }
        }
        if let Some(s) = lookup("SWIFTDROP_CONNECT_TIMEOUT_SECS") {
            if let Ok(n) = s.parse::<u64>() {
                self.connect_timeout_secs = n;
            }
        }
        if let Some(s) = lookup("SWIFTDROP_TRANSFER_PORT") {
            if let Ok(n) = s.parse::<u16>() {
                self.transfer_port = n;
            }
        }
        if let Some(s) = lookup("SWIFTDROP_DOWNLOAD_DIR") {
            if !s.is_empty() {
                self.download_dir = Some(PathBuf::from(s));
            }
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(c: &Config) -> Self {
        SessionSettings {
            tick_interval: c.peer_poll_interval(),
            event_capacity: c.event_capacity.max(1),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_overrides(|k| std::env::var(k).ok());
    c
}

/// Load config from an explicit file, then env vars. Missing or malformed file is an error.
pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut c: Config =
        toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    c.apply_overrides(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/swiftdrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/swiftdrop/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring malformed config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("interface = \"wlp2s0\"\npeer_poll_secs = 2\n").unwrap();
        assert_eq!(c.interface, "wlp2s0");
        assert_eq!(c.peer_poll_secs, 2);
        assert_eq!(c.wpa_cli, "wpa_cli");
        assert_eq!(c.connect_timeout_secs, 30);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("SWIFTDROP_INTERFACE", "wlan1"),
            ("SWIFTDROP_PEER_POLL_SECS", "not-a-number"),
            ("SWIFTDROP_CONNECT_TIMEOUT_SECS", "10"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.interface, "wlan1");
        assert_eq!(c.peer_poll_secs, 4);
        assert_eq!(c.connect_timeout_secs, 10);
        assert_eq!(c.wpa_cli, "wpa_cli");
    }

    #[test]
    fn transfer_settings() {
        let c: Config = toml::from_str(
            "transfer_port = 9000\ndownload_dir = \"/srv/drop\"\ngroup_owner_address = \"10.0.0.1\"\n",
        )
        .unwrap();
        assert_eq!(c.transfer_port, 9000);
        assert_eq!(c.download_dir(), PathBuf::from("/srv/drop"));
        assert_eq!(c.group_owner_address, "10.0.0.1".parse::<IpAddr>().unwrap());

        let mut c = Config::default();
        assert_eq!(c.transfer_port, 8888);
        assert_eq!(c.group_owner_address, "192.168.49.1".parse::<IpAddr>().unwrap());
        c.apply_overrides(|k| match k {
            "SWIFTDROP_TRANSFER_PORT" => Some("70000".into()),
            "SWIFTDROP_DOWNLOAD_DIR" => Some("/tmp/in".into()),
            _ => None,
        });
        assert_eq!(c.transfer_port, 8888);
        assert_eq!(c.download_dir(), PathBuf::from("/tmp/in"));
    }

    #[test]
    fn durations_have_floors() {
        let c = Config {
            peer_poll_secs: 0,
            group_poll_millis: 0,
            ..Config::default()
        };
        assert_eq!(c.peer_poll_interval(), Duration::from_secs(1));
        assert_eq!(c.group_poll_interval(), Duration::from_millis(50));
    }
}

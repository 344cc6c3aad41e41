//! wpa_supplicant P2P via `wpa_cli`: each provider call shells out once (or polls) and
//! parses the text reply.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use swiftdrop_core::{ConnectionInfo, DeviceStatus, PeerRecord};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::provider::{DeviceProvider, ProviderError};

/// Bit 0 of wpa_supplicant's `group_capab`: the peer is currently a group owner.
const GROUP_CAPAB_OWNER: u32 = 0x01;

#[derive(Debug, Default)]
struct Link {
    /// Interface P2P commands go to (`p2p-dev-<iface>` when the driver has one).
    control: Option<String>,
    /// Group interface once a group formed, e.g. `p2p-wlan0-0`.
    group: Option<String>,
    connected_peer: Option<String>,
    pending_peer: Option<String>,
}

pub struct WpaCliProvider {
    wpa_cli: String,
    interface: String,
    command_timeout: Duration,
    connect_timeout: Duration,
    group_poll: Duration,
    link: Mutex<Link>,
}

impl WpaCliProvider {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            wpa_cli: cfg.wpa_cli.clone(),
            interface: cfg.interface.clone(),
            command_timeout: cfg.command_timeout(),
            connect_timeout: cfg.connect_timeout(),
            group_poll: cfg.group_poll_interval(),
            link: Mutex::new(Link::default()),
        }
    }

    async fn run(&self, iface: &str, args: &[&str]) -> Result<String, ProviderError> {
        let command = format!("{} -i {} {}", self.wpa_cli, iface, args.join(" "));
        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(&self.wpa_cli)
                .arg("-i")
                .arg(iface)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ProviderError::Timeout(command.clone()))?
        .map_err(|source| ProviderError::Io {
            command: command.clone(),
            source,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return Err(ProviderError::Rejected(format!("{command}: {detail}")));
        }
        if is_fail(&stdout) {
            return Err(ProviderError::Rejected(format!("{command}: {stdout}")));
        }
        Ok(stdout)
    }

    async fn control(&self) -> Result<String, ProviderError> {
        self.link
            .lock()
            .await
            .control
            .clone()
            .ok_or_else(|| ProviderError::Rejected("p2p control interface not initialized".into()))
    }

    async fn p2p(&self, args: &[&str]) -> Result<String, ProviderError> {
        let iface = self.control().await?;
        self.run(&iface, args).await
    }

    async fn group_interface(&self) -> Result<Option<String>, ProviderError> {
        let out = self.run(&self.interface, &["interface"]).await?;
        Ok(parse_interfaces(&out).into_iter().find(|i| is_group_interface(i)))
    }

    async fn wait_for_group(&self) -> Result<(String, ConnectionInfo), ProviderError> {
        loop {
            if let Some(group) = self.group_interface().await? {
                let status = parse_key_values(&self.run(&group, &["status"]).await?);
                if status.get("wpa_state").map(String::as_str) == Some("COMPLETED") {
                    return Ok((group, connection_info(&status)));
                }
                debug!(group = %group, state = ?status.get("wpa_state"), "group forming");
            }
            tokio::time::sleep(self.group_poll).await;
        }
    }
}

#[async_trait]
impl DeviceProvider for WpaCliProvider {
    async fn initialize(&self) -> Result<(), ProviderError> {
        let pong = self.run(&self.interface, &["ping"]).await?;
        if pong != "PONG" {
            return Err(ProviderError::Parse {
                command: "ping".into(),
                output: pong,
            });
        }
        let interfaces = parse_interfaces(&self.run(&self.interface, &["interface"]).await?);
        let dev = format!("p2p-dev-{}", self.interface);
        let control = if interfaces.iter().any(|i| *i == dev) {
            dev
        } else {
            self.interface.clone()
        };
        let group = interfaces.into_iter().find(|i| is_group_interface(i));
        info!(control = %control, group = ?group, "wpa_supplicant reachable");
        let mut link = self.link.lock().await;
        link.control = Some(control);
        link.group = group;
        Ok(())
    }

    async fn discover_peers(&self) -> Result<(), ProviderError> {
        self.p2p(&["p2p_find"]).await.map(|_| ())
    }

    async fn stop_discovery(&self) -> Result<(), ProviderError> {
        self.p2p(&["p2p_stop_find"]).await.map(|_| ())
    }

    async fn connect(&self, address: &str) -> Result<ConnectionInfo, ProviderError> {
        self.p2p(&["p2p_connect", address, "pbc"]).await?;
        self.link.lock().await.pending_peer = Some(address.to_string());
        let outcome = tokio::time::timeout(self.connect_timeout, self.wait_for_group()).await;
        let mut link = self.link.lock().await;
        link.pending_peer = None;
        match outcome {
            Ok(Ok((group, info))) => {
                link.group = Some(group);
                link.connected_peer = Some(address.to_string());
                Ok(info)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                drop(link);
                if let Err(e) = self.p2p(&["p2p_cancel"]).await {
                    warn!(address, error = %e, "p2p_cancel after timeout failed");
                }
                Err(ProviderError::Timeout(format!("group with {address}")))
            }
        }
    }

    async fn request_peers(&self) -> Result<Vec<PeerRecord>, ProviderError> {
        let list = self.p2p(&["p2p_peers"]).await?;
        let (connected, pending) = {
            let link = self.link.lock().await;
            (link.connected_peer.clone(), link.pending_peer.clone())
        };
        let mut records = Vec::new();
        for address in parse_peer_list(&list) {
            let detail = match self.p2p(&["p2p_peer", address]).await {
                Ok(d) => d,
                Err(e) => {
                    // Peer aged out between the two commands.
                    debug!(address, error = %e, "skipping peer");
                    continue;
                }
            };
            let status = if connected.as_deref() == Some(address) {
                DeviceStatus::Connected
            } else if pending.as_deref() == Some(address) {
                DeviceStatus::Invited
            } else {
                DeviceStatus::Available
            };
            records.push(parse_peer(address, &parse_key_values(&detail), status));
        }
        Ok(records)
    }

    async fn remove_group(&self) -> Result<(), ProviderError> {
        let group = {
            let mut link = self.link.lock().await;
            link.connected_peer = None;
            link.pending_peer = None;
            link.group.take()
        };
        let group = match group {
            Some(g) => Some(g),
            None => self.group_interface().await?,
        };
        match group {
            Some(g) => self.p2p(&["p2p_group_remove", &g]).await.map(|_| ()),
            None => {
                // Negotiation may still be running in wpa_supplicant.
                if let Err(e) = self.p2p(&["p2p_cancel"]).await {
                    debug!(error = %e, "nothing to cancel");
                }
                Ok(())
            }
        }
    }
}

/// `FAIL`, `FAIL-BUSY` and friends.
pub fn is_fail(reply: &str) -> bool {
    reply == "FAIL" || reply.starts_with("FAIL-")
}

fn is_group_interface(name: &str) -> bool {
    name.starts_with("p2p-") && !name.starts_with("p2p-dev-")
}

/// Interface names from `wpa_cli interface`.
pub fn parse_interfaces(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.ends_with(':') && !l.contains(' '))
        .map(str::to_string)
        .collect()
}

/// `key=value` lines; the first line of `p2p_peer` (the address) has no `=` and is skipped.
pub fn parse_key_values(out: &str) -> HashMap<String, String> {
    out.lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Device addresses from `p2p_peers`.
pub fn parse_peer_list(out: &str) -> Vec<&str> {
    out.lines().map(str::trim).filter(|l| is_mac(l)).collect()
}

pub fn parse_peer(address: &str, fields: &HashMap<String, String>, status: DeviceStatus) -> PeerRecord {
    let name = fields.get("device_name").cloned().unwrap_or_default();
    let group_capab = fields
        .get("group_capab")
        .and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok())
        .unwrap_or(0);
    PeerRecord {
        address: address.to_string(),
        name,
        is_group_owner: group_capab & GROUP_CAPAB_OWNER != 0,
        status,
    }
}

/// Connection info from `status` on the group interface.
pub fn connection_info(status: &HashMap<String, String>) -> ConnectionInfo {
    let is_group_owner = status.get("mode").map(String::as_str) == Some("P2P GO");
    let own_ip: Option<IpAddr> = status.get("ip_address").and_then(|s| s.parse().ok());
    // Clients learn the GO's address via DHCP; wpa_supplicant only reports our own.
    let group_owner_address = if is_group_owner { own_ip } else { None };
    ConnectionInfo {
        is_group_owner,
        group_owner_address,
    }
}

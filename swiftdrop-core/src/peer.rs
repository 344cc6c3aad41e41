//! Peer data: raw provider records and the registry's stamped view of them.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Shown when the provider reports a device without a name.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Device status as reported by the OS P2P framework.
/// Integer codes follow Android's `WifiP2pDevice` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Connected,
    Invited,
    Failed,
    Available,
    Unavailable,
}

impl DeviceStatus {
    /// Map a platform status code. Unknown codes are treated as unavailable.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DeviceStatus::Connected,
            1 => DeviceStatus::Invited,
            2 => DeviceStatus::Failed,
            3 => DeviceStatus::Available,
            _ => DeviceStatus::Unavailable,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            DeviceStatus::Connected => 0,
            DeviceStatus::Invited => 1,
            DeviceStatus::Failed => 2,
            DeviceStatus::Available => 3,
            DeviceStatus::Unavailable => 4,
        }
    }
}

/// A peer exactly as the capability provider reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    pub name: String,
    pub is_group_owner: bool,
    pub status: DeviceStatus,
}

impl PeerRecord {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            is_group_owner: false,
            status: DeviceStatus::Available,
        }
    }

    /// Stamp the record with the time it was seen.
    pub fn into_peer(self, seen_at: SystemTime) -> Peer {
        let display_name = if self.name.trim().is_empty() {
            UNKNOWN_DEVICE_NAME.to_string()
        } else {
            self.name
        };
        Peer {
            address: self.address,
            display_name,
            is_group_owner: self.is_group_owner,
            status: self.status,
            last_seen_at: seen_at,
        }
    }
}

/// A discovered peer. `address` is the stable key across discovery rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: String,
    pub display_name: String,
    pub is_group_owner: bool,
    pub status: DeviceStatus,
    pub last_seen_at: SystemTime,
}

impl Peer {
    /// Attribute equality, ignoring when the peer was last seen.
    pub fn same_attributes(&self, other: &Peer) -> bool {
        self.address == other.address
            && self.display_name == other.display_name
            && self.is_group_owner == other.is_group_owner
            && self.status == other.status
    }
}

//! Connection negotiator: at most one negotiation in flight.
//!
//! Idle --connect--> Connecting --ok--> Connected; Connecting --err--> Failed --reset--> Idle.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::registry::PeerRegistry;

/// What the OS reported once the group formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub is_group_owner: bool,
    /// Known once the group is up; clients connect here.
    pub group_owner_address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting { address: String },
    Connected { address: String, info: ConnectionInfo },
    Failed { address: String, reason: String },
}

impl ConnectionState {
    /// Address of the peer this state refers to, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            ConnectionState::Idle => None,
            ConnectionState::Connecting { address }
            | ConnectionState::Connected { address, .. }
            | ConnectionState::Failed { address, .. } => Some(address),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionNegotiator {
    state: ConnectionState,
    epoch: u64,
}

impl Default for ConnectionNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionNegotiator {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            epoch: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Validate and begin a negotiation with `address`. Returns the epoch to tag the
    /// provider request with. No provider call is implied by a validation error.
    pub fn connect(&mut self, address: &str, peers: &PeerRegistry) -> Result<u64, SessionError> {
        if address.is_empty() {
            return Err(SessionError::InvalidTarget(String::new()));
        }
        match self.state {
            ConnectionState::Connecting { .. } | ConnectionState::Connected { .. } => {
                return Err(SessionError::AlreadyNegotiating);
            }
            ConnectionState::Idle | ConnectionState::Failed { .. } => {}
        }
        if !peers.contains(address) {
            return Err(SessionError::InvalidTarget(address.to_string()));
        }
        self.epoch += 1;
        self.state = ConnectionState::Connecting {
            address: address.to_string(),
        };
        Ok(self.epoch)
    }

    /// Provider finished a negotiation. Returns the new state, or None if the completion is
    /// stale (wrong epoch, or the negotiation was already torn down).
    pub fn on_result(
        &mut self,
        epoch: u64,
        result: Result<ConnectionInfo, String>,
    ) -> Option<&ConnectionState> {
        if epoch != self.epoch {
            return None;
        }
        let address = match &self.state {
            ConnectionState::Connecting { address } => address.clone(),
            _ => return None,
        };
        self.state = match result {
            Ok(info) => ConnectionState::Connected { address, info },
            Err(reason) => ConnectionState::Failed { address, reason },
        };
        Some(&self.state)
    }

    /// Back to Idle unconditionally. Any in-flight negotiation becomes stale.
    /// Returns the state that was left, or None if already Idle.
    pub fn reset(&mut self) -> Option<ConnectionState> {
        self.epoch += 1;
        match std::mem::replace(&mut self.state, ConnectionState::Idle) {
            ConnectionState::Idle => None,
            previous => Some(previous),
        }
    }
}

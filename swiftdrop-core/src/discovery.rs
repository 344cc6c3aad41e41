//! Discovery controller: one discovery session at a time.
//!
//! Idle --start--> Discovering --stop--> Stopping --ack--> Idle. Each start or stop carries
//! the current epoch; acknowledgments for any other epoch are stale.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryState {
    Idle,
    Discovering,
    Stopping,
}

/// What the host must do after `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Ask the provider to discover peers, tagged with this epoch.
    Submit(u64),
    /// A session is already running; nothing to send.
    AlreadyRunning,
}

/// Result of feeding a provider acknowledgment back in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Acknowledgment referred to an abandoned epoch or an unexpected state; dropped.
    Stale,
    /// State moved; the new state is carried along.
    Moved(DiscoveryState),
    /// Provider refused. State is back to Idle.
    Rejected(String),
}

#[derive(Debug)]
pub struct DiscoveryController {
    state: DiscoveryState,
    epoch: u64,
}

impl Default for DiscoveryController {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryController {
    pub fn new() -> Self {
        Self {
            state: DiscoveryState::Idle,
            epoch: 0,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Begin a discovery session. A running session makes this a no-op; a pending stop is
    /// superseded by the new session.
    pub fn start(&mut self, capability_ready: bool) -> Result<StartOutcome, SessionError> {
        if !capability_ready {
            return Err(SessionError::CapabilityUnavailable);
        }
        match self.state {
            DiscoveryState::Discovering => Ok(StartOutcome::AlreadyRunning),
            DiscoveryState::Idle | DiscoveryState::Stopping => {
                self.epoch += 1;
                self.state = DiscoveryState::Discovering;
                Ok(StartOutcome::Submit(self.epoch))
            }
        }
    }

    /// Stop the running session. Returns the epoch to send with the provider stop request,
    /// or None when there is nothing to stop.
    pub fn stop(&mut self) -> Option<u64> {
        match self.state {
            DiscoveryState::Discovering => {
                self.state = DiscoveryState::Stopping;
                Some(self.epoch)
            }
            DiscoveryState::Idle | DiscoveryState::Stopping => None,
        }
    }

    /// Provider answered a discover request.
    pub fn on_started(&mut self, epoch: u64, result: Result<(), String>) -> AckOutcome {
        if epoch != self.epoch || self.state != DiscoveryState::Discovering {
            return AckOutcome::Stale;
        }
        match result {
            Ok(()) => AckOutcome::Moved(DiscoveryState::Discovering),
            Err(reason) => {
                self.state = DiscoveryState::Idle;
                AckOutcome::Rejected(reason)
            }
        }
    }

    /// Provider answered a stop request. A failed stop still lands in Idle; the reason is
    /// handed back so the host can report it.
    pub fn on_stopped(&mut self, epoch: u64, result: Result<(), String>) -> AckOutcome {
        if epoch != self.epoch || self.state != DiscoveryState::Stopping {
            return AckOutcome::Stale;
        }
        self.state = DiscoveryState::Idle;
        match result {
            Ok(()) => AckOutcome::Moved(DiscoveryState::Idle),
            Err(reason) => AckOutcome::Rejected(reason),
        }
    }

    /// Force Idle without a provider round-trip (capability lost). Returns true if state changed.
    pub fn reset(&mut self) -> bool {
        if self.state == DiscoveryState::Idle {
            return false;
        }
        self.epoch += 1;
        self.state = DiscoveryState::Idle;
        true
    }
}

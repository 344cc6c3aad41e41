//! Host-facing message types: provider calls the core asks the host to make, and session
//! events the core hands to listeners. Encoding is bincode; framing is length-prefix (see wire).

use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryState;
use crate::error::SessionError;
use crate::negotiator::ConnectionState;
use crate::peer::Peer;
use crate::registry::Reconciliation;

/// Version of the frame layout exchanged with hosts over the C ABI.
pub const PROTOCOL_VERSION: u8 = 1;

/// Work for the device capability provider. Epoch-tagged calls must be answered with the
/// same epoch so the core can drop completions it no longer cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderCall {
    DiscoverPeers { epoch: u64 },
    StopDiscovery { epoch: u64 },
    /// Ask for the current peer list; answer with `on_peers_available`.
    RequestPeers,
    Connect { epoch: u64, address: String },
    RemoveGroup,
}

/// Whether the OS P2P capability can be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityState {
    /// `initialize()` has not completed.
    Initializing,
    Ready,
    Unavailable { reason: String },
}

/// Notifications for listeners. Asynchronous provider failures arrive here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Registry refresh with a non-empty diff. `peers` is the full list after the refresh.
    PeersUpdated {
        peers: Vec<Peer>,
        diff: Reconciliation,
    },
    /// `error` is `ConnectionRejected` when the provider failed the negotiation.
    ConnectionChanged {
        state: ConnectionState,
        error: Option<SessionError>,
    },
    /// `error` is set when the provider rejected a start or a stop.
    DiscoveryChanged {
        state: DiscoveryState,
        error: Option<SessionError>,
    },
    CapabilityChanged { state: CapabilityState },
    /// Provider failed to remove the group. The session is already Idle.
    TeardownFailed { reason: String },
}

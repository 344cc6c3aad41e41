//! Host-driven API: SessionCore receives commands and provider completions from the host,
//! returns provider calls, and queues events for listeners.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{AckOutcome, DiscoveryController, DiscoveryState, StartOutcome};
use crate::error::SessionError;
use crate::negotiator::{ConnectionInfo, ConnectionNegotiator, ConnectionState};
use crate::peer::{Peer, PeerRecord};
use crate::protocol::{CapabilityState, ProviderCall, SessionEvent};
use crate::registry::{PeerRegistry, Reconciliation};

/// Reason recorded when the OS reports P2P switched off.
pub const P2P_DISABLED_REASON: &str = "wifi p2p disabled";

/// Read-only view of one session, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub capability: CapabilityState,
    pub discovery: DiscoveryState,
    pub connection: ConnectionState,
    pub peers: Vec<Peer>,
}

/// One logical session. All state changes go through `&mut self`, so whoever owns the core
/// is the serialization point.
pub struct SessionCore {
    session_id: Uuid,
    capability: CapabilityState,
    initialized: bool,
    /// Last P2P on/off state the OS reported. Assumed on until told otherwise.
    enabled: bool,
    discovery: DiscoveryController,
    negotiator: ConnectionNegotiator,
    registry: PeerRegistry,
    events: VecDeque<SessionEvent>,
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCore {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            capability: CapabilityState::Initializing,
            initialized: false,
            enabled: true,
            discovery: DiscoveryController::new(),
            negotiator: ConnectionNegotiator::new(),
            registry: PeerRegistry::new(),
            events: VecDeque::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn capability(&self) -> &CapabilityState {
        &self.capability
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn connection_state(&self) -> &ConnectionState {
        self.negotiator.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            capability: self.capability.clone(),
            discovery: self.discovery.state(),
            connection: self.negotiator.state().clone(),
            peers: self.registry.current_peers().to_vec(),
        }
    }

    /// Take every queued event, oldest first.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    fn ready(&self) -> Result<(), SessionError> {
        match self.capability {
            CapabilityState::Initializing => Err(SessionError::SessionNotReady),
            CapabilityState::Unavailable { .. } => Err(SessionError::CapabilityUnavailable),
            CapabilityState::Ready => Ok(()),
        }
    }

    fn set_capability(&mut self, state: CapabilityState) {
        if self.capability != state {
            self.capability = state.clone();
            self.events.push_back(SessionEvent::CapabilityChanged { state });
        }
    }

    fn push_peers_updated(&mut self, diff: Reconciliation) {
        if diff.is_empty() {
            return;
        }
        self.events.push_back(SessionEvent::PeersUpdated {
            peers: self.registry.current_peers().to_vec(),
            diff,
        });
    }

    fn push_discovery_changed(&mut self, error: Option<SessionError>) {
        self.events.push_back(SessionEvent::DiscoveryChanged {
            state: self.discovery.state(),
            error,
        });
    }

    fn push_connection_changed(&mut self, error: Option<SessionError>) {
        self.events.push_back(SessionEvent::ConnectionChanged {
            state: self.negotiator.state().clone(),
            error,
        });
    }

    /// Provider `initialize()` finished.
    pub fn on_initialized(&mut self, result: Result<(), String>) {
        match result {
            Ok(()) => {
                self.initialized = true;
                if self.enabled {
                    info!(session = %self.session_id, "capability provider ready");
                    self.set_capability(CapabilityState::Ready);
                } else {
                    info!(session = %self.session_id, "capability provider ready, p2p disabled");
                    self.set_capability(CapabilityState::Unavailable {
                        reason: P2P_DISABLED_REASON.to_string(),
                    });
                }
            }
            Err(reason) => {
                warn!(session = %self.session_id, %reason, "capability provider failed to initialize");
                self.initialized = false;
                self.set_capability(CapabilityState::Unavailable { reason });
            }
        }
    }

    /// OS switched P2P on or off. Turning it off ends discovery and negotiation and empties
    /// the registry. May arrive before initialization completes.
    pub fn on_capability_changed(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            if self.initialized {
                self.set_capability(CapabilityState::Ready);
            }
            return;
        }
        if matches!(self.capability, CapabilityState::Initializing) {
            debug!(session = %self.session_id, "p2p disabled before initialization finished");
        }
        self.set_capability(CapabilityState::Unavailable {
            reason: P2P_DISABLED_REASON.to_string(),
        });
        if self.discovery.reset() {
            self.push_discovery_changed(None);
        }
        if self.negotiator.reset().is_some() {
            self.push_connection_changed(None);
        }
        let diff = self.registry.clear();
        self.push_peers_updated(diff);
    }

    /// Start discovery. A second start while discovering is acknowledged without a new
    /// provider request.
    pub fn start_discovery(&mut self) -> Result<Vec<ProviderCall>, SessionError> {
        if matches!(self.capability, CapabilityState::Initializing) {
            return Err(SessionError::SessionNotReady);
        }
        let ready = self.capability == CapabilityState::Ready;
        match self.discovery.start(ready)? {
            StartOutcome::AlreadyRunning => Ok(vec![]),
            StartOutcome::Submit(epoch) => {
                debug!(session = %self.session_id, epoch, "discovery starting");
                self.push_discovery_changed(None);
                Ok(vec![ProviderCall::DiscoverPeers { epoch }])
            }
        }
    }

    /// Stop discovery. Never fails; nothing to stop is a no-op.
    pub fn stop_discovery(&mut self) -> Vec<ProviderCall> {
        match self.discovery.stop() {
            Some(epoch) => {
                debug!(session = %self.session_id, epoch, "discovery stopping");
                self.push_discovery_changed(None);
                vec![ProviderCall::StopDiscovery { epoch }]
            }
            None => vec![],
        }
    }

    /// Begin negotiating with a peer from the current registry.
    pub fn connect(&mut self, address: &str) -> Result<Vec<ProviderCall>, SessionError> {
        self.ready()?;
        let epoch = self.negotiator.connect(address, &self.registry)?;
        info!(session = %self.session_id, epoch, address, "negotiation started");
        self.push_connection_changed(None);
        Ok(vec![ProviderCall::Connect {
            epoch,
            address: address.to_string(),
        }])
    }

    /// Current peers in first-sighting order.
    pub fn list_peers(&self) -> Result<&[Peer], SessionError> {
        self.ready()?;
        Ok(self.registry.current_peers())
    }

    pub fn connected_peers(&self) -> Result<Vec<Peer>, SessionError> {
        self.ready()?;
        Ok(self.registry.connected())
    }

    /// Ask the provider for a fresh peer list. The result arrives as `PeersUpdated`.
    pub fn refresh_peers(&mut self) -> Result<Vec<ProviderCall>, SessionError> {
        self.ready()?;
        Ok(vec![ProviderCall::RequestPeers])
    }

    /// Reset negotiation to Idle. Any completion for the abandoned negotiation is ignored
    /// afterwards. Never fails and is safe to repeat.
    ///
    /// `RemoveGroup` goes out whenever the capability is ready, even from Idle: a group a
    /// remote peer formed by invitation is only removable this way.
    pub fn teardown(&mut self) -> Vec<ProviderCall> {
        if let Some(previous) = self.negotiator.reset() {
            info!(session = %self.session_id, peer = ?previous.target(), "negotiation torn down");
            self.push_connection_changed(None);
        }
        if self.capability == CapabilityState::Ready {
            vec![ProviderCall::RemoveGroup]
        } else {
            vec![]
        }
    }

    /// Provider answered `DiscoverPeers`. Success asks for the peer list.
    pub fn on_discovery_started(&mut self, epoch: u64, result: Result<(), String>) -> Vec<ProviderCall> {
        match self.discovery.on_started(epoch, result) {
            AckOutcome::Stale => {
                debug!(session = %self.session_id, epoch, "stale discovery start dropped");
                vec![]
            }
            AckOutcome::Moved(_) => vec![ProviderCall::RequestPeers],
            AckOutcome::Rejected(reason) => {
                warn!(session = %self.session_id, epoch, %reason, "discovery rejected");
                self.push_discovery_changed(Some(SessionError::DiscoveryRejected(reason)));
                vec![]
            }
        }
    }

    /// Provider answered `StopDiscovery`.
    pub fn on_discovery_stopped(&mut self, epoch: u64, result: Result<(), String>) {
        match self.discovery.on_stopped(epoch, result) {
            AckOutcome::Stale => {
                debug!(session = %self.session_id, epoch, "stale discovery stop dropped");
            }
            AckOutcome::Moved(_) => self.push_discovery_changed(None),
            AckOutcome::Rejected(reason) => {
                warn!(session = %self.session_id, epoch, %reason, "provider failed to stop discovery");
                self.push_discovery_changed(Some(SessionError::DiscoveryRejected(reason)));
            }
        }
    }

    /// Provider delivered a peer list. Applied in arrival order; the last list wins.
    pub fn on_peers_available(&mut self, records: Vec<PeerRecord>) {
        if self.capability != CapabilityState::Ready {
            debug!(session = %self.session_id, "peer list while capability not ready dropped");
            return;
        }
        let now = SystemTime::now();
        let diff = self
            .registry
            .refresh(records.into_iter().map(|r| r.into_peer(now)).collect());
        if !diff.is_empty() {
            debug!(
                session = %self.session_id,
                added = diff.added.len(),
                removed = diff.removed.len(),
                updated = diff.updated.len(),
                "peer registry refreshed"
            );
        }
        self.push_peers_updated(diff);
    }

    /// Provider finished a negotiation. Stale completions are dropped without any event.
    pub fn on_connect_result(
        &mut self,
        epoch: u64,
        result: Result<ConnectionInfo, String>,
    ) -> Vec<ProviderCall> {
        let Some(state) = self.negotiator.on_result(epoch, result) else {
            debug!(session = %self.session_id, epoch, "stale negotiation result dropped");
            return vec![];
        };
        let connected = matches!(state, ConnectionState::Connected { .. });
        let error = match state {
            ConnectionState::Connected { address, info } => {
                info!(session = %self.session_id, address = %address, group_owner = info.is_group_owner, "connected");
                None
            }
            ConnectionState::Failed { address, reason } => {
                warn!(session = %self.session_id, address = %address, %reason, "connection rejected");
                Some(SessionError::ConnectionRejected(reason.clone()))
            }
            _ => None,
        };
        self.push_connection_changed(error);
        // Device statuses change once a group forms.
        if connected && self.capability == CapabilityState::Ready {
            vec![ProviderCall::RequestPeers]
        } else {
            vec![]
        }
    }

    /// Provider answered `RemoveGroup`.
    pub fn on_group_removed(&mut self, result: Result<(), String>) {
        if let Err(reason) = result {
            warn!(session = %self.session_id, %reason, "provider failed to remove group");
            self.events.push_back(SessionEvent::TeardownFailed { reason });
        }
    }

    /// Periodic tick: while discovering, poll the peer list.
    pub fn tick(&mut self) -> Vec<ProviderCall> {
        if self.discovery.state() == DiscoveryState::Discovering
            && self.capability == CapabilityState::Ready
        {
            vec![ProviderCall::RequestPeers]
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_core() -> SessionCore {
        let mut core = SessionCore::new();
        core.on_initialized(Ok(()));
        core.drain_events();
        core
    }

    fn with_peers(addresses: &[&str]) -> SessionCore {
        let mut core = ready_core();
        core.on_peers_available(
            addresses
                .iter()
                .map(|a| PeerRecord::new(*a, format!("Device {a}")))
                .collect(),
        );
        core.drain_events();
        core
    }

    fn discover_epoch(calls: &[ProviderCall]) -> u64 {
        match calls {
            [ProviderCall::DiscoverPeers { epoch }] => *epoch,
            other => panic!("expected DiscoverPeers, got {other:?}"),
        }
    }

    fn connect_epoch(calls: &[ProviderCall]) -> u64 {
        match calls {
            [ProviderCall::Connect { epoch, .. }] => *epoch,
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[test]
    fn not_ready_until_initialized() {
        let mut core = SessionCore::new();
        assert_eq!(core.start_discovery(), Err(SessionError::SessionNotReady));
        assert_eq!(core.connect("a"), Err(SessionError::SessionNotReady));
        assert_eq!(core.list_peers().err(), Some(SessionError::SessionNotReady));
        assert!(core.stop_discovery().is_empty());
        assert!(core.teardown().is_empty());
    }

    #[test]
    fn failed_initialization_is_capability_unavailable() {
        let mut core = SessionCore::new();
        core.on_initialized(Err("no p2p service".into()));
        assert_eq!(core.start_discovery(), Err(SessionError::CapabilityUnavailable));
        assert_eq!(core.list_peers().err(), Some(SessionError::CapabilityUnavailable));
        assert_eq!(core.refresh_peers(), Err(SessionError::CapabilityUnavailable));
        assert!(matches!(
            core.drain_events().as_slice(),
            [SessionEvent::CapabilityChanged {
                state: CapabilityState::Unavailable { .. }
            }]
        ));
    }

    #[test]
    fn discovery_success_requests_peers_and_refreshes_registry() {
        let mut core = ready_core();
        let epoch = discover_epoch(&core.start_discovery().unwrap());
        assert_eq!(core.discovery_state(), DiscoveryState::Discovering);
        assert_eq!(
            core.on_discovery_started(epoch, Ok(())),
            vec![ProviderCall::RequestPeers]
        );
        core.on_peers_available(vec![PeerRecord::new("a", "A"), PeerRecord::new("b", "B")]);
        let events = core.drain_events();
        let peers_updated = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::PeersUpdated { .. }))
            .count();
        assert_eq!(peers_updated, 1);
        assert_eq!(core.list_peers().unwrap().len(), 2);
    }

    #[test]
    fn unchanged_scan_emits_nothing() {
        let mut core = with_peers(&["a", "b"]);
        core.on_peers_available(vec![
            PeerRecord::new("a", "Device a"),
            PeerRecord::new("b", "Device b"),
        ]);
        assert!(core.drain_events().is_empty());
    }

    #[test]
    fn double_start_sends_one_request() {
        let mut core = ready_core();
        let first = core.start_discovery().unwrap();
        assert_eq!(first.len(), 1);
        core.drain_events();
        let second = core.start_discovery().unwrap();
        assert!(second.is_empty());
        assert!(core.drain_events().is_empty());
        assert_eq!(core.discovery_state(), DiscoveryState::Discovering);
    }

    #[test]
    fn rejected_discovery_is_reported_verbatim() {
        let mut core = ready_core();
        let epoch = discover_epoch(&core.start_discovery().unwrap());
        core.drain_events();
        assert!(core
            .on_discovery_started(epoch, Err("Discovery failed: 2".into()))
            .is_empty());
        assert_eq!(
            core.drain_events(),
            vec![SessionEvent::DiscoveryChanged {
                state: DiscoveryState::Idle,
                error: Some(SessionError::DiscoveryRejected("Discovery failed: 2".into())),
            }]
        );
    }

    #[test]
    fn stop_never_fails_in_any_state() {
        let mut core = ready_core();
        assert!(core.stop_discovery().is_empty());
        core.start_discovery().unwrap();
        let calls = core.stop_discovery();
        assert!(matches!(calls.as_slice(), [ProviderCall::StopDiscovery { .. }]));
        assert_eq!(core.discovery_state(), DiscoveryState::Stopping);
        assert!(core.stop_discovery().is_empty());
        if let [ProviderCall::StopDiscovery { epoch }] = calls.as_slice() {
            core.on_discovery_stopped(*epoch, Ok(()));
        }
        assert_eq!(core.discovery_state(), DiscoveryState::Idle);
    }

    #[test]
    fn connect_scenario_unknown_then_busy() {
        let mut core = with_peers(&["A", "B"]);
        assert_eq!(core.connect("C"), Err(SessionError::InvalidTarget("C".into())));
        let calls = core.connect("A").unwrap();
        assert_eq!(
            calls,
            vec![ProviderCall::Connect {
                epoch: 1,
                address: "A".into()
            }]
        );
        assert_eq!(
            core.connection_state(),
            &ConnectionState::Connecting { address: "A".into() }
        );
        assert_eq!(core.connect("B"), Err(SessionError::AlreadyNegotiating));
    }

    #[test]
    fn teardown_while_connecting_drops_late_success() {
        let mut core = with_peers(&["A"]);
        let epoch = connect_epoch(&core.connect("A").unwrap());
        assert_eq!(core.teardown(), vec![ProviderCall::RemoveGroup]);
        core.drain_events();
        let calls = core.on_connect_result(
            epoch,
            Ok(ConnectionInfo {
                is_group_owner: true,
                group_owner_address: None,
            }),
        );
        assert!(calls.is_empty());
        assert_eq!(core.connection_state(), &ConnectionState::Idle);
        assert!(core.drain_events().is_empty());
    }

    #[test]
    fn connected_reports_group_owner() {
        let mut core = with_peers(&["A"]);
        let epoch = connect_epoch(&core.connect("A").unwrap());
        core.drain_events();
        let info = ConnectionInfo {
            is_group_owner: false,
            group_owner_address: Some("192.168.49.1".parse().unwrap()),
        };
        assert_eq!(
            core.on_connect_result(epoch, Ok(info.clone())),
            vec![ProviderCall::RequestPeers]
        );
        assert_eq!(
            core.drain_events(),
            vec![SessionEvent::ConnectionChanged {
                state: ConnectionState::Connected {
                    address: "A".into(),
                    info
                },
                error: None,
            }]
        );
    }

    #[test]
    fn connection_failure_goes_to_event_stream() {
        let mut core = with_peers(&["A"]);
        let epoch = connect_epoch(&core.connect("A").unwrap());
        core.drain_events();
        core.on_connect_result(epoch, Err("Connection failed: 0".into()));
        assert_eq!(
            core.drain_events(),
            vec![SessionEvent::ConnectionChanged {
                state: ConnectionState::Failed {
                    address: "A".into(),
                    reason: "Connection failed: 0".into()
                },
                error: Some(SessionError::ConnectionRejected("Connection failed: 0".into())),
            }]
        );
        // Retry allowed from Failed.
        assert!(core.connect("A").is_ok());
    }

    #[test]
    fn teardown_is_repeatable_and_failure_is_reported() {
        let mut core = with_peers(&["A"]);
        // Idle still removes whatever group the OS may hold.
        assert_eq!(core.teardown(), vec![ProviderCall::RemoveGroup]);
        assert!(core.drain_events().is_empty());
        let epoch = connect_epoch(&core.connect("A").unwrap());
        core.on_connect_result(
            epoch,
            Ok(ConnectionInfo {
                is_group_owner: true,
                group_owner_address: None,
            }),
        );
        assert_eq!(core.teardown(), vec![ProviderCall::RemoveGroup]);
        core.drain_events();
        assert_eq!(core.teardown(), vec![ProviderCall::RemoveGroup]);
        assert!(core.drain_events().is_empty());
        core.on_group_removed(Err("Failed to stop WiFi P2P: 2".into()));
        assert_eq!(
            core.drain_events(),
            vec![SessionEvent::TeardownFailed {
                reason: "Failed to stop WiFi P2P: 2".into()
            }]
        );
    }

    #[test]
    fn disabling_p2p_resets_everything() {
        let mut core = with_peers(&["A"]);
        core.start_discovery().unwrap();
        core.connect("A").unwrap();
        core.drain_events();
        core.on_capability_changed(false);
        assert_eq!(core.discovery_state(), DiscoveryState::Idle);
        assert_eq!(core.connection_state(), &ConnectionState::Idle);
        assert_eq!(core.start_discovery(), Err(SessionError::CapabilityUnavailable));
        let events = core.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PeersUpdated { peers, .. } if peers.is_empty())));

        core.on_capability_changed(true);
        assert_eq!(core.capability(), &CapabilityState::Ready);
        assert!(core.list_peers().unwrap().is_empty());
    }

    #[test]
    fn p2p_disabled_before_initialization_stays_unavailable() {
        let mut core = SessionCore::new();
        core.on_capability_changed(false);
        core.on_initialized(Ok(()));
        assert_eq!(
            core.capability(),
            &CapabilityState::Unavailable {
                reason: P2P_DISABLED_REASON.to_string()
            }
        );
        assert_eq!(core.start_discovery(), Err(SessionError::CapabilityUnavailable));
        assert!(core.teardown().is_empty());

        core.on_capability_changed(true);
        assert_eq!(core.capability(), &CapabilityState::Ready);
        assert_eq!(discover_epoch(&core.start_discovery().unwrap()), 1);
    }

    #[test]
    fn old_negotiation_result_does_not_touch_new_attempt() {
        let mut core = with_peers(&["A", "B"]);
        let old = connect_epoch(&core.connect("A").unwrap());
        core.teardown();
        let new = connect_epoch(&core.connect("B").unwrap());
        assert_ne!(old, new);
        core.drain_events();

        let calls = core.on_connect_result(
            old,
            Ok(ConnectionInfo {
                is_group_owner: true,
                group_owner_address: None,
            }),
        );
        assert!(calls.is_empty());
        assert_eq!(
            core.connection_state(),
            &ConnectionState::Connecting { address: "B".into() }
        );
        assert!(core.drain_events().is_empty());

        core.on_connect_result(old, Err("Connection failed: 2".into()));
        assert_eq!(
            core.connection_state(),
            &ConnectionState::Connecting { address: "B".into() }
        );
    }

    #[test]
    fn tick_polls_only_while_discovering() {
        let mut core = ready_core();
        assert!(core.tick().is_empty());
        core.start_discovery().unwrap();
        assert_eq!(core.tick(), vec![ProviderCall::RequestPeers]);
        core.stop_discovery();
        assert!(core.tick().is_empty());
    }

    #[test]
    fn snapshot_composes_state() {
        let mut core = with_peers(&["A", "B"]);
        core.connect("B").unwrap();
        let snap = core.snapshot();
        assert_eq!(snap.session_id, core.session_id());
        assert_eq!(snap.capability, CapabilityState::Ready);
        assert_eq!(snap.discovery, DiscoveryState::Idle);
        assert_eq!(snap.connection.target(), Some("B"));
        assert_eq!(snap.peers.len(), 2);
    }
}

//! Session actor: one tokio task owns the `SessionCore`. Commands and provider completions
//! both arrive over channels, so every transition happens on that task in arrival order.

use std::sync::Arc;
use std::time::Duration;

use swiftdrop_core::{
    ConnectionInfo, Peer, PeerRecord, ProviderCall, SessionCore, SessionError, SessionEvent,
    SessionSnapshot,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::provider::DeviceProvider;

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Peer-list poll interval while discovering.
    pub tick_interval: Duration,
    /// Per-subscriber event buffer; slow subscribers see `RecvError::Lagged`.
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(4),
            event_capacity: 64,
        }
    }
}

enum Command {
    StartDiscovery(oneshot::Sender<Result<(), SessionError>>),
    StopDiscovery(oneshot::Sender<()>),
    Connect(String, oneshot::Sender<Result<(), SessionError>>),
    ListPeers(oneshot::Sender<Result<Vec<Peer>, SessionError>>),
    ConnectedPeers(oneshot::Sender<Result<Vec<Peer>, SessionError>>),
    RefreshPeers(oneshot::Sender<Result<(), SessionError>>),
    Teardown(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

enum Completion {
    Initialized(Result<(), String>),
    DiscoveryStarted { epoch: u64, result: Result<(), String> },
    DiscoveryStopped { epoch: u64, result: Result<(), String> },
    Peers(Result<Vec<PeerRecord>, String>),
    Connected { epoch: u64, result: Result<ConnectionInfo, String> },
    GroupRemoved(Result<(), String>),
}

/// Cloneable front door to a running session. Calls return as soon as the actor has
/// validated them; outcomes of provider work arrive on `subscribe()`.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::SessionNotReady)?;
        rx.await.map_err(|_| SessionError::SessionNotReady)
    }

    pub async fn start_discovery(&self) -> Result<(), SessionError> {
        self.request(Command::StartDiscovery).await?
    }

    /// Never fails; a stopped session has nothing to stop.
    pub async fn stop_discovery(&self) {
        let _ = self.request(Command::StopDiscovery).await;
    }

    pub async fn connect(&self, address: impl Into<String>) -> Result<(), SessionError> {
        let address = address.into();
        self.request(|tx| Command::Connect(address, tx)).await?
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>, SessionError> {
        self.request(Command::ListPeers).await?
    }

    pub async fn connected_peers(&self) -> Result<Vec<Peer>, SessionError> {
        self.request(Command::ConnectedPeers).await?
    }

    pub async fn refresh_peers(&self) -> Result<(), SessionError> {
        self.request(Command::RefreshPeers).await?
    }

    pub async fn teardown(&self) {
        let _ = self.request(Command::Teardown).await;
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(Command::Snapshot).await
    }

    /// Stop discovery, tear down any group, and end the actor.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }
}

/// Start a session over `provider`. The returned receiver exists before the actor runs, so
/// it sees every event including the first `CapabilityChanged`. The actor also ends when
/// every handle is dropped.
pub fn spawn<P: DeviceProvider>(
    provider: Arc<P>,
    settings: SessionSettings,
) -> (SessionHandle, broadcast::Receiver<SessionEvent>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (events, first_subscriber) = broadcast::channel(settings.event_capacity.max(1));
    let actor = Actor {
        core: SessionCore::new(),
        provider,
        completions: done_tx,
        events: events.clone(),
    };
    let task = tokio::spawn(actor.run(cmd_rx, done_rx, settings.tick_interval));
    (
        SessionHandle {
            commands: cmd_tx,
            events,
        },
        first_subscriber,
        task,
    )
}

struct Actor<P> {
    core: SessionCore,
    provider: Arc<P>,
    completions: mpsc::UnboundedSender<Completion>,
    events: broadcast::Sender<SessionEvent>,
}

impl<P: DeviceProvider> Actor<P> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        tick_interval: Duration,
    ) {
        let session = self.core.session_id();
        info!(session = %session, "session started");
        let provider = self.provider.clone();
        let done = self.completions.clone();
        tokio::spawn(async move {
            let result = provider.initialize().await.map_err(|e| e.to_string());
            let _ = done.send(Completion::Initialized(result));
        });

        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.reset();

        loop {
            tokio::select! {
                biased;
                Some(done) = completions.recv() => self.complete(done),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = tick.tick() => {
                    let calls = self.core.tick();
                    self.dispatch(calls);
                }
            }
            self.publish();
        }
        info!(session = %session, "session ended");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::StartDiscovery(reply) => {
                let result = self.core.start_discovery().map(|calls| self.dispatch(calls));
                let _ = reply.send(result);
            }
            Command::StopDiscovery(reply) => {
                let calls = self.core.stop_discovery();
                self.dispatch(calls);
                let _ = reply.send(());
            }
            Command::Connect(address, reply) => {
                let result = self.core.connect(&address).map(|calls| self.dispatch(calls));
                if let Err(e) = &result {
                    debug!(address = %address, error = %e, "connect refused");
                }
                let _ = reply.send(result);
            }
            Command::ListPeers(reply) => {
                let _ = reply.send(self.core.list_peers().map(<[Peer]>::to_vec));
            }
            Command::ConnectedPeers(reply) => {
                let _ = reply.send(self.core.connected_peers());
            }
            Command::RefreshPeers(reply) => {
                let result = self.core.refresh_peers().map(|calls| self.dispatch(calls));
                let _ = reply.send(result);
            }
            Command::Teardown(reply) => {
                let calls = self.core.teardown();
                self.dispatch(calls);
                let _ = reply.send(());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.core.snapshot());
            }
            // Handled in the loop.
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Initialized(result) => self.core.on_initialized(result),
            Completion::DiscoveryStarted { epoch, result } => {
                let calls = self.core.on_discovery_started(epoch, result);
                self.dispatch(calls);
            }
            Completion::DiscoveryStopped { epoch, result } => {
                self.core.on_discovery_stopped(epoch, result)
            }
            Completion::Peers(Ok(records)) => self.core.on_peers_available(records),
            Completion::Peers(Err(reason)) => {
                warn!(session = %self.core.session_id(), %reason, "peer list request failed");
            }
            Completion::Connected { epoch, result } => {
                let calls = self.core.on_connect_result(epoch, result);
                self.dispatch(calls);
            }
            Completion::GroupRemoved(result) => self.core.on_group_removed(result),
        }
    }

    /// Run each call on its own task; the result comes back as a completion.
    fn dispatch(&self, calls: Vec<ProviderCall>) {
        for call in calls {
            let provider = self.provider.clone();
            let done = self.completions.clone();
            tokio::spawn(async move {
                let completion = execute(provider.as_ref(), call).await;
                let _ = done.send(completion);
            });
        }
    }

    async fn shutdown(&mut self) {
        let mut calls = self.core.stop_discovery();
        calls.extend(self.core.teardown());
        for call in calls {
            let done = execute(self.provider.as_ref(), call).await;
            self.complete(done);
        }
        self.publish();
    }

    fn publish(&mut self) {
        for event in self.core.drain_events() {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

async fn execute<P: DeviceProvider>(provider: &P, call: ProviderCall) -> Completion {
    match call {
        ProviderCall::DiscoverPeers { epoch } => Completion::DiscoveryStarted {
            epoch,
            result: provider.discover_peers().await.map_err(|e| e.to_string()),
        },
        ProviderCall::StopDiscovery { epoch } => Completion::DiscoveryStopped {
            epoch,
            result: provider.stop_discovery().await.map_err(|e| e.to_string()),
        },
        ProviderCall::RequestPeers => {
            Completion::Peers(provider.request_peers().await.map_err(|e| e.to_string()))
        }
        ProviderCall::Connect { epoch, address } => Completion::Connected {
            epoch,
            result: provider.connect(&address).await.map_err(|e| e.to_string()),
        },
        ProviderCall::RemoveGroup => {
            Completion::GroupRemoved(provider.remove_group().await.map_err(|e| e.to_string()))
        }
    }
}

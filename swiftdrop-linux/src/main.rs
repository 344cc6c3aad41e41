// SwiftDrop Linux: WiFi Direct session daemon over wpa_supplicant.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use swiftdrop_core::{CapabilityState, ConnectionState, SessionEvent};
use swiftdrop_linux::{
    config, session, FileTransfer, SessionHandle, SessionSettings, TransferEvent, WpaCliProvider,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "WiFi Direct peer discovery and connection daemon", version)]
struct Cli {
    /// Config file (default: ~/.config/swiftdrop/config.toml, then /etc/swiftdrop/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Wireless interface, overrides the config file
    #[arg(long)]
    interface: Option<String>,

    /// Connect to this device address once discovery sees it
    #[arg(long, value_name = "ADDRESS")]
    connect: Option<String>,

    /// Send this file once connected as a client
    #[arg(long, value_name = "FILE")]
    send: Option<PathBuf>,

    /// Exit after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if let Some(iface) = cli.interface.clone() {
        cfg.interface = iface;
    }
    info!(interface = %cfg.interface, wpa_cli = %cfg.wpa_cli, "starting");

    let rt = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    rt.block_on(async {
        let provider = Arc::new(WpaCliProvider::from_config(&cfg));
        let (handle, events, task) = session::spawn(provider, SessionSettings::from(&cfg));
        let transfer = Arc::new(FileTransfer::from_config(&cfg));
        let logger = tokio::spawn(log_transfers(transfer.subscribe()));
        let mut link = Link {
            transfer,
            fallback_owner: cfg.group_owner_address,
            send: cli.send.clone(),
            server: None,
        };

        let stop_after = async {
            match cli.duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            r = drive(&handle, events, cli.connect.clone(), &mut link) => r?,
            r = shutdown_signal() => r?,
            _ = stop_after => info!("duration elapsed"),
        }

        link.stop_server();
        logger.abort();
        handle.shutdown().await;
        task.await.context("session task")?;
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

/// What to do with the group once it forms: the owner receives, a client sends.
struct Link {
    transfer: Arc<FileTransfer>,
    fallback_owner: IpAddr,
    send: Option<PathBuf>,
    server: Option<JoinHandle<()>>,
}

impl Link {
    async fn on_connected(&mut self, is_group_owner: bool, owner: Option<IpAddr>) {
        if is_group_owner {
            if let Some(path) = &self.send {
                warn!(file = %path.display(), "group owner receives; not sending");
            }
            if self.server.is_some() {
                return;
            }
            match self.transfer.bind().await {
                Ok(listener) => {
                    info!(port = self.transfer.port(), dir = %self.transfer.download_dir().display(), "receiving files");
                    let transfer = self.transfer.clone();
                    self.server = Some(tokio::spawn(async move {
                        if let Err(e) = transfer.serve(listener).await {
                            warn!(error = %e, "transfer listener stopped");
                        }
                    }));
                }
                Err(e) => warn!(port = self.transfer.port(), error = %e, "cannot listen for transfers"),
            }
        } else if let Some(path) = self.send.take() {
            let host = owner.unwrap_or(self.fallback_owner);
            let transfer = self.transfer.clone();
            tokio::spawn(async move {
                // Outcome is published as a TransferEvent.
                let _ = transfer.send_to_host(host, &path).await;
            });
        }
    }

    fn stop_server(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

async fn log_transfers(mut events: Receiver<TransferEvent>) {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Progress { direction, file_name, percent }) => {
                info!(?direction, file = %file_name, percent, "transfer progress");
            }
            Ok(TransferEvent::Complete { direction, path, bytes, .. }) => {
                info!(?direction, path = %path.display(), bytes, "transfer complete");
            }
            Ok(TransferEvent::Failed { direction, file_name, reason }) => {
                warn!(?direction, file = ?file_name, %reason, "transfer failed");
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

/// Start discovery once the provider is up, log events, connect to `target` when seen, and
/// hand a formed group to `link`.
async fn drive(
    handle: &SessionHandle,
    mut events: Receiver<SessionEvent>,
    mut target: Option<String>,
    link: &mut Link,
) -> anyhow::Result<()> {
    loop {
        let event = match events.recv().await {
            Ok(e) => e,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => return Ok(()),
        };
        match event {
            SessionEvent::CapabilityChanged { state } => match state {
                CapabilityState::Ready => {
                    info!("p2p ready, starting discovery");
                    handle.start_discovery().await?;
                }
                CapabilityState::Unavailable { reason } => {
                    anyhow::bail!("wifi direct unavailable: {reason}");
                }
                CapabilityState::Initializing => {}
            },
            SessionEvent::PeersUpdated { peers, diff } => {
                for p in &diff.added {
                    info!(address = %p.address, name = %p.display_name, group_owner = p.is_group_owner, "peer found");
                }
                for p in &diff.removed {
                    info!(address = %p.address, "peer lost");
                }
                let seen = target
                    .as_deref()
                    .is_some_and(|t| peers.iter().any(|p| p.address == t));
                if seen {
                    if let Some(t) = target.take() {
                        info!(address = %t, "connecting");
                        if let Err(e) = handle.connect(t.clone()).await {
                            warn!(address = %t, error = %e, "connect refused");
                        }
                    }
                }
            }
            SessionEvent::ConnectionChanged { state, error: Some(e) } => {
                warn!(?state, error = %e, "connection");
            }
            SessionEvent::ConnectionChanged { state, error: None } => {
                info!(?state, "connection");
                match state {
                    ConnectionState::Connected { info, .. } => {
                        link.on_connected(info.is_group_owner, info.group_owner_address)
                            .await;
                    }
                    ConnectionState::Idle => link.stop_server(),
                    _ => {}
                }
            }
            SessionEvent::DiscoveryChanged { state, error: Some(e) } => {
                warn!(?state, error = %e, "discovery");
            }
            SessionEvent::DiscoveryChanged { state, error: None } => info!(?state, "discovery"),
            SessionEvent::TeardownFailed { reason } => warn!(%reason, "group removal failed"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown signal received");
    Ok(())
}

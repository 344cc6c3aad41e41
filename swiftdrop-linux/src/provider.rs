//! Device capability provider: the OS-level P2P primitives a session drives.

use async_trait::async_trait;
use swiftdrop_core::{ConnectionInfo, PeerRecord};

/// Failure reported by a provider. The session forwards `to_string()` verbatim as the reason.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The platform refused the request; text is what it said.
    #[error("{0}")]
    Rejected(String),
    #[error("{command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("unexpected output from {command}: {output:?}")]
    Parse { command: String, output: String },
}

/// Asynchronous access to WiFi Direct. Each call completes independently; the session actor
/// posts the results back into its own queue.
#[async_trait]
pub trait DeviceProvider: Send + Sync + 'static {
    /// Bind to the platform service. Nothing else is called before this succeeds.
    async fn initialize(&self) -> Result<(), ProviderError>;

    async fn discover_peers(&self) -> Result<(), ProviderError>;

    async fn stop_discovery(&self) -> Result<(), ProviderError>;

    /// Negotiate with `address`. Resolves once the group formed (or failed).
    async fn connect(&self, address: &str) -> Result<ConnectionInfo, ProviderError>;

    async fn request_peers(&self) -> Result<Vec<PeerRecord>, ProviderError>;

    /// Remove the current group, if any.
    async fn remove_group(&self) -> Result<(), ProviderError>;
}

//! SwiftDrop for Linux: drives a `SessionCore` over wpa_supplicant's P2P interface and moves
//! files over the resulting group.

pub mod config;
pub mod provider;
pub mod session;
pub mod transfer;
pub mod wpa;

pub use config::Config;
pub use provider::{DeviceProvider, ProviderError};
pub use session::{spawn, SessionHandle, SessionSettings};
pub use transfer::{Direction, FileTransfer, TransferError, TransferEvent};
pub use wpa::WpaCliProvider;

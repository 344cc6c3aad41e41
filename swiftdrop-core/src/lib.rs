//! SwiftDrop peer session engine.
//! Host-driven: no I/O; host passes commands and provider completions, receives provider
//! calls and session events.

pub mod core;
pub mod discovery;
pub mod error;
pub mod ffi;
pub mod negotiator;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use crate::core::{SessionCore, SessionSnapshot};
pub use discovery::{DiscoveryController, DiscoveryState};
pub use error::SessionError;
pub use negotiator::{ConnectionInfo, ConnectionNegotiator, ConnectionState};
pub use peer::{DeviceStatus, Peer, PeerRecord};
pub use protocol::{CapabilityState, ProviderCall, SessionEvent, PROTOCOL_VERSION};
pub use registry::{PeerRegistry, Reconciliation};
pub use wire::{
    body_len, decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, HEADER_LEN, MAX_BODY_LEN,
};

//! Session error kinds. Validation failures are returned synchronously; provider failures
//! reach the host on the event stream with the same kinds.

use serde::{Deserialize, Serialize};

/// Closed set of errors the session surfaces to its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SessionError {
    /// The device capability provider failed to initialize or P2P is disabled.
    #[error("wifi p2p capability unavailable")]
    CapabilityUnavailable,
    /// Provider refused to start discovery. Reason is the provider's text, verbatim.
    #[error("discovery rejected: {0}")]
    DiscoveryRejected(String),
    /// Provider failed the connection attempt. Reason is the provider's text, verbatim.
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),
    /// Empty address, or an address not present in the current peer list.
    #[error("invalid target: {0:?}")]
    InvalidTarget(String),
    #[error("a negotiation is already in progress")]
    AlreadyNegotiating,
    /// Provider initialization has not completed yet.
    #[error("session not ready")]
    SessionNotReady,
}

impl SessionError {
    /// Negative status code used across the C ABI. `-1` is reserved for bad arguments.
    pub fn code(&self) -> i32 {
        match self {
            SessionError::CapabilityUnavailable => -2,
            SessionError::DiscoveryRejected(_) => -3,
            SessionError::ConnectionRejected(_) => -4,
            SessionError::InvalidTarget(_) => -5,
            SessionError::AlreadyNegotiating => -6,
            SessionError::SessionNotReady => -7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_and_negative() {
        let all = [
            SessionError::CapabilityUnavailable,
            SessionError::DiscoveryRejected("2".into()),
            SessionError::ConnectionRejected("0".into()),
            SessionError::InvalidTarget(String::new()),
            SessionError::AlreadyNegotiating,
            SessionError::SessionNotReady,
        ];
        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < -1));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn rejection_reason_is_kept_verbatim() {
        let e = SessionError::DiscoveryRejected("Discovery failed: 2".into());
        assert_eq!(e.to_string(), "discovery rejected: Discovery failed: 2");
    }
}

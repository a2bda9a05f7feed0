use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Invalid or missing startup configuration. Fatal before anything binds.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Local server URL not provided. Run abacate --help to see the list of options.")]
    MissingTarget,

    #[error("Invalid target URL '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Invalid relay host '{url}': {reason}")]
    InvalidRelayHost { url: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelErrorKind {
    /// Relay could not be reached (connect or DNS failure)
    Unreachable,
    /// Relay answered but refused the registration
    Rejected,
    /// Handshake did not complete in time
    Timeout,
}

impl fmt::Display for TunnelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelErrorKind::Unreachable => write!(f, "relay unreachable"),
            TunnelErrorKind::Rejected => write!(f, "relay rejected registration"),
            TunnelErrorKind::Timeout => write!(f, "handshake timed out"),
        }
    }
}

/// Failure to open a tunnel session.
#[derive(Error, Debug, Clone)]
#[error("Tunnel error ({kind}): {message}")]
pub struct TunnelError {
    pub kind: TunnelErrorKind,
    pub message: String,
}

impl TunnelError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: TunnelErrorKind::Unreachable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: TunnelErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: TunnelErrorKind::Timeout,
            message: format!("no answer from relay after {:?}", after),
        }
    }
}

/// Unexpected loss of an open tunnel. Ends the inbound request sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Tunnel disconnected: {reason}")]
pub struct TunnelDisconnect {
    pub reason: String,
}

impl TunnelDisconnect {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Per-request forwarding failure, turned into an HTTP error reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Target did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Forwarding failed: {0}")]
    Unknown(String),
}

impl ForwardError {
    /// Status code of the reply synthesized for this failure
    pub fn status(&self) -> u16 {
        match self {
            ForwardError::Timeout(_) => 504,
            ForwardError::TargetUnreachable(_) => 502,
            ForwardError::Unknown(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_error_status_mapping() {
        assert_eq!(ForwardError::Timeout(Duration::from_secs(30)).status(), 504);
        assert_eq!(
            ForwardError::TargetUnreachable("refused".to_string()).status(),
            502
        );
        assert_eq!(ForwardError::Unknown("boom".to_string()).status(), 500);
    }

    #[test]
    fn test_tunnel_error_display() {
        let err = TunnelError::rejected("subdomain taken");
        assert_eq!(err.kind, TunnelErrorKind::Rejected);
        assert_eq!(
            err.to_string(),
            "Tunnel error (relay rejected registration): subdomain taken"
        );
    }
}

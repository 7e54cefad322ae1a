//! Tunnel errors
//!
//! Every session failure maps to one [`TunnelError`] variant. Handshake
//! failures are terminal for the session; forwarding send failures are not.

use crate::auth::AuthError;
use crate::bridge::CoreError;
use crate::codec::CodecError;
use std::sync::Arc;

/// Callback receiving every error a session reports
pub type ErrorCallback = Arc<dyn Fn(TunnelError) + Send + Sync>;

/// Tunnel errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailure { addr: String, reason: String },

    #[error("Failed to build auth payload: {0}")]
    AuthBuild(#[from] AuthError),

    #[error("Failed to send auth frame: {0}")]
    AuthSendFailure(String),

    #[error("Failed to read frame header: {0}")]
    HeaderReadFailure(String),

    #[error("Failed to read frame body: {0}")]
    BodyReadFailure(String),

    #[error("Framing error: {0}")]
    FramingError(#[from] CodecError),

    #[error("Invalid address assignment: {0:?}")]
    InvalidAssignment(String),

    #[error("Interface configuration failed: {0}")]
    InterfaceConfigFailure(String),

    #[error("Failed to forward packet to relay: {0}")]
    ForwardSendFailure(String),

    #[error("Relay connection lost: {0}")]
    ForwardReceiveFailure(String),

    #[error("Virtual interface read failed: {0}")]
    InterfaceReadFailure(String),

    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Tunnel already running")]
    AlreadyRunning,

    #[error("Core engine error: {0}")]
    Core(#[from] CoreError),
}

impl TunnelError {
    /// Whether this error ends the session when raised while forwarding.
    ///
    /// Every handshake error is terminal. Once forwarding, a send failure
    /// drops one packet and a framing error drops one frame; the relay
    /// connection stays up. Core engine failures leave the tunnel intact.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TunnelError::ForwardSendFailure(_)
                | TunnelError::FramingError(_)
                | TunnelError::Cancelled
                | TunnelError::AlreadyRunning
                | TunnelError::Core(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_failure_not_fatal() {
        assert!(!TunnelError::ForwardSendFailure("broken pipe".into()).is_fatal());
        assert!(TunnelError::ForwardReceiveFailure("eof".into()).is_fatal());
        assert!(TunnelError::HeaderReadFailure("eof".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = TunnelError::ConnectFailure {
            addr: "relay.example:443".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.to_string(), "Failed to connect to relay.example:443: refused");
    }
}

//! Crate-wide error types
//!
//! Every cross-actor operation (describe, publish, read, kick) resolves to a
//! `RelayError` variant so front-ends can map failures to protocol responses
//! without string matching.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Error returned by path-manager and path operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// No credentials were presented; the front-end should issue a challenge
    #[error("authentication required")]
    AuthNotCritical,

    /// Credentials or client address were presented and rejected
    #[error("authentication failed: {0}")]
    AuthCritical(String),

    /// Unknown path name, or nothing is publishing to it
    #[error("path '{0}' is not available")]
    NotFound(String),

    /// The path already has a publisher
    #[error("path '{0}' already has a publisher")]
    Busy(String),

    /// The call arrived after shutdown began
    #[error("terminated")]
    Terminated,

    /// An on-demand source did not become ready within its start timeout
    #[error("source of path '{0}' did not become ready in time")]
    Timeout(String),

    /// Transport failure; connection-local
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the failure is worth logging as an error.
    ///
    /// Not-critical auth failures are part of the normal challenge flow and
    /// stay at debug level.
    pub fn is_critical(&self) -> bool {
        !matches!(self, RelayError::AuthNotCritical)
    }

    /// Best-effort duplicate for fanning the same failure out to several
    /// queued waiters. `Io` carries a non-cloneable source and degrades to a
    /// fresh error with the same message.
    pub fn duplicate(&self) -> RelayError {
        match self {
            RelayError::AuthNotCritical => RelayError::AuthNotCritical,
            RelayError::AuthCritical(m) => RelayError::AuthCritical(m.clone()),
            RelayError::NotFound(n) => RelayError::NotFound(n.clone()),
            RelayError::Busy(n) => RelayError::Busy(n.clone()),
            RelayError::Terminated => RelayError::Terminated,
            RelayError::Timeout(n) => RelayError::Timeout(n.clone()),
            RelayError::Io(e) => {
                RelayError::Io(std::io::Error::new(e.kind(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criticality() {
        assert!(!RelayError::AuthNotCritical.is_critical());
        assert!(RelayError::AuthCritical("bad credentials".into()).is_critical());
        assert!(RelayError::Busy("cam1".into()).is_critical());
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let err = RelayError::Timeout("cam1".into());
        assert!(matches!(err.duplicate(), RelayError::Timeout(n) if n == "cam1"));

        let io = RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer closed",
        ));
        match io.duplicate() {
            RelayError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}

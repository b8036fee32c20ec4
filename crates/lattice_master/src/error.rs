//! Error taxonomy for master operations.
//!
//! Two families matter to callers: structural catalog errors (unknown table,
//! precondition violations) abort the enclosing operation immediately, while
//! remote/transport failures are retried by the catalog call wrapper and the
//! operation queue's delay path.

use std::io;

use thiserror::Error;

pub type Result<T, E = MasterError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table exists: {0}")]
    TableExists(String),

    #[error("table not disabled: {0}")]
    TableNotDisabled(String),

    #[error("invalid column: {0}")]
    InvalidColumn(String),

    #[error("invalid table name: {0}")]
    InvalidTable(String),

    /// Reported server/start-code pair is on the dead-server set.
    #[error("server has been marked dead: {0}")]
    ServerDead(String),

    /// An older process on the same host:port is still registered; the new
    /// process should wait for the stale registration to expire and retry.
    #[error("stale registration for {0} still present, retry startup shortly")]
    PleaseHold(String),

    /// Transport or remote-side failure against a region server.
    #[error("remote call failed: {message}")]
    Remote { message: String, retryable: bool },

    /// The catalog region a call targets has no known live location yet.
    #[error("catalog region is not currently online")]
    CatalogOffline,

    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("coordination service error: {0}")]
    Coordination(String),

    #[error("master is shutting down")]
    ShuttingDown,

    /// Bounded retries exhausted; carries every attempt for diagnostics.
    #[error("{attempts} catalog call attempts failed; last: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: String,
        history: Vec<String>,
    },
}

impl MasterError {
    /// Remote failure that a later attempt may succeed against.
    pub fn remote(message: impl Into<String>) -> Self {
        MasterError::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// Remote failure that retrying cannot fix (malformed request, remote
    /// rejected the operation outright).
    pub fn remote_fatal(message: impl Into<String>) -> Self {
        MasterError::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the catalog call wrapper / operation queue should retry.
    ///
    /// Storage errors are retryable at the operation level; persistent
    /// filesystem unavailability is detected separately by the health probe
    /// and is fatal to the whole master.
    pub fn is_retryable(&self) -> bool {
        match self {
            MasterError::Remote { retryable, .. } => *retryable,
            MasterError::CatalogOffline => true,
            MasterError::Storage(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_are_not_retryable() {
        assert!(!MasterError::TableNotFound("t".into()).is_retryable());
        assert!(!MasterError::TableNotDisabled("t".into()).is_retryable());
        assert!(!MasterError::InvalidColumn("cf:".into()).is_retryable());
        assert!(!MasterError::ShuttingDown.is_retryable());
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(MasterError::remote("connection reset").is_retryable());
        assert!(MasterError::CatalogOffline.is_retryable());
        assert!(!MasterError::remote_fatal("bad request").is_retryable());
    }
}

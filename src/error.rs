use std::path::PathBuf;

use uuid::Uuid;

/// Failure taxonomy of one transaction, from "skip before touching disk" up to
/// "state store left half-committed".
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("could not parse patch: {0}")]
    Parse(String),

    #[error("transaction {uuid} rejected: {reason}")]
    Validation { uuid: Uuid, reason: String },

    #[error("apply failed after {applied} operation(s): {reason}")]
    Apply { applied: usize, reason: String },

    #[error("rollback of {uuid} failed: {reason}")]
    Rollback { uuid: Uuid, reason: String },

    #[error("state store I/O failed for {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown patch strategy '{0}'")]
    UnknownStrategy(String),
}

impl TxError {
    pub fn state_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TxError::StateIo {
            path: path.into(),
            source,
        }
    }

    pub fn apply(applied: usize, reason: impl std::fmt::Display) -> Self {
        TxError::Apply {
            applied,
            reason: reason.to_string(),
        }
    }
}

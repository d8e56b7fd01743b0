//! Error types for the routing core.

use crate::types::ShardId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for routing core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the routing core.
///
/// Expected conditions (a shard down, a timeout, a checksum mismatch) are
/// values of this type, never panics.
#[derive(Error, Debug)]
pub enum Error {
    /// The ID is not in the topology, or a key cannot be mapped to any shard
    /// (an empty topology, or a key outside every configured range).
    #[error("unknown shard: {0}")]
    UnknownShard(String),

    /// The shard could not be reached by the connection factory.
    #[error("shard {shard_id} unreachable: {reason}")]
    ShardUnreachable { shard_id: ShardId, reason: String },

    /// A single shard invocation exceeded its timeout.
    #[error("shard {shard_id} timed out after {timeout:?}")]
    ShardTimeout { shard_id: ShardId, timeout: Duration },

    /// Some shards of a scatter-gather call failed.
    #[error("{} of {} shards failed: {}", .failures.len(), .failures.len() + .succeeded, FailureList(.failures))]
    PartialFailure {
        succeeded: usize,
        failures: Vec<ShardFailure>,
    },

    /// Live schema of a shard could not be read or compared.
    #[error("schema comparison failed on shard {shard_id}: {reason}")]
    SchemaComparisonFailed { shard_id: ShardId, reason: String },

    /// A migration could not be applied or recorded.
    #[error("migration {migration_id} failed on shard {shard_id}: {reason}")]
    MigrationFailed {
        shard_id: ShardId,
        migration_id: String,
        reason: String,
    },

    /// A migration could not be rolled back.
    #[error("rollback of {migration_id} failed on shard {shard_id}: {reason}")]
    RollbackFailed {
        shard_id: ShardId,
        migration_id: String,
        reason: String,
    },

    /// A recorded migration checksum differs from the one being applied.
    #[error("checksum mismatch for migration {migration_id}: recorded {recorded}, expected {expected}")]
    ChecksumMismatch {
        migration_id: String,
        recorded: String,
        expected: String,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A statement failed on the connection.
    #[error("statement error: {0}")]
    Statement(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error represents caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether this error is a per-shard timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ShardTimeout { .. })
    }

    /// The shard this error is attributed to, if any.
    pub fn shard_id(&self) -> Option<&ShardId> {
        match self {
            Error::ShardUnreachable { shard_id, .. }
            | Error::ShardTimeout { shard_id, .. }
            | Error::SchemaComparisonFailed { shard_id, .. }
            | Error::MigrationFailed { shard_id, .. }
            | Error::RollbackFailed { shard_id, .. } => Some(shard_id),
            _ => None,
        }
    }
}

/// A failure attributed to one shard.
#[derive(Debug)]
pub struct ShardFailure {
    /// The failing shard.
    pub shard_id: ShardId,
    /// What went wrong.
    pub error: Error,
}

impl ShardFailure {
    /// Create a shard failure.
    pub fn new(shard_id: ShardId, error: Error) -> Self {
        Self { shard_id, error }
    }
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.shard_id, self.error)
    }
}

struct FailureList<'a>(&'a [ShardFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_display() {
        let err = Error::PartialFailure {
            succeeded: 2,
            failures: vec![ShardFailure::new(
                ShardId::from("s1"),
                Error::ShardUnreachable {
                    shard_id: ShardId::from("s1"),
                    reason: "connection refused".into(),
                },
            )],
        };
        assert_eq!(
            err.to_string(),
            "1 of 3 shards failed: s1: shard s1 unreachable: connection refused"
        );
    }

    #[test]
    fn test_cancelled_is_not_timeout() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_timeout());

        let timeout = Error::ShardTimeout {
            shard_id: ShardId::from("s0"),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_cancelled());
        assert_eq!(timeout.shard_id(), Some(&ShardId::from("s0")));
    }
}

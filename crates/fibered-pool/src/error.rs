//! Pool and lease error types.

use std::time::Duration;

use fibered_sync::LockError;
use thiserror::Error;

/// Errors raised by the connection lease state machine.
///
/// All of these indicate a logic bug in the caller and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LeaseError {
    /// `lease` on a connection that already has an owner.
    #[error(
        "cannot lease connection; {}",
        conflict_detail(.owner, .requester, .held_by_requester)
    )]
    OwnershipConflict {
        /// Task holding the lease.
        owner: String,
        /// Task that asked for the lease.
        requester: String,
        /// Whether the requester already held the lease (a double lease).
        held_by_requester: bool,
    },

    /// `expire` or `steal` on a connection that is not leased.
    #[error("cannot {operation} connection; it is not currently leased.")]
    NotLeased {
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// `expire` of a connection owned by another task that is still alive.
    #[error(
        "cannot expire connection; it is owned by a different task: {owner}. \
         Current task: {requester}."
    )]
    OwnershipViolation {
        /// Task holding the lease.
        owner: String,
        /// Task that attempted the expiry.
        requester: String,
    },
}

fn conflict_detail(owner: &str, requester: &str, held_by_requester: &bool) -> String {
    if *held_by_requester {
        format!("it is already leased by the current task ({owner}).")
    } else {
        format!("it is already in use by a different task: {owner}. Current task: {requester}.")
    }
}

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Lease state machine rejected an operation.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Pool lock misuse.
    #[error("pool lock error: {0}")]
    Lock(#[from] LockError),

    /// No connection became available within the checkout timeout.
    #[error("could not obtain a connection from the pool within {timeout:?}; all pooled connections were in use")]
    Exhausted {
        /// How long the checkout waited.
        timeout: Duration,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,

    /// Invalid pool configuration or runtime environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection manager failed to open a connection.
    #[error("failed to open connection: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The connection does not belong to this pool.
    #[error("connection {id} does not belong to this pool")]
    UnknownConnection {
        /// Id of the foreign connection.
        id: u64,
    },

    /// The calling task already holds a different pooled connection.
    #[error("current task already holds connection {id}")]
    AlreadyHolding {
        /// Id of the connection the task already holds.
        id: u64,
    },
}

impl PoolError {
    /// Whether retrying the operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Connect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_messages_distinguish_owner() {
        let double = LeaseError::OwnershipConflict {
            owner: "task#1".into(),
            requester: "task#1".into(),
            held_by_requester: true,
        };
        assert_eq!(
            double.to_string(),
            "cannot lease connection; it is already leased by the current task (task#1)."
        );

        let contended = LeaseError::OwnershipConflict {
            owner: "task#1".into(),
            requester: "task#2".into(),
            held_by_requester: false,
        };
        assert_eq!(
            contended.to_string(),
            "cannot lease connection; it is already in use by a different task: task#1. \
             Current task: task#2."
        );
    }

    #[test]
    fn test_lease_error_is_transparent() {
        let err = PoolError::from(LeaseError::NotLeased { operation: "steal" });
        assert_eq!(
            err.to_string(),
            "cannot steal connection; it is not currently leased."
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        let exhausted = PoolError::Exhausted {
            timeout: Duration::from_secs(1),
        };
        assert!(exhausted.is_transient());
        assert!(!PoolError::Closed.is_transient());
    }
}

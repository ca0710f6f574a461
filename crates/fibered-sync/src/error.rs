//! Lock error types.

use thiserror::Error;

/// Errors raised by [`PriorityLock`](crate::PriorityLock) and
/// [`Condition`](crate::Condition) misuse.
///
/// Both variants indicate a programming error in the caller. Task
/// identities are rendered to strings so the error stays `Send`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The operation requires the lock, but another task holds it.
    #[error("cannot {operation}: lock is held by {owner}, not by {caller}")]
    NotOwner {
        /// Operation that was attempted.
        operation: &'static str,
        /// Task currently holding the lock.
        owner: String,
        /// Task that attempted the operation.
        caller: String,
    },

    /// The operation requires the lock, but nobody holds it.
    #[error("cannot {operation}: lock is not held (caller: {caller})")]
    NotLocked {
        /// Operation that was attempted.
        operation: &'static str,
        /// Task that attempted the operation.
        caller: String,
    },
}

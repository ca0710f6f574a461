//! # fibered-sync
//!
//! Task identity and a priority-ordered reentrant lock for cooperatively
//! scheduled tasks sharing a single thread.
//!
//! ## Features
//!
//! - [`TaskIdentity`]: comparable handle to the running task, with
//!   liveness tracking and a no-task sentinel
//! - [`PriorityLock`]: reentrant lock with direct hand-off to the next
//!   waiter
//! - [`Condition`]: condition variable whose woken tasks jump ahead of
//!   plain lock waiters
//!
//! Everything here is `!Send` on purpose: the types model tasks that
//! never leave the thread they were spawned on.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fibered_sync::{PriorityLock, TaskIdentity};
//!
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let lock = PriorityLock::new();
//!     let worker = TaskIdentity::spawn_local("worker", {
//!         let lock = lock.clone();
//!         async move {
//!             lock.scoped(|| async { /* exclusive section */ }).await;
//!         }
//!     });
//!     worker.await?;
//! }).await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod condition;
pub mod error;
pub mod lock;
pub mod task;

pub use condition::Condition;
pub use error::LockError;
pub use lock::PriorityLock;
pub use task::{LocalTaskSource, Scoped, TaskIdentity, TaskSource};

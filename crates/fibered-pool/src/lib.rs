//! # fibered-pool
//!
//! Database connection pool for cooperatively scheduled tasks sharing one
//! thread.
//!
//! Each task checks out at most one connection, which stays cached under the
//! task's identity until it is released. Connections left behind by tasks
//! that terminated without releasing them are reclaimed on the next
//! checkout.
//!
//! ## Features
//!
//! - Per-task connection caching with a lock-free fast path
//! - Checkout with timeout, waking waiters in check-in order
//! - Reaping of connections owned by terminated tasks
//! - Ownership transfer between tasks (`steal_connection`)
//! - Pool status and checkout metrics
//!
//! ## Example
//!
//! ```rust,ignore
//! use fibered_pool::{ConnectionManager, ConnectionPool};
//! use fibered_sync::TaskIdentity;
//! use std::time::Duration;
//!
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let pool = ConnectionPool::builder(manager)
//!         .max_connections(10)
//!         .checkout_timeout(Duration::from_secs(2))
//!         .build()?;
//!
//!     let handler = TaskIdentity::spawn_local("request", {
//!         let pool = pool.clone();
//!         async move {
//!             pool.with_connection(|conn| async move {
//!                 // Use connection...
//!             })
//!             .await
//!         }
//!     });
//!     handler.await??;
//!
//!     let status = pool.status();
//!     println!("Pool utilization: {:.1}%", status.utilization());
//! }).await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod lease;
pub mod pool;
mod queue;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::{LeaseError, PoolError};

// Connection types
pub use connection::{Connection, ConnectionManager};
pub use lease::{LeaseState, Owner, OwnerCache};

// Pool types
pub use pool::{ConnectionPool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};

// Task identity and locking
pub use fibered_sync::{LockError, PriorityLock, TaskIdentity, TaskSource};

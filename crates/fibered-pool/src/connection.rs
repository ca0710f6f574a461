//! Pooled connections and the factory that opens them.

use std::fmt;
use std::ops::Deref;
use std::time::Instant;

use async_trait::async_trait;
use fibered_sync::TaskIdentity;

use crate::error::LeaseError;
use crate::lease::{LeaseState, Owner, OwnerCache};

/// Factory for the raw connections a pool manages.
///
/// Implementations wrap whatever client the application uses; the pool
/// treats the connection as opaque beyond success or failure of these
/// calls.
///
/// # Example
///
/// ```rust,ignore
/// struct MysqlManager { url: String }
///
/// #[async_trait(?Send)]
/// impl ConnectionManager for MysqlManager {
///     type Connection = MysqlClient;
///     type Error = MysqlError;
///
///     async fn connect(&self) -> Result<MysqlClient, MysqlError> {
///         MysqlClient::connect(&self.url).await
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait ConnectionManager: 'static {
    /// The raw connection type.
    type Connection: 'static;

    /// Error returned when opening or closing fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Close a connection the pool is discarding.
    async fn disconnect(&self, _conn: &Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A connection owned by a pool.
///
/// Dereferences to the raw connection. Handed out as
/// [`PooledConnection`](crate::PooledConnection), so two handles refer to
/// the same connection exactly when their ids match.
pub struct Connection<C> {
    id: u64,
    raw: C,
    lease: LeaseState,
    created_at: Instant,
}

impl<C> Connection<C> {
    pub(crate) fn new(id: u64, raw: C) -> Self {
        Self {
            id,
            raw,
            lease: LeaseState::new(),
            created_at: Instant::now(),
        }
    }

    /// Pool-assigned id, unique within the pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The raw connection.
    #[must_use]
    pub fn raw(&self) -> &C {
        &self.raw
    }

    /// When the connection was opened.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Lease bookkeeping for this connection.
    #[must_use]
    pub fn lease_state(&self) -> &LeaseState {
        &self.lease
    }

    /// Current owner.
    #[must_use]
    pub fn owner(&self) -> Owner {
        self.lease.owner()
    }

    /// Whether some task holds the lease.
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.lease.in_use()
    }

    /// See [`LeaseState::lease`].
    pub fn lease(&self, requester: &TaskIdentity) -> Result<TaskIdentity, LeaseError> {
        self.lease.lease(requester)
    }

    /// See [`LeaseState::expire`].
    pub fn expire(&self, requester: &TaskIdentity) -> Result<(), LeaseError> {
        self.lease.expire(requester)
    }

    /// Take the lease from its current owner, removing this connection from
    /// the previous owner's entry in `cache`.
    pub fn steal(&self, requester: &TaskIdentity, cache: &dyn OwnerCache) -> Result<(), LeaseError> {
        self.lease
            .steal(requester, |previous| cache.evict(previous, self.id))
    }
}

impl<C> Deref for Connection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.raw
    }
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("owner", &self.lease.owner())
            .field("idle_since", &self.lease.idle_since())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct Evictions(RefCell<Vec<(TaskIdentity, u64)>>);

    impl OwnerCache for Evictions {
        fn evict(&self, owner: &TaskIdentity, connection_id: u64) {
            self.0.borrow_mut().push((owner.clone(), connection_id));
        }
    }

    #[test]
    fn test_steal_evicts_previous_owner() {
        let conn = Connection::new(7, "raw");
        let a = TaskIdentity::new("a");
        let b = TaskIdentity::new("b");
        conn.lease(&a).unwrap();

        let cache = Evictions::default();
        conn.steal(&b, &cache).unwrap();
        assert_eq!(*cache.0.borrow(), vec![(a, 7)]);
        assert_eq!(conn.owner(), Owner::LeasedBy(b));
    }

    #[test]
    fn test_deref_to_raw() {
        let conn = Connection::new(1, String::from("handle"));
        assert_eq!(conn.len(), 6);
        assert_eq!(conn.raw(), "handle");
        assert!(!conn.in_use());
    }
}

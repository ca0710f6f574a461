//! Connection pool implementation.
//!
//! The pool hands each task at most one cached connection. The lookup of
//! the calling task's cached connection takes no lock; a miss falls back to
//! double-checked locking on the pool's [`PriorityLock`], reaps connections
//! whose owning task has died, and then checks out a free connection
//! (opening a new one while below capacity).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fibered_sync::{LocalTaskSource, PriorityLock, TaskIdentity, TaskSource};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::error::PoolError;
use crate::lease::OwnerCache;
use crate::queue::ConnectionQueue;

/// Shared handle to a connection checked out of a [`ConnectionPool`].
pub type PooledConnection<C> = Rc<Connection<C>>;

/// A connection pool for cooperatively scheduled tasks on one thread.
///
/// Cloning yields another handle to the same pool.
///
/// # Example
///
/// ```rust,ignore
/// use fibered_pool::ConnectionPool;
/// use fibered_sync::TaskIdentity;
///
/// let pool = ConnectionPool::builder(manager)
///     .max_connections(10)
///     .build()?;
///
/// TaskIdentity::spawn_local("request", async move {
///     let conn = pool.connection().await?;
///     // Use connection...
///     pool.release_connection().await
/// });
/// ```
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Rc<PoolInner<M>>,
}

struct PoolInner<M: ConnectionManager> {
    /// Pool configuration.
    config: PoolConfig,

    /// Opens and closes raw connections.
    manager: M,

    /// Identifies the calling task.
    tasks: Rc<dyn TaskSource>,

    /// Guards `queue` and `cache` mutation.
    lock: PriorityLock,

    /// Every open connection, and the available subset.
    queue: ConnectionQueue<M::Connection>,

    /// Connection checked out by each task.
    cache: RefCell<HashMap<TaskIdentity, PooledConnection<M::Connection>>>,

    /// Whether the pool is closed.
    closed: Cell<bool>,

    /// Counter for generating connection IDs.
    next_connection_id: Cell<u64>,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: RefCell<PoolMetricsInner>,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections closed.
    connections_closed: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts (timeouts, errors).
    checkouts_failed: u64,
    /// Connections reclaimed from dead tasks.
    connections_reaped: u64,
    /// Connections taken over from another task.
    connections_stolen: u64,
}

impl<M: ConnectionManager> OwnerCache for PoolInner<M> {
    fn evict(&self, owner: &TaskIdentity, connection_id: u64) {
        let mut cache = self.cache.borrow_mut();
        if cache
            .get(owner)
            .is_some_and(|conn| conn.id() == connection_id)
        {
            cache.remove(owner);
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create a new pool builder around `manager`.
    #[must_use]
    pub fn builder(manager: M) -> PoolBuilder<M> {
        PoolBuilder::new(manager)
    }

    /// Create a new pool with the given configuration.
    ///
    /// No connections are opened until the first checkout. Fails if the
    /// configuration is invalid or if called from within a multi-threaded
    /// tokio runtime.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_task_source(manager, config, Rc::new(LocalTaskSource))
    }

    fn with_task_source(
        manager: M,
        config: PoolConfig,
        tasks: Rc<dyn TaskSource>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        reject_multi_thread_runtime()?;

        let lock = PriorityLock::with_task_source(Rc::clone(&tasks));
        let queue = ConnectionQueue::new(&lock, config.max_connections as usize);
        let inner = Rc::new(PoolInner {
            config: config.clone(),
            manager,
            tasks,
            lock,
            queue,
            cache: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
            next_connection_id: Cell::new(1),
            created_at: Instant::now(),
            metrics: RefCell::new(PoolMetricsInner::default()),
        });

        tracing::info!(
            max = config.max_connections,
            checkout_timeout = ?config.checkout_timeout,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get the calling task's connection, checking one out if it has none.
    ///
    /// Repeated calls from the same task return the same connection until
    /// it is released or reclaimed.
    pub async fn connection(&self) -> Result<PooledConnection<M::Connection>, PoolError> {
        let me = self.current_task();
        if let Some(conn) = self.cached(&me) {
            return Ok(conn);
        }
        self.inner.lock.scoped(|| self.connection_locked(me)).await
    }

    async fn connection_locked(
        &self,
        me: TaskIdentity,
    ) -> Result<PooledConnection<M::Connection>, PoolError> {
        // The entry may have been filled while we waited for the lock.
        if let Some(conn) = self.cached(&me) {
            return Ok(conn);
        }
        let conn = self.checkout().await?;
        self.inner
            .cache
            .borrow_mut()
            .insert(me, Rc::clone(&conn));
        Ok(conn)
    }

    /// Check out a connection using the configured timeout.
    ///
    /// The connection is leased to the calling task but not cached; return
    /// it with [`checkin`](Self::checkin).
    pub async fn checkout(&self) -> Result<PooledConnection<M::Connection>, PoolError> {
        self.checkout_timeout(self.inner.config.checkout_timeout)
            .await
    }

    /// Check out a connection, waiting at most `timeout` for one to free up.
    pub async fn checkout_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<M::Connection>, PoolError> {
        let me = self.current_task();
        self.inner
            .lock
            .scoped(|| self.checkout_locked(me, timeout))
            .await
    }

    async fn checkout_locked(
        &self,
        me: TaskIdentity,
        timeout: Duration,
    ) -> Result<PooledConnection<M::Connection>, PoolError> {
        if let Err(error) = self.reap_connections().await {
            tracing::error!(%error, "reap_connections failed during checkout");
        }

        let conn = match self.acquire_connection(timeout).await {
            Ok(conn) => conn,
            Err(error) => {
                self.inner.metrics.borrow_mut().checkouts_failed += 1;
                return Err(error);
            }
        };

        if let Err(error) = conn.lease(&me) {
            self.inner.metrics.borrow_mut().checkouts_failed += 1;
            self.inner.queue.checkin(conn)?;
            return Err(error.into());
        }

        self.inner.metrics.borrow_mut().checkouts_successful += 1;
        tracing::trace!(connection_id = conn.id(), task = %me, "connection checked out");
        Ok(conn)
    }

    /// Take an available connection, open a new one, or wait for one.
    async fn acquire_connection(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<M::Connection>, PoolError> {
        let now = tokio::time::Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| far_future(now));
        loop {
            if self.inner.closed.get() {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = self.inner.queue.poll() {
                return Ok(conn);
            }
            if self.inner.queue.has_capacity() {
                return self.open_connection().await;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Exhausted { timeout });
            }
            tracing::trace!(?remaining, "waiting for a free connection");
            self.inner.queue.wait(remaining).await?;
        }
    }

    async fn open_connection(&self) -> Result<PooledConnection<M::Connection>, PoolError> {
        let id = self.inner.next_connection_id.get();
        self.inner.next_connection_id.set(id + 1);

        let raw = self
            .inner
            .manager
            .connect()
            .await
            .map_err(|error| PoolError::Connect(Box::new(error)))?;

        let conn = Rc::new(Connection::new(id, raw));
        self.inner.queue.add(Rc::clone(&conn));
        self.inner.metrics.borrow_mut().connections_created += 1;
        tracing::debug!(connection_id = id, "opened new connection");
        Ok(conn)
    }

    /// Return a checked-out connection to the pool.
    ///
    /// The connection's lease is expired on behalf of the caller, so this
    /// fails if another live task owns it.
    pub async fn checkin(&self, conn: &PooledConnection<M::Connection>) -> Result<(), PoolError> {
        self.inner
            .lock
            .scoped(|| async { self.checkin_locked(conn) })
            .await
    }

    fn checkin_locked(&self, conn: &PooledConnection<M::Connection>) -> Result<(), PoolError> {
        if self.inner.closed.get() {
            return Err(PoolError::Closed);
        }
        if !self.inner.queue.contains(conn.id()) {
            return Err(PoolError::UnknownConnection { id: conn.id() });
        }

        let previous_owner = conn.lease_state().owner_task();
        conn.expire(&self.current_task())?;
        if let Some(owner) = &previous_owner {
            self.inner.evict(owner, conn.id());
        }
        self.inner.queue.checkin(Rc::clone(conn))?;

        tracing::trace!(connection_id = conn.id(), owner = ?previous_owner, "connection checked in");
        Ok(())
    }

    /// Release the calling task's cached connection, if it has one.
    pub async fn release_connection(&self) -> Result<(), PoolError> {
        let me = self.current_task();
        self.release_connection_for(&me).await
    }

    /// Release the connection cached under `owner`, if any.
    pub async fn release_connection_for(&self, owner: &TaskIdentity) -> Result<(), PoolError> {
        self.inner
            .lock
            .scoped(|| async {
                match self.cached(owner) {
                    Some(conn) => self.checkin_locked(&conn),
                    None => Ok(()),
                }
            })
            .await
    }

    /// Check in every leased connection whose owning task has terminated.
    ///
    /// Connections held by live tasks, and by the no-task sentinel, are left
    /// alone. Returns the number of connections reclaimed. Runs without
    /// suspending when the caller already holds the pool lock, as it does
    /// during checkout.
    pub async fn reap_connections(&self) -> Result<usize, PoolError> {
        self.inner
            .lock
            .scoped(|| async { self.reap_locked() })
            .await
    }

    fn reap_locked(&self) -> Result<usize, PoolError> {
        let abandoned: Vec<_> = self
            .inner
            .queue
            .leased()
            .into_iter()
            .filter(|conn| {
                conn.lease_state()
                    .owner_task()
                    .is_some_and(|owner| !owner.is_alive())
            })
            .collect();

        for conn in &abandoned {
            tracing::debug!(
                connection_id = conn.id(),
                owner = ?conn.lease_state().owner_task(),
                "reclaiming connection from terminated task"
            );
            self.checkin_locked(conn)?;
            self.inner.metrics.borrow_mut().connections_reaped += 1;
        }
        Ok(abandoned.len())
    }

    /// Run `body` with the calling task's connection.
    ///
    /// If the task had no cached connection, the one checked out for `body`
    /// is released afterwards; an already cached connection stays cached.
    pub async fn with_connection<F, Fut, T>(&self, body: F) -> Result<T, PoolError>
    where
        F: FnOnce(PooledConnection<M::Connection>) -> Fut,
        Fut: Future<Output = T>,
    {
        let fresh = !self.has_connection();
        let conn = self.connection().await?;
        let output = body(conn).await;
        if fresh {
            self.release_connection().await?;
        }
        Ok(output)
    }

    /// Whether the calling task has a cached connection.
    #[must_use]
    pub fn has_connection(&self) -> bool {
        self.cached(&self.current_task()).is_some()
    }

    /// Take over a connection leased by another task.
    ///
    /// The connection is removed from its previous owner's cache entry and
    /// cached under the calling task.
    pub async fn steal_connection(
        &self,
        conn: &PooledConnection<M::Connection>,
    ) -> Result<(), PoolError> {
        let me = self.current_task();
        self.inner
            .lock
            .scoped(|| async { self.steal_locked(me, conn) })
            .await
    }

    fn steal_locked(
        &self,
        me: TaskIdentity,
        conn: &PooledConnection<M::Connection>,
    ) -> Result<(), PoolError> {
        if !self.inner.queue.contains(conn.id()) {
            return Err(PoolError::UnknownConnection { id: conn.id() });
        }
        if let Some(held) = self.cached(&me) {
            if held.id() == conn.id() {
                return Ok(());
            }
            return Err(PoolError::AlreadyHolding { id: held.id() });
        }

        let previous_owner = conn.lease_state().owner_task();
        conn.steal(&me, self.inner.as_ref())?;
        self.inner
            .cache
            .borrow_mut()
            .insert(me.clone(), Rc::clone(conn));
        self.inner.metrics.borrow_mut().connections_stolen += 1;

        tracing::debug!(
            connection_id = conn.id(),
            from = ?previous_owner,
            to = %me,
            "connection stolen"
        );
        Ok(())
    }

    /// Remove a connection from the pool for good and close it.
    ///
    /// Use this for connections that failed; the freed slot lets a waiting
    /// task open a replacement.
    pub async fn discard(&self, conn: &PooledConnection<M::Connection>) -> Result<(), PoolError> {
        self.inner
            .lock
            .scoped(|| self.discard_locked(conn))
            .await
    }

    async fn discard_locked(&self, conn: &PooledConnection<M::Connection>) -> Result<(), PoolError> {
        if self.inner.queue.remove(conn.id())?.is_none() {
            return Err(PoolError::UnknownConnection { id: conn.id() });
        }
        if let Some(owner) = conn.lease_state().owner_task() {
            self.inner.evict(&owner, conn.id());
        }
        tracing::debug!(connection_id = conn.id(), "discarding connection");
        self.disconnect(conn).await;
        Ok(())
    }

    async fn disconnect(&self, conn: &PooledConnection<M::Connection>) {
        if let Err(error) = self.inner.manager.disconnect(conn.raw()).await {
            tracing::warn!(connection_id = conn.id(), %error, "failed to close connection");
        }
        self.inner.metrics.borrow_mut().connections_closed += 1;
    }

    /// Close the pool.
    ///
    /// Tasks waiting for a connection fail with [`PoolError::Closed`], every
    /// connection is closed, and the task cache is cleared.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.inner.lock.scoped(|| self.close_locked()).await
    }

    async fn close_locked(&self) -> Result<(), PoolError> {
        if self.inner.closed.replace(true) {
            return Ok(());
        }
        self.inner.cache.borrow_mut().clear();
        let connections = self.inner.queue.drain()?;
        for conn in &connections {
            self.disconnect(conn).await;
        }
        tracing::info!(closed = connections.len(), "connection pool closed");
        Ok(())
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let total = self.inner.queue.len();
        let available = self.inner.queue.available_len();
        PoolStatus {
            available,
            in_use: total - available,
            total,
            max: self.inner.queue.capacity(),
            waiting: self.inner.queue.waiting(),
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.borrow();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            connections_reaped: inner.connections_reaped,
            connections_stolen: inner.connections_stolen,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The lock guarding pool mutation.
    #[must_use]
    pub fn lock(&self) -> &PriorityLock {
        &self.inner.lock
    }

    fn current_task(&self) -> TaskIdentity {
        self.inner.tasks.current_or_none()
    }

    fn cached(&self, task: &TaskIdentity) -> Option<PooledConnection<M::Connection>> {
        self.inner.cache.borrow().get(task).cloned()
    }
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Deadline standing in for "never" when `now + timeout` overflows.
fn far_future(now: tokio::time::Instant) -> tokio::time::Instant {
    // Roughly 30 years.
    now + Duration::from_secs(86400 * 365 * 30)
}

fn reject_multi_thread_runtime() -> Result<(), PoolError> {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Err(PoolError::Config(
                "connection pool requires a current-thread runtime; \
                 tasks sharing it must run on a single thread"
                    .into(),
            ))
        }
        _ => Ok(()),
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ConnectionPool::builder(manager)
///     .max_connections(20)
///     .checkout_timeout(Duration::from_secs(2))
///     .build()?;
/// ```
pub struct PoolBuilder<M: ConnectionManager> {
    manager: M,
    pool_config: PoolConfig,
    tasks: Rc<dyn TaskSource>,
}

impl<M: ConnectionManager> PoolBuilder<M> {
    /// Create a new pool builder with default settings.
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            pool_config: PoolConfig::default(),
            tasks: Rc::new(LocalTaskSource),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the checkout timeout.
    #[must_use]
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.checkout_timeout = timeout;
        self
    }

    /// Set the reaping frequency. Any value makes [`build`](Self::build) fail.
    #[must_use]
    pub fn reaping_frequency(mut self, frequency: Option<Duration>) -> Self {
        self.pool_config.reaping_frequency = frequency;
        self
    }

    /// Use a host-supplied source of task identity.
    #[must_use]
    pub fn task_source(mut self, tasks: Rc<dyn TaskSource>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<ConnectionPool<M>, PoolError> {
        ConnectionPool::with_task_source(self.manager, self.pool_config, self.tasks)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently in use.
    pub in_use: usize,
    /// Total number of connections.
    pub total: usize,
    /// Maximum allowed connections.
    pub max: usize,
    /// Tasks waiting for a connection to free up.
    pub waiting: usize,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, etc.).
    pub checkouts_failed: u64,
    /// Connections reclaimed from terminated tasks.
    pub connections_reaped: u64,
    /// Connections taken over from another task.
    pub connections_stolen: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}

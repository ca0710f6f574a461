//! Bounded connection collection.
//!
//! Holds every connection the pool has opened plus the subset currently
//! available. Waiting for an available connection parks on a condition of
//! the pool's [`PriorityLock`], so a task woken by a check-in is served
//! before tasks that only queued for the lock. Every method must be called
//! with that lock held.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use fibered_sync::{Condition, LockError, PriorityLock};

use crate::connection::Connection;

pub(crate) struct ConnectionQueue<C> {
    capacity: usize,
    connections: RefCell<Vec<Rc<Connection<C>>>>,
    available: RefCell<VecDeque<Rc<Connection<C>>>>,
    available_cond: Condition,
}

impl<C> ConnectionQueue<C> {
    pub(crate) fn new(lock: &PriorityLock, capacity: usize) -> Self {
        Self {
            capacity,
            connections: RefCell::new(Vec::with_capacity(capacity)),
            available: RefCell::new(VecDeque::with_capacity(capacity)),
            available_cond: lock.new_condition(),
        }
    }

    /// Whether another connection may be opened.
    pub(crate) fn has_capacity(&self) -> bool {
        self.connections.borrow().len() < self.capacity
    }

    /// Register a newly opened connection. It is not made available.
    pub(crate) fn add(&self, conn: Rc<Connection<C>>) {
        self.connections.borrow_mut().push(conn);
    }

    /// Take an available connection without waiting.
    ///
    /// The most recently checked-in connection is preferred.
    pub(crate) fn poll(&self) -> Option<Rc<Connection<C>>> {
        self.available.borrow_mut().pop_back()
    }

    /// Sleep until a check-in or removal signals, or until `timeout`.
    ///
    /// Returns `false` if the timeout elapsed. The lock is held again on
    /// return either way.
    pub(crate) async fn wait(&self, timeout: Duration) -> Result<bool, LockError> {
        self.available_cond.wait_timeout(timeout).await
    }

    /// Make `conn` available and wake one waiter.
    pub(crate) fn checkin(&self, conn: Rc<Connection<C>>) -> Result<(), LockError> {
        self.available.borrow_mut().push_back(conn);
        self.available_cond.signal()
    }

    /// Forget a connection entirely, freeing its capacity slot.
    pub(crate) fn remove(&self, id: u64) -> Result<Option<Rc<Connection<C>>>, LockError> {
        self.available.borrow_mut().retain(|conn| conn.id() != id);
        let removed = {
            let mut connections = self.connections.borrow_mut();
            connections
                .iter()
                .position(|conn| conn.id() == id)
                .map(|position| connections.swap_remove(position))
        };
        if removed.is_some() {
            self.available_cond.signal()?;
        }
        Ok(removed)
    }

    /// Remove every connection and wake every waiter.
    pub(crate) fn drain(&self) -> Result<Vec<Rc<Connection<C>>>, LockError> {
        self.available.borrow_mut().clear();
        let drained = std::mem::take(&mut *self.connections.borrow_mut());
        self.available_cond.broadcast()?;
        Ok(drained)
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.connections.borrow().iter().any(|conn| conn.id() == id)
    }

    /// Snapshot of the connections that are currently leased.
    pub(crate) fn leased(&self) -> Vec<Rc<Connection<C>>> {
        self.connections
            .borrow()
            .iter()
            .filter(|conn| conn.in_use())
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub(crate) fn available_len(&self) -> usize {
        self.available.borrow().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks parked waiting for a connection.
    pub(crate) fn waiting(&self) -> usize {
        self.available_cond.parked_len()
    }
}

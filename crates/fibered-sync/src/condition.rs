//! Condition variables bound to a [`PriorityLock`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::LockError;
use crate::lock::{ParkedQueue, PriorityLock};

/// A condition variable bound to a [`PriorityLock`].
///
/// A task woken by [`signal`](Self::signal) or [`broadcast`](Self::broadcast)
/// is queued ahead of every task that is merely waiting to acquire the
/// lock, even ones that started waiting earlier.
pub struct Condition {
    lock: PriorityLock,
    parked: ParkedQueue,
}

impl Condition {
    pub(crate) fn new(lock: PriorityLock) -> Self {
        Self {
            lock,
            parked: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Release the lock, sleep until signaled, then re-acquire the lock
    /// with the caller's previous reentrancy count.
    ///
    /// The caller must hold the lock.
    pub async fn wait(&self) -> Result<(), LockError> {
        let handoff = self.lock.park(&self.parked)?;
        handoff.await;
        Ok(())
    }

    /// Like [`wait`](Self::wait), but stop sleeping after `timeout`.
    ///
    /// Returns `true` if the task was signaled and `false` if the timeout
    /// elapsed first. Either way the lock is held again on return; a timed
    /// out task queues for it with the same priority as a signaled one.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<bool, LockError> {
        let mut handoff = self.lock.park(&self.parked)?;
        if tokio::time::timeout(timeout, &mut handoff).await.is_ok() {
            return Ok(true);
        }
        let woken = self.wake_ticket(handoff.ticket());
        tracing::trace!(woken, "condition wait timed out");
        handoff.await;
        Ok(!woken)
    }

    /// Wake the longest-parked task, if any.
    ///
    /// The caller must hold the lock.
    pub fn signal(&self) -> Result<(), LockError> {
        let me = self.lock.tasks().current_or_none();
        let mut state = self.lock.state().borrow_mut();
        state.check_owner(&me, "signal")?;
        if let Some(waiter) = self.parked.borrow_mut().pop_front() {
            state.enqueue_priority(waiter);
        }
        Ok(())
    }

    /// Wake every parked task, preserving their order.
    ///
    /// The caller must hold the lock.
    pub fn broadcast(&self) -> Result<(), LockError> {
        let me = self.lock.tasks().current_or_none();
        let mut state = self.lock.state().borrow_mut();
        state.check_owner(&me, "broadcast")?;
        for waiter in self.parked.borrow_mut().drain(..) {
            state.enqueue_priority(waiter);
        }
        Ok(())
    }

    /// Number of tasks parked on this condition and not yet woken.
    #[must_use]
    pub fn parked_len(&self) -> usize {
        self.parked.borrow().len()
    }

    /// The lock this condition is bound to.
    #[must_use]
    pub fn lock(&self) -> &PriorityLock {
        &self.lock
    }

    /// Move a timed-out waiter from the parked list to the lock queue.
    ///
    /// Returns `true` if it was still parked, `false` if a signal got to
    /// it first.
    fn wake_ticket(&self, ticket: u64) -> bool {
        let waiter = {
            let mut parked = self.parked.borrow_mut();
            parked
                .iter()
                .position(|waiter| waiter.ticket() == ticket)
                .and_then(|position| parked.remove(position))
        };
        match waiter {
            Some(waiter) => {
                self.lock.state().borrow_mut().enqueue_priority(waiter);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("parked", &self.parked_len())
            .finish_non_exhaustive()
    }
}

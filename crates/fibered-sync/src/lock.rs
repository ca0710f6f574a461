//! Reentrant lock with condition-waiter priority.
//!
//! [`PriorityLock`] is a reentrant mutex for cooperatively scheduled tasks
//! on one thread. Waiting tasks sit in an explicit queue of parked slots.
//! The queue has two sections:
//!
//! 1. tasks resuming from a [`Condition`](crate::Condition) wait, FIFO
//!    among themselves;
//! 2. tasks that are only waiting to acquire, FIFO.
//!
//! Releasing the last hold hands ownership straight to the head of the
//! queue, restoring that task's saved reentrancy count, and wakes it. A
//! woken task therefore never competes with newcomers for the lock.
//!
//! # Example
//!
//! ```rust,ignore
//! use fibered_sync::PriorityLock;
//!
//! let lock = PriorityLock::new();
//! let available = lock.new_condition();
//!
//! lock.scoped(|| async {
//!     while queue.is_empty() {
//!         available.wait().await?;
//!     }
//!     Ok(queue.pop())
//! })
//! .await
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::condition::Condition;
use crate::error::LockError;
use crate::task::{LocalTaskSource, TaskIdentity, TaskSource};

/// Wake-up slot shared between a queued waiter and the future awaiting it.
#[derive(Default)]
pub(crate) struct Slot {
    granted: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Slot {
    fn grant(&self) {
        self.granted.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    fn is_granted(&self) -> bool {
        self.granted.get()
    }
}

/// A parked task: either queued for the lock or parked on a condition.
pub(crate) struct Waiter {
    ticket: u64,
    task: TaskIdentity,
    /// Reentrancy count restored when ownership is handed over.
    count: usize,
    slot: Rc<Slot>,
}

impl Waiter {
    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }
}

pub(crate) type ParkedQueue = Rc<RefCell<VecDeque<Waiter>>>;

pub(crate) struct LockState {
    owner: Option<TaskIdentity>,
    count: usize,
    queue: VecDeque<Waiter>,
    /// Length of the condition-woken section at the head of `queue`.
    priority: usize,
    next_ticket: u64,
}

impl LockState {
    fn new() -> Self {
        Self {
            owner: None,
            count: 0,
            queue: VecDeque::new(),
            priority: 0,
            next_ticket: 0,
        }
    }

    fn waiter(&mut self, task: TaskIdentity, count: usize) -> Waiter {
        self.next_ticket += 1;
        Waiter {
            ticket: self.next_ticket,
            task,
            count,
            slot: Rc::new(Slot::default()),
        }
    }

    pub(crate) fn check_owner(
        &self,
        caller: &TaskIdentity,
        operation: &'static str,
    ) -> Result<(), LockError> {
        match &self.owner {
            Some(owner) if owner == caller => Ok(()),
            Some(owner) => Err(LockError::NotOwner {
                operation,
                owner: owner.to_string(),
                caller: caller.to_string(),
            }),
            None => Err(LockError::NotLocked {
                operation,
                caller: caller.to_string(),
            }),
        }
    }

    /// Queue a task that was woken from a condition wait.
    ///
    /// It lands behind earlier condition-woken tasks and ahead of every
    /// plain acquirer. A free lock is handed over immediately.
    pub(crate) fn enqueue_priority(&mut self, waiter: Waiter) {
        if self.owner.is_none() {
            self.grant(waiter);
        } else {
            self.queue.insert(self.priority, waiter);
            self.priority += 1;
        }
    }

    fn grant(&mut self, waiter: Waiter) {
        tracing::trace!(task = %waiter.task, count = waiter.count, "lock handed off");
        self.owner = Some(waiter.task);
        self.count = waiter.count;
        waiter.slot.grant();
    }

    /// Give up the lock entirely and pass it to the next waiter, if any.
    pub(crate) fn hand_off(&mut self) {
        match self.queue.pop_front() {
            Some(waiter) => {
                self.priority = self.priority.saturating_sub(1);
                self.grant(waiter);
            }
            None => {
                self.owner = None;
                self.count = 0;
            }
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    fn remove(&mut self, ticket: u64) -> bool {
        match self.queue.iter().position(|waiter| waiter.ticket == ticket) {
            Some(position) => {
                if position < self.priority {
                    self.priority -= 1;
                }
                self.queue.remove(position);
                true
            }
            None => false,
        }
    }
}

/// Future resolving once ownership of the lock has been handed to a waiter.
///
/// Dropping it before completion withdraws the waiter; if ownership had
/// already been granted, the lock is released and passed on.
pub(crate) struct Handoff {
    state: Rc<RefCell<LockState>>,
    parked: Option<ParkedQueue>,
    ticket: u64,
    task: TaskIdentity,
    slot: Rc<Slot>,
    done: bool,
}

impl Handoff {
    fn new(state: &Rc<RefCell<LockState>>, parked: Option<ParkedQueue>, waiter: &Waiter) -> Self {
        Self {
            state: Rc::clone(state),
            parked,
            ticket: waiter.ticket,
            task: waiter.task.clone(),
            slot: Rc::clone(&waiter.slot),
            done: false,
        }
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Future for Handoff {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.slot.is_granted() {
            self.done = true;
            return Poll::Ready(());
        }
        let mut waker = self.slot.waker.borrow_mut();
        match waker.as_ref() {
            Some(existing) if existing.will_wake(cx.waker()) => {}
            _ => *waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.slot.is_granted() {
            let mut state = self.state.borrow_mut();
            if state.owner.as_ref() == Some(&self.task) {
                state.hand_off();
            }
            return;
        }
        if let Some(parked) = &self.parked {
            let mut parked = parked.borrow_mut();
            if let Some(position) = parked.iter().position(|w| w.ticket == self.ticket) {
                parked.remove(position);
                return;
            }
        }
        self.state.borrow_mut().remove(self.ticket);
    }
}

/// A reentrant lock whose condition-woken waiters outrank plain acquirers.
///
/// Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct PriorityLock {
    state: Rc<RefCell<LockState>>,
    tasks: Rc<dyn TaskSource>,
}

impl PriorityLock {
    /// Create an unlocked lock that identifies tasks via [`LocalTaskSource`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_task_source(Rc::new(LocalTaskSource))
    }

    /// Create an unlocked lock using a host-supplied task source.
    #[must_use]
    pub fn with_task_source(tasks: Rc<dyn TaskSource>) -> Self {
        Self {
            state: Rc::new(RefCell::new(LockState::new())),
            tasks,
        }
    }

    /// Acquire the lock, suspending while another task holds it.
    ///
    /// Re-acquiring a lock the caller already holds only bumps the
    /// reentrancy count.
    pub async fn acquire(&self) {
        let me = self.tasks.current_or_none();
        if let Some(handoff) = self.enter(me) {
            handoff.await;
        }
    }

    /// Acquire the lock only if that is possible without suspending.
    pub fn try_acquire(&self) -> bool {
        let me = self.tasks.current_or_none();
        let mut state = self.state.borrow_mut();
        match &state.owner {
            Some(owner) if *owner == me => {
                state.count += 1;
                true
            }
            Some(_) => false,
            None => {
                state.owner = Some(me);
                state.count = 1;
                true
            }
        }
    }

    /// Take the lock now, or queue behind the current holder.
    fn enter(&self, me: TaskIdentity) -> Option<Handoff> {
        let mut state = self.state.borrow_mut();
        match &state.owner {
            Some(owner) if *owner == me => {
                state.count += 1;
                None
            }
            Some(_) => {
                let waiter = state.waiter(me, 1);
                let handoff = Handoff::new(&self.state, None, &waiter);
                tracing::trace!(task = %waiter.task, "waiting for lock");
                state.queue.push_back(waiter);
                Some(handoff)
            }
            None => {
                state.owner = Some(me);
                state.count = 1;
                None
            }
        }
    }

    /// Release one hold on the lock.
    ///
    /// Fails if the calling task is not the holder. When the count reaches
    /// zero, ownership passes to the next waiter.
    pub fn release(&self) -> Result<(), LockError> {
        let me = self.tasks.current_or_none();
        self.release_as(&me)
    }

    fn release_as(&self, me: &TaskIdentity) -> Result<(), LockError> {
        let mut state = self.state.borrow_mut();
        state.check_owner(me, "release")?;
        state.count -= 1;
        if state.count == 0 {
            state.hand_off();
        }
        Ok(())
    }

    /// Run `body` while holding the lock.
    ///
    /// The hold is released on every exit path, including unwinding and
    /// cancellation. A failed release is logged and never propagated.
    pub async fn scoped<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let me = self.tasks.current_or_none();
        if let Some(handoff) = self.enter(me.clone()) {
            handoff.await;
        }
        let mut hold = ScopedHold {
            lock: self,
            owner: me,
            completed: false,
        };
        let output = body().await;
        hold.completed = true;
        output
    }

    /// Create a condition variable bound to this lock.
    #[must_use]
    pub fn new_condition(&self) -> Condition {
        Condition::new(self.clone())
    }

    /// Whether any task holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.borrow().owner.is_some()
    }

    /// Whether the calling task holds the lock.
    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        let me = self.tasks.current_or_none();
        self.state.borrow().owner.as_ref() == Some(&me)
    }

    /// The task holding the lock.
    #[must_use]
    pub fn owner(&self) -> Option<TaskIdentity> {
        self.state.borrow().owner.clone()
    }

    /// Reentrancy count of the current holder; zero when unlocked.
    #[must_use]
    pub fn hold_count(&self) -> usize {
        self.state.borrow().count
    }

    /// Number of tasks queued to (re)acquire the lock.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub(crate) fn tasks(&self) -> &dyn TaskSource {
        self.tasks.as_ref()
    }

    pub(crate) fn state(&self) -> &Rc<RefCell<LockState>> {
        &self.state
    }

    /// Release the caller's hold entirely and park it on `parked`.
    ///
    /// Both happen in one step without suspending, so nothing can signal
    /// the condition in between.
    pub(crate) fn park(&self, parked: &ParkedQueue) -> Result<Handoff, LockError> {
        let me = self.tasks.current_or_none();
        let mut state = self.state.borrow_mut();
        state.check_owner(&me, "wait")?;
        let count = state.count();
        let waiter = state.waiter(me, count);
        let handoff = Handoff::new(&self.state, Some(Rc::clone(parked)), &waiter);
        parked.borrow_mut().push_back(waiter);
        state.hand_off();
        Ok(handoff)
    }
}

impl Default for PriorityLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PriorityLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("PriorityLock")
            .field("owner", &state.owner)
            .field("count", &state.count)
            .field("queued", &state.queue.len())
            .field("priority", &state.priority)
            .finish()
    }
}

struct ScopedHold<'a> {
    lock: &'a PriorityLock,
    owner: TaskIdentity,
    /// Set once the body ran to completion.
    completed: bool,
}

impl Drop for ScopedHold<'_> {
    fn drop(&mut self) {
        let Err(error) = self.lock.release_as(&self.owner) else {
            return;
        };
        // A body dropped while parked on a condition has already given up
        // its hold.
        if !self.completed && !std::thread::panicking() {
            tracing::trace!(%error, task = %self.owner, "scope cancelled without holding the lock");
        } else {
            tracing::error!(%error, task = %self.owner, "failed to release lock at end of scope");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_reentrant_count() {
        let lock = PriorityLock::new();
        assert!(lock.try_acquire());
        assert!(lock.try_acquire());
        assert_eq!(lock.hold_count(), 2);
        assert!(lock.is_held_by_current());

        lock.release().unwrap();
        assert!(lock.is_locked());
        lock.release().unwrap();
        assert!(!lock.is_locked());
        assert_eq!(lock.hold_count(), 0);
    }

    #[test]
    fn test_release_unlocked_fails() {
        let lock = PriorityLock::new();
        let err = lock.release().unwrap_err();
        assert!(matches!(err, LockError::NotLocked { operation: "release", .. }));
    }

    #[test]
    fn test_release_by_other_task_fails() {
        let lock = PriorityLock::new();
        let holder = TaskIdentity::new("holder");
        let mut acquire = task::spawn(holder.scope({
            let lock = lock.clone();
            async move { lock.acquire().await }
        }));
        assert_ready!(acquire.poll());
        assert_eq!(lock.owner().unwrap().name(), Some("holder"));

        let err = lock.release().unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
        assert!(err.to_string().contains("holder"));
    }

    #[test]
    fn test_try_acquire_contended() {
        let lock = PriorityLock::new();
        let mut holder = task::spawn(TaskIdentity::new("holder").scope({
            let lock = lock.clone();
            async move { lock.acquire().await }
        }));
        assert_ready!(holder.poll());
        assert!(!lock.try_acquire());
    }

    #[test]
    fn test_cancelled_acquire_leaves_queue() {
        let lock = PriorityLock::new();
        assert!(lock.try_acquire());

        let mut waiter = task::spawn(TaskIdentity::new("waiter").scope({
            let lock = lock.clone();
            async move { lock.acquire().await }
        }));
        assert_pending!(waiter.poll());
        assert_eq!(lock.queue_len(), 1);

        drop(waiter);
        assert_eq!(lock.queue_len(), 0);
        lock.release().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_cancelled_after_handoff_passes_lock_on() {
        let lock = PriorityLock::new();
        assert!(lock.try_acquire());

        let mut first = task::spawn(TaskIdentity::new("first").scope({
            let lock = lock.clone();
            async move { lock.acquire().await }
        }));
        let mut second = task::spawn(TaskIdentity::new("second").scope({
            let lock = lock.clone();
            async move { lock.acquire().await }
        }));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        lock.release().unwrap();
        assert!(first.is_woken());
        assert_eq!(lock.owner().unwrap().name(), Some("first"));

        // first is dropped before it observes the handoff.
        drop(first);
        assert_eq!(lock.owner().unwrap().name(), Some("second"));
        assert!(second.is_woken());
        assert_ready!(second.poll());
    }

    #[test]
    fn test_handoff_restores_fifo_order() {
        let lock = PriorityLock::new();
        assert!(lock.try_acquire());

        let mut tasks: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let lock = lock.clone();
                task::spawn(TaskIdentity::new(name).scope(async move {
                    lock.acquire().await;
                    lock.release().unwrap();
                }))
            })
            .collect();
        for t in &mut tasks {
            assert_pending!(t.poll());
        }
        assert_eq!(lock.queue_len(), 3);

        lock.release().unwrap();
        assert_eq!(lock.owner().unwrap().name(), Some("a"));
        assert_ready!(tasks[0].poll());
        assert_eq!(lock.owner().unwrap().name(), Some("b"));
        assert_ready!(tasks[1].poll());
        assert_eq!(lock.owner().unwrap().name(), Some("c"));
        assert_ready!(tasks[2].poll());
        assert!(!lock.is_locked());
    }

    /// Log output of everything run inside [`LogCapture::run`].
    #[derive(Clone, Default)]
    struct LogCapture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn run(&self, f: impl FnOnce()) {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::TRACE)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .finish();
            tracing::subscriber::with_default(subscriber, f);
        }

        fn output(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_release_inside_scope_is_logged_and_swallowed() {
        let logs = LogCapture::default();
        logs.run(|| {
            let lock = PriorityLock::new();
            let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

            let mut early = task::spawn(TaskIdentity::new("early").scope({
                let lock = lock.clone();
                async move {
                    lock.scoped(|| async {
                        go_rx.await.unwrap();
                        lock.release().unwrap();
                        7
                    })
                    .await
                }
            }));
            let mut next = task::spawn(TaskIdentity::new("next").scope({
                let lock = lock.clone();
                async move { lock.acquire().await }
            }));
            assert_pending!(early.poll());
            assert_pending!(next.poll());

            go_tx.send(()).unwrap();
            assert_eq!(assert_ready!(early.poll()), 7);

            // The early release already handed the lock on; the scope must
            // not take it away from the next holder.
            assert_eq!(lock.owner().unwrap().name(), Some("next"));
            assert_eq!(lock.hold_count(), 1);
            assert_ready!(next.poll());
        });
        assert!(logs.output().contains("failed to release lock at end of scope"));
    }

    #[test]
    fn test_cancelled_wait_inside_scope_is_quiet() {
        let logs = LogCapture::default();
        logs.run(|| {
            let lock = PriorityLock::new();
            let ready = lock.new_condition();

            let mut waiter = task::spawn(TaskIdentity::new("waiter").scope({
                let lock = lock.clone();
                async move { lock.scoped(|| ready.wait()).await }
            }));
            assert_pending!(waiter.poll());
            assert!(!lock.is_locked());

            drop(waiter);
            assert!(!lock.is_locked());
            assert_eq!(lock.queue_len(), 0);
            assert!(lock.try_acquire());
        });
        let output = logs.output();
        assert!(!output.contains("failed to release"));
        assert!(output.contains("scope cancelled without holding the lock"));
    }
}

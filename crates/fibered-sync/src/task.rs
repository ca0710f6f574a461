//! Identity of the currently running logical task.
//!
//! Logical tasks are futures multiplexed on one OS thread (a tokio
//! current-thread runtime driving a [`tokio::task::LocalSet`]). A task
//! takes part in lock ownership and connection leasing by running inside
//! [`TaskIdentity::scope`], which installs its identity as "current" for
//! every poll and marks it dead once the future completes or is dropped.
//!
//! Code that runs outside any scoped task sees the [`TaskIdentity::none`]
//! sentinel, which is always alive and never equal to a real task.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;
use tokio::task::JoinHandle;
use tokio::task::futures::TaskLocalFuture;

tokio::task_local! {
    static CURRENT_TASK: TaskIdentity;
}

/// Ids start at 1; 0 is reserved for the no-task sentinel.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

struct TaskRecord {
    id: u64,
    name: Option<String>,
    alive: Cell<bool>,
}

/// Handle to a logical task, or the no-task sentinel.
///
/// Cloning is cheap and every clone observes the same liveness. Equality
/// and hashing use the task id only.
#[derive(Clone)]
pub struct TaskIdentity {
    record: Option<Rc<TaskRecord>>,
}

impl TaskIdentity {
    /// The sentinel used when no task-scheduling context is active.
    #[must_use]
    pub fn none() -> Self {
        Self { record: None }
    }

    /// Create a new, live task identity with a diagnostic name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_name(Some(name.into()))
    }

    /// Create a new, live task identity without a name.
    #[must_use]
    pub fn unnamed() -> Self {
        Self::with_name(None)
    }

    fn with_name(name: Option<String>) -> Self {
        let record = TaskRecord {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            alive: Cell::new(true),
        };
        Self {
            record: Some(Rc::new(record)),
        }
    }

    /// The identity of the task currently being polled, if any.
    ///
    /// Returns `None` outside of a [`scope`](Self::scope)d future, and also
    /// when the sentinel itself was installed as current.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_TASK
            .try_with(Clone::clone)
            .ok()
            .filter(|task| !task.is_none())
    }

    /// The current task, or the sentinel when there is none.
    #[must_use]
    pub fn current_or_none() -> Self {
        Self::current().unwrap_or_else(Self::none)
    }

    /// Spawn `future` on the current `LocalSet` as a new named task.
    ///
    /// Must be called from within a `LocalSet` context.
    pub fn spawn_local<F>(name: impl Into<String>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        tokio::task::spawn_local(Self::new(name).scope(future))
    }

    /// Run `future` with this identity installed as the current task.
    ///
    /// The identity is marked finished when the returned future completes
    /// or is dropped before completing.
    pub fn scope<F: Future>(self, future: F) -> Scoped<F> {
        Scoped {
            inner: CURRENT_TASK.scope(self.clone(), future),
            finisher: Finisher(self),
        }
    }

    /// Numeric id, or `None` for the sentinel.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.record.as_ref().map(|record| record.id)
    }

    /// Diagnostic name, if one was given.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.record.as_ref().and_then(|record| record.name.as_deref())
    }

    /// Whether this is the no-task sentinel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.record.is_none()
    }

    /// Whether the task is still running. The sentinel is always alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.record
            .as_ref()
            .is_none_or(|record| record.alive.get())
    }

    /// Declare the task terminated.
    ///
    /// [`scope`](Self::scope) does this automatically; hosts that drive
    /// tasks some other way call it when a task exits. No-op for the
    /// sentinel.
    pub fn mark_finished(&self) {
        if let Some(record) = &self.record {
            record.alive.set(false);
        }
    }
}

impl PartialEq for TaskIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TaskIdentity {}

impl Hash for TaskIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().unwrap_or(0).hash(state);
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            None => f.write_str("<no task>"),
            Some(record) => match &record.name {
                Some(name) => write!(f, "task#{} ({name})", record.id),
                None => write!(f, "task#{}", record.id),
            },
        }
    }
}

impl fmt::Debug for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            None => f.write_str("TaskIdentity::None"),
            Some(record) => f
                .debug_struct("TaskIdentity")
                .field("id", &record.id)
                .field("name", &record.name)
                .field("alive", &record.alive.get())
                .finish(),
        }
    }
}

struct Finisher(TaskIdentity);

impl Drop for Finisher {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

pin_project! {
    /// Future returned by [`TaskIdentity::scope`].
    ///
    /// The wrapped future is dropped before the identity is marked
    /// finished, so cleanup running in its destructors still sees the
    /// task as current and alive.
    pub struct Scoped<F> {
        #[pin]
        inner: TaskLocalFuture<TaskIdentity, F>,
        finisher: Finisher,
    }
}

impl<F> Scoped<F> {
    /// The identity this future runs as.
    pub fn identity(&self) -> &TaskIdentity {
        &self.finisher.0
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.inner.poll(cx));
        this.finisher.0.mark_finished();
        Poll::Ready(output)
    }
}

/// Source of "the currently executing logical task".
///
/// This is the injection point for hosts with their own scheduler. The
/// default, [`LocalTaskSource`], reads the identity installed by
/// [`TaskIdentity::scope`].
pub trait TaskSource {
    /// The current task, if code is running inside one.
    fn current(&self) -> Option<TaskIdentity>;

    /// The current task, or the sentinel when there is none.
    fn current_or_none(&self) -> TaskIdentity {
        self.current().unwrap_or_else(TaskIdentity::none)
    }
}

/// [`TaskSource`] backed by the tokio task-local set by [`TaskIdentity::scope`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTaskSource;

impl TaskSource for LocalTaskSource {
    fn current(&self) -> Option<TaskIdentity> {
        TaskIdentity::current()
    }
}

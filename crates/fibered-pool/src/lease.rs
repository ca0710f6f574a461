//! Connection ownership.
//!
//! Every pooled connection carries a [`LeaseState`] recording which task,
//! if any, currently owns it. All transitions are synchronous and never
//! suspend, so they need no lock: only the owner, or someone acting for a
//! dead owner, may move a connection out of the leased state.
//!
//! ```text
//!            lease (T)                 steal (T')
//!   Free ───────────────▶ LeasedBy(T) ───────────▶ LeasedBy(T')
//!    ▲                        │
//!    └────────────────────────┘
//!      expire (by T, or by anyone once T is dead)
//! ```

use std::cell::{Cell, RefCell};
use std::time::Instant;

use fibered_sync::TaskIdentity;

use crate::error::LeaseError;

/// Who owns a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Owner {
    /// Not leased.
    #[default]
    Free,
    /// Leased by a task (possibly the no-task sentinel).
    LeasedBy(TaskIdentity),
}

impl Owner {
    /// The owning task, if leased.
    #[must_use]
    pub fn task(&self) -> Option<&TaskIdentity> {
        match self {
            Self::Free => None,
            Self::LeasedBy(task) => Some(task),
        }
    }
}

/// Per-task connection cache that a steal must evict from.
pub trait OwnerCache {
    /// Drop `owner`'s cache entry if it refers to connection `connection_id`.
    fn evict(&self, owner: &TaskIdentity, connection_id: u64);
}

/// Lease bookkeeping embedded in every pooled connection.
#[derive(Debug, Default)]
pub struct LeaseState {
    owner: RefCell<Owner>,
    idle_since: Cell<Option<Instant>>,
}

impl LeaseState {
    /// A free lease state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current owner.
    #[must_use]
    pub fn owner(&self) -> Owner {
        self.owner.borrow().clone()
    }

    /// The owning task, if leased.
    #[must_use]
    pub fn owner_task(&self) -> Option<TaskIdentity> {
        self.owner.borrow().task().cloned()
    }

    /// Whether the connection is leased.
    #[must_use]
    pub fn in_use(&self) -> bool {
        matches!(*self.owner.borrow(), Owner::LeasedBy(_))
    }

    /// When the connection was last expired; `None` if it never was.
    #[must_use]
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since.get()
    }

    /// Lease the connection to `requester`.
    ///
    /// Fails if it already has an owner; the error says whether that owner
    /// is the requester itself (a double lease) or another task.
    pub fn lease(&self, requester: &TaskIdentity) -> Result<TaskIdentity, LeaseError> {
        let mut owner = self.owner.borrow_mut();
        if let Owner::LeasedBy(current) = &*owner {
            return Err(LeaseError::OwnershipConflict {
                owner: current.to_string(),
                requester: requester.to_string(),
                held_by_requester: current == requester,
            });
        }
        *owner = Owner::LeasedBy(requester.clone());
        Ok(requester.clone())
    }

    /// Return the connection to the free state.
    ///
    /// Only the owner may expire a connection, unless the owner has died,
    /// in which case anyone may reclaim it.
    pub fn expire(&self, requester: &TaskIdentity) -> Result<(), LeaseError> {
        let mut owner = self.owner.borrow_mut();
        match &*owner {
            Owner::Free => return Err(LeaseError::NotLeased { operation: "expire" }),
            Owner::LeasedBy(current) if current != requester && current.is_alive() => {
                return Err(LeaseError::OwnershipViolation {
                    owner: current.to_string(),
                    requester: requester.to_string(),
                });
            }
            Owner::LeasedBy(_) => {}
        }
        *owner = Owner::Free;
        self.idle_since.set(Some(Instant::now()));
        Ok(())
    }

    /// Transfer the lease to `requester`.
    ///
    /// `evict` is called with the previous owner before ownership moves.
    /// No-op if `requester` already owns the connection.
    pub fn steal(
        &self,
        requester: &TaskIdentity,
        evict: impl FnOnce(&TaskIdentity),
    ) -> Result<(), LeaseError> {
        let previous = match &*self.owner.borrow() {
            Owner::Free => return Err(LeaseError::NotLeased { operation: "steal" }),
            Owner::LeasedBy(current) if current == requester => return Ok(()),
            Owner::LeasedBy(current) => current.clone(),
        };
        evict(&previous);
        *self.owner.borrow_mut() = Owner::LeasedBy(requester.clone());
        Ok(())
    }
}

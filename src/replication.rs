//! Replication policy — dirty tracking, full-state push, remote apply.
//!
//! DESIGN
//! ======
//! Local writes reach the policy through [`MutationObserver`] and mark the
//! object dirty. `push` drains the dirty set in marking order and sends one
//! full-state `USER_DATA` message per object, or a removal for objects that
//! no longer exist. `apply_remote` overwrites an object from such a message
//! inside a suppression scope, so the observer callback fired by the write
//! does not mark it dirty again and peers never echo each other's state
//! back.
//!
//! The policy is a cheap `Rc` handle: the arena holds one clone as its
//! observer while the session drives push/apply through another. Everything
//! is single-threaded (`Cell` / `RefCell`).
//!
//! REENTRANCY
//! ==========
//! At most one push or apply runs at a time. A nested attempt logs at error
//! level and returns `ReentrantApply`; dirty state is left untouched. Debug
//! builds panic instead so the offending call stack is visible.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use tracing::{debug, error};

use crate::link::SessionLink;
use crate::message::{self, ErrorCode, ProxyId, StateMessage};
use crate::proxy::{MutationObserver, ProxyError, ProxyTree};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("unknown object: {0}")]
    UnknownObject(ProxyId),
    #[error("{0} entered while another push or apply is running")]
    ReentrantApply(&'static str),
    #[error("state message for object {0} has no group/name")]
    Malformed(ProxyId),
}

impl From<ProxyError> for ReplicationError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::UnknownObject(id) | ProxyError::IdInUse(id) => Self::UnknownObject(id),
        }
    }
}

impl ErrorCode for ReplicationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownObject(_) => "E_UNKNOWN_OBJECT",
            Self::ReentrantApply(_) => "E_REENTRANT_APPLY",
            Self::Malformed(_) => "E_MALFORMED_STATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pushing,
    Applying,
}

/// Insertion-ordered set of dirty ids.
#[derive(Debug, Default)]
struct DirtySet {
    order: VecDeque<ProxyId>,
    members: HashSet<ProxyId>,
}

struct Inner {
    dirty: RefCell<DirtySet>,
    phase: Cell<Phase>,
}

#[derive(Clone)]
pub struct ReplicationPolicy {
    inner: Rc<Inner>,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// POLICY
// =============================================================================

impl ReplicationPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner { dirty: RefCell::new(DirtySet::default()), phase: Cell::new(Phase::Idle) }),
        }
    }

    /// Observer handle to install on a `ProxyArena`.
    #[must_use]
    pub fn observer(&self) -> Rc<dyn MutationObserver> {
        Rc::new(self.clone())
    }

    /// Flag `id` as needing a push. No-op inside the remote-apply scope.
    /// Returns whether the flag was newly set.
    pub fn mark_dirty(&self, id: ProxyId) -> bool {
        if self.inner.phase.get() == Phase::Applying {
            return false;
        }
        let mut dirty = self.inner.dirty.borrow_mut();
        if dirty.members.insert(id) {
            dirty.order.push_back(id);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_dirty(&self, id: ProxyId) -> bool {
        self.inner.dirty.borrow().members.contains(&id)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.inner.dirty.borrow().order.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.dirty.borrow().order.len()
    }

    /// Yield dirty ids in marking order, clearing each as it is yielded.
    ///
    /// Only ids dirty when the iterator was created are yielded; marks made
    /// while iterating wait for the next collection.
    #[must_use]
    pub fn collect_dirty(&self) -> CollectDirty<'_> {
        CollectDirty { policy: self, remaining: self.pending_count() }
    }

    /// Send the full state of every dirty object. Returns messages sent.
    ///
    /// # Errors
    ///
    /// Returns `ReentrantApply` when called during another push or apply.
    pub fn push<T, L>(&self, tree: &T, link: &mut L) -> Result<usize, ReplicationError>
    where
        T: ProxyTree + ?Sized,
        L: SessionLink + ?Sized,
    {
        let _guard = self.enter(Phase::Pushing, "push")?;
        let mut sent = 0;
        for id in self.collect_dirty() {
            let msg = match tree.snapshot(id) {
                Ok(state) => message::proxy_state(id, &state),
                Err(_) => {
                    debug!(proxy_id = id, "replication: pushing removal");
                    message::proxy_removed(id)
                }
            };
            link.send_to_other_clients(&msg);
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "replication: pushed dirty state");
        }
        Ok(sent)
    }

    /// Overwrite the target object from a full-state message, or delete it
    /// for a removal, without marking it dirty.
    ///
    /// # Errors
    ///
    /// Returns `ReentrantApply` when nested in a push or apply, `Malformed`
    /// when the payload lacks identity fields, and `UnknownObject` when the
    /// target is not in the tree.
    pub fn apply_remote<T>(&self, tree: &mut T, msg: &StateMessage) -> Result<(), ReplicationError>
    where
        T: ProxyTree + ?Sized,
    {
        let _guard = self.enter(Phase::Applying, "apply_remote")?;
        let id = msg.target_id();
        if message::is_removal(msg) {
            tree.remove_proxy(id)?;
            debug!(proxy_id = id, "replication: applied remote removal");
            return Ok(());
        }
        let state = message::parse_proxy_state(msg).ok_or(ReplicationError::Malformed(id))?;
        tree.restore(id, state)?;
        debug!(proxy_id = id, "replication: applied remote state");
        Ok(())
    }

    /// Like [`apply_remote`](Self::apply_remote), but first creates the
    /// target under its remote id when this tree has never seen it, and
    /// treats removal of an unknown object as done.
    ///
    /// # Errors
    ///
    /// Returns `ReentrantApply` when nested in a push or apply and
    /// `Malformed` when the payload lacks identity fields.
    pub fn adopt_remote<T>(&self, tree: &mut T, msg: &StateMessage) -> Result<(), ReplicationError>
    where
        T: ProxyTree + ?Sized,
    {
        let _guard = self.enter(Phase::Applying, "adopt_remote")?;
        let id = msg.target_id();
        if message::is_removal(msg) {
            if tree.contains(id) {
                tree.remove_proxy(id)?;
                debug!(proxy_id = id, "replication: applied remote removal");
            }
            return Ok(());
        }
        let state = message::parse_proxy_state(msg).ok_or(ReplicationError::Malformed(id))?;
        if !tree.contains(id) {
            tree.insert_proxy(id, &state.group, &state.name)?;
            debug!(proxy_id = id, group = %state.group, name = %state.name, "replication: adopted remote proxy");
        }
        tree.restore(id, state)?;
        Ok(())
    }

    /// Suppress dirty marking until the guard drops. Used for bulk loads.
    ///
    /// # Errors
    ///
    /// Returns `ReentrantApply` when a push or apply is already running.
    pub fn enter_remote_scope(&self) -> Result<RemoteScope<'_>, ReplicationError> {
        self.enter(Phase::Applying, "remote scope")
    }

    /// Drop every pending mark.
    pub fn clear(&self) {
        let mut dirty = self.inner.dirty.borrow_mut();
        dirty.order.clear();
        dirty.members.clear();
    }

    fn enter(&self, phase: Phase, what: &'static str) -> Result<RemoteScope<'_>, ReplicationError> {
        let current = self.inner.phase.get();
        if current != Phase::Idle {
            error!(operation = what, phase = ?current, "replication: reentrant apply rejected");
            if cfg!(all(debug_assertions, not(test))) {
                panic!("replication: {what} entered during {current:?}");
            }
            return Err(ReplicationError::ReentrantApply(what));
        }
        self.inner.phase.set(phase);
        Ok(RemoteScope { inner: &self.inner })
    }
}

impl MutationObserver for ReplicationPolicy {
    fn modified(&self, id: ProxyId) {
        self.mark_dirty(id);
    }
}

/// Active push/apply phase. Returns the policy to idle on drop.
#[must_use]
pub struct RemoteScope<'a> {
    inner: &'a Inner,
}

impl Drop for RemoteScope<'_> {
    fn drop(&mut self) {
        self.inner.phase.set(Phase::Idle);
    }
}

/// One-shot iterator returned by [`ReplicationPolicy::collect_dirty`].
pub struct CollectDirty<'a> {
    policy: &'a ReplicationPolicy,
    remaining: usize,
}

impl Iterator for CollectDirty<'_> {
    type Item = ProxyId;

    fn next(&mut self) -> Option<ProxyId> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut dirty = self.policy.inner.dirty.borrow_mut();
        let id = dirty.order.pop_front()?;
        dirty.members.remove(&id);
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[cfg(test)]
#[path = "replication_test.rs"]
mod tests;

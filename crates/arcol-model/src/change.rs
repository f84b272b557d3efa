//! Transaction scoping and change origin.
//!
//! Every local mutation happens inside [`ChangeManager::make_changes`]. Scopes
//! nest: inner calls join the outer one and only the outermost call closes the
//! storage batch and discards the room's merge history (undo is handled by
//! [`UndoHistory`](crate::UndoHistory), not by storage).
//!
//! Remote batches are reconciled inside a separate remote scope. Derived
//! cleanup performed during reconciliation (relation GC, hierarchy cascades)
//! is permitted there and is tagged [`ChangeOrigin::Remote`] unless a local
//! scope is opened on top of it.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use arcol_live::Room;
use serde::{Deserialize, Serialize};

/// Where a change came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// Made by this client inside `make_changes`.
    #[default]
    Local,
    /// Observed through the room subscription.
    Remote,
}

impl fmt::Display for ChangeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOrigin::Local => f.write_str("local"),
            ChangeOrigin::Remote => f.write_str("remote"),
        }
    }
}

/// Proof that a local transaction is open.
///
/// Only handed out by [`ChangeManager::make_changes`]. Typed mutators take
/// `&Transaction` so product code cannot call them outside a scope.
pub struct Transaction<'a> {
    depth: u32,
    _scope: PhantomData<&'a ChangeManager>,
}

impl Transaction<'_> {
    /// Nesting depth of this scope, 1 for the outermost.
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

/// Reentrant transaction scopes over one room.
pub struct ChangeManager {
    room: Room,
    local_depth: Cell<u32>,
    remote_depth: Cell<u32>,
}

impl ChangeManager {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            local_depth: Cell::new(0),
            remote_depth: Cell::new(0),
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Whether store and entity mutators are currently permitted.
    pub fn making_changes(&self) -> bool {
        self.local_depth.get() > 0 || self.remote_depth.get() > 0
    }

    /// Origin to tag changes made right now.
    pub fn origin(&self) -> ChangeOrigin {
        if self.local_depth.get() == 0 && self.remote_depth.get() > 0 {
            ChangeOrigin::Remote
        } else {
            ChangeOrigin::Local
        }
    }

    /// Run `f` inside a local transaction.
    pub fn make_changes<T>(&self, f: impl FnOnce(&Transaction<'_>) -> T) -> T {
        let guard = ScopeGuard::enter(&self.local_depth);
        let tx = Transaction {
            depth: guard.depth,
            _scope: PhantomData,
        };
        if guard.depth > 1 {
            return f(&tx);
        }
        let result = self.room.batch(|| f(&tx));
        self.room.clear_history();
        result
    }

    /// Run `f` while reconciling a remote batch.
    pub(crate) fn reconcile<T>(&self, f: impl FnOnce() -> T) -> T {
        let guard = ScopeGuard::enter(&self.remote_depth);
        if guard.depth > 1 {
            return f();
        }
        let result = self.room.batch(f);
        self.room.clear_history();
        result
    }
}

impl fmt::Debug for ChangeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeManager")
            .field("local_depth", &self.local_depth.get())
            .field("remote_depth", &self.remote_depth.get())
            .finish()
    }
}

/// Decrements the depth counter on drop, including during unwinding.
struct ScopeGuard<'a> {
    counter: &'a Cell<u32>,
    depth: u32,
}

impl<'a> ScopeGuard<'a> {
    fn enter(counter: &'a Cell<u32>) -> Self {
        let depth = counter.get() + 1;
        counter.set(depth);
        Self { counter, depth }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.counter.set(self.counter.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcol_live::LiveObject;
    use serde_json::json;

    #[test]
    fn test_not_making_changes_by_default() {
        let changes = ChangeManager::new(Room::new());
        assert!(!changes.making_changes());
    }

    #[test]
    fn test_nested_scopes_share_one_batch() {
        let room = Room::new();
        let changes = ChangeManager::new(room.clone());
        let map = room.collection("elements");

        let depth = changes.make_changes(|outer| {
            map.set("a", LiveObject::new());
            changes.make_changes(|inner| {
                map.set("b", LiveObject::new());
                assert!(changes.making_changes());
                inner.depth()
            }) + outer.depth()
        });

        assert_eq!(depth, 3);
        assert!(!changes.making_changes());
        assert_eq!(room.take_outbox().len(), 1);
    }

    #[test]
    fn test_outermost_scope_clears_history() {
        let room = Room::new();
        let changes = ChangeManager::new(room.clone());
        changes.make_changes(|_| {
            room.collection("elements").set("a", LiveObject::new());
        });
        assert_eq!(room.history_len(), 0);
    }

    #[test]
    fn test_origin() {
        let changes = ChangeManager::new(Room::new());
        assert_eq!(changes.make_changes(|_| changes.origin()), ChangeOrigin::Local);
        assert_eq!(changes.reconcile(|| changes.origin()), ChangeOrigin::Remote);
        let nested = changes.reconcile(|| changes.make_changes(|_| changes.origin()));
        assert_eq!(nested, ChangeOrigin::Local);
    }

    #[test]
    fn test_scope_closes_on_panic() {
        let room = Room::new();
        let changes = ChangeManager::new(room.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            changes.make_changes(|_| {
                room.collection("elements")
                    .set("a", LiveObject::from_fields([("id".into(), json!("a"))].into()));
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert!(!changes.making_changes());
        assert!(!room.in_batch());
    }
}

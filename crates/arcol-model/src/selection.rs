//! The editor's selected elements.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use arcol_types::ElementId;
use tracing::error;

pub type Selection = BTreeSet<ElementId>;

/// Called with `(new, previous)` whenever the selection changes.
pub type SelectionListener = dyn Fn(&Selection, &Selection);

/// Selection state with change notification.
#[derive(Default)]
pub struct SelectionModel {
    current: RefCell<Selection>,
    listeners: RefCell<Vec<Rc<SelectionListener>>>,
}

impl SelectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Selection {
        self.current.borrow().clone()
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.current.borrow().contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.current.borrow().is_empty()
    }

    /// Replace the selection. Setting an equal selection does nothing.
    pub fn set(&self, selection: Selection) {
        if *self.current.borrow() == selection {
            return;
        }
        let previous = self.current.replace(selection.clone());

        let listeners: Vec<_> = self.listeners.borrow().iter().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&selection, &previous))).is_err() {
                error!("selection listener panicked");
            }
        }
    }

    pub fn clear(&self) {
        self.set(Selection::new());
    }

    pub fn subscribe(&self, listener: impl Fn(&Selection, &Selection) + 'static) {
        let listener: Rc<SelectionListener> = Rc::new(listener);
        self.listeners.borrow_mut().push(listener);
    }
}

impl fmt::Debug for SelectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.current.borrow().iter()).finish()
    }
}

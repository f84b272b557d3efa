//! The editing session: stores, history, selection and deferred work wired
//! together for one room.
//!
//! Listener order on the elements store is fixed at [`Editor::open`]:
//! hierarchy index, relation cleanup, undo history, then deferred-work
//! observers. Product code registering later sees every derived index up to
//! date.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use arcol_live::Room;
use arcol_types::{fields, ElementId, ElementKind};
use tracing::debug;

use crate::change::{ChangeManager, Transaction};
use crate::config::EditorConfig;
use crate::element::Element;
use crate::project::ProjectStore;
use crate::relations::ElementRelations;
use crate::selection::{Selection, SelectionModel};
use crate::store::ObjectChange;
use crate::undo::UndoHistory;
use crate::Result;

/// Derived cleanup that runs after changes settle.
pub trait DeferredWork {
    fn run_deferred_work(&self, project: &ProjectStore, tx: &Transaction<'_>);
}

/// Removes extrusions left without a sketch.
///
/// Extrusions lose their sketch when it is deleted or moved elsewhere. The
/// affected extrusions are queued as that happens and removed by the next
/// deferred pass if they are still empty.
#[derive(Debug, Default)]
pub struct DeleteEmptyExtrusions {
    candidates: RefCell<BTreeSet<ElementId>>,
}

impl DeleteEmptyExtrusions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_change(&self, project: &ProjectStore, element: &Element, change: &ObjectChange) {
        if element.kind() != ElementKind::Sketch {
            return;
        }
        match change {
            ObjectChange::Delete => {
                if let Some(parent) = element.parent()
                    && parent.kind() == ElementKind::Extrusion
                {
                    self.candidates.borrow_mut().insert(parent.id());
                }
            }
            ObjectChange::Update { property, old_value } if property == fields::PARENT_ID => {
                let old_parent = old_value
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .and_then(|id| project.get_by_id(&id));
                if let Some(old_parent) = old_parent
                    && old_parent.kind() == ElementKind::Extrusion
                {
                    self.candidates.borrow_mut().insert(old_parent.id());
                }
            }
            _ => {}
        }
    }

    pub fn queued(&self) -> usize {
        self.candidates.borrow().len()
    }
}

impl DeferredWork for DeleteEmptyExtrusions {
    fn run_deferred_work(&self, project: &ProjectStore, tx: &Transaction<'_>) {
        let candidates = std::mem::take(&mut *self.candidates.borrow_mut());
        for id in candidates {
            if let Some(extrusion) = project.get_by_id(&id)
                && extrusion.kind() == ElementKind::Extrusion
                && extrusion.children().is_empty()
            {
                debug!(id = %id, "removing empty extrusion");
                project.remove_element(tx, &extrusion);
            }
        }
    }
}

/// One open document.
pub struct Editor {
    config: EditorConfig,
    changes: Rc<ChangeManager>,
    project: ProjectStore,
    relations: Rc<ElementRelations>,
    history: Rc<UndoHistory>,
    selection: Rc<SelectionModel>,
    deferred: Vec<Rc<dyn DeferredWork>>,
}

impl Editor {
    /// Load the document in `room` and wire up every observer.
    pub fn open(room: Room, config: EditorConfig) -> Result<Rc<Self>> {
        let changes = Rc::new(ChangeManager::new(room));
        let project = ProjectStore::new(
            Rc::clone(&changes),
            &config.elements_collection,
            &config.default_sketch_color,
        )?;
        let relations = ElementRelations::new(Rc::clone(&changes), &config.relations_collection)?;
        relations.attach_endpoint_a(project.store());
        relations.attach_endpoint_b(project.store());

        let history = UndoHistory::new(Rc::clone(&changes), config.max_undo_levels);
        history.observe(project.store());
        history.observe(relations.store());
        let selection = Rc::new(SelectionModel::new());
        history.observe_selection(&selection);

        let empty_extrusions = Rc::new(DeleteEmptyExtrusions::new());
        let editor = Rc::new(Self {
            config,
            changes,
            project,
            relations,
            history,
            selection,
            deferred: vec![Rc::clone(&empty_extrusions) as Rc<dyn DeferredWork>],
        });

        let weak = Rc::downgrade(&editor);
        editor.project.subscribe_element_change(move |element, change, _origin| {
            if let Some(editor) = weak.upgrade() {
                empty_extrusions.on_change(&editor.project, element, change);
            }
        });

        let weak = Rc::downgrade(&editor);
        editor.history.set_deferred_work(move || {
            if let Some(editor) = weak.upgrade() {
                editor.run_deferred_work();
            }
        });

        debug!(elements = editor.project.len(), relations = editor.relations.len(), "editor opened");
        Ok(editor)
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn room(&self) -> &Room {
        self.changes.room()
    }

    pub fn changes(&self) -> &Rc<ChangeManager> {
        &self.changes
    }

    pub fn project(&self) -> &ProjectStore {
        &self.project
    }

    pub fn relations(&self) -> &Rc<ElementRelations> {
        &self.relations
    }

    pub fn history(&self) -> &Rc<UndoHistory> {
        &self.history
    }

    pub fn make_changes<T>(&self, f: impl FnOnce(&Transaction<'_>) -> T) -> T {
        self.changes.make_changes(f)
    }

    /// Close the current undo step, flushing deferred work into it.
    pub fn commit(&self) {
        self.history.commit();
    }

    pub fn undo(&self) -> bool {
        self.history.undo()
    }

    pub fn redo(&self) -> bool {
        self.history.redo()
    }

    /// Run every deferred-work observer in one transaction.
    pub fn run_deferred_work(&self) {
        self.changes.make_changes(|tx| {
            for work in &self.deferred {
                work.run_deferred_work(&self.project, tx);
            }
        });
    }

    /// Per-frame pass. Its changes are not recorded in undo history.
    pub fn on_frame(&self) {
        self.history.without_recording(|| self.run_deferred_work());
    }

    pub fn selection(&self) -> Selection {
        self.selection.get()
    }

    pub fn selection_model(&self) -> &Rc<SelectionModel> {
        &self.selection
    }

    pub fn select(&self, ids: impl IntoIterator<Item = ElementId>) {
        self.selection.set(ids.into_iter().collect());
    }
}

impl fmt::Debug for Editor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Editor")
            .field("elements", &self.project.len())
            .field("relations", &self.relations.len())
            .field("history", &self.history)
            .field("selection", &self.selection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{initial_storage, ELEMENTS_COLLECTION};

    fn test_editor() -> Rc<Editor> {
        let room = Room::from_snapshot(&initial_storage(ELEMENTS_COLLECTION, ElementId::new()));
        Editor::open(room, EditorConfig::default()).unwrap()
    }

    #[test]
    fn test_open_requires_root_level() {
        let err = Editor::open(Room::new(), EditorConfig::default()).err();
        assert!(matches!(err, Some(crate::StoreError::MissingRootLevel)));
    }

    #[test]
    fn test_moving_sketch_out_queues_extrusion() {
        let editor = test_editor();
        let project = editor.project();
        let (sketch, extrusion) = editor.make_changes(|tx| {
            let sketch = project.create_sketch(tx).unwrap();
            let extrusion = project.create_extrusion(tx, &sketch).unwrap();
            (sketch, extrusion)
        });

        editor.make_changes(|tx| sketch.set_parent(tx, project.root_level()));
        editor.on_frame();

        assert!(project.get_by_id(&extrusion.id()).is_none());
        assert!(project.get_by_id(&sketch.id()).is_some());
    }

    #[test]
    fn test_frame_pass_is_not_recorded() {
        let editor = test_editor();
        let project = editor.project();
        let sketch = editor.make_changes(|tx| {
            let sketch = project.create_sketch(tx).unwrap();
            project.create_extrusion(tx, &sketch).unwrap();
            sketch
        });
        editor.commit();
        let levels = editor.history().undo_levels();

        editor.make_changes(|tx| sketch.set_parent(tx, project.root_level()));
        editor.on_frame();
        editor.commit();

        assert_eq!(editor.history().undo_levels(), levels + 1);

        // Undoing the move does not bring back the extrusion the frame removed.
        editor.undo();
        let parent = sketch.parent_id().unwrap();
        assert!(project.get_by_id(&parent).is_none());
    }

    #[test]
    fn test_commit_captures_deferred_cleanup() {
        let editor = test_editor();
        let project = editor.project();
        let (sketch, extrusion) = editor.make_changes(|tx| {
            let sketch = project.create_sketch(tx).unwrap();
            let extrusion = project.create_extrusion(tx, &sketch).unwrap();
            (sketch, extrusion)
        });
        editor.commit();

        editor.make_changes(|tx| sketch.delete(tx));
        editor.commit();
        assert!(project.get_by_id(&extrusion.id()).is_none());

        editor.undo();
        let extrusion = project.get_by_id(&extrusion.id()).unwrap();
        assert_eq!(extrusion.children().len(), 1);
    }
}

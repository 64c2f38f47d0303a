//! In-memory text model
//!
//! A headless implementation of the surface widget contracts, used by
//! the test suites and by hosts that run the engine without a mounted
//! editor (e.g. background followers of a room).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use collab::CursorPosition;
use coscribe_core::{Observers, Subscription};

use crate::widget::{ModelIdentity, RemoteCursor, SurfaceWidget, WidgetEdit, WidgetProvider};

struct ModelState {
    text: String,
    /// Local cursor as a character offset; clamped, never moved by
    /// remote edits beyond clamping.
    cursor: usize,
}

/// An in-memory widget model.
pub struct ScratchModel {
    identity: ModelIdentity,
    state: Mutex<ModelState>,
    edits: Observers<WidgetEdit>,
    cursors: Observers<CursorPosition>,
    decorations: Mutex<Vec<RemoteCursor>>,
}

impl ScratchModel {
    pub fn new(identity: ModelIdentity, text: &str) -> Arc<Self> {
        Arc::new(Self {
            identity,
            state: Mutex::new(ModelState {
                text: text.to_string(),
                cursor: 0,
            }),
            edits: Observers::new(),
            cursors: Observers::new(),
            decorations: Mutex::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    /// Simulate a user edit: splice the text and report it.
    pub fn edit(&self, offset: usize, deleted: usize, inserted: &str) {
        let edit = {
            let mut state = self.state.lock();
            let chars: Vec<char> = state.text.chars().collect();
            let offset = offset.min(chars.len());
            let deleted = deleted.min(chars.len() - offset);

            let mut next: String = chars[..offset].iter().collect();
            next.push_str(inserted);
            next.extend(&chars[offset + deleted..]);
            state.text = next;
            state.cursor = offset + inserted.chars().count();

            WidgetEdit {
                offset,
                deleted,
                inserted: inserted.to_string(),
            }
        };
        self.edits.emit(&edit);
    }

    /// Simulate the user moving the cursor.
    pub fn move_cursor(&self, position: CursorPosition) {
        {
            let mut state = self.state.lock();
            let offset = offset_for(&state.text, position);
            state.cursor = offset;
        }
        self.cursors.emit(&position);
    }

    /// Local cursor as a character offset.
    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    /// Currently rendered remote cursors.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.decorations.lock().clone()
    }
}

impl SurfaceWidget for ScratchModel {
    fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    fn apply_remote_text(&self, text: &str) {
        let mut state = self.state.lock();
        state.text = text.to_string();
        state.cursor = state.cursor.min(state.text.chars().count());
    }

    fn on_edit(&self, callback: Box<dyn Fn(&WidgetEdit) + Send + Sync>) -> Subscription {
        self.edits.subscribe(move |edit| callback(edit))
    }

    fn on_cursor(&self, callback: Box<dyn Fn(&CursorPosition) + Send + Sync>) -> Subscription {
        self.cursors.subscribe(move |position| callback(position))
    }

    fn set_remote_cursors(&self, cursors: Vec<RemoteCursor>) {
        *self.decorations.lock() = cursors;
    }

    fn offset_to_position(&self, offset: usize) -> CursorPosition {
        position_for(&self.state.lock().text, offset)
    }

    fn position_to_offset(&self, position: CursorPosition) -> usize {
        offset_for(&self.state.lock().text, position)
    }
}

fn position_for(text: &str, offset: usize) -> CursorPosition {
    let mut line = 0u32;
    let mut column = 0u32;
    for (index, ch) in text.chars().enumerate() {
        if index == offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    CursorPosition { line, column }
}

fn offset_for(text: &str, position: CursorPosition) -> usize {
    let mut line = 0u32;
    let mut column = 0u32;
    for (index, ch) in text.chars().enumerate() {
        if line == position.line && column == position.column {
            return index;
        }
        if ch == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    text.chars().count()
}

/// Provider of in-memory models, keyed and reused by identity.
#[derive(Default)]
pub struct ScratchProvider {
    models: RwLock<HashMap<ModelIdentity, Arc<ScratchModel>>>,
}

impl ScratchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete model for an identity, for inspection in tests.
    pub fn scratch_model(&self, identity: &ModelIdentity) -> Option<Arc<ScratchModel>> {
        self.models.read().get(identity).cloned()
    }
}

impl WidgetProvider for ScratchProvider {
    fn model(&self, identity: &ModelIdentity) -> Option<Arc<dyn SurfaceWidget>> {
        self.models
            .read()
            .get(identity)
            .cloned()
            .map(|model| model as Arc<dyn SurfaceWidget>)
    }

    fn create_model(&self, identity: &ModelIdentity, text: &str) -> Arc<dyn SurfaceWidget> {
        let model = ScratchModel::new(identity.clone(), text);
        self.models
            .write()
            .insert(identity.clone(), Arc::clone(&model));
        model
    }
}

//! External snapshot store
//!
//! The per-branch mapping from file path to committed/working text is
//! owned by the file-management collaborator. The engine reads it once
//! to seed a fresh document and writes it continuously so downstream
//! consumers (save-to-disk, file tree) see the converged content. It
//! is a mirror, never the authority.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Mapping from file path to text for the active branch.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, path: &str) -> Option<String>;
    fn set(&self, path: &str, text: &str);
}

/// In-memory snapshot store.
#[derive(Default)]
pub struct MemorySnapshots {
    files: RwLock<HashMap<String, String>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, text: &str) -> Self {
        self.files.write().insert(path.to_string(), text.to_string());
        self
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }
}

impl SnapshotStore for MemorySnapshots {
    fn get(&self, path: &str) -> Option<String> {
        self.files.read().get(path).cloned()
    }

    fn set(&self, path: &str, text: &str) {
        self.files.write().insert(path.to_string(), text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_set() {
        let store = MemorySnapshots::new().with_file("a.ts", "hello");
        assert_eq!(store.get("a.ts").as_deref(), Some("hello"));
        assert_eq!(store.get("b.ts"), None);

        store.set("a.ts", "changed");
        assert_eq!(store.get("a.ts").as_deref(), Some("changed"));
    }
}

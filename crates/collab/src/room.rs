//! Room naming
//!
//! A room scopes synchronization to one (project, branch, file)
//! tuple. The derivation is part of the wire contract: every client
//! must compute the identical string for the same tuple, or they will
//! silently land in different rooms and never exchange a byte.

use serde::{Deserialize, Serialize};

/// Identifier of a synchronization room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the room for a (project, branch, file) tuple:
    /// `project "-" escape(branch) "--" escape(file)`, where path
    /// separators become `--`, spaces in branch names become `%20`,
    /// and dots in file paths become `-`.
    pub fn derive(project: &str, branch: &str, file: &str) -> Self {
        Self(format!(
            "{}-{}--{}",
            project,
            escape_branch(branch),
            escape_file(file)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_branch(name: &str) -> String {
    name.replace('/', "--").replace(' ', "%20")
}

fn escape_file(path: &str) -> String {
    path.replace('/', "--").replace('.', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = RoomId::derive("p1", "main", "src/index.ts");
        let b = RoomId::derive("p1", "main", "src/index.ts");
        assert_eq!(a, b);
    }

    #[test]
    fn test_exact_wire_format() {
        let room = RoomId::derive("p1", "main", "src/index.ts");
        assert_eq!(room.as_str(), "p1-main--src--index-ts");
    }

    #[test]
    fn test_branches_with_spaces() {
        let room = RoomId::derive("p1", "my branch", "a.ts");
        assert_eq!(room.as_str(), "p1-my%20branch--a-ts");
    }

    #[test]
    fn test_distinct_branches_do_not_collide() {
        let slash = RoomId::derive("p1", "feat/x", "a.ts");
        let dash = RoomId::derive("p1", "feat-x", "a.ts");
        assert_ne!(slash, dash);
        assert_eq!(slash.as_str(), "p1-feat--x--a-ts");
        assert_eq!(dash.as_str(), "p1-feat-x--a-ts");
    }

    #[test]
    fn test_distinct_files_do_not_collide() {
        let a = RoomId::derive("p1", "main", "src/a.ts");
        let b = RoomId::derive("p1", "main", "src/b.ts");
        assert_ne!(a, b);
    }
}

//! Append-only record of user and assistant turns.
//!
//! Insertion order is the context window sent to the responder, so the log
//! offers no way to edit, reorder or remove a turn once appended.

use crate::types::{Role, Turn};

#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    turns: Vec<Turn>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn and return its position in the log.
    pub fn append(&mut self, turn: Turn) -> usize {
        self.turns.push(turn);
        self.turns.len() - 1
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn as_slice(&self) -> &[Turn] {
        &self.turns
    }

    /// Owned copy for readers that must not hold the orchestrator's lock.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn count(&self, role: Role) -> usize {
        self.turns.iter().filter(|t| t.role() == role).count()
    }
}

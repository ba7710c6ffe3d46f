//! Conversation state threaded through orchestration runs.
//!
//! The orchestrator never owns history: the caller passes the prior
//! conversation in and stores the returned one (or drops it). Within a run
//! the conversation is append-only.

use std::collections::HashSet;

use crate::inference::types::{ContentPart, Role, Turn};

/// Ordered model turns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Whether `self` begins with every turn of `other`, in order.
    pub fn starts_with(&self, other: &Conversation) -> bool {
        self.turns.starts_with(&other.turns)
    }

    /// Ids of assistant tool-use parts that no later user turn answers.
    ///
    /// Empty for any conversation the orchestrator returns, which is what
    /// keeps it valid as the prefix of the next run.
    pub fn unanswered_tool_uses(&self) -> Vec<String> {
        let mut open: Vec<String> = Vec::new();
        let mut answered: HashSet<String> = HashSet::new();

        for turn in &self.turns {
            for part in turn.parts() {
                match (turn.role, part) {
                    (Role::Assistant, ContentPart::ToolUse { id, .. }) => open.push(id),
                    (Role::User, ContentPart::ToolResult { tool_use_id, .. }) => {
                        answered.insert(tool_use_id);
                    }
                    _ => {}
                }
            }
        }

        open.retain(|id| !answered.contains(id));
        open
    }
}

impl From<Vec<Turn>> for Conversation {
    fn from(turns: Vec<Turn>) -> Self {
        Self { turns }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

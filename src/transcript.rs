//! Per-turn accumulation of streamed transcript text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// A finalized turn. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnRecord {
    pub index: usize,
    pub user: String,
    pub agent: String,
    pub completed_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.agent.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    user: Option<String>,
    agent: Option<String>,
    turn_count: usize,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `delta` to the role's buffer for the current turn and return
    /// the accumulated text.
    pub fn on_partial(&mut self, role: Role, delta: &str) -> &str {
        let buffer = self.buffer_mut(role).get_or_insert_with(String::new);
        buffer.push_str(delta);
        buffer.as_str()
    }

    pub fn current(&self, role: Role) -> &str {
        match role {
            Role::User => self.user.as_deref(),
            Role::Agent => self.agent.as_deref(),
        }
        .unwrap_or("")
    }

    pub fn has_pending(&self) -> bool {
        self.user.is_some() || self.agent.is_some()
    }

    /// Finalize both buffers into a turn record and start a fresh turn.
    /// Empty buffers produce an empty record.
    pub fn on_turn_complete(&mut self) -> TurnRecord {
        let record = TurnRecord {
            index: self.turn_count,
            user: self.user.take().unwrap_or_default().trim().to_string(),
            agent: self.agent.take().unwrap_or_default().trim().to_string(),
            completed_at: Utc::now(),
        };
        log::debug!(
            "Transcript: Finalized turn {} (user: {} chars, agent: {} chars)",
            record.index,
            record.user.len(),
            record.agent.len()
        );
        self.turn_count += 1;
        record
    }

    /// Drop the in-progress buffers without finalizing them.
    pub fn discard(&mut self) {
        if self.has_pending() {
            log::debug!("Transcript: Discarding unfinished turn");
        }
        self.user = None;
        self.agent = None;
    }

    /// Drop one role's in-progress text
    pub fn clear(&mut self, role: Role) {
        *self.buffer_mut(role) = None;
    }

    /// Number of turns finalized so far.
    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    fn buffer_mut(&mut self, role: Role) -> &mut Option<String> {
        match role {
            Role::User => &mut self.user,
            Role::Agent => &mut self.agent,
        }
    }
}

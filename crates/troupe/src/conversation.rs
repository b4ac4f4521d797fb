use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StateError;
use crate::models::message::Message;

const PREVIEW_LENGTH: usize = 80;

/// One completed turn: which agent answered, a preview of the user input,
/// and each participating agent's history length when the turn finished.
/// The indices are what `/jump` truncates back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMarker {
    pub agent: String,
    pub preview: String,
    pub indices: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub histories: HashMap<String, Vec<Message>>,
    pub turn_log: Vec<TurnMarker>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            title: String::new(),
            created_at: now,
            updated_at: now,
            histories: HashMap::new(),
            turn_log: Vec::new(),
        }
    }

    pub fn participating_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.histories.keys().cloned().collect();
        agents.sort();
        agents
    }

    fn preview_of(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.chars().count() <= PREVIEW_LENGTH {
            trimmed.to_string()
        } else {
            let cut: String = trimmed.chars().take(PREVIEW_LENGTH).collect();
            format!("{cut}…")
        }
    }

    /// Record a completed turn: replace the stored histories and append a
    /// marker with each agent's current history length.
    pub fn record_turn(
        &mut self,
        agent: &str,
        user_input: &str,
        histories: HashMap<String, Vec<Message>>,
    ) {
        let preview = Self::preview_of(user_input);
        if self.title.is_empty() {
            self.title = preview.clone();
        }
        let indices = histories
            .iter()
            .map(|(name, history)| (name.clone(), history.len()))
            .collect();
        self.histories = histories;
        self.turn_log.push(TurnMarker {
            agent: agent.to_string(),
            preview,
            indices,
        });
        self.updated_at = Utc::now();
    }

    /// Rewind to the state at the end of the given turn (0-based): every
    /// participating agent's history is truncated to the recorded index and
    /// later turns are discarded.
    pub fn jump(&mut self, turn: usize) -> Result<(), StateError> {
        let marker = self.turn_log.get(turn).cloned().ok_or_else(|| StateError {
            state: format!("{} recorded turns", self.turn_log.len()),
            operation: format!("/jump {turn}"),
        })?;

        for (agent, history) in self.histories.iter_mut() {
            let keep = marker.indices.get(agent).copied().unwrap_or(0);
            history.truncate(keep);
        }
        self.histories.retain(|_, history| !history.is_empty());
        self.turn_log.truncate(turn + 1);
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(len: usize) -> Vec<Message> {
        (0..len)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user().with_text(format!("user {i}"))
                } else {
                    Message::assistant().with_text(format!("assistant {i}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_record_turn_sets_title_and_marker() {
        let mut conversation = Conversation::new();
        let mut histories = HashMap::new();
        histories.insert("Echo".to_string(), history(2));
        conversation.record_turn("Echo", "ping", histories);

        assert_eq!(conversation.title, "ping");
        assert_eq!(conversation.turn_log.len(), 1);
        assert_eq!(conversation.turn_log[0].indices["Echo"], 2);
    }

    #[test]
    fn test_jump_truncates_per_agent() {
        let mut conversation = Conversation::new();
        for turn in 0..3 {
            let mut histories = HashMap::new();
            histories.insert("Echo".to_string(), history((turn + 1) * 2));
            conversation.record_turn("Echo", &format!("turn {turn}"), histories);
        }

        conversation.jump(1).unwrap();
        assert_eq!(conversation.histories["Echo"].len(), 4);
        assert_eq!(conversation.turn_log.len(), 2);
    }

    #[test]
    fn test_jump_out_of_range() {
        let mut conversation = Conversation::new();
        assert!(conversation.jump(0).is_err());
    }

    #[test]
    fn test_preview_truncation() {
        let long = "x".repeat(200);
        let preview = Conversation::preview_of(&long);
        assert!(preview.chars().count() <= PREVIEW_LENGTH + 1);
        assert!(preview.ends_with('…'));
    }
}

use crate::history;
use crate::id::new_id;
use crate::message::Message;
use crate::storage;
use crate::todo::TodoItem;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted record of one agent session.
///
/// `log_entries` and `todos` are a side channel the engine relays but does
/// not interpret. The one guarantee the engine makes about `messages` is
/// that any history it returns has passed the tool-call integrity check.
/// Persisted files can be truncated or hand-edited externally, so the check
/// also runs on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub log_entries: Vec<serde_json::Value>,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
}

impl SessionRecord {
    pub fn create(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("session"),
            title,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            log_entries: Vec::new(),
            todos: Vec::new(),
        }
    }

    /// Load a session and repair its history. Returns the record plus the
    /// indices of any orphaned tool messages that were dropped.
    pub fn load(session_id: &str) -> Result<(Self, Vec<usize>)> {
        let path = session_path(session_id)?;
        let mut record: SessionRecord = storage::read_json(&path)?;
        let (repaired, removed) = history::check_integrity(&record.messages);
        record.messages = repaired;
        Ok((record, removed))
    }

    pub fn save(&mut self) -> Result<()> {
        self.updated_at = Utc::now();
        let path = session_path(&self.id)?;
        storage::write_json(&path, self)
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_log(&mut self, entry: serde_json::Value) {
        self.log_entries.push(entry);
    }
}

pub fn session_path(session_id: &str) -> Result<PathBuf> {
    let base = storage::deskpilot_dir()?;
    Ok(base.join("sessions").join(format!("{}.json", session_id)))
}

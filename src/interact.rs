//! Interactions: points where a session needs a human decision.
//!
//! All sessions share one modal surface. Requests enter a global FIFO queue;
//! the front entry is the visible modal, everything behind it waits. Answers
//! are routed by `(session_id, request_id)`, never by which session the
//! human happens to be looking at.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    /// Free-form question to the human
    Ask,
    /// Approve/reject decision before a tool runs
    Approval,
}

/// A pending human decision raised by a session
#[derive(Debug, Clone, Serialize)]
pub struct Interaction {
    pub kind: InteractionKind,
    pub session_id: String,
    pub request_id: String,
    pub payload: serde_json::Value,
}

/// The human's answer, routed back to the raising session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionAnswer {
    Text { text: String },
    Approved,
    Denied {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

struct PendingEntry {
    interaction: Interaction,
    answer_tx: oneshot::Sender<InteractionAnswer>,
}

/// Errors answering an interaction
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AnswerError {
    #[error("no pending interaction for session {session_id} request {request_id}")]
    NotFound {
        session_id: String,
        request_id: String,
    },
    #[error("the raising session is no longer waiting")]
    SessionGone,
}

/// Global FIFO modal queue. The front entry is the one visible modal;
/// at most one interaction is ever visible regardless of session count.
#[derive(Default)]
pub struct ModalQueue {
    entries: VecDeque<PendingEntry>,
}

impl ModalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an interaction. Returns true if it became the visible modal
    /// (i.e. the queue was empty), along with the receiver the raising task
    /// awaits on.
    pub fn push(&mut self, interaction: Interaction) -> (bool, oneshot::Receiver<InteractionAnswer>) {
        let (answer_tx, answer_rx) = oneshot::channel();
        let became_visible = self.entries.is_empty();
        self.entries.push_back(PendingEntry {
            interaction,
            answer_tx,
        });
        (became_visible, answer_rx)
    }

    /// The currently visible interaction, if any
    pub fn visible(&self) -> Option<&Interaction> {
        self.entries.front().map(|e| &e.interaction)
    }

    /// Answer an interaction identified by `(session_id, request_id)`.
    /// Consumes the entry exactly once and returns the interaction that
    /// became visible next (if the answered entry was the visible one).
    pub fn answer(
        &mut self,
        session_id: &str,
        request_id: &str,
        answer: InteractionAnswer,
    ) -> Result<Option<Interaction>, AnswerError> {
        let pos = self
            .entries
            .iter()
            .position(|e| {
                e.interaction.session_id == session_id && e.interaction.request_id == request_id
            })
            .ok_or_else(|| AnswerError::NotFound {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            })?;

        let was_visible = pos == 0;
        let entry = self.entries.remove(pos).expect("position just found");
        entry
            .answer_tx
            .send(answer)
            .map_err(|_| AnswerError::SessionGone)?;

        if was_visible {
            Ok(self.visible().cloned())
        } else {
            Ok(None)
        }
    }

    /// Purge every entry belonging to a session (abort/crash cleanup).
    /// Dropping the senders wakes any task still awaiting an answer.
    /// Returns the interaction that became visible next if the purged
    /// session owned the visible modal.
    pub fn purge_session(&mut self, session_id: &str) -> PurgeOutcome {
        let had_visible = self
            .visible()
            .map(|i| i.session_id == session_id)
            .unwrap_or(false);
        let before = self.entries.len();
        self.entries.retain(|e| e.interaction.session_id != session_id);
        let removed = before - self.entries.len();

        PurgeOutcome {
            removed,
            dismissed_visible: had_visible,
            next_visible: if had_visible {
                self.visible().cloned()
            } else {
                None
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of purging a session from the queue
#[derive(Debug)]
pub struct PurgeOutcome {
    pub removed: usize,
    pub dismissed_visible: bool,
    pub next_visible: Option<Interaction>,
}

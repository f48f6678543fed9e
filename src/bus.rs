//! Outbound events for the host shell.
//!
//! Every event carries the session id it belongs to; the host never infers
//! ownership from which tab happens to be visible. The bus itself is owned
//! by the multiplexer; there is no ambient global channel.

use crate::interact::InteractionKind;
use crate::todo::TodoItem;
use crate::usage::ContextUsage;
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// Streamed assistant text for a session's transcript view
    AssistantDelta { session_id: String, text: String },

    /// A tool call began executing
    ToolCallStarted {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
    },

    /// A tool call finished (error carries the failure text)
    ToolCallFinished {
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// An interaction became the visible modal. Emitted only when the
    /// interaction reaches the front of the global queue, so at most one is
    /// outstanding at any time.
    InteractionRequested {
        session_id: String,
        request_id: String,
        kind: InteractionKind,
        payload: serde_json::Value,
    },

    /// Context usage changed after a completion
    UsageUpdated {
        session_id: String,
        usage: ContextUsage,
    },

    /// The session crossed its context threshold and should compact
    AutoCompactSuggested { session_id: String },

    /// The session's todo side channel changed
    TodoUpdated {
        session_id: String,
        todos: Vec<TodoItem>,
    },

    /// A turn finished with a final assistant answer
    TurnCompleted { session_id: String },

    /// A turn surfaced a failure (never emitted for user interrupts)
    TurnFailed {
        session_id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl BusEvent {
    pub fn session_id(&self) -> &str {
        match self {
            BusEvent::AssistantDelta { session_id, .. }
            | BusEvent::ToolCallStarted { session_id, .. }
            | BusEvent::ToolCallFinished { session_id, .. }
            | BusEvent::InteractionRequested { session_id, .. }
            | BusEvent::UsageUpdated { session_id, .. }
            | BusEvent::AutoCompactSuggested { session_id }
            | BusEvent::TodoUpdated { session_id, .. }
            | BusEvent::TurnCompleted { session_id }
            | BusEvent::TurnFailed { session_id, .. } => session_id,
        }
    }

    /// View events are buffered while their session is in the background and
    /// replayed on switch; the rest are delivered immediately.
    pub fn is_view_event(&self) -> bool {
        matches!(
            self,
            BusEvent::AssistantDelta { .. }
                | BusEvent::ToolCallStarted { .. }
                | BusEvent::ToolCallFinished { .. }
                | BusEvent::TodoUpdated { .. }
        )
    }
}

/// Broadcast channel the host subscribes to
pub struct Bus {
    sender: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Bus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: BusEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

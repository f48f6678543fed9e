//! Tool-call integrity repair.
//!
//! A `tool` message must answer a tool call actually emitted by an earlier
//! assistant message in the same history. Persisted sessions can be
//! truncated or hand-edited, and a crashed turn can leave a dangling result,
//! so the check runs both before transmission and after loading a session.

use crate::message::{Message, Role};
use std::collections::HashSet;

/// Drop tool messages whose `tool_call_id` does not reference a tool call
/// emitted by an earlier assistant message. Returns the repaired history and
/// the indices (into the input) of the removed messages, for logging.
///
/// Idempotent: repairing an already-repaired history removes nothing.
pub fn check_integrity(history: &[Message]) -> (Vec<Message>, Vec<usize>) {
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut kept = Vec::with_capacity(history.len());
    let mut removed = Vec::new();

    for (idx, msg) in history.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                for tc in msg.tool_calls() {
                    emitted.insert(tc.id.as_str());
                }
                kept.push(msg.clone());
            }
            Role::Tool => {
                let orphan = msg
                    .tool_call_id
                    .as_deref()
                    .map(|id| !emitted.contains(id))
                    .unwrap_or(true);
                if orphan {
                    removed.push(idx);
                } else {
                    kept.push(msg.clone());
                }
            }
            _ => kept.push(msg.clone()),
        }
    }

    (kept, removed)
}

//! Conversation compaction.
//!
//! Once a session's context tracker fires (or the provider rejects a request
//! with a context overflow), the older part of the history is summarized
//! through the completion client and replaced by a single summary message.
//! The most recent messages stay verbatim so the model keeps exact wording
//! for what it is actively working on.

use crate::error::CompletionError;
use crate::history;
use crate::message::{Message, Role};
use crate::provider::Provider;
use std::sync::Arc;

const SUMMARY_PROMPT: &str = r#"Summarize our conversation so you can continue this work later.

Write in natural language with these sections:
- **Context:** What we're working on and why (1-2 sentences)
- **What we did:** Key actions taken, documents changed, problems solved
- **Current state:** What works, what's broken, what's next
- **User preferences:** Specific requirements or decisions they made

Be concise but preserve important details."#;

/// Longest tool result quoted verbatim into the summarization transcript
const TOOL_RESULT_PREVIEW_CHARS: usize = 500;

/// Summarize everything except the last `keep_recent` messages and return
/// the replacement history. Returns the input unchanged when there is not
/// enough old material to be worth summarizing.
pub async fn compact_history(
    provider: &Arc<dyn Provider>,
    messages: &[Message],
    keep_recent: usize,
) -> Result<Vec<Message>, CompletionError> {
    let cutoff = messages.len().saturating_sub(keep_recent);
    if cutoff == 0 {
        return Ok(messages.to_vec());
    }

    let transcript = render_transcript(&messages[..cutoff]);
    let request = vec![
        Message::system("You summarize conversations for a desktop assistant."),
        Message::user(&format!("{}\n\n---\n\n{}", transcript, SUMMARY_PROMPT)),
    ];

    let completion = provider.complete(&request, &[]).await?;
    let summary = completion.message.content;

    let mut compacted = Vec::with_capacity(keep_recent + 1);
    compacted.push(Message::user(&format!(
        "## Previous Conversation Summary\n\n{}\n\n---\n\n",
        summary
    )));
    compacted.extend_from_slice(&messages[cutoff..]);

    // the cut can sever a tool exchange; drop any result whose call is gone
    let (repaired, removed) = history::check_integrity(&compacted);
    if !removed.is_empty() {
        crate::logging::debug(&format!(
            "compaction cut severed {} tool exchange(s)",
            removed.len()
        ));
    }
    Ok(repaired)
}

/// Flatten messages into a readable transcript for the summarizer
fn render_transcript(messages: &[Message]) -> String {
    let mut text = String::new();

    for msg in messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                text.push_str("**User:**\n");
                text.push_str(&msg.content);
            }
            Role::Assistant => {
                text.push_str("**Assistant:**\n");
                text.push_str(&msg.content);
                for tc in msg.tool_calls() {
                    text.push_str(&format!("\n[Tool: {} - {}]", tc.name, tc.arguments));
                }
            }
            Role::Tool => {
                let preview: String = msg.content.chars().take(TOOL_RESULT_PREVIEW_CHARS).collect();
                if preview.len() < msg.content.len() {
                    text.push_str(&format!("[Result: {}... (truncated)]", preview));
                } else {
                    text.push_str(&format!("[Result: {}]", preview));
                }
            }
        }
        text.push_str("\n\n");
    }

    text
}

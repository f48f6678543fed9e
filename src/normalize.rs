//! Message normalization before transmission.
//!
//! Prepares a conversation history for a specific target model: reasoning
//! traces are stripped from everything but the latest assistant message,
//! empty content is backfilled, and per-model quirks are patched in. Pure
//! and deterministic; the input history is never mutated.

use crate::message::{Message, Role};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Model-specific fixups, dispatched by substring match on the model id.
/// Only the matching family's fixups run.
const MODEL_FIXUPS: &[(&str, fn(&mut Vec<Message>))] = &[
    ("mistral", placeholder_for_silent_tool_calls),
    ("gemma", fold_system_into_first_user),
];

/// Produce a history safe to transmit to `model`.
pub fn normalize_for_model(history: &[Message], model: &str) -> Vec<Message> {
    let latest_assistant = history.iter().rposition(|m| m.role == Role::Assistant);

    let mut out: Vec<Message> = Vec::with_capacity(history.len());
    for (idx, msg) in history.iter().enumerate() {
        let mut msg = msg.clone();

        if msg.role == Role::Assistant {
            if Some(idx) == latest_assistant {
                // The latest assistant message may keep its reasoning; if the
                // model left content empty, promote the reasoning so a
                // follow-up model without separated reasoning still sees it.
                if msg.content.trim().is_empty() {
                    if let Some(reasoning) = msg.reasoning.take() {
                        msg.content = reasoning;
                    }
                }
            } else {
                // Past reasoning is never needed again; drop it rather than
                // paying its token cost on every turn.
                msg.reasoning = None;
                msg.content = strip_think_spans(&msg.content);
            }
        }

        out.push(msg);
    }

    let model_lower = model.to_lowercase();
    for (pattern, fixup) in MODEL_FIXUPS {
        if model_lower.contains(pattern) {
            fixup(&mut out);
        }
    }

    out
}

/// Remove inline `<think>...</think>` spans. An unterminated span is removed
/// through the end of the string.
fn strip_think_spans(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(open) = rest.find(THINK_OPEN) {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + THINK_OPEN.len()..];
        match after_open.find(THINK_CLOSE) {
            Some(close) => rest = &after_open[close + THINK_CLOSE.len()..],
            None => return out,
        }
    }

    out.push_str(rest);
    out
}

/// Some model families reject assistant messages that carry tool calls but no
/// content. Give those a readable placeholder built from the tool names.
fn placeholder_for_silent_tool_calls(history: &mut Vec<Message>) {
    for msg in history.iter_mut() {
        if msg.role == Role::Assistant
            && msg.content.trim().is_empty()
            && !msg.tool_calls().is_empty()
        {
            let names: Vec<&str> = msg.tool_calls().iter().map(|tc| tc.name.as_str()).collect();
            msg.content = format!("Calling tools: {}", names.join(", "));
        }
    }
}

/// Model families without a system role get the system prompt folded into
/// the first user message instead.
fn fold_system_into_first_user(history: &mut Vec<Message>) {
    let system_text: Vec<String> = history
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.clone())
        .collect();
    if system_text.is_empty() {
        return;
    }

    history.retain(|m| m.role != Role::System);

    if let Some(first_user) = history.iter_mut().find(|m| m.role == Role::User) {
        first_user.content = format!("{}\n\n{}", system_text.join("\n\n"), first_user.content);
    } else {
        history.insert(0, Message::user(&system_text.join("\n\n")));
    }
}

use serde::{Deserialize, Serialize};

/// Role in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation.
///
/// The shape mirrors the provider wire format: flat role + content with
/// optional tool-call metadata. A `Tool` message answers exactly one earlier
/// assistant tool call through `tool_call_id`; histories where that link is
/// broken are repaired by `history::check_integrity` before transmission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Separated reasoning trace, present only on assistant messages from
    /// models that report one. Stripped from all but the latest assistant
    /// message by the normalizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn system(text: &str) -> Self {
        Self {
            role: Role::System,
            content: text.to_string(),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: text.to_string(),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn assistant_text(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: text.to_string(),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn assistant_with_tools(text: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.to_string(),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: Role::Tool,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            reasoning: None,
        }
    }

    /// Tool calls carried by this message, empty for non-assistant messages.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    /// Character count used for the token-estimate fallback.
    pub fn char_count(&self) -> usize {
        let mut n = self.content.chars().count();
        if let Some(ref reasoning) = self.reasoning {
            n += reasoning.chars().count();
        }
        for tc in self.tool_calls() {
            n += tc.name.chars().count() + tc.arguments.chars().count();
        }
        n
    }
}

/// A tool call emitted by the model. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text, exactly as streamed by the provider.
    pub arguments: String,
}

impl ToolCall {
    /// Parse the accumulated argument text. Empty or malformed argument
    /// buffers become `null` rather than failing the turn.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        serde_json::from_str(&self.arguments).unwrap_or(serde_json::Value::Null)
    }
}

/// Tool definition advertised to the provider
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Token usage reported by the provider for one completion
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

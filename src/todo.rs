use serde::{Deserialize, Serialize};

/// One item in a session's todo side channel. The engine does not interpret
/// these; they flow from the todo tool to the host view and the session file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

//! Tool seam between the engine and the host shell.
//!
//! The Office and browser bindings live host-side; they register here as
//! `Tool` implementations. The engine owns only the dispatch plumbing, the
//! approval gate, and two built-ins: `ask_user` (a free-form question to the
//! human, handled by the turn loop through the interaction queue) and
//! `todo_write` (the todo side channel).

use crate::message::ToolDefinition;
use crate::todo::TodoItem;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the built-in question tool. Calls to it never reach `execute`;
/// the turn loop intercepts them and raises an `Ask` interaction instead.
pub const ASK_USER: &str = "ask_user";

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub output: String,
    pub title: Option<String>,
    /// Replacement todo list, when the tool updated the side channel
    pub todos: Option<Vec<TodoItem>>,
}

impl ToolOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            title: None,
            todos: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_todos(mut self, todos: Vec<TodoItem>) -> Self {
        self.todos = Some(todos);
        self
    }
}

#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub tool_call_id: String,
}

/// A tool the agent can call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what's sent to the API)
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// JSON Schema for the input parameters
    fn parameters_schema(&self) -> Value;

    /// Whether a human must approve each invocation before it runs
    fn requires_approval(&self) -> bool {
        false
    }

    /// Execute the tool with the given input
    async fn execute(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

/// Registry of available tools (Arc-wrapped for sharing across sessions)
#[derive(Clone)]
pub struct Registry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl Registry {
    /// Registry with only the built-ins
    pub fn new() -> Self {
        Self::with_tools(Vec::new())
    }

    /// Registry with the built-ins plus host-provided tools
    pub fn with_tools(host_tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        tools.insert(
            "todo_write".to_string(),
            Arc::new(TodoWriteTool) as Arc<dyn Tool>,
        );
        for tool in host_tools {
            tools.insert(tool.name().to_string(), tool);
        }
        Self {
            tools: Arc::new(tools),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Definitions advertised to the model, `ask_user` included
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = vec![ask_user_definition()];
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        for name in names {
            defs.push(self.tools[name].to_definition());
        }
        defs
    }

    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;
        tool.execute(input, ctx).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Definition of the intercepted `ask_user` built-in
pub fn ask_user_definition() -> ToolDefinition {
    ToolDefinition {
        name: ASK_USER.to_string(),
        description: "Ask the user a question and wait for their answer. Use when you need \
                      a decision or missing information to continue."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to show the user"
                }
            },
            "required": ["question"]
        }),
    }
}

/// Built-in todo side-channel tool
struct TodoWriteTool;

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the session todo list shown alongside the conversation."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": {"type": "string"},
                            "done": {"type": "boolean"}
                        },
                        "required": ["text"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput> {
        let todos: Vec<TodoItem> = serde_json::from_value(
            input
                .get("todos")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("todo_write requires a todos array"))?,
        )?;

        let open = todos.iter().filter(|t| !t.done).count();
        Ok(
            ToolOutput::new(format!("{} todos ({} open)", todos.len(), open))
                .with_todos(todos),
        )
    }
}

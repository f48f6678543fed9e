//! Mock provider for e2e tests
//!
//! Pops pre-scripted responses for deterministic testing and captures every
//! outbound history so tests can assert on what would have been transmitted.

use async_trait::async_trait;
use deskpilot::error::CompletionError;
use deskpilot::message::{Message, ToolCall, ToolDefinition, Usage};
use deskpilot::provider::{ChunkSink, Completion, Provider};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub enum MockTurn {
    Respond {
        message: Message,
        usage: Option<Usage>,
    },
    Fail(CompletionError),
}

struct MockInner {
    script: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<Vec<Message>>>,
    aborted: Mutex<bool>,
}

/// Forks share the script queue, so multi-session tests sequence pops by
/// controlling when each session's turn starts.
#[derive(Clone)]
pub struct MockProvider {
    inner: Arc<MockInner>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                script: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                aborted: Mutex::new(false),
            }),
        }
    }

    pub fn queue_text(&self, text: &str) {
        self.queue_text_with_usage(text, None);
    }

    pub fn queue_text_with_usage(&self, text: &str, usage: Option<Usage>) {
        self.inner.script.lock().unwrap().push_back(MockTurn::Respond {
            message: Message::assistant_text(text),
            usage,
        });
    }

    pub fn queue_tool_call(&self, id: &str, name: &str, arguments: &str) {
        self.inner.script.lock().unwrap().push_back(MockTurn::Respond {
            message: Message::assistant_with_tools(
                "",
                vec![ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                }],
            ),
            usage: None,
        });
    }

    pub fn queue_error(&self, error: CompletionError) {
        self.inner
            .script
            .lock()
            .unwrap()
            .push_back(MockTurn::Fail(error));
    }

    /// Every history handed to `complete`/`complete_streaming`, in order
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn was_aborted(&self) -> bool {
        *self.inner.aborted.lock().unwrap()
    }

    fn pop(&self, messages: &[Message]) -> Result<Completion, CompletionError> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .push(messages.to_vec());

        match self.inner.script.lock().unwrap().pop_front() {
            Some(MockTurn::Respond { message, usage }) => Ok(Completion {
                message,
                usage,
                finish_reason: None,
            }),
            Some(MockTurn::Fail(error)) => Err(error),
            None => Err(CompletionError::Unknown(
                "mock script exhausted".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<Completion, CompletionError> {
        self.pop(messages)
    }

    async fn complete_streaming(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, CompletionError> {
        let completion = self.pop(messages)?;
        if !completion.message.content.is_empty() {
            on_chunk(&completion.message.content, false);
        }
        on_chunk("", true);
        Ok(completion)
    }

    fn abort(&self) {
        *self.inner.aborted.lock().unwrap() = true;
    }

    fn model(&self) -> String {
        "mock-model".to_string()
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn fork(&self) -> Arc<dyn Provider> {
        Arc::new(self.clone())
    }
}

pub mod http;
pub mod retry;

use crate::error::CompletionError;
use crate::message::{Message, ToolDefinition, Usage};
use async_trait::async_trait;
use std::sync::Arc;

pub use http::HttpProvider;
pub use retry::{CancelToken, RetryState, RetryStep};

/// One finalized model response
#[derive(Debug, Clone)]
pub struct Completion {
    /// Assistant message: content plus any tool calls the model emitted
    pub message: Message,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// Chunk callback for streaming completions: `(delta_text, is_final)`.
/// Called once per content delta as it arrives, then once with `is_final`.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str, bool) + Send);

/// Completion backend for one session.
///
/// An implementation owns at most one in-flight request at a time; `abort`
/// interrupts that request and any retry wait it is sitting in. Each
/// concurrent session gets its own instance via `fork` so retry state and
/// interrupt flags are never shared.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Single-shot call returning the full response
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, CompletionError>;

    /// Streaming call; returns the accumulated response on completion
    async fn complete_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, CompletionError>;

    /// Interrupt the in-flight call. Safe to call from any task.
    fn abort(&self);

    /// Model identifier used for normalization and logging
    fn model(&self) -> String;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Independent instance for a new session (own interrupt flag, own
    /// retry state, shared connection pool where possible)
    fn fork(&self) -> Arc<dyn Provider>;
}

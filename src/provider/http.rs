//! HTTP chat-completions provider.
//!
//! Speaks the JSON chat-completions wire format: `POST {base}/chat/completions`
//! with `{model, messages, temperature, max_tokens, stream, tools?,
//! tool_choice?}`. Streaming responses arrive as newline-delimited `data: `
//! frames terminated by a `[DONE]` sentinel. Every call runs inside the
//! phased retry protocol from `retry.rs`.

use super::retry::{run_with_retry, CancelToken, ProgressFn};
use super::{ChunkSink, Completion, Provider};
use crate::config::{ProviderConfig, RetryConfig};
use crate::error::{classify_status, classify_transport, CompletionError};
use crate::logging;
use crate::message::{Message, Role, ToolCall, ToolDefinition, Usage};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Hand a chunk to the caller's sink
fn send_chunk(sink: &Mutex<ChunkSink<'_>>, text: &str, is_final: bool) {
    let mut guard = sink.lock().unwrap();
    let f: &mut (dyn FnMut(&str, bool) + Send) = &mut **guard;
    f(text, is_final);
}

pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: RwLock<String>,
    temperature: Option<f32>,
    max_tokens: u32,
    policy: RetryConfig,
    interrupt: AtomicBool,
    active: Mutex<Option<CancelToken>>,
    cooldown_progress: Option<Arc<ProgressFn>>,
}

impl HttpProvider {
    pub fn new(provider: &ProviderConfig, retry: &RetryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key: provider.api_key(),
            model: RwLock::new(provider.model.clone()),
            temperature: provider.temperature,
            max_tokens: provider.max_tokens,
            policy: *retry,
            interrupt: AtomicBool::new(false),
            active: Mutex::new(None),
            cooldown_progress: None,
        }
    }

    /// Install a callback invoked with remaining seconds during cooldown
    pub fn set_cooldown_progress(&mut self, progress: Arc<ProgressFn>) {
        self.cooldown_progress = Some(progress);
    }

    pub fn set_model(&self, model: &str) {
        *self.model.write().unwrap() = model.to_string();
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> ApiRequest {
        ApiRequest {
            model: self.model.read().unwrap().clone(),
            messages: messages.iter().map(to_api_message).collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(to_api_tool).collect())
            },
            tool_choice: None,
        }
    }

    /// At most one request may be in flight per client instance
    fn guard_single_flight(&self) -> Result<(), CompletionError> {
        if self.active.lock().unwrap().is_some() {
            return Err(CompletionError::Validation(
                "another request is already in flight on this client".to_string(),
            ));
        }
        Ok(())
    }

    /// POST the request and classify any transport or HTTP failure.
    /// The cancel token aborts the send.
    async fn send(
        &self,
        request: &ApiRequest,
        cancel: &CancelToken,
    ) -> Result<reqwest::Response, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.http.post(&url).header("content-type", "application/json");
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CompletionError::UserInterrupted),
            result = req.json(request).send() => {
                result.map_err(|e| classify_transport(&e))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }
        Ok(response)
    }

    async fn attempt_once(
        &self,
        request: ApiRequest,
        cancel: CancelToken,
    ) -> Result<Completion, CompletionError> {
        let response = self.send(&request, &cancel).await?;

        let parsed: ApiResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(CompletionError::UserInterrupted),
            body = response.json::<ApiResponse>() => {
                body.map_err(|e| CompletionError::Streaming(format!("malformed response body: {}", e)))?
            }
        };

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Streaming("response carried no choices".to_string()))?;

        Ok(Completion {
            message: from_api_message(choice.message),
            usage: parsed.usage.map(Usage::from),
            finish_reason: choice.finish_reason,
        })
    }

    async fn attempt_stream(
        &self,
        request: ApiRequest,
        cancel: CancelToken,
        sink: &Mutex<ChunkSink<'_>>,
        emitted: &AtomicBool,
    ) -> Result<Completion, CompletionError> {
        let response = self.send(&request, &cancel).await?;

        let mut stream = Box::pin(response.bytes_stream());
        let mut buffer = String::new();
        let mut acc = StreamAccumulator::default();

        loop {
            // one interrupt poll per read cycle; cancellation aborts the read
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(CompletionError::UserInterrupted),
                chunk = stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(classify_transport(&e)),
                // stream closed without the sentinel; ship what we have
                None => break,
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(line) = take_line(&mut buffer) {
                match parse_frame(&line) {
                    Frame::Done => {
                        send_chunk(sink, "", true);
                        return Ok(acc.finish());
                    }
                    Frame::Data(chunk) => {
                        for text in acc.apply(chunk) {
                            emitted.store(true, Ordering::SeqCst);
                            send_chunk(sink, &text, false);
                        }
                    }
                    Frame::Skip => {}
                }
            }
        }

        send_chunk(sink, "", true);
        Ok(acc.finish())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, CompletionError> {
        self.guard_single_flight()?;
        // a new call clears any interrupt left over from the previous one
        self.interrupt.store(false, Ordering::SeqCst);
        let request = self.build_request(messages, tools, false);

        run_with_retry(
            &self.policy,
            &self.interrupt,
            &self.active,
            self.cooldown_progress.as_deref(),
            |cancel| self.attempt_once(request.clone(), cancel),
        )
        .await
    }

    async fn complete_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, CompletionError> {
        self.guard_single_flight()?;
        self.interrupt.store(false, Ordering::SeqCst);
        let request = self.build_request(messages, tools, true);

        let sink = Mutex::new(on_chunk);
        let emitted = AtomicBool::new(false);

        run_with_retry(
            &self.policy,
            &self.interrupt,
            &self.active,
            self.cooldown_progress.as_deref(),
            |cancel| {
                let request = request.clone();
                let sink = &sink;
                let emitted = &emitted;
                async move {
                    let result = self.attempt_stream(request, cancel, sink, emitted).await;
                    match result {
                        // retrying after partial output would duplicate the
                        // text already handed to the sink
                        Err(e) if e.retryable() && emitted.load(Ordering::SeqCst) => {
                            Err(CompletionError::Streaming(format!(
                                "stream failed after partial output: {}",
                                e
                            )))
                        }
                        other => other,
                    }
                }
            },
        )
        .await
    }

    fn abort(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(cancel) = self.active.lock().unwrap().as_ref() {
            cancel.cancel();
        }
        logging::debug("abort requested");
    }

    fn model(&self) -> String {
        self.model.read().unwrap().clone()
    }

    fn name(&self) -> &str {
        "http"
    }

    fn fork(&self) -> Arc<dyn Provider> {
        Arc::new(Self {
            // reqwest clients share their connection pool across clones
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: RwLock::new(self.model.read().unwrap().clone()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            policy: self.policy,
            interrupt: AtomicBool::new(false),
            active: Mutex::new(None),
            cooldown_progress: self.cooldown_progress.clone(),
        })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize, Clone)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

#[derive(Serialize, Clone)]
struct ApiMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Clone)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: ApiFunctionCall,
}

#[derive(Serialize, Clone)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize, Clone)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunctionDef,
}

#[derive(Serialize, Clone)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_api_message(msg: &Message) -> ApiMessage {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    ApiMessage {
        role,
        // the normalizer guarantees content is always present
        content: msg.content.clone(),
        tool_calls: msg.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|tc| ApiToolCall {
                    id: tc.id.clone(),
                    call_type: "function",
                    function: ApiFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect()
        }),
        tool_call_id: msg.tool_call_id.clone(),
    }
}

fn to_api_tool(tool: &ToolDefinition) -> ApiTool {
    ApiTool {
        tool_type: "function",
        function: ApiFunctionDef {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
    #[serde(default, alias = "reasoning_content")]
    reasoning: Option<String>,
    tool_calls: Option<Vec<ApiResponseToolCall>>,
}

#[derive(Deserialize)]
struct ApiResponseToolCall {
    id: String,
    function: ApiResponseFunction,
}

#[derive(Deserialize)]
struct ApiResponseFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Clone, Copy)]
struct ApiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        let prompt = u.prompt_tokens.unwrap_or(0);
        let completion = u.completion_tokens.unwrap_or(0);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: u.total_tokens.unwrap_or(prompt + completion),
        }
    }
}

fn from_api_message(msg: ApiResponseMessage) -> Message {
    Message {
        role: Role::Assistant,
        content: msg.content.unwrap_or_default(),
        tool_calls: msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect()
        }),
        tool_call_id: None,
        reasoning: msg.reasoning,
    }
}

// ============================================================================
// Stream parsing
// ============================================================================

#[derive(Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct SseDelta {
    content: Option<String>,
    #[serde(default, alias = "reasoning_content")]
    reasoning: Option<String>,
    tool_calls: Option<Vec<SseToolCallDelta>>,
}

#[derive(Deserialize)]
struct SseToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<SseFunctionDelta>,
}

#[derive(Deserialize)]
struct SseFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

enum Frame {
    /// Payload frame carrying a parsed chunk
    Data(SseChunk),
    /// The stream-done sentinel
    Done,
    /// Anything else: blank lines, comments, unrecognized markers,
    /// malformed JSON
    Skip,
}

/// Pop one complete line off the buffer, if present
fn take_line(buffer: &mut String) -> Option<String> {
    let pos = buffer.find('\n')?;
    let line = buffer[..pos].to_string();
    buffer.drain(..=pos);
    Some(line)
}

fn parse_frame(line: &str) -> Frame {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
        return Frame::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Frame::Done;
    }

    match serde_json::from_str::<SseChunk>(data) {
        Ok(chunk) => Frame::Data(chunk),
        Err(_) => Frame::Skip,
    }
}

/// Assembles the final completion from streamed deltas
#[derive(Default)]
struct StreamAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCallBuild>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

#[derive(Default)]
struct ToolCallBuild {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    /// Fold a chunk in; returns the content deltas to hand to the sink
    fn apply(&mut self, chunk: SseChunk) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage::from(usage));
        }

        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    self.content.push_str(&text);
                    out.push(text);
                }
            }
            if let Some(reasoning) = choice.delta.reasoning {
                self.reasoning.push_str(&reasoning);
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                while self.tool_calls.len() <= tc.index {
                    self.tool_calls.push(ToolCallBuild::default());
                }
                let slot = &mut self.tool_calls[tc.index];
                if let Some(id) = tc.id {
                    slot.id = id;
                }
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        slot.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        slot.arguments.push_str(&arguments);
                    }
                }
            }
        }

        out
    }

    fn finish(self) -> Completion {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .filter(|tc| !tc.id.is_empty())
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.name,
                arguments: tc.arguments,
            })
            .collect();

        Completion {
            message: Message {
                role: Role::Assistant,
                content: self.content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                reasoning: if self.reasoning.is_empty() {
                    None
                } else {
                    Some(self.reasoning)
                },
            },
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(json: &str) -> Frame {
        parse_frame(&format!("data: {}", json))
    }

    #[test]
    fn test_take_line() {
        let mut buffer = "one\ntwo\npartial".to_string();
        assert_eq!(take_line(&mut buffer).unwrap(), "one");
        assert_eq!(take_line(&mut buffer).unwrap(), "two");
        assert!(take_line(&mut buffer).is_none());
        assert_eq!(buffer, "partial");
    }

    #[test]
    fn test_done_sentinel() {
        assert!(matches!(parse_frame("data: [DONE]"), Frame::Done));
    }

    #[test]
    fn test_non_data_frames_skipped() {
        assert!(matches!(parse_frame(""), Frame::Skip));
        assert!(matches!(parse_frame(": keepalive"), Frame::Skip));
        assert!(matches!(parse_frame("event: ping"), Frame::Skip));
    }

    #[test]
    fn test_malformed_json_skipped_not_fatal() {
        assert!(matches!(parse_frame("data: {truncated"), Frame::Skip));
    }

    #[test]
    fn test_content_deltas_accumulate() {
        let mut acc = StreamAccumulator::default();
        for piece in ["Hel", "lo ", "there"] {
            let Frame::Data(chunk) = data_frame(&format!(
                r#"{{"choices":[{{"delta":{{"content":"{}"}}}}]}}"#,
                piece
            )) else {
                panic!("expected data frame");
            };
            acc.apply(chunk);
        }
        let completion = acc.finish();
        assert_eq!(completion.message.content, "Hello there");
    }

    #[test]
    fn test_tool_call_assembled_from_deltas() {
        let mut acc = StreamAccumulator::default();
        let frames = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"insert_chart"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"kind\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"bar\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        for frame in frames {
            let Frame::Data(chunk) = data_frame(frame) else {
                panic!("expected data frame");
            };
            acc.apply(chunk);
        }

        let completion = acc.finish();
        let calls = completion.message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].name, "insert_chart");
        assert_eq!(calls[0].arguments, r#"{"kind":"bar"}"#);
        assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_usage_from_final_chunk() {
        let mut acc = StreamAccumulator::default();
        let Frame::Data(chunk) = data_frame(
            r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":30,"total_tokens":150}}"#,
        ) else {
            panic!("expected data frame");
        };
        acc.apply(chunk);
        let usage = acc.finish().usage.unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn test_reasoning_delta_not_emitted_as_content() {
        let mut acc = StreamAccumulator::default();
        let Frame::Data(chunk) = data_frame(
            r#"{"choices":[{"delta":{"reasoning_content":"thinking..."}}]}"#,
        ) else {
            panic!("expected data frame");
        };
        let emitted = acc.apply(chunk);
        assert!(emitted.is_empty());
        let completion = acc.finish();
        assert_eq!(completion.message.reasoning.as_deref(), Some("thinking..."));
    }

    #[test]
    fn test_request_omits_empty_optionals() {
        let config = ProviderConfig::default();
        let retry = RetryConfig::default();
        let provider = HttpProvider::new(&config, &retry);

        let request = provider.build_request(&[Message::user("hi")], &[], false);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());
        assert!(json.get("temperature").is_none());
        assert_eq!(json["stream"], serde_json::json!(false));
    }

    #[test]
    fn test_tool_call_wire_shape() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "open_document".to_string(),
                arguments: r#"{"path":"Q3.docx"}"#.to_string(),
            }],
        );
        let api = to_api_message(&msg);
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "open_document");
    }

    #[test]
    fn test_response_usage_backfills_total() {
        let usage = ApiUsage {
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
            total_tokens: None,
        };
        assert_eq!(Usage::from(usage).total_tokens, 15);
    }
}

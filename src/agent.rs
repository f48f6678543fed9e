//! Per-session turn loop: call the model, execute tools or pause for human
//! input, repeat until a final answer.

use crate::bus::BusEvent;
use crate::compaction;
use crate::config::config;
use crate::error::CompletionError;
use crate::history;
use crate::interact::{InteractionAnswer, InteractionKind};
use crate::logging;
use crate::message::{Message, ToolCall};
use crate::multiplexer::{SessionContext, TurnResult};
use crate::normalize::normalize_for_model;
use crate::provider::Provider;
use crate::session::SessionRecord;
use crate::tool::{Registry, ToolContext, ASK_USER};
use crate::usage::ContextTracker;
use std::sync::Arc;
use std::time::Instant;

pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: Registry,
    record: SessionRecord,
    tracker: ContextTracker,
    ctx: SessionContext,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Registry,
        record: SessionRecord,
        ctx: SessionContext,
    ) -> Self {
        let cfg = config();
        let mut tracker = ContextTracker::new(cfg.context.max_tokens);
        if let Err(e) = tracker.set_threshold(cfg.context.compact_threshold_percent) {
            logging::warn(&format!(
                "Invalid compact threshold in config, keeping default: {}",
                e
            ));
        }

        Self {
            provider,
            registry,
            record,
            tracker,
            ctx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Run one turn: user message in, final assistant answer out, with any
    /// number of tool rounds in between. Turns within a session are strictly
    /// sequential; the multiplexer enforces that.
    pub async fn run_turn(&mut self, user_message: &str) -> Result<TurnResult, CompletionError> {
        logging::set_model(&self.provider.model());
        self.record.push_message(Message::user(user_message));
        self.persist();

        let final_text = loop {
            // repair before transmission; a crashed earlier turn can leave
            // a dangling tool result behind
            let (repaired, removed) = history::check_integrity(&self.record.messages);
            if !removed.is_empty() {
                logging::warn(&format!(
                    "Dropped {} orphaned tool message(s) before send: {:?}",
                    removed.len(),
                    removed
                ));
                self.record.messages = repaired.clone();
            }

            let outbound = normalize_for_model(&repaired, &self.provider.model());
            let tools = self.registry.definitions();

            logging::info(&format!(
                "Completion starting: {} messages, {} tools",
                outbound.len(),
                tools.len()
            ));
            let started = Instant::now();

            let emit_ctx = self.ctx.clone();
            let mut on_chunk = |text: &str, is_final: bool| {
                if !is_final && !text.is_empty() {
                    emit_ctx.emit(BusEvent::AssistantDelta {
                        session_id: emit_ctx.session_id.clone(),
                        text: text.to_string(),
                    });
                }
            };

            let completion = match self
                .provider
                .complete_streaming(&outbound, &tools, &mut on_chunk)
                .await
            {
                Ok(completion) => completion,
                Err(CompletionError::ContextLengthExceeded) => {
                    // surfaced as an actionable compact signal, not a
                    // generic failure
                    self.ctx.emit(BusEvent::AutoCompactSuggested {
                        session_id: self.record.id.clone(),
                    });
                    return Err(CompletionError::ContextLengthExceeded);
                }
                Err(e) => return Err(e),
            };

            logging::info(&format!(
                "Completion finished in {:.2}s",
                started.elapsed().as_secs_f64()
            ));

            match completion.usage {
                Some(usage) => self
                    .tracker
                    .update_usage(usage.prompt_tokens, Some(usage.completion_tokens)),
                None => self.tracker.update_from_estimate(&outbound),
            }
            self.ctx.emit(BusEvent::UsageUpdated {
                session_id: self.record.id.clone(),
                usage: self.tracker.usage(),
            });

            let assistant = completion.message;
            let text = assistant.content.clone();
            let tool_calls: Vec<ToolCall> = assistant.tool_calls().to_vec();
            self.record.push_message(assistant);
            self.persist();

            self.maybe_compact().await;

            if tool_calls.is_empty() {
                break text;
            }

            for tc in &tool_calls {
                let result_content = self.run_tool_call(tc).await?;
                self.record
                    .push_message(Message::tool_result(&tc.id, &result_content));
                self.persist();
            }
        };

        Ok(TurnResult {
            session_id: self.record.id.clone(),
            text: final_text,
            messages: self.record.messages.clone(),
            usage: Some(self.tracker.usage()),
        })
    }

    /// Consume the context trigger: emit the suggestion and, when enabled,
    /// summarize in place. The trigger is re-armed only after a successful
    /// compaction, so a failed one cannot fire again until reset.
    async fn maybe_compact(&mut self) {
        if !self.tracker.should_trigger_auto_compact() {
            return;
        }

        self.ctx.emit(BusEvent::AutoCompactSuggested {
            session_id: self.record.id.clone(),
        });

        let cfg = config();
        if !cfg.context.auto_compact {
            return;
        }

        let usage_before = self.tracker.usage().total_tokens;
        match compaction::compact_history(
            &self.provider,
            &self.record.messages,
            cfg.context.keep_recent_messages,
        )
        .await
        {
            Ok(compacted) => {
                logging::info(&format!(
                    "Compacted session {} ({} -> {} messages, ~{} tokens before)",
                    self.record.id,
                    self.record.messages.len(),
                    compacted.len(),
                    usage_before
                ));
                self.record.messages = compacted;
                self.tracker.update_from_estimate(&self.record.messages);
                self.tracker.reset_auto_compact_trigger();
                self.persist();
            }
            Err(e) => {
                logging::warn(&format!("Compaction failed, continuing uncompacted: {}", e));
            }
        }
    }

    /// Execute one tool call and produce the content of its tool-result
    /// message. Tool failures are fed back to the model as error results;
    /// only a user interrupt propagates out of the turn.
    async fn run_tool_call(&mut self, tc: &ToolCall) -> Result<String, CompletionError> {
        if tc.name == ASK_USER {
            return self.run_ask_user(tc).await;
        }

        let Some(tool) = self.registry.get(&tc.name) else {
            logging::warn(&format!("Model called unknown tool '{}'", tc.name));
            return Ok(format!("Error: unknown tool '{}'", tc.name));
        };

        if tool.requires_approval() {
            let answer = self
                .ctx
                .raise_interaction(
                    InteractionKind::Approval,
                    serde_json::json!({
                        "tool": tc.name,
                        "arguments": tc.parsed_arguments(),
                        "tool_call_id": tc.id,
                    }),
                )
                .await?;

            if let InteractionAnswer::Denied { reason } = answer {
                self.ctx.emit(BusEvent::ToolCallFinished {
                    session_id: self.record.id.clone(),
                    tool_call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    error: Some("denied by user".to_string()),
                });
                return Ok(match reason {
                    Some(reason) => format!("Tool call denied by user: {}", reason),
                    None => "Tool call denied by user".to_string(),
                });
            }
        }

        self.ctx.emit(BusEvent::ToolCallStarted {
            session_id: self.record.id.clone(),
            tool_call_id: tc.id.clone(),
            tool_name: tc.name.clone(),
        });

        let started = Instant::now();
        let result = self
            .registry
            .execute(
                &tc.name,
                tc.parsed_arguments(),
                ToolContext {
                    session_id: self.record.id.clone(),
                    tool_call_id: tc.id.clone(),
                },
            )
            .await;
        logging::info(&format!(
            "Tool {} finished in {:.2}s",
            tc.name,
            started.elapsed().as_secs_f64()
        ));

        match result {
            Ok(output) => {
                if let Some(todos) = output.todos {
                    self.record.todos = todos.clone();
                    self.ctx.emit(BusEvent::TodoUpdated {
                        session_id: self.record.id.clone(),
                        todos,
                    });
                }
                self.ctx.emit(BusEvent::ToolCallFinished {
                    session_id: self.record.id.clone(),
                    tool_call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    error: None,
                });
                Ok(output.output)
            }
            Err(e) => {
                let error_msg = format!("Error: {}", e);
                self.ctx.emit(BusEvent::ToolCallFinished {
                    session_id: self.record.id.clone(),
                    tool_call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    error: Some(e.to_string()),
                });
                Ok(error_msg)
            }
        }
    }

    /// The built-in question tool never executes host-side; it pauses the
    /// turn on an `Ask` interaction and the human's answer becomes the tool
    /// result.
    async fn run_ask_user(&mut self, tc: &ToolCall) -> Result<String, CompletionError> {
        let question = tc
            .parsed_arguments()
            .get("question")
            .and_then(|q| q.as_str())
            .unwrap_or("(no question provided)")
            .to_string();

        let answer = self
            .ctx
            .raise_interaction(
                InteractionKind::Ask,
                serde_json::json!({
                    "question": question,
                    "tool_call_id": tc.id,
                }),
            )
            .await?;

        Ok(match answer {
            InteractionAnswer::Text { text } => text,
            InteractionAnswer::Approved => "approved".to_string(),
            InteractionAnswer::Denied { reason } => match reason {
                Some(reason) => format!("declined: {}", reason),
                None => "declined".to_string(),
            },
        })
    }

    /// Session persistence is a collaborator concern; a read-only disk must
    /// not kill the turn.
    fn persist(&mut self) {
        if let Err(e) = self.record.save() {
            logging::warn(&format!("Failed to persist session {}: {}", self.record.id, e));
        }
    }
}

//! Session Multiplexer: runs N agent sessions concurrently over a single
//! modal surface.
//!
//! All cross-session state (the session registry, the modal queue, the
//! per-session event buffers, the displayed-session id) lives behind one
//! mutex, so every mutation is serialized no matter which session task
//! performs it. There is deliberately no "active session" pointer read by
//! background tasks: events carry their session id, answers are routed by
//! `(session_id, request_id)`, and the displayed id is only consulted inside
//! the same lock that guards the buffers it gates.

use crate::agent::Agent;
use crate::bus::{Bus, BusEvent};
use crate::error::CompletionError;
use crate::id::new_id;
use crate::interact::{
    AnswerError, Interaction, InteractionAnswer, InteractionKind, ModalQueue,
};
use crate::logging;
use crate::message::Message;
use crate::provider::Provider;
use crate::session::SessionRecord;
use crate::tool::Registry;
use crate::usage::ContextUsage;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;

/// Result of one completed turn
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub session_id: String,
    /// Final assistant answer text
    pub text: String,
    /// Full history after the turn (integrity-checked)
    pub messages: Vec<Message>,
    pub usage: Option<ContextUsage>,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    /// The session's own turn loop is paused on a pending interaction.
    /// Not the same thing as owning the visible modal.
    AwaitingInteraction,
    Completed,
    Aborted,
    Crashed,
}

/// Host-facing view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionHandle {
    pub id: String,
    pub is_executing: bool,
    pub pending_interaction: Option<String>,
    pub state: SessionState,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session {0} is already executing a turn")]
    Busy(String),
    #[error(transparent)]
    Interaction(#[from] AnswerError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("session {0} crashed mid-turn")]
    TurnPanicked(String),
}

struct SessionEntry {
    agent: Arc<tokio::sync::Mutex<Agent>>,
    provider: Arc<dyn Provider>,
    state: SessionState,
    is_executing: bool,
    pending_request: Option<String>,
}

pub(crate) struct MuxState {
    sessions: HashMap<String, SessionEntry>,
    modal: ModalQueue,
    buffers: HashMap<String, Vec<BusEvent>>,
    displayed: Option<String>,
}

pub(crate) struct Shared {
    state: Mutex<MuxState>,
    bus: Bus,
}

/// Owns the concurrent sessions and the single serialized modal surface
pub struct SessionMultiplexer {
    shared: Arc<Shared>,
    registry: Registry,
    base_provider: Arc<dyn Provider>,
}

impl SessionMultiplexer {
    pub fn new(provider: Arc<dyn Provider>, registry: Registry) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MuxState {
                    sessions: HashMap::new(),
                    modal: ModalQueue::new(),
                    buffers: HashMap::new(),
                    displayed: None,
                }),
                bus: Bus::new(),
            }),
            registry,
            base_provider: provider,
        }
    }

    /// Subscribe to outbound events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.shared.bus.subscribe()
    }

    /// Create a fresh session and return its id
    pub fn open_session(&self, title: Option<String>) -> String {
        self.install(SessionRecord::create(title))
    }

    /// Install a session from a persisted record. The history is repaired
    /// before use; persisted files can be truncated or edited externally.
    pub fn open_session_with_record(&self, mut record: SessionRecord) -> String {
        let (repaired, removed) = crate::history::check_integrity(&record.messages);
        if !removed.is_empty() {
            logging::warn(&format!(
                "Session {}: dropped {} orphaned tool message(s) on load",
                record.id,
                removed.len()
            ));
            record.messages = repaired;
        }
        self.install(record)
    }

    fn install(&self, record: SessionRecord) -> String {
        let session_id = record.id.clone();
        // each session gets its own completion client: own interrupt flag,
        // own retry state
        let provider = self.base_provider.fork();
        let ctx = SessionContext {
            session_id: session_id.clone(),
            shared: Arc::clone(&self.shared),
        };
        let agent = Agent::new(provider.clone(), self.registry.clone(), record, ctx);

        let mut state = self.shared.state.lock().unwrap();
        state.sessions.insert(
            session_id.clone(),
            SessionEntry {
                agent: Arc::new(tokio::sync::Mutex::new(agent)),
                provider,
                state: SessionState::Created,
                is_executing: false,
                pending_request: None,
            },
        );
        session_id
    }

    /// Run one turn for a session. Turns within a session are strictly
    /// sequential: a second call while one is executing returns `Busy`.
    /// Turns across sessions run concurrently.
    pub async fn run_turn(
        &self,
        session_id: &str,
        user_message: &str,
    ) -> Result<TurnResult, EngineError> {
        let agent = {
            let mut state = self.shared.state.lock().unwrap();
            let entry = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
            if entry.is_executing {
                return Err(EngineError::Busy(session_id.to_string()));
            }
            entry.is_executing = true;
            entry.state = SessionState::Running;
            Arc::clone(&entry.agent)
        };

        let sid = session_id.to_string();
        let message = user_message.to_string();
        let task = tokio::spawn(async move {
            logging::set_session(&sid);
            let mut agent = agent.lock().await;
            let result = AssertUnwindSafe(agent.run_turn(&message))
                .catch_unwind()
                .await;
            logging::clear_context();
            result
        });

        let outcome = task.await;

        match outcome {
            Ok(Ok(Ok(turn))) => {
                self.finish_turn(session_id, SessionState::Completed);
                self.shared.bus.publish(BusEvent::TurnCompleted {
                    session_id: session_id.to_string(),
                });
                Ok(turn)
            }
            Ok(Ok(Err(CompletionError::UserInterrupted))) => {
                // never surfaced as an error to the host view; the session
                // stays resumable for the next user message
                self.finish_turn(session_id, SessionState::Completed);
                Err(EngineError::Completion(CompletionError::UserInterrupted))
            }
            Ok(Ok(Err(e))) => {
                self.finish_turn(session_id, SessionState::Completed);
                self.shared.bus.publish(BusEvent::TurnFailed {
                    session_id: session_id.to_string(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(EngineError::Completion(e))
            }
            Ok(Err(_)) | Err(_) => {
                // the task died under us; it must not leave a dangling modal
                logging::error(&format!("Session {} crashed mid-turn", session_id));
                self.cleanup_crashed(session_id);
                self.shared.bus.publish(BusEvent::TurnFailed {
                    session_id: session_id.to_string(),
                    kind: crate::error::ErrorKind::Unknown,
                    message: "session crashed mid-turn".to_string(),
                });
                Err(EngineError::TurnPanicked(session_id.to_string()))
            }
        }
    }

    /// Clear executing flags after a turn; abort keeps its own state
    fn finish_turn(&self, session_id: &str, end_state: SessionState) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(entry) = state.sessions.get_mut(session_id) {
            entry.is_executing = false;
            entry.pending_request = None;
            if entry.state != SessionState::Aborted {
                entry.state = end_state;
            }
        }
    }

    fn cleanup_crashed(&self, session_id: &str) {
        let next = {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(entry) = state.sessions.get_mut(session_id) {
                entry.is_executing = false;
                entry.pending_request = None;
                entry.state = SessionState::Crashed;
            }
            let outcome = state.modal.purge_session(session_id);
            if outcome.removed > 0 {
                logging::warn(&format!(
                    "Purged {} pending interaction(s) from crashed session {}",
                    outcome.removed, session_id
                ));
            }
            outcome.next_visible
        };
        if let Some(next) = next {
            self.publish_visible(next);
        }
    }

    /// Route the human's answer back to the raising session. The pair of ids
    /// must match an entry anywhere in the queue; the answer is never
    /// assumed to belong to whichever session is displayed.
    pub fn respond(
        &self,
        session_id: &str,
        request_id: &str,
        answer: InteractionAnswer,
    ) -> Result<(), EngineError> {
        let next = {
            let mut state = self.shared.state.lock().unwrap();
            state.modal.answer(session_id, request_id, answer)?
        };
        if let Some(next) = next {
            self.publish_visible(next);
        }
        Ok(())
    }

    /// Abort a session: interrupt its in-flight completion, purge its queued
    /// interactions, and if it owned the visible modal, show the next one.
    pub fn abort_session(&self, session_id: &str) -> Result<(), EngineError> {
        let (provider, next) = {
            let mut state = self.shared.state.lock().unwrap();
            let entry = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
            entry.state = SessionState::Aborted;
            entry.pending_request = None;
            let provider = Arc::clone(&entry.provider);
            let outcome = state.modal.purge_session(session_id);
            (provider, outcome.next_visible)
        };

        // cancels the transport op and any retry/cooldown wait
        provider.abort();
        if let Some(next) = next {
            self.publish_visible(next);
        }
        logging::info(&format!("Session {} aborted", session_id));
        Ok(())
    }

    /// Remove a session entirely (after completion or abort)
    pub fn close_session(&self, session_id: &str) {
        let next = {
            let mut state = self.shared.state.lock().unwrap();
            state.sessions.remove(session_id);
            state.buffers.remove(session_id);
            if state.displayed.as_deref() == Some(session_id) {
                state.displayed = None;
            }
            state.modal.purge_session(session_id).next_visible
        };
        if let Some(next) = next {
            self.publish_visible(next);
        }
    }

    /// Switch the displayed session. Returns the buffered view events of the
    /// newly displayed session, in arrival order, for the host to replay.
    pub fn set_displayed_session(&self, session_id: Option<&str>) -> Vec<BusEvent> {
        let mut state = self.shared.state.lock().unwrap();
        state.displayed = session_id.map(String::from);
        match session_id {
            Some(sid) => state.buffers.remove(sid).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// The currently visible interaction, if any
    pub fn visible_interaction(&self) -> Option<Interaction> {
        self.shared.state.lock().unwrap().modal.visible().cloned()
    }

    /// Snapshot of all sessions
    pub fn handles(&self) -> Vec<SessionHandle> {
        let state = self.shared.state.lock().unwrap();
        let mut handles: Vec<SessionHandle> = state
            .sessions
            .iter()
            .map(|(id, entry)| SessionHandle {
                id: id.clone(),
                is_executing: entry.is_executing,
                pending_interaction: entry.pending_request.clone(),
                state: entry.state,
            })
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let state = self.shared.state.lock().unwrap();
        state.sessions.get(session_id).map(|e| e.state)
    }

    fn publish_visible(&self, interaction: Interaction) {
        self.shared.bus.publish(BusEvent::InteractionRequested {
            session_id: interaction.session_id,
            request_id: interaction.request_id,
            kind: interaction.kind,
            payload: interaction.payload,
        });
    }
}

/// Per-session handle the turn loop uses to emit events and pause for
/// human input. Clones share the multiplexer state.
#[derive(Clone)]
pub struct SessionContext {
    pub session_id: String,
    shared: Arc<Shared>,
}

impl SessionContext {
    /// Emit an event. View events for a background session are buffered for
    /// replay instead of being broadcast at the wrong time.
    pub fn emit(&self, event: BusEvent) {
        let buffered = {
            let mut state = self.shared.state.lock().unwrap();
            let displayed = state.displayed.as_deref() == Some(self.session_id.as_str());
            if event.is_view_event() && !displayed {
                state
                    .buffers
                    .entry(self.session_id.clone())
                    .or_default()
                    .push(event.clone());
                true
            } else {
                false
            }
        };
        if !buffered {
            self.shared.bus.publish(event);
        }
    }

    /// Pause the turn for a human decision. Enqueues the interaction at the
    /// tail of the global modal queue and suspends until the answer routed
    /// to this `(session_id, request_id)` arrives. An abort while waiting
    /// resolves to `UserInterrupted`.
    pub async fn raise_interaction(
        &self,
        kind: InteractionKind,
        payload: serde_json::Value,
    ) -> Result<InteractionAnswer, CompletionError> {
        let request_id = new_id("request");
        let interaction = Interaction {
            kind,
            session_id: self.session_id.clone(),
            request_id: request_id.clone(),
            payload,
        };

        let (became_visible, answer_rx) = {
            let mut state = self.shared.state.lock().unwrap();
            // an aborted or closed session must never enqueue a fresh modal
            let alive = state
                .sessions
                .get(&self.session_id)
                .map(|e| e.state != SessionState::Aborted)
                .unwrap_or(false);
            if !alive {
                return Err(CompletionError::UserInterrupted);
            }
            let (became_visible, answer_rx) = state.modal.push(interaction.clone());
            if let Some(entry) = state.sessions.get_mut(&self.session_id) {
                entry.pending_request = Some(request_id.clone());
                entry.state = SessionState::AwaitingInteraction;
            }
            (became_visible, answer_rx)
        };

        if became_visible {
            self.shared.bus.publish(BusEvent::InteractionRequested {
                session_id: interaction.session_id,
                request_id: interaction.request_id,
                kind: interaction.kind,
                payload: interaction.payload,
            });
        }

        // a purged queue entry drops the sender, waking us here
        let answer = answer_rx
            .await
            .map_err(|_| CompletionError::UserInterrupted);

        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(entry) = state.sessions.get_mut(&self.session_id) {
                entry.pending_request = None;
                if entry.state == SessionState::AwaitingInteraction {
                    entry.state = SessionState::Running;
                }
            }
        }

        answer
    }
}

//! End-to-end tests for the orchestration engine using a scripted provider.
//!
//! These drive the full flow (multiplexer, turn loop, normalization,
//! integrity repair, interactions) without network access.

mod mock_provider;

use async_trait::async_trait;
use deskpilot::bus::BusEvent;
use deskpilot::error::{CompletionError, ErrorKind};
use deskpilot::interact::InteractionAnswer;
use deskpilot::message::{Message, Role, ToolCall, Usage};
use deskpilot::multiplexer::{EngineError, SessionMultiplexer, SessionState};
use deskpilot::session::SessionRecord;
use deskpilot::tool::{Registry, Tool, ToolContext, ToolOutput};
use mock_provider::MockProvider;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::broadcast;

static TEST_HOME: Once = Once::new();

fn engine_with_tools(tools: Vec<Arc<dyn Tool>>) -> (MockProvider, Arc<SessionMultiplexer>) {
    TEST_HOME.call_once(|| {
        let dir = std::env::temp_dir().join(format!("deskpilot-e2e-{}", std::process::id()));
        std::env::set_var("DESKPILOT_HOME", dir);
    });

    let provider = MockProvider::new();
    let mux = SessionMultiplexer::new(
        Arc::new(provider.clone()),
        Registry::with_tools(tools),
    );
    (provider, Arc::new(mux))
}

fn engine() -> (MockProvider, Arc<SessionMultiplexer>) {
    engine_with_tools(Vec::new())
}

async fn wait_for(
    rx: &mut broadcast::Receiver<BusEvent>,
    pred: impl Fn(&BusEvent) -> bool,
) -> BusEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until(mut pred: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

/// Host-side tool standing in for an Office binding
struct EchoTool {
    executed: Arc<AtomicBool>,
    approval: bool,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "insert_text"
    }

    fn description(&self) -> &str {
        "Insert text into the open document."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    fn requires_approval(&self) -> bool {
        self.approval
    }

    async fn execute(&self, input: Value, _ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        self.executed.store(true, Ordering::SeqCst);
        let text = input.get("text").and_then(|t| t.as_str()).unwrap_or("");
        Ok(ToolOutput::new(format!("inserted: {}", text)))
    }
}

#[tokio::test]
async fn test_simple_turn() {
    let (provider, mux) = engine();
    provider.queue_text("Hello! How can I help?");

    let session_id = mux.open_session(None);
    let result = mux.run_turn(&session_id, "Say hello").await.unwrap();

    assert_eq!(result.text, "Hello! How can I help?");
    assert_eq!(result.messages.len(), 2);
    assert_eq!(result.messages[0].role, Role::User);
    assert_eq!(result.messages[1].role, Role::Assistant);
    assert_eq!(mux.session_state(&session_id), Some(SessionState::Completed));
}

#[tokio::test]
async fn test_tool_round_trip() {
    let executed = Arc::new(AtomicBool::new(false));
    let (provider, mux) = engine_with_tools(vec![Arc::new(EchoTool {
        executed: Arc::clone(&executed),
        approval: false,
    })]);

    provider.queue_tool_call("call_1", "insert_text", r#"{"text":"Q3 summary"}"#);
    provider.queue_text("Inserted the summary.");

    let mut events = mux.subscribe();
    let session_id = mux.open_session(None);
    mux.set_displayed_session(Some(&session_id));

    let result = mux.run_turn(&session_id, "add the summary").await.unwrap();

    assert!(executed.load(Ordering::SeqCst));
    assert_eq!(result.text, "Inserted the summary.");

    // user, assistant(tool call), tool result, assistant(final)
    assert_eq!(result.messages.len(), 4);
    assert_eq!(result.messages[2].role, Role::Tool);
    assert_eq!(result.messages[2].content, "inserted: Q3 summary");
    assert_eq!(result.messages[2].tool_call_id.as_deref(), Some("call_1"));

    wait_for(&mut events, |e| {
        matches!(e, BusEvent::ToolCallStarted { tool_name, .. } if tool_name == "insert_text")
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, BusEvent::ToolCallFinished { error: None, .. })
    })
    .await;
}

#[tokio::test]
async fn test_ask_user_answer_routing() {
    let (provider, mux) = engine();
    provider.queue_tool_call("call_q", "ask_user", r#"{"question":"Which sheet?"}"#);

    let mut events = mux.subscribe();
    let session_id = mux.open_session(None);

    let mux2 = Arc::clone(&mux);
    let sid = session_id.clone();
    let turn = tokio::spawn(async move { mux2.run_turn(&sid, "fill in the numbers").await });

    let event = wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { .. })
    })
    .await;
    let BusEvent::InteractionRequested {
        session_id: ev_sid,
        request_id,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(ev_sid, session_id);

    provider.queue_text("Filled in Budget.xlsx.");
    mux.respond(
        &session_id,
        &request_id,
        InteractionAnswer::Text {
            text: "Budget.xlsx".to_string(),
        },
    )
    .unwrap();

    let result = turn.await.unwrap().unwrap();
    assert_eq!(result.text, "Filled in Budget.xlsx.");
    // the human's answer became the tool result
    assert_eq!(result.messages[2].role, Role::Tool);
    assert_eq!(result.messages[2].content, "Budget.xlsx");
}

#[tokio::test]
async fn test_answer_rejected_for_wrong_session() {
    let (provider, mux) = engine();
    provider.queue_tool_call("call_q", "ask_user", r#"{"question":"Continue?"}"#);

    let mut events = mux.subscribe();
    let session_id = mux.open_session(None);
    let other_session = mux.open_session(None);

    let mux2 = Arc::clone(&mux);
    let sid = session_id.clone();
    let turn = tokio::spawn(async move { mux2.run_turn(&sid, "do the thing").await });

    let event = wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { .. })
    })
    .await;
    let BusEvent::InteractionRequested { request_id, .. } = event else {
        unreachable!()
    };

    // same request id, wrong session: must not be delivered anywhere
    let err = mux
        .respond(&other_session, &request_id, InteractionAnswer::Approved)
        .unwrap_err();
    assert!(matches!(err, EngineError::Interaction(_)));

    provider.queue_text("done");
    mux.respond(
        &session_id,
        &request_id,
        InteractionAnswer::Text {
            text: "yes".to_string(),
        },
    )
    .unwrap();
    turn.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_modal_single_visibility_across_sessions() {
    let (provider, mux) = engine();
    let mut events = mux.subscribe();

    let session_a = mux.open_session(None);
    let session_b = mux.open_session(None);

    // session A asks first and owns the modal
    provider.queue_tool_call("call_a", "ask_user", r#"{"question":"A?"}"#);
    let mux_a = Arc::clone(&mux);
    let sid_a = session_a.clone();
    let turn_a = tokio::spawn(async move { mux_a.run_turn(&sid_a, "task a").await });

    let event = wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { .. })
    })
    .await;
    let BusEvent::InteractionRequested {
        session_id: first_sid,
        request_id: request_a,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(first_sid, session_a);

    // session B asks while A's modal is visible: it queues, nothing shows
    provider.queue_tool_call("call_b", "ask_user", r#"{"question":"B?"}"#);
    let mux_b = Arc::clone(&mux);
    let sid_b = session_b.clone();
    let turn_b = tokio::spawn(async move { mux_b.run_turn(&sid_b, "task b").await });

    let mux_check = Arc::clone(&mux);
    let sid_b_check = session_b.clone();
    wait_until(move || {
        mux_check.session_state(&sid_b_check) == Some(SessionState::AwaitingInteraction)
    })
    .await;
    assert_eq!(
        mux.visible_interaction().unwrap().session_id,
        session_a,
        "B's interaction must wait behind A's"
    );

    // answering A reveals B's interaction, FIFO order
    provider.queue_text("a done");
    mux.respond(
        &session_a,
        &request_a,
        InteractionAnswer::Text {
            text: "answer a".to_string(),
        },
    )
    .unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { session_id, .. } if *session_id == session_b)
    })
    .await;
    let BusEvent::InteractionRequested {
        request_id: request_b,
        ..
    } = event
    else {
        unreachable!()
    };

    provider.queue_text("b done");
    mux.respond(
        &session_b,
        &request_b,
        InteractionAnswer::Text {
            text: "answer b".to_string(),
        },
    )
    .unwrap();

    let result_a = turn_a.await.unwrap().unwrap();
    let result_b = turn_b.await.unwrap().unwrap();
    assert_eq!(result_a.messages[2].content, "answer a");
    assert_eq!(result_b.messages[2].content, "answer b");
}

#[tokio::test]
async fn test_abort_purges_interactions_and_advances_modal() {
    let (provider, mux) = engine();
    let mut events = mux.subscribe();

    let session_a = mux.open_session(None);
    let session_b = mux.open_session(None);

    provider.queue_tool_call("call_a", "ask_user", r#"{"question":"A?"}"#);
    let mux_a = Arc::clone(&mux);
    let sid_a = session_a.clone();
    let turn_a = tokio::spawn(async move { mux_a.run_turn(&sid_a, "task a").await });

    wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { session_id, .. } if *session_id == session_a)
    })
    .await;

    provider.queue_tool_call("call_b", "ask_user", r#"{"question":"B?"}"#);
    let mux_b = Arc::clone(&mux);
    let sid_b = session_b.clone();
    let turn_b = tokio::spawn(async move { mux_b.run_turn(&sid_b, "task b").await });

    let mux_check = Arc::clone(&mux);
    let sid_b_check = session_b.clone();
    wait_until(move || {
        mux_check.session_state(&sid_b_check) == Some(SessionState::AwaitingInteraction)
    })
    .await;

    // aborting A while it owns the visible modal: its entries are purged
    // and B's queued interaction becomes the visible one
    mux.abort_session(&session_a).unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { session_id, .. } if *session_id == session_b)
    })
    .await;
    let BusEvent::InteractionRequested {
        request_id: request_b,
        ..
    } = event
    else {
        unreachable!()
    };

    let err = turn_a.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        EngineError::Completion(CompletionError::UserInterrupted)
    ));
    assert_eq!(mux.session_state(&session_a), Some(SessionState::Aborted));
    assert!(provider.was_aborted(), "in-flight client must be cancelled");

    provider.queue_text("b done");
    mux.respond(&session_b, &request_b, InteractionAnswer::Approved)
        .unwrap();
    turn_b.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_approval_denial_feeds_back_without_executing() {
    let executed = Arc::new(AtomicBool::new(false));
    let (provider, mux) = engine_with_tools(vec![Arc::new(EchoTool {
        executed: Arc::clone(&executed),
        approval: true,
    })]);

    provider.queue_tool_call("call_1", "insert_text", r#"{"text":"destructive edit"}"#);

    let mut events = mux.subscribe();
    let session_id = mux.open_session(None);

    let mux2 = Arc::clone(&mux);
    let sid = session_id.clone();
    let turn = tokio::spawn(async move { mux2.run_turn(&sid, "edit everything").await });

    let event = wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { .. })
    })
    .await;
    let BusEvent::InteractionRequested { request_id, kind, .. } = event else {
        unreachable!()
    };
    assert_eq!(kind, deskpilot::interact::InteractionKind::Approval);

    provider.queue_text("Understood, leaving it alone.");
    mux.respond(
        &session_id,
        &request_id,
        InteractionAnswer::Denied {
            reason: Some("not on this document".to_string()),
        },
    )
    .unwrap();

    let result = turn.await.unwrap().unwrap();
    assert!(!executed.load(Ordering::SeqCst), "denied tool must not run");
    assert!(result.messages[2].content.contains("denied by user"));
    assert!(result.messages[2].content.contains("not on this document"));
}

#[tokio::test]
async fn test_failure_surfaces_kind_and_interrupt_stays_quiet() {
    let (provider, mux) = engine();
    let mut events = mux.subscribe();
    let session_id = mux.open_session(None);

    provider.queue_error(CompletionError::RetryExhausted {
        last: ErrorKind::ServerError,
        detail: "HTTP 503".to_string(),
    });
    let err = mux.run_turn(&session_id, "hello").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Completion(CompletionError::RetryExhausted { .. })
    ));
    let event = wait_for(&mut events, |e| matches!(e, BusEvent::TurnFailed { .. })).await;
    let BusEvent::TurnFailed { kind, .. } = event else {
        unreachable!()
    };
    assert_eq!(kind, ErrorKind::RetryExhausted);

    // a user interrupt ends the turn but is never reported as a failure
    provider.queue_error(CompletionError::UserInterrupted);
    let err = mux.run_turn(&session_id, "again").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Completion(CompletionError::UserInterrupted)
    ));
    provider.queue_text("still here");
    let result = mux.run_turn(&session_id, "resume").await.unwrap();
    assert_eq!(result.text, "still here");
}

#[tokio::test]
async fn test_context_overflow_suggests_compaction() {
    let (provider, mux) = engine();
    let mut events = mux.subscribe();
    let session_id = mux.open_session(None);

    provider.queue_error(CompletionError::ContextLengthExceeded);
    let err = mux.run_turn(&session_id, "long conversation").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Completion(CompletionError::ContextLengthExceeded)
    ));

    wait_for(&mut events, |e| {
        matches!(e, BusEvent::AutoCompactSuggested { .. })
    })
    .await;
}

#[tokio::test]
async fn test_auto_compact_replaces_old_history() {
    let (provider, mux) = engine();
    let mut events = mux.subscribe();

    let mut record = SessionRecord::create(None);
    for i in 0..20 {
        record.push_message(Message::user(&format!("request {}", i)));
        record.push_message(Message::assistant_text(&format!("response {}", i)));
    }
    let session_id = mux.open_session_with_record(record);

    // usage report over the 80% default threshold of the 128k window
    provider.queue_text_with_usage(
        "final answer",
        Some(Usage {
            prompt_tokens: 120_000,
            completion_tokens: 200,
            total_tokens: 120_200,
        }),
    );
    // the compaction summarization call pops this
    provider.queue_text("summary of the work so far");

    let result = mux.run_turn(&session_id, "next step").await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, BusEvent::AutoCompactSuggested { .. })
    })
    .await;

    assert!(
        result.messages.len() < 20,
        "old history must be summarized away"
    );
    assert!(result.messages[0]
        .content
        .contains("Previous Conversation Summary"));
    assert!(result.messages[0].content.contains("summary of the work so far"));
}

#[tokio::test]
async fn test_background_events_buffered_and_replayed() {
    let executed = Arc::new(AtomicBool::new(false));
    let (provider, mux) = engine_with_tools(vec![Arc::new(EchoTool {
        executed,
        approval: false,
    })]);

    let session_a = mux.open_session(None);
    let session_b = mux.open_session(None);
    mux.set_displayed_session(Some(&session_a));

    let mut events = mux.subscribe();

    provider.queue_tool_call("call_1", "insert_text", r#"{"text":"background work"}"#);
    provider.queue_text("done in background");

    mux.run_turn(&session_b, "work while hidden").await.unwrap();

    // the background session's tool events must not leak onto the bus...
    let leaked = loop {
        match events.try_recv() {
            Ok(BusEvent::ToolCallStarted { .. }) | Ok(BusEvent::ToolCallFinished { .. }) => {
                break true
            }
            Ok(_) => continue,
            Err(_) => break false,
        }
    };
    assert!(!leaked, "background view events leaked to the bus");

    // ...they are replayed, in order, when the user switches back
    let replayed = mux.set_displayed_session(Some(&session_b));
    let kinds: Vec<&str> = replayed
        .iter()
        .map(|e| match e {
            BusEvent::AssistantDelta { .. } => "delta",
            BusEvent::ToolCallStarted { .. } => "tool_start",
            BusEvent::ToolCallFinished { .. } => "tool_finish",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["tool_start", "tool_finish", "delta"]);
    assert!(replayed.iter().all(|e| e.session_id() == session_b));

    // a second switch replays nothing
    assert!(mux.set_displayed_session(Some(&session_b)).is_empty());
}

#[tokio::test]
async fn test_reasoning_stripped_from_older_assistants_before_send() {
    let (provider, mux) = engine();

    let mut record = SessionRecord::create(None);
    record.push_message(Message::user("first question"));
    let mut old_assistant = Message::assistant_text("old answer");
    old_assistant.reasoning = Some("old reasoning".to_string());
    record.push_message(old_assistant);
    record.push_message(Message::user("second question"));
    let mut late_assistant = Message::assistant_text("late answer");
    late_assistant.reasoning = Some("late reasoning".to_string());
    record.push_message(late_assistant);

    let session_id = mux.open_session_with_record(record);
    provider.queue_text("third answer");
    mux.run_turn(&session_id, "third question").await.unwrap();

    let requests = provider.requests();
    let sent = &requests[0];
    let reasoning_positions: Vec<usize> = sent
        .iter()
        .enumerate()
        .filter(|(_, m)| m.reasoning.is_some())
        .map(|(i, _)| i)
        .collect();
    // only the latest assistant message may still carry reasoning
    assert_eq!(reasoning_positions, vec![3]);
}

#[tokio::test]
async fn test_orphaned_tool_message_dropped_on_load() {
    let (provider, mux) = engine();

    let mut record = SessionRecord::create(None);
    record.push_message(Message::user("make a table"));
    record.push_message(Message::assistant_with_tools(
        "",
        vec![ToolCall {
            id: "x".to_string(),
            name: "insert_table".to_string(),
            arguments: "{}".to_string(),
        }],
    ));
    record.push_message(Message::tool_result("y", "orphaned result"));

    let session_id = mux.open_session_with_record(record);
    provider.queue_text("ok");
    let result = mux.run_turn(&session_id, "continue").await.unwrap();

    let requests = provider.requests();
    assert!(
        requests[0].iter().all(|m| m.tool_call_id.as_deref() != Some("y")),
        "orphaned tool message must not be transmitted"
    );
    assert!(result
        .messages
        .iter()
        .all(|m| m.tool_call_id.as_deref() != Some("y")));
}

#[tokio::test]
async fn test_turns_within_session_are_sequential() {
    let (provider, mux) = engine();
    provider.queue_tool_call("call_q", "ask_user", r#"{"question":"hold"}"#);

    let mut events = mux.subscribe();
    let session_id = mux.open_session(None);

    let mux2 = Arc::clone(&mux);
    let sid = session_id.clone();
    let turn = tokio::spawn(async move { mux2.run_turn(&sid, "first").await });

    let event = wait_for(&mut events, |e| {
        matches!(e, BusEvent::InteractionRequested { .. })
    })
    .await;
    let BusEvent::InteractionRequested { request_id, .. } = event else {
        unreachable!()
    };

    // a second turn while the first is paused on the modal is refused
    let err = mux.run_turn(&session_id, "second").await.unwrap_err();
    assert!(matches!(err, EngineError::Busy(_)));

    provider.queue_text("released");
    mux.respond(
        &session_id,
        &request_id,
        InteractionAnswer::Text {
            text: "go on".to_string(),
        },
    )
    .unwrap();
    turn.await.unwrap().unwrap();
}

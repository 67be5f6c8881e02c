//! End-to-end session behavior with the scripted transport

use async_trait::async_trait;
use conversation_engine::checkpoint::CheckpointStore;
use conversation_engine::compression::{CompressionOptions, CompressionService};
use conversation_engine::context::ScriptAwareEstimator;
use conversation_engine::stream::MessageDelta;
use conversation_engine::transport::{ScriptStep, ScriptedTransport};
use conversation_engine::{
    EngineError, Message, Result, RunConfig, SessionController, SessionOptions, StreamEvent,
    TurnOutcome,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn session_with(transport: Arc<ScriptedTransport>) -> Arc<SessionController> {
    Arc::new(SessionController::new(
        transport,
        Arc::new(ScriptAwareEstimator::default()),
        SessionOptions {
            stall_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    ))
}

fn ids(session: &SessionController) -> Vec<String> {
    session.messages().iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn test_cancel_then_resubmit_does_not_interleave() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_run(vec![
                ScriptStep::Emit(StreamEvent::delta("m1", "partial")),
                ScriptStep::delay_ms(300),
                ScriptStep::Emit(StreamEvent::delta("m1", " late")),
                ScriptStep::Emit(StreamEvent::delta("m9", "late message")),
                ScriptStep::Emit(StreamEvent::End),
            ])
            .with_run(vec![
                ScriptStep::Emit(StreamEvent::delta("m2", "fresh")),
                ScriptStep::Emit(StreamEvent::End),
            ]),
    );
    let session = session_with(transport.clone());
    let mut updates = session.subscribe();

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.submit("first", RunConfig::default()).await })
    };
    assert_ok!(
        updates
            .wait_for(|snapshot| snapshot.messages.iter().any(|m| m.id == "m1"))
            .await
    );

    let second = session.submit("second", RunConfig::default()).await.unwrap();
    assert_eq!(second, TurnOutcome::Completed);
    assert_eq!(first.await.unwrap().unwrap(), TurnOutcome::Cancelled);

    let messages = session.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].content, "first");
    assert_eq!(messages[1].id, "m1");
    assert_eq!(messages[1].content, "partial");
    assert_eq!(messages[2].content, "second");
    assert_eq!(messages[3].id, "m2");
    assert!(!ids(&session).contains(&"m9".to_string()));
    assert_eq!(transport.closed_streams(), 2);
}

#[tokio::test]
async fn test_cancel_keeps_partial_content() {
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::Emit(StreamEvent::delta("m1", "half an ans")),
        ScriptStep::Hang,
    ]));
    let session = session_with(transport);
    let mut updates = session.subscribe();

    let turn = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.submit("question", RunConfig::default()).await })
    };
    assert_ok!(updates.wait_for(|s| s.messages.len() == 2).await);
    assert!(session.is_loading());

    session.cancel();
    session.cancel();

    assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Cancelled);
    let snapshot = session.snapshot();
    assert!(!snapshot.is_loading);
    assert!(snapshot.last_error.is_none());
    assert_eq!(snapshot.messages[1].content, "half an ans");
}

#[tokio::test]
async fn test_events_for_other_threads_are_discarded() {
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::EmitFor {
            thread_id: "some-older-thread".to_string(),
            event: StreamEvent::delta("stale", "from an old stream"),
        },
        ScriptStep::Emit(StreamEvent::delta("m1", "current")),
        ScriptStep::Emit(StreamEvent::End),
    ]));
    let session = session_with(transport);

    session.submit("hi", RunConfig::default()).await.unwrap();
    assert_eq!(ids(&session).len(), 2);
    assert!(!ids(&session).contains(&"stale".to_string()));
}

#[tokio::test]
async fn test_node_update_finalizes_streaming_message() {
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::Emit(StreamEvent::delta("m1", "thinking")),
        ScriptStep::Emit(StreamEvent::node_update(
            "assistant_node",
            vec![Message::assistant("m2", "Hi")],
        )),
        ScriptStep::Emit(StreamEvent::delta("m1", " more")),
        ScriptStep::Emit(StreamEvent::End),
    ]));
    let session = session_with(transport);

    session.submit("hello", RunConfig::default()).await.unwrap();
    let messages = session.messages();
    assert_eq!(messages[1].id, "m1");
    assert_eq!(messages[1].content, "thinking");
    assert_eq!(messages[2].id, "m2");
    assert_eq!(messages.len(), 3);
}

#[tokio::test]
async fn test_snapshot_event_replaces_transcript() {
    let authoritative = vec![
        Message::with_id("h1", conversation_engine::Role::Human, "hello"),
        Message::assistant("a1", "server copy"),
    ];
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::Emit(StreamEvent::delta("m1", "local draft")),
        ScriptStep::Emit(StreamEvent::snapshot(authoritative.clone())),
        ScriptStep::Emit(StreamEvent::End),
    ]));
    let session = session_with(transport);

    session.submit("hello", RunConfig::default()).await.unwrap();
    let messages: Vec<Message> = session.messages().iter().map(|m| (**m).clone()).collect();
    assert_eq!(messages, authoritative);
}

#[tokio::test]
async fn test_sequenced_redelivery_is_applied_once() {
    let delta = |content: &str, seq| StreamEvent::Delta(MessageDelta::text("m1", content).with_seq(seq));
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::Emit(delta("one ", 1)),
        ScriptStep::Emit(delta("two ", 2)),
        ScriptStep::Emit(delta("two ", 2)),
        ScriptStep::Emit(delta("three", 3)),
        ScriptStep::Emit(StreamEvent::End),
    ]));
    let session = session_with(transport);

    session.submit("count", RunConfig::default()).await.unwrap();
    assert_eq!(session.messages()[1].content, "one two three");
}

#[tokio::test]
async fn test_interrupt_resume_flow_publishes_state() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_run(vec![
                ScriptStep::Emit(StreamEvent::interrupt(json!({"question": "approve?"}))),
                ScriptStep::Emit(StreamEvent::End),
            ])
            .with_run(vec![ScriptStep::Emit(StreamEvent::End)]),
    );
    let session = session_with(transport.clone());
    let updates = session.subscribe();

    let outcome = session.submit("ship it", RunConfig::default()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Interrupted);
    assert_eq!(updates.borrow().interrupt, Some(json!({"question": "approve?"})));
    assert_eq!(session.messages().len(), 1);

    session.resume(json!(true)).await.unwrap();
    assert!(updates.borrow().interrupt.is_none());

    let resumed = &transport.requests()[1];
    assert_eq!(resumed.request.resume, Some(json!(true)));
    assert_eq!(resumed.thread_id, transport.requests()[0].thread_id);
    assert_err!(session.resume(json!(false)).await);
}

#[tokio::test]
async fn test_interrupt_cleared_even_when_resume_fails() {
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::Emit(StreamEvent::interrupt(json!({"question": "approve?"}))),
        ScriptStep::Emit(StreamEvent::End),
    ]));
    transport.push_rejection(EngineError::Transport("gateway timeout".to_string()));
    let session = session_with(transport);

    session.submit("deploy", RunConfig::default()).await.unwrap();
    assert!(session.resume(json!(true)).await.is_err());
    assert!(session.pending_interrupt().is_none());
}

#[tokio::test]
async fn test_authoritative_usage_wins_over_estimate() {
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::Emit(StreamEvent::delta("m1", "x".repeat(3200))),
        ScriptStep::Emit(StreamEvent::TokenUsage(conversation_engine::TokenUsage {
            used: 1000,
            total: 4000,
            remaining: 3000,
            percentage: Some(25.0),
        })),
        ScriptStep::Emit(StreamEvent::End),
    ]));
    let session = session_with(transport);
    let mut updates = session.subscribe();

    let turn = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.submit("hi", RunConfig::default()).await })
    };
    turn.await.unwrap().unwrap();

    assert_ok!(updates.changed().await);
    let budget = updates.borrow().token_usage.clone();
    assert_eq!((budget.used, budget.total, budget.remaining), (1000, 4000, 3000));
}

#[tokio::test]
async fn test_stream_ending_without_end_completes() {
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![ScriptStep::Emit(
        StreamEvent::delta("m1", "done"),
    )]));
    let session = session_with(transport);
    assert_eq!(
        session.submit("hi", RunConfig::default()).await.unwrap(),
        TurnOutcome::Completed
    );
    assert!(session.snapshot().messages.iter().all(|m| !m.content.is_empty()));
}

struct MemoryStore(Result<Value>);

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn thread_checkpoints(&self, _thread_id: &str) -> Result<Value> {
        self.0.clone()
    }
}

#[tokio::test]
async fn test_attach_seeds_from_latest_checkpoint() {
    let history = json!([
        {"values": {"messages": [{"type": "human", "id": "h1", "content": "hi"}]}},
        {"values": {"messages": [
            {"type": "human", "id": "h1", "content": "hi"},
            {"type": "AIMessageChunk", "id": "a1", "content": "hello"}
        ]}}
    ]);
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![ScriptStep::Emit(StreamEvent::End)]));
    let session = SessionController::new(
        transport.clone(),
        Arc::new(ScriptAwareEstimator::default()),
        SessionOptions::default(),
    )
    .with_checkpoints(Arc::new(MemoryStore(Ok(history))));

    assert_eq!(session.attach("thread-42").await.unwrap(), 2);
    assert_eq!(ids(&session), vec!["h1", "a1"]);
    assert_eq!(session.thread_id().as_deref(), Some("thread-42"));
    assert!(session.verify().await.unwrap().is_consistent());

    // later turns run on the attached thread
    session.submit("again", RunConfig::default()).await.unwrap();
    assert_eq!(transport.requests()[0].thread_id, "thread-42");
}

#[tokio::test]
async fn test_attach_to_empty_history_is_not_an_error() {
    let session = SessionController::new(
        Arc::new(ScriptedTransport::new()),
        Arc::new(ScriptAwareEstimator::default()),
        SessionOptions::default(),
    )
    .with_checkpoints(Arc::new(MemoryStore(Ok(json!([])))));

    assert_eq!(session.attach("fresh").await.unwrap(), 0);
    assert!(session.messages().is_empty());
}

#[tokio::test]
async fn test_failed_attach_keeps_transcript_and_thread() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_run(vec![
                ScriptStep::Emit(StreamEvent::delta("m1", "kept")),
                ScriptStep::Emit(StreamEvent::End),
            ])
            .with_run(vec![ScriptStep::Emit(StreamEvent::End)]),
    );
    let session = SessionController::new(
        transport.clone(),
        Arc::new(ScriptAwareEstimator::default()),
        SessionOptions::default(),
    )
    .with_checkpoints(Arc::new(MemoryStore(Err(EngineError::Transport(
        "connection refused".to_string(),
    )))));

    session.submit("hi", RunConfig::default()).await.unwrap();
    let before = session.messages();
    let thread = session.thread_id();
    assert!(thread.is_some());

    let err = session.attach("elsewhere").await.unwrap_err();
    assert!(matches!(err, EngineError::CheckpointLoad(_)));
    assert_eq!(session.messages(), before);
    assert_eq!(session.thread_id(), thread);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.last_error, Some(err));
    assert_eq!(snapshot.thread_id, thread);
    assert!(!snapshot.is_loading);

    // the session keeps talking to the thread its transcript belongs to
    session.submit("again", RunConfig::default()).await.unwrap();
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(Some(requests[1].thread_id.clone()), thread);
}

#[tokio::test]
async fn test_new_session_forgets_everything() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_run(vec![
                ScriptStep::Emit(StreamEvent::delta("m1", "a")),
                ScriptStep::Emit(StreamEvent::End),
            ])
            .with_run(vec![ScriptStep::Emit(StreamEvent::End)]),
    );
    let session = session_with(transport.clone());

    session.submit("hi", RunConfig::default()).await.unwrap();
    session.new_session().await;

    let snapshot = session.snapshot();
    assert!(snapshot.messages.is_empty());
    assert!(snapshot.thread_id.is_none());
    assert_eq!(snapshot.token_usage.used, 0);

    session.submit("again", RunConfig::default()).await.unwrap();
    let requests = transport.requests();
    assert_ne!(requests[0].thread_id, requests[1].thread_id);
}

/// Replaces content with its first word
struct FirstWord;

#[async_trait]
impl CompressionService for FirstWord {
    async fn compress(
        &self,
        messages: &[Message],
        _options: &CompressionOptions,
    ) -> Result<Vec<Message>> {
        Ok(messages
            .iter()
            .map(|m| {
                let first = m.content.split_whitespace().next().unwrap_or_default();
                Message::with_id(m.id.clone(), m.role, first)
            })
            .collect())
    }
}

#[tokio::test]
async fn test_compress_through_session() {
    let long = "lengthy ".repeat(20);
    let transport = Arc::new(ScriptedTransport::new().with_run(vec![
        ScriptStep::Emit(StreamEvent::node_update(
            "agent",
            vec![Message::assistant("a1", long.clone()), Message::assistant("a2", "tiny")],
        )),
        ScriptStep::Emit(StreamEvent::End),
    ]));
    let session = SessionController::new(
        transport,
        Arc::new(ScriptAwareEstimator::default()),
        SessionOptions::default(),
    )
    .with_compression(Arc::new(FirstWord), 50, CompressionOptions::default());

    session.submit("hi", RunConfig::default()).await.unwrap();
    let before = ids(&session);

    let report = session.compress().await.unwrap();
    assert_eq!(report.compressed, 1);
    assert!(report.tokens_saved() > 0);
    assert_eq!(ids(&session), before);

    let messages = session.messages();
    assert_eq!(messages[1].content, "lengthy");
    assert_eq!(messages[2].content, "tiny");
}

#[tokio::test]
async fn test_compress_unknown_id_leaves_transcript() {
    let session = SessionController::new(
        Arc::new(ScriptedTransport::new()),
        Arc::new(ScriptAwareEstimator::default()),
        SessionOptions::default(),
    )
    .with_compression(Arc::new(FirstWord), 50, CompressionOptions::default());

    let result = session.compress_messages(&["nope".to_string()]).await;
    assert!(matches!(result, Err(EngineError::InvalidState(_))));
}

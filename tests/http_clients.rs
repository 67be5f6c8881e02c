//! HTTP collaborators against mock servers

use conversation_engine::checkpoint::{CheckpointReconciler, CheckpointStore, HttpCheckpointStore};
use conversation_engine::compression::{
    CompressionOptions, CompressionService, HttpCompressionService,
};
use conversation_engine::config::{CheckpointConfig, CompressionConfig, TransportConfig};
use conversation_engine::transport::{HttpTransport, StreamRequest, Transport};
use conversation_engine::{
    Config, EngineError, Message, RunConfig, SessionController, StreamEvent, TurnOutcome,
};
use futures::StreamExt;
use secrecy::SecretString;
use std::sync::Arc;

fn transport_config(base_url: String) -> TransportConfig {
    TransportConfig {
        base_url,
        api_key: Some(SecretString::new("secret-token".to_string())),
        ..Default::default()
    }
}

const HISTORY: &str = r#"[
    {"values": {"messages": [{"type": "human", "id": "h1", "content": "hi"}]}},
    {"values": {"messages": [
        {"type": "human", "id": "h1", "content": "hi"},
        {"type": "ai", "id": "a1", "content": "hello there"}
    ]}}
]"#;

#[tokio::test]
async fn test_checkpoint_history_seeds_latest() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/threads/t-1/history")
        .match_header("authorization", "Bearer secret-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(HISTORY)
        .create_async()
        .await;

    let store = HttpCheckpointStore::new(&transport_config(server.url()), &CheckpointConfig::default())
        .unwrap();
    let reconciler = CheckpointReconciler::new(Arc::new(store));
    let messages = reconciler.load("t-1").await.unwrap();

    mock.assert_async().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, "a1");
    assert_eq!(messages[1].content, "hello there");
}

#[tokio::test]
async fn test_missing_thread_is_empty_history() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/threads/unknown/history")
        .with_status(404)
        .create_async()
        .await;

    let store = HttpCheckpointStore::new(&transport_config(server.url()), &CheckpointConfig::default())
        .unwrap();
    let history = store.thread_checkpoints("unknown").await.unwrap();
    assert_eq!(history, serde_json::json!([]));
}

#[tokio::test]
async fn test_checkpoint_server_error_is_load_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/threads/t-1/history")
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let store = HttpCheckpointStore::new(&transport_config(server.url()), &CheckpointConfig::default())
        .unwrap();
    let result = CheckpointReconciler::new(Arc::new(store)).load("t-1").await;
    assert!(matches!(result, Err(EngineError::CheckpointLoad(_))));
}

fn compression_config(endpoint: String) -> CompressionConfig {
    CompressionConfig {
        endpoint,
        max_retries: 3,
        retry_backoff_ms: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_compression_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/compress")
        .match_body(mockito::Matcher::PartialJsonString(
            r#"{"options": {"level": "medium"}}"#.to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"messages": [{"type": "ai", "id": "a1", "content": "short"}]}"#)
        .create_async()
        .await;

    let service =
        HttpCompressionService::new(&compression_config(format!("{}/compress", server.url())), None)
            .unwrap();
    let reply = service
        .compress(
            &[Message::assistant("a1", "a much longer answer")],
            &CompressionOptions::default(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].id, "a1");
    assert_eq!(reply[0].content, "short");
}

#[tokio::test]
async fn test_compression_retries_server_errors() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/compress")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let service =
        HttpCompressionService::new(&compression_config(format!("{}/compress", server.url())), None)
            .unwrap();
    let err = service
        .compress(&[Message::assistant("a1", "text")], &CompressionOptions::default())
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_compression_client_error_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/compress")
        .with_status(422)
        .expect(1)
        .create_async()
        .await;

    let service =
        HttpCompressionService::new(&compression_config(format!("{}/compress", server.url())), None)
            .unwrap();
    let err = service
        .compress(&[Message::assistant("a1", "text")], &CompressionOptions::default())
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert!(matches!(err, EngineError::Compression { retriable: false, .. }));
}

const SSE_BODY: &str = "event: metadata\n\
data: {\"run_id\": \"r1\"}\n\
\n\
event: messages\n\
data: [{\"type\": \"AIMessageChunk\", \"id\": \"m1\", \"content\": \"Hel\"}, {\"langgraph_node\": \"agent\"}]\n\
\n\
event: messages\n\
data: [{\"type\": \"AIMessageChunk\", \"id\": \"m1\", \"content\": \"lo\"}, {\"langgraph_node\": \"agent\"}]\n\
\n\
event: updates\n\
data: {\"token_usage\": {\"used\": 12, \"total\": 100, \"remaining\": 88}}\n\
\n\
event: end\n\
data: {}\n\
\n";

#[tokio::test]
async fn test_sse_transport_classifies_frames() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/threads/t-1/runs/stream")
        .match_header("authorization", "Bearer secret-token")
        .match_body(mockito::Matcher::PartialJsonString(
            r#"{"assistant_id": "agent"}"#.to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(SSE_BODY)
        .create_async()
        .await;

    let transport = HttpTransport::new(&transport_config(server.url())).unwrap();
    let request = StreamRequest::submit(Message::human("hi"), RunConfig::default());
    let stream = transport.open_stream("t-1", request).await.unwrap();
    let envelopes: Vec<_> = stream.collect().await;

    mock.assert_async().await;
    let events: Vec<StreamEvent> = envelopes
        .into_iter()
        .map(|envelope| envelope.unwrap())
        .inspect(|envelope| assert_eq!(envelope.thread_id.as_deref(), Some("t-1")))
        .map(|envelope| envelope.event)
        .collect();

    let kinds: Vec<_> = events.iter().map(StreamEvent::kind).collect();
    assert_eq!(kinds, vec!["heartbeat", "delta", "delta", "token_usage", "end"]);
}

#[tokio::test]
async fn test_sse_transport_rejected_run() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/threads/t-1/runs/stream")
        .with_status(409)
        .with_body("thread busy")
        .create_async()
        .await;

    let transport = HttpTransport::new(&transport_config(server.url())).unwrap();
    let result = transport.open_stream("t-1", StreamRequest::default()).await;
    match result {
        Err(EngineError::Transport(message)) => assert!(message.contains("409")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected rejection"),
    }
}

#[tokio::test]
async fn test_session_over_http_then_verify() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", mockito::Matcher::Regex(r"^/threads/[^/]+/runs/stream$".to_string()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(SSE_BODY)
        .create_async()
        .await;
    server
        .mock("GET", mockito::Matcher::Regex(r"^/threads/[^/]+/history$".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"messages": [{"type": "ai", "id": "m1", "content": "Hello"}]}"#)
        .create_async()
        .await;

    let mut config = Config::default();
    config.transport.base_url = server.url();
    config.compression.endpoint = format!("{}/compress", server.url());
    let session = SessionController::from_config(&config).unwrap();

    let outcome = session.submit("hi", RunConfig::default()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(session.token_budget().used, 12);

    // the optimistic human message is not in the remote history
    let report = session.verify().await.unwrap();
    assert_eq!(report.local_only, vec![messages[0].id.clone()]);
    assert!(report.remote_only.is_empty());
    assert!(report.divergent.is_empty());
}

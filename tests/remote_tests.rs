//! Remote adapter against an in-process mock of the chat-completions API.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use codegen_service::{CompletionBackend, GenerationParams, OpenAiClient, ServiceError};

#[derive(Clone, Default)]
struct Recorded {
    requests: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
}

async fn chat_completions(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    recorded.requests.lock().push((auth, body));

    Json(serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "def add(a, b):\n    return a + b"},
            "finish_reason": "stop"
        }]
    }))
}

async fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": {"message": "Incorrect API key provided"}})),
    )
}

async fn spawn(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/v1")
}

fn params(prompt: &str) -> GenerationParams {
    GenerationParams {
        prompt: prompt.into(),
        max_length: 128,
        randomness: 0.3,
    }
}

#[tokio::test]
async fn sends_chat_exchange_and_returns_first_choice() {
    let recorded = Recorded::default();
    let base_url = spawn(
        Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .with_state(recorded.clone()),
    )
    .await;

    let client = OpenAiClient::new("sk-test".into(), "gpt-3.5-turbo".into(), &base_url);
    let text = client.complete(params("add two numbers")).await.unwrap();

    assert_eq!(text, "def add(a, b):\n    return a + b");

    let requests = recorded.requests.lock();
    assert_eq!(requests.len(), 1);
    let (auth, body) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
    assert_eq!(body["model"], "gpt-3.5-turbo");
    assert_eq!(body["max_tokens"], 128);
    assert_eq!(body["temperature"], 0.3);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][0]["content"], "You are a helpful coding assistant.");
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "add two numbers");
}

#[tokio::test]
async fn error_status_surfaces_as_remote_error() {
    let base_url = spawn(Router::new().route("/v1/chat/completions", post(unauthorized))).await;

    let client = OpenAiClient::new("sk-bad".into(), "gpt-3.5-turbo".into(), &base_url);
    let err = client.complete(params("anything")).await.unwrap_err();

    assert!(matches!(err, ServiceError::Remote(_)));
    assert!(err.to_string().contains("401"));
    assert!(err.to_string().contains("Incorrect API key"));
}

#[tokio::test]
async fn unreachable_service_is_a_remote_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = OpenAiClient::new("sk".into(), "gpt-3.5-turbo".into(), &format!("http://{addr}/v1"));
    let err = client.complete(params("anything")).await.unwrap_err();

    assert!(matches!(err, ServiceError::Remote(_)));
}

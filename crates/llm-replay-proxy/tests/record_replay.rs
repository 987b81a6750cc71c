// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end tests: capture against a scripted upstream, normalize into a
//! cassette, then serve it back over HTTP.

use axum::extract::{Json as AxumJson, State};
use axum::routing::{get, post};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use llm_cassette::{Cassette, ChatMessage, Conversation, ToolCall, ToolSurface};
use llm_replay_proxy::{CaptureProxy, HarnessConfig, ReplayServer};

fn bash_surface() -> ToolSurface {
    ToolSurface {
        shell: "bash".to_string(),
        read_shell: "read_bash".to_string(),
        write_shell: "write_bash".to_string(),
    }
}

fn harness_config(cassette_path: &Path, workspace_dir: &str) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.server.port = 0;
    config.cassette.path = cassette_path.to_path_buf();
    config.workspace_dir = PathBuf::from(workspace_dir);
    config.tools = bash_surface();
    config
}

/// Scripted upstream: answers chat-completion calls from a queue of assistant
/// messages and serves a static model listing.
async fn start_stub_upstream(replies: Vec<Value>) -> SocketAddr {
    let queue = Arc::new(Mutex::new(VecDeque::from(replies)));

    async fn chat(
        State(queue): State<Arc<Mutex<VecDeque<Value>>>>,
        AxumJson(_body): AxumJson<Value>,
    ) -> AxumJson<Value> {
        let reply = queue
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| json!({"role": "assistant", "content": "script exhausted"}));
        AxumJson(json!({
            "id": "chatcmpl-live",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": reply, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 1}
        }))
    }

    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .route(
            "/v1/models",
            get(|| async { AxumJson(json!({"object": "list", "data": [{"id": "gpt-4o"}]})) }),
        )
        .with_state(queue);

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn capture_session_produces_a_normalized_cassette() {
    let assistant_call = json!({
        "role": "assistant",
        "content": null,
        "tool_calls": [{
            "id": "call_LiveRandom1",
            "type": "function",
            "function": {"name": "bash", "arguments": "{\"command\":\"ls /work/e2e\"}"}
        }]
    });
    let final_answer = json!({"role": "assistant", "content": "One file: notes.md"});
    let upstream = start_stub_upstream(vec![assistant_call.clone(), final_answer]).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cassette_path = dir.path().join("e2e.cassette.yaml");
    let mut config = harness_config(&cassette_path, "/work/e2e");
    config.upstream.base_url = format!("http://{upstream}");

    let running = CaptureProxy::new(config)
        .expect("config")
        .start()
        .await
        .expect("start capture proxy");
    let base = format!("http://{}", running.addr());
    let client = reqwest::Client::new();

    // A non-chat call first; it must be proxied and recorded but never become
    // a conversation.
    let models: Value = client
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .expect("proxied models call")
        .json()
        .await
        .expect("models json");
    assert_eq!(models["data"][0]["id"], "gpt-4o");

    let system = json!({"role": "system", "content": "live system prompt"});
    let user = json!({
        "role": "user",
        "content": "<current_datetime>2025-06-11T08:30:00Z</current_datetime>\nWhat is in the workspace?"
    });

    let first: Value = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "gpt-4o", "messages": [system, user]}))
        .send()
        .await
        .expect("first turn")
        .json()
        .await
        .expect("first turn json");
    assert_eq!(first["choices"][0]["message"]["tool_calls"][0]["id"], "call_LiveRandom1");

    let tool_result = json!({
        "role": "tool",
        "tool_call_id": "call_LiveRandom1",
        "content": "notes.md"
    });
    let second: Value = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o",
            "messages": [system, user, assistant_call, tool_result]
        }))
        .send()
        .await
        .expect("second turn")
        .json()
        .await
        .expect("second turn json");
    assert_eq!(second["choices"][0]["message"]["content"], "One file: notes.md");

    let written = running.stop().await.expect("stop");
    assert_eq!(written.as_deref(), Some(cassette_path.as_path()));

    let cassette = Cassette::from_file(&cassette_path).expect("load cassette");
    assert_eq!(cassette.models, vec!["gpt-4o".to_string()]);
    assert_eq!(cassette.conversations.len(), 1, "non-chat traffic filtered out");

    let messages = &cassette.conversations[0].messages;
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0].content.as_deref(), Some("${system}"));
    assert_eq!(messages[1].content.as_deref(), Some("What is in the workspace?"));
    let call = &messages[2].tool_calls.as_ref().expect("tool calls")[0];
    assert_eq!(call.id, "toolcall_0");
    assert_eq!(call.function.name, "${shell}");
    assert_eq!(call.function.arguments, "{\"command\":\"ls ${workspace}\"}");
    assert_eq!(messages[3].tool_call_id.as_deref(), Some("toolcall_0"));
}

#[tokio::test]
async fn dead_upstream_becomes_a_recorded_synthetic_500() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cassette_path = dir.path().join("dead.cassette.yaml");
    let mut config = harness_config(&cassette_path, "/work/e2e");
    // Nothing listens on port 9; connections are refused immediately.
    config.upstream.base_url = "http://127.0.0.1:9".to_string();
    config.upstream.timeout_seconds = 5;

    let running = CaptureProxy::new(config)
        .expect("config")
        .start()
        .await
        .expect("start capture proxy");
    let base = format!("http://{}", running.addr());

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .expect("proxied request completes despite dead upstream");
    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["type"], "upstream_error");

    let exchanges = running.exchanges().await;
    assert_eq!(exchanges.len(), 1);
    let recorded = exchanges[0].response.as_ref().expect("synthetic response recorded");
    assert_eq!(recorded.status_code, 500);
    assert!(recorded.body.contains("upstream request failed"));

    // The error body is not a chat completion, so no cassette is written.
    assert_eq!(running.stop().await.expect("stop"), None);
    assert!(!cassette_path.exists());
}

fn replay_cassette() -> Cassette {
    Cassette {
        models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
        conversations: vec![Conversation {
            messages: vec![
                ChatMessage::system("${system}"),
                ChatMessage::user("What is in the workspace?"),
                ChatMessage::assistant_tool_calls(
                    None,
                    vec![ToolCall::function(
                        "toolcall_0",
                        "${shell}",
                        "{\"command\":\"cat ${workspace}/notes.md\"}",
                    )],
                ),
                ChatMessage::tool_result("toolcall_0", "hello"),
                ChatMessage::assistant("The note under ${workspace}/notes.md says hello."),
            ],
        }],
    }
}

async fn start_replay(cassette: &Cassette, workspace_dir: &str) -> (String, llm_replay_proxy::RunningReplay) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("replay.cassette.yaml");
    cassette.to_file(&path).expect("write cassette");

    let config = harness_config(&path, workspace_dir);
    let running = ReplayServer::new(config)
        .expect("config")
        .start()
        .await
        .expect("start replay server");
    // The cassette file is already loaded; the tempdir may go away.
    drop(dir);
    let base = format!("http://{}", running.addr());
    (base, running)
}

#[tokio::test]
async fn replay_resolves_placeholders_into_the_callers_environment() {
    let (base, _running) = start_replay(&replay_cassette(), "/home/ci/job-7").await;
    let client = reqwest::Client::new();

    let first: Value = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "a different system prompt each release"},
                {"role": "user", "content": "<current_datetime>2026-01-05</current_datetime>\nWhat is in the workspace?"}
            ]
        }))
        .send()
        .await
        .expect("first turn")
        .json()
        .await
        .expect("first turn json");

    let message = &first["choices"][0]["message"];
    let call = &message["tool_calls"][0];
    assert_eq!(call["id"], "toolcall_0");
    assert_eq!(call["function"]["name"], "bash");
    assert_eq!(
        call["function"]["arguments"],
        "{\"command\":\"cat /home/ci/job-7/notes.md\"}"
    );
    assert_eq!(first["choices"][0]["finish_reason"], "tool_calls");

    // Echo the expanded reply back, as a real client would, and grow the
    // history with the tool result.
    let second: Value = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "a different system prompt each release"},
                {"role": "user", "content": "What is in the workspace?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "toolcall_0",
                    "type": "function",
                    "function": {"name": "bash", "arguments": "{\"command\":\"cat /home/ci/job-7/notes.md\"}"}
                }]},
                {"role": "tool", "tool_call_id": "toolcall_0", "content": "hello"}
            ]
        }))
        .send()
        .await
        .expect("second turn")
        .json()
        .await
        .expect("second turn json");

    assert_eq!(
        second["choices"][0]["message"]["content"],
        "The note under /home/ci/job-7/notes.md says hello."
    );
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn streaming_reconstructs_the_non_streaming_reply() {
    let (base, _running) = start_replay(&replay_cassette(), "/home/ci/job-7").await;
    let client = reqwest::Client::new();
    let request = json!({
        "model": "gpt-4o",
        "messages": [
            {"role": "system", "content": "whatever"},
            {"role": "user", "content": "What is in the workspace?"}
        ]
    });

    let plain: Value = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&request)
        .send()
        .await
        .expect("non-streaming")
        .json()
        .await
        .expect("non-streaming json");
    let plain_message = &plain["choices"][0]["message"];

    let mut streamed_request = request.clone();
    streamed_request["stream"] = json!(true);
    let raw = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&streamed_request)
        .send()
        .await
        .expect("streaming")
        .text()
        .await
        .expect("streaming body");

    let data_lines: Vec<&str> = raw
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(*data_lines.last().expect("sentinel"), "[DONE]");

    let first_chunk: Value = serde_json::from_str(data_lines[0]).expect("chunk json");
    assert_eq!(first_chunk["object"], "chat.completion.chunk");
    let delta = &first_chunk["choices"][0]["delta"];
    assert_eq!(delta["role"], "assistant");
    assert_eq!(
        delta["tool_calls"][0]["function"]["arguments"],
        plain_message["tool_calls"][0]["function"]["arguments"]
    );
    assert_eq!(delta["tool_calls"][0]["function"]["name"], "bash");

    let finish_chunk: Value = serde_json::from_str(data_lines[1]).expect("finish json");
    assert_eq!(finish_chunk["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn unknown_history_fails_loudly_with_404() {
    let (base, _running) = start_replay(&replay_cassette(), "/home/ci/job-7").await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "this was never recorded"}]
        }))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["type"], "fixture_miss");
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("No recorded conversation"));
}

#[tokio::test]
async fn models_endpoint_preserves_cassette_order() {
    let (base, _running) = start_replay(&replay_cassette(), "/home/ci/job-7").await;

    let listing: Value = reqwest::Client::new()
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .expect("models request")
        .json()
        .await
        .expect("models json");

    let data = listing["data"].as_array().expect("data array");
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "gpt-4o");
    assert_eq!(data[1]["id"], "gpt-4o-mini");
}

#[tokio::test]
async fn missing_cassette_is_fatal_at_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = harness_config(&dir.path().join("absent.cassette.yaml"), "/home/ci");
    let result = ReplayServer::new(config).expect("config").start().await;
    assert!(result.is_err(), "replay startup must fail without a cassette");
}

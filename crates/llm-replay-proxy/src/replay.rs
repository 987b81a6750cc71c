// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Replay server: serves recorded conversations from a cassette behind the
//! same endpoint shape as the live chat-completion backend.
//!
//! The server has exactly two states: loading (the cassette file is parsed at
//! startup, fatally on error) and serving (stateless per-request dispatch to
//! the matcher). Matching is purely a function of each request's full message
//! history; there is no conversation-level session state.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures::stream;
use serde_json::{json, Value as JsonValue};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use llm_cassette::{
    expand_workspace_path, Cassette, CassetteBuilder, CassetteError, ChatMessage,
    ConversationMatcher, ToolSurface,
};

use crate::config::{HarnessConfig, HarnessMode};
use crate::error::{Error, Result};

/// Replay server, configured but not yet listening.
#[derive(Debug)]
pub struct ReplayServer {
    config: HarnessConfig,
}

struct ReplayState {
    cassette: Cassette,
    tools: ToolSurface,
    workspace_dir: String,
}

/// A started replay server.
pub struct RunningReplay {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// A matched reply with its placeholders expanded for the caller, plus the
/// model name to echo in the response envelope.
struct ResolvedReply {
    model: String,
    message: ChatMessage,
}

impl ReplayServer {
    /// Create a replay server for the given configuration.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate(HarnessMode::Replay)?;
        Ok(Self { config })
    }

    /// Load the cassette and start serving. Cassette load failure is fatal.
    pub async fn start(self) -> Result<RunningReplay> {
        let cassette = Cassette::from_file(&self.config.cassette.path)?;
        info!(
            path = %self.config.cassette.path.display(),
            conversations = cassette.conversations.len(),
            models = cassette.models.len(),
            "cassette loaded"
        );

        let state = Arc::new(ReplayState {
            cassette,
            tools: self.config.tools.clone(),
            workspace_dir: self.config.workspace_dir.to_string_lossy().into_owned(),
        });

        let app = Router::new()
            .route("/chat/completions", post(chat_completions))
            .route("/v1/chat/completions", post(chat_completions))
            .route("/models", get(list_models))
            .route("/v1/models", get(list_models))
            .route("/health", get(|| async { "OK" }))
            .fallback(unknown_path)
            .with_state(state)
            .layer(CorsLayer::permissive());

        let listener =
            TcpListener::bind((self.config.server.host.as_str(), self.config.server.port)).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(%addr, "replay server listening");

        Ok(RunningReplay {
            addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

impl RunningReplay {
    /// The bound listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close the listener and drain in-flight connections.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| Error::Server {
                message: format!("replay server task failed: {e}"),
            })??;
        Ok(())
    }
}

impl ReplayState {
    /// Normalize the incoming request the same way capture did, find the
    /// recorded reply, and expand its placeholders into the caller's concrete
    /// environment.
    fn resolve(&self, body: &JsonValue) -> Result<ResolvedReply> {
        let model = body
            .get("model")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let raw_messages = body
            .get("messages")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| Error::InvalidRequest {
                message: "request has no messages array".to_string(),
            })?;

        let mut messages: Vec<ChatMessage> = Vec::with_capacity(raw_messages.len());
        for raw in raw_messages {
            messages.push(serde_json::from_value(raw.clone()).map_err(|e| {
                Error::InvalidRequest {
                    message: format!("malformed message: {e}"),
                }
            })?);
        }

        let mut builder = CassetteBuilder::new(&self.workspace_dir, self.tools.clone());
        builder.normalize_messages(&mut messages);
        debug!(history = messages.len(), "normalized incoming request");

        let matcher = ConversationMatcher::new(&self.cassette);
        let reply = matcher.find_reply(&messages)?;

        Ok(ResolvedReply {
            model,
            message: self.expand_reply(reply.clone()),
        })
    }

    /// Reverse the placeholder substitutions for this caller: tool name
    /// placeholders become the configured surface's concrete names, the
    /// workspace placeholder becomes the caller's real path.
    fn expand_reply(&self, mut reply: ChatMessage) -> ChatMessage {
        if let Some(content) = &reply.content {
            reply.content = Some(expand_workspace_path(content, &self.workspace_dir));
        }
        if let Some(calls) = &mut reply.tool_calls {
            for call in calls {
                if let Some(concrete) = self.tools.concrete_for(&call.function.name) {
                    call.function.name = concrete.to_string();
                }
                call.function.arguments =
                    expand_workspace_path(&call.function.arguments, &self.workspace_dir);
            }
        }
        reply
    }
}

async fn chat_completions(
    State(state): State<Arc<ReplayState>>,
    Json(body): Json<JsonValue>,
) -> Response {
    let wants_stream = body.get("stream").and_then(JsonValue::as_bool).unwrap_or(false);

    match state.resolve(&body) {
        Ok(resolved) => {
            if wants_stream {
                stream_completion(&resolved)
            } else {
                Json(completion_payload(&resolved)).into_response()
            }
        }
        Err(err) => error_response(err),
    }
}

async fn list_models(State(state): State<Arc<ReplayState>>) -> Json<JsonValue> {
    let data: Vec<JsonValue> = state
        .cassette
        .models
        .iter()
        .map(|model| {
            json!({
                "id": model,
                "object": "model",
                "name": model,
                "owned_by": "replay"
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

async fn unknown_path(request: axum::extract::Request) -> Response {
    error!(path = %request.uri(), "unhandled request path");
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Assemble the non-streaming OpenAI-style completion object.
fn completion_payload(resolved: &ResolvedReply) -> JsonValue {
    let finish_reason = if resolved.message.tool_calls.is_some() {
        "tool_calls"
    } else {
        "stop"
    };

    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": &resolved.model,
        "choices": [{
            "index": 0,
            "message": &resolved.message,
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0
        }
    })
}

/// Emit the same resolved reply as a minimal streamed sequence: one delta
/// chunk carrying the whole logical reply, a finish chunk, then the `[DONE]`
/// sentinel. No token-level fragmentation is attempted.
fn stream_completion(resolved: &ResolvedReply) -> Response {
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();

    let mut delta = serde_json::Map::new();
    delta.insert("role".to_string(), json!("assistant"));
    if let Some(content) = &resolved.message.content {
        delta.insert("content".to_string(), json!(content));
    }
    let finish_reason = if let Some(calls) = &resolved.message.tool_calls {
        let deltas: Vec<JsonValue> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                json!({
                    "index": index,
                    "id": call.id,
                    "type": call.kind,
                    "function": {
                        "name": call.function.name,
                        "arguments": call.function.arguments
                    }
                })
            })
            .collect();
        delta.insert("tool_calls".to_string(), JsonValue::Array(deltas));
        "tool_calls"
    } else {
        "stop"
    };

    let content_chunk = json!({
        "id": &id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": &resolved.model,
        "choices": [{"index": 0, "delta": JsonValue::Object(delta), "finish_reason": null}]
    });
    let finish_chunk = json!({
        "id": &id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": &resolved.model,
        "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}]
    });

    let events = vec![
        Ok::<Event, Infallible>(Event::default().data(content_chunk.to_string())),
        Ok(Event::default().data(finish_chunk.to_string())),
        Ok(Event::default().data("[DONE]")),
    ];

    Sse::new(stream::iter(events)).into_response()
}

/// Map harness errors onto the wire. Lookup failures are loud 404s; there is
/// never a silent fallback to a live upstream.
fn error_response(err: Error) -> Response {
    let (status, error_type) = match &err {
        Error::Cassette {
            source: CassetteError::NoConversationMatch { .. },
        }
        | Error::Cassette {
            source: CassetteError::IncompleteConversation { .. },
        } => (StatusCode::NOT_FOUND, "fixture_miss"),
        Error::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    error!(%err, "replay request failed");
    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": error_type
        }
    });
    (status, Json(body)).into_response()
}

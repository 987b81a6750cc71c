// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capturing forward proxy: relays every request byte-for-byte to a configured
//! upstream while recording each exchange, then normalizes the session into a
//! cassette when stopped.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Response as HttpResponse, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use llm_cassette::{
    CapturedExchange, CapturedRequest, CapturedResponse, CassetteBuilder, ToolResultNormalizers,
};

use crate::config::{HarnessConfig, HarnessMode};
use crate::error::{Error, Result};

/// Headers that must not be relayed verbatim: the server stack regenerates
/// them for the re-framed response body.
const HOP_BY_HOP_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Capturing proxy, configured but not yet listening.
#[derive(Debug)]
pub struct CaptureProxy {
    config: HarnessConfig,
    result_normalizers: ToolResultNormalizers,
}

struct CaptureState {
    upstream_base: String,
    client: reqwest::Client,
    exchanges: Mutex<Vec<CapturedExchange>>,
}

/// A started capture session. Dropping it aborts the server without writing a
/// cassette; [`RunningCapture::stop`] is the one path that persists.
pub struct RunningCapture {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
    state: Arc<CaptureState>,
    config: HarnessConfig,
    result_normalizers: ToolResultNormalizers,
}

impl CaptureProxy {
    /// Create a capturing proxy for the given configuration.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate(HarnessMode::Record)?;
        Ok(Self {
            config,
            result_normalizers: ToolResultNormalizers::new(),
        })
    }

    /// Attach per-tool result rewrite functions applied during the
    /// end-of-session normalization.
    #[must_use]
    pub fn with_result_normalizers(mut self, normalizers: ToolResultNormalizers) -> Self {
        self.result_normalizers = normalizers;
        self
    }

    /// Bind the listening socket and start serving. Returns once the socket
    /// is bound, with the actual address available on the handle (relevant
    /// when the configured port is 0).
    pub async fn start(self) -> Result<RunningCapture> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.upstream.timeout_seconds))
            .build()?;

        let state = Arc::new(CaptureState {
            upstream_base: self.config.upstream.base_url.trim_end_matches('/').to_string(),
            client,
            exchanges: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .fallback(relay_and_record)
            .with_state(state.clone())
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

        info!(%addr, upstream = %self.config.upstream.base_url, "capture proxy listening");

        Ok(RunningCapture {
            addr,
            shutdown: shutdown_tx,
            task,
            state,
            config: self.config,
            result_normalizers: self.result_normalizers,
        })
    }
}

impl RunningCapture {
    /// The bound listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Snapshot of the exchanges recorded so far.
    pub async fn exchanges(&self) -> Vec<CapturedExchange> {
        self.state.exchanges.lock().await.clone()
    }

    /// Stop accepting requests, drain in-flight connections, normalize the
    /// session, and write the cassette.
    ///
    /// Consuming `self` guarantees normalization and persistence run exactly
    /// once per session. Returns the written path, or `None` when no
    /// chat-completion traffic was captured and no file was written.
    pub async fn stop(self) -> Result<Option<PathBuf>> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| Error::Server {
                message: format!("capture server task failed: {e}"),
            })??;

        let exchanges = std::mem::take(&mut *self.state.exchanges.lock().await);
        info!(count = exchanges.len(), "capture session finished");

        let builder = CassetteBuilder::new(&self.config.workspace_dir, self.config.tools.clone())
            .with_result_normalizers(self.result_normalizers);

        match builder.build(&exchanges)? {
            Some(cassette) => {
                cassette.to_file(&self.config.cassette.path)?;
                info!(
                    path = %self.config.cassette.path.display(),
                    conversations = cassette.conversations.len(),
                    "cassette written"
                );
                Ok(Some(self.config.cassette.path))
            }
            None => {
                info!("no chat-completion traffic captured; cassette not written");
                Ok(None)
            }
        }
    }
}

/// Forward one request to the upstream, relay the response, and record the
/// exchange. Only the list append is serialized; forwarding runs fully
/// concurrently across in-flight requests.
async fn relay_and_record(State(state): State<Arc<CaptureState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read proxied request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let upstream_url = format!("{}{}", state.upstream_base, path_and_query);

    let mut request_headers = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            request_headers.insert(name.to_string(), value.to_string());
        }
    }

    let mut exchange = CapturedExchange {
        request: CapturedRequest {
            method: parts.method.to_string(),
            url: upstream_url.clone(),
            headers: request_headers.clone(),
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
            start_time: Utc::now(),
        },
        response: None,
        duration_ms: None,
    };

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut upstream_request = state.client.request(method, &upstream_url);
    for (name, value) in &request_headers {
        // Host belongs to the upstream and framing headers are regenerated
        // for the re-framed body; the client sets both itself.
        if name.eq_ignore_ascii_case("host")
            || HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        upstream_request = upstream_request.header(name, value);
    }

    let outcome = match upstream_request.body(body_bytes.to_vec()).send().await {
        Ok(upstream_response) => {
            let status = upstream_response.status().as_u16();
            let mut response_headers = HashMap::new();
            for (name, value) in upstream_response.headers() {
                if let Ok(value) = value.to_str() {
                    response_headers.insert(name.to_string(), value.to_string());
                }
            }
            match upstream_response.bytes().await {
                Ok(bytes) => Ok((status, response_headers, bytes)),
                Err(e) => Err(e.to_string()),
            }
        }
        Err(e) => Err(e.to_string()),
    };

    match outcome {
        Ok((status, response_headers, bytes)) => {
            exchange.complete(CapturedResponse {
                status_code: status,
                headers: response_headers.clone(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
                end_time: Utc::now(),
            });
            state.exchanges.lock().await.push(exchange);

            let mut builder = HttpResponse::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
            for (name, value) in &response_headers {
                if !HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                    builder = builder.header(name, value);
                }
            }
            match builder.body(Body::from(bytes)) {
                Ok(response) => response.into_response(),
                Err(e) => {
                    error!(error = %e, "failed to assemble relayed response");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Err(detail) => {
            // A dead upstream must not abort the test run; the failure is
            // captured so investigators can see why the fixture is wrong.
            error!(url = %upstream_url, error = %detail, "upstream request failed");
            let error_body = serde_json::json!({
                "error": {
                    "message": format!("upstream request failed: {detail}"),
                    "type": "upstream_error"
                }
            })
            .to_string();

            exchange.complete(CapturedResponse {
                status_code: 500,
                headers: HashMap::new(),
                body: error_body.clone(),
                end_time: Utc::now(),
            });
            state.exchanges.lock().await.push(exchange);

            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "application/json")],
                error_body,
            )
                .into_response()
        }
    }
}

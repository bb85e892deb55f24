// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The HTTP surface: an OpenAI-compatible API over the request handler.
//!
//! Routes match what OpenAI clients probe for, with and without the `/v1`
//! prefix.  Streaming replies use SSE with one `data:` event per chunk and
//! the `[DONE]` sentinel; every event is flushed individually so a slow
//! client never delays the next chunk.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use zproxy_config::Config;
use zproxy_core::{ChatBackend, ChatCompletionRequest, ContextStats, Handler, ReplyBody};

static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-proxy-request-id");
static CONTEXT_USED_HEADER: HeaderName = HeaderName::from_static("x-context-used");
static CONTEXT_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-context-remaining");
static CONTEXT_BUDGET_HEADER: HeaderName = HeaderName::from_static("x-context-budget");

struct AppState {
    handler: Handler,
    model: String,
    include_context_headers: bool,
}

/// Build the router for the given configuration and backend.
pub fn router(config: Config, backend: Arc<dyn ChatBackend>) -> Router {
    let model = config.upstream.model.clone();
    let include_context_headers = config.proxy.include_usage;
    let state = Arc::new(AppState {
        handler: Handler::new(config, backend),
        model,
        include_context_headers,
    });
    Router::new()
        .route("/", get(index))
        .route("/models", get(models))
        .route("/v1/models", get(models))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions))
        // Browser-based clients (Open WebUI, playgrounds) call the proxy
        // cross-origin; the API carries no cookies, so permissive is fine.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: Config, backend: Arc<dyn ChatBackend>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = router(config, backend);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "proxy listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ─── Route handlers ──────────────────────────────────────────────────────────

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "zproxy is running; POST /v1/chat/completions",
    }))
}

async fn models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.model,
            "object": "model",
            "created": zproxy_core::openai::unix_timestamp(),
            "owned_by": "z.ai",
        }],
    }))
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatCompletionRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": {
                        "message": rejection.to_string(),
                        "type": "invalid_request_error",
                    }
                })),
            )
                .into_response();
        }
    };

    let reply = state.handler.handle(req).await;
    let request_id = reply.request_id.clone();
    let context = reply.context.filter(|_| state.include_context_headers);

    let mut response = match reply.body {
        ReplyBody::Full(completion) => Json(completion).into_response(),
        ReplyBody::Stream(chunks) => {
            let events = chunks
                .map(|chunk| match Event::default().json_data(&chunk) {
                    Ok(ev) => Ok::<Event, Infallible>(ev),
                    Err(_) => Ok(Event::default().data("{}")),
                })
                .chain(futures::stream::once(async {
                    Ok(Event::default().data("[DONE]"))
                }));
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    };

    attach_headers(&mut response, &request_id, context);
    response
}

fn attach_headers(response: &mut Response, request_id: &str, context: Option<ContextStats>) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER.clone(), v);
    }
    if let Some(ctx) = context {
        headers.insert(CONTEXT_USED_HEADER.clone(), numeric_header(ctx.used));
        headers.insert(
            CONTEXT_REMAINING_HEADER.clone(),
            numeric_header(ctx.remaining()),
        );
        headers.insert(CONTEXT_BUDGET_HEADER.clone(), numeric_header(ctx.budget));
    }
}

fn numeric_header(value: usize) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP client for the upstream chat service.
//!
//! The upstream is a browser-first product: its completion endpoint expects
//! a signed request, a cookie *and* bearer token, a frontend version header,
//! and a query-string dossier of browser telemetry used by its antibot
//! layer.  Everything here mirrors what the web frontend sends so the proxy
//! is indistinguishable from a browser tab.

use chrono::{Datelike, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use zproxy_config::UpstreamConfig;

use crate::chunk::StreamChunk;
use crate::error::UpstreamError;
use crate::history::{linearize, HistoryMessage};
use crate::signature::{sign_request, RequestSignature};
use crate::stream::StreamParser;
use crate::token::user_id_from_token;

/// User agent matching the Chromium build the upstream frontend targets.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36";

/// A conversation owned by the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub models: Vec<String>,
}

impl Chat {
    fn from_value(v: &Value) -> Option<Self> {
        let id = v["id"].as_str()?.to_string();
        Some(Self {
            id,
            title: v["title"].as_str().unwrap_or("").to_string(),
            models: v["models"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|m| m.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

/// Options for [`UpstreamClient::send_message`].
#[derive(Debug, Clone, Default)]
pub struct SendMessageOptions {
    pub chat_id: String,
    /// Wire messages, each `{role, content}`.
    pub messages: Vec<Value>,
    pub model: String,
    pub stream: bool,
    pub enable_thinking: bool,
    /// Fetch the upstream chat and prepend its linearized history.
    pub include_history: bool,
    pub parent_message_id: Option<String>,
    /// Merged into `params` verbatim.
    pub generation_params: Option<Value>,
    /// Merged over the default feature set.
    pub features: Option<Value>,
}

/// Client for the upstream JSON + SSE protocol.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    fe_version: String,
}

impl UpstreamClient {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let token = cfg.token.clone().ok_or(UpstreamError::MissingToken)?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token,
            fe_version: cfg.fe_version.clone(),
        })
    }

    /// User id decoded from the configured bearer token.
    pub fn user_id(&self) -> String {
        user_id_from_token(&self.token)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header(reqwest::header::COOKIE, format!("token={}", self.token))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Retrieve full conversation state including the message DAG.
    pub async fn get_chat(&self, chat_id: &str) -> Result<Value, UpstreamError> {
        let resp = self.get(&format!("/api/v1/chats/{chat_id}")).send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::RequestFailed {
                operation: "getChat",
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json().await?)
    }

    /// Read `chat.history.currentId`, the tip of the message DAG.
    pub async fn get_current_message_id(
        &self,
        chat_id: &str,
    ) -> Result<Option<String>, UpstreamError> {
        let chat = self.get_chat(chat_id).await?;
        Ok(current_id_of(&chat))
    }

    /// List chats, newest first.  An empty or unexpected structure yields `[]`.
    pub async fn list_chats(&self, page: u32) -> Result<Vec<Chat>, UpstreamError> {
        let resp = self.get(&format!("/api/v1/chats/?page={page}")).send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::RequestFailed {
                operation: "listChats",
                status: resp.status().as_u16(),
            });
        }
        let body: Value = resp.json().await?;
        let items = body
            .as_array()
            .or_else(|| body["data"].as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().filter_map(Chat::from_value).collect())
    }

    /// Create a chat, optionally seeding the DAG with an initial user message.
    pub async fn create_chat(
        &self,
        title: &str,
        model: &str,
        initial_message: Option<&str>,
    ) -> Result<Chat, UpstreamError> {
        let body = build_new_chat_body(title, model, initial_message, Utc::now().timestamp_millis());
        let resp = self
            .http
            .post(format!("{}/api/v1/chats/new", self.base_url))
            .bearer_auth(&self.token)
            .header(reqwest::header::COOKIE, format!("token={}", self.token))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::RequestFailed {
                operation: "createChat",
                status: resp.status().as_u16(),
            });
        }
        let v: Value = resp.json().await?;
        Chat::from_value(&v)
            .or_else(|| Chat::from_value(&v["chat"]))
            .ok_or_else(|| UpstreamError::BadResponse {
                operation: "createChat",
                detail: "response carries no chat id".into(),
            })
    }

    /// Identity probe; also the cheapest way to check token validity.
    /// A guest-labelled identity means the token was not accepted.
    pub async fn get_user_settings(&self) -> Result<Value, UpstreamError> {
        let resp = self.get("/api/v1/users/user/settings").send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::RequestFailed {
                operation: "getUserSettings",
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.json().await?)
    }

    /// Post a completion and stream the decoded chunks.
    ///
    /// All failures are reported in-band: the returned stream always ends
    /// with exactly one `Done` or `Error` chunk.
    pub async fn send_message(&self, mut opts: SendMessageOptions) -> BoxStream<'static, StreamChunk> {
        // History prepend happens before signing because the signature
        // covers the last user prompt of the final message list.
        if opts.include_history {
            match self.get_chat(&opts.chat_id).await {
                Ok(chat) => {
                    let history = chat
                        .get("chat")
                        .map(|c| c["history"].clone())
                        .filter(|h| !h.is_null())
                        .unwrap_or_else(|| chat["history"].clone());
                    let (linear, current) = linearize(&history);
                    let mut merged: Vec<Value> = linear.iter().map(history_to_wire).collect();
                    merged.append(&mut opts.messages);
                    opts.messages = merged;
                    if opts.parent_message_id.is_none() {
                        opts.parent_message_id = current;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "history fetch failed; sending without it");
                }
            }
        }

        let user_id = self.user_id();
        let prompt = last_user_content(&opts.messages);
        let timestamp = Utc::now().timestamp_millis();
        let sig = match sign_request(&prompt, &user_id, timestamp, None) {
            Ok(s) => s,
            Err(e) => {
                return futures::stream::iter(vec![StreamChunk::Error(e.chunk_reason())]).boxed();
            }
        };

        let query = browser_query(&sig, &user_id, &self.token);
        let body = build_completion_body(&opts, &prompt);
        debug!(
            chat_id = %opts.chat_id,
            model = %opts.model,
            message_count = opts.messages.len(),
            "sending upstream completion"
        );

        let request = self
            .http
            .post(format!("{}/api/v2/chat/completions", self.base_url))
            .query(&query)
            .bearer_auth(&self.token)
            .header("X-Signature", &sig.signature)
            .header("X-FE-Version", &self.fe_version)
            .header(reqwest::header::COOKIE, format!("token={}", self.token))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);

        Box::pin(async_stream::stream! {
            let resp = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    yield StreamChunk::Error(UpstreamError::from(e).chunk_reason());
                    return;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                yield StreamChunk::Error(format!("request_failed:{}", status.as_u16()));
                return;
            }

            let mut parser = StreamParser::new();
            let mut body_stream = resp.bytes_stream();
            let mut got_bytes = false;
            while let Some(next) = body_stream.next().await {
                match next {
                    Ok(bytes) => {
                        got_bytes = true;
                        for chunk in parser.feed(&bytes) {
                            let terminal = chunk.is_terminal();
                            yield chunk;
                            if terminal {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "upstream body read failed");
                        yield StreamChunk::Error(format!("request_failed:{}", status.as_u16()));
                        return;
                    }
                }
            }
            if !got_bytes {
                yield StreamChunk::Error(format!("request_failed:{}", status.as_u16()));
                return;
            }
            for chunk in parser.finish() {
                yield chunk;
            }
            if !parser.is_terminated() {
                yield StreamChunk::Done;
            }
        })
    }
}

// ─── Request construction ────────────────────────────────────────────────────

fn current_id_of(chat: &Value) -> Option<String> {
    chat["chat"]["history"]["currentId"]
        .as_str()
        .or_else(|| chat["history"]["currentId"].as_str())
        .map(str::to_string)
}

fn history_to_wire(m: &HistoryMessage) -> Value {
    json!({ "role": m.role, "content": m.content })
}

/// Last user-message text — the prompt component of the signature.
fn last_user_content(messages: &[Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m["role"].as_str() == Some("user"))
        .and_then(|m| m["content"].as_str())
        .unwrap_or("")
        .to_string()
}

/// Feature flags merged over the frontend defaults.
fn build_features(enable_thinking: bool, overrides: Option<&Value>) -> Value {
    let mut features = json!({
        "image_generation": false,
        "web_search": false,
        "auto_web_search": false,
        "preview_mode": true,
        "enable_thinking": enable_thinking,
    });
    if let Some(Value::Object(map)) = overrides {
        for (k, v) in map {
            features[k.as_str()] = v.clone();
        }
    }
    features
}

/// Prompt-template placeholders the frontend would substitute client-side.
fn build_variables(now: chrono::DateTime<Utc>) -> Value {
    let weekday = now.weekday().to_string();
    json!({
        "{{USER_NAME}}": "User",
        "{{USER_LOCATION}}": "Unknown",
        "{{USER_LANGUAGE}}": "en-US",
        "{{CURRENT_DATETIME}}": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "{{CURRENT_DATE}}": now.format("%Y-%m-%d").to_string(),
        "{{CURRENT_TIME}}": now.format("%H:%M:%S").to_string(),
        "{{CURRENT_WEEKDAY}}": weekday,
        "{{CURRENT_TIMEZONE}}": "UTC",
    })
}

/// The completion request body, shaped exactly like the web frontend's.
fn build_completion_body(opts: &SendMessageOptions, prompt: &str) -> Value {
    let mut params = json!({});
    if let Some(Value::Object(gen)) = opts.generation_params.as_ref() {
        for (k, v) in gen {
            params[k.as_str()] = v.clone();
        }
    }
    json!({
        "stream": opts.stream,
        "model": opts.model,
        "messages": opts.messages,
        "signature_prompt": prompt,
        "params": params,
        "features": build_features(opts.enable_thinking, opts.features.as_ref()),
        "variables": build_variables(Utc::now()),
        "chat_id": opts.chat_id,
        "id": Uuid::new_v4().to_string(),
        "current_user_message_id": Uuid::new_v4().to_string(),
        "current_user_message_parent_id": opts.parent_message_id,
    })
}

/// Body for `POST /api/v1/chats/new`.
fn build_new_chat_body(
    title: &str,
    model: &str,
    initial_message: Option<&str>,
    timestamp_ms: i64,
) -> Value {
    let (messages, current_id) = match initial_message {
        Some(text) => {
            let id = Uuid::new_v4().to_string();
            let node = json!({
                "id": id,
                "parentId": null,
                "childrenIds": [],
                "role": "user",
                "content": text,
                "timestamp": timestamp_ms / 1000,
                "models": [model],
            });
            (json!({ id.clone(): node }), Value::String(id))
        }
        None => (json!({}), Value::Null),
    };
    json!({
        "chat": {
            "title": title,
            "models": [model],
            "history": { "messages": messages, "currentId": current_id },
            "features": build_features(true, None),
            "enable_thinking": true,
            "auto_web_search": false,
            "timestamp": timestamp_ms,
        }
    })
}

/// The browser telemetry dossier attached to every completion request.
///
/// The upstream's antibot layer scores these fields; values mirror a stock
/// Chromium desktop profile.  Signature-related fields (`requestId`,
/// `timestamp`, `signature_timestamp`, `user_id`, `token`) ride along in
/// the same query string.
fn browser_query(sig: &RequestSignature, user_id: &str, token: &str) -> Vec<(String, String)> {
    let now = Utc::now();
    let local_time = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let q: Vec<(&str, String)> = vec![
        ("timestamp", sig.timestamp.to_string()),
        ("requestId", sig.request_id.clone()),
        ("user_id", user_id.to_string()),
        ("token", token.to_string()),
        ("signature_timestamp", sig.timestamp.to_string()),
        ("current_url", "https://chat.z.ai/".into()),
        ("pathname", "/".into()),
        ("search", String::new()),
        ("hash", String::new()),
        ("host", "chat.z.ai".into()),
        ("hostname", "chat.z.ai".into()),
        ("protocol", "https:".into()),
        ("referrer", String::new()),
        ("title", "Z.ai Chat".into()),
        ("timezone", "UTC".into()),
        ("timezone_offset", "0".into()),
        ("local_time", local_time),
        ("utc_time", now.to_rfc2822()),
        ("language", "en-US".into()),
        ("languages", "en-US,en".into()),
        ("platform", "Win32".into()),
        ("user_agent", USER_AGENT.into()),
        ("cookie_enabled", "true".into()),
        ("do_not_track", "null".into()),
        ("hardware_concurrency", "16".into()),
        ("device_memory", "8".into()),
        ("screen_width", "1920".into()),
        ("screen_height", "1080".into()),
        ("screen_color_depth", "24".into()),
        ("screen_pixel_depth", "24".into()),
        ("viewport_width", "1536".into()),
        ("viewport_height", "864".into()),
        ("pixel_ratio", "1.25".into()),
        ("is_mobile", "false".into()),
        ("touch_support", "false".into()),
        ("browser_name", "Chrome".into()),
        ("browser_version", "139.0.0.0".into()),
        ("os_name", "Windows".into()),
        ("os_version", "10".into()),
    ];
    q.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

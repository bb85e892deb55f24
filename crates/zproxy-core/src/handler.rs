// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-request orchestration.
//!
//! One `handle` call drives the whole pipeline: confirmation drain, tool
//! registry, directives, compaction, session delta, heuristics, the
//! planner loop with corrective retries, guard dispatch, and the final
//! OpenAI-shaped reply (whole or chunked).  Every failure path still
//! returns a valid OpenAI response — errors never cross the HTTP boundary
//! as exceptions.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use zproxy_config::Config;
use zproxy_guard::{
    parse_confirmation_reply, CallSource, ConfirmationReply, Guard, GuardOutcome,
};
use zproxy_planner::{
    build_system_prompt, heuristics, normalize_name, parse_planner_output, parse_raw_tool_calls,
    prompt, Action, ParsedCall, PromptOptions, ToolRegistry,
};
use zproxy_upstream::{SendMessageOptions, StreamChunk};

use crate::backend::ChatBackend;
use crate::compact::{estimate_text_tokens, Compactor};
use crate::dump::Dumper;
use crate::openai::{
    response_to_chunks, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage, ToolCallOut, Usage,
};
use crate::session::{
    raw_dispatch_signature, tools_signature, MirrorMessage, SessionDelta, SessionState,
};

const CANCELLED_MESSAGE: &str = "Cancelled.";
const NO_ACTIONS_MESSAGE: &str =
    "No further actions were produced; task may require another explicit user prompt.";
const UNABLE_MESSAGE: &str = "Unable to generate tool call.";

/// Context usage reported via `x-context-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStats {
    pub used: usize,
    pub budget: usize,
}

impl ContextStats {
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }
}

/// The reply body: a whole completion or a chunk stream (the server adds
/// SSE framing and the `[DONE]` sentinel).
pub enum ReplyBody {
    Full(ChatCompletionResponse),
    Stream(BoxStream<'static, ChatCompletionChunk>),
}

pub struct HandlerResponse {
    pub request_id: String,
    pub context: Option<ContextStats>,
    pub body: ReplyBody,
}

/// Request directives extracted (and stripped) from the last user message.
#[derive(Debug, Default, Clone)]
struct Directives {
    thinking: Option<bool>,
    web_search: Option<bool>,
    auto_web_search: Option<bool>,
    system_override: Option<String>,
    force_tool_result: bool,
    no_heuristics: bool,
}

/// Everything about the current request the flow methods need.
struct RequestCtx {
    model: String,
    stream: bool,
    thinking: bool,
    web_search: bool,
    auto_web_search: bool,
    has_tool_result: bool,
    tool_result_count: usize,
    last_user_text: String,
    registry: ToolRegistry,
    chat_id: String,
    feature_overrides: Option<Value>,
}

pub struct Handler {
    config: Config,
    backend: Arc<dyn ChatBackend>,
    guard: Guard,
    compactor: Compactor,
    dumper: Dumper,
    state: Mutex<SessionState>,
}

impl Handler {
    pub fn new(config: Config, backend: Arc<dyn ChatBackend>) -> Self {
        let guard = Guard::new(&config.proxy, &config.workspace);
        let compactor = Compactor::new(config.context.clone());
        let dumper = Dumper::new(config.proxy.debug, config.proxy.debug_dump_dir.clone());
        Self {
            config,
            backend,
            guard,
            compactor,
            dumper,
            state: Mutex::new(SessionState::new()),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.config.upstream.model
    }

    /// Handle one chat-completions request end to end.
    pub async fn handle(&self, req: ChatCompletionRequest) -> HandlerResponse {
        let request_id = Uuid::new_v4().to_string();
        let model = req
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.upstream.model.clone());
        let stream = req.stream;

        self.dumper.dump(
            "request",
            &json!({
                "request_id": request_id,
                "model": model,
                "stream": stream,
                "message_count": req.messages.len(),
                "tool_count": req.tools.as_ref().map(Vec::len).unwrap_or(0),
            }),
        );

        let mut messages = req.messages.clone();
        let directives = extract_directives(&mut messages, self.config.proxy.test_mode);

        // A live pending confirmation short-circuits everything else.
        if let Some(resp) = self.drain_confirmation(&messages, &model).await {
            return self.finish(request_id, None, resp, stream);
        }

        // Tool set per tool_choice and network policy.
        let mut tools: Vec<Value> = req.tools.clone().unwrap_or_default();
        apply_tool_choice(&mut tools, req.tool_choice.as_ref());
        if !self.config.proxy.allow_web_search {
            tools.retain(|t| !is_network_tool(t));
        }
        let mut registry = ToolRegistry::build(&tools);
        let offering_tools = !registry.is_empty();
        if offering_tools {
            registry.ensure_question_tool();
        }

        let tool_result_count = messages.iter().filter(|m| m.is_role("tool")).count();
        let last_user_text = messages
            .iter()
            .rev()
            .find(|m| m.is_role("user"))
            .map(ChatMessage::text)
            .unwrap_or_default();
        let has_tool_result = tool_result_count > 0
            || directives.force_tool_result
            || heuristics::has_tool_result_marker(&last_user_text);

        let thinking = directives
            .thinking
            .or(req.enable_thinking)
            .unwrap_or(self.config.proxy.default_thinking);
        let web_search = self.config.proxy.allow_web_search
            && directives.web_search.or(req.web_search).unwrap_or(false);
        let auto_web_search = self.config.proxy.allow_web_search
            && directives
                .auto_web_search
                .or(req.auto_web_search)
                .unwrap_or(false);

        // System text: the planner prompt when tools are offered, otherwise
        // only an explicit override / always-send setting.
        let system_text = if offering_tools {
            let roots = &self.config.workspace.roots;
            let cwd = roots.first().map(|r| r.to_string_lossy().to_string());
            let opts = PromptOptions {
                include_schema: self.config.proxy.tool_prompt_include_schema,
                schema_max_chars: self.config.proxy.tool_prompt_schema_max_chars,
                extra_system: directives.system_override.as_deref(),
                extra_system_max_chars: self.config.proxy.tool_prompt_extra_system_max_chars,
                workspace_cwd: cwd.as_deref(),
            };
            Some(build_system_prompt(&registry, &opts))
        } else if let Some(explicit) = &directives.system_override {
            Some(explicit.clone())
        } else if self.config.proxy.always_send_system {
            Some("You are a helpful assistant behind an OpenAI-compatible proxy.".to_string())
        } else {
            None
        };

        // Compact the caller conversation to the token budget.
        let (conversation, report) = self.compactor.compact(messages.clone());
        let context = Some(ContextStats {
            used: report.used_tokens,
            budget: self.compactor.budget(),
        });

        // Session delta + chat reuse decisions under one short lock.
        let signature = tools_signature(&tools, system_text.as_deref().unwrap_or(""));
        let prefix_len = {
            let mut st = self.state.lock().await;
            st.pending.collect_expired();
            let mirror = mirror_of(&req.messages);
            let mut reset = self.config.proxy.new_chat_per_request;
            if st.session_delta(&mirror) == SessionDelta::Divergent {
                debug!("session delta divergent; resetting upstream chat");
                reset = true;
            }
            if st.last_signature.as_deref() != Some(signature.as_str()) {
                debug!("tools/system signature changed; resetting upstream chat");
                reset = true;
            }
            if report.dropped > 0 && self.config.proxy.compact_reset {
                debug!(dropped = report.dropped, "compaction dropped turns; resetting upstream chat");
                reset = true;
            }
            if reset {
                st.reset_chat();
            }
            let prefix = if self.config.proxy.use_upstream_history && !reset {
                st.common_prefix_len(&mirror)
            } else {
                0
            };
            st.remember_messages(mirror, self.config.proxy.history_max_messages);
            st.last_signature = Some(signature);
            prefix
        };

        // Resolve the upstream chat id; creation happens outside the lock.
        let chat_id = match self.ensure_chat_id(&model).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "upstream chat creation failed");
                let resp = ChatCompletionResponse::text(&model, format!("Error: {e}"));
                return self.finish(request_id, context, resp, stream);
            }
        };

        let ctx = RequestCtx {
            model,
            stream,
            thinking,
            web_search,
            auto_web_search,
            has_tool_result,
            tool_result_count,
            last_user_text,
            registry,
            chat_id,
            feature_overrides: req.features.clone(),
        };

        if offering_tools {
            let resp = self
                .tool_flow(&ctx, system_text.as_deref(), &conversation, prefix_len, &directives)
                .await;
            self.finish(request_id, context, resp, stream)
        } else {
            self.passthrough_flow(&ctx, system_text.as_deref(), &conversation, prefix_len, request_id, context)
                .await
        }
    }

    // ── Confirmation drain ───────────────────────────────────────────────────

    /// If the last message answers a live pending confirmation, consume it:
    /// affirmative replays the stored batch verbatim, anything else cancels.
    async fn drain_confirmation(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Option<ChatCompletionResponse> {
        let last = messages.last()?;
        if !last.is_role("tool") {
            return None;
        }
        let id = last.tool_call_id.as_deref()?;
        let entry = {
            let mut st = self.state.lock().await;
            st.pending.take(id)?
        };
        match parse_confirmation_reply(&last.text()) {
            ConfirmationReply::Affirmative => {
                debug!(tool_call_id = %id, "confirmation affirmative; replaying stored batch");
                let calls = entry
                    .calls
                    .iter()
                    .enumerate()
                    .map(|(i, c)| ToolCallOut::new(i, &c.tool, &c.args))
                    .collect();
                Some(ChatCompletionResponse::tool_calls(model, calls))
            }
            ConfirmationReply::Declined => {
                debug!(tool_call_id = %id, "confirmation declined");
                Some(ChatCompletionResponse::text(model, CANCELLED_MESSAGE))
            }
        }
    }

    // ── Chat lifetime ────────────────────────────────────────────────────────

    async fn ensure_chat_id(&self, model: &str) -> anyhow::Result<String> {
        if let Some(id) = self.state.lock().await.active_chat_id.clone() {
            return Ok(id);
        }
        let id = self.backend.ensure_chat("proxy session", model).await?;
        self.state.lock().await.active_chat_id = Some(id.clone());
        Ok(id)
    }

    // ── Tool flow ────────────────────────────────────────────────────────────

    async fn tool_flow(
        &self,
        ctx: &RequestCtx,
        system_text: Option<&str>,
        conversation: &[ChatMessage],
        prefix_len: usize,
        directives: &Directives,
    ) -> ChatCompletionResponse {
        // User-authored planner JSON naming an unknown tool fails fast.
        if let Some(out) = parse_planner_output(&ctx.last_user_text, false) {
            if let Some(bad) = out
                .actions
                .iter()
                .find(|a| ctx.registry.lookup(&a.tool).is_none())
            {
                return ChatCompletionResponse::text(
                    &ctx.model,
                    format!("Unknown tool: {}", bad.tool),
                );
            }
        }

        // Explicit `% tool` directive dispatches without a model turn.
        if let Some(call) = heuristics::explicit_tool_call(&ctx.last_user_text, &ctx.registry) {
            if let Some(resp) = self.dispatch(ctx, vec![call], CallSource::Explicit).await {
                return resp;
            }
        }

        // Inferred read/list/search calls, unless disabled for this turn.
        let heuristics_enabled = self.config.proxy.allow_user_heuristics
            && !directives.no_heuristics
            && !ctx.has_tool_result;
        if heuristics_enabled {
            if let Some(call) = heuristics::infer_tool_call(&ctx.last_user_text, &ctx.registry) {
                if let Some(resp) = self.dispatch(ctx, vec![call], CallSource::Heuristic).await {
                    return resp;
                }
            }
        }

        self.planner_loop(ctx, system_text, conversation, prefix_len).await
    }

    async fn planner_loop(
        &self,
        ctx: &RequestCtx,
        system_text: Option<&str>,
        conversation: &[ChatMessage],
        prefix_len: usize,
    ) -> ChatCompletionResponse {
        let retries = self.config.proxy.planner_max_retries;
        let mut wire = self.build_wire_messages(ctx, system_text, conversation, prefix_len, true);
        let mut attempt = 0usize;
        let mut recovery_attempted = false;
        let mut last_text = String::new();

        loop {
            let text = match self.collect_completion(ctx, &wire).await {
                Ok((content, _thinking)) => content,
                Err(reason) => {
                    return ChatCompletionResponse::text(&ctx.model, format!("Error: {reason}"))
                }
            };
            last_text = text.clone();

            // Raw tool-call arrays are accepted opportunistically.
            if let Some(calls) = parse_raw_tool_calls(&text, &ctx.registry) {
                if ctx.tool_result_count >= self.config.proxy.tool_loop_limit {
                    return self.final_answer_turn(ctx, &mut wire).await;
                }
                if let Some(resp) = self.dispatch(ctx, calls, CallSource::Raw).await {
                    return resp;
                }
                debug!("raw dispatch suppressed; falling through to planner parsing");
            }

            match parse_planner_output(&text, false) {
                Some(out) if !out.actions.is_empty() => {
                    match self.handle_actions(ctx, out.actions, &mut wire, &mut attempt).await {
                        ActionsVerdict::Respond(resp) => return resp,
                        ActionsVerdict::Retry => continue,
                    }
                }
                Some(out) => {
                    let final_text = out.final_text.unwrap_or_default();
                    if ctx.has_tool_result && final_text.trim().is_empty() {
                        // One recovery turn asking the model to act.
                        if !recovery_attempted {
                            recovery_attempted = true;
                            wire.push(ChatMessage::new("assistant", text));
                            wire.push(ChatMessage::system(
                                "The tool results are in; continue the task now. \
                                 Produce the next planner JSON object with either actions \
                                 or a non-empty final answer.",
                            ));
                            continue;
                        }
                        return ChatCompletionResponse::text(&ctx.model, NO_ACTIONS_MESSAGE);
                    }
                    if !ctx.has_tool_result {
                        return self.direct_answer_turn(ctx, conversation, prefix_len, final_text).await;
                    }
                    return ChatCompletionResponse::text(&ctx.model, final_text);
                }
                None => {
                    if attempt < retries {
                        wire.push(ChatMessage::new("assistant", text));
                        wire.push(ChatMessage::system(prompt::retry_system_prompt(attempt + 1)));
                        attempt += 1;
                        continue;
                    }
                    if self.config.proxy.planner_coerce {
                        if let Some(out) = parse_planner_output(&last_text, true) {
                            let final_text = out.final_text.unwrap_or_default();
                            if !final_text.trim().is_empty() {
                                return ChatCompletionResponse::text(&ctx.model, final_text);
                            }
                        }
                    }
                    return ChatCompletionResponse::text(&ctx.model, UNABLE_MESSAGE);
                }
            }
        }
    }

    /// Apply the planner-action policy filters and dispatch through the
    /// guard, or request a retry when the actions are unusable.
    async fn handle_actions(
        &self,
        ctx: &RequestCtx,
        actions: Vec<Action>,
        wire: &mut Vec<ChatMessage>,
        attempt: &mut usize,
    ) -> ActionsVerdict {
        let mut actions = actions;
        actions.retain(|a| !is_noop_edit(a));
        // The todo tool is only honored when the user actually asked for a
        // todo list; models love inventing them.
        if !ctx.last_user_text.to_ascii_lowercase().contains("todo") {
            actions.retain(|a| normalize_name(&a.tool) != "todowrite");
        }
        if actions.is_empty() {
            return ActionsVerdict::Respond(ChatCompletionResponse::text(
                &ctx.model,
                NO_ACTIONS_MESSAGE,
            ));
        }

        if let Some(bad) = actions
            .iter()
            .find(|a| ctx.registry.lookup(&a.tool).is_none())
        {
            if *attempt < self.config.proxy.planner_max_retries {
                wire.push(ChatMessage::system(format!(
                    "The tool \"{}\" does not exist. Use only the allowed tools.",
                    bad.tool
                )));
                *attempt += 1;
                return ActionsVerdict::Retry;
            }
            return ActionsVerdict::Respond(ChatCompletionResponse::text(
                &ctx.model,
                format!("Unknown tool: {}", bad.tool),
            ));
        }

        if ctx.tool_result_count >= self.config.proxy.tool_loop_limit {
            return ActionsVerdict::Respond(self.final_answer_turn(ctx, wire).await);
        }

        let calls: Vec<ParsedCall> = actions
            .iter()
            .map(|a| {
                // Lookup is infallible here (checked above).
                let info = ctx.registry.lookup(&a.tool).expect("action tool resolved");
                ParsedCall {
                    tool: info.name.clone(),
                    args: ctx
                        .registry
                        .normalize_args_for_tool(info, a.args.clone()),
                }
            })
            .collect();

        match self.dispatch(ctx, calls, CallSource::Planner).await {
            Some(resp) => ActionsVerdict::Respond(resp),
            // Planner dispatch never suppresses; this arm is unreachable in
            // practice but degrades to the neutral message.
            None => ActionsVerdict::Respond(ChatCompletionResponse::text(
                &ctx.model,
                NO_ACTIONS_MESSAGE,
            )),
        }
    }

    // ── Guard dispatch ───────────────────────────────────────────────────────

    /// Validate a batch and produce the response for its outcome.
    ///
    /// Returns `None` only for a suppressed duplicate raw dispatch — the
    /// caller falls through to planner prose.
    async fn dispatch(
        &self,
        ctx: &RequestCtx,
        calls: Vec<ParsedCall>,
        source: CallSource,
    ) -> Option<ChatCompletionResponse> {
        match self.guard.validate(&calls, source, &ctx.registry) {
            GuardOutcome::Ok(calls) => {
                if source == CallSource::Raw && ctx.has_tool_result {
                    let signature = raw_dispatch_signature(&calls);
                    let mut st = self.state.lock().await;
                    let repeat = st.last_dispatch.as_ref().is_some_and(|d| {
                        d.signature == signature && d.last_user == ctx.last_user_text
                    });
                    if repeat {
                        debug!("suppressing duplicate raw tool-call dispatch");
                        return None;
                    }
                    st.last_dispatch = Some(crate::session::DispatchRecord {
                        signature,
                        last_user: ctx.last_user_text.clone(),
                    });
                }
                let out: Vec<ToolCallOut> = calls
                    .iter()
                    .enumerate()
                    .map(|(i, c)| ToolCallOut::new(i, &c.tool, &c.args))
                    .collect();
                self.dumper.dump(
                    "response_tool_calls",
                    &json!({
                        "source": format!("{source:?}"),
                        "calls": calls.iter().map(|c| json!({"tool": c.tool, "args": c.args})).collect::<Vec<_>>(),
                    }),
                );
                Some(ChatCompletionResponse::tool_calls(&ctx.model, out))
            }
            GuardOutcome::Blocked(reason) => {
                self.dumper
                    .dump("guard_block", &json!({"reason": reason.to_string()}));
                Some(ChatCompletionResponse::text(
                    &ctx.model,
                    format!("Blocked unsafe tool call ({reason})."),
                ))
            }
            GuardOutcome::ConfirmationRequired {
                reason,
                question,
                calls,
            } => {
                let question_name = ctx
                    .registry
                    .lookup("question")
                    .map(|i| i.name.clone())
                    .unwrap_or_else(|| "question".into());
                let call = ToolCallOut::new(
                    0,
                    &question_name,
                    &json!({ "question": question, "questions": [question] }),
                );
                {
                    let mut st = self.state.lock().await;
                    st.pending
                        .insert(call.id.clone(), calls, reason.to_string());
                }
                self.dumper.dump(
                    "pending_confirmation_set",
                    &json!({"tool_call_id": call.id, "reason": reason.to_string()}),
                );
                Some(ChatCompletionResponse::tool_calls(&ctx.model, vec![call]))
            }
        }
    }

    // ── Auxiliary model turns ────────────────────────────────────────────────

    /// Tool budget exhausted: one final tool-free turn for a text answer.
    async fn final_answer_turn(
        &self,
        ctx: &RequestCtx,
        wire: &mut Vec<ChatMessage>,
    ) -> ChatCompletionResponse {
        wire.push(ChatMessage::system(
            "The tool budget for this task is exhausted. Do not request more tools; \
             summarize the result for the user as plain text.",
        ));
        match self.collect_completion(ctx, wire).await {
            Ok((content, _)) => {
                let text = prose_of(&content);
                ChatCompletionResponse::text(&ctx.model, text)
            }
            Err(reason) => ChatCompletionResponse::text(&ctx.model, format!("Error: {reason}")),
        }
    }

    /// The planner answered without actions on a fresh user turn: ask once
    /// more without the planner contract so the user gets clean prose.
    async fn direct_answer_turn(
        &self,
        ctx: &RequestCtx,
        conversation: &[ChatMessage],
        prefix_len: usize,
        planner_final: String,
    ) -> ChatCompletionResponse {
        let wire = self.build_wire_messages(ctx, None, conversation, prefix_len, false);
        match self.collect_completion(ctx, &wire).await {
            Ok((content, _)) if !content.trim().is_empty() => {
                ChatCompletionResponse::text(&ctx.model, content)
            }
            _ => ChatCompletionResponse::text(&ctx.model, planner_final),
        }
    }

    // ── Passthrough (no tools) ───────────────────────────────────────────────

    async fn passthrough_flow(
        &self,
        ctx: &RequestCtx,
        system_text: Option<&str>,
        conversation: &[ChatMessage],
        prefix_len: usize,
        request_id: String,
        context: Option<ContextStats>,
    ) -> HandlerResponse {
        let wire = self.build_wire_messages(ctx, system_text, conversation, prefix_len, false);

        if !ctx.stream {
            let resp = match self.collect_completion(ctx, &wire).await {
                Ok((content, _)) => {
                    let mut resp = ChatCompletionResponse::text(&ctx.model, content);
                    self.attach_usage(&mut resp, &wire);
                    resp
                }
                Err(reason) => {
                    ChatCompletionResponse::text(&ctx.model, format!("Error: {reason}"))
                }
            };
            return self.finish(request_id, context, resp, false);
        }

        // Live streaming: upstream chunks map 1:1 onto SSE deltas, with
        // thinking mirrored into `reasoning_content`.
        let id = crate::openai::fresh_completion_id();
        let created = crate::openai::unix_timestamp();
        let model = ctx.model.clone();
        let include_usage = self.config.proxy.include_usage;
        let prompt_tokens: usize = wire.iter().map(Compactor::estimate_message).sum();
        let opts = self.send_options(ctx, &wire);
        let backend = Arc::clone(&self.backend);

        let (tx, rx) = mpsc::channel::<ChatCompletionChunk>(64);
        tokio::spawn(async move {
            let _ = tx
                .send(ChatCompletionChunk::role(&id, created, &model))
                .await;
            let mut upstream = backend.send(opts).await;
            let mut completion_chars = 0usize;
            while let Some(chunk) = upstream.next().await {
                let out = match chunk {
                    StreamChunk::Thinking(t) => {
                        Some(ChatCompletionChunk::reasoning(&id, created, &model, t))
                    }
                    StreamChunk::ThinkingEnd => None,
                    StreamChunk::Content(t) => {
                        completion_chars += t.len();
                        Some(ChatCompletionChunk::content(&id, created, &model, t))
                    }
                    StreamChunk::Error(reason) => {
                        let msg = format!("Error: {reason}");
                        completion_chars += msg.len();
                        Some(ChatCompletionChunk::content(&id, created, &model, msg))
                    }
                    StreamChunk::Done => break,
                };
                if let Some(out) = out {
                    // A closed receiver means the client disconnected; stop
                    // reading so the upstream connection is torn down.
                    if tx.send(out).await.is_err() {
                        return;
                    }
                }
            }
            let mut finish = ChatCompletionChunk::finish(&id, created, &model, "stop");
            if include_usage {
                let completion_tokens = completion_chars.div_ceil(4);
                finish.usage = Some(Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                });
            }
            let _ = tx.send(finish).await;
        });

        HandlerResponse {
            request_id,
            context,
            body: ReplyBody::Stream(Box::pin(ReceiverStream::new(rx))),
        }
    }

    // ── Upstream plumbing ────────────────────────────────────────────────────

    fn send_options(&self, ctx: &RequestCtx, wire: &[ChatMessage]) -> SendMessageOptions {
        SendMessageOptions {
            chat_id: ctx.chat_id.clone(),
            messages: wire
                .iter()
                .map(|m| json!({"role": m.role, "content": m.text()}))
                .collect(),
            model: ctx.model.clone(),
            stream: true,
            enable_thinking: ctx.thinking,
            include_history: self.config.proxy.use_upstream_history,
            parent_message_id: None,
            generation_params: None,
            features: Some(merge_features(
                ctx.web_search,
                ctx.auto_web_search,
                ctx.feature_overrides.as_ref(),
            )),
        }
    }

    /// Send and fully accumulate one completion (even when the client asked
    /// for streaming — tool decisions need the whole text).
    async fn collect_completion(
        &self,
        ctx: &RequestCtx,
        wire: &[ChatMessage],
    ) -> Result<(String, String), String> {
        let mut stream = self.backend.send(self.send_options(ctx, wire)).await;
        let mut content = String::new();
        let mut thinking = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Thinking(t) => thinking.push_str(&t),
                StreamChunk::ThinkingEnd => {}
                StreamChunk::Content(t) => content.push_str(&t),
                StreamChunk::Done => break,
                StreamChunk::Error(reason) => return Err(reason),
            }
        }
        Ok((content, thinking))
    }

    /// Assemble the upstream message list: system text, the (possibly
    /// delta-sliced) conversation, and the post-tool reminder.
    fn build_wire_messages(
        &self,
        ctx: &RequestCtx,
        system_text: Option<&str>,
        conversation: &[ChatMessage],
        prefix_len: usize,
        with_post_tool: bool,
    ) -> Vec<ChatMessage> {
        let mut wire: Vec<ChatMessage> = Vec::new();
        if let Some(sys) = system_text {
            wire.push(ChatMessage::system(sys));
        }

        if self.config.proxy.strip_history && !ctx.has_tool_result {
            if let Some(last) = conversation.iter().rev().find(|m| m.is_role("user")) {
                wire.push(ChatMessage::user(last.text()));
            }
        } else {
            let slice = if prefix_len > 0 && prefix_len < conversation.len() {
                &conversation[prefix_len..]
            } else {
                &conversation[..]
            };
            for msg in slice {
                wire.push(textualize(msg));
            }
        }

        if with_post_tool && ctx.has_tool_result {
            wire.push(ChatMessage::system(prompt::POST_TOOL_SYSTEM));
        }
        wire
    }

    fn attach_usage(&self, resp: &mut ChatCompletionResponse, wire: &[ChatMessage]) {
        if !self.config.proxy.include_usage {
            return;
        }
        let prompt_tokens: usize = wire.iter().map(Compactor::estimate_message).sum();
        let completion_text = resp
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let completion_tokens = estimate_text_tokens(&completion_text);
        resp.usage = Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        });
    }

    fn finish(
        &self,
        request_id: String,
        context: Option<ContextStats>,
        mut resp: ChatCompletionResponse,
        stream: bool,
    ) -> HandlerResponse {
        if resp.usage.is_none() && self.config.proxy.include_usage {
            let completion_text = resp
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default();
            let completion_tokens = estimate_text_tokens(&completion_text);
            resp.usage = Some(Usage {
                prompt_tokens: context.map(|c| c.used).unwrap_or(0),
                completion_tokens,
                total_tokens: context.map(|c| c.used).unwrap_or(0) + completion_tokens,
            });
        }
        let body = if stream {
            let chunks = response_to_chunks(&resp);
            ReplyBody::Stream(Box::pin(futures::stream::iter(chunks)))
        } else {
            ReplyBody::Full(resp)
        };
        HandlerResponse {
            request_id,
            context,
            body,
        }
    }
}

enum ActionsVerdict {
    Respond(ChatCompletionResponse),
    Retry,
}

// ─── Free helpers ────────────────────────────────────────────────────────────

/// Web-search flags plus any caller feature overrides for the upstream.
fn merge_features(web_search: bool, auto_web_search: bool, overrides: Option<&Value>) -> Value {
    let mut features = json!({
        "web_search": web_search,
        "auto_web_search": auto_web_search,
    });
    if let Some(Value::Object(map)) = overrides {
        for (k, v) in map {
            features[k.as_str()] = v.clone();
        }
    }
    features
}

/// Role + text mirror of the caller conversation for the session delta.
fn mirror_of(messages: &[ChatMessage]) -> Vec<MirrorMessage> {
    messages
        .iter()
        .map(|m| MirrorMessage {
            role: m.role.clone(),
            text: m.text(),
        })
        .collect()
}

/// Convert tool-protocol messages into plain text the upstream understands.
fn textualize(msg: &ChatMessage) -> ChatMessage {
    if msg.is_role("tool") {
        let id = msg.tool_call_id.as_deref().unwrap_or("unknown");
        return ChatMessage::user(format!("[tool result for {id}]\n{}", msg.text()));
    }
    if let Some(calls) = &msg.tool_calls {
        let described: Vec<String> = calls
            .iter()
            .map(|c| format!("[called {}({})]", c.function.name, c.function.arguments))
            .collect();
        let mut text = msg.text();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&described.join("\n"));
        return ChatMessage::new("assistant", text);
    }
    msg.clone()
}

fn apply_tool_choice(tools: &mut Vec<Value>, choice: Option<&Value>) {
    match choice {
        Some(Value::String(s)) if s == "none" => tools.clear(),
        Some(v) => {
            if let Some(name) = v["function"]["name"].as_str() {
                let target = normalize_name(name);
                tools.retain(|t| {
                    t["function"]["name"]
                        .as_str()
                        .or_else(|| t["name"].as_str())
                        .map(|n| normalize_name(n) == target)
                        .unwrap_or(false)
                });
            }
        }
        None => {}
    }
}

fn is_network_tool(tool: &Value) -> bool {
    let name = tool["function"]["name"]
        .as_str()
        .or_else(|| tool["name"].as_str())
        .unwrap_or("");
    matches!(normalize_name(name).as_str(), "webfetch" | "websearch")
}

/// An edit action whose old and new payloads are identical does nothing.
fn is_noop_edit(action: &Action) -> bool {
    if !normalize_name(&action.tool).starts_with("edit") {
        return false;
    }
    for (old_key, new_key) in [
        ("old_string", "new_string"),
        ("oldText", "newText"),
        ("old", "new"),
    ] {
        if let (Some(old), Some(new)) =
            (action.args[old_key].as_str(), action.args[new_key].as_str())
        {
            return old == new;
        }
    }
    false
}

/// Strip planner-JSON residue from a text that should be prose.
fn prose_of(text: &str) -> String {
    if let Some(out) = parse_planner_output(text, false) {
        if let Some(f) = out.final_text {
            if !f.trim().is_empty() {
                return f;
            }
        }
    }
    text.to_string()
}

/// Pull `/thinking`, `/search`, `/web_search` (and in test mode `/system`,
/// `/test …`) directive lines out of the last user message.
fn extract_directives(messages: &mut [ChatMessage], test_mode: bool) -> Directives {
    let mut d = Directives::default();
    let Some(last) = messages.iter_mut().rev().find(|m| m.is_role("user")) else {
        return d;
    };
    let text = last.text();
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("/thinking ") {
            d.thinking = parse_on_off(rest);
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("/web_search ") {
            d.auto_web_search = parse_on_off(rest);
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("/search ") {
            d.web_search = parse_on_off(rest);
            continue;
        }
        if test_mode {
            if let Some(rest) = trimmed.strip_prefix("/system ") {
                d.system_override = Some(rest.to_string());
                continue;
            }
            if trimmed == "/test tool_result" {
                d.force_tool_result = true;
                continue;
            }
            if trimmed == "/test no-heuristics" {
                d.no_heuristics = true;
                continue;
            }
        }
        kept.push(line);
    }
    let stripped = kept.join("\n");
    if stripped != text {
        last.content = Some(Value::String(stripped.trim().to_string()));
    }
    d
}

fn parse_on_off(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use serde_json::json;

    fn tool_decl(name: &str, params: &[&str]) -> Value {
        let mut props = serde_json::Map::new();
        for p in params {
            props.insert(p.to_string(), json!({ "type": "string" }));
        }
        json!({
            "type": "function",
            "function": { "name": name,
                           "parameters": { "type": "object", "properties": props } }
        })
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.workspace.roots = vec![std::path::PathBuf::from("/work/project")];
        config
    }

    fn handler_with(backend: Arc<MockBackend>, tweak: impl FnOnce(&mut Config)) -> Handler {
        let mut config = test_config();
        tweak(&mut config);
        Handler::new(config, backend)
    }

    fn request(messages: Vec<ChatMessage>, tools: Vec<Value>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            ..Default::default()
        }
    }

    fn full(resp: HandlerResponse) -> ChatCompletionResponse {
        match resp.body {
            ReplyBody::Full(r) => r,
            ReplyBody::Stream(_) => panic!("expected full response"),
        }
    }

    fn first_call(resp: &ChatCompletionResponse) -> &ToolCallOut {
        resp.choices[0]
            .message
            .tool_calls
            .as_ref()
            .expect("tool calls present")
            .first()
            .expect("at least one call")
    }

    // ── Heuristic short-circuit ──────────────────────────────────────────────

    #[tokio::test]
    async fn read_heuristic_short_circuits_the_model() {
        let backend = Arc::new(MockBackend::new());
        let h = handler_with(Arc::clone(&backend), |_| {});
        let req = request(
            vec![ChatMessage::user("read README.md")],
            vec![tool_decl("read", &["filePath"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(resp.finish_reason(), "tool_calls");
        let call = first_call(&resp);
        assert_eq!(call.function.name, "read");
        assert_eq!(call.function.arguments, r#"{"filePath":"README.md"}"#);
        assert_eq!(backend.request_count(), 0, "no model turn was needed");
    }

    #[tokio::test]
    async fn heuristics_can_be_disabled() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"plan": [], "actions": [], "final": "from the model"}"#,
        ]));
        let h = handler_with(Arc::clone(&backend), |c| {
            c.proxy.allow_user_heuristics = false;
        });
        let req = request(
            vec![ChatMessage::user("read README.md")],
            vec![tool_decl("read", &["filePath"])],
        );
        let resp = full(h.handle(req).await);
        // Planner said answer-only on a fresh turn → one direct-answer turn
        // follows; the mock script is exhausted so the planner final wins.
        assert_eq!(resp.finish_reason(), "stop");
        assert!(backend.request_count() >= 1);
    }

    // ── Planner flow ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn planner_actions_become_tool_calls() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"plan": ["look"], "actions": [{"tool": "read", "args": {"path": "src/main.rs"}, "why": "", "expect": "", "safety": {"risk": "low", "notes": ""}}]}"#,
        ]));
        let h = handler_with(Arc::clone(&backend), |_| {});
        let req = request(
            vec![ChatMessage::user("what does main do?")],
            vec![tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(resp.finish_reason(), "tool_calls");
        assert_eq!(first_call(&resp).function.name, "read");
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn absolute_workspace_path_is_rewritten() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"actions": [{"tool": "read", "args": {"path": "/work/project/src/main.rs"}}]}"#,
        ]));
        let h = handler_with(backend, |_| {});
        let req = request(
            vec![ChatMessage::user("inspect main please")],
            vec![tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(
            first_call(&resp).function.arguments,
            r#"{"path":"src/main.rs"}"#
        );
    }

    #[tokio::test]
    async fn mutation_batch_is_truncated_to_one_call() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"actions": [
                {"tool": "write", "args": {"path": "a.txt", "content": "1"}},
                {"tool": "write", "args": {"path": "b.txt", "content": "2"}},
                {"tool": "read", "args": {"path": "c.txt"}}
            ]}"#,
        ]));
        let h = handler_with(backend, |_| {});
        let req = request(
            vec![ChatMessage::user("update the files")],
            vec![tool_decl("write", &["path", "content"]), tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "write");
        assert!(calls[0].function.arguments.contains("a.txt"));
    }

    #[tokio::test]
    async fn dangerous_command_requires_confirmation_then_replays() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"actions": [{"tool": "run_shell", "args": {"command": "rm -rf tmp"}}]}"#,
        ]));
        let h = handler_with(backend, |_| {});
        let tools = vec![
            tool_decl("run_shell", &["command"]),
            tool_decl("askquestion", &["question", "questions"]),
        ];

        let req = request(vec![ChatMessage::user("clean the tmp dir")], tools.clone());
        let resp = full(h.handle(req).await);
        assert_eq!(resp.finish_reason(), "tool_calls");
        let question = first_call(&resp).clone();
        assert!(question.function.arguments.contains("rm -rf tmp"));

        // Next request answers the question affirmatively.
        let mut answer = ChatMessage::new("tool", "yes");
        answer.tool_call_id = Some(question.id.clone());
        let req2 = request(
            vec![ChatMessage::user("clean the tmp dir"), answer],
            tools,
        );
        let resp2 = full(h.handle(req2).await);
        assert_eq!(resp2.finish_reason(), "tool_calls");
        let replay = first_call(&resp2);
        assert_eq!(replay.function.name, "run_shell");
        assert!(replay.function.arguments.contains("rm -rf tmp"));
    }

    #[tokio::test]
    async fn declined_confirmation_cancels() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"actions": [{"tool": "run_shell", "args": {"command": "rm -rf tmp"}}]}"#,
        ]));
        let h = handler_with(backend, |_| {});
        let tools = vec![tool_decl("run_shell", &["command"])];
        let resp = full(
            h.handle(request(vec![ChatMessage::user("wipe tmp")], tools.clone()))
                .await,
        );
        let question = first_call(&resp).clone();

        let mut answer = ChatMessage::new("tool", "no, don't");
        answer.tool_call_id = Some(question.id);
        let resp2 = full(h.handle(request(vec![answer], tools)).await);
        assert_eq!(
            resp2.choices[0].message.content.as_deref(),
            Some("Cancelled.")
        );
    }

    #[tokio::test]
    async fn answer_only_plan_with_tool_results_emits_final() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"plan": [], "actions": [], "final": "All done: 3 files changed."}"#,
        ]));
        let h = handler_with(backend, |_| {});
        let mut tool_msg = ChatMessage::new("tool", "wrote a.txt");
        tool_msg.tool_call_id = Some("call_prev".into());
        let req = request(
            vec![ChatMessage::user("apply the change"), tool_msg],
            vec![tool_decl("write", &["path", "content"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("All done: 3 files changed.")
        );
    }

    #[tokio::test]
    async fn empty_planner_reply_after_tool_results_gets_recovery_turn() {
        let backend = Arc::new(MockBackend::with_replies(&[
            r#"{"plan": [], "actions": [], "final": ""}"#,
            r#"{"plan": [], "actions": [], "final": ""}"#,
        ]));
        let h = handler_with(Arc::clone(&backend), |_| {});
        let mut tool_msg = ChatMessage::new("tool", "ok");
        tool_msg.tool_call_id = Some("call_prev".into());
        let req = request(
            vec![ChatMessage::user("continue"), tool_msg],
            vec![tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(backend.request_count(), 2, "one recovery turn happened");
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some(NO_ACTIONS_MESSAGE)
        );
    }

    #[tokio::test]
    async fn hopeless_planner_output_reports_unable() {
        let backend = Arc::new(MockBackend::with_replies(&["garbage", "more garbage", "still garbage"]));
        let h = handler_with(backend, |c| {
            c.proxy.planner_coerce = false;
            c.proxy.planner_max_retries = 2;
        });
        let mut tool_msg = ChatMessage::new("tool", "out");
        tool_msg.tool_call_id = Some("c".into());
        let req = request(
            vec![ChatMessage::user("go"), tool_msg],
            vec![tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some(UNABLE_MESSAGE)
        );
    }

    #[tokio::test]
    async fn prose_is_coerced_after_retries() {
        let backend = Arc::new(MockBackend::with_replies(&["I simply cannot produce JSON."]));
        let h = handler_with(backend, |c| {
            c.proxy.planner_max_retries = 0;
            c.proxy.planner_coerce = true;
        });
        let mut tool_msg = ChatMessage::new("tool", "out");
        tool_msg.tool_call_id = Some("c".into());
        let req = request(
            vec![ChatMessage::user("go"), tool_msg],
            vec![tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("I simply cannot produce JSON.")
        );
    }

    // ── Raw tool-call dedup ──────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_raw_dispatch_is_suppressed() {
        let raw = r#"[{"function": {"name": "read", "arguments": "{\"path\": \"README.md\"}"}}]"#;
        let backend = Arc::new(MockBackend::with_replies(&[raw, raw]));
        let h = handler_with(Arc::clone(&backend), |c| {
            c.proxy.planner_max_retries = 0;
            c.proxy.planner_coerce = true;
        });
        let mut tool_msg = ChatMessage::new("tool", "previous result");
        tool_msg.tool_call_id = Some("c1".into());
        let messages = vec![ChatMessage::user("keep going"), tool_msg];
        let tools = vec![tool_decl("read", &["path"])];

        let resp1 = full(h.handle(request(messages.clone(), tools.clone())).await);
        assert_eq!(resp1.finish_reason(), "tool_calls", "first raw batch dispatches");

        let resp2 = full(h.handle(request(messages, tools)).await);
        assert_eq!(
            resp2.finish_reason(),
            "stop",
            "identical raw batch is suppressed and falls through to prose"
        );
    }

    // ── Misc flows ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_in_user_planner_json_fails_fast() {
        let backend = Arc::new(MockBackend::new());
        let h = handler_with(Arc::clone(&backend), |_| {});
        let req = request(
            vec![ChatMessage::user(
                r#"{"actions": [{"tool": "teleport", "args": {}}]}"#,
            )],
            vec![tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("Unknown tool: teleport")
        );
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn explicit_directive_dispatches_without_model() {
        let backend = Arc::new(MockBackend::new());
        let h = handler_with(Arc::clone(&backend), |_| {});
        let req = request(
            vec![ChatMessage::user("% read: {\"path\": \"Cargo.toml\"}")],
            vec![tool_decl("read", &["path"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(resp.finish_reason(), "tool_calls");
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn no_tool_request_passes_content_through() {
        let backend = Arc::new(MockBackend::with_replies(&["Hello there!"]));
        let h = handler_with(backend, |_| {});
        let req = request(vec![ChatMessage::user("hi")], vec![]);
        let resp = full(h.handle(req).await);
        assert_eq!(resp.finish_reason(), "stop");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello there!"));
    }

    #[tokio::test]
    async fn upstream_error_becomes_content_reply() {
        let backend = Arc::new(MockBackend::new());
        backend.push_script(vec![StreamChunk::Error("request_failed:502".into())]);
        let h = handler_with(backend, |_| {});
        let req = request(vec![ChatMessage::user("hi")], vec![]);
        let resp = full(h.handle(req).await);
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("Error: request_failed:502")
        );
    }

    #[tokio::test]
    async fn streaming_no_tool_flow_mirrors_thinking() {
        let backend = Arc::new(MockBackend::new());
        backend.push_script(vec![
            StreamChunk::Thinking("pondering".into()),
            StreamChunk::ThinkingEnd,
            StreamChunk::Content("answer".into()),
            StreamChunk::Done,
        ]);
        let h = handler_with(backend, |_| {});
        let mut req = request(vec![ChatMessage::user("hi")], vec![]);
        req.stream = true;
        let resp = h.handle(req).await;
        let chunks: Vec<ChatCompletionChunk> = match resp.body {
            ReplyBody::Stream(s) => s.collect().await,
            ReplyBody::Full(_) => panic!("expected stream"),
        };
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(chunks
            .iter()
            .any(|c| c.choices[0].delta.reasoning_content.as_deref() == Some("pondering")));
        assert!(chunks
            .iter()
            .any(|c| c.choices[0].delta.content.as_deref() == Some("answer")));
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason.as_deref(),
            Some("stop")
        );
    }

    #[tokio::test]
    async fn tool_choice_none_drops_tools() {
        let backend = Arc::new(MockBackend::with_replies(&["plain answer"]));
        let h = handler_with(Arc::clone(&backend), |_| {});
        let mut req = request(
            vec![ChatMessage::user("read README.md")],
            vec![tool_decl("read", &["path"])],
        );
        req.tool_choice = Some(json!("none"));
        let resp = full(h.handle(req).await);
        assert_eq!(resp.finish_reason(), "stop");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("plain answer"));
    }

    #[tokio::test]
    async fn network_tools_are_filtered_when_search_disabled() {
        // With only webfetch offered and web search off, the tool list is
        // empty and the request becomes a passthrough.
        let backend = Arc::new(MockBackend::with_replies(&["no tools here"]));
        let h = handler_with(Arc::clone(&backend), |_| {});
        let req = request(
            vec![ChatMessage::user("fetch https://example.com")],
            vec![tool_decl("webfetch", &["url", "format"])],
        );
        let resp = full(h.handle(req).await);
        assert_eq!(resp.finish_reason(), "stop");
    }

    #[tokio::test]
    async fn usage_is_attached_when_enabled() {
        let backend = Arc::new(MockBackend::with_replies(&["four score"]));
        let h = handler_with(backend, |c| c.proxy.include_usage = true);
        let req = request(vec![ChatMessage::user("speech please")], vec![]);
        let resp = full(h.handle(req).await);
        let usage = resp.usage.expect("usage attached");
        assert!(usage.completion_tokens > 0);
        assert_eq!(
            usage.total_tokens,
            usage.prompt_tokens + usage.completion_tokens
        );
    }

    #[tokio::test]
    async fn request_id_and_context_are_reported() {
        let backend = Arc::new(MockBackend::with_replies(&["x"]));
        let h = handler_with(backend, |_| {});
        let resp = h
            .handle(request(vec![ChatMessage::user("hello")], vec![]))
            .await;
        assert!(!resp.request_id.is_empty());
        let ctx = resp.context.expect("context stats");
        assert!(ctx.budget > 0);
        assert!(ctx.remaining() <= ctx.budget);
    }

    // ── Directive extraction ─────────────────────────────────────────────────

    #[test]
    fn thinking_directive_is_extracted_and_stripped() {
        let mut msgs = vec![ChatMessage::user("/thinking off\nexplain monads")];
        let d = extract_directives(&mut msgs, false);
        assert_eq!(d.thinking, Some(false));
        assert_eq!(msgs[0].text(), "explain monads");
    }

    #[test]
    fn search_directives_are_extracted() {
        let mut msgs = vec![ChatMessage::user("/search on\n/web_search off\nquery")];
        let d = extract_directives(&mut msgs, false);
        assert_eq!(d.web_search, Some(true));
        assert_eq!(d.auto_web_search, Some(false));
        assert_eq!(msgs[0].text(), "query");
    }

    #[test]
    fn test_directives_require_test_mode() {
        let mut msgs = vec![ChatMessage::user("/test no-heuristics\nread a.txt")];
        let d = extract_directives(&mut msgs, false);
        assert!(!d.no_heuristics, "ignored outside test mode");
        assert!(msgs[0].text().contains("/test no-heuristics"));

        let mut msgs = vec![ChatMessage::user("/test no-heuristics\nread a.txt")];
        let d = extract_directives(&mut msgs, true);
        assert!(d.no_heuristics);
        assert_eq!(msgs[0].text(), "read a.txt");
    }

    #[test]
    fn system_directive_in_test_mode() {
        let mut msgs = vec![ChatMessage::user("/system act like a pirate\nahoy")];
        let d = extract_directives(&mut msgs, true);
        assert_eq!(d.system_override.as_deref(), Some("act like a pirate"));
    }

    // ── Helper coverage ──────────────────────────────────────────────────────

    #[test]
    fn textualize_tool_message() {
        let mut m = ChatMessage::new("tool", "output text");
        m.tool_call_id = Some("call_9".into());
        let t = textualize(&m);
        assert_eq!(t.role, "user");
        assert!(t.text().contains("call_9"));
        assert!(t.text().contains("output text"));
    }

    #[test]
    fn textualize_assistant_tool_calls() {
        let m = ChatMessage {
            role: "assistant".into(),
            content: None,
            name: None,
            tool_call_id: None,
            tool_calls: Some(vec![ToolCallOut::new(0, "read", &json!({"path": "x"}))]),
        };
        let t = textualize(&m);
        assert!(t.text().contains("[called read("));
    }

    #[test]
    fn noop_edit_detection() {
        let action = |args: Value| Action {
            tool: "edit".into(),
            args,
            why: String::new(),
            expect: String::new(),
            safety: Default::default(),
        };
        assert!(is_noop_edit(&action(
            json!({"path": "a", "old_string": "same", "new_string": "same"})
        )));
        assert!(!is_noop_edit(&action(
            json!({"path": "a", "old_string": "old", "new_string": "new"})
        )));
        assert!(!is_noop_edit(&Action {
            tool: "read".into(),
            args: json!({}),
            why: String::new(),
            expect: String::new(),
            safety: Default::default(),
        }));
    }

    #[test]
    fn feature_overrides_merge_over_flags() {
        let f = merge_features(false, false, Some(&json!({"preview_mode": false, "web_search": true})));
        assert_eq!(f["web_search"], json!(true), "caller override wins");
        assert_eq!(f["auto_web_search"], json!(false));
        assert_eq!(f["preview_mode"], json!(false));
    }

    #[test]
    fn tool_choice_named_function_filters() {
        let mut tools = vec![tool_decl("read", &["path"]), tool_decl("write", &["path"])];
        apply_tool_choice(
            &mut tools,
            Some(&json!({"type": "function", "function": {"name": "write"}})),
        );
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], json!("write"));
    }
}

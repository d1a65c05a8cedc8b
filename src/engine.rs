//! ChatEngine: owns the HTTP round-trip, retry/backoff policy,
//! context-overflow recovery, tool-call accumulation, and event-stream
//! emission for both providers, built over `reqwest` + `bytes_stream` +
//! `futures::StreamExt`, generalized behind a common trait with a
//! retry/compression policy layered on top.

use crate::assembler::{denylist_for, RequestAssembler};
use crate::compressor::{ContextCompressor, MAX_COMPRESSION_LEVEL};
use crate::config::{self, ProviderTag};
use crate::model::{ChatRequest, ContentPart, Message, Role};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::session::{Session, SessionContext};
use crate::stream_parser::{StreamEventK, StreamParser};
use crate::wire::{self, RequestMetadata, WireEventW};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Per-host active-connection cap each engine enforces around its own
/// transport via a permit, matching the idle half `reqwest` already caps at
/// [`config::POOL_MAX_IDLE_PER_HOST`].
const MAX_ACTIVE_PER_HOST: usize = 100;

/// Upstream-K's pseudo-IDE identity string; the machine-id component is
/// appended per call since it is derived from the calling credential.
const USER_AGENT_PREFIX: &str = "AmazonQ-For-CLI/1.0 (pseudo-ide)";

/// One streaming unit emitted by [`ChatEngine::generate_content_stream`]:
/// either a content delta (text) or a finalized tool-use call.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ContentDelta(String),
    ToolUse { id: String, name: String, input: Value },
}

/// A finalized tool call as returned by the non-streaming
/// [`ChatEngine::generate_content`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub input: Value,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// Public per-provider chat engine contract.
#[async_trait]
pub trait ChatEngine {
    async fn generate_content(
        &self,
        chat_request: &ChatRequest,
        access_token: &str,
    ) -> Result<(String, Vec<ToolCallResult>)> {
        let mut stream = self.generate_content_stream(chat_request, access_token).await?;
        let mut text = String::new();
        let mut tools = Vec::new();

        while let Some(event) = stream.next().await {
            match event? {
                ChatEvent::ContentDelta(delta) => text.push_str(&delta),
                ChatEvent::ToolUse { id, name, input } => {
                    tools.push(ToolCallResult { id, name, input })
                }
            }
        }

        Ok((text, tools))
    }

    async fn generate_content_stream(
        &self,
        chat_request: &ChatRequest,
        access_token: &str,
    ) -> Result<EventStream>;
}

/// True for the HTTP 400 + `ValidationException` context-overflow signal,
/// which routes through [`ContextCompressor`] instead of the generic
/// backoff policy.
fn is_context_overflow_signal(err: &Error) -> bool {
    matches!(
        err,
        Error::UpstreamPermanent { status: 400, error_type: Some(t), .. }
            if t == "ValidationException"
    )
}

async fn classify_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_type = response
        .headers()
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let request_id = response
        .headers()
        .get("x-amzn-requestid")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();

    if code == 429 || (500..600).contains(&code) {
        return Err(Error::upstream_transient(code, body));
    }

    Err(Error::upstream_permanent(code, error_type, request_id, body))
}

// ---------------------------------------------------------------------
// Engine-K
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Clone)]
struct HistoryPairK {
    user_input: String,
    assistant_response: String,
}

#[derive(Debug, Serialize, Clone)]
struct PendingToolResultK {
    tool_use_id: String,
    status: String,
    payload: Value,
}

#[derive(Debug, Serialize, Clone)]
struct ToolContextK {
    tools: Vec<crate::model::ToolSpec>,
    pending_tool_results: Vec<PendingToolResultK>,
}

#[derive(Debug, Serialize, Clone)]
struct ProviderRequestK {
    conversation_id: String,
    history: Vec<HistoryPairK>,
    current_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_context: Option<ToolContextK>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile_id: Option<String>,
}

fn build_provider_request_k(
    messages: &[Message],
    tools: Option<&[crate::model::ToolSpec]>,
) -> ProviderRequestK {
    let mut messages = messages.to_vec();
    // Last-message extraction guarantees the current message is a user turn
    // unless the original request was entirely empty; patch that edge case
    // here.
    if matches!(messages.last().map(|m| m.role), Some(Role::Assistant)) {
        messages.push(Message::user("Continue"));
    }

    let current = messages.pop().expect("at least one message after assembly");
    let pending_tool_results: Vec<PendingToolResultK> = current
        .content
        .tool_results()
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::ToolResult { id, status, payload } => Some(PendingToolResultK {
                tool_use_id: id.clone(),
                status: match status {
                    crate::model::ToolResultStatus::Success => "success".to_string(),
                    crate::model::ToolResultStatus::Error => "error".to_string(),
                },
                payload: payload.clone(),
            }),
            _ => None,
        })
        .collect();

    // Synthesize the missing half of a user/assistant pair so `history`
    // strictly alternates rather than padding the trailing pair with an
    // empty `assistant_response`, or misplacing a leading assistant turn
    // into `user_input`.
    if matches!(messages.first().map(|m| m.role), Some(Role::Assistant)) {
        messages.insert(0, Message::user("Continue"));
    }
    if matches!(messages.last().map(|m| m.role), Some(Role::User)) {
        messages.push(Message::assistant("Continue"));
    }

    let history = messages
        .chunks(2)
        .map(|pair| HistoryPairK {
            user_input: pair.first().map(|m| m.content.as_joined_text()).unwrap_or_default(),
            assistant_response: pair.get(1).map(|m| m.content.as_joined_text()).unwrap_or_default(),
        })
        .collect();

    let tool_context = tools.filter(|t| !t.is_empty()).map(|tools| ToolContextK {
        tools: tools.to_vec(),
        pending_tool_results,
    });

    ProviderRequestK {
        conversation_id: Uuid::new_v4().to_string(),
        history,
        current_message: current.content.as_joined_text(),
        tool_context,
        profile_id: None,
    }
}

/// Accumulates [`StreamEventK`]s into finalized [`ChatEvent`]s for the
/// streaming loop.
#[derive(Default)]
struct StreamAccumulatorK {
    last_content: Option<String>,
    open_call: Option<(String, String, String)>, // (id, name, raw_input)
}

impl StreamAccumulatorK {
    fn handle(&mut self, event: StreamEventK, out: &mut VecDeque<Result<ChatEvent>>) {
        match event {
            StreamEventK::Content(text) => {
                if self.last_content.as_deref() != Some(text.as_str()) {
                    out.push_back(Ok(ChatEvent::ContentDelta(text.clone())));
                }
                self.last_content = Some(text);
            }
            StreamEventK::ToolUse { name, tool_use_id, partial_input, stop } => {
                let same_call = self.open_call.as_ref().map(|(id, ..)| id == &tool_use_id).unwrap_or(false);
                if !same_call {
                    self.finalize(out);
                    self.open_call = Some((tool_use_id, name, partial_input.unwrap_or_default()));
                } else if let Some(fragment) = partial_input {
                    if let Some((_, _, raw)) = &mut self.open_call {
                        raw.push_str(&fragment);
                    }
                }
                if stop {
                    self.finalize(out);
                }
            }
            StreamEventK::ToolUseInput(fragment) => {
                if let Some((_, _, raw)) = &mut self.open_call {
                    raw.push_str(&fragment);
                }
            }
            StreamEventK::ToolUseStop => self.finalize(out),
        }
    }

    fn finalize(&mut self, out: &mut VecDeque<Result<ChatEvent>>) {
        if let Some((id, name, raw_input)) = self.open_call.take() {
            let input = serde_json::from_str(&raw_input).unwrap_or(Value::String(raw_input));
            out.push_back(Ok(ChatEvent::ToolUse { id, name, input }));
        }
    }
}

/// Upstream-K's fixed conversational endpoint, relative to the provider's base URL.
fn k_endpoint(base_url: &str) -> String {
    format!("{base_url}/codewhisperer/generateAssistantResponse")
}

/// Pseudo-IDE `user-agent` header value carrying the hashed machine id,
/// using `access_token` as the machine-id seed since that is the only
/// per-credential value [`ChatEngine`] passes down to the transport layer.
fn k_user_agent(access_token: &str) -> String {
    format!("{} md/machineId#{}", USER_AGENT_PREFIX, config::machine_id_hash(access_token))
}

/// JSON-framed event-stream engine for Upstream-K.
pub struct EngineK {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    active_permits: Arc<Semaphore>,
}

impl EngineK {
    /// Build an owned transport via [`config::build_http_client`] rather than
    /// accepting a shared `reqwest::Client`, so this engine's connection caps
    /// and proxy settings are its own.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: config::build_http_client()?,
            base_url: base_url.into(),
            retry: RetryConfig::default(),
            active_permits: Arc::new(Semaphore::new(MAX_ACTIVE_PER_HOST)),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn post_once(&self, body: &ProviderRequestK, access_token: &str) -> Result<reqwest::Response> {
        let _permit = self.active_permits.acquire().await.map_err(|_| Error::other("connection pool closed"))?;

        let response = self
            .http
            .post(k_endpoint(&self.base_url))
            .bearer_auth(access_token)
            .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
            .header("user-agent", k_user_agent(access_token))
            .json(body)
            .send()
            .await
            .map_err(Error::Http)?;
        classify_response(response).await
    }

    /// Retry/compression policy: 429/5xx backs off exponentially via
    /// `retry.rs`; a context-overflow signal escalates the compression
    /// level and re-assembles, up to `MAX_COMPRESSION_LEVEL`.
    async fn send(&self, chat_request: &ChatRequest, access_token: &str) -> Result<reqwest::Response> {
        let denylist = denylist_for(ProviderTag::K);
        let mut level = 0u8;

        loop {
            let (assembled, tools) = RequestAssembler::assemble(chat_request, denylist);
            let messages = if level > 0 {
                ContextCompressor::compress(&assembled, level)
            } else {
                assembled
            };
            let body = build_provider_request_k(&messages, tools.as_deref());

            let attempt = retry_with_backoff(self.retry.clone(), |_attempt| {
                let body = body.clone();
                async move { self.post_once(&body, access_token).await }
            })
            .await;

            match attempt {
                Ok(response) => return Ok(response),
                Err(err) if is_context_overflow_signal(&err) => {
                    if level >= MAX_COMPRESSION_LEVEL {
                        return Err(Error::ContextLimit);
                    }
                    level += 1;
                    tracing::debug!(level, "context overflow, recompressing and retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ChatEngine for EngineK {
    async fn generate_content_stream(
        &self,
        chat_request: &ChatRequest,
        access_token: &str,
    ) -> Result<EventStream> {
        let response = self.send(chat_request, access_token).await?;
        let body: Pin<Box<dyn Stream<Item = std::result::Result<Vec<u8>, reqwest::Error>> + Send>> =
            Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())));

        let state = StreamStateK {
            body,
            parser: StreamParser::new(),
            acc: StreamAccumulatorK::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        let events = state.parser.feed(&bytes);
                        for event in events {
                            state.acc.handle(event, &mut state.pending);
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.push_back(Err(Error::Http(e)));
                    }
                    None => {
                        state.finished = true;
                        state.acc.finalize(&mut state.pending);
                    }
                }
            }
        });

        // Dropping the returned stream drops `response`'s body and releases
        // the socket on cancellation; no extra epilogue needed beyond
        // `reqwest`'s own `Drop`.
        Ok(Box::pin(stream))
    }
}

struct StreamStateK {
    body: Pin<Box<dyn Stream<Item = std::result::Result<Vec<u8>, reqwest::Error>> + Send>>,
    parser: StreamParser,
    acc: StreamAccumulatorK,
    pending: VecDeque<Result<ChatEvent>>,
    finished: bool,
}

// ---------------------------------------------------------------------
// Engine-W
// ---------------------------------------------------------------------

/// Upstream-W's fixed multi-agent endpoint, relative to the provider's base URL.
fn w_endpoint(base_url: &str) -> String {
    format!("{base_url}/ai/multi-agent")
}

/// Fixed `x-warp-*` client-identity headers upstream requires to accept a
/// request; content beyond the literal header names is not load-bearing.
const W_CLIENT_IDENTITY_HEADERS: &[(&str, &str)] = &[
    ("x-warp-client-id", "warp-terminal"),
    ("x-warp-client-version", "1.0.0"),
    ("x-warp-os-category", "Linux"),
    ("x-warp-os-name", "Linux"),
    ("x-warp-os-version", "unknown"),
];

/// Hand-rolled protobuf request/SSE-response engine for Upstream-W. One-shot
/// use of [`ChatEngine`] builds a throwaway
/// [`Session`] per call; [`crate::agentic_loop`] drives the persistent,
/// multi-turn form directly against [`wire::encode_request`] /
/// [`wire::decode_sse_body`].
pub struct EngineW {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    model: String,
    active_permits: Arc<Semaphore>,
}

impl EngineW {
    /// Build an owned transport via [`config::build_http_client`] rather than
    /// accepting a shared `reqwest::Client`, so this engine's connection caps
    /// and proxy settings are its own.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: config::build_http_client()?,
            base_url: base_url.into(),
            retry: RetryConfig::default(),
            model: model.into(),
            active_permits: Arc::new(Semaphore::new(MAX_ACTIVE_PER_HOST)),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn post_once(&self, body: &[u8], access_token: &str) -> Result<reqwest::Response> {
        let _permit = self.active_permits.acquire().await.map_err(|_| Error::other("connection pool closed"))?;
        let mut request = self
            .http
            .post(w_endpoint(&self.base_url))
            .bearer_auth(access_token)
            .header("Content-Type", "application/x-protobuf")
            .header("accept", "text/event-stream");
        for (name, value) in W_CLIENT_IDENTITY_HEADERS {
            request = request.header(*name, *value);
        }

        let response = request.body(body.to_vec()).send().await.map_err(Error::Http)?;
        classify_response(response).await
    }

    async fn send(&self, session: &Session, access_token: &str) -> Result<reqwest::Response> {
        let metadata = RequestMetadata {
            entrypoint: "api".to_string(),
            auto_resume: false,
            auto_detected: false,
        };
        let mut level = 0u8;

        loop {
            let session = if level > 0 {
                let mut compressed = session.clone();
                compressed.messages = ContextCompressor::compress(&session.messages, level);
                compressed
            } else {
                session.clone()
            };
            let body = wire::encode_request(&session, &metadata);

            let attempt = retry_with_backoff(self.retry.clone(), |_attempt| {
                let body = body.clone();
                async move { self.post_once(&body, access_token).await }
            })
            .await;

            match attempt {
                Ok(response) => return Ok(response),
                Err(err) if is_context_overflow_signal(&err) => {
                    if level >= MAX_COMPRESSION_LEVEL {
                        return Err(Error::ContextLimit);
                    }
                    level += 1;
                    tracing::debug!(level, "context overflow, recompressing and retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send a fully-formed session and return its decoded events. Exposed
    /// for [`crate::agentic_loop`], which needs per-turn access to the
    /// decoded events rather than the flattened [`ChatEvent`] stream.
    pub async fn send_session(&self, session: &Session, access_token: &str) -> Result<Vec<WireEventW>> {
        let response = self.send(session, access_token).await?;
        let text = response.text().await.map_err(Error::Http)?;
        Ok(wire::decode_sse_body(&text))
    }
}

fn wire_event_to_chat_event(event: WireEventW) -> Option<ChatEvent> {
    match event {
        WireEventW::AgentText(text) => Some(ChatEvent::ContentDelta(text)),
        WireEventW::ToolCall { call_id, command } => Some(ChatEvent::ToolUse {
            id: call_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: command,
            input: Value::Object(serde_json::Map::new()),
        }),
        WireEventW::Reasoning(text) => {
            tracing::debug!(text, "dropping reasoning event from chat event stream");
            None
        }
    }
}

#[async_trait]
impl ChatEngine for EngineW {
    async fn generate_content_stream(
        &self,
        chat_request: &ChatRequest,
        access_token: &str,
    ) -> Result<EventStream> {
        let denylist = denylist_for(ProviderTag::W);
        let (messages, _tools) = RequestAssembler::assemble(chat_request, denylist);

        let mut session = Session::new(self.model.clone(), SessionContext::default());
        session.messages = messages;

        let events: Vec<ChatEvent> = self
            .send_session(&session, access_token)
            .await?
            .into_iter()
            .filter_map(wire_event_to_chat_event)
            .collect();

        // Already fully decoded: `decode_sse_body` works on a complete SSE
        // body rather than incremental chunks, so there is nothing left to
        // stream lazily; wrap the finished vector for a uniform interface.
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

//! HTTP request handlers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::{Extension, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::health;
use super::retry::{self, Attempt, AttemptError, AttemptFailure, RetryPolicy};
use super::server::{AppState, RequestId};
use super::stream::{parse_chat_frame, parse_messages_frame, SseDecoder, UpstreamFrame};
use super::translate::{self, StreamState};
use super::types::{
    ensure_stream_options, ChatResponse, ContentBlock, MessagesRequest, MessagesResponse,
    MessagesUsage, StreamEvent,
};
use crate::config::{ApiFormat, ProviderConfig};
use crate::error::Error;
use crate::proxy::circuit_breaker::CircuitState;
use crate::router::{self, Candidate, ModelCategory, ModelTarget};

/// Request header: opaque caller identity for the completion event.
pub const TIERGATE_CALLER_HEADER: &str = "x-tiergate-caller";
/// Request header: comma-separated provider allow-list.
pub const TIERGATE_PROVIDERS_HEADER: &str = "x-tiergate-providers";

/// Response header: correlation ID (UUID v4).
pub const TIERGATE_REQUEST_ID_HEADER: &str = "x-tiergate-request-id";
/// Response header: provider name that served the request.
pub const TIERGATE_PROVIDER_HEADER: &str = "x-tiergate-provider";
/// Response header: wall-clock latency in milliseconds (integer).
pub const TIERGATE_LATENCY_MS_HEADER: &str = "x-tiergate-latency-ms";
/// Response header: failed attempts as "count/provider, ..." in
/// first-appearance order. Absent when the first attempt succeeded.
pub const TIERGATE_ATTEMPTS_HEADER: &str = "x-tiergate-attempts";
/// Response header: present with value "true" on streaming responses.
pub const TIERGATE_STREAMING_HEADER: &str = "x-tiergate-streaming";

/// Protocol version sent to messages-format upstreams.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Cap on upstream error body text carried into attempt records.
const ERROR_BODY_LIMIT: usize = 300;

/// Build an upstream POST with the provider's endpoint path, auth scheme,
/// and custom headers. Chat-format providers take a Bearer token against
/// `/chat/completions`; messages-format providers take `x-api-key` plus a
/// version header against `/messages`.
pub(crate) fn upstream_post(
    client: &reqwest::Client,
    provider: &ProviderConfig,
) -> reqwest::RequestBuilder {
    let base = provider.url.trim_end_matches('/');
    let mut builder = match provider.api_format {
        ApiFormat::Chat => {
            let mut b = client.post(format!("{}/chat/completions", base));
            if let Some(key) = &provider.api_key {
                b = b.header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", key.expose_secret()),
                );
            }
            b
        }
        ApiFormat::Messages => {
            let mut b = client
                .post(format!("{}/messages", base))
                .header("anthropic-version", ANTHROPIC_VERSION);
            if let Some(key) = &provider.api_key {
                b = b.header("x-api-key", key.expose_secret());
            }
            b
        }
    };
    for (name, value) in &provider.headers {
        builder = builder.header(name, value);
    }
    builder
}

fn request_error(e: reqwest::Error) -> AttemptError {
    if e.is_timeout() {
        AttemptError::Timeout
    } else {
        AttemptError::Transport(e.to_string())
    }
}

fn truncate_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

/// Attach tiergate metadata headers to a response.
///
/// Latency is omitted on streaming responses (not known at header-send
/// time); the streaming flag marks them instead.
fn attach_tiergate_headers(
    response: &mut Response,
    request_id: &str,
    latency_ms: u64,
    provider: Option<&str>,
    attempts: Option<&str>,
    is_streaming: bool,
) {
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(TIERGATE_REQUEST_ID_HEADER), value);
    }

    if is_streaming {
        headers.insert(
            HeaderName::from_static(TIERGATE_STREAMING_HEADER),
            HeaderValue::from_static("true"),
        );
    } else {
        headers.insert(
            HeaderName::from_static(TIERGATE_LATENCY_MS_HEADER),
            HeaderValue::from(latency_ms),
        );
    }

    if let Some(name) = provider {
        if let Ok(value) = HeaderValue::from_str(name) {
            headers.insert(HeaderName::from_static(TIERGATE_PROVIDER_HEADER), value);
        }
    }

    if let Some(summary) = attempts {
        if let Ok(value) = HeaderValue::from_str(summary) {
            headers.insert(HeaderName::from_static(TIERGATE_ATTEMPTS_HEADER), value);
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse the provider allow-list header. An absent or empty header means
/// no restriction.
fn parse_allow_list(headers: &HeaderMap) -> Option<HashSet<String>> {
    let raw = headers.get(TIERGATE_PROVIDERS_HEADER)?.to_str().ok()?;
    let set: HashSet<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

/// Context for the structured completion event, moved into the relay task
/// for streaming responses.
struct CompletionEvent {
    request_id: String,
    caller: Option<String>,
    model: String,
    provider: Option<String>,
    upstream_model: Option<String>,
    streaming: bool,
    attempts: u32,
    started: std::time::Instant,
}

impl CompletionEvent {
    fn emit(&self, usage: MessagesUsage, outcome: &str) {
        tracing::info!(
            target: "tiergate::events",
            request_id = %self.request_id,
            caller = self.caller.as_deref().unwrap_or("-"),
            model = %self.model,
            provider = self.provider.as_deref().unwrap_or("-"),
            upstream_model = self.upstream_model.as_deref().unwrap_or("-"),
            streaming = self.streaming,
            attempts = self.attempts,
            latency_ms = self.started.elapsed().as_millis() as u64,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            outcome,
            "request completed"
        );
    }
}

/// Outcome of a successfully served request.
struct Outcome {
    response: Response,
    provider: Option<String>,
    streaming: bool,
}

/// Handle POST /v1/messages
pub async fn messages(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(request): Json<MessagesRequest>,
) -> Response {
    let started = std::time::Instant::now();
    let correlation_id = request_id.0.to_string();
    let caller = header_string(&headers, TIERGATE_CALLER_HEADER);
    let model = request.model.clone();

    let attempts: Arc<Mutex<Vec<AttemptFailure>>> = Arc::new(Mutex::new(Vec::new()));

    let result = execute_messages(
        &state,
        request,
        &headers,
        Arc::clone(&attempts),
        &correlation_id,
        caller.clone(),
        started,
    )
    .await;

    let recorded = attempts.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let attempts_header = retry::format_attempts_header(&recorded);
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            let mut response = outcome.response;
            attach_tiergate_headers(
                &mut response,
                &correlation_id,
                latency_ms,
                outcome.provider.as_deref(),
                attempts_header.as_deref(),
                outcome.streaming,
            );
            response
        }
        Err(err) => {
            CompletionEvent {
                request_id: correlation_id.clone(),
                caller,
                model,
                provider: None,
                upstream_model: None,
                streaming: false,
                attempts: recorded.len() as u32,
                started,
            }
            .emit(MessagesUsage::default(), err.error_type());

            let mut response = err.into_response();
            attach_tiergate_headers(
                &mut response,
                &correlation_id,
                latency_ms,
                None,
                attempts_header.as_deref(),
                false,
            );
            response
        }
    }
}

async fn execute_messages(
    state: &AppState,
    request: MessagesRequest,
    headers: &HeaderMap,
    attempts: Arc<Mutex<Vec<AttemptFailure>>>,
    correlation_id: &str,
    caller: Option<String>,
    started: std::time::Instant,
) -> Result<Outcome, Error> {
    if request.messages.is_empty() {
        return Err(Error::InvalidRequest("messages must not be empty".to_string()));
    }
    if request.max_tokens == 0 {
        return Err(Error::InvalidRequest("max_tokens must be at least 1".to_string()));
    }

    let target = ModelTarget::parse(&request.model)?;
    let allow_list = parse_allow_list(headers);
    let is_streaming = request.stream.unwrap_or(false);

    let routing = state
        .routing
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let policy = RetryPolicy::from(&routing);

    tracing::info!(
        request_id = %correlation_id,
        model = %request.model,
        target = %target,
        stream = is_streaming,
        strategy = %routing.fallback_strategy,
        "received messages request"
    );

    let snapshot = state.registry.snapshot();
    let candidates = router::candidates(
        &snapshot[..],
        &target,
        routing.fallback_strategy,
        allow_list.as_ref(),
        &state.breakers,
    )?;

    if is_streaming {
        streaming_response(state, &request, &candidates, &policy, attempts, correlation_id, caller, started).await
    } else {
        buffered_response(state, &request, &candidates, &policy, attempts, correlation_id, caller, started).await
    }
}

// ── Buffered path ────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn buffered_response(
    state: &AppState,
    request: &MessagesRequest,
    candidates: &[Candidate],
    policy: &RetryPolicy,
    attempts: Arc<Mutex<Vec<AttemptFailure>>>,
    correlation_id: &str,
    caller: Option<String>,
    started: std::time::Instant,
) -> Result<Outcome, Error> {
    let outcome = retry::run_candidates(
        candidates,
        &state.breakers,
        policy,
        Arc::clone(&attempts),
        |c| {
            send_buffered(
                state.http_client.clone(),
                Arc::clone(&c.provider),
                c.model.clone(),
                request.clone(),
            )
        },
    )
    .await;

    let recorded = || attempts.lock().unwrap_or_else(|e| e.into_inner()).clone();

    match outcome {
        Ok(success) => {
            CompletionEvent {
                request_id: correlation_id.to_string(),
                caller,
                model: request.model.clone(),
                provider: Some(success.provider.clone()),
                upstream_model: Some(success.model.clone()),
                streaming: false,
                attempts: recorded().len() as u32,
                started,
            }
            .emit(success.value.usage, "success");

            Ok(Outcome {
                response: Json(success.value).into_response(),
                provider: Some(success.provider),
                streaming: false,
            })
        }
        Err(retry::Exhausted) => Err(Error::AllProvidersFailed {
            attempts: recorded(),
        }),
    }
}

/// One buffered try against a provider: send, check status, parse, and
/// translate into the outbound format.
async fn send_buffered(
    client: reqwest::Client,
    provider: Arc<ProviderConfig>,
    upstream_model: String,
    request: MessagesRequest,
) -> Result<Attempt<MessagesResponse>, AttemptError> {
    let builder = upstream_post(&client, &provider);

    let response = match provider.api_format {
        ApiFormat::Chat => {
            let body = translate::chat_request(&request, &upstream_model, false);
            builder.json(&body).send().await
        }
        ApiFormat::Messages => {
            let body = translate::messages_passthrough_request(&request, &upstream_model, false);
            builder.json(&body).send().await
        }
    }
    .map_err(request_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AttemptError::Status {
            code: status.as_u16(),
            message: truncate_body(&body),
        });
    }

    let translated = match provider.api_format {
        ApiFormat::Chat => {
            let chat: ChatResponse = response
                .json()
                .await
                .map_err(|e| AttemptError::Transport(format!("unparseable response body: {}", e)))?;
            translate::messages_response(&chat, &request.model)
                .map_err(|e| AttemptError::Transport(e.to_string()))?
        }
        ApiFormat::Messages => {
            let mut msg: MessagesResponse = response
                .json()
                .await
                .map_err(|e| AttemptError::Transport(format!("unparseable response body: {}", e)))?;
            translate::rewrite_response_model(&mut msg, &request.model);
            msg
        }
    };

    // A content-bearing response counts as output even when the upstream
    // omitted the usage object; only truly empty responses are zero-output.
    let has_content = translated.content.iter().any(|block| match block {
        ContentBlock::Text { text } => !text.is_empty(),
        ContentBlock::Thinking { thinking } => !thinking.is_empty(),
    });
    let output_tokens = if has_content {
        translated.usage.output_tokens.max(1)
    } else {
        translated.usage.output_tokens
    };
    Ok(Attempt {
        value: translated,
        output_tokens,
    })
}

// ── Streaming path ───────────────────────────────────────────────────

/// Batch of outbound events pulled from the upstream stream.
enum Batch {
    Events(Vec<StreamEvent>),
    /// Terminator or EOF seen; includes the final events and terminals.
    End(Vec<StreamEvent>),
}

/// Incremental reader over an upstream SSE byte stream.
struct StreamDriver {
    format: ApiFormat,
    decoder: SseDecoder,
    bytes: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
}

impl StreamDriver {
    /// Feed one decoded payload through the translation state. Returns
    /// true when the payload was the upstream's terminator.
    fn apply(&self, payload: &str, state: &mut StreamState, out: &mut Vec<StreamEvent>) -> bool {
        match self.format {
            ApiFormat::Chat => match parse_chat_frame(payload) {
                Some(UpstreamFrame::Chunk(chunk)) => {
                    out.extend(state.on_chunk(&chunk));
                    false
                }
                Some(UpstreamFrame::Done) => true,
                None => false,
            },
            ApiFormat::Messages => match parse_messages_frame(payload) {
                Some(event) => {
                    let terminal = matches!(event, StreamEvent::MessageStop);
                    out.extend(state.on_passthrough_event(event));
                    terminal
                }
                None => false,
            },
        }
    }

    /// Pull the next batch of outbound events.
    ///
    /// `Batch::End` closes the stream with the terminal event sequence
    /// appended (a no-op when the upstream already supplied its own).
    /// `Err` is a transport failure mid-stream.
    async fn next_batch(&mut self, state: &mut StreamState) -> Result<Batch, String> {
        loop {
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    let mut out = Vec::new();
                    let mut ended = false;
                    for payload in self.decoder.push(&chunk) {
                        if self.apply(&payload, state, &mut out) {
                            ended = true;
                            break;
                        }
                    }
                    if ended {
                        out.extend(state.finish());
                        return Ok(Batch::End(out));
                    }
                    if !out.is_empty() {
                        return Ok(Batch::Events(out));
                    }
                    // Chunk completed no event; keep reading
                }
                Some(Err(e)) => return Err(format!("upstream stream failed: {}", e)),
                None => {
                    let mut out = Vec::new();
                    if let Some(payload) = self.decoder.flush() {
                        self.apply(&payload, state, &mut out);
                    }
                    out.extend(state.finish());
                    return Ok(Batch::End(out));
                }
            }
        }
    }
}

/// What one streaming attempt produced by its commit point.
enum StreamAttempt {
    /// Upstream still open; the buffered prefix runs through the first
    /// content delta.
    Live(Box<LiveStream>),
    /// Upstream completed inside the buffered window.
    Complete {
        events: Vec<StreamEvent>,
        usage: MessagesUsage,
    },
}

struct LiveStream {
    state: StreamState,
    pending: Vec<StreamEvent>,
    driver: StreamDriver,
}

/// One streaming try: connect, then buffer translated events until the
/// first non-empty content delta (the commit point) or stream end.
///
/// Everything before commit is invisible to the client, so failures and
/// empty streams in this window stay eligible for retry and fallback. The
/// coordinator's per-attempt timeout bounds exactly this window; the
/// post-commit relay runs outside it.
async fn open_stream(
    client: reqwest::Client,
    provider: Arc<ProviderConfig>,
    upstream_model: String,
    request: MessagesRequest,
) -> Result<Attempt<StreamAttempt>, AttemptError> {
    let builder = upstream_post(&client, &provider);

    let response = match provider.api_format {
        ApiFormat::Chat => {
            let mut body = translate::chat_request(&request, &upstream_model, true);
            ensure_stream_options(&mut body);
            builder.json(&body).send().await
        }
        ApiFormat::Messages => {
            let body = translate::messages_passthrough_request(&request, &upstream_model, true);
            builder.json(&body).send().await
        }
    }
    .map_err(request_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AttemptError::Status {
            code: status.as_u16(),
            message: truncate_body(&body),
        });
    }

    let mut driver = StreamDriver {
        format: provider.api_format,
        decoder: SseDecoder::new(),
        bytes: response.bytes_stream().boxed(),
    };
    let mut state = StreamState::new(&request.model);
    let mut pending = Vec::new();

    loop {
        match driver.next_batch(&mut state).await {
            Ok(Batch::Events(events)) => {
                pending.extend(events);
                if state.content_emitted() {
                    return Ok(Attempt {
                        value: StreamAttempt::Live(Box::new(LiveStream {
                            state,
                            pending,
                            driver,
                        })),
                        // Committed: the zero-output policy no longer applies
                        output_tokens: 1,
                    });
                }
            }
            Ok(Batch::End(events)) => {
                pending.extend(events);
                let output_tokens = if state.content_emitted() {
                    state.usage().output_tokens.max(1)
                } else {
                    0
                };
                return Ok(Attempt {
                    value: StreamAttempt::Complete {
                        events: pending,
                        usage: state.usage(),
                    },
                    output_tokens,
                });
            }
            Err(message) => return Err(AttemptError::Transport(message)),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn streaming_response(
    state: &AppState,
    request: &MessagesRequest,
    candidates: &[Candidate],
    policy: &RetryPolicy,
    attempts: Arc<Mutex<Vec<AttemptFailure>>>,
    correlation_id: &str,
    caller: Option<String>,
    started: std::time::Instant,
) -> Result<Outcome, Error> {
    let outcome = retry::run_candidates(
        candidates,
        &state.breakers,
        policy,
        Arc::clone(&attempts),
        |c| {
            open_stream(
                state.http_client.clone(),
                Arc::clone(&c.provider),
                c.model.clone(),
                request.clone(),
            )
        },
    )
    .await;

    let recorded = || attempts.lock().unwrap_or_else(|e| e.into_inner()).clone();

    match outcome {
        Ok(success) => {
            let completion = CompletionEvent {
                request_id: correlation_id.to_string(),
                caller,
                model: request.model.clone(),
                provider: Some(success.provider.clone()),
                upstream_model: Some(success.model.clone()),
                streaming: true,
                attempts: recorded().len() as u32,
                started,
            };

            let response = match success.value {
                StreamAttempt::Complete { events, usage } => {
                    completion.emit(usage, "success");
                    let payload: String = events.iter().map(StreamEvent::to_sse).collect();
                    sse_response(Body::from(payload))
                }
                StreamAttempt::Live(live) => {
                    let (tx, rx) = mpsc::channel::<StreamEvent>(64);
                    spawn_relay(*live, tx, completion);
                    let body = Body::from_stream(
                        ReceiverStream::new(rx)
                            .map(|event| Ok::<_, std::convert::Infallible>(event.to_sse())),
                    );
                    sse_response(body)
                }
            };

            Ok(Outcome {
                response,
                provider: Some(success.provider),
                streaming: true,
            })
        }
        Err(retry::Exhausted) => Err(Error::AllProvidersFailed {
            attempts: recorded(),
        }),
    }
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap()
}

/// Forward a committed stream to the client until it ends.
///
/// The breaker outcome for this logical attempt was already recorded at
/// commit time; a post-commit upstream failure surfaces as one terminal
/// `error` event and never falls back to another provider. A client
/// disconnect (send failure) ends the relay and drops the upstream call.
fn spawn_relay(live: LiveStream, tx: mpsc::Sender<StreamEvent>, completion: CompletionEvent) {
    tokio::spawn(async move {
        let LiveStream {
            mut state,
            pending,
            mut driver,
        } = live;

        for event in pending {
            if tx.send(event).await.is_err() {
                tracing::debug!("client disconnected, dropping upstream stream");
                return;
            }
        }

        loop {
            match driver.next_batch(&mut state).await {
                Ok(Batch::Events(events)) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            tracing::debug!("client disconnected, dropping upstream stream");
                            return;
                        }
                    }
                }
                Ok(Batch::End(events)) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    completion.emit(state.usage(), "success");
                    return;
                }
                Err(message) => {
                    tracing::warn!(
                        request_id = %completion.request_id,
                        error = %message,
                        "stream interrupted after content was delivered"
                    );
                    for event in state.interrupt(&message) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    completion.emit(state.usage(), "stream_interrupted");
                    return;
                }
            }
        }
    });
}

// ── Auxiliary endpoints ──────────────────────────────────────────────

/// Handle GET /health
///
/// Aggregate gateway health from circuit state: "ok" when every enabled
/// provider's circuit is closed, "degraded" when some are open or probing,
/// "unhealthy" (503) when all are open.
pub async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.registry.snapshot();

    let mut providers = serde_json::Map::new();
    let mut total = 0usize;
    let mut open = 0usize;
    let mut half_open = 0usize;

    for provider in snapshot.iter().filter(|p| p.enabled) {
        total += 1;
        let key = provider.key();
        let circuit = state.breakers.state(&key).unwrap_or(CircuitState::Closed);
        match circuit {
            CircuitState::Open => open += 1,
            CircuitState::HalfOpen => half_open += 1,
            CircuitState::Closed => {}
        }
        providers.insert(
            key.to_string(),
            serde_json::json!({
                "state": circuit.as_str(),
                "failure_count": state.breakers.failure_count(&key).unwrap_or(0),
                "trip_count": state.breakers.trip_count(&key).unwrap_or(0),
            }),
        );
    }

    let status = if total > 0 && open == total {
        "unhealthy"
    } else if open + half_open > 0 {
        "degraded"
    } else {
        "ok"
    };
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = serde_json::json!({
        "status": status,
        "providers": providers,
    });
    (code, Json(body)).into_response()
}

/// Handle GET /v1/providers - configured providers with circuit state.
pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();

    let providers: Vec<serde_json::Value> = snapshot
        .iter()
        .map(|p| {
            let key = p.key();
            let circuit = state.breakers.state(&key).unwrap_or(CircuitState::Closed);
            serde_json::json!({
                "name": p.name,
                "api_format": p.api_format,
                "url": p.url,
                "enabled": p.enabled,
                "priority": p.priority,
                "models": {
                    "big": p.models.big,
                    "middle": p.models.middle,
                    "small": p.models.small,
                },
                "circuit": {
                    "state": circuit.as_str(),
                    "failure_count": state.breakers.failure_count(&key).unwrap_or(0),
                    "trip_count": state.breakers.trip_count(&key).unwrap_or(0),
                },
            })
        })
        .collect();

    Json(serde_json::json!({ "providers": providers }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeParams {
    #[serde(default)]
    categories: Vec<ModelCategory>,
}

/// Handle POST /v1/providers/:name/test - direct health probe, bypassing
/// the selector and the circuit breaker.
pub async fn test_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<ProbeParams>>,
) -> Result<Json<health::ProviderReport>, Error> {
    let provider = state
        .registry
        .get_by_name(&name)
        .ok_or_else(|| Error::ProviderNotFound(name.clone()))?;

    let categories = body
        .map(|Json(p)| p.categories)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| ModelCategory::ALL.to_vec());

    let report = health::probe(&state.http_client, &provider, &categories).await;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_headers_non_streaming() {
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap();
        attach_tiergate_headers(
            &mut response,
            "550e8400-e29b-41d4-a716-446655440000",
            1523,
            Some("provider-alpha"),
            Some("2/provider-alpha"),
            false,
        );
        let headers = response.headers();
        assert_eq!(
            headers.get("x-tiergate-request-id").unwrap(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(headers.get("x-tiergate-latency-ms").unwrap(), "1523");
        assert_eq!(headers.get("x-tiergate-provider").unwrap(), "provider-alpha");
        assert_eq!(headers.get("x-tiergate-attempts").unwrap(), "2/provider-alpha");
        assert!(headers.get("x-tiergate-streaming").is_none());
    }

    #[test]
    fn test_attach_headers_streaming_omits_latency() {
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap();
        attach_tiergate_headers(
            &mut response,
            "550e8400-e29b-41d4-a716-446655440000",
            500,
            Some("provider-beta"),
            None,
            true,
        );
        let headers = response.headers();
        assert_eq!(headers.get("x-tiergate-streaming").unwrap(), "true");
        assert_eq!(headers.get("x-tiergate-provider").unwrap(), "provider-beta");
        assert!(headers.get("x-tiergate-latency-ms").is_none());
        assert!(headers.get("x-tiergate-attempts").is_none());
    }

    #[test]
    fn test_attach_headers_error_without_provider() {
        let mut response = Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(Body::empty())
            .unwrap();
        attach_tiergate_headers(
            &mut response,
            "abcd1234-0000-0000-0000-000000000000",
            50,
            None,
            Some("1/alpha, 1/beta"),
            false,
        );
        let headers = response.headers();
        assert!(headers.get("x-tiergate-provider").is_none());
        assert_eq!(headers.get("x-tiergate-attempts").unwrap(), "1/alpha, 1/beta");
        assert_eq!(headers.get("x-tiergate-latency-ms").unwrap(), "50");
    }

    #[test]
    fn test_parse_allow_list() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TIERGATE_PROVIDERS_HEADER,
            HeaderValue::from_static("alpha, beta ,gamma"),
        );
        let allow = parse_allow_list(&headers).unwrap();
        assert_eq!(allow.len(), 3);
        assert!(allow.contains("alpha"));
        assert!(allow.contains("beta"));
        assert!(allow.contains("gamma"));
    }

    #[test]
    fn test_parse_allow_list_absent_or_empty_means_unrestricted() {
        assert!(parse_allow_list(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(TIERGATE_PROVIDERS_HEADER, HeaderValue::from_static(" , "));
        assert!(parse_allow_list(&headers).is_none());
    }

    #[test]
    fn test_header_string_trims_and_drops_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(TIERGATE_CALLER_HEADER, HeaderValue::from_static("  svc-1 "));
        assert_eq!(
            header_string(&headers, TIERGATE_CALLER_HEADER).as_deref(),
            Some("svc-1")
        );

        headers.insert(TIERGATE_CALLER_HEADER, HeaderValue::from_static("   "));
        assert!(header_string(&headers, TIERGATE_CALLER_HEADER).is_none());
    }

    #[test]
    fn test_error_body_truncated() {
        let long = "x".repeat(1000);
        assert_eq!(truncate_body(&long).len(), ERROR_BODY_LIMIT);
        assert_eq!(truncate_body("short"), "short");
    }
}

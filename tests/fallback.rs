//! Integration tests for candidate fallback and retry coordination.
//!
//! Verifies that:
//! - A failing provider falls back to the next candidate in priority order
//! - The winning provider and failed attempts are reported in headers
//! - Explicit "provider/model" targets pin to one provider
//! - The caller allow-list restricts candidate selection, overrides included
//! - Zero-output responses are retried then counted as one failure
//! - A content-bearing response without a usage object is not zero-output
//! - Requests are validated before any provider is dialed
//! - Auth headers match the provider's wire format
//!
//! Uses lightweight mock HTTP servers (axum on random ports) as fake
//! providers, and `tower::ServiceExt::oneshot` for the tiergate router.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use axum::body::Body;
use http::Request;
use tower::ServiceExt;

use tiergate::config::{
    ApiFormat, ApiKey, CircuitBreakerConfig, ModelCatalog, ProviderConfig, ProviderKey,
    RoutingConfig,
};
use tiergate::proxy::circuit_breaker::CircuitBreakerRegistry;
use tiergate::proxy::{create_router, AppState};
use tiergate::router::ProviderRegistry;

fn chat_completion_json(content: &str, completion_tokens: u32) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-mock",
        "model": "acme-large-v2",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": completion_tokens,
            "total_tokens": 10 + completion_tokens
        }
    })
}

/// Start a mock chat-format provider returning a canned completion and
/// counting how many times it was called.
async fn start_counting_provider(body: serde_json::Value) -> (String, Arc<AtomicU32>) {
    use axum::{routing::post, Json, Router};

    let counter = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&counter);

    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let c = Arc::clone(&c);
            let body = body.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Json(body)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock provider");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://127.0.0.1:{}/v1", addr.port()), counter)
}

/// Start a mock provider that always returns 500.
async fn start_failing_provider() -> String {
    use axum::{routing::post, Router};

    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { http::StatusCode::INTERNAL_SERVER_ERROR }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock provider");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://127.0.0.1:{}/v1", addr.port())
}

/// Start a messages-format mock that records the headers it received.
async fn start_messages_provider() -> (String, Arc<Mutex<Option<http::HeaderMap>>>) {
    use axum::{routing::post, Json, Router};

    let seen = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&seen);

    let app = Router::new().route(
        "/v1/messages",
        post(move |headers: http::HeaderMap| {
            let captured = Arc::clone(&captured);
            async move {
                *captured.lock().unwrap() = Some(headers);
                Json(serde_json::json!({
                    "id": "msg_mock",
                    "type": "message",
                    "role": "assistant",
                    "model": "native-large-v1",
                    "content": [{"type": "text", "text": "native response"}],
                    "stop_reason": "end_turn",
                    "stop_sequence": null,
                    "usage": {"input_tokens": 8, "output_tokens": 3}
                }))
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock provider");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://127.0.0.1:{}/v1", addr.port()), seen)
}

fn setup_test_app(providers: Vec<ProviderConfig>) -> (axum::Router, Arc<CircuitBreakerRegistry>) {
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));

    let state = AppState {
        registry: Arc::new(ProviderRegistry::new(providers)),
        breakers: Arc::clone(&breakers),
        routing: Arc::new(RwLock::new(RoutingConfig::default())),
        http_client: reqwest::Client::new(),
    };

    (create_router(state), breakers)
}

fn chat_provider(name: &str, url: &str, priority: u32) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        api_format: ApiFormat::Chat,
        url: url.to_string(),
        api_key: None,
        enabled: true,
        priority,
        timeout_secs: 5,
        max_retries: 0,
        headers: Default::default(),
        models: ModelCatalog {
            big: vec!["acme-large".to_string()],
            ..Default::default()
        },
    }
}

fn messages_body(model: &str) -> String {
    serde_json::json!({
        "model": model,
        "max_tokens": 128,
        "messages": [{"role": "user", "content": "hello"}]
    })
    .to_string()
}

async fn parse_body(response: axum::response::Response) -> (http::StatusCode, serde_json::Value) {
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap_or_default();
    (status, json)
}

// ============================================================================
// Test 1: Failing provider falls back to next candidate
// ============================================================================

#[tokio::test]
async fn test_fallback_on_upstream_error() {
    let failing_url = start_failing_provider().await;
    let (ok_url, ok_calls) = start_counting_provider(chat_completion_json("fallback won", 5)).await;

    let providers = vec![
        chat_provider("provider-a", &failing_url, 1),
        chat_provider("provider-b", &ok_url, 2),
    ];
    let (app, breakers) = setup_test_app(providers);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("big")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-tiergate-provider").unwrap(),
        "provider-b"
    );
    assert_eq!(
        response.headers().get("x-tiergate-attempts").unwrap(),
        "1/provider-a"
    );

    let (_, json) = parse_body(response).await;
    assert_eq!(json["type"], "message");
    assert_eq!(json["role"], "assistant");
    // Model is rewritten back to what the caller asked for
    assert_eq!(json["model"], "big");
    assert_eq!(json["content"][0]["text"], "fallback won");
    assert_eq!(json["usage"]["output_tokens"], 5);

    assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        breakers.failure_count(&ProviderKey {
            name: "provider-a".to_string(),
            format: ApiFormat::Chat,
        }),
        Some(1)
    );
}

// ============================================================================
// Test 2: Explicit provider/model target pins to one provider
// ============================================================================

#[tokio::test]
async fn test_explicit_target_pins_provider() {
    let (a_url, a_calls) = start_counting_provider(chat_completion_json("from a", 5)).await;
    let (b_url, b_calls) = start_counting_provider(chat_completion_json("from b", 5)).await;

    let providers = vec![
        chat_provider("provider-a", &a_url, 1),
        chat_provider("provider-b", &b_url, 2),
    ];
    let (app, _breakers) = setup_test_app(providers);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("provider-b/custom-model")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-tiergate-provider").unwrap(),
        "provider-b"
    );
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    let (_, json) = parse_body(response).await;
    // Explicit targets echo the full "provider/model" string back
    assert_eq!(json["model"], "provider-b/custom-model");
}

// ============================================================================
// Test 3: Caller allow-list restricts candidates
// ============================================================================

#[tokio::test]
async fn test_allow_list_restricts_candidates() {
    let (a_url, a_calls) = start_counting_provider(chat_completion_json("from a", 5)).await;
    let (b_url, b_calls) = start_counting_provider(chat_completion_json("from b", 5)).await;

    let providers = vec![
        chat_provider("provider-a", &a_url, 1),
        chat_provider("provider-b", &b_url, 2),
    ];
    let (app, _breakers) = setup_test_app(providers);

    // provider-a is higher priority, but the allow-list excludes it
    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .header("x-tiergate-providers", "provider-b")
        .body(Body::from(messages_body("big")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-tiergate-provider").unwrap(),
        "provider-b"
    );
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_allow_list_binds_explicit_override() {
    let (a_url, a_calls) = start_counting_provider(chat_completion_json("from a", 5)).await;
    let (b_url, b_calls) = start_counting_provider(chat_completion_json("from b", 5)).await;

    let providers = vec![
        chat_provider("provider-a", &a_url, 1),
        chat_provider("provider-b", &b_url, 2),
    ];
    let (app, _breakers) = setup_test_app(providers);

    // Naming provider-b directly does not escape an allow-list of provider-a
    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .header("x-tiergate-providers", "provider-a")
        .body(Body::from(messages_body("provider-b/custom-model")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let (status, json) = parse_body(response).await;

    assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["type"], "no_provider_available");
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_allow_list_with_no_match_is_503() {
    let (a_url, _) = start_counting_provider(chat_completion_json("from a", 5)).await;

    let providers = vec![chat_provider("provider-a", &a_url, 1)];
    let (app, _breakers) = setup_test_app(providers);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .header("x-tiergate-providers", "provider-z")
        .body(Body::from(messages_body("big")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let (status, json) = parse_body(response).await;

    assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["type"], "no_provider_available");
}

// ============================================================================
// Test 4: Zero-output responses are retried, then count as one failure
// ============================================================================

#[tokio::test]
async fn test_zero_output_retries_then_fails_over() {
    // provider-a always returns an empty completion with zero output tokens
    let (a_url, a_calls) = start_counting_provider(chat_completion_json("", 0)).await;
    let (b_url, b_calls) = start_counting_provider(chat_completion_json("real answer", 7)).await;

    let providers = vec![
        chat_provider("provider-a", &a_url, 1),
        chat_provider("provider-b", &b_url, 2),
    ];
    let (app, breakers) = setup_test_app(providers);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("big")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-tiergate-provider").unwrap(),
        "provider-b"
    );

    // Initial try + zero_output_retries (default 3) against provider-a
    assert_eq!(a_calls.load(Ordering::SeqCst), 4);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    // The whole zero-output episode is one breaker failure
    assert_eq!(
        breakers.failure_count(&ProviderKey {
            name: "provider-a".to_string(),
            format: ApiFormat::Chat,
        }),
        Some(1)
    );

    let (_, json) = parse_body(response).await;
    assert_eq!(json["content"][0]["text"], "real answer");
}

#[tokio::test]
async fn test_zero_output_accepted_when_policy_disabled() {
    let (a_url, a_calls) = start_counting_provider(chat_completion_json("", 0)).await;

    let providers = vec![chat_provider("provider-a", &a_url, 1)];
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
    let state = AppState {
        registry: Arc::new(ProviderRegistry::new(providers)),
        breakers: Arc::clone(&breakers),
        routing: Arc::new(RwLock::new(RoutingConfig {
            retry_on_zero_output_tokens: false,
            ..Default::default()
        })),
        http_client: reqwest::Client::new(),
    };
    let app = create_router(state);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("big")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);

    let (_, json) = parse_body(response).await;
    assert_eq!(json["usage"]["output_tokens"], 0);
}

#[tokio::test]
async fn test_content_without_usage_is_not_zero_output() {
    // Some upstreams omit the usage object entirely on non-streaming
    // completions; a content-bearing response must not be retried away.
    let body = serde_json::json!({
        "id": "chatcmpl-mock",
        "model": "acme-large-v2",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "answer without usage"},
            "finish_reason": "stop"
        }]
    });
    let (a_url, a_calls) = start_counting_provider(body).await;

    let providers = vec![chat_provider("provider-a", &a_url, 1)];
    let (app, breakers) = setup_test_app(providers);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("big")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);

    let (_, json) = parse_body(response).await;
    assert_eq!(json["content"][0]["text"], "answer without usage");

    // Counted as a success, not a zero-output failure
    assert_eq!(
        breakers.failure_count(&ProviderKey {
            name: "provider-a".to_string(),
            format: ApiFormat::Chat,
        }),
        Some(0)
    );
}

// ============================================================================
// Test 5: Requests are validated before any provider is dialed
// ============================================================================

#[tokio::test]
async fn test_empty_messages_rejected() {
    let (a_url, a_calls) = start_counting_provider(chat_completion_json("unused", 5)).await;

    let providers = vec![chat_provider("provider-a", &a_url, 1)];
    let (app, _breakers) = setup_test_app(providers);

    let body = serde_json::json!({
        "model": "big",
        "max_tokens": 128,
        "messages": []
    })
    .to_string();

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let (status, json) = parse_body(response).await;

    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid_request_error");
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_model_rejected() {
    let (a_url, a_calls) = start_counting_provider(chat_completion_json("unused", 5)).await;

    let providers = vec![chat_provider("provider-a", &a_url, 1)];
    let (app, _breakers) = setup_test_app(providers);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("gigantic")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let (status, json) = parse_body(response).await;

    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid_request_error");
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Test 6: Messages-format provider gets passthrough auth and response
// ============================================================================

#[tokio::test]
async fn test_messages_format_passthrough() {
    let (url, seen_headers) = start_messages_provider().await;

    let provider = ProviderConfig {
        name: "native".to_string(),
        api_format: ApiFormat::Messages,
        url,
        api_key: Some(ApiKey::from("sk-native-test")),
        enabled: true,
        priority: 1,
        timeout_secs: 5,
        max_retries: 0,
        headers: Default::default(),
        models: ModelCatalog {
            big: vec!["native-large".to_string()],
            ..Default::default()
        },
    };
    let (app, _breakers) = setup_test_app(vec![provider]);

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("big")))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get("x-tiergate-provider").unwrap(),
        "native"
    );

    let (_, json) = parse_body(response).await;
    assert_eq!(json["content"][0]["text"], "native response");
    assert_eq!(json["model"], "big");

    // Messages-format upstreams authenticate with x-api-key, not Bearer
    let headers = seen_headers.lock().unwrap().clone().expect("upstream was called");
    assert_eq!(headers.get("x-api-key").unwrap(), "sk-native-test");
    assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    assert!(headers.get("authorization").is_none());
}

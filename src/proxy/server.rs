//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use crate::config::{Config, RoutingConfig};
use crate::proxy::circuit_breaker::CircuitBreakerRegistry;
use crate::router::ProviderRegistry;

/// Per-request correlation ID, assigned before routing and echoed back in
/// the `x-tiergate-request-id` response header.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub routing: Arc<RwLock<RoutingConfig>>,
    pub http_client: Client,
}

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(RequestId(Uuid::new_v4()));
    next.run(request).await
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Messages-format inbound API
        .route("/v1/messages", post(handlers::messages))
        // Operational endpoints
        .route("/health", get(handlers::health))
        .route("/v1/providers", get(handlers::list_providers))
        .route("/v1/providers/:name/test", post(handlers::test_provider))
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    // No global request timeout: streaming responses legitimately run for
    // minutes. Per-attempt deadlines come from the retry coordinator.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let state = AppState {
        registry: Arc::new(ProviderRegistry::new(config.providers.clone())),
        breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker)),
        routing: Arc::new(RwLock::new(config.routing.clone())),
        http_client,
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting tiergate server");

    axum::serve(listener, app).await?;

    Ok(())
}

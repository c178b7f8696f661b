//! Direct provider health probing.
//!
//! A probe sends one minimal real completion request per requested category
//! straight at the provider. It deliberately bypasses the selector, the
//! retry coordinator, and the circuit breaker in both directions: an
//! operator testing a provider wants the raw answer, and a manual probe
//! must not perturb routing state.

use serde::Serialize;

use crate::config::{ApiFormat, ProviderConfig};
use crate::proxy::translate;
use crate::proxy::types::{ChatResponse, InboundMessage, MessageContent, MessagesRequest, MessagesResponse};
use crate::router::ModelCategory;

/// Result of probing one category of a provider.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: ModelCategory,
    pub healthy: bool,
    pub tested_model: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate probe result for a provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    pub provider: String,
    pub api_format: ApiFormat,
    /// True when every tested category succeeded and at least one
    /// category was testable.
    pub healthy: bool,
    pub categories: Vec<CategoryReport>,
}

/// Minimal request used for probes: one user message, one output token.
fn probe_request(model: &str) -> MessagesRequest {
    MessagesRequest {
        model: model.to_string(),
        messages: vec![InboundMessage {
            role: "user".to_string(),
            content: MessageContent::Text("ping".to_string()),
        }],
        max_tokens: 1,
        system: None,
        temperature: None,
        top_p: None,
        stop_sequences: None,
        stream: None,
    }
}

/// Send one probe request to a provider and report the outcome.
async fn probe_model(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    model: &str,
) -> Result<(), String> {
    let request = probe_request(model);
    let builder = super::handlers::upstream_post(client, provider)
        .timeout(provider.timeout());

    let response = match provider.api_format {
        ApiFormat::Chat => {
            let body = translate::chat_request(&request, model, false);
            builder.json(&body).send().await
        }
        ApiFormat::Messages => {
            let body = translate::messages_passthrough_request(&request, model, false);
            builder.json(&body).send().await
        }
    }
    .map_err(|e| format!("request failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = body.chars().take(200).collect::<String>();
        return Err(format!("status {}: {}", status.as_u16(), detail));
    }

    // The body must at least parse in the provider's own format
    match provider.api_format {
        ApiFormat::Chat => {
            response
                .json::<ChatResponse>()
                .await
                .map_err(|e| format!("unparseable response: {}", e))?;
        }
        ApiFormat::Messages => {
            response
                .json::<MessagesResponse>()
                .await
                .map_err(|e| format!("unparseable response: {}", e))?;
        }
    }
    Ok(())
}

/// Probe each requested category of a provider that has a model for it.
///
/// Categories with an empty model list are skipped (not failures). A
/// provider where nothing was testable reports unhealthy.
pub async fn probe(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    categories: &[ModelCategory],
) -> ProviderReport {
    let mut reports = Vec::new();

    for &category in categories {
        let Some(model) = provider.models.for_category(category).first() else {
            continue;
        };

        let start = std::time::Instant::now();
        let outcome = probe_model(client, provider, model).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    provider = %provider.key(),
                    category = %category,
                    model = %model,
                    response_time_ms,
                    "provider probe succeeded"
                );
                reports.push(CategoryReport {
                    category,
                    healthy: true,
                    tested_model: model.clone(),
                    response_time_ms,
                    error: None,
                });
            }
            Err(error) => {
                tracing::warn!(
                    provider = %provider.key(),
                    category = %category,
                    model = %model,
                    error = %error,
                    "provider probe failed"
                );
                reports.push(CategoryReport {
                    category,
                    healthy: false,
                    tested_model: model.clone(),
                    response_time_ms,
                    error: Some(error),
                });
            }
        }
    }

    let healthy = !reports.is_empty() && reports.iter().all(|r| r.healthy);
    ProviderReport {
        provider: provider.name.clone(),
        api_format: provider.api_format,
        healthy,
        categories: reports,
    }
}

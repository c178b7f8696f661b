//! Model targets and per-request candidate selection.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::{FallbackStrategy, ProviderConfig};
use crate::error::{Error, Result};
use crate::proxy::circuit_breaker::{CircuitBreakerRegistry, Selectable};

/// Size class a request routes to when it does not name a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Big,
    Middle,
    Small,
}

impl ModelCategory {
    pub const ALL: [ModelCategory; 3] = [
        ModelCategory::Big,
        ModelCategory::Middle,
        ModelCategory::Small,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::Big => "big",
            ModelCategory::Middle => "middle",
            ModelCategory::Small => "small",
        }
    }
}

impl std::str::FromStr for ModelCategory {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "big" => Ok(ModelCategory::Big),
            "middle" => Ok(ModelCategory::Middle),
            "small" => Ok(ModelCategory::Small),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the request's `model` field resolved to.
///
/// Parsed exactly once at ingress; everything downstream matches on the
/// variants instead of re-inspecting the raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelTarget {
    /// A size category ("big", "middle", "small"): route with fallback.
    Category(ModelCategory),
    /// "provider/model": pin to one provider, no fallback.
    Explicit { provider: String, model: String },
}

impl ModelTarget {
    /// Parse the inbound `model` field.
    ///
    /// A `/` splits provider from model name; anything else must be a
    /// category name.
    pub fn parse(model: &str) -> Result<Self> {
        if let Some((provider, rest)) = model.split_once('/') {
            if provider.is_empty() || rest.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "Invalid model override '{}': expected 'provider/model'",
                    model
                )));
            }
            return Ok(ModelTarget::Explicit {
                provider: provider.to_string(),
                model: rest.to_string(),
            });
        }

        model
            .parse::<ModelCategory>()
            .map(ModelTarget::Category)
            .map_err(|_| {
                Error::InvalidRequest(format!(
                    "Unknown model '{}': expected 'big', 'middle', 'small', or 'provider/model'",
                    model
                ))
            })
    }
}

impl std::fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTarget::Category(c) => f.write_str(c.as_str()),
            ModelTarget::Explicit { provider, model } => write!(f, "{}/{}", provider, model),
        }
    }
}

/// One (provider, model) pair the coordinator will attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderConfig>,
    pub model: String,
}

/// Build the ordered candidate list for a request.
///
/// Recomputed per call against the given snapshot; never cached. Circuit
/// state is consulted through `breakers.selectable`, which also performs
/// the lazy Open -> Half-Open transition. Providers with a probe already
/// in flight are skipped.
pub fn candidates(
    providers: &[Arc<ProviderConfig>],
    target: &ModelTarget,
    strategy: FallbackStrategy,
    allow_list: Option<&HashSet<String>>,
    breakers: &CircuitBreakerRegistry,
) -> Result<Vec<Candidate>> {
    match target {
        ModelTarget::Explicit { provider, model } => {
            // The caller's allow-list binds overrides too; naming a provider
            // directly is not an escape hatch.
            if let Some(allowed) = allow_list {
                if !allowed.contains(provider) {
                    return Err(Error::NoProviderAvailable {
                        category: format!("{}/{}", provider, model),
                        strategy: "explicit".to_string(),
                    });
                }
            }

            // First enabled match by name in priority order; a name present
            // under both wire formats resolves to the higher-priority entry.
            let mut matches: Vec<&Arc<ProviderConfig>> = providers
                .iter()
                .filter(|p| p.enabled && p.name == *provider)
                .collect();
            matches.sort_by_key(|p| p.priority);

            let chosen = matches.first().ok_or_else(|| Error::NoProviderAvailable {
                category: format!("{}/{}", provider, model),
                strategy: "explicit".to_string(),
            })?;

            Ok(vec![Candidate {
                provider: Arc::clone(chosen),
                model: model.clone(),
            }])
        }
        ModelTarget::Category(category) => {
            let mut eligible: Vec<Candidate> = providers
                .iter()
                .filter(|p| p.enabled)
                .filter(|p| {
                    allow_list
                        .map(|allowed| allowed.contains(&p.name))
                        .unwrap_or(true)
                })
                .filter_map(|p| {
                    let model = p.models.for_category(*category).first()?;
                    match breakers.selectable(&p.key()) {
                        Selectable::Yes | Selectable::Probe => Some(Candidate {
                            provider: Arc::clone(p),
                            model: model.clone(),
                        }),
                        Selectable::No => {
                            tracing::debug!(
                                provider = %p.key(),
                                category = %category,
                                "skipping provider: circuit not accepting requests"
                            );
                            None
                        }
                    }
                })
                .collect();

            if eligible.is_empty() {
                return Err(Error::NoProviderAvailable {
                    category: category.to_string(),
                    strategy: strategy.to_string(),
                });
            }

            match strategy {
                FallbackStrategy::Priority => {
                    eligible.sort_by(|a, b| {
                        a.provider
                            .priority
                            .cmp(&b.provider.priority)
                            .then_with(|| a.provider.name.cmp(&b.provider.name))
                    });
                }
                FallbackStrategy::Random => {
                    eligible.shuffle(&mut rand::thread_rng());
                }
            }

            Ok(eligible)
        }
    }
}

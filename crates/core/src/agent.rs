//! Agent, model, and provider records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Usage;

/// Prices are quoted per this many tokens.
pub const PRICE_UNIT_TOKENS: f64 = 1_000_000.0;

/// An agent: instructions plus a default model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,

    /// System prompt template, see the reconciler's prompt renderer
    pub instructions: String,

    pub model_id: String,

    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            instructions: instructions.into(),
            model_id: model_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Dollar prices per million tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_m: f64,
    #[serde(default)]
    pub output_per_m: f64,
    #[serde(default)]
    pub cache_write_per_m: f64,
    #[serde(default)]
    pub cache_read_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, write_per_m: f64, read_per_m: f64) -> Self {
        self.cache_write_per_m = write_per_m;
        self.cache_read_per_m = read_per_m;
        self
    }

    /// Cost of one call. Every component is divided by the same unit.
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_m
            + usage.output_tokens as f64 * self.output_per_m
            + usage.cache_write_tokens as f64 * self.cache_write_per_m
            + usage.cache_read_tokens as f64 * self.cache_read_per_m)
            / PRICE_UNIT_TOKENS
    }
}

/// A model offered by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,

    /// Wire name sent to the provider, e.g. "claude-sonnet-4-20250514"
    pub name: String,

    pub context_window: u32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default)]
    pub pricing: ModelPricing,

    pub provider_id: String,
}

fn default_max_output_tokens() -> u32 {
    8192
}

impl Model {
    pub fn new(name: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            context_window: 200_000,
            max_output_tokens: default_max_output_tokens(),
            pricing: ModelPricing::default(),
            provider_id: provider_id.into(),
        }
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }
}

/// Wire protocol of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    /// Any Chat Completions compatible endpoint
    Openai,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Openai => "openai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(Self::Anthropic),
            "openai" | "openai_compatible" => Some(Self::Openai),
            _ => None,
        }
    }
}

/// A configured provider endpoint with sealed credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub kind: ProviderKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Base64 AES-GCM blob produced by the secrets manager
    pub encrypted_credentials: String,
}

impl ProviderRecord {
    pub fn new(kind: ProviderKind, encrypted_credentials: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            base_url: None,
            encrypted_credentials: encrypted_credentials.into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

impl std::fmt::Debug for ProviderRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("encrypted_credentials", &"[REDACTED]")
            .finish()
    }
}

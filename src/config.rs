#![allow(dead_code)]
//! Service configuration.
//!
//! Settings come from the environment (after `.env` is loaded). Model pricing used
//! for usage cost estimates is loaded from `*.json` files in the pricing directory.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_BUCKET: &str = "documents";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Runtime settings for the service.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    pub storage_bucket: String,
    pub openrouter_api_key: String,
    pub model: String,
    pub model_timeout: Duration,
    pub retry: RetryPolicy,
    /// Reject extractions whose items do not add up to the located subtotal.
    pub strict_reconciliation: bool,
    pub pricing_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("{} not set", key));

        let timeout_secs = parse_or(&lookup, "MODEL_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        let max_attempts = parse_or(&lookup, "EXTRACTION_MAX_ATTEMPTS", 1u32)?;
        let delay_ms = parse_or(&lookup, "RETRY_BASE_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?;
        let strict_reconciliation = parse_or(&lookup, "STRICT_RECONCILIATION", false)?;

        Ok(Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            supabase_url: required("SUPABASE_URL")?.trim_end_matches('/').to_string(),
            supabase_service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
            storage_bucket: lookup("STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            openrouter_api_key: required("OPENROUTER_API_KEY")?,
            model: lookup("EXTRACTION_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            model_timeout: Duration::from_secs(timeout_secs),
            retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                base_delay: Duration::from_millis(delay_ms),
            },
            strict_reconciliation,
            pricing_dir: lookup("PRICING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("configs")),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

/// Bounded retry for model invocations. One attempt means no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    /// Exponential backoff before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Per-model token pricing in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Pricing lookup used by usage reports.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Load all pricing files from the directory. A missing directory yields an empty table.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut prices = HashMap::new();

        if !dir.exists() {
            warn!("Pricing directory {:?} not found, cost estimates disabled", dir);
            return Ok(Self { prices });
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read pricing: {:?}", path))?;

                let pricing: ModelPricing = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse pricing: {:?}", path))?;

                info!("Loaded pricing for {} from {:?}", pricing.model, path);
                prices.insert(pricing.model.clone(), pricing);
            }
        }

        Ok(Self { prices })
    }

    pub fn from_prices(prices: Vec<ModelPricing>) -> Self {
        Self {
            prices: prices.into_iter().map(|p| (p.model.clone(), p)).collect(),
        }
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.prices.get(model)
    }

    /// Estimated cost in USD, `None` if the model has no pricing entry.
    pub fn estimate(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        self.get(model).map(|p| {
            (input_tokens as f64 * p.input_per_million + output_tokens as f64 * p.output_per_million)
                / 1_000_000.0
        })
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }
}

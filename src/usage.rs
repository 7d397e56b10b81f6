//! Usage and audit logging for model invocations.
//!
//! Every invocation attempt produces exactly one [`UsageLogEntry`], on success and on
//! failure. Sink errors are reported through tracing and never reach the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PricingTable;
use crate::error::StoreError;
use crate::openrouter::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Succeeded,
    Failed,
}

/// One audit record per invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogEntry {
    pub flow_name: String,
    pub model: String,
    pub status: UsageStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageLogEntry {
    pub fn succeeded(flow_name: &str, model: &str, usage: TokenUsage, duration: Duration) -> Self {
        Self::build(flow_name, model, UsageStatus::Succeeded, usage, duration, None)
    }

    pub fn failed(
        flow_name: &str,
        model: &str,
        usage: TokenUsage,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self::build(
            flow_name,
            model,
            UsageStatus::Failed,
            usage,
            duration,
            Some(error.into()),
        )
    }

    fn build(
        flow_name: &str,
        model: &str,
        status: UsageStatus,
        usage: TokenUsage,
        duration: Duration,
        error: Option<String>,
    ) -> Self {
        Self {
            flow_name: flow_name.to_string(),
            model: model.to_string(),
            status,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            duration_ms: duration.as_millis() as u64,
            error,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only audit store.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn insert(&self, entry: &UsageLogEntry) -> Result<(), StoreError>;

    /// Entries created at or after `since`, newest first.
    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageLogEntry>, StoreError>;
}

/// Injected logging collaborator for the extraction flow.
#[derive(Clone)]
pub struct UsageRecorder {
    sink: Arc<dyn AuditSink>,
}

impl UsageRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Write one entry. Never fails: sink errors are logged and dropped.
    pub async fn record(&self, entry: UsageLogEntry) {
        match self.sink.insert(&entry).await {
            Ok(()) => debug!(
                "Recorded usage: flow={} model={} status={:?} tokens={} duration={}ms",
                entry.flow_name, entry.model, entry.status, entry.total_tokens, entry.duration_ms
            ),
            Err(e) => warn!(
                "Failed to record usage for {} ({:?}): {}",
                entry.flow_name, entry.status, e
            ),
        }
    }

    /// Aggregate the last `days` days of usage.
    pub async fn report(&self, days: u32, pricing: &PricingTable) -> Result<UsageReport, StoreError> {
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        let entries = self.sink.entries_since(since).await?;
        Ok(summarize(&entries, since, pricing))
    }
}

/// Usage aggregated over a reporting window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub since: DateTime<Utc>,
    pub invocations: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub average_duration_ms: u64,
    /// Sum over models with a known price.
    pub estimated_cost_usd: f64,
    pub by_model: Vec<ModelUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub model: String,
    pub invocations: u64,
    pub failed: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
}

pub fn summarize(entries: &[UsageLogEntry], since: DateTime<Utc>, pricing: &PricingTable) -> UsageReport {
    let mut per_model: BTreeMap<&str, ModelUsage> = BTreeMap::new();
    let mut duration_total: u64 = 0;

    for entry in entries {
        duration_total += entry.duration_ms;
        let usage = per_model
            .entry(entry.model.as_str())
            .or_insert_with(|| ModelUsage {
                model: entry.model.clone(),
                invocations: 0,
                failed: 0,
                input_tokens: 0,
                output_tokens: 0,
                total_tokens: 0,
                estimated_cost_usd: None,
            });
        usage.invocations += 1;
        if entry.status == UsageStatus::Failed {
            usage.failed += 1;
        }
        usage.input_tokens += entry.input_tokens;
        usage.output_tokens += entry.output_tokens;
        usage.total_tokens += entry.total_tokens;
    }

    let by_model: Vec<ModelUsage> = per_model
        .into_values()
        .map(|mut usage| {
            usage.estimated_cost_usd =
                pricing.estimate(&usage.model, usage.input_tokens, usage.output_tokens);
            usage
        })
        .collect();

    let invocations = entries.len() as u64;
    let failed: u64 = by_model.iter().map(|m| m.failed).sum();

    UsageReport {
        since,
        invocations,
        succeeded: invocations - failed,
        failed,
        input_tokens: by_model.iter().map(|m| m.input_tokens).sum(),
        output_tokens: by_model.iter().map(|m| m.output_tokens).sum(),
        total_tokens: by_model.iter().map(|m| m.total_tokens).sum(),
        average_duration_ms: if invocations == 0 {
            0
        } else {
            duration_total / invocations
        },
        estimated_cost_usd: by_model.iter().filter_map(|m| m.estimated_cost_usd).sum(),
        by_model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelPricing;
    use crate::memory_store::MemoryStore;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    }

    #[test]
    fn test_entry_shapes() {
        let ok = UsageLogEntry::succeeded("flow", "m", usage(10, 5), Duration::from_millis(1500));
        assert_eq!(ok.status, UsageStatus::Succeeded);
        assert_eq!(ok.duration_ms, 1500);
        assert!(ok.error.is_none());

        let failed = UsageLogEntry::failed("flow", "m", TokenUsage::default(), Duration::ZERO, "timeout");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "timeout");
        assert_eq!(json["totalTokens"], 0);
    }

    #[tokio::test]
    async fn test_record_swallows_sink_failures() {
        let store = Arc::new(MemoryStore::new());
        store.fail_audit_inserts(true);
        let recorder = UsageRecorder::new(store.clone());

        recorder
            .record(UsageLogEntry::succeeded("flow", "m", usage(1, 1), Duration::ZERO))
            .await;

        assert_eq!(store.audit_entries().len(), 0);
    }

    #[tokio::test]
    async fn test_report_over_window() {
        let store = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::new(store.clone());

        recorder
            .record(UsageLogEntry::succeeded("flow", "a", usage(1000, 200), Duration::from_millis(3000)))
            .await;
        recorder
            .record(UsageLogEntry::failed("flow", "a", usage(500, 0), Duration::from_millis(1000), "bad json"))
            .await;
        recorder
            .record(UsageLogEntry::succeeded("flow", "b", usage(10, 10), Duration::from_millis(2000)))
            .await;

        let pricing = PricingTable::from_prices(vec![ModelPricing {
            model: "a".into(),
            input_per_million: 1.0,
            output_per_million: 4.0,
        }]);
        let report = recorder.report(30, &pricing).await.unwrap();

        assert_eq!(report.invocations, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total_tokens, 1720);
        assert_eq!(report.average_duration_ms, 2000);
        assert_eq!(report.by_model.len(), 2);
        assert_eq!(report.by_model[0].model, "a");
        assert_eq!(report.by_model[1].estimated_cost_usd, None);
        assert!((report.estimated_cost_usd - 0.0023).abs() < 1e-9);
    }
}

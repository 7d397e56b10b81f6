//! Supabase client for the usage audit log and transactional record commits.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::commit::{Persistence, RecordWrite};
use crate::config::Settings;
use crate::error::StoreError;
use crate::usage::{AuditSink, UsageLogEntry, UsageStatus};

const USAGE_TABLE: &str = "ai_usage_logs";
/// Rows requested per audit-log page. Matches the PostgREST `max-rows` default.
const USAGE_PAGE_SIZE: usize = 1000;
/// Postgres function applying a batch of writes inside one transaction.
const COMMIT_RPC: &str = "rpc/commit_records";

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::new(),
            base_url: settings.supabase_url.clone(),
            service_role_key: settings.supabase_service_role_key.clone(),
        }
    }

    /// Helper: POST to Supabase REST API.
    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        Ok(())
    }

    /// Helper: GET from Supabase REST API.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, StoreError> {
        let url = format!("{}/rest/v1/{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message: format!("GET {} failed: {}", path, text),
            });
        }

        resp.json()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))
    }
}

#[async_trait]
impl AuditSink for SupabaseClient {
    async fn insert(&self, entry: &UsageLogEntry) -> Result<(), StoreError> {
        self.post_json(USAGE_TABLE, &UsageLogRow::from(entry)).await?;
        debug!("Inserted usage log for {}", entry.flow_name);
        Ok(())
    }

    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageLogEntry>, StoreError> {
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let rows: Vec<UsageLogRow> = collect_pages(USAGE_PAGE_SIZE, |offset, limit| {
            let query = vec![
                ("select", "*".to_string()),
                ("created_at", format!("gte.{}", since)),
                ("order", "created_at.desc,id.desc".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ];
            async move { self.get_json::<Vec<UsageLogRow>>(USAGE_TABLE, &query).await }
        })
        .await?;

        debug!("Fetched {} usage rows since {}", rows.len(), since);
        Ok(rows.into_iter().map(UsageLogEntry::from).collect())
    }
}

#[async_trait]
impl Persistence for SupabaseClient {
    async fn transaction(&self, writes: Vec<RecordWrite>) -> Result<(), StoreError> {
        debug!("Committing {} records in one transaction", writes.len());
        self.post_json(COMMIT_RPC, &json!({ "writes": writes })).await
    }
}

/// Fetch `limit`/`offset` pages until an empty one comes back. The server may cap
/// a page below `page_size`, so a short page does not end the scan.
async fn collect_pages<T, F, Fut>(page_size: usize, mut fetch: F) -> Result<Vec<T>, StoreError>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, StoreError>>,
{
    let mut rows = Vec::new();
    loop {
        let page = fetch(rows.len(), page_size).await?;
        if page.is_empty() {
            return Ok(rows);
        }
        rows.extend(page);
    }
}

// ============================================================================
// Supabase row types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct UsageLogRow {
    flow_name: String,
    model: String,
    status: UsageStatus,
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    duration_ms: u64,
    #[serde(default)]
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<&UsageLogEntry> for UsageLogRow {
    fn from(entry: &UsageLogEntry) -> Self {
        Self {
            flow_name: entry.flow_name.clone(),
            model: entry.model.clone(),
            status: entry.status,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            total_tokens: entry.total_tokens,
            duration_ms: entry.duration_ms,
            error: entry.error.clone(),
            created_at: entry.timestamp,
        }
    }
}

impl From<UsageLogRow> for UsageLogEntry {
    fn from(row: UsageLogRow) -> Self {
        Self {
            flow_name: row.flow_name,
            model: row.model,
            status: row.status,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            total_tokens: row.total_tokens,
            duration_ms: row.duration_ms,
            error: row.error,
            timestamp: row.created_at,
        }
    }
}

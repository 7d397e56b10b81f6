//! Work-item extraction pipeline: retrieve, invoke the model, validate, audit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{RetryPolicy, Settings};
use crate::error::{ExtractionError, ModelError};
use crate::openrouter::{GenerativeModel, ModelRequest, TokenUsage};
use crate::prompt::{self, EXTRACTION_FLOW_NAME};
use crate::schema::{self, round_currency, ExtractionResult};
use crate::storage::{self, BlobStore};
use crate::usage::{UsageLogEntry, UsageRecorder};

const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Extraction pipeline orchestrator.
pub struct Extractor {
    blobs: Arc<dyn BlobStore>,
    model: Arc<dyn GenerativeModel>,
    recorder: UsageRecorder,
    timeout: Duration,
    retry: RetryPolicy,
    strict_reconciliation: bool,
}

/// What one model attempt produced, including usage for the audit log.
struct Attempt {
    outcome: Result<ExtractionResult, ExtractionError>,
    model: String,
    usage: TokenUsage,
}

impl Extractor {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        model: Arc<dyn GenerativeModel>,
        recorder: UsageRecorder,
    ) -> Self {
        Self {
            blobs,
            model,
            recorder,
            timeout: DEFAULT_MODEL_TIMEOUT,
            retry: RetryPolicy::single(),
            strict_reconciliation: false,
        }
    }

    /// Apply timeout, retry and strictness from the service settings.
    pub fn configured(mut self, settings: &Settings) -> Self {
        self.timeout = settings.model_timeout;
        self.retry = settings.retry;
        self.strict_reconciliation = settings.strict_reconciliation;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_strict_reconciliation(mut self, strict: bool) -> Self {
        self.strict_reconciliation = strict;
        self
    }

    /// Extract work items from the document at `storage_path`.
    ///
    /// Exactly one usage entry is recorded per model attempt, and one for a
    /// retrieval failure. Errors are returned unchanged after logging.
    pub async fn extract(&self, storage_path: &str) -> Result<ExtractionResult, ExtractionError> {
        info!(
            "Starting extraction for: {} (model={}, prompt={})",
            storage_path,
            self.model.model(),
            prompt::EXTRACTION_PROMPT_VERSION
        );
        let started = Instant::now();

        let media = match storage::retrieve_inline(self.blobs.as_ref(), storage_path).await {
            Ok(media) => media,
            Err(e) => {
                let err = ExtractionError::from(e);
                error!("Retrieval failed for {}: {}", storage_path, err);
                self.recorder
                    .record(UsageLogEntry::failed(
                        EXTRACTION_FLOW_NAME,
                        self.model.model(),
                        TokenUsage::default(),
                        started.elapsed(),
                        err.to_string(),
                    ))
                    .await;
                return Err(err);
            }
        };

        let request = prompt::build_request(&media, prompt::filename_of(storage_path));
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt_started = started;
        let mut attempt_number = 1;

        loop {
            let attempt = self.attempt(&request).await;
            let elapsed = attempt_started.elapsed();

            let entry = match &attempt.outcome {
                Ok(_) => UsageLogEntry::succeeded(
                    EXTRACTION_FLOW_NAME,
                    &attempt.model,
                    attempt.usage,
                    elapsed,
                ),
                Err(e) => UsageLogEntry::failed(
                    EXTRACTION_FLOW_NAME,
                    &attempt.model,
                    attempt.usage,
                    elapsed,
                    e.to_string(),
                ),
            };
            self.recorder.record(entry).await;

            match attempt.outcome {
                Ok(result) => {
                    info!(
                        "Extraction complete for {}: {} items, sum {:.2}, subtotal {:?} ({} tokens, {}ms)",
                        storage_path,
                        result.work_items.len(),
                        round_currency(result.computed_total()),
                        result.subtotal,
                        attempt.usage.total_tokens,
                        elapsed.as_millis()
                    );
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt_number < max_attempts => {
                    let delay = self.retry.delay_after(attempt_number);
                    warn!(
                        "Extraction attempt {}/{} failed for {}: {} (retrying in {:?})",
                        attempt_number, max_attempts, storage_path, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt_number += 1;
                    attempt_started = Instant::now();
                }
                Err(e) => {
                    error!("Extraction failed for {}: {}", storage_path, e);
                    return Err(e);
                }
            }
        }
    }

    /// One model call under the timeout, followed by schema validation.
    async fn attempt(&self, request: &ModelRequest) -> Attempt {
        let configured_model = self.model.model().to_string();

        let response = match tokio::time::timeout(self.timeout, self.model.invoke(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Attempt {
                    usage: e.usage(),
                    outcome: Err(e.into()),
                    model: configured_model,
                }
            }
            Err(_) => {
                return Attempt {
                    outcome: Err(ModelError::Timeout(self.timeout.as_secs()).into()),
                    model: configured_model,
                    usage: TokenUsage::default(),
                }
            }
        };

        let outcome = match response.output.as_deref() {
            None => Err(ModelError::EmptyOutput.into()),
            Some(text) => {
                debug!("Raw model response length: {} chars", text.len());
                schema::parse_extraction(text).and_then(|result| self.check_reconciliation(result))
            }
        };

        Attempt {
            outcome,
            model: response.model,
            usage: response.usage,
        }
    }

    /// Mismatches are advisory unless strict reconciliation is enabled.
    fn check_reconciliation(
        &self,
        result: ExtractionResult,
    ) -> Result<ExtractionResult, ExtractionError> {
        if !result.is_mismatched() {
            return Ok(result);
        }

        let message = format!(
            "line items sum to {:.2} but document subtotal is {:.2}",
            result.computed_total(),
            result.subtotal.unwrap_or_default()
        );

        if self.strict_reconciliation {
            Err(ExtractionError::SchemaValidation(message))
        } else {
            warn!("Reconciliation mismatch left for review: {}", message);
            Ok(result)
        }
    }
}

//! Schema-validated structured extraction with bounded retry.
//!
//! Wraps any text-producing capability: the schema and instruction go in,
//! the capability's reply is parsed and validated, and on failure the
//! capability is re-invoked with feedback about the prior violation appended
//! to the instruction, up to a bounded number of attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use super::router::{CapabilityConfig, CapabilityError, CapabilityRouter};
use super::schema::SchemaDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Total attempts, including the first (default 3).
    pub max_attempts: u32,
    pub capability: CapabilityConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            capability: CapabilityConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The capability itself is unknown; retrying cannot help.
    #[error("capability invocation failed: {0}")]
    Capability(#[from] CapabilityError),
    #[error("extraction failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Counters for retry behavior, mirrored into a snapshot on demand.
#[derive(Debug, Default)]
struct RetryMetrics {
    total_attempts: AtomicU64,
    first_attempt_successes: AtomicU64,
    first_attempt_failures: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
}

impl RetryMetrics {
    fn record_success(&self, attempt: u32) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt == 1 {
            self.first_attempt_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.successful_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_failure(&self, attempt: u32) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt == 1 {
            self.first_attempt_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_retries.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Snapshot of extraction retry metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryMetricsSummary {
    pub total_attempts: u64,
    pub first_attempt_successes: u64,
    pub first_attempt_failures: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
}

impl RetryMetricsSummary {
    pub fn retry_success_rate(&self) -> f64 {
        let retries = self.successful_retries + self.failed_retries;
        if retries == 0 {
            0.0
        } else {
            self.successful_retries as f64 / retries as f64
        }
    }
}

/// Compose the instruction for one attempt. Pure: the retry loop's behavior
/// is fully determined by (attempt number, last error).
pub fn retry_instruction(base: &str, attempt: u32, last_error: Option<&str>) -> String {
    match (attempt, last_error) {
        (1, _) | (_, None) => base.to_string(),
        (_, Some(err)) => format!(
            "{base}\n\nYour previous reply was rejected: {err}\n\
             Return ONLY a JSON value that conforms to the schema. \
             No prose, no code fences."
        ),
    }
}

/// Extract the first balanced JSON object or array from a text blob,
/// tolerating prose before and after it.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + idx + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Schema-validated extraction against a capability, with bounded retry.
pub struct StructuredExtractor {
    router: Arc<CapabilityRouter>,
    metrics: RetryMetrics,
}

impl StructuredExtractor {
    pub fn new(router: Arc<CapabilityRouter>) -> Self {
        Self {
            router,
            metrics: RetryMetrics::default(),
        }
    }

    /// Run the extraction loop. Capability timeouts and handler failures
    /// consume an attempt like validation failures do; an unknown capability
    /// aborts immediately.
    pub async fn extract(
        &self,
        capability: &str,
        schema: &SchemaDef,
        instruction: &str,
        config: &ExtractionConfig,
    ) -> Result<JsonValue, ExtractionError> {
        let max_attempts = config.max_attempts.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            let prompt = retry_instruction(instruction, attempt, last_error.as_deref());
            let input = json!({
                "task": "structured_extraction",
                "schema": schema.document(),
                "instruction": prompt,
            });

            let output = match self.router.invoke(capability, input, &config.capability).await {
                Ok(output) => output,
                Err(err @ CapabilityError::Unknown(_)) => {
                    self.metrics.record_failure(attempt);
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::debug!(capability, attempt, error = %err, "extraction attempt failed");
                    self.metrics.record_failure(attempt);
                    last_error = Some(err.to_string());
                    continue;
                }
            };

            match Self::parse_candidate(&output).and_then(|value| {
                schema
                    .validate(&value)
                    .map(|_| value)
                    .map_err(|e| e.to_string())
            }) {
                Ok(value) => {
                    self.metrics.record_success(attempt);
                    return Ok(value);
                }
                Err(detail) => {
                    tracing::debug!(capability, attempt, %detail, "extraction output rejected");
                    self.metrics.record_failure(attempt);
                    last_error = Some(detail);
                }
            }
        }

        Err(ExtractionError::Exhausted {
            attempts: max_attempts,
            last_error: last_error.unwrap_or_else(|| "no output produced".to_string()),
        })
    }

    pub fn metrics(&self) -> RetryMetricsSummary {
        RetryMetricsSummary {
            total_attempts: self.metrics.total_attempts.load(Ordering::Relaxed),
            first_attempt_successes: self
                .metrics
                .first_attempt_successes
                .load(Ordering::Relaxed),
            first_attempt_failures: self.metrics.first_attempt_failures.load(Ordering::Relaxed),
            successful_retries: self.metrics.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.metrics.failed_retries.load(Ordering::Relaxed),
        }
    }

    /// A capability may return structured JSON directly, or text that wraps
    /// a JSON value in prose.
    fn parse_candidate(output: &JsonValue) -> Result<JsonValue, String> {
        match output {
            JsonValue::String(text) => {
                let block = extract_json_block(text)
                    .ok_or_else(|| "no JSON value found in reply".to_string())?;
                serde_json::from_str(block).map_err(|e| format!("malformed JSON in reply: {e}"))
            }
            other => Ok(other.clone()),
        }
    }
}

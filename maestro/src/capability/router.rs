//! Resolves capability identifiers and aliases to handlers and executes
//! requests with a caller-supplied timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability '{0}' conflicts with an existing registration")]
    Conflict(String),
    #[error("unknown capability '{0}'")]
    Unknown(String),
    #[error("capability '{id}' timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },
    #[error("capability '{id}' failed: {message}")]
    Handler { id: String, message: String },
}

impl CapabilityError {
    /// Handler-side failure helper for provider implementations.
    pub fn handler(id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        CapabilityError::Handler {
            id: id.into(),
            message: message.to_string(),
        }
    }
}

/// Per-invocation configuration forwarded to the handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Overrides the router's default timeout when set.
    pub timeout_ms: Option<u64>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl CapabilityConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A registered capability implementation.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn execute(
        &self,
        input: JsonValue,
        config: &CapabilityConfig,
    ) -> Result<JsonValue, CapabilityError>;
}

/// Introspection record for one registered capability.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub id: String,
    pub aliases: Vec<String>,
    pub description: String,
}

struct CapabilityEntry {
    id: String,
    aliases: Vec<String>,
    description: String,
    handler: Arc<dyn CapabilityHandler>,
}

/// Capability lookup and execution. Registration completes before the queue
/// dispatches; afterwards the maps are read-mostly and shared across workers.
pub struct CapabilityRouter {
    entries: RwLock<HashMap<String, Arc<CapabilityEntry>>>,
    // Canonical ids and aliases both map to the canonical id.
    names: RwLock<HashMap<String, String>>,
    default_timeout_ms: u64,
}

impl CapabilityRouter {
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    pub fn new() -> Self {
        Self::with_default_timeout(Self::DEFAULT_TIMEOUT_MS)
    }

    pub fn with_default_timeout(default_timeout_ms: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            default_timeout_ms,
        }
    }

    /// Register a capability under its id and aliases.
    ///
    /// Fails with `Conflict` if the id or any alias already maps to a
    /// different handler. Re-registering the same handler under the same
    /// names is a no-op, so idempotent init hooks are safe.
    pub async fn register(
        &self,
        id: impl Into<String>,
        aliases: Vec<String>,
        description: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<(), CapabilityError> {
        let id = id.into();
        let mut entries = self.entries.write().await;
        let mut names = self.names.write().await;

        let mut all_names = vec![id.clone()];
        all_names.extend(aliases.iter().cloned());
        for name in &all_names {
            if let Some(existing) = names.get(name) {
                let same_handler = entries
                    .get(existing)
                    .map(|e| Arc::ptr_eq(&e.handler, &handler))
                    .unwrap_or(false);
                if existing != &id || !same_handler {
                    return Err(CapabilityError::Conflict(name.clone()));
                }
            }
        }

        for name in &all_names {
            names.insert(name.clone(), id.clone());
        }
        tracing::debug!(capability = %id, aliases = ?aliases, "capability registered");
        entries.insert(
            id.clone(),
            Arc::new(CapabilityEntry {
                id,
                aliases,
                description: description.into(),
                handler,
            }),
        );
        Ok(())
    }

    /// Pure, deterministic lookup: id or alias to exactly one handler.
    pub async fn resolve(
        &self,
        id_or_alias: &str,
    ) -> Result<Arc<dyn CapabilityHandler>, CapabilityError> {
        let entry = self.entry(id_or_alias).await?;
        Ok(entry.handler.clone())
    }

    /// Canonical id behind an id or alias.
    pub async fn canonical_id(&self, id_or_alias: &str) -> Result<String, CapabilityError> {
        Ok(self.entry(id_or_alias).await?.id.clone())
    }

    /// Resolve then execute. No retry here; retry policy belongs to callers
    /// that need it. The timeout comes from the config or the router default.
    pub async fn invoke(
        &self,
        id_or_alias: &str,
        input: JsonValue,
        config: &CapabilityConfig,
    ) -> Result<JsonValue, CapabilityError> {
        let entry = self.entry(id_or_alias).await?;
        let timeout_ms = config.timeout_ms.unwrap_or(self.default_timeout_ms);
        tracing::debug!(capability = %entry.id, timeout_ms, "invoking capability");
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            entry.handler.execute(input, config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                id: entry.id.clone(),
                timeout_ms,
            }),
        }
    }

    /// Registered capabilities with their aliases, for introspection.
    pub async fn list(&self) -> Vec<CapabilityInfo> {
        let entries = self.entries.read().await;
        let mut infos: Vec<CapabilityInfo> = entries
            .values()
            .map(|e| CapabilityInfo {
                id: e.id.clone(),
                aliases: e.aliases.clone(),
                description: e.description.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    async fn entry(&self, id_or_alias: &str) -> Result<Arc<CapabilityEntry>, CapabilityError> {
        let names = self.names.read().await;
        let canonical = names
            .get(id_or_alias)
            .ok_or_else(|| CapabilityError::Unknown(id_or_alias.to_string()))?;
        let entries = self.entries.read().await;
        entries
            .get(canonical)
            .cloned()
            .ok_or_else(|| CapabilityError::Unknown(id_or_alias.to_string()))
    }
}

impl Default for CapabilityRouter {
    fn default() -> Self {
        Self::new()
    }
}

//! Memory-provider interface for conversation history.
//!
//! The engine calls a memory provider only to seed planner context, never to
//! gate control flow: failures are logged and ignored by callers. Persistent
//! backends are collaborator-implemented; `InMemoryMemory` ships as the
//! default and as a test double.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use async_trait::async_trait;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory backend error: {0}")]
    Backend(String),
}

/// One stored user interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user: String,
    pub platform: String,
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Interaction {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp as i64)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn store_user_interaction(&self, interaction: Interaction) -> Result<(), MemoryError>;

    /// Past interactions for a user on a platform, ordered oldest to newest,
    /// at most `limit` entries (the most recent ones).
    async fn recent_history(
        &self,
        user: &str,
        platform: &str,
        limit: usize,
    ) -> Result<Vec<Interaction>, MemoryError>;
}

/// Unbounded in-process store.
#[derive(Default)]
pub struct InMemoryMemory {
    entries: RwLock<Vec<Interaction>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryProvider for InMemoryMemory {
    async fn store_user_interaction(&self, interaction: Interaction) -> Result<(), MemoryError> {
        self.entries.write().await.push(interaction);
        Ok(())
    }

    async fn recent_history(
        &self,
        user: &str,
        platform: &str,
        limit: usize,
    ) -> Result<Vec<Interaction>, MemoryError> {
        let entries = self.entries.read().await;
        let mut matches: Vec<Interaction> = entries
            .iter()
            .filter(|i| {
                i.user.eq_ignore_ascii_case(user) && i.platform.eq_ignore_ascii_case(platform)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|i| i.timestamp);
        let start = matches.len().saturating_sub(limit);
        Ok(matches.split_off(start))
    }
}

//! Monitor fan-out for run lifecycle events.
//!
//! A `MonitorService` instance is constructed once at startup and passed to
//! every component that publishes; there is no ambient global. Publishing is
//! fire-and-forget: the executor never awaits a sink, and sink failures are
//! logged and swallowed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::types::{now_millis, ConversationKey, EventId};

/// Lifecycle events published while a run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorEventKind {
    RunStarted,
    PlanAccepted,
    StepStarted,
    StepCompleted,
    StepFailed,
    PipelineReplaced,
    ReplanFallback,
    RunCompleted,
    RunFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    pub kind: MonitorEventKind,
    pub event_id: EventId,
    pub conversation_key: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub detail: JsonValue,
}

impl MonitorEvent {
    pub fn new(
        kind: MonitorEventKind,
        event_id: impl Into<String>,
        key: &ConversationKey,
        detail: JsonValue,
    ) -> Self {
        Self {
            kind,
            event_id: event_id.into(),
            conversation_key: key.as_str().to_string(),
            timestamp: now_millis(),
            detail,
        }
    }
}

/// Collaborator-implemented telemetry sink.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn on_event(&self, event: &MonitorEvent) -> anyhow::Result<()>;
}

/// Fans monitor events out to registered sinks without blocking the caller.
#[derive(Default)]
pub struct MonitorService {
    sinks: Vec<Arc<dyn MonitorSink>>,
}

impl MonitorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sink(&mut self, sink: Arc<dyn MonitorSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Publish to all sinks on a detached task. Never awaited by callers;
    /// sink errors are logged, never propagated.
    pub fn publish(&self, event: MonitorEvent) {
        if self.sinks.is_empty() {
            return;
        }
        let sinks = self.sinks.clone();
        tokio::spawn(async move {
            let results =
                futures::future::join_all(sinks.iter().map(|s| s.on_event(&event))).await;
            for err in results.into_iter().filter_map(Result::err) {
                tracing::warn!(
                    kind = ?event.kind,
                    event_id = %event.event_id,
                    error = %err,
                    "monitor sink failed"
                );
            }
        });
    }
}

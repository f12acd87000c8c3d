//! Core data model shared by every component of the engine.
//!
//! Everything that crosses a component boundary lives here: inbound events,
//! context items and their typed payloads, pipeline steps, and the outcome
//! handed to a response handler when a run terminates.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::context_chain::ContextChain;

pub type EventId = String;
pub type PluginId = String;
pub type ContextItemId = String;

/// Current time as epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Validation failure for a submitted event, rejected before queueing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("missing required event field: {0}")]
    MissingField(&'static str),
}

/// Platform metadata attached to an event by its producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformMetadata {
    /// Platform name, e.g. "discord" or "cli".
    pub platform: String,
    /// Optional channel/room identifier within the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Producer-specific extras, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
}

impl PlatformMetadata {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            channel: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Producer-supplied unit of work: one inbound message or trigger.
///
/// The optional response handler is invoked exactly once by the executor at
/// termination, with the final chain and a success/failure status.
#[derive(Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub plugin_id: PluginId,
    pub action: String,
    /// Type tag, e.g. "user_input" or "timer_tick".
    pub kind: String,
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformMetadata>,
    #[serde(skip)]
    pub respond: Option<Arc<dyn ResponseHandler>>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        plugin_id: impl Into<String>,
        action: impl Into<String>,
        kind: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            action: action.into(),
            kind: kind.into(),
            content: content.into(),
            timestamp: now_millis(),
            user: None,
            platform: None,
            respond: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_platform(mut self, platform: PlatformMetadata) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_response_handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.respond = Some(handler);
        self
    }

    /// Check the required fields. Runs before queueing; an invalid event is
    /// never admitted.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.id.is_empty() {
            return Err(EventError::MissingField("id"));
        }
        if self.plugin_id.is_empty() {
            return Err(EventError::MissingField("pluginId"));
        }
        if self.action.is_empty() {
            return Err(EventError::MissingField("action"));
        }
        if self.kind.is_empty() {
            return Err(EventError::MissingField("type"));
        }
        if self.timestamp == 0 {
            return Err(EventError::MissingField("timestamp"));
        }
        Ok(())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("action", &self.action)
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp)
            .field("user", &self.user)
            .field("has_response_handler", &self.respond.is_some())
            .finish()
    }
}

/// Ordering/concurrency partition key: user + platform, or a synthetic
/// per-event key when the event carries no user identity.
///
/// Runs sharing a key are serialized in submission order; distinct keys run
/// concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn for_event(event: &Event) -> Self {
        match &event.user {
            Some(user) => {
                let platform = event
                    .platform
                    .as_ref()
                    .map(|p| p.platform.as_str())
                    .unwrap_or("default");
                Self(format!(
                    "{}@{}",
                    user.to_lowercase(),
                    platform.to_lowercase()
                ))
            }
            // No user identity: keep keyless events maximally concurrent.
            None => Self(format!("event:{}", event.id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed payload of a context item, selected by its type tag.
///
/// Collaborator-defined tags go through `Extension`, which documents its
/// required keys in `fields` rather than spreading them across the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemBody {
    /// Inbound message that seeded the chain.
    UserInput {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },
    /// Output of a successfully executed pipeline step.
    StepOutput { content: JsonValue },
    /// A failed step or planning phase. Appended, never replacing prior items.
    StepError {
        plugin_id: PluginId,
        action: String,
        detail: String,
    },
    /// Open-tagged payload for collaborator-defined item kinds.
    Extension {
        tag: String,
        content: JsonValue,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        fields: BTreeMap<String, JsonValue>,
    },
}

impl ItemBody {
    /// The type tag downstream consumers dispatch on.
    pub fn kind(&self) -> &str {
        match self {
            ItemBody::UserInput { .. } => "user_input",
            ItemBody::StepOutput { .. } => "step_output",
            ItemBody::StepError { .. } => "step_error",
            ItemBody::Extension { tag, .. } => tag,
        }
    }
}

/// One immutable fact in a context chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: ContextItemId,
    /// Plugin that produced this item.
    pub plugin_id: PluginId,
    /// Action that produced this item.
    pub action: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub body: ItemBody,
}

impl ContextItem {
    pub fn new(
        plugin_id: impl Into<String>,
        action: impl Into<String>,
        body: ItemBody,
    ) -> Self {
        Self {
            id: format!("ctx-{}", Uuid::new_v4()),
            plugin_id: plugin_id.into(),
            action: action.into(),
            timestamp: now_millis(),
            body,
        }
    }

    /// Seed item derived from an inbound event.
    pub fn from_event(event: &Event) -> Self {
        let body = if event.kind == "user_input" {
            ItemBody::UserInput {
                content: event.content.clone(),
                user: event.user.clone(),
                platform: event.platform.as_ref().map(|p| p.platform.clone()),
            }
        } else {
            ItemBody::Extension {
                tag: event.kind.clone(),
                content: JsonValue::String(event.content.clone()),
                fields: BTreeMap::new(),
            }
        };
        Self {
            id: format!("ctx-{}", Uuid::new_v4()),
            plugin_id: event.plugin_id.clone(),
            action: event.action.clone(),
            timestamp: event.timestamp,
            body,
        }
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }
}

/// One planned unit of work: a (plugin, action) reference that must exist in
/// the plugin registry at plan-acceptance time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineStep {
    pub plugin_id: PluginId,
    pub action: String,
}

impl PipelineStep {
    pub fn new(plugin_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin_id, self.action)
    }
}

/// Ordered sequence of steps driving one run. Owned by a single executor;
/// replaceable wholesale by a replan decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    steps: VecDeque<PipelineStep>,
}

impl Pipeline {
    pub fn new(steps: Vec<PipelineStep>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Remove and return the next step to execute.
    pub fn pop_next(&mut self) -> Option<PipelineStep> {
        self.steps.pop_front()
    }

    /// Discard all not-yet-executed steps and substitute the given ones.
    pub fn replace(&mut self, steps: Vec<PipelineStep>) {
        self.steps = steps.into();
    }

    /// Snapshot of the steps still to run, in order.
    pub fn remaining_steps(&self) -> Vec<PipelineStep> {
        self.steps.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Terminal status of one executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    Failure { error: String },
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success)
    }

    pub fn failure(error: impl fmt::Display) -> Self {
        RunStatus::Failure {
            error: error.to_string(),
        }
    }
}

/// Final product of a run, handed to the response handler exactly once.
#[derive(Debug)]
pub struct RunOutcome {
    pub event_id: EventId,
    pub conversation_key: ConversationKey,
    pub status: RunStatus,
    pub chain: ContextChain,
}

/// Callback owned by the originating collaborator, invoked exactly once when
/// a run terminates (success or failure) with the final chain.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn on_complete(&self, outcome: &RunOutcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event::new("e1", "p-text", "receive", "user_input", "hello")
    }

    #[test]
    fn test_event_validation_rejects_missing_fields() {
        assert!(event().validate().is_ok());

        let mut bad = event();
        bad.id = String::new();
        assert_eq!(bad.validate(), Err(EventError::MissingField("id")));

        let mut bad = event();
        bad.action = String::new();
        assert_eq!(bad.validate(), Err(EventError::MissingField("action")));

        let mut bad = event();
        bad.timestamp = 0;
        assert_eq!(bad.validate(), Err(EventError::MissingField("timestamp")));
    }

    #[test]
    fn test_conversation_key_user_platform() {
        let e = event()
            .with_user("Alice")
            .with_platform(PlatformMetadata::new("Discord"));
        assert_eq!(ConversationKey::for_event(&e).as_str(), "alice@discord");

        let e = event().with_user("alice");
        assert_eq!(ConversationKey::for_event(&e).as_str(), "alice@default");
    }

    #[test]
    fn test_conversation_key_synthetic_when_no_user() {
        let key = ConversationKey::for_event(&event());
        assert_eq!(key.as_str(), "event:e1");
    }

    #[test]
    fn test_seed_item_from_user_input_event() {
        let e = event().with_user("alice");
        let item = ContextItem::from_event(&e);
        assert_eq!(item.kind(), "user_input");
        assert_eq!(item.plugin_id, "p-text");
        assert_eq!(item.timestamp, e.timestamp);
        match item.body {
            ItemBody::UserInput { content, user, .. } => {
                assert_eq!(content, "hello");
                assert_eq!(user.as_deref(), Some("alice"));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_seed_item_from_open_tagged_event() {
        let e = Event::new("e2", "p-cron", "tick", "timer_tick", "daily");
        let item = ContextItem::from_event(&e);
        assert_eq!(item.kind(), "timer_tick");
    }

    #[test]
    fn test_pipeline_pop_and_replace() {
        let mut p = Pipeline::new(vec![
            PipelineStep::new("a", "one"),
            PipelineStep::new("a", "two"),
            PipelineStep::new("b", "three"),
        ]);
        assert_eq!(p.pop_next().unwrap().action, "one");
        assert_eq!(p.remaining_steps().len(), 2);

        p.replace(vec![PipelineStep::new("c", "four")]);
        assert_eq!(p.len(), 1);
        assert_eq!(p.pop_next().unwrap(), PipelineStep::new("c", "four"));
        assert!(p.pop_next().is_none());
    }

    #[test]
    fn test_item_body_serde_round_trip() {
        let body = ItemBody::StepError {
            plugin_id: "p".into(),
            action: "a".into(),
            detail: "boom".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "step_error");
        let back: ItemBody = serde_json::from_value(json).unwrap();
        assert_eq!(back, body);
    }
}

//! The state machine that drives one event end-to-end.
//!
//! One executor run owns its chain and pipeline exclusively. The run moves
//! through `Planning -> Running <-> Replanning` and terminates on success,
//! empty plan, or failure; the event's response handler is invoked exactly
//! once at termination with the final chain.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::context_chain::ContextChain;
use crate::memory::{Interaction, MemoryProvider};
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorService};
use crate::planner::{PipelinePlanner, ReplanDecision};
use crate::plugin::PluginRegistry;
use crate::types::{
    ContextItem, ConversationKey, Event, ItemBody, PipelineStep, RunOutcome, RunStatus,
};

/// Synthetic plugin id recorded on items produced by the engine itself.
const PLANNER_ORIGIN: &str = "maestro.planner";

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// When false, a failed step is recorded and the run continues with the
    /// next step instead of terminating.
    pub halt_on_step_failure: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            halt_on_step_failure: true,
        }
    }
}

/// Drives one event through planning, execution, and replanning.
pub struct PipelineExecutor {
    registry: Arc<PluginRegistry>,
    planner: Arc<PipelinePlanner>,
    monitor: Arc<MonitorService>,
    memory: Option<Arc<dyn MemoryProvider>>,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        planner: Arc<PipelinePlanner>,
        monitor: Arc<MonitorService>,
    ) -> Self {
        Self {
            registry,
            planner,
            monitor,
            memory: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one event to termination. Consumes the event; returns the outcome
    /// after the response handler (if any) has been invoked.
    pub async fn run(&self, event: Event) -> RunOutcome {
        let key = ConversationKey::for_event(&event);
        self.record_interaction(&event).await;

        let mut chain = ContextChain::seeded_from(&event);
        self.publish(MonitorEventKind::RunStarted, &event, &key, json!({}));
        tracing::info!(event_id = %event.id, key = %key, "run started");

        let status = self.drive(&event, &key, &mut chain).await;

        match &status {
            RunStatus::Success => {
                tracing::info!(event_id = %event.id, items = chain.len(), "run completed");
                self.publish(
                    MonitorEventKind::RunCompleted,
                    &event,
                    &key,
                    json!({ "items": chain.len() }),
                );
            }
            RunStatus::Failure { error } => {
                tracing::warn!(event_id = %event.id, %error, "run failed");
                self.publish(
                    MonitorEventKind::RunFailed,
                    &event,
                    &key,
                    json!({ "error": error }),
                );
            }
        }

        let outcome = RunOutcome {
            event_id: event.id.clone(),
            conversation_key: key,
            status,
            chain,
        };
        if let Some(handler) = &event.respond {
            handler.on_complete(&outcome).await;
        }
        outcome
    }

    async fn drive(
        &self,
        event: &Event,
        key: &ConversationKey,
        chain: &mut ContextChain,
    ) -> RunStatus {
        // Planning
        let mut pipeline = match self.planner.plan(chain).await {
            Ok(pipeline) => pipeline,
            Err(err) => {
                self.append_error(chain, PLANNER_ORIGIN, "plan", &err.to_string());
                return RunStatus::failure(err);
            }
        };
        self.publish(
            MonitorEventKind::PlanAccepted,
            event,
            key,
            json!({ "steps": pipeline.remaining_steps() }),
        );

        // Running <-> Replanning
        while let Some(step) = pipeline.pop_next() {
            self.publish(
                MonitorEventKind::StepStarted,
                event,
                key,
                json!({ "step": step }),
            );

            if let Some(failure) = self.execute_step(event, key, chain, &step).await {
                if self.config.halt_on_step_failure {
                    return failure;
                }
                tracing::warn!(step = %step, "step failed; continuing per policy");
            }

            match self
                .planner
                .should_replan(chain, &pipeline.remaining_steps())
                .await
            {
                ReplanDecision::Continue => {}
                ReplanDecision::Replace { steps, reason } => {
                    // The substitution itself is not part of the semantic
                    // chain; it is only surfaced to the monitor.
                    self.publish(
                        MonitorEventKind::PipelineReplaced,
                        event,
                        key,
                        json!({ "steps": steps, "reason": reason }),
                    );
                    tracing::info!(event_id = %event.id, %reason, "pipeline replaced");
                    pipeline.replace(steps);
                }
            }
        }

        RunStatus::Success
    }

    /// Execute one step, appending its items. Returns the terminal failure
    /// status when the step cannot be resolved or its handler errs.
    async fn execute_step(
        &self,
        event: &Event,
        key: &ConversationKey,
        chain: &mut ContextChain,
        step: &PipelineStep,
    ) -> Option<RunStatus> {
        let handler = match self.registry.lookup(&step.plugin_id, &step.action) {
            Ok(handler) => handler,
            Err(err) => {
                self.append_error(chain, &step.plugin_id, &step.action, &err.to_string());
                self.publish(
                    MonitorEventKind::StepFailed,
                    event,
                    key,
                    json!({ "step": step, "error": err.to_string() }),
                );
                return Some(RunStatus::failure(err));
            }
        };

        match handler.execute(chain).await {
            Ok(items) => {
                for item in items {
                    if let Err(err) = chain.append(item) {
                        // A handler returning a duplicate id is a handler bug
                        // and fails the step like any other execution error.
                        self.append_error(chain, &step.plugin_id, &step.action, &err.to_string());
                        self.publish(
                            MonitorEventKind::StepFailed,
                            event,
                            key,
                            json!({ "step": step, "error": err.to_string() }),
                        );
                        return Some(RunStatus::failure(err));
                    }
                }
                self.publish(
                    MonitorEventKind::StepCompleted,
                    event,
                    key,
                    json!({ "step": step }),
                );
                None
            }
            Err(err) => {
                self.append_error(chain, &step.plugin_id, &step.action, &err.to_string());
                self.publish(
                    MonitorEventKind::StepFailed,
                    event,
                    key,
                    json!({ "step": step, "error": err.to_string() }),
                );
                Some(RunStatus::failure(err))
            }
        }
    }

    fn append_error(&self, chain: &mut ContextChain, plugin_id: &str, action: &str, detail: &str) {
        let item = ContextItem::new(
            plugin_id,
            action,
            ItemBody::StepError {
                plugin_id: plugin_id.to_string(),
                action: action.to_string(),
                detail: detail.to_string(),
            },
        );
        if let Err(err) = chain.append(item) {
            tracing::error!(error = %err, "failed to append error item");
        }
    }

    /// Store an inbound user message with the memory provider. Never gates
    /// control flow; failures are logged and ignored.
    async fn record_interaction(&self, event: &Event) {
        let (Some(memory), Some(user)) = (&self.memory, &event.user) else {
            return;
        };
        if event.kind != "user_input" {
            return;
        }
        let interaction = Interaction {
            user: user.clone(),
            platform: event
                .platform
                .as_ref()
                .map(|p| p.platform.clone())
                .unwrap_or_else(|| "default".to_string()),
            content: event.content.clone(),
            timestamp: event.timestamp,
            message_id: Some(event.id.clone()),
        };
        if let Err(err) = memory.store_user_interaction(interaction).await {
            tracing::warn!(error = %err, "failed to store user interaction");
        }
    }

    fn publish(
        &self,
        kind: MonitorEventKind,
        event: &Event,
        key: &ConversationKey,
        detail: serde_json::Value,
    ) {
        self.monitor
            .publish(MonitorEvent::new(kind, event.id.clone(), key, detail));
    }
}

//! Pipeline planning over a generative planning capability.
//!
//! The planner turns the current chain plus the registry's step catalog into
//! an ordered pipeline through one structured-extraction call, and after
//! every executed step judges whether the rest of the pipeline should be
//! replaced. It owns every prompt the engine sends to the planning
//! capability.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::{
    CapabilityRouter, ExtractionConfig, ExtractionError, SchemaDef, StructuredExtractor,
};
use crate::context_chain::ContextChain;
use crate::memory::MemoryProvider;
use crate::plugin::{PluginRegistry, StepDescriptor};
use crate::types::{ItemBody, Pipeline, PipelineStep};

pub const DEFAULT_PLANNING_CAPABILITY: &str = "planning";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Capability id or alias invoked for planning and replanning.
    pub capability: String,
    /// How many trailing chain items to include in prompts.
    pub max_chain_items: usize,
    /// How many past interactions to pull from the memory provider.
    pub history_limit: usize,
    pub extraction: ExtractionConfig,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            capability: DEFAULT_PLANNING_CAPABILITY.to_string(),
            max_chain_items: 20,
            history_limit: 10,
            extraction: ExtractionConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planning capability failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("plan references unknown step {0}")]
    UnknownStep(PipelineStep),
    #[error("malformed plan shape: {0}")]
    Malformed(String),
}

/// Outcome of the post-step replan judgement.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplanDecision {
    /// Keep executing the original remaining steps.
    Continue,
    /// Discard the not-yet-executed steps and substitute these.
    Replace {
        steps: Vec<PipelineStep>,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct PlanDoc {
    steps: Vec<PipelineStep>,
}

#[derive(Debug, Deserialize)]
struct ReplanDoc {
    revise: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    steps: Option<Vec<PipelineStep>>,
}

fn plan_schema() -> SchemaDef {
    SchemaDef::new(
        "pipeline_plan",
        serde_json::json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "plugin_id": { "type": "string" },
                            "action": { "type": "string" }
                        },
                        "required": ["plugin_id", "action"]
                    }
                }
            },
            "required": ["steps"]
        }),
    )
    .expect("static plan schema compiles")
}

fn replan_schema() -> SchemaDef {
    SchemaDef::new(
        "replan_decision",
        serde_json::json!({
            "type": "object",
            "properties": {
                "revise": { "type": "boolean" },
                "reason": { "type": "string" },
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "plugin_id": { "type": "string" },
                            "action": { "type": "string" }
                        },
                        "required": ["plugin_id", "action"]
                    }
                }
            },
            "required": ["revise"]
        }),
    )
    .expect("static replan schema compiles")
}

/// Produces and revises pipelines from the current chain.
pub struct PipelinePlanner {
    extractor: StructuredExtractor,
    registry: Arc<PluginRegistry>,
    memory: Option<Arc<dyn MemoryProvider>>,
    config: PlannerConfig,
}

impl PipelinePlanner {
    pub fn new(
        router: Arc<CapabilityRouter>,
        registry: Arc<PluginRegistry>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            extractor: StructuredExtractor::new(router),
            registry,
            memory: None,
            config,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn extraction_metrics(&self) -> crate::capability::RetryMetricsSummary {
        self.extractor.metrics()
    }

    /// Produce the initial pipeline for a chain. An empty plan is valid and
    /// signals immediate termination.
    pub async fn plan(&self, chain: &ContextChain) -> Result<Pipeline, PlanError> {
        let catalog = self.registry.available_steps();
        let prompt = self.build_plan_prompt(chain, &catalog).await;
        let value = self
            .extractor
            .extract(
                &self.config.capability,
                &plan_schema(),
                &prompt,
                &self.config.extraction,
            )
            .await?;
        let doc: PlanDoc =
            serde_json::from_value(value).map_err(|e| PlanError::Malformed(e.to_string()))?;

        self.validate_steps(&doc.steps)?;
        let steps = order_for_effects(doc.steps, &catalog);
        tracing::debug!(event_id = %chain.event_id(), steps = steps.len(), "plan accepted");
        Ok(Pipeline::new(steps))
    }

    /// Judge whether the remaining steps should be replaced. Any planning
    /// failure here degrades to `Continue` with the original steps; the
    /// pipeline is never silently dropped.
    pub async fn should_replan(
        &self,
        chain: &ContextChain,
        remaining: &[PipelineStep],
    ) -> ReplanDecision {
        if remaining.is_empty() {
            return ReplanDecision::Continue;
        }
        match self.judge_replan(chain, remaining).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    event_id = %chain.event_id(),
                    error = %err,
                    "replan judgement failed; continuing with current pipeline"
                );
                ReplanDecision::Continue
            }
        }
    }

    async fn judge_replan(
        &self,
        chain: &ContextChain,
        remaining: &[PipelineStep],
    ) -> Result<ReplanDecision, PlanError> {
        let catalog = self.registry.available_steps();
        let prompt = self.build_replan_prompt(chain, remaining, &catalog);
        let value = self
            .extractor
            .extract(
                &self.config.capability,
                &replan_schema(),
                &prompt,
                &self.config.extraction,
            )
            .await?;
        let doc: ReplanDoc =
            serde_json::from_value(value).map_err(|e| PlanError::Malformed(e.to_string()))?;

        if !doc.revise {
            return Ok(ReplanDecision::Continue);
        }
        let steps = doc.steps.unwrap_or_default();
        self.validate_steps(&steps)?;
        Ok(ReplanDecision::Replace {
            steps,
            reason: doc.reason.unwrap_or_else(|| "unspecified".to_string()),
        })
    }

    fn validate_steps(&self, steps: &[PipelineStep]) -> Result<(), PlanError> {
        for step in steps {
            if !self.registry.contains_step(step) {
                return Err(PlanError::UnknownStep(step.clone()));
            }
        }
        Ok(())
    }

    async fn build_plan_prompt(&self, chain: &ContextChain, catalog: &[StepDescriptor]) -> String {
        let mut prompt = String::from(
            "You orchestrate an agent's work by selecting an ordered pipeline of plugin steps.\n\n",
        );
        push_catalog(&mut prompt, catalog);
        self.push_history(&mut prompt, chain).await;
        push_chain(&mut prompt, chain, self.config.max_chain_items);
        prompt.push_str(
            "\nSelect the steps, in execution order, that best handle the context above.\n\
             Use only steps listed in the catalog. An empty steps array means no further \
             work is needed.\n\
             Return ONLY a JSON object of the shape {\"steps\": [{\"plugin_id\": \"...\", \
             \"action\": \"...\"}]}.\n",
        );
        prompt
    }

    fn build_replan_prompt(
        &self,
        chain: &ContextChain,
        remaining: &[PipelineStep],
        catalog: &[StepDescriptor],
    ) -> String {
        let mut prompt = String::from(
            "A pipeline is mid-execution. Decide whether the remaining steps still fit the \
             context, or must be replaced.\n\n",
        );
        push_catalog(&mut prompt, catalog);
        prompt.push_str("Remaining steps:\n");
        for step in remaining {
            prompt.push_str(&format!("- {}\n", step));
        }
        prompt.push('\n');
        push_chain(&mut prompt, chain, self.config.max_chain_items);
        prompt.push_str(
            "\nIf the remaining steps are still right, return {\"revise\": false}.\n\
             Otherwise return {\"revise\": true, \"reason\": \"...\", \"steps\": [...]} \
             using only steps from the catalog.\n\
             Return ONLY a JSON object.\n",
        );
        prompt
    }

    /// Recent conversation history seeds the prompt when the chain identifies
    /// a user and a memory provider is wired. Failures are logged, never
    /// propagated: memory must not gate control flow.
    async fn push_history(&self, prompt: &mut String, chain: &ContextChain) {
        let Some(memory) = &self.memory else { return };
        let Some((user, platform)) = seed_identity(chain) else {
            return;
        };
        match memory
            .recent_history(&user, &platform, self.config.history_limit)
            .await
        {
            Ok(history) if !history.is_empty() => {
                prompt.push_str("Recent conversation:\n");
                for interaction in &history {
                    prompt.push_str(&format!(
                        "- [{}] {}: {}\n",
                        interaction.occurred_at().format("%Y-%m-%d %H:%M:%S"),
                        interaction.user,
                        truncate(&interaction.content, 200)
                    ));
                }
                prompt.push('\n');
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "memory provider failed; planning without history");
            }
        }
    }
}

/// User identity from the chain's seed item, when present.
fn seed_identity(chain: &ContextChain) -> Option<(String, String)> {
    match &chain.items().first()?.body {
        ItemBody::UserInput {
            user: Some(user),
            platform,
            ..
        } => Some((
            user.clone(),
            platform.clone().unwrap_or_else(|| "default".to_string()),
        )),
        _ => None,
    }
}

fn push_catalog(prompt: &mut String, catalog: &[StepDescriptor]) {
    prompt.push_str("Step catalog:\n");
    for desc in catalog {
        prompt.push_str(&format!(
            "- {}/{}: {}",
            desc.plugin_id, desc.action.name, desc.action.description
        ));
        if !desc.action.effects.is_empty() {
            prompt.push_str(&format!(" (effects: {})", desc.action.effects.join(", ")));
        }
        prompt.push('\n');
    }
    prompt.push('\n');
}

fn push_chain(prompt: &mut String, chain: &ContextChain, max_items: usize) {
    prompt.push_str("Context so far:\n");
    let items = chain.items();
    let start = items.len().saturating_sub(max_items);
    for item in &items[start..] {
        prompt.push_str(&format!(
            "- [{}] {}/{}: {}\n",
            item.kind(),
            item.plugin_id,
            item.action,
            truncate(&summarize_body(&item.body), 300)
        ));
    }
}

fn summarize_body(body: &ItemBody) -> String {
    match body {
        ItemBody::UserInput { content, .. } => content.clone(),
        ItemBody::StepOutput { content } => content.to_string(),
        ItemBody::StepError { detail, .. } => format!("error: {}", detail),
        ItemBody::Extension { content, .. } => content.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}... [truncated]")
    }
}

/// Plan-time ordering pass: a step whose declared conflicts collide with an
/// effect emitted by an earlier step is deferred to the tail, preserving the
/// relative order of both groups. This is the only point where step order may
/// change; the executor never reorders after validation.
fn order_for_effects(steps: Vec<PipelineStep>, catalog: &[StepDescriptor]) -> Vec<PipelineStep> {
    let descriptor = |step: &PipelineStep| {
        catalog
            .iter()
            .find(|d| d.plugin_id == step.plugin_id && d.action.name == step.action)
    };

    let mut emitted: Vec<String> = Vec::new();
    let mut ordered = Vec::with_capacity(steps.len());
    let mut deferred = Vec::new();

    for step in steps {
        let Some(desc) = descriptor(&step) else {
            ordered.push(step);
            continue;
        };
        let collides = desc
            .action
            .conflicts_with
            .iter()
            .any(|c| emitted.iter().any(|e| e == c));
        if collides {
            tracing::debug!(step = %step, "deferring step past conflicting effects");
            deferred.push(step);
        } else {
            emitted.extend(desc.action.effects.iter().cloned());
            ordered.push(step);
        }
    }
    ordered.extend(deferred);
    ordered
}

//! Plugin interface and registry.
//!
//! A plugin contributes named actions the planner can schedule, may require
//! capabilities from the router, and may provide capabilities of its own by
//! registering them during its init hook. Startup is two-phase: all plugins
//! are registered first, then init hooks run in registration order, so
//! cross-plugin capability lookups during init always see a fully populated
//! registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::CapabilityRouter;
use crate::context_chain::ContextChain;
use crate::types::ContextItem;

mod registry;

pub use registry::{PluginRegistry, RegistryError, StepDescriptor, StepHandler};

/// Declares one action a plugin can execute, together with the effects it
/// produces. Effects feed the planner's prompt and its plan-time ordering of
/// mutually-exclusive steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    /// Effects this action produces, e.g. "sends_reply".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<String>,
    /// Effects this action cannot follow within one plan.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            effects: Vec::new(),
            conflicts_with: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: impl Into<String>) -> Self {
        self.effects.push(effect.into());
        self
    }

    pub fn with_conflict(mut self, effect: impl Into<String>) -> Self {
        self.conflicts_with.push(effect.into());
        self
    }
}

/// Capability a plugin declares it will provide during init.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("action execution failed: {0}")]
    Execution(#[from] anyhow::Error),
    #[error("plugin init failed: {0}")]
    Init(String),
}

/// Collaborator-implemented unit of behavior.
///
/// Handlers read the current chain and return the items to append; the
/// executor owns the chain and performs the appends.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    /// Actions this plugin exposes to the planner.
    fn actions(&self) -> Vec<ActionDescriptor>;

    /// Execute one action against the current chain, returning zero or more
    /// new items. A returned error is fatal to the current run.
    async fn execute(
        &self,
        action: &str,
        chain: &ContextChain,
    ) -> Result<Vec<ContextItem>, PluginError>;

    /// Init hook, invoked once during phase two of startup. May register
    /// capabilities with the router and resolve capabilities registered by
    /// plugins earlier in registration order.
    async fn init(&self, router: &CapabilityRouter) -> Result<(), PluginError> {
        let _ = router;
        Ok(())
    }

    /// Capability ids this plugin expects to resolve at runtime.
    fn required_capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Capabilities this plugin will register during init.
    fn provided_capabilities(&self) -> Vec<CapabilityDeclaration> {
        Vec::new()
    }
}

//! Static-after-init table mapping (plugin id, action name) to a handler.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use super::{ActionDescriptor, CapabilityDeclaration, Plugin, PluginError};
use crate::capability::CapabilityRouter;
use crate::context_chain::ContextChain;
use crate::types::{ContextItem, PipelineStep, PluginId};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin '{0}' is already registered")]
    DuplicateRegistration(PluginId),
    #[error("unknown step {plugin_id}/{action}")]
    UnknownStep { plugin_id: PluginId, action: String },
    #[error("plugin '{plugin_id}' init failed: {source}")]
    Init {
        plugin_id: PluginId,
        #[source]
        source: PluginError,
    },
}

/// One entry of the step catalog handed to the planner.
#[derive(Debug, Clone, Serialize)]
pub struct StepDescriptor {
    pub plugin_id: PluginId,
    pub action: ActionDescriptor,
}

impl StepDescriptor {
    pub fn step(&self) -> PipelineStep {
        PipelineStep::new(self.plugin_id.clone(), self.action.name.clone())
    }
}

/// A resolved (plugin, action) pair ready to execute.
pub struct StepHandler {
    plugin: Arc<dyn Plugin>,
    descriptor: ActionDescriptor,
}

impl StepHandler {
    pub fn plugin_id(&self) -> &str {
        self.plugin.id()
    }

    pub fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    pub async fn execute(&self, chain: &ContextChain) -> Result<Vec<ContextItem>, PluginError> {
        self.plugin.execute(&self.descriptor.name, chain).await
    }
}

/// Registration table for plugins. Mutable only during startup; wrapped in an
/// `Arc` and read concurrently without locking once the queue dispatches.
#[derive(Default)]
pub struct PluginRegistry {
    // Insertion order is init order.
    plugins: IndexMap<PluginId, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let id = plugin.id().to_string();
        if self.plugins.contains_key(&id) {
            return Err(RegistryError::DuplicateRegistration(id));
        }
        tracing::debug!(plugin_id = %id, "plugin registered");
        self.plugins.insert(id, plugin);
        Ok(())
    }

    /// Resolve a (plugin, action) reference to an executable handler.
    pub fn lookup(&self, plugin_id: &str, action: &str) -> Result<StepHandler, RegistryError> {
        let plugin = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| RegistryError::UnknownStep {
                plugin_id: plugin_id.to_string(),
                action: action.to_string(),
            })?;
        let descriptor = plugin
            .actions()
            .into_iter()
            .find(|a| a.name == action)
            .ok_or_else(|| RegistryError::UnknownStep {
                plugin_id: plugin_id.to_string(),
                action: action.to_string(),
            })?;
        Ok(StepHandler {
            plugin: plugin.clone(),
            descriptor,
        })
    }

    pub fn contains_step(&self, step: &PipelineStep) -> bool {
        self.plugins
            .get(&step.plugin_id)
            .map(|p| p.actions().iter().any(|a| a.name == step.action))
            .unwrap_or(false)
    }

    /// The full step catalog, in registration order.
    pub fn available_steps(&self) -> Vec<StepDescriptor> {
        self.plugins
            .values()
            .flat_map(|plugin| {
                let plugin_id = plugin.id().to_string();
                plugin.actions().into_iter().map(move |action| StepDescriptor {
                    plugin_id: plugin_id.clone(),
                    action,
                })
            })
            .collect()
    }

    /// Capability declarations of every registered plugin, exposed to the
    /// router at initialization.
    pub fn capability_providers(&self) -> Vec<(PluginId, CapabilityDeclaration)> {
        self.plugins
            .values()
            .flat_map(|plugin| {
                let plugin_id = plugin.id().to_string();
                plugin
                    .provided_capabilities()
                    .into_iter()
                    .map(move |decl| (plugin_id.clone(), decl))
            })
            .collect()
    }

    /// Phase two of startup: run every plugin's init hook in registration
    /// order. All plugins are already registered, so init hooks may resolve
    /// capabilities registered by earlier plugins.
    pub async fn initialize(&self, router: &CapabilityRouter) -> Result<(), RegistryError> {
        for plugin in self.plugins.values() {
            plugin
                .init(router)
                .await
                .map_err(|source| RegistryError::Init {
                    plugin_id: plugin.id().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Required capability ids that do not resolve after init.
    pub async fn unresolved_requirements(&self, router: &CapabilityRouter) -> Vec<(PluginId, String)> {
        let mut missing = Vec::new();
        for plugin in self.plugins.values() {
            for id in plugin.required_capabilities() {
                if router.resolve(&id).await.is_err() {
                    missing.push((plugin.id().to_string(), id));
                }
            }
        }
        missing
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

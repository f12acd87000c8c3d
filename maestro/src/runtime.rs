//! Top-level wiring: build the components, run two-phase startup, expose a
//! narrow submit/stats/shutdown surface.
//!
//! Startup order matters and is fatal on configuration errors:
//! 1. register every plugin (duplicate ids abort startup);
//! 2. register provider-supplied capabilities (conflicts abort startup);
//! 3. run plugin init hooks in registration order, against the fully
//!    populated registry and router.
//! Only then does the queue start dispatching.

use std::sync::Arc;

use thiserror::Error;

use crate::capability::{CapabilityBinding, CapabilityError, CapabilityProvider, CapabilityRouter};
use crate::config::RuntimeConfig;
use crate::executor::PipelineExecutor;
use crate::memory::MemoryProvider;
use crate::monitor::{MonitorService, MonitorSink};
use crate::planner::PipelinePlanner;
use crate::plugin::{Plugin, PluginRegistry, RegistryError};
use crate::queue::{EventQueue, QueueStats, SubmitError};
use crate::types::Event;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

#[derive(Default)]
pub struct MaestroRuntimeBuilder {
    plugins: Vec<Arc<dyn Plugin>>,
    bindings: Vec<CapabilityBinding>,
    sinks: Vec<Arc<dyn MonitorSink>>,
    memory: Option<Arc<dyn MemoryProvider>>,
    config: RuntimeConfig,
}

impl MaestroRuntimeBuilder {
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Bind one capability directly.
    pub fn with_capability(mut self, binding: CapabilityBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Bind every capability a model provider exposes.
    pub fn with_provider(mut self, provider: &dyn CapabilityProvider) -> Self {
        self.bindings.extend(provider.capabilities());
        self
    }

    pub fn with_monitor_sink(mut self, sink: Arc<dyn MonitorSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Two-phase startup; any registration conflict prevents the runtime
    /// from reaching a running state.
    pub async fn start(self) -> Result<MaestroRuntime, StartupError> {
        // Phase 1: registrations.
        let mut registry = PluginRegistry::new();
        for plugin in self.plugins {
            registry.register(plugin)?;
        }
        let registry = Arc::new(registry);

        let router = Arc::new(CapabilityRouter::with_default_timeout(
            self.config.capability_timeout_ms,
        ));
        for binding in self.bindings {
            router
                .register(
                    binding.id,
                    binding.aliases,
                    binding.description,
                    binding.handler,
                )
                .await?;
        }

        for (plugin_id, decl) in registry.capability_providers() {
            tracing::debug!(
                plugin_id = %plugin_id,
                capability = %decl.id,
                "plugin declares capability"
            );
        }

        // Phase 2: init hooks, in registration order, against the fully
        // populated registry.
        registry.initialize(&router).await?;

        for (plugin_id, capability) in registry.unresolved_requirements(&router).await {
            tracing::warn!(
                plugin_id = %plugin_id,
                capability = %capability,
                "required capability is not registered"
            );
        }

        let mut monitor = MonitorService::new();
        for sink in self.sinks {
            monitor.register_sink(sink);
        }
        let monitor = Arc::new(monitor);

        let mut planner = PipelinePlanner::new(
            router.clone(),
            registry.clone(),
            self.config.planner.clone(),
        );
        if let Some(memory) = &self.memory {
            planner = planner.with_memory(memory.clone());
        }
        let planner = Arc::new(planner);

        let mut executor = PipelineExecutor::new(registry.clone(), planner.clone(), monitor.clone())
            .with_config(self.config.executor.clone());
        if let Some(memory) = &self.memory {
            executor = executor.with_memory(memory.clone());
        }

        let queue = EventQueue::start(Arc::new(executor), self.config.queue.clone());
        tracing::info!(
            plugins = registry.len(),
            capabilities = router.list().await.len(),
            workers = self.config.queue.workers,
            "runtime started"
        );

        Ok(MaestroRuntime {
            queue,
            registry,
            router,
            planner,
            monitor,
        })
    }
}

/// A running engine instance.
pub struct MaestroRuntime {
    queue: EventQueue,
    registry: Arc<PluginRegistry>,
    router: Arc<CapabilityRouter>,
    planner: Arc<PipelinePlanner>,
    monitor: Arc<MonitorService>,
}

impl MaestroRuntime {
    pub fn builder() -> MaestroRuntimeBuilder {
        MaestroRuntimeBuilder::default()
    }

    /// Admit an event for scheduling. Never blocks.
    pub fn submit(&self, event: Event) -> Result<(), SubmitError> {
        self.queue.submit(event)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Direct capability invocation surface, for collaborators that call
    /// capabilities outside of a pipeline run.
    pub fn router(&self) -> &Arc<CapabilityRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn planner(&self) -> &Arc<PipelinePlanner> {
        &self.planner
    }

    pub fn monitor(&self) -> &Arc<MonitorService> {
        &self.monitor
    }

    /// Stop dispatching and wait for in-flight runs.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

//! Convenient re-exports for collaborators building on the engine.

pub use crate::capability::{
    CapabilityBinding, CapabilityConfig, CapabilityError, CapabilityHandler, CapabilityProvider,
    CapabilityRouter, ExtractionConfig, FieldDef, FieldKind, SchemaDef, StructuredExtractor,
};
pub use crate::config::RuntimeConfig;
pub use crate::context_chain::{ChainError, ContextChain};
pub use crate::memory::{InMemoryMemory, Interaction, MemoryProvider};
pub use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorService, MonitorSink};
pub use crate::planner::{PipelinePlanner, PlannerConfig, ReplanDecision};
pub use crate::plugin::{
    ActionDescriptor, CapabilityDeclaration, Plugin, PluginError, PluginRegistry,
};
pub use crate::queue::{QueueConfig, QueueStats, SubmitError};
pub use crate::runtime::{MaestroRuntime, MaestroRuntimeBuilder, StartupError};
pub use crate::types::{
    ContextItem, ConversationKey, Event, ItemBody, Pipeline, PipelineStep, PlatformMetadata,
    ResponseHandler, RunOutcome, RunStatus,
};

//! Capability system: routing, schema validation, structured extraction.
//!
//! A capability is a named unit of generative/model functionality, reachable
//! by identifier or alias. Model providers bind capabilities through
//! [`CapabilityProvider`]; the router resolves and invokes them; the
//! structured extractor layers schema validation and bounded retry on top.

use std::sync::Arc;

mod extraction;
mod router;
mod schema;

pub use extraction::{
    extract_json_block, retry_instruction, ExtractionConfig, ExtractionError,
    RetryMetricsSummary, StructuredExtractor,
};
pub use router::{
    CapabilityConfig, CapabilityError, CapabilityHandler, CapabilityInfo, CapabilityRouter,
};
pub use schema::{FieldDef, FieldKind, SchemaDef, SchemaError, ValidationFailure};

/// One capability a provider binds: identifier, aliases, and the handler.
#[derive(Clone)]
pub struct CapabilityBinding {
    pub id: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl CapabilityBinding {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            aliases: Vec::new(),
            description: description.into(),
            handler,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

/// Collaborator-implemented source of capability bindings (a model provider).
pub trait CapabilityProvider: Send + Sync {
    fn capabilities(&self) -> Vec<CapabilityBinding>;
}

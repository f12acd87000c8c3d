// Maestro Library
// Agent runtime orchestration engine: events in, per-conversation serialized
// runs, capability-planned pipelines of plugin actions, append-only context
// chains out.

pub mod capability;
pub mod config;
pub mod context_chain;
pub mod executor;
pub mod memory;
pub mod monitor;
pub mod planner;
pub mod plugin;
pub mod prelude;
pub mod queue;
pub mod runtime;
pub mod types;

// Re-export the main runtime surface
pub use crate::queue::{QueueStats, SubmitError};
pub use crate::runtime::{MaestroRuntime, MaestroRuntimeBuilder, StartupError};
pub use crate::types::{Event, RunOutcome, RunStatus};

/// Install a `tracing` subscriber honoring `RUST_LOG`. Safe to call more
/// than once; only the first call installs.
pub fn init_telemetry() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod integration_test;

//! Build events for introspection.
//!
//! The executor and the chain report state changes to an [`EventSink`]
//! carried by the configuration. Logging happens independently through
//! `tracing`; sinks are for callers that want to observe a run.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A stage's existence check started.
pub const STAGE_CHECKING: &str = "stage.checking";
/// A stage's artifact already existed.
pub const STAGE_SKIPPED: &str = "stage.skipped";
/// A stage's build started.
pub const STAGE_BUILDING: &str = "stage.building";
/// A stage's artifact was stored.
pub const STAGE_BUILT: &str = "stage.built";
/// A stage's build failed.
pub const STAGE_FAILED: &str = "stage.failed";
/// A chain invocation started.
pub const CHAIN_STARTED: &str = "chain.started";
/// A chain invocation finished successfully.
pub const CHAIN_COMPLETED: &str = "chain.completed";
/// A chain invocation failed.
pub const CHAIN_FAILED: &str = "chain.failed";

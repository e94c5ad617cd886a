//! # Imagechain
//!
//! Incremental, content-addressed builds of chained machine images.
//!
//! A chain is an ordered list of stages, the most derived image first and the
//! root image last. Every stage's artifact is identified by a fingerprint
//! made of its own version and the versions of every stage below it, so a
//! change to one stage rebuilds that stage and everything stacked on it while
//! untouched stages are skipped.
//!
//! - **Stage declarations**: bare names or partial records, completed with defaults
//! - **Fingerprints**: accumulated `stage => version` tags identifying artifacts
//! - **Build executor**: check, provision, transform, persist, with guaranteed instance release
//! - **Collaborators**: version control, compute and transformation behind explicit traits
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use imagechain::prelude::*;
//!
//! let config = ChainConfig::new().with_overrides(
//!     &ChainOptions::new()
//!         .with_compute_provider(compute)
//!         .with_transform_executor(transform)
//!         .with_base_artifact("ami-6d555119"),
//! );
//!
//! let stages = ["application", "middle_ware", "base"];
//! let chain = ImageChain::define(stages, &config, &ChainOptions::new()).await?;
//! let report = chain.invoke("application").await?;
//! println!("built {} images", report.built());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod providers;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ChainConfig, ChainOptions, ChainSettings};
    pub use crate::core::{Artifact, BuildOutcome, BuildState, Fingerprint, InstanceHandle, Seed};
    pub use crate::errors::{ChainError, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{BuildTask, ImageChain, RunReport};
    pub use crate::providers::{
        CommandTransformExecutor, ComputeProvider, GitVersionProvider, TransformExecutor,
        TransformRequest, VersionProvider,
    };
    pub use crate::stages::{PartialStage, RawStage, StageSpec};
}

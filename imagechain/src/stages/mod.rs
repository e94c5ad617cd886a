//! Stage declarations.
//!
//! A chain is declared as an ordered list of stages, most derived first and
//! the root stage last. This module turns minimal user input into complete
//! [`StageSpec`]s and attaches resolved versions to them.

mod resolved;
mod spec;

pub use resolved::{resolve_path, resolve_versions, ResolvedStage};
pub use spec::{
    normalize, normalize_with_extension, PartialStage, RawStage, SourceRef, StageSpec,
    DEFAULT_SOURCE_EXTENSION, RECOGNIZED_STAGE_KEYS, WILDCARD,
};

//! Stage specifications and the normalizer that completes them.

use crate::errors::{ChainError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Reference meaning "the version of the whole source tree".
pub const WILDCARD: &str = "*";

/// Extension appended to a stage name to derive its source file.
pub const DEFAULT_SOURCE_EXTENSION: &str = "rb";

/// Keys a stage record may contain.
pub const RECOGNIZED_STAGE_KEYS: [&str; 5] = [
    "name",
    "task_id",
    "version_source",
    "transform_source",
    "description",
];

/// Where a stage's version comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceRef {
    /// The whole repository.
    Wildcard,
    /// A single file, relative to the chain's root path unless absolute.
    Path(String),
}

impl SourceRef {
    /// Returns true for the whole-repository reference.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }
}

impl From<&str> for SourceRef {
    fn from(value: &str) -> Self {
        if value == WILDCARD {
            Self::Wildcard
        } else {
            Self::Path(value.to_string())
        }
    }
}

impl From<String> for SourceRef {
    fn from(value: String) -> Self {
        if value == WILDCARD {
            Self::Wildcard
        } else {
            Self::Path(value)
        }
    }
}

impl From<SourceRef> for String {
    fn from(value: SourceRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => write!(f, "{WILDCARD}"),
            Self::Path(path) => write!(f, "{path}"),
        }
    }
}

/// A fully specified stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSpec {
    name: String,
    task_id: String,
    version_source: SourceRef,
    transform_source: String,
    description: Option<String>,
}

impl StageSpec {
    /// Creates a stage with the defaults of a non-first chain entry.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let source = format!("{name}.{DEFAULT_SOURCE_EXTENSION}");
        Self {
            task_id: name.clone(),
            version_source: SourceRef::Path(source.clone()),
            transform_source: source,
            description: None,
            name,
        }
    }

    /// The stage name, also the tag key carrying its version.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The identifier of the build task for this stage.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The reference passed to the version provider.
    #[must_use]
    pub fn version_source(&self) -> &SourceRef {
        &self.version_source
    }

    /// The transformation procedure to run.
    #[must_use]
    pub fn transform_source(&self) -> &str {
        &self.transform_source
    }

    /// Optional human readable description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// A stage record in which everything but the name may be left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialStage {
    /// Stage name (required).
    pub name: Option<String>,
    /// Task identifier, defaults to the name.
    pub task_id: Option<String>,
    /// Version reference.
    pub version_source: Option<String>,
    /// Transformation procedure.
    pub transform_source: Option<String>,
    /// Description for the task.
    pub description: Option<String>,
}

impl PartialStage {
    /// Creates a record with only a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Sets the task identifier.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the version reference.
    #[must_use]
    pub fn with_version_source(mut self, source: impl Into<String>) -> Self {
        self.version_source = Some(source.into());
        self
    }

    /// Sets the transformation procedure.
    #[must_use]
    pub fn with_transform_source(mut self, source: impl Into<String>) -> Self {
        self.transform_source = Some(source.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builds a record from a JSON object, naming the first unrecognized key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for unknown keys or non-string values.
    pub fn from_json_map(map: &serde_json::Map<String, Value>) -> Result<Self> {
        let mut record = Self::default();
        for (key, value) in map {
            let slot = match key.as_str() {
                "name" => &mut record.name,
                "task_id" => &mut record.task_id,
                "version_source" => &mut record.version_source,
                "transform_source" => &mut record.transform_source,
                "description" => &mut record.description,
                other => {
                    return Err(ChainError::invalid_input(format!(
                        "unrecognized stage option: '{other}' (expected one of {})",
                        RECOGNIZED_STAGE_KEYS.join(", ")
                    )))
                }
            };
            let text = value.as_str().ok_or_else(|| {
                ChainError::invalid_input(format!("stage option '{key}' must be a string"))
            })?;
            *slot = Some(text.to_string());
        }
        Ok(record)
    }
}

/// One entry of a chain declaration: a bare name or a partial record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawStage {
    /// Just the stage name.
    Name(String),
    /// A record with explicit fields.
    Record(PartialStage),
}

impl From<&str> for RawStage {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for RawStage {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<PartialStage> for RawStage {
    fn from(value: PartialStage) -> Self {
        Self::Record(value)
    }
}

impl TryFrom<Value> for RawStage {
    type Error = ChainError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(Self::Name(name)),
            Value::Object(map) => PartialStage::from_json_map(&map).map(Self::Record),
            other => Err(ChainError::invalid_input(format!(
                "a stage has to be a string or an object, got {other}"
            ))),
        }
    }
}

/// Completes a chain declaration using the default source extension.
///
/// # Errors
///
/// See [`normalize_with_extension`].
pub fn normalize<I, S>(raw_stages: I) -> Result<Vec<StageSpec>>
where
    I: IntoIterator<Item = S>,
    S: Into<RawStage>,
{
    normalize_with_extension(raw_stages, DEFAULT_SOURCE_EXTENSION)
}

/// Completes a chain declaration into stage specifications.
///
/// Defaults: `task_id` is the name; `version_source` is `<name>.<ext>`, except
/// for the first entry where it is the wildcard; `transform_source` is the
/// version source unless that is the wildcard, then `<name>.<ext>`.
///
/// # Errors
///
/// Returns `InvalidInput` if the list is empty, a record has no name or an
/// empty one, or two stages share a name or a task id.
pub fn normalize_with_extension<I, S>(raw_stages: I, extension: &str) -> Result<Vec<StageSpec>>
where
    I: IntoIterator<Item = S>,
    S: Into<RawStage>,
{
    let records: Vec<PartialStage> = raw_stages
        .into_iter()
        .map(|raw| match raw.into() {
            RawStage::Name(name) => PartialStage::new(name),
            RawStage::Record(record) => record,
        })
        .collect();

    if records.is_empty() {
        return Err(ChainError::invalid_input("no stages given"));
    }

    let mut names = HashSet::new();
    let mut task_ids = HashSet::new();
    let mut specs = Vec::with_capacity(records.len());

    for (index, record) in records.into_iter().enumerate() {
        let name = match record.name {
            Some(name) if !name.trim().is_empty() => name,
            Some(_) => return Err(ChainError::invalid_input("stage name cannot be empty")),
            None => {
                return Err(ChainError::invalid_input(
                    "every stage has to have at least a name",
                ))
            }
        };

        let task_id = record.task_id.unwrap_or_else(|| name.clone());
        let default_source = format!("{name}.{extension}");

        let version_source = match record.version_source {
            Some(source) => SourceRef::from(source),
            None if index == 0 => SourceRef::Wildcard,
            None => SourceRef::Path(default_source.clone()),
        };

        let transform_source = record.transform_source.unwrap_or_else(|| match &version_source {
            SourceRef::Wildcard => default_source,
            SourceRef::Path(path) => path.clone(),
        });

        if !names.insert(name.clone()) {
            return Err(ChainError::invalid_input(format!(
                "stage '{name}' is declared more than once"
            )));
        }
        if !task_ids.insert(task_id.clone()) {
            return Err(ChainError::invalid_input(format!(
                "task '{task_id}' is declared more than once"
            )));
        }

        specs.push(StageSpec {
            name,
            task_id,
            version_source,
            transform_source,
            description: record.description,
        });
    }

    Ok(specs)
}

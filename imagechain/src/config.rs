//! Configuration for chain definitions.
//!
//! A [`ChainConfig`] is built once at process start and handed to
//! [`crate::pipeline::ImageChain::define`]. Per-call [`ChainOptions`] derive a
//! new configuration with [`ChainConfig::with_overrides`] and leave the
//! original untouched. [`ChainSettings`] reads the same options from JSON.

use crate::errors::{ChainError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::providers::{
    CommandSettings, CommandTransformExecutor, ComputeProvider, GitVersionProvider,
    TransformExecutor, VersionProvider,
};
use crate::stages::DEFAULT_SOURCE_EXTENSION;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Option keys accepted by [`ChainSettings`].
pub const RECOGNIZED_OPTIONS: [&str; 5] = [
    "version_provider",
    "compute_provider",
    "transform_executor",
    "base_artifact",
    "root_path",
];

/// Environment variable overriding `base_artifact`.
pub const ENV_BASE_ARTIFACT: &str = "IMAGECHAIN_BASE_ARTIFACT";
/// Environment variable overriding `root_path`.
pub const ENV_ROOT_PATH: &str = "IMAGECHAIN_ROOT_PATH";

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

type Factory<T> = Arc<dyn Fn() -> Result<Arc<T>> + Send + Sync>;

/// A collaborator that is either ready or built on first use.
///
/// The factory runs at most once; clones share the cached instance.
pub struct Collaborator<T: ?Sized> {
    cell: Arc<OnceCell<Arc<T>>>,
    factory: Option<Factory<T>>,
}

impl<T: ?Sized> Collaborator<T> {
    /// Wraps an existing instance.
    #[must_use]
    pub fn ready(instance: Arc<T>) -> Self {
        Self {
            cell: Arc::new(OnceCell::with_value(instance)),
            factory: None,
        }
    }

    /// Defers construction to `factory`.
    pub fn lazy<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<T>> + Send + Sync + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            factory: Some(Arc::new(factory)),
        }
    }

    /// Returns true once the instance exists.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Returns the instance, building it if necessary.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; returns `Configuration` if there is
    /// neither an instance nor a factory.
    pub fn get(&self) -> Result<Arc<T>> {
        self.cell
            .get_or_try_init(|| match &self.factory {
                Some(factory) => factory(),
                None => Err(ChainError::configuration("collaborator was never set")),
            })
            .cloned()
    }
}

impl<T: ?Sized> Clone for Collaborator<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            factory: self.factory.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Collaborator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborator")
            .field("initialized", &self.is_initialized())
            .field("lazy", &self.factory.is_some())
            .finish()
    }
}

/// Per-call overrides. Unset fields keep the configuration's value.
#[derive(Clone, Default)]
pub struct ChainOptions {
    /// Source of stage versions.
    pub version_provider: Option<Arc<dyn VersionProvider>>,
    /// Compute and artifact store.
    pub compute_provider: Option<Arc<dyn ComputeProvider>>,
    /// Runs stage transformations.
    pub transform_executor: Option<Arc<dyn TransformExecutor>>,
    /// Artifact the root stage starts from.
    pub base_artifact: Option<String>,
    /// Directory stage sources are relative to.
    pub root_path: Option<PathBuf>,
}

impl ChainOptions {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the version provider.
    #[must_use]
    pub fn with_version_provider(mut self, provider: Arc<dyn VersionProvider>) -> Self {
        self.version_provider = Some(provider);
        self
    }

    /// Sets the compute provider.
    #[must_use]
    pub fn with_compute_provider(mut self, provider: Arc<dyn ComputeProvider>) -> Self {
        self.compute_provider = Some(provider);
        self
    }

    /// Sets the transformation executor.
    #[must_use]
    pub fn with_transform_executor(mut self, executor: Arc<dyn TransformExecutor>) -> Self {
        self.transform_executor = Some(executor);
        self
    }

    /// Sets the base artifact of the root stage.
    #[must_use]
    pub fn with_base_artifact(mut self, id: impl Into<String>) -> Self {
        self.base_artifact = Some(id.into());
        self
    }

    /// Sets the root path.
    #[must_use]
    pub fn with_root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_path = Some(path.into());
        self
    }

    /// Returns the names of the options that are set.
    #[must_use]
    pub fn keys(&self) -> Vec<&'static str> {
        let set = [
            self.version_provider.is_some(),
            self.compute_provider.is_some(),
            self.transform_executor.is_some(),
            self.base_artifact.is_some(),
            self.root_path.is_some(),
        ];
        RECOGNIZED_OPTIONS
            .iter()
            .zip(set)
            .filter_map(|(key, is_set)| is_set.then_some(*key))
            .collect()
    }
}

impl fmt::Debug for ChainOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainOptions")
            .field("keys", &self.keys())
            .field("base_artifact", &self.base_artifact)
            .field("root_path", &self.root_path)
            .finish()
    }
}

/// Configuration shared by chain definitions.
#[derive(Clone)]
pub struct ChainConfig {
    version_provider: Collaborator<dyn VersionProvider>,
    compute_provider: Option<Arc<dyn ComputeProvider>>,
    transform_executor: Option<Arc<dyn TransformExecutor>>,
    base_artifact: Option<String>,
    root_path: Option<PathBuf>,
    working_dir: Arc<OnceCell<PathBuf>>,
    source_extension: String,
    event_sink: Arc<dyn EventSink>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            version_provider: Collaborator::lazy(|| {
                debug!("Creating default git version provider");
                Ok(Arc::new(GitVersionProvider::new()) as Arc<dyn VersionProvider>)
            }),
            compute_provider: None,
            transform_executor: None,
            base_artifact: None,
            root_path: None,
            working_dir: Arc::new(OnceCell::new()),
            source_extension: DEFAULT_SOURCE_EXTENSION.to_string(),
            event_sink: Arc::new(NoOpEventSink),
        }
    }
}

impl ChainConfig {
    /// Creates a configuration with only built-in defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `options` into this configuration. Only the given options change.
    pub fn set_defaults(&mut self, options: &ChainOptions) {
        if let Some(provider) = &options.version_provider {
            self.version_provider = Collaborator::ready(Arc::clone(provider));
        }
        if let Some(provider) = &options.compute_provider {
            self.compute_provider = Some(Arc::clone(provider));
        }
        if let Some(executor) = &options.transform_executor {
            self.transform_executor = Some(Arc::clone(executor));
        }
        if let Some(base) = &options.base_artifact {
            self.base_artifact = Some(base.clone());
        }
        if let Some(root) = &options.root_path {
            self.root_path = Some(root.clone());
        }
    }

    /// Drops every default set so far.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Returns a derived configuration with `options` applied.
    #[must_use]
    pub fn with_overrides(&self, options: &ChainOptions) -> Self {
        let mut derived = self.clone();
        derived.set_defaults(options);
        derived
    }

    /// Sets the extension used for default stage sources.
    #[must_use]
    pub fn with_source_extension(mut self, extension: impl Into<String>) -> Self {
        self.source_extension = extension.into();
        self
    }

    /// Sets the sink receiving build events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Uses a factory for the version provider, invoked on first use.
    #[must_use]
    pub fn with_lazy_version_provider<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn VersionProvider>> + Send + Sync + 'static,
    {
        self.version_provider = Collaborator::lazy(factory);
        self
    }

    /// The version provider, built on first use if lazy.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error.
    pub fn version_provider(&self) -> Result<Arc<dyn VersionProvider>> {
        self.version_provider.get()
    }

    /// The compute provider.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if none was set.
    pub fn compute_provider(&self) -> Result<Arc<dyn ComputeProvider>> {
        self.compute_provider
            .clone()
            .ok_or_else(|| ChainError::configuration("no compute_provider configured"))
    }

    /// The transformation executor.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if none was set.
    pub fn transform_executor(&self) -> Result<Arc<dyn TransformExecutor>> {
        self.transform_executor
            .clone()
            .ok_or_else(|| ChainError::configuration("no transform_executor configured"))
    }

    /// The base artifact of the root stage, if configured.
    #[must_use]
    pub fn base_artifact(&self) -> Option<&str> {
        self.base_artifact.as_deref()
    }

    /// The absolute root path.
    ///
    /// Defaults to the process working directory, which is captured on first
    /// use and shared by derived configurations. A relative root is joined
    /// onto it.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the working directory cannot be determined.
    pub fn root_path(&self) -> Result<PathBuf> {
        let working_dir = self.working_dir.get_or_try_init(std::env::current_dir)?;
        Ok(match &self.root_path {
            Some(path) => working_dir.join(path),
            None => working_dir.clone(),
        })
    }

    /// The extension used for default stage sources.
    #[must_use]
    pub fn source_extension(&self) -> &str {
        &self.source_extension
    }

    /// The event sink.
    #[must_use]
    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.event_sink)
    }
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("version_provider", &self.version_provider)
            .field("compute_provider", &self.compute_provider.is_some())
            .field("transform_executor", &self.transform_executor.is_some())
            .field("base_artifact", &self.base_artifact)
            .field("root_path", &self.root_path)
            .field("source_extension", &self.source_extension)
            .finish_non_exhaustive()
    }
}

/// Settings for the git version backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitSettings {
    /// Git executable, `git` if unset.
    #[serde(default)]
    pub program: Option<String>,
}

/// Built-in version backends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionBackend {
    /// [`GitVersionProvider`].
    Git(GitSettings),
}

/// Built-in transformation backends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformBackend {
    /// [`CommandTransformExecutor`].
    Command(CommandSettings),
}

/// Options read from a JSON document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainSettings {
    /// Artifact the root stage starts from.
    pub base_artifact: Option<String>,
    /// Directory stage sources are relative to.
    pub root_path: Option<PathBuf>,
    /// Version backend.
    pub version_provider: Option<VersionBackend>,
    /// Transformation backend.
    pub transform_executor: Option<TransformBackend>,
}

fn string_option(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ChainError::configuration(format!(
            "option '{key}' must be a string, got {other}"
        ))),
    }
}

impl ChainSettings {
    /// Parses settings from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for unrecognized keys, unknown backends or
    /// values of the wrong type.
    pub fn from_json_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(ChainError::configuration("settings must be a JSON object"));
        };

        let mut settings = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "base_artifact" => settings.base_artifact = Some(string_option(&key, value)?),
                "root_path" => settings.root_path = Some(string_option(&key, value)?.into()),
                "version_provider" => {
                    let backend = match value {
                        Value::String(name) if name == "git" => {
                            VersionBackend::Git(GitSettings::default())
                        }
                        other => serde_json::from_value(other).map_err(|e| {
                            ChainError::configuration(format!("unknown version_provider: {e}"))
                        })?,
                    };
                    settings.version_provider = Some(backend);
                }
                "transform_executor" => {
                    let backend = serde_json::from_value(value).map_err(|e| {
                        ChainError::configuration(format!("unknown transform_executor: {e}"))
                    })?;
                    settings.transform_executor = Some(backend);
                }
                "compute_provider" => {
                    return Err(ChainError::configuration(format!(
                        "no built-in compute_provider backend {value}; \
                         supply one through ChainOptions"
                    )))
                }
                other => {
                    return Err(ChainError::configuration(format!(
                        "Unrecognized option: '{other}'"
                    )))
                }
            }
        }

        Ok(settings)
    }

    /// Parses settings from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for malformed JSON, otherwise see
    /// [`Self::from_json_value`].
    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_json_value(serde_json::from_str(text)?)
    }

    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, otherwise see
    /// [`Self::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Applies `IMAGECHAIN_*` environment variables over the parsed values.
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    #[must_use]
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(base) = lookup(ENV_BASE_ARTIFACT) {
            self.base_artifact = Some(base);
        }
        if let Some(root) = lookup(ENV_ROOT_PATH) {
            self.root_path = Some(PathBuf::from(root));
        }
        self
    }

    /// Builds the backends and returns them as options.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a backend rejects its settings.
    pub fn into_options(self) -> Result<ChainOptions> {
        let mut options = ChainOptions {
            base_artifact: self.base_artifact,
            root_path: self.root_path,
            ..ChainOptions::default()
        };

        if let Some(VersionBackend::Git(git)) = self.version_provider {
            let mut provider = GitVersionProvider::new();
            if let Some(program) = git.program {
                provider = provider.with_program(program);
            }
            if let Some(root) = &options.root_path {
                provider = provider.with_working_dir(absolute(root)?);
            }
            options.version_provider = Some(Arc::new(provider));
        }

        if let Some(TransformBackend::Command(command)) = self.transform_executor {
            options.transform_executor = Some(Arc::new(CommandTransformExecutor::new(command)?));
        }

        Ok(options)
    }
}

//! Declarative stage records.

use super::template::CommandTemplate;
use crate::codec::ParameterSet;
use crate::core::StageKind;
use crate::errors::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Where a stage runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTarget {
    /// On this machine.
    #[default]
    Local,
    /// On a remote compute host.
    Remote,
}

impl fmt::Display for StageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A named file, relative to the run working directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    /// Name used in templates (`{input.NAME}`) and environment variables.
    pub name: String,
    /// Path relative to the working directory.
    pub path: String,
}

impl FileRef {
    /// Creates a file reference.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Something a stage needs before it may start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRef {
    /// A file in the working directory.
    File(FileRef),
    /// A parameter of the run's parameter set.
    Parameter {
        /// Parameter name.
        name: String,
    },
}

impl InputRef {
    /// A file input.
    #[must_use]
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::File(FileRef::new(name, path))
    }

    /// A parameter input.
    #[must_use]
    pub fn parameter(name: impl Into<String>) -> Self {
        Self::Parameter { name: name.into() }
    }

    /// A short label for error messages.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::File(file) => file.path.clone(),
            Self::Parameter { name } => format!("param.{name}"),
        }
    }
}

/// Object classes included in a geometry export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// Wireframe curves.
    Curves,
    /// Sheet bodies.
    Surfaces,
    /// Solid bodies.
    Solids,
    /// Faceted bodies.
    FacetBodies,
    /// Product manufacturing information.
    PmiData,
}

impl ObjectType {
    /// Every object type, in export order.
    pub const ALL: [Self; 5] = [
        Self::Curves,
        Self::Surfaces,
        Self::Solids,
        Self::FacetBodies,
        Self::PmiData,
    ];
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Curves => write!(f, "curves"),
            Self::Surfaces => write!(f, "surfaces"),
            Self::Solids => write!(f, "solids"),
            Self::FacetBodies => write!(f, "facet_bodies"),
            Self::PmiData => write!(f, "pmi_data"),
        }
    }
}

/// Options for `export_geometry` stages, handed to the tool via environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Output format, `step_ap242` by default.
    #[serde(default = "default_export_format")]
    pub format: String,
    /// Object classes to include.
    #[serde(default = "default_object_types")]
    pub object_types: Vec<ObjectType>,
    /// Layer selection, `1-256` by default.
    #[serde(default = "default_layer_mask")]
    pub layer_mask: String,
}

fn default_export_format() -> String {
    "step_ap242".to_string()
}

fn default_object_types() -> Vec<ObjectType> {
    ObjectType::ALL.to_vec()
}

fn default_layer_mask() -> String {
    "1-256".to_string()
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: default_export_format(),
            object_types: default_object_types(),
            layer_mask: default_layer_mask(),
        }
    }
}

impl ExportOptions {
    /// Environment variables describing these options.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        let types = self
            .object_types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        vec![
            ("CADFLOW_EXPORT_FORMAT".to_string(), self.format.clone()),
            ("CADFLOW_EXPORT_OBJECT_TYPES".to_string(), types),
            ("CADFLOW_EXPORT_LAYER_MASK".to_string(), self.layer_mask.clone()),
        ]
    }
}

fn default_timeout_secs() -> f64 {
    3600.0
}

/// Longest accepted stage timeout: 30 days.
pub const MAX_TIMEOUT_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// One phase of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Unique id within the pipeline.
    pub id: String,
    /// What the stage does.
    pub kind: StageKind,
    /// Where it runs.
    #[serde(default)]
    pub target: StageTarget,
    /// Remote profile override for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// The command, run through the shell.
    pub command: CommandTemplate,
    /// Inputs that must exist before the stage starts.
    #[serde(default)]
    pub required_inputs: Vec<InputRef>,
    /// Files the stage must produce to succeed.
    #[serde(default)]
    pub expected_outputs: Vec<FileRef>,
    /// Wall-clock budget per attempt, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry_budget: u32,
    /// Command issued after the main command on every exit path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CommandTemplate>,
    /// Regexes that mark output lines as tool-reported failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_patterns: Vec<String>,
    /// Export options for `export_geometry` stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportOptions>,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Stage {
    /// Creates a local stage with default settings.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: StageKind, command: impl Into<CommandTemplate>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: StageTarget::Local,
            profile: None,
            command: command.into(),
            required_inputs: Vec::new(),
            expected_outputs: Vec::new(),
            timeout_secs: default_timeout_secs(),
            retry_budget: 0,
            cleanup: None,
            failure_patterns: Vec::new(),
            export: None,
            env: BTreeMap::new(),
        }
    }

    /// Runs the stage remotely, optionally pinned to a profile.
    #[must_use]
    pub fn remote(mut self, profile: Option<&str>) -> Self {
        self.target = StageTarget::Remote;
        self.profile = profile.map(ToString::to_string);
        self
    }

    /// Adds a required input.
    #[must_use]
    pub fn with_input(mut self, input: InputRef) -> Self {
        self.required_inputs.push(input);
        self
    }

    /// Adds an expected output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.expected_outputs.push(FileRef::new(name, path));
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Sets the cleanup command.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: impl Into<CommandTemplate>) -> Self {
        self.cleanup = Some(cleanup.into());
        self
    }

    /// Adds a failure-text pattern.
    #[must_use]
    pub fn with_failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failure_patterns.push(pattern.into());
        self
    }

    /// Sets geometry export options.
    #[must_use]
    pub fn with_export(mut self, options: ExportOptions) -> Self {
        self.export = Some(options);
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The timeout as a duration, clamped to [`MAX_TIMEOUT_SECS`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs.clamp(0.0, MAX_TIMEOUT_SECS))
            .unwrap_or(Duration::ZERO)
    }

    /// Maximum number of attempts (first try plus retries).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry_budget.saturating_add(1)
    }

    /// File inputs only.
    pub fn file_inputs(&self) -> impl Iterator<Item = &FileRef> {
        self.required_inputs.iter().filter_map(|input| match input {
            InputRef::File(file) => Some(file),
            InputRef::Parameter { .. } => None,
        })
    }

    /// Compiles the failure patterns.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first bad pattern.
    pub fn compiled_failure_patterns(&self) -> Result<Vec<Regex>, ValidationError> {
        self.failure_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ValidationError::config(format!(
                        "Stage '{}' has an invalid failure pattern '{p}': {e}",
                        self.id
                    ))
                })
            })
            .collect()
    }
}

/// What is available to a stage at the point it is checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableInputs {
    files: HashSet<String>,
    parameters: HashSet<String>,
}

impl AvailableInputs {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every parameter name of a set.
    #[must_use]
    pub fn with_parameters(mut self, params: &ParameterSet) -> Self {
        self.parameters
            .extend(params.names().map(ToString::to_string));
        self
    }

    /// Adds a file path.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.add_file(path);
        self
    }

    /// Adds a file path in place.
    pub fn add_file(&mut self, path: impl Into<String>) {
        self.files.insert(normalize(&path.into()));
    }

    /// Returns true if the file path is available.
    #[must_use]
    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains(&normalize(path))
    }

    /// Returns true if the parameter is available.
    #[must_use]
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains(name)
    }

    /// Checks the filesystem for the stage's file inputs under `workdir`.
    pub async fn probe(workdir: &Path, params: &ParameterSet, stage: &Stage) -> Self {
        let mut available = Self::new().with_parameters(params);
        for file in stage.file_inputs() {
            if tokio::fs::try_exists(workdir.join(&file.path))
                .await
                .unwrap_or(false)
            {
                available.add_file(file.path.clone());
            }
        }
        available
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

/// Fails if any declared required input is absent.
///
/// # Errors
///
/// Returns a missing-input validation error listing every absent input.
pub fn validate(stage: &Stage, available: &AvailableInputs) -> Result<(), ValidationError> {
    let missing: Vec<String> = stage
        .required_inputs
        .iter()
        .filter(|input| match input {
            InputRef::File(file) => !available.has_file(&file.path),
            InputRef::Parameter { name } => !available.has_parameter(name),
        })
        .map(InputRef::label)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::missing_inputs(&stage.id, missing))
    }
}

/// Environment variable name for an input or output name.
pub(crate) fn env_name(prefix: &str, name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}{suffix}")
}

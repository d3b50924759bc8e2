//! Workspace configuration, loaded once from JSON.

use crate::context::ExecutionLimits;
use crate::errors::{CadflowError, ValidationError};
use crate::remote::RemoteProfile;
use crate::retry::RetryConfig;
use crate::stages::{Pipeline, StageTarget};
use crate::utils::DEFAULT_TAIL_LINES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator tunables. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// First stage-retry delay.
    pub retry_base_delay_ms: u64,
    /// Stage-retry delay cap.
    pub retry_max_delay_ms: u64,
    /// How long a cancelled run waits for the in-flight stage to wind down.
    pub cancel_grace_ms: u64,
    /// Time between a termination request and a forced kill.
    pub kill_grace_ms: u64,
    /// Remote job polling interval.
    pub poll_interval_ms: u64,
    /// Session reconnect attempts before a ConnectionError.
    pub reconnect_attempts: u32,
    /// First reconnect delay.
    pub reconnect_base_delay_ms: u64,
    /// Output lines kept per attempt.
    pub tail_lines: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            cancel_grace_ms: 10_000,
            kill_grace_ms: 5000,
            poll_interval_ms: 5000,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl OrchestratorConfig {
    /// Stage retry policy for a stage with `retry_budget` extra attempts.
    #[must_use]
    pub fn stage_retry(&self, retry_budget: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(retry_budget.saturating_add(1))
            .with_base_delay_ms(self.retry_base_delay_ms)
            .with_max_delay_ms(self.retry_max_delay_ms)
    }

    /// Session reconnect policy.
    #[must_use]
    pub fn reconnect(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.reconnect_attempts)
            .with_base_delay_ms(self.reconnect_base_delay_ms)
            .with_max_delay_ms(self.retry_max_delay_ms.max(self.reconnect_base_delay_ms))
    }

    /// Executor bounds.
    #[must_use]
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            tail_lines: self.tail_lines,
        }
    }

    /// Cancel grace period.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let fail = |msg: &str| Err(ValidationError::config(format!("orchestrator: {msg}")));
        if self.poll_interval_ms == 0 {
            return fail("poll_interval_ms must be positive");
        }
        if self.reconnect_attempts == 0 {
            return fail("reconnect_attempts must be at least 1");
        }
        if self.tail_lines == 0 {
            return fail("tail_lines must be at least 1");
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return fail("retry_max_delay_ms must not be below retry_base_delay_ms");
        }
        Ok(())
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("cadflow-runs")
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CadflowConfig {
    /// Directory under which run working directories are created.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Named remote profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, RemoteProfile>,
    /// Orchestrator tunables.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// The stage list.
    #[serde(default)]
    pub pipeline: Pipeline,
}

impl Default for CadflowConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            profiles: BTreeMap::new(),
            orchestrator: OrchestratorConfig::default(),
            pipeline: Pipeline::default(),
        }
    }
}

impl CadflowConfig {
    /// Creates a configuration for a pipeline with default tunables.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>, pipeline: Pipeline) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            pipeline,
            ..Self::default()
        }
    }

    /// Adds a profile under its own name.
    #[must_use]
    pub fn with_profile(mut self, profile: RemoteProfile) -> Self {
        self.profiles.insert(profile.name.clone(), profile);
        self
    }

    /// Replaces the orchestrator tunables.
    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Reads, parses and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CadflowError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&text)?;
        if config.workspace_root.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new(""));
            config.workspace_root = std::path::absolute(base.join(&config.workspace_root))?;
        }
        Ok(config)
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        let mut config: Self = serde_json::from_str(text)
            .map_err(|e| ValidationError::config(format!("Invalid configuration: {e}")))?;
        for (name, profile) in &mut config.profiles {
            if profile.name.is_empty() {
                profile.name.clone_from(name);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Looks a profile up by name.
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&RemoteProfile> {
        self.profiles.get(name)
    }

    /// Checks profiles, tunables and the pipeline.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, profile) in &self.profiles {
            if profile.name != *name {
                return Err(ValidationError::config(format!(
                    "Profile key '{name}' does not match its name '{}'",
                    profile.name
                )));
            }
            profile.validate()?;
        }
        self.orchestrator.validate()?;
        self.pipeline.validate()?;

        for stage in &self.pipeline.stages {
            if let (StageTarget::Remote, Some(name)) = (stage.target, &stage.profile) {
                if !self.profiles.contains_key(name) {
                    return Err(ValidationError::config(format!(
                        "Stage '{}' names unknown profile '{name}'",
                        stage.id
                    ))
                    .with_subjects(vec![stage.id.clone(), name.clone()]));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ValidationCode;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"{
        "workspace_root": "/tmp/cadflow-runs",
        "profiles": {
            "hpc": {
                "host": "hpc.example.org",
                "username": "eng",
                "key_path": "~/.ssh/id_ed25519",
                "queue_submit_template": "sbatch {script}"
            }
        },
        "orchestrator": { "poll_interval_ms": 250 },
        "pipeline": {
            "name": "bracket",
            "stages": [
                {"id": "cad", "kind": "cad_update", "command": "cad --import {expressions}"},
                {"id": "solve", "kind": "solve", "target": "remote", "profile": "hpc",
                 "command": "solver", "retry_budget": 1}
            ]
        }
    }"#;

    #[test]
    fn test_parse_fills_names_and_defaults() {
        let config = CadflowConfig::from_json_str(CONFIG).unwrap();

        let hpc = config.profile("hpc").unwrap();
        assert_eq!(hpc.name, "hpc");
        assert_eq!(hpc.port, 22);
        assert!(hpc.uses_queue());

        assert_eq!(config.orchestrator.poll_interval_ms, 250);
        assert_eq!(config.orchestrator.kill_grace_ms, 5000);
        assert_eq!(config.pipeline.stages.len(), 2);
        assert_eq!(config.orchestrator.stage_retry(1).max_attempts, 2);
    }

    #[test]
    fn test_unknown_stage_profile_rejected() {
        let text = CONFIG.replace(r#""profile": "hpc""#, r#""profile": "cluster""#);
        let err = CadflowConfig::from_json_str(&text).unwrap_err();
        assert_eq!(err.code, ValidationCode::Config);
        assert!(err.message.contains("cluster"));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = CadflowConfig::from_json_str("{").unwrap_err();
        assert_eq!(err.code, ValidationCode::Config);
    }

    #[test]
    fn test_bad_tunables_rejected() {
        let text = CONFIG.replace(r#""poll_interval_ms": 250"#, r#""poll_interval_ms": 0"#);
        assert!(CadflowConfig::from_json_str(&text).is_err());
    }

    #[test]
    fn test_load_resolves_relative_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadflow.json");
        std::fs::write(
            &path,
            CONFIG.replace("/tmp/cadflow-runs", "runs"),
        )
        .unwrap();

        let config = CadflowConfig::load(&path).unwrap();
        assert_eq!(config.workspace_root, dir.path().join("runs"));
    }
}

//! Remote host profiles.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the remote host authenticates us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Private key (or agent).
    #[default]
    Key,
    /// Password read from an environment variable.
    Password,
}

/// Batch scheduler flavour, which fixes status/cancel commands and parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Slurm (`sbatch`, `squeue`, `sacct`, `scancel`).
    #[default]
    Slurm,
    /// PBS / Torque (`qsub`, `qstat`, `qdel`).
    Pbs,
    /// Profile-provided status and cancel templates.
    Custom,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slurm => write!(f, "slurm"),
            Self::Pbs => write!(f, "pbs"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_base_dir() -> String {
    "~/cadflow".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

/// Connection and layout details for one remote compute host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProfile {
    /// Profile name (filled from the configuration key when empty).
    #[serde(default)]
    pub name: String,
    /// Host name or address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Remote user.
    pub username: String,
    /// Authentication mode.
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Private key path (tilde-expanded), for key mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Name of the environment variable holding the password, for password mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    /// Directory under which run directories are created.
    #[serde(default = "default_base_dir")]
    pub remote_base_dir: String,
    /// Batch submission template; foreground execution when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_submit_template: Option<String>,
    /// Scheduler flavour for queue jobs.
    #[serde(default)]
    pub scheduler: SchedulerKind,
    /// Status template for custom schedulers (`{job_id}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_status_template: Option<String>,
    /// Cancel template for custom schedulers (`{job_id}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_cancel_template: Option<String>,
    /// SSH connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl RemoteProfile {
    /// Creates a key-authenticated profile.
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth_mode: AuthMode::Key,
            key_path: None,
            password_env: None,
            remote_base_dir: default_base_dir(),
            queue_submit_template: None,
            scheduler: SchedulerKind::Slurm,
            queue_status_template: None,
            queue_cancel_template: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Uses key authentication with the given key file.
    #[must_use]
    pub fn with_key(mut self, key_path: impl Into<String>) -> Self {
        self.auth_mode = AuthMode::Key;
        self.key_path = Some(key_path.into());
        self
    }

    /// Uses password authentication, reading the password from `env_var`.
    #[must_use]
    pub fn with_password_env(mut self, env_var: impl Into<String>) -> Self {
        self.auth_mode = AuthMode::Password;
        self.password_env = Some(env_var.into());
        self
    }

    /// Sets the remote base directory.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_base_dir = dir.into();
        self
    }

    /// Enables batch submission.
    #[must_use]
    pub fn with_queue(mut self, scheduler: SchedulerKind, submit_template: impl Into<String>) -> Self {
        self.scheduler = scheduler;
        self.queue_submit_template = Some(submit_template.into());
        self
    }

    /// Sets custom status and cancel templates.
    #[must_use]
    pub fn with_custom_queue_commands(
        mut self,
        status: impl Into<String>,
        cancel: impl Into<String>,
    ) -> Self {
        self.queue_status_template = Some(status.into());
        self.queue_cancel_template = Some(cancel.into());
        self
    }

    /// True if stages are submitted to a batch queue.
    #[must_use]
    pub fn uses_queue(&self) -> bool {
        self.queue_submit_template.is_some()
    }

    /// `user@host`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// The pool key for this profile.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        let credential = match self.auth_mode {
            AuthMode::Key => format!(
                "{}:key:{}",
                self.username,
                self.key_path.as_deref().unwrap_or("agent")
            ),
            AuthMode::Password => format!(
                "{}:password:{}",
                self.username,
                self.password_env.as_deref().unwrap_or_default()
            ),
        };
        SessionKey {
            host: self.host.clone(),
            port: self.port,
            credential,
        }
    }

    /// Checks that the profile is usable.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first problem.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |msg: &str| {
            Err(ValidationError::config(format!("Profile '{}': {msg}", self.name))
                .with_subjects(vec![self.name.clone()]))
        };
        if self.host.trim().is_empty() {
            return fail("host is empty");
        }
        if self.username.trim().is_empty() {
            return fail("username is empty");
        }
        if self.port == 0 {
            return fail("port must be non-zero");
        }
        if self.remote_base_dir.trim().is_empty() {
            return fail("remote_base_dir is empty");
        }
        if self.auth_mode == AuthMode::Password
            && self.password_env.as_deref().map_or(true, str::is_empty)
        {
            return fail("password auth requires password_env");
        }
        if self.uses_queue()
            && self.scheduler == SchedulerKind::Custom
            && (self.queue_status_template.is_none() || self.queue_cancel_template.is_none())
        {
            return fail("custom scheduler requires queue_status_template and queue_cancel_template");
        }
        Ok(())
    }
}

/// Identity of a pooled session: one live session per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// User plus credential source.
    pub credential: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_serde_defaults() {
        let profile: RemoteProfile = serde_json::from_str(
            r#"{"host": "hpc.example.org", "username": "eng"}"#,
        )
        .unwrap();
        assert_eq!(profile.port, 22);
        assert_eq!(profile.auth_mode, AuthMode::Key);
        assert_eq!(profile.remote_base_dir, "~/cadflow");
        assert!(!profile.uses_queue());
    }

    #[test]
    fn test_session_key_shared_across_profiles() {
        let a = RemoteProfile::new("a", "hpc", "eng").with_key("~/.ssh/id");
        let b = RemoteProfile::new("b", "hpc", "eng")
            .with_key("~/.ssh/id")
            .with_base_dir("/scratch");
        let c = RemoteProfile::new("c", "hpc", "eng").with_password_env("HPC_PASS");

        assert_eq!(a.session_key(), b.session_key());
        assert_ne!(a.session_key(), c.session_key());
    }

    #[test]
    fn test_validate() {
        assert!(RemoteProfile::new("p", "hpc", "eng").validate().is_ok());
        assert!(RemoteProfile::new("p", "", "eng").validate().is_err());

        let mut password = RemoteProfile::new("p", "hpc", "eng");
        password.auth_mode = AuthMode::Password;
        assert!(password.validate().is_err());

        let custom = RemoteProfile::new("p", "hpc", "eng").with_queue(SchedulerKind::Custom, "submit {script}");
        assert!(custom.validate().is_err());
    }
}

//! Remote shell transport.
//!
//! [`ShellConnector`] opens sessions, [`RemoteShell`] runs commands and moves
//! files over one. The production transport drives the system OpenSSH client
//! with connection multiplexing: one control socket is one session.

use super::profile::{AuthMode, RemoteProfile};
use crate::errors::CadflowError;
use crate::utils::quote_path;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Remote exit code.
    pub exit_code: i32,
}

impl ShellOutput {
    /// Creates an output record.
    #[must_use]
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// True for exit code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One live session to a remote host.
///
/// `Err` is reserved for transport failures (connection, authentication);
/// a remote command that ran and failed is an `Ok` with a non-zero exit code.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs a command through the remote login shell.
    async fn exec(&self, command: &str) -> Result<ShellOutput, CadflowError>;

    /// Copies a local file to a remote path.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), CadflowError>;

    /// Copies a remote file to a local path.
    async fn download(&self, remote: &str, local: &Path) -> Result<(), CadflowError>;

    /// Closes the session. Errors are ignored.
    async fn close(&self);
}

/// Opens sessions for profiles.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Opens a new session, failing with `Auth` or `Connection` errors.
    async fn connect(&self, profile: &RemoteProfile) -> Result<Arc<dyn RemoteShell>, CadflowError>;
}

/// Only ssh itself (exit 255) reports these as login failures.
const AUTH_PATTERNS: [&str; 2] = ["permission denied", "authentication failed"];

/// ssh's own phrasing, recognisable whatever the exit code.
const SSH_AUTH_PATTERNS: [&str; 3] = [
    "permission denied (",
    "too many authentication failures",
    "host key verification failed",
];

const TRANSIENT_PATTERNS: [&str; 11] = [
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "no route to host",
    "network is unreachable",
    "temporary failure in name resolution",
    "could not resolve hostname",
    "broken pipe",
    "ssh_exchange_identification",
    "connection closed by remote host",
];

/// Classifies a failed ssh/scp invocation.
///
/// Returns `None` when the failure came from the remote command itself.
#[must_use]
pub fn classify_ssh_failure(exit_code: i32, stderr: &str) -> Option<CadflowError> {
    let lower = stderr.to_lowercase();
    let summary = stderr.trim().lines().last().unwrap_or_default().to_string();

    if SSH_AUTH_PATTERNS.iter().any(|p| lower.contains(p))
        || (exit_code == 255 && AUTH_PATTERNS.iter().any(|p| lower.contains(p)))
    {
        return Some(CadflowError::Auth(summary));
    }
    // Exit code 255 is ssh's own failure, not the remote command's.
    if exit_code == 255 || TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        let message = if summary.is_empty() {
            format!("ssh exited with code {exit_code}")
        } else {
            summary
        };
        return Some(CadflowError::Connection(message));
    }
    None
}

/// Opens OpenSSH control-master sessions.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    control_dir: PathBuf,
    persist: Duration,
    command_timeout: Duration,
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self {
            control_dir: std::env::temp_dir().join("cadflow-ssh"),
            persist: Duration::from_secs(600),
            command_timeout: Duration::from_secs(120),
        }
    }
}

impl OpenSshConnector {
    /// Creates a connector with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory holding control sockets.
    #[must_use]
    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

#[async_trait]
impl ShellConnector for OpenSshConnector {
    async fn connect(&self, profile: &RemoteProfile) -> Result<Arc<dyn RemoteShell>, CadflowError> {
        tokio::fs::create_dir_all(&self.control_dir).await?;
        let socket = self
            .control_dir
            .join(format!("{}.sock", uuid::Uuid::new_v4().simple()));
        let log = socket.with_extension("log");

        let session = OpenSshSession {
            profile: profile.clone(),
            control_path: socket,
            command_timeout: self.command_timeout,
        };

        // The master daemonises; logging to a file keeps it off our pipes.
        let mut cmd = session.base_command("ssh")?;
        cmd.args(session.common_options(true))
            .arg("-o")
            .arg(format!("ControlPersist={}", self.persist.as_secs()))
            .arg("-E")
            .arg(&log)
            .arg("-p")
            .arg(profile.port.to_string())
            .arg("-N")
            .arg("-f")
            .arg(profile.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(profile.connect_timeout_secs.saturating_add(5));
        let status = match tokio::time::timeout(timeout, cmd.status()).await {
            Ok(status) => status?,
            Err(_) => {
                return Err(CadflowError::Connection(format!(
                    "Timed out connecting to {}",
                    profile.session_key()
                )))
            }
        };
        let log_text = tokio::fs::read_to_string(&log).await.unwrap_or_default();
        let _ = tokio::fs::remove_file(&log).await;

        if !status.success() {
            let code = status.code().unwrap_or(255);
            return Err(classify_ssh_failure(code, &log_text).unwrap_or_else(|| {
                CadflowError::Connection(format!("ssh master exited with code {code}"))
            }));
        }

        info!(session = %profile.session_key(), "Opened ssh session");
        Ok(Arc::new(session))
    }
}

/// A multiplexed OpenSSH session.
#[derive(Debug)]
pub struct OpenSshSession {
    profile: RemoteProfile,
    control_path: PathBuf,
    command_timeout: Duration,
}

impl OpenSshSession {
    /// Starts `program` (ssh or scp), wrapped in `sshpass` for password auth.
    fn base_command(&self, program: &str) -> Result<Command, CadflowError> {
        match self.profile.auth_mode {
            AuthMode::Key => Ok(Command::new(program)),
            AuthMode::Password => {
                let var = self.profile.password_env.as_deref().unwrap_or_default();
                let password = std::env::var(var).map_err(|_| {
                    CadflowError::Auth(format!(
                        "Password variable '{var}' for profile '{}' is not set",
                        self.profile.name
                    ))
                })?;
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                Ok(cmd)
            }
        }
    }

    fn common_options(&self, master: bool) -> Vec<String> {
        let mut args = Vec::new();
        let mut opt = |value: String| {
            args.push("-o".to_string());
            args.push(value);
        };
        opt(format!("ControlMaster={}", if master { "yes" } else { "no" }));
        opt(format!("ControlPath={}", self.control_path.display()));
        opt(format!("ConnectTimeout={}", self.profile.connect_timeout_secs));
        opt("ServerAliveInterval=15".to_string());
        opt("ServerAliveCountMax=3".to_string());
        match self.profile.auth_mode {
            AuthMode::Key => {
                opt("BatchMode=yes".to_string());
                if self.profile.key_path.is_some() {
                    opt("IdentitiesOnly=yes".to_string());
                }
            }
            AuthMode::Password => {
                opt("PreferredAuthentications=password,keyboard-interactive".to_string());
                opt("NumberOfPasswordPrompts=1".to_string());
            }
        }
        if let Some(key) = &self.profile.key_path {
            args.push("-i".to_string());
            args.push(shellexpand::tilde(key).into_owned());
        }
        args
    }

    async fn run(&self, mut cmd: Command) -> Result<ShellOutput, CadflowError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(CadflowError::Connection(format!(
                    "No response from {} within {}s",
                    self.profile.host,
                    self.command_timeout.as_secs()
                )))
            }
        };

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(255),
        })
    }

    async fn copy(&self, from: String, to: String) -> Result<(), CadflowError> {
        let mut cmd = self.base_command("scp")?;
        cmd.args(self.common_options(false))
            .arg("-q")
            .arg("-P")
            .arg(self.profile.port.to_string())
            .arg(&from)
            .arg(&to);

        let output = self.run(cmd).await?;
        if output.success() {
            return Ok(());
        }
        Err(classify_ssh_failure(output.exit_code, &output.stderr).unwrap_or_else(|| {
            CadflowError::Transfer(format!(
                "Copy {from} -> {to} failed: {}",
                output.stderr.trim()
            ))
        }))
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.profile.destination(), path)
    }
}

#[async_trait]
impl RemoteShell for OpenSshSession {
    async fn exec(&self, command: &str) -> Result<ShellOutput, CadflowError> {
        let mut cmd = self.base_command("ssh")?;
        cmd.args(self.common_options(false))
            .arg("-p")
            .arg(self.profile.port.to_string())
            .arg(self.profile.destination())
            .arg(command);

        debug!(host = %self.profile.host, command, "ssh exec");
        let output = self.run(cmd).await?;
        if output.exit_code == 255 {
            if let Some(err) = classify_ssh_failure(output.exit_code, &output.stderr) {
                return Err(err);
            }
        }
        Ok(output)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), CadflowError> {
        self.copy(local.display().to_string(), self.remote_spec(remote))
            .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), CadflowError> {
        self.copy(self.remote_spec(remote), local.display().to_string())
            .await
    }

    async fn close(&self) {
        let Ok(mut cmd) = self.base_command("ssh") else {
            return;
        };
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(self.profile.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let _ = tokio::time::timeout(Duration::from_secs(5), cmd.status()).await;
        debug!(session = %self.profile.session_key(), "Closed ssh session");
    }
}

/// Quotes a remote path for the shell while leaving `~/` expandable.
pub(crate) fn remote_path_arg(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", quote_path(rest)),
        None if path == "~" => "~".to_string(),
        None => quote_path(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth() {
        let err = classify_ssh_failure(255, "eng@hpc: Permission denied (publickey).").unwrap();
        assert!(matches!(err, CadflowError::Auth(_)));

        let err = classify_ssh_failure(255, "Host key verification failed.").unwrap();
        assert!(matches!(err, CadflowError::Auth(_)));
    }

    #[test]
    fn test_classify_transient() {
        let err = classify_ssh_failure(255, "ssh: connect to host hpc port 22: Connection refused").unwrap();
        assert!(matches!(err, CadflowError::Connection(_)));

        let err = classify_ssh_failure(255, "").unwrap();
        assert!(err.to_string().contains("255"));
    }

    #[test]
    fn test_remote_command_failure_is_not_transport() {
        assert!(classify_ssh_failure(1, "squeue: error: Invalid job id specified").is_none());
        assert!(classify_ssh_failure(
            1,
            "scp: /scratch/run/model.msh: Permission denied"
        )
        .is_none());
    }

    #[test]
    fn test_scp_login_failure_is_auth() {
        let err = classify_ssh_failure(1, "eng@hpc: Permission denied (publickey,password).").unwrap();
        assert!(matches!(err, CadflowError::Auth(_)));
    }

    #[test]
    fn test_remote_path_arg() {
        assert_eq!(remote_path_arg("~/cadflow/run 1"), "~/'cadflow/run 1'");
        assert_eq!(remote_path_arg("/scratch/x"), "'/scratch/x'");
        assert_eq!(remote_path_arg("~"), "~");
    }

    #[test]
    fn test_common_options_key_mode() {
        let session = OpenSshSession {
            profile: RemoteProfile::new("p", "hpc", "eng").with_key("/keys/id"),
            control_path: PathBuf::from("/tmp/x.sock"),
            command_timeout: Duration::from_secs(1),
        };
        let args = session.common_options(false);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"IdentitiesOnly=yes".to_string()));
        assert!(args.contains(&"ControlMaster=no".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id"]));
    }

    #[test]
    fn test_password_mode_requires_env() {
        let session = OpenSshSession {
            profile: RemoteProfile::new("p", "hpc", "eng")
                .with_password_env("CADFLOW_TEST_UNSET_PASSWORD_VAR"),
            control_path: PathBuf::from("/tmp/x.sock"),
            command_timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            session.base_command("ssh"),
            Err(CadflowError::Auth(_))
        ));
    }
}

//! A scripted in-memory remote host.
//!
//! [`ScriptedHost`] understands the commands the dispatcher sends (directory
//! preparation, file verification, job launch, queue submission, status,
//! cancel and log retrieval) and answers them from an in-memory file system
//! and per-stage [`JobScript`]s. Transport faults are injected on demand.

use crate::cancellation::CancellationToken;
use crate::errors::CadflowError;
use crate::remote::{RemoteProfile, RemoteShell, ShellConnector, ShellOutput};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};

const HOME: &str = "/home/cadflow";

static EXIT_MARKER_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"cat ('[^']*')/exit_code").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static GROUP_KILL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"kill -TERM -- -(\d+)").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// What a submitted job does.
#[derive(Debug, Clone)]
pub struct JobScript {
    polls_before_exit: u32,
    exit_code: i32,
    stdout: Vec<String>,
    stderr: Vec<String>,
    outputs: Vec<(String, Vec<u8>)>,
    vanishes: bool,
}

impl JobScript {
    /// Exits 0 on the first poll.
    #[must_use]
    pub fn succeed() -> Self {
        Self::exit(0)
    }

    /// Exits with `code` on the first poll.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self {
            polls_before_exit: 1,
            exit_code: code,
            stdout: Vec::new(),
            stderr: Vec::new(),
            outputs: Vec::new(),
            vanishes: false,
        }
    }

    /// Runs until cancelled.
    #[must_use]
    pub fn never_finishes() -> Self {
        Self::succeed().after_polls(u32::MAX)
    }

    /// Finishes on the `n`th status poll.
    #[must_use]
    pub fn after_polls(mut self, n: u32) -> Self {
        self.polls_before_exit = n.max(1);
        self
    }

    /// Adds a stdout line.
    #[must_use]
    pub fn with_stdout(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }

    /// Adds a stderr line.
    #[must_use]
    pub fn with_stderr(mut self, line: impl Into<String>) -> Self {
        self.stderr.push(line.into());
        self
    }

    /// Drops out of the queue without an exit marker when it finishes.
    #[must_use]
    pub fn vanishes(mut self) -> Self {
        self.vanishes = true;
        self
    }

    /// Writes a file (relative to the run directory) when the job exits.
    #[must_use]
    pub fn with_output(mut self, path: impl Into<String>, content: Vec<u8>) -> Self {
        self.outputs.push((path.into(), content));
        self
    }
}

#[derive(Debug)]
struct SimJob {
    id: String,
    job_dir: String,
    script: JobScript,
    polls: u32,
    exit_code: Option<i32>,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct HostState {
    files: HashMap<String, Vec<u8>>,
    scripts: HashMap<String, VecDeque<JobScript>>,
    jobs: Vec<SimJob>,
    commands: Vec<String>,
    cancels: Vec<String>,
    submissions: usize,
    next_id: u32,
    drop_commands: u32,
    drop_polls: u32,
    reject_auth: bool,
    no_sha256: bool,
    corrupt_downloads: bool,
    cancel_on_upload: Option<(Arc<CancellationToken>, String)>,
}

/// An in-memory remote host shared by every session the connector opens.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHost {
    state: Arc<Mutex<HostState>>,
}

impl ScriptedHost {
    /// Creates an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The remote home directory `~` expands to.
    #[must_use]
    pub fn home(&self) -> &'static str {
        HOME
    }

    /// Queues the behaviour of the next submission of `stage_id`.
    ///
    /// Submissions without a queued script exit 0 and write nothing.
    pub fn script_stage(&self, stage_id: &str, script: JobScript) {
        self.state
            .lock()
            .scripts
            .entry(stage_id.to_string())
            .or_default()
            .push_back(script);
    }

    /// Fails the next `n` commands with a connection error.
    pub fn drop_next_commands(&self, n: u32) {
        self.state.lock().drop_commands = n;
    }

    /// Fails the next `n` status polls with a connection error.
    pub fn drop_next_polls(&self, n: u32) {
        self.state.lock().drop_polls = n;
    }

    /// Rejects every connection attempt with an authentication error.
    pub fn reject_auth(&self) {
        self.state.lock().reject_auth = true;
    }

    /// Pretends `sha256sum` is not installed.
    pub fn without_sha256(&self) {
        self.state.lock().no_sha256 = true;
    }

    /// Flips bytes in every downloaded file.
    pub fn corrupt_downloads(&self) {
        self.state.lock().corrupt_downloads = true;
    }

    /// Cancels `token` when the next upload arrives.
    pub fn cancel_on_upload(&self, token: Arc<CancellationToken>, reason: impl Into<String>) {
        self.state.lock().cancel_on_upload = Some((token, reason.into()));
    }

    /// Places a file on the host.
    pub fn put_file(&self, path: &str, content: Vec<u8>) {
        self.state.lock().files.insert(path.to_string(), content);
    }

    /// Contents of a remote file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    /// Every command received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Number of commands containing `needle`.
    #[must_use]
    pub fn command_count(&self, needle: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    /// Number of distinct jobs started.
    #[must_use]
    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    /// Ids of jobs that received a cancel request.
    #[must_use]
    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().cancels.clone()
    }

    fn exec(&self, command: &str) -> Result<ShellOutput, CadflowError> {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());
        if state.drop_commands > 0 {
            state.drop_commands -= 1;
            return Err(dropped());
        }

        let first = command.split(" && ").next().unwrap_or_default();
        let output = if command.starts_with("mkdir -p ") && command.ends_with("&& pwd") {
            state.prepare(command)
        } else if command.starts_with("wc -c < ") {
            state.verify(first)
        } else if command.starts_with("cat > ") {
            state.write_heredoc(command)
        } else if command.contains("nohup setsid sh job.sh") {
            state.launch(first, false)
        } else if command.contains("submit.out") {
            state.launch(first, true)
        } else if command.contains("kill -0") || command.contains("cadflow-exit:") {
            if state.drop_polls > 0 {
                state.drop_polls -= 1;
                return Err(dropped());
            }
            state.poll(command)
        } else if command.contains("kill -TERM")
            || command.starts_with("scancel ")
            || command.starts_with("qdel ")
        {
            state.cancel(command)
        } else if command.contains("--cadflow-stderr--") {
            state.logs(first)
        } else if let Some(text) = command.strip_prefix("echo ") {
            ShellOutput::new(format!("{text}\n"), "", 0)
        } else if command == "true" || command.starts_with("cd ") {
            ShellOutput::new("", "", 0)
        } else {
            ShellOutput::new("", format!("sh: {command}: not found"), 127)
        };
        Ok(output)
    }
}

fn dropped() -> CadflowError {
    CadflowError::Connection("Connection reset by peer".to_string())
}

impl HostState {
    fn prepare(&mut self, command: &str) -> ShellOutput {
        let cd = command
            .split(" && ")
            .find(|part| part.starts_with("cd "))
            .unwrap_or_default();
        let dir = words(cd).pop().unwrap_or_default();
        ShellOutput::new(format!("{dir}\n"), "", 0)
    }

    fn verify(&self, first: &str) -> ShellOutput {
        let path = words(first).pop().unwrap_or_default();
        let Some(content) = self.files.get(&path) else {
            return ShellOutput::new("", format!("sh: {path}: No such file or directory"), 1);
        };
        let mut stdout = format!("{}\n", content.len());
        if !self.no_sha256 {
            stdout.push_str(&format!("{}  {path}\n", hex::encode(Sha256::digest(content))));
        }
        ShellOutput::new(stdout, "", 0)
    }

    fn write_heredoc(&mut self, command: &str) -> ShellOutput {
        let Some((header, rest)) = command.split_once('\n') else {
            return ShellOutput::new("", "malformed heredoc", 2);
        };
        let path = words(header).get(2).cloned().unwrap_or_default();
        let body = rest.rsplit_once('\n').map_or("", |(body, _)| body);
        self.files.insert(path, body.as_bytes().to_vec());
        ShellOutput::new("", "", 0)
    }

    fn launch(&mut self, first: &str, queue: bool) -> ShellOutput {
        let job_dir = words(first).pop().unwrap_or_default();
        if let Some(job) = self.jobs.iter().find(|j| j.job_dir == job_dir) {
            return ShellOutput::new(submit_text(&job.id, queue), "", 0);
        }

        let stage_id = job_dir
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('-'))
            .map(|(stage, _)| stage.to_string())
            .unwrap_or_default();
        let script = self
            .scripts
            .get_mut(&stage_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(JobScript::succeed);

        self.next_id += 1;
        let id = (4200 + self.next_id).to_string();
        self.submissions += 1;
        self.files.insert(format!("{job_dir}/pid"), id.clone().into_bytes());
        self.jobs.push(SimJob {
            id: id.clone(),
            job_dir,
            script,
            polls: 0,
            exit_code: None,
            cancelled: false,
        });
        ShellOutput::new(submit_text(&id, queue), "", 0)
    }

    fn poll(&mut self, command: &str) -> ShellOutput {
        let queue = command.contains("cadflow-exit:");
        let job_dir = if queue {
            EXIT_MARKER_DIR
                .captures(command)
                .and_then(|c| words(&c[1]).pop())
                .unwrap_or_default()
        } else {
            words(command.split(" && ").next().unwrap_or_default())
                .pop()
                .unwrap_or_default()
        };

        let mut finished = None;
        let Some(job) = self.jobs.iter_mut().find(|j| j.job_dir == job_dir) else {
            return ShellOutput::new(if queue { "cadflow-exit:\n" } else { "lost\n" }, "", 0);
        };
        if job.exit_code.is_none() && !job.cancelled {
            job.polls = job.polls.saturating_add(1);
            if job.polls >= job.script.polls_before_exit {
                job.exit_code = Some(job.script.exit_code);
                finished = Some((job.job_dir.clone(), job.script.outputs.clone()));
            }
        }
        let stdout = match (queue, job.exit_code, job.cancelled) {
            (false, Some(code), _) => format!("exited {code}\n"),
            (false, None, true) => "lost\n".to_string(),
            (false, None, false) => "running\n".to_string(),
            (true, Some(_), _) if job.script.vanishes => "cadflow-exit:\n".to_string(),
            (true, Some(0), _) => "COMPLETED\ncadflow-exit:0\n".to_string(),
            (true, Some(code), _) => format!("FAILED\ncadflow-exit:{code}\n"),
            (true, None, true) => "CANCELLED\ncadflow-exit:\n".to_string(),
            (true, None, false) => "RUNNING\ncadflow-exit:\n".to_string(),
        };

        if let Some((job_dir, outputs)) = finished {
            let run_dir = job_dir
                .rsplit_once("/.cadflow/")
                .map_or(job_dir.as_str(), |(run, _)| run)
                .to_string();
            for (path, content) in outputs {
                self.files.insert(format!("{run_dir}/{path}"), content);
            }
        }
        ShellOutput::new(stdout, "", 0)
    }

    fn cancel(&mut self, command: &str) -> ShellOutput {
        let id = GROUP_KILL
            .captures(command)
            .map(|c| c[1].to_string())
            .or_else(|| words(command).pop())
            .unwrap_or_default();
        match self.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                job.cancelled = true;
                self.cancels.push(id);
                ShellOutput::new("", "", 0)
            }
            None => ShellOutput::new("", format!("no such job {id}"), 1),
        }
    }

    fn logs(&self, first: &str) -> ShellOutput {
        let job_dir = words(first).pop().unwrap_or_default();
        let mut stdout = String::new();
        if let Some(job) = self.jobs.iter().find(|j| j.job_dir == job_dir) {
            for line in &job.script.stdout {
                stdout.push_str(line);
                stdout.push('\n');
            }
            stdout.push_str("--cadflow-stderr--\n");
            for line in &job.script.stderr {
                stdout.push_str(line);
                stdout.push('\n');
            }
        }
        ShellOutput::new(stdout, "", 0)
    }
}

fn submit_text(id: &str, queue: bool) -> String {
    if queue {
        format!("Submitted batch job {id}\n")
    } else {
        format!("{id}\n")
    }
}

/// Splits a shell fragment into words, honouring single quotes, backslash
/// escapes and a leading `~/`.
fn words(fragment: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = fragment.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '~' if !in_word && matches!(chars.peek(), Some('/') | None | Some(' ')) => {
                in_word = true;
                current.push_str(HOME);
            }
            c if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

/// A session on a [`ScriptedHost`].
#[derive(Debug)]
pub struct ScriptedShell {
    host: ScriptedHost,
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn exec(&self, command: &str) -> Result<ShellOutput, CadflowError> {
        self.host.exec(command)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), CadflowError> {
        let content = tokio::fs::read(local).await?;
        self.host.put_file(remote, content);
        let trigger = self.host.state.lock().cancel_on_upload.take();
        if let Some((token, reason)) = trigger {
            token.cancel(reason);
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), CadflowError> {
        let (content, corrupt) = {
            let state = self.host.state.lock();
            (state.files.get(remote).cloned(), state.corrupt_downloads)
        };
        let Some(mut content) = content else {
            return Err(CadflowError::Transfer(format!("{remote}: No such file or directory")));
        };
        if corrupt {
            content.iter_mut().for_each(|b| *b = !*b);
        }
        tokio::fs::write(local, content).await?;
        Ok(())
    }

    async fn close(&self) {}
}

/// Opens [`ScriptedShell`]s and counts connection attempts.
#[derive(Debug)]
pub struct ScriptedConnector {
    host: ScriptedHost,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    /// Creates a connector for `host`.
    #[must_use]
    pub fn new(host: ScriptedHost) -> Self {
        Self {
            host,
            attempts: AtomicU32::new(0),
        }
    }

    /// Number of connection attempts, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn connect(&self, profile: &RemoteProfile) -> Result<Arc<dyn RemoteShell>, CadflowError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.host.state.lock().reject_auth {
            return Err(CadflowError::Auth(format!(
                "{}: Permission denied (publickey)",
                profile.destination()
            )));
        }
        Ok(Arc::new(ScriptedShell {
            host: self.host.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words() {
        assert_eq!(
            words("cd ~/'cadflow/run 1' && pwd"),
            vec!["cd", "/home/cadflow/cadflow/run 1", "&&", "pwd"]
        );
        assert_eq!(words("wc -c < '/a/it'\\''s'"), vec!["wc", "-c", "<", "/a/it's"]);
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let host = ScriptedHost::new();
        host.script_stage("mesh", JobScript::exit(2).after_polls(2));
        let shell = ScriptedShell { host: host.clone() };

        let launch = "cd '/r/.cadflow/mesh-1' && if [ ! -s pid ]; then nohup setsid sh job.sh > /dev/null 2>&1 < /dev/null & echo $! > pid; fi; cat pid";
        let pid = shell.exec(launch).await.unwrap().stdout;
        assert_eq!(shell.exec(launch).await.unwrap().stdout, pid);
        assert_eq!(host.submissions(), 1);

        let poll = "cd '/r/.cadflow/mesh-1' && if [ -f exit_code ]; then echo \"exited $(cat exit_code)\"; elif kill -0 $(cat pid) 2>/dev/null; then echo running; else echo lost; fi";
        assert_eq!(shell.exec(poll).await.unwrap().stdout, "running\n");
        assert_eq!(shell.exec(poll).await.unwrap().stdout, "exited 2\n");
    }
}

//! Remote execution over SSH.
//!
//! - [`RemoteProfile`]: host, credentials and queue settings
//! - [`RemoteShell`] / [`ShellConnector`]: the transport seam, with an
//!   OpenSSH implementation
//! - [`SessionPool`]: one shared session per host and credential
//! - [`RemoteDispatcher`]: staging, submission, polling and collection

mod dispatcher;
mod job;
mod pool;
mod profile;
mod scheduler;
mod shell;

pub use dispatcher::RemoteDispatcher;
pub use job::{Job, JobHandle, JobRegistry, JobState};
pub use pool::SessionPool;
pub use profile::{AuthMode, RemoteProfile, SchedulerKind, SessionKey};
pub use scheduler::{parse_queue_status, parse_submit_output};
pub use shell::{
    classify_ssh_failure, OpenSshConnector, OpenSshSession, RemoteShell, ShellConnector,
    ShellOutput,
};

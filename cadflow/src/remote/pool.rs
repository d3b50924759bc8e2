//! Pooled shell sessions, one per (host, port, credential).

use super::profile::{RemoteProfile, SessionKey};
use super::shell::{RemoteShell, ShellConnector};
use crate::errors::{CadflowError, ErrorKind};
use crate::retry::{RetryConfig, RetryDecision, RetryState};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Default)]
struct Slot {
    shell: Option<Arc<dyn RemoteShell>>,
}

/// Shares sessions across stages and runs.
///
/// Each operation locks its key's slot for its whole duration, so two runs
/// never interleave on one channel. Transient connection failures drop the
/// session and reconnect with backoff; authentication failures are returned
/// immediately.
pub struct SessionPool {
    connector: Arc<dyn ShellConnector>,
    slots: DashMap<SessionKey, Arc<Mutex<Slot>>>,
    reconnect: RetryConfig,
    connects: AtomicU64,
}

impl SessionPool {
    /// Creates a pool.
    #[must_use]
    pub fn new(connector: Arc<dyn ShellConnector>, reconnect: RetryConfig) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            reconnect,
            connects: AtomicU64::new(0),
        }
    }

    /// Number of sessions opened so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Number of keys that currently hold a live session.
    pub async fn live_sessions(&self) -> usize {
        let slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.shell.is_some() {
                live += 1;
            }
        }
        live
    }

    fn slot(&self, key: SessionKey) -> Arc<Mutex<Slot>> {
        self.slots.entry(key).or_default().clone()
    }

    /// Runs `op` against the profile's session, reconnecting on transient
    /// connection errors until the reconnect budget is spent.
    ///
    /// `op` may run more than once and must be safe to repeat.
    pub async fn run<T, F, Fut>(&self, profile: &RemoteProfile, op: F) -> Result<T, CadflowError>
    where
        F: Fn(Arc<dyn RemoteShell>) -> Fut,
        Fut: Future<Output = Result<T, CadflowError>>,
    {
        let key = profile.session_key();
        let slot = self.slot(key.clone());
        let mut state = RetryState::new();

        loop {
            let result = {
                let mut guard = slot.lock().await;
                match self.ensure_connected(&mut guard, profile).await {
                    Ok(shell) => {
                        let result = op(shell.clone()).await;
                        if matches!(&result, Err(e) if e.kind() == ErrorKind::Connection) {
                            guard.shell = None;
                            shell.close().await;
                        }
                        result
                    }
                    Err(e) => Err(e),
                }
            };

            let err = match result {
                Err(e) if e.kind() == ErrorKind::Connection => e,
                other => return other,
            };
            match state.record_failure(&self.reconnect, true) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        session = %key,
                        attempt = state.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Session lost, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    return Err(CadflowError::Connection(format!(
                        "{err} (gave up after {} attempts)",
                        state.attempts
                    )));
                }
            }
        }
    }

    async fn ensure_connected(
        &self,
        slot: &mut Slot,
        profile: &RemoteProfile,
    ) -> Result<Arc<dyn RemoteShell>, CadflowError> {
        if let Some(shell) = &slot.shell {
            return Ok(shell.clone());
        }
        let shell = self.connector.connect(profile).await?;
        self.connects.fetch_add(1, Ordering::Relaxed);
        info!(session = %profile.session_key(), "Session established");
        slot.shell = Some(shell.clone());
        Ok(shell)
    }

    /// Closes every pooled session.
    pub async fn close_all(&self) {
        let slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            if let Some(shell) = slot.lock().await.shell.take() {
                shell.close().await;
            }
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("keys", &self.slots.len())
            .field("connects", &self.connect_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedConnector, ScriptedHost};
    use crate::remote::ShellOutput;

    fn fast_reconnect(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
    }

    #[tokio::test]
    async fn test_session_reused_across_profiles_with_same_key() {
        let host = ScriptedHost::new();
        let pool = SessionPool::new(Arc::new(ScriptedConnector::new(host.clone())), fast_reconnect(3));
        let a = RemoteProfile::new("a", "hpc", "eng");
        let b = RemoteProfile::new("b", "hpc", "eng").with_base_dir("/scratch");

        for profile in [&a, &b, &a] {
            pool.run(profile, |shell| async move { shell.exec("true").await })
                .await
                .unwrap();
        }
        assert_eq!(pool.connect_count(), 1);
        assert_eq!(pool.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let host = ScriptedHost::new();
        host.drop_next_commands(2);
        let pool = SessionPool::new(Arc::new(ScriptedConnector::new(host.clone())), fast_reconnect(5));
        let profile = RemoteProfile::new("a", "hpc", "eng");

        let out = pool
            .run(&profile, |shell| async move { shell.exec("echo ok").await })
            .await
            .unwrap();
        assert_eq!(out, ShellOutput::new("ok\n", "", 0));
        assert_eq!(pool.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let host = ScriptedHost::new();
        host.drop_next_commands(10);
        let pool = SessionPool::new(Arc::new(ScriptedConnector::new(host.clone())), fast_reconnect(3));
        let profile = RemoteProfile::new("a", "hpc", "eng");

        let err = pool
            .run(&profile, |shell| async move { shell.exec("echo ok").await })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(host.command_count("echo ok"), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let host = ScriptedHost::new();
        host.reject_auth();
        let connector = Arc::new(ScriptedConnector::new(host.clone()));
        let pool = SessionPool::new(connector.clone(), fast_reconnect(5));

        let err = pool
            .run(&RemoteProfile::new("a", "hpc", "eng"), |shell| async move {
                shell.exec("true").await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(connector.attempts(), 1);
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::config::{BridgeSettings, LaunchConfig};
use super::process;
use super::state::BridgeState;
use super::BridgeError;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Notified when the bridge cannot be kept alive.
pub trait Alerter: Send + Sync {
    fn bridge_gave_up(&self, attempts: u32, last_error: &str);
}

pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn bridge_gave_up(&self, attempts: u32, last_error: &str) {
        error!("[bridge] giving up after {attempts} restart attempts: {last_error}");
    }
}

struct Inner {
    state: BridgeState,
    pid: Option<u32>,
    restarts: u32,
    watcher: Option<Watcher>,
}

impl Inner {
    fn transition(&mut self, next: BridgeState) {
        if self.state.can_transition_to(next) {
            debug!("[bridge] {} -> {next}", self.state);
            self.state = next;
        } else {
            warn!("[bridge] ignoring invalid transition {} -> {next}", self.state);
        }
    }
}

struct Watcher {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the bridge process lifecycle: launch, crash restarts with backoff,
/// and graceful stop.
pub struct BridgeSupervisor {
    settings: Arc<BridgeSettings>,
    alerter: Arc<dyn Alerter>,
    inner: Arc<Mutex<Inner>>,
    // Held for the whole of `init`/`stop` so they never interleave.
    op: Mutex<()>,
}

impl BridgeSupervisor {
    pub fn new(settings: BridgeSettings, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            settings: Arc::new(settings),
            alerter,
            inner: Arc::new(Mutex::new(Inner {
                state: BridgeState::Uninitialized,
                pid: None,
                restarts: 0,
                watcher: None,
            })),
            op: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> BridgeState {
        self.inner.lock().await.state
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.pid
    }

    /// Number of respawns performed since construction.
    pub async fn restarts(&self) -> u32 {
        self.inner.lock().await.restarts
    }

    /// Write the target descriptors and launch the bridge. Calling `init`
    /// while the bridge is already supervised returns the current state
    /// without spawning a second process. A failed spawn is not an error:
    /// the supervisor enters `Failed` and retries per the restart policy.
    pub async fn init(&self, launch: LaunchConfig) -> Result<BridgeState, BridgeError> {
        if self.settings.command.trim().is_empty() {
            return Err(BridgeError::EmptyCommand);
        }
        let _op = self.op.lock().await;
        let mut inner = self.inner.lock().await;
        if inner.watcher.is_some() {
            info!("[bridge] already initialized ({})", inner.state);
            return Ok(inner.state);
        }

        inner.transition(BridgeState::Initializing);
        let child = match process::spawn(&self.settings, &launch) {
            Ok(child) => {
                inner.pid = child.id();
                inner.transition(BridgeState::Running);
                Some(child)
            }
            Err(e) => {
                error!("[bridge] {e}");
                inner.transition(BridgeState::Failed);
                None
            }
        };

        let token = CancellationToken::new();
        let ctx = WatchContext {
            settings: self.settings.clone(),
            launch,
            alerter: self.alerter.clone(),
            inner: self.inner.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(ctx.watch(child));
        inner.watcher = Some(Watcher { token, handle });
        Ok(inner.state)
    }

    /// Terminate the bridge (SIGTERM, then SIGKILL after the stop timeout)
    /// and cancel pending restarts. Safe to call repeatedly and before
    /// `init`; always ends in `Stopped`.
    pub async fn stop(&self) -> BridgeState {
        let _op = self.op.lock().await;
        let watcher = {
            let mut inner = self.inner.lock().await;
            match inner.watcher.take() {
                Some(watcher) => {
                    info!("[bridge] stopping");
                    inner.transition(BridgeState::Stopping);
                    // The watcher re-checks the token under this lock.
                    watcher.token.cancel();
                    watcher
                }
                None => {
                    inner.transition(BridgeState::Stopped);
                    return inner.state;
                }
            }
        };

        let budget = process::terminate_budget(self.settings.stop_timeout);
        let abort = watcher.handle.abort_handle();
        if timeout(budget, watcher.handle).await.is_err() {
            warn!("[bridge] watcher did not finish within {}s, aborting", budget.as_secs());
            abort.abort();
        }

        let mut inner = self.inner.lock().await;
        inner.pid = None;
        inner.transition(BridgeState::Stopped);
        inner.state
    }
}

struct WatchContext {
    settings: Arc<BridgeSettings>,
    launch: LaunchConfig,
    alerter: Arc<dyn Alerter>,
    inner: Arc<Mutex<Inner>>,
    token: CancellationToken,
}

impl WatchContext {
    /// Supervision loop. Owns the child for its whole life; exits on
    /// cancellation (after terminating the child) or when retries run out.
    async fn watch(self, mut child: Option<Child>) {
        let policy = self.settings.restart;
        let mut started_at = Instant::now();
        let mut attempts: u32 = 0;
        let mut last_error = String::from("bridge failed to spawn");

        loop {
            if let Some(mut proc) = child.take() {
                let exited = tokio::select! {
                    _ = self.token.cancelled() => None,
                    status = proc.wait() => Some(status),
                };
                let Some(status) = exited else {
                    process::terminate(&mut proc, self.settings.stop_timeout).await;
                    return;
                };

                last_error = match status {
                    Ok(status) => format!("bridge exited with {status}"),
                    Err(e) => format!("failed to wait on bridge: {e}"),
                };
                warn!("[bridge] {last_error}");
                if started_at.elapsed() >= policy.stable_after {
                    attempts = 0;
                }

                let mut inner = self.inner.lock().await;
                if self.token.is_cancelled() {
                    return;
                }
                inner.pid = None;
                inner.transition(BridgeState::Failed);
            }

            attempts += 1;
            if !policy.allows(attempts) {
                let mut inner = self.inner.lock().await;
                if self.token.is_cancelled() {
                    return;
                }
                inner.transition(BridgeState::Stopped);
                inner.watcher = None;
                drop(inner);
                self.alerter.bridge_gave_up(attempts - 1, &last_error);
                return;
            }

            let delay = policy.backoff(attempts);
            info!(
                "[bridge] restarting in {}ms (attempt {attempts}/{})",
                delay.as_millis(),
                policy.max_retries
            );
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep(delay) => {}
            }

            let mut inner = self.inner.lock().await;
            if self.token.is_cancelled() {
                return;
            }
            inner.transition(BridgeState::Initializing);
            inner.restarts += 1;
            match process::spawn(&self.settings, &self.launch) {
                Ok(spawned) => {
                    inner.pid = spawned.id();
                    inner.transition(BridgeState::Running);
                    started_at = Instant::now();
                    child = Some(spawned);
                }
                Err(e) => {
                    error!("[bridge] {e}");
                    last_error = e.to_string();
                    inner.transition(BridgeState::Failed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::config::{BridgeLogging, BridgeTarget, RestartPolicy};
    use nix::sys::signal;
    use nix::unistd::Pid;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingAlerter {
        calls: StdMutex<Vec<(u32, String)>>,
    }

    impl Alerter for RecordingAlerter {
        fn bridge_gave_up(&self, attempts: u32, last_error: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((attempts, last_error.to_string()));
        }
    }

    fn settings(script: &str) -> BridgeSettings {
        BridgeSettings {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            stdout: "null".to_string(),
            stderr: "null".to_string(),
            restart: RestartPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(100),
                stable_after: Duration::from_secs(60),
            },
            stop_timeout: Duration::from_secs(2),
            ..BridgeSettings::default()
        }
    }

    fn launch(dir: &Path) -> LaunchConfig {
        LaunchConfig {
            config_dir: dir.join("conf.d"),
            bridge_port: 18125,
            logging: BridgeLogging::default(),
            flush_interval: Duration::from_secs(1),
        }
    }

    fn pid_alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    async fn wait_for_state(sup: &BridgeSupervisor, want: BridgeState) {
        timeout(Duration::from_secs(10), async {
            while sup.state().await != want {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("bridge never reached {want}"));
    }

    #[tokio::test]
    async fn test_stop_before_init() {
        let sup = BridgeSupervisor::new(settings("exit 0"), Arc::new(LogAlerter));
        assert_eq!(sup.state().await, BridgeState::Uninitialized);
        assert_eq!(sup.stop().await, BridgeState::Stopped);
        assert_eq!(sup.stop().await, BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_init_runs_and_stop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let sup = BridgeSupervisor::new(settings("exec sleep 60"), Arc::new(LogAlerter));

        assert_eq!(sup.init(launch(dir.path())).await.unwrap(), BridgeState::Running);
        let pid = sup.pid().await.unwrap();
        assert!(pid_alive(pid));

        assert_eq!(sup.stop().await, BridgeState::Stopped);
        assert!(!pid_alive(pid));
        assert_eq!(sup.pid().await, None);
        assert_eq!(sup.stop().await, BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sup = BridgeSupervisor::new(settings("exec sleep 60"), Arc::new(LogAlerter));

        sup.init(launch(dir.path())).await.unwrap();
        let pid = sup.pid().await;
        assert_eq!(sup.init(launch(dir.path())).await.unwrap(), BridgeState::Running);
        assert_eq!(sup.pid().await, pid);
        assert_eq!(sup.restarts().await, 0);

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_init_after_stop_relaunches() {
        let dir = tempfile::tempdir().unwrap();
        let sup = BridgeSupervisor::new(settings("exec sleep 60"), Arc::new(LogAlerter));

        sup.init(launch(dir.path())).await.unwrap();
        sup.stop().await;
        assert_eq!(sup.init(launch(dir.path())).await.unwrap(), BridgeState::Running);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings("trap '' TERM; while true; do sleep 1; done");
        cfg.stop_timeout = Duration::from_millis(300);
        let sup = BridgeSupervisor::new(cfg, Arc::new(LogAlerter));

        sup.init(launch(dir.path())).await.unwrap();
        let pid = sup.pid().await.unwrap();
        sleep(Duration::from_millis(200)).await;

        let start = std::time::Instant::now();
        assert_eq!(sup.stop().await, BridgeState::Stopped);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_crash_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed-once");
        let script = format!(
            "if [ -f {m} ]; then exec sleep 60; else touch {m}; exit 3; fi",
            m = marker.display()
        );
        let sup = BridgeSupervisor::new(settings(&script), Arc::new(LogAlerter));

        sup.init(launch(dir.path())).await.unwrap();
        timeout(Duration::from_secs(10), async {
            while sup.restarts().await < 1 || sup.state().await != BridgeState::Running {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sup.restarts().await, 1);
        assert!(marker.exists());

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_alerts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let script = format!("echo run >> {}; exit 1", runs.display());
        let alerter = Arc::new(RecordingAlerter::default());
        let sup = BridgeSupervisor::new(settings(&script), alerter.clone());

        sup.init(launch(dir.path())).await.unwrap();
        wait_for_state(&sup, BridgeState::Stopped).await;

        // Initial run plus max_retries respawns.
        let count = std::fs::read_to_string(&runs).unwrap().lines().count();
        assert_eq!(count, 4);
        assert_eq!(sup.restarts().await, 3);

        let calls = alerter.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 3);
        assert!(calls[0].1.contains("exited"));

        assert_eq!(sup.stop().await, BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_enters_failed_then_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings("exit 0");
        cfg.command = "/nonexistent/bridge".to_string();
        cfg.restart.max_retries = 1;
        let alerter = Arc::new(RecordingAlerter::default());
        let sup = BridgeSupervisor::new(cfg, alerter.clone());

        assert_eq!(sup.init(launch(dir.path())).await.unwrap(), BridgeState::Failed);
        wait_for_state(&sup, BridgeState::Stopped).await;
        let calls = alerter.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.contains("/nonexistent/bridge"));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings("exit 1");
        cfg.restart.initial_backoff = Duration::from_secs(30);
        cfg.restart.max_backoff = Duration::from_secs(30);
        let sup = BridgeSupervisor::new(cfg, Arc::new(LogAlerter));

        sup.init(launch(dir.path())).await.unwrap();
        wait_for_state(&sup, BridgeState::Failed).await;

        let start = std::time::Instant::now();
        assert_eq!(sup.stop().await, BridgeState::Stopped);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.restarts().await, 0);
    }

    #[tokio::test]
    async fn test_init_writes_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings("exec sleep 60");
        cfg.targets = vec![BridgeTarget {
            name: "solr".to_string(),
            host: "localhost".to_string(),
            port: 9999,
            dimensions: BTreeMap::new(),
        }];
        let sup = BridgeSupervisor::new(cfg, Arc::new(LogAlerter));

        let launch = launch(dir.path());
        sup.init(launch.clone()).await.unwrap();
        assert!(launch.config_dir.join("solr.yaml").exists());
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings("exit 0");
        cfg.command = " ".to_string();
        let sup = BridgeSupervisor::new(cfg, Arc::new(LogAlerter));
        assert!(matches!(
            sup.init(launch(dir.path())).await,
            Err(BridgeError::EmptyCommand)
        ));
        assert_eq!(sup.state().await, BridgeState::Uninitialized);
    }
}

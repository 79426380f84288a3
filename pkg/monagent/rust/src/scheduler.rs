// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Interval-driven check execution.
//!
//! Every tick the scheduler walks the registered checks and spawns one task
//! per due check. A check is never started while a previous run of the same
//! check is still in flight. Errors and panics are recorded in the check's
//! status and never reach the scheduling loop.

use crate::aggregator::Aggregator;
use crate::check::Check;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICK: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 16;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub max_concurrent: usize,
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            max_concurrent: DEFAULT_MAX_CONCURRENT_CHECKS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("check {0:?} is already registered")]
    DuplicateCheck(String),
    #[error("check {0:?} has a zero interval")]
    ZeroInterval(String),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckStatus {
    pub runs: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub last_sample_count: usize,
    pub running: bool,
}

struct CheckEntry {
    check: Arc<dyn Check>,
    running: AtomicBool,
    last_started: Mutex<Option<Instant>>,
    status: Mutex<CheckStatus>,
}

impl CheckEntry {
    fn name(&self) -> &str {
        self.check.name()
    }

    fn is_due(&self, now: Instant) -> bool {
        match *self.last_started.lock().unwrap_or_else(PoisonError::into_inner) {
            None => true,
            Some(started) => now.duration_since(started) >= self.check.interval(),
        }
    }

    fn record_success(&self, samples: usize) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.runs += 1;
        status.consecutive_failures = 0;
        status.last_error = None;
        status.last_sample_count = samples;
    }

    fn record_failure(&self, err: String) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.runs += 1;
        status.failures += 1;
        status.consecutive_failures += 1;
        status.last_error = Some(err);
        status.last_sample_count = 0;
    }

    fn snapshot(&self) -> CheckStatus {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        status.running = self.running.load(Ordering::Acquire);
        status
    }
}

/// Clears the in-flight flag when a run ends, including by abort.
struct InFlight {
    entry: Arc<CheckEntry>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.entry.running.store(false, Ordering::Release);
    }
}

enum Event {
    Shutdown,
    Tick,
    Finished(Result<(), JoinError>),
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Scheduler {
    aggregator: Arc<Aggregator>,
    config: SchedulerConfig,
    checks: Mutex<Vec<Arc<CheckEntry>>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(aggregator: Arc<Aggregator>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            aggregator,
            config,
            checks: Mutex::new(Vec::new()),
            permits,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn register(&self, check: Arc<dyn Check>) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        if check.interval().is_zero() {
            return Err(SchedulerError::ZeroInterval(check.name().to_string()));
        }
        let mut checks = self.checks.lock().unwrap_or_else(PoisonError::into_inner);
        if checks.iter().any(|e| e.name() == check.name()) {
            return Err(SchedulerError::DuplicateCheck(check.name().to_string()));
        }
        info!(
            "[check:{}] registered (interval={}s)",
            check.name(),
            check.interval().as_secs_f64()
        );
        checks.push(Arc::new(CheckEntry {
            check,
            running: AtomicBool::new(false),
            last_started: Mutex::new(None),
            status: Mutex::new(CheckStatus::default()),
        }));
        Ok(())
    }

    pub fn status(&self, name: &str) -> Option<CheckStatus> {
        self.checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.snapshot())
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Stop starting new runs. [`Scheduler::run`] returns once in-flight runs
    /// finish or the shutdown timeout elapses.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("check scheduler is already running");
            return;
        }
        info!("check scheduler started");

        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => Event::Shutdown,
                _ = ticker.tick() => Event::Tick,
                Some(res) = tasks.join_next(), if !tasks.is_empty() => Event::Finished(res),
            };
            match event {
                Event::Shutdown => break,
                Event::Tick => self.dispatch_due(&mut tasks),
                Event::Finished(res) => reap(res),
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!("waiting for {in_flight} in-flight check(s)");
        }
        let drained = timeout(self.config.shutdown_timeout, async {
            while let Some(res) = tasks.join_next().await {
                reap(res);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "shutdown timeout ({}s) reached, aborting {} check(s)",
                self.config.shutdown_timeout.as_secs_f64(),
                tasks.len()
            );
            tasks.shutdown().await;
        }
        info!("check scheduler stopped");
    }

    fn dispatch_due(&self, tasks: &mut JoinSet<()>) {
        let now = Instant::now();
        let checks: Vec<Arc<CheckEntry>> = self
            .checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for entry in checks {
            if entry.running.load(Ordering::Acquire) || !entry.is_due(now) {
                continue;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("[check:{}] due but concurrency limit reached", entry.name());
                continue;
            };

            entry.running.store(true, Ordering::Release);
            *entry
                .last_started
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(now);

            let aggregator = self.aggregator.clone();
            let guard = InFlight {
                entry: entry.clone(),
                _permit: permit,
            };
            tasks.spawn(execute(entry, aggregator, guard));
        }
    }
}

async fn execute(entry: Arc<CheckEntry>, aggregator: Arc<Aggregator>, _guard: InFlight) {
    debug!("[check:{}] running", entry.name());
    // The run gets its own task so that a panic surfaces as a JoinError.
    let check = entry.check.clone();
    let run = tokio::spawn(async move { check.run().await });
    let _abort = AbortOnDrop(run.abort_handle());

    match run.await {
        Err(e) if e.is_panic() => {
            error!("[check:{}] panicked: {e}", entry.name());
            entry.record_failure("check panicked".to_string());
        }
        Err(e) => {
            warn!("[check:{}] run cancelled: {e}", entry.name());
            entry.record_failure("check cancelled".to_string());
        }
        Ok(Ok(samples)) => {
            let count = samples.len();
            for sample in samples {
                if let Err(e) = aggregator.submit(sample) {
                    warn!("[check:{}] sample rejected: {e}", entry.name());
                }
            }
            entry.record_success(count);
            debug!("[check:{}] submitted {count} sample(s)", entry.name());
        }
        Ok(Err(e)) => {
            error!("[check:{}] run failed: {e:#}", entry.name());
            entry.record_failure(format!("{e:#}"));
        }
    }
}

fn reap(res: Result<(), JoinError>) {
    if let Err(e) = res {
        debug!("check task ended abnormally: {e}");
    }
}

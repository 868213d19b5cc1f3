// ========== Background Manager ==========

use crate::config::jittered;
use async_trait::async_trait;
use serde::Serialize;
use slime_lib::{unix_timestamp, SlimeResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum BackgroundTaskKind {
    ScrubFiles,
    ScrubLocations,
    ScrubWal,
    Rebalance,
    ReloadConfig,
    FinderScan,
    FinderTest,
}

impl BackgroundTaskKind {
    pub fn all() -> [BackgroundTaskKind; 7] {
        [
            BackgroundTaskKind::ScrubFiles,
            BackgroundTaskKind::ScrubLocations,
            BackgroundTaskKind::ScrubWal,
            BackgroundTaskKind::Rebalance,
            BackgroundTaskKind::ReloadConfig,
            BackgroundTaskKind::FinderScan,
            BackgroundTaskKind::FinderTest,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackgroundTaskPolicy {
    /// Pause between two runs of this kind.
    pub interval: Duration,
    /// Fractional spread applied to `interval`.
    pub jitter: f64,
}

impl BackgroundTaskPolicy {
    pub fn new(interval: Duration, jitter: f64) -> Self {
        Self { interval, jitter }
    }

    pub fn next_delay(&self) -> Duration {
        jittered(self.interval, self.jitter)
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BackgroundRunStats {
    pub executed: usize,
    pub failed: usize,
    pub last_run: Option<i64>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait BackgroundTaskExecutor: Send + Sync {
    async fn execute(&self, kind: BackgroundTaskKind, cancel: &CancellationToken) -> SlimeResult<()>;
}

pub struct BackgroundMgr {
    policies: HashMap<BackgroundTaskKind, BackgroundTaskPolicy>,
    stats: HashMap<BackgroundTaskKind, BackgroundRunStats>,
}

impl BackgroundMgr {
    pub fn new() -> Self {
        let policies = BackgroundTaskKind::all()
            .into_iter()
            .map(|kind| (kind, BackgroundTaskPolicy::new(Duration::from_secs(30), 0.05)))
            .collect();
        Self {
            policies,
            stats: HashMap::new(),
        }
    }

    pub fn set_policy(&mut self, kind: BackgroundTaskKind, policy: BackgroundTaskPolicy) {
        self.policies.insert(kind, policy);
    }

    pub fn policy(&self, kind: BackgroundTaskKind) -> Option<BackgroundTaskPolicy> {
        self.policies.get(&kind).copied()
    }

    pub fn stats(&self, kind: BackgroundTaskKind) -> BackgroundRunStats {
        self.stats.get(&kind).cloned().unwrap_or_default()
    }

    pub fn all_stats(&self) -> HashMap<BackgroundTaskKind, BackgroundRunStats> {
        self.stats.clone()
    }

    fn record(&mut self, kind: BackgroundTaskKind, result: &SlimeResult<()>) {
        let stats = self.stats.entry(kind).or_default();
        stats.last_run = Some(unix_timestamp());
        match result {
            Ok(()) => {
                stats.executed += 1;
                stats.last_error = None;
            }
            Err(e) => {
                stats.failed += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }

    /// Execute one run of `kind` and record its outcome.
    pub async fn run_kind(
        mgr: &Arc<Mutex<BackgroundMgr>>,
        kind: BackgroundTaskKind,
        executor: &(dyn BackgroundTaskExecutor + Send + Sync),
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        let started = Instant::now();
        debug!("background task start: kind={:?}", kind);
        let result = executor.execute(kind, cancel).await;
        match &result {
            Ok(()) => debug!(
                "background task done: kind={:?}, elapsed={:?}",
                kind,
                started.elapsed()
            ),
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(
                "background task failed: kind={:?}, elapsed={:?}, err={}",
                kind,
                started.elapsed(),
                e
            ),
        }
        match mgr.lock() {
            Ok(mut guard) => guard.record(kind, &result),
            Err(e) => error!("background run_kind: lock poisoned while recording: {}", e),
        }
        result
    }

    /// Loop `kind` on its policy until `cancel` fires. The first run happens
    /// after one interval.
    pub fn spawn_worker(
        mgr: Arc<Mutex<BackgroundMgr>>,
        kind: BackgroundTaskKind,
        executor: Arc<dyn BackgroundTaskExecutor + Send + Sync>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        tracker.spawn(async move {
            info!("background worker started: kind={:?}", kind);
            loop {
                let delay = match mgr.lock() {
                    Ok(guard) => guard.policy(kind).map(|p| p.next_delay()),
                    Err(_) => None,
                }
                .unwrap_or(Duration::from_secs(30));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let _ = Self::run_kind(&mgr, kind, executor.as_ref(), &cancel).await;
                if cancel.is_cancelled() {
                    break;
                }
            }
            info!("background worker stopped: kind={:?}", kind);
        });
    }
}

impl Default for BackgroundMgr {
    fn default() -> Self {
        Self::new()
    }
}

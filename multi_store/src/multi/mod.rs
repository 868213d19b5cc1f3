//! The redundant object store.
//!
//! An object is split into `need` data chunks plus `total - need` parity
//! chunks, each written to a different chunk store picked from the finder.
//! The metadata database records where every chunk went; the scrubbers and
//! the rebalancer keep that record and the stores in agreement.

mod read;
mod rebalance;
mod scrub;
mod write;

pub use scrub::ScrubStats;

use crate::background::{
    BackgroundMgr, BackgroundRunStats, BackgroundTaskExecutor, BackgroundTaskKind,
    BackgroundTaskPolicy,
};
use crate::config::*;
use crate::finder::{Finder, FinderEntry};
use crate::meta_task::run_meta;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slime_lib::{
    parity_matrix, slice_range, CasTo, GetOptions, Precondition, RangeReader, SlimeError,
    SlimeResult, Stat, Store,
};
use slime_meta::MetaDb;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Base weight every store gets in placement, on top of its free bytes.
const STORE_BASE_WEIGHT: f64 = 10_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redundancy {
    pub need: usize,
    pub total: usize,
}

impl Redundancy {
    pub fn validate(&self) -> SlimeResult<()> {
        parity_matrix(self.need, self.total).map(|_| ())
    }
}

pub struct Multi {
    uuid: Uuid,
    db: Arc<MetaDb>,
    finder: Arc<Finder>,
    config: MultiConfig,
    redundancy: RwLock<Redundancy>,
    deleter: TaskTracker,
    workers: TaskTracker,
    cancel: CancellationToken,
    background: Arc<Mutex<BackgroundMgr>>,
    scrub_stats: Mutex<ScrubStats>,
}

impl Multi {
    /// Open the multi store kept in `db`, creating its identity and default
    /// redundancy on first use.
    pub fn new(db: Arc<MetaDb>, finder: Arc<Finder>, config: MultiConfig) -> SlimeResult<Arc<Self>> {
        let defaults = Redundancy {
            need: config.default_need,
            total: config.default_total,
        };
        defaults.validate()?;

        let (uuid, redundancy) = db.run(|tx| {
            let uuid = match tx.get_config_string(CONFIG_UUID)? {
                Some(s) => Uuid::parse_str(&s)
                    .map_err(|e| SlimeError::BadFormat(format!("multi uuid {:?}: {}", s, e)))?,
                None => {
                    let uuid = slime_lib::new_uuid();
                    tx.set_config(CONFIG_UUID, uuid.to_string().as_bytes())?;
                    uuid
                }
            };
            let redundancy = match load_redundancy(tx)? {
                Some(r) => r,
                None => {
                    store_redundancy(tx, &defaults)?;
                    defaults
                }
            };
            Ok((uuid, redundancy))
        })?;
        redundancy.validate()?;
        info!(
            "Multi: opened {} with need={} total={}",
            uuid, redundancy.need, redundancy.total
        );

        Ok(Arc::new(Self {
            uuid,
            db,
            finder,
            config,
            redundancy: RwLock::new(redundancy),
            deleter: TaskTracker::new(),
            workers: TaskTracker::new(),
            cancel: CancellationToken::new(),
            background: Arc::new(Mutex::new(BackgroundMgr::new())),
            scrub_stats: Mutex::new(ScrubStats::default()),
        }))
    }

    pub fn db(&self) -> &Arc<MetaDb> {
        &self.db
    }

    pub fn finder(&self) -> &Arc<Finder> {
        &self.finder
    }

    pub fn config(&self) -> &MultiConfig {
        &self.config
    }

    /// Spawn one worker per background loop.
    pub fn start(self: &Arc<Self>) {
        let policies = [
            (BackgroundTaskKind::ScrubFiles, self.config.scrub_files_interval),
            (BackgroundTaskKind::ScrubLocations, self.config.scrub_locations_interval),
            (BackgroundTaskKind::ScrubWal, self.config.scrub_wal_interval),
            (BackgroundTaskKind::Rebalance, self.config.rebalance_interval),
            (BackgroundTaskKind::ReloadConfig, self.config.config_reload_interval),
            (BackgroundTaskKind::FinderScan, self.config.scan_interval),
            (BackgroundTaskKind::FinderTest, self.config.test_interval_between),
        ];
        if let Ok(mut mgr) = self.background.lock() {
            for (kind, interval) in policies.iter() {
                mgr.set_policy(*kind, BackgroundTaskPolicy::new(*interval, self.config.jitter));
            }
        }
        let executor: Arc<dyn BackgroundTaskExecutor + Send + Sync> = self.clone();
        for (kind, _) in policies {
            BackgroundMgr::spawn_worker(
                self.background.clone(),
                kind,
                executor.clone(),
                self.cancel.child_token(),
                &self.workers,
            );
        }
        info!("Multi: background loops started");
    }

    /// Stop every background loop and wait for pending chunk deletions.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.workers.close();
        self.workers.wait().await;
        self.wait_pending().await;
        info!("Multi: stopped");
    }

    /// Wait until every asynchronous chunk deletion queued so far is done.
    pub async fn wait_pending(&self) {
        self.deleter.close();
        self.deleter.wait().await;
        self.deleter.reopen();
    }

    pub fn redundancy(&self) -> Redundancy {
        self.redundancy
            .read()
            .map(|r| *r)
            .unwrap_or(Redundancy {
                need: self.config.default_need,
                total: self.config.default_total,
            })
    }

    /// Persist a new shape for future writes; existing files are moved onto
    /// it by the file scrubber.
    pub fn set_redundancy(&self, need: usize, total: usize) -> SlimeResult<()> {
        let r = Redundancy { need, total };
        r.validate()?;
        self.db.run(|tx| store_redundancy(tx, &r))?;
        self.apply_redundancy(r)?;
        info!("Multi: redundancy set to need={} total={}", need, total);
        Ok(())
    }

    /// Pick up a redundancy change written by another process.
    pub async fn reload_config(&self) -> SlimeResult<()> {
        let Some(r) = run_meta(&self.db, |tx| load_redundancy(tx)).await? else {
            return Ok(());
        };
        if let Err(e) = r.validate() {
            warn!("Multi: ignoring stored redundancy {:?}: {}", r, e);
            return Ok(());
        }
        if r != self.redundancy() {
            info!("Multi: reloaded redundancy need={} total={}", r.need, r.total);
            self.apply_redundancy(r)?;
        }
        Ok(())
    }

    pub fn scrub_stats(&self) -> ScrubStats {
        self.scrub_stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn background_stats(&self) -> HashMap<BackgroundTaskKind, BackgroundRunStats> {
        self.background
            .lock()
            .map(|m| m.all_stats())
            .unwrap_or_default()
    }

    fn apply_redundancy(&self, r: Redundancy) -> SlimeResult<()> {
        let mut cur = self
            .redundancy
            .write()
            .map_err(|_| SlimeError::Internal("redundancy lock poisoned".to_string()))?;
        *cur = r;
        Ok(())
    }

    fn update_scrub_stats<F: FnOnce(&mut ScrubStats)>(&self, f: F) {
        if let Ok(mut stats) = self.scrub_stats.lock() {
            f(&mut stats);
        }
    }

    /// Live, non-dead stores usable for new chunks.
    fn alive_stores(&self) -> Vec<FinderEntry> {
        self.finder
            .stores()
            .into_values()
            .filter(|e| e.is_alive())
            .collect()
    }

    pub(crate) async fn load_file(&self, path: &str) -> SlimeResult<Option<slime_meta::File>> {
        let path = path.to_string();
        run_meta(&self.db, move |tx| tx.get_file(&path)).await
    }

    pub async fn stat_file(&self, path: &str) -> SlimeResult<Stat> {
        self.load_file(path)
            .await?
            .map(|f| f.stat())
            .ok_or_else(|| SlimeError::NotFound(path.to_string()))
    }

    pub async fn list_paths(&self, after: &str, limit: usize) -> SlimeResult<Vec<String>> {
        let limit = i64::try_from(limit)
            .map_err(|_| SlimeError::BadArgument(format!("limit {} too large", limit)))?;
        let after = after.to_string();
        Ok(run_meta(&self.db, move |tx| tx.list_files(&after, limit))
            .await?
            .into_iter()
            .map(|f| f.path)
            .collect())
    }

    /// Usable bytes across the `total` roomiest live stores, discounted by
    /// the parity overhead.
    pub fn estimate_free_space(&self) -> i64 {
        let Redundancy { need, total } = self.redundancy();
        let mut frees: Vec<i64> = self.alive_stores().iter().map(|e| e.free.max(0)).collect();
        if frees.len() < total || total == 0 {
            return 0;
        }
        frees.sort_unstable();
        let top = &frees[frees.len() - total..];
        let mut usable: i128 = 0;
        let mut prev: i128 = 0;
        for (i, f) in top.iter().enumerate() {
            let f = *f as i128;
            usable += (f - prev) * (total - i) as i128 * need as i128 / total as i128;
            prev = f;
        }
        usable.min(i64::MAX as i128) as i64
    }
}

fn load_redundancy(tx: &slime_meta::MetaTx<'_>) -> SlimeResult<Option<Redundancy>> {
    let parse = |name: &str| -> SlimeResult<Option<usize>> {
        match tx.get_config_string(name)? {
            Some(s) => s
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|e| SlimeError::BadFormat(format!("config {} = {:?}: {}", name, s, e))),
            None => Ok(None),
        }
    };
    match (parse(CONFIG_NEED)?, parse(CONFIG_TOTAL)?) {
        (Some(need), Some(total)) => Ok(Some(Redundancy { need, total })),
        _ => Ok(None),
    }
}

fn store_redundancy(tx: &slime_meta::MetaTx<'_>, r: &Redundancy) -> SlimeResult<()> {
    tx.set_config(CONFIG_NEED, r.need.to_string().as_bytes())?;
    tx.set_config(CONFIG_TOTAL, r.total.to_string().as_bytes())
}

fn check_precondition(
    path: &str,
    from: &Precondition,
    current: Option<&slime_meta::File>,
) -> SlimeResult<()> {
    if from.matches(current.map(|f| &f.sha256)) {
        return Ok(());
    }
    let have = current
        .map(|f| hex::encode(f.sha256))
        .unwrap_or_else(|| "missing".to_string());
    Err(SlimeError::CasFailure(format!(
        "{}: expected {}, have {}",
        path, from, have
    )))
}

#[async_trait]
impl Store for Multi {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> String {
        format!("multi-{}", self.uuid)
    }

    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        self.get_file(key, opts, cancel).await
    }

    async fn stat(&self, key: &str, _cancel: &CancellationToken) -> SlimeResult<Stat> {
        self.stat_file(key).await
    }

    async fn cas(
        &self,
        key: &str,
        from: Precondition,
        to: CasTo,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        self.cas_file(key, from, to, cancel).await
    }

    async fn list(
        &self,
        after: &str,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> SlimeResult<Vec<String>> {
        self.list_paths(after, limit).await
    }

    async fn free_space(&self, _cancel: &CancellationToken) -> SlimeResult<i64> {
        Ok(self.estimate_free_space())
    }

    async fn close(&self) {
        self.stop().await
    }

    fn as_range_reader(&self) -> Option<&dyn RangeReader> {
        Some(self)
    }
}

#[async_trait]
impl RangeReader for Multi {
    async fn get_partial(
        &self,
        key: &str,
        start: u64,
        length: i64,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        let (data, stat) = self.get_file(key, GetOptions::default(), cancel).await?;
        Ok((slice_range(&data, start, length)?, stat))
    }
}

#[async_trait]
impl BackgroundTaskExecutor for Multi {
    async fn execute(&self, kind: BackgroundTaskKind, cancel: &CancellationToken) -> SlimeResult<()> {
        match kind {
            BackgroundTaskKind::ScrubFiles => self.scrub_files_once(cancel).await.map(|_| ()),
            BackgroundTaskKind::ScrubLocations => {
                self.scrub_locations_once(cancel).await.map(|_| ())
            }
            BackgroundTaskKind::ScrubWal => self.scrub_wal_once().await.map(|_| ()),
            BackgroundTaskKind::Rebalance => self.rebalance_once(cancel).await.map(|_| ()),
            BackgroundTaskKind::ReloadConfig => self.reload_config().await,
            BackgroundTaskKind::FinderScan => self.finder.scan_all(cancel).await,
            BackgroundTaskKind::FinderTest => self.finder.test_all(cancel).await,
        }
    }
}

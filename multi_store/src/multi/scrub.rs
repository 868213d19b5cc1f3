use super::{Multi, Redundancy};
use crate::config::{scrub_location_pos_key, CONFIG_SCRUB_LOCATION_POS, CONFIG_SCRUB_POS};
use crate::finder::FinderEntry;
use crate::meta_task::{run_meta, wal_clear_old};
use serde::Serialize;
use slime_lib::{
    unix_timestamp, CasTo, GetOptions, Precondition, SlimeError, SlimeResult, StoreRef,
};
use slime_meta::{parse_local_key, File, Location};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Counters reported by the scrubbers.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ScrubStats {
    pub file_pages: u64,
    pub files_checked: u64,
    pub file_rebuilds: u64,
    pub file_passes: u64,
    pub location_pages: u64,
    pub chunks_checked: u64,
    pub chunks_deleted: u64,
    pub chunk_rebuilds: u64,
    pub location_passes: u64,
    pub wal_cleared: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

impl Multi {
    /// Re-write `path` with its own content so it lands on live stores under
    /// the current redundancy.
    pub async fn rebuild(&self, path: &str, cancel: &CancellationToken) -> SlimeResult<()> {
        let (data, stat) = match self.get_file(path, GetOptions::default(), cancel).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        match self
            .cas_file(path, Precondition::Sha256(stat.sha256), CasTo::Data(data), cancel)
            .await
        {
            Ok(()) => {
                info!("scrub: rebuilt {}", path);
                Ok(())
            }
            Err(e) if e.is_not_found() || e.is_cas_failure() => {
                debug!("scrub: {} changed while rebuilding, leaving it: {}", path, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One page of the file scrubber. Returns true once the pass wraps.
    pub async fn scrub_files_once(&self, cancel: &CancellationToken) -> SlimeResult<bool> {
        let page = self.config.scrub_files_page as i64;
        let files = run_meta(&self.db, move |tx| {
            let pos = tx.get_config_string(CONFIG_SCRUB_POS)?.unwrap_or_default();
            tx.list_files(&pos, page)
        })
        .await?;
        if files.is_empty() {
            run_meta(&self.db, |tx| tx.set_config(CONFIG_SCRUB_POS, b"")).await?;
            self.update_scrub_stats(|s| s.file_passes += 1);
            return Ok(true);
        }

        let live = self.finder.stores();
        let dead: HashSet<Uuid> = run_meta(&self.db, |tx| tx.all_locations())
            .await?
            .into_iter()
            .filter(|l| l.dead)
            .map(|l| l.uuid)
            .collect();
        let redundancy = self.redundancy();

        for file in files.iter() {
            if cancel.is_cancelled() {
                return Err(SlimeError::Cancelled);
            }
            self.update_scrub_stats(|s| s.files_checked += 1);
            let Some(reason) = needs_rebuild(file, &live, &dead, redundancy) else {
                continue;
            };
            info!("scrub: {} needs a rebuild: {}", file.path, reason);
            match self.rebuild(&file.path, cancel).await {
                Ok(()) => self.update_scrub_stats(|s| s.file_rebuilds += 1),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => self.note_scrub_error(&format!("rebuild of {}", file.path), &e),
            }
        }

        if let Some(last) = files.last() {
            let pos = last.path.clone();
            run_meta(&self.db, move |tx| tx.set_config(CONFIG_SCRUB_POS, pos.as_bytes())).await?;
        }
        self.update_scrub_stats(|s| s.file_pages += 1);
        Ok(false)
    }

    /// One page of the location scrubber. Returns true once every location
    /// has been visited.
    pub async fn scrub_locations_once(&self, cancel: &CancellationToken) -> SlimeResult<bool> {
        let mut locations = run_meta(&self.db, |tx| tx.all_locations()).await?;
        locations.sort_by_key(|l| l.uuid);
        let pos = run_meta(&self.db, |tx| tx.get_config_string(CONFIG_SCRUB_LOCATION_POS))
            .await?
            .and_then(|s| Uuid::parse_str(&s).ok());

        let Some(location) = locations
            .iter()
            .find(|l| pos.map(|p| l.uuid >= p).unwrap_or(true))
            .or_else(|| locations.first())
            .cloned()
        else {
            self.update_scrub_stats(|s| s.location_passes += 1);
            return Ok(true);
        };

        let finished = self.scrub_location_page(&location, cancel).await?;
        self.update_scrub_stats(|s| s.location_pages += 1);
        if !finished {
            let id = location.uuid.to_string();
            run_meta(&self.db, move |tx| {
                tx.set_config(CONFIG_SCRUB_LOCATION_POS, id.as_bytes())
            })
            .await?;
            return Ok(false);
        }
        match locations.iter().find(|l| l.uuid > location.uuid) {
            Some(next) => {
                let id = next.uuid.to_string();
                run_meta(&self.db, move |tx| {
                    tx.set_config(CONFIG_SCRUB_LOCATION_POS, id.as_bytes())
                })
                .await?;
                Ok(false)
            }
            None => {
                run_meta(&self.db, |tx| tx.set_config(CONFIG_SCRUB_LOCATION_POS, b"")).await?;
                self.update_scrub_stats(|s| s.location_passes += 1);
                Ok(true)
            }
        }
    }

    /// Compare one page of expected chunk names with what the store holds.
    /// Returns true when the location has been covered to its end.
    async fn scrub_location_page(
        &self,
        location: &Location,
        cancel: &CancellationToken,
    ) -> SlimeResult<bool> {
        let pos_key = scrub_location_pos_key(&location.uuid);
        let page = self.config.scrub_locations_page;
        let (uuid, key) = (location.uuid, pos_key.clone());
        let (after, expected) = run_meta(&self.db, move |tx| {
            let after = tx.get_config_string(&key)?.unwrap_or_default();
            let expected = tx.get_location_contents(&uuid, &after, page as i64)?;
            Ok((after, expected))
        })
        .await?;

        let store = self.finder.store_for(&location.uuid);
        let actual = match &store {
            Some(store) => store.list(&after, page, cancel).await?,
            None if location.dead => Vec::new(),
            None => {
                debug!("scrub: location {} not connected, skipping", location.uuid);
                return Ok(true);
            }
        };

        // Only names up to the shorter full page can be compared.
        let bound = [&expected, &actual]
            .iter()
            .filter(|names| names.len() >= page)
            .filter_map(|names| names.last())
            .min()
            .cloned();
        let in_bound = |name: &String| bound.as_ref().map(|b| name <= b).unwrap_or(true);

        let expected_set: HashSet<&String> = expected.iter().filter(|n| in_bound(n)).collect();
        let actual_set: HashSet<&String> = actual.iter().filter(|n| in_bound(n)).collect();
        self.update_scrub_stats(|s| s.chunks_checked += expected_set.len() as u64);

        let mut to_rebuild = BTreeSet::new();
        if let Some(store) = &store {
            for name in actual_set.iter().filter(|n| !expected_set.contains(*n)) {
                if cancel.is_cancelled() {
                    return Err(SlimeError::Cancelled);
                }
                self.check_extraneous(location, store, name, cancel).await?;
            }
            for name in expected_set.iter().filter(|n| !actual_set.contains(*n)) {
                if let Some(path) = self.owner_if_unprotected(name).await? {
                    info!("scrub: {} missing from {}", name, location.uuid);
                    to_rebuild.insert(path);
                }
            }
        }
        if location.dead {
            for name in expected_set.iter() {
                if let Some(path) = self.owner_if_unprotected(name).await? {
                    to_rebuild.insert(path);
                }
            }
        }

        for path in to_rebuild.iter() {
            match self.rebuild(path, cancel).await {
                Ok(()) => self.update_scrub_stats(|s| s.chunk_rebuilds += 1),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => self.note_scrub_error(&format!("rebuild of {}", path), &e),
            }
        }

        match bound {
            Some(b) => {
                run_meta(&self.db, move |tx| tx.set_config(&pos_key, b.as_bytes())).await?;
                Ok(false)
            }
            None => {
                run_meta(&self.db, move |tx| tx.set_config(&pos_key, b"")).await?;
                Ok(true)
            }
        }
    }

    /// Delete `name` from `store` unless a write in flight or a file still
    /// claims it.
    async fn check_extraneous(
        &self,
        location: &Location,
        store: &StoreRef,
        name: &str,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        if let Ok((prefix_id, _)) = parse_local_key(name) {
            let (uuid, name) = (location.uuid, name.to_string());
            let keep = run_meta(&self.db, move |tx| {
                Ok(tx.wal_check(&prefix_id)? || tx.location_should_have(&uuid, &name)?)
            })
            .await?;
            if keep {
                return Ok(());
            }
        }
        info!("scrub: deleting stray chunk {} from {}", name, location.uuid);
        match store.cas(name, Precondition::Any, CasTo::Missing, cancel).await {
            Ok(()) => self.update_scrub_stats(|s| s.chunks_deleted += 1),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if e.is_not_found() => {}
            Err(e) => self.note_scrub_error(&format!("delete of {}", name), &e),
        }
        Ok(())
    }

    /// The path owning chunk `name`, unless its write is still in flight.
    async fn owner_if_unprotected(&self, name: &str) -> SlimeResult<Option<String>> {
        let Ok((prefix_id, _)) = parse_local_key(name) else {
            return Ok(None);
        };
        run_meta(&self.db, move |tx| {
            if tx.wal_check(&prefix_id)? {
                return Ok(None);
            }
            tx.path_for_prefix_id(&prefix_id)
        })
        .await
    }

    /// Expire stale WAL marks.
    pub async fn scrub_wal_once(&self) -> SlimeResult<usize> {
        let cleared = wal_clear_old(&self.db, unix_timestamp(), self.config.wal).await?;
        self.update_scrub_stats(|s| s.wal_cleared += cleared as u64);
        Ok(cleared)
    }

    /// Run one complete file pass and one complete location pass.
    pub async fn scrub_all(&self, cancel: &CancellationToken) -> SlimeResult<()> {
        let fresh = run_meta(&self.db, |tx| tx.get_config_string(CONFIG_SCRUB_POS))
            .await?
            .unwrap_or_default()
            .is_empty();
        let mut wraps = if fresh { 1 } else { 2 };
        while wraps > 0 {
            if self.scrub_files_once(cancel).await? {
                wraps -= 1;
            }
        }

        let fresh = run_meta(&self.db, |tx| tx.get_config_string(CONFIG_SCRUB_LOCATION_POS))
            .await?
            .unwrap_or_default()
            .is_empty();
        let mut wraps = if fresh { 1 } else { 2 };
        while wraps > 0 {
            if self.scrub_locations_once(cancel).await? {
                wraps -= 1;
            }
        }
        Ok(())
    }

    fn note_scrub_error(&self, what: &str, e: &SlimeError) {
        warn!("scrub: {} failed: {}", what, e);
        self.update_scrub_stats(|s| {
            s.errors += 1;
            s.last_error = Some(format!("{}: {}", what, e));
        });
    }
}

/// Why `file` should be rewritten, if it should.
fn needs_rebuild(
    file: &File,
    live: &HashMap<Uuid, FinderEntry>,
    dead: &HashSet<Uuid>,
    redundancy: Redundancy,
) -> Option<String> {
    if file.data_chunks as usize != redundancy.need || file.locations.len() != redundancy.total {
        return Some(format!(
            "shape {}/{} differs from {}/{}",
            file.data_chunks,
            file.locations.len(),
            redundancy.need,
            redundancy.total
        ));
    }
    for loc in file.locations.iter() {
        if dead.contains(loc) {
            return Some(format!("location {} is dead", loc));
        }
        match live.get(loc) {
            None => return Some(format!("location {} is not connected", loc)),
            Some(entry) if entry.dead => return Some(format!("location {} is dead", loc)),
            Some(_) => {}
        }
    }
    None
}

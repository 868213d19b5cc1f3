use super::Multi;
use crate::config::CONFIG_REBALANCE_POS;
use crate::meta_task::run_meta;
use slime_lib::{CasTo, GetOptions, Precondition, SlimeError, SlimeResult, StoreRef};
use slime_meta::File;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

impl Multi {
    /// One rebalance tick. Returns the number of chunks moved.
    pub async fn rebalance_once(&self, cancel: &CancellationToken) -> SlimeResult<usize> {
        let mut free: HashMap<Uuid, i64> = HashMap::new();
        let mut stores: HashMap<Uuid, StoreRef> = HashMap::new();
        for entry in self.alive_stores() {
            free.insert(entry.uuid(), entry.free);
            stores.insert(entry.uuid(), entry.store);
        }
        let (Some(max), Some(min)) = (free.values().max(), free.values().min()) else {
            return Ok(0);
        };
        let min_diff = self.config.rebalance_min_difference;
        if max - min < min_diff {
            return Ok(0);
        }

        let max_files = self.config.rebalance_max_files as i64;
        let files = run_meta(&self.db, move |tx| {
            let pos = tx.get_config_string(CONFIG_REBALANCE_POS)?.unwrap_or_default();
            tx.list_files(&pos, max_files)
        })
        .await?;
        if files.is_empty() {
            run_meta(&self.db, |tx| tx.set_config(CONFIG_REBALANCE_POS, b"")).await?;
            return Ok(0);
        }

        let mut moves = 0;
        let mut last_path = None;
        for file in files.iter() {
            if moves >= self.config.rebalance_max_moves {
                break;
            }
            if cancel.is_cancelled() {
                return Err(SlimeError::Cancelled);
            }
            last_path = Some(file.path.clone());

            let source = file
                .locations
                .iter()
                .enumerate()
                .filter_map(|(i, loc)| free.get(loc).map(|f| (i, *loc, *f)))
                .min_by_key(|(_, _, f)| *f);
            let dest = free
                .iter()
                .filter(|(uuid, _)| !file.locations.contains(uuid))
                .max_by_key(|(_, f)| **f)
                .map(|(uuid, f)| (*uuid, *f));
            let (Some((index, src_uuid, src_free)), Some((dst_uuid, dst_free))) = (source, dest)
            else {
                continue;
            };
            if dst_free - src_free <= min_diff {
                continue;
            }
            let (Some(src), Some(dst)) = (stores.get(&src_uuid), stores.get(&dst_uuid)) else {
                continue;
            };

            match self.move_chunk(file, index, src, dst, cancel).await {
                Ok(len) => {
                    info!(
                        "rebalance: moved chunk {} of {} from {} to {}",
                        index, file.path, src_uuid, dst_uuid
                    );
                    moves += 1;
                    if let Some(f) = free.get_mut(&src_uuid) {
                        *f += len as i64;
                    }
                    if let Some(f) = free.get_mut(&dst_uuid) {
                        *f -= len as i64;
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("rebalance: moving chunk {} of {} failed: {}", index, file.path, e),
            }
        }

        if let Some(path) = last_path {
            run_meta(&self.db, move |tx| tx.set_config(CONFIG_REBALANCE_POS, path.as_bytes()))
                .await?;
        }
        Ok(moves)
    }

    /// Copy chunk `index` of `file` from `src` to `dst` and repoint the
    /// record. Returns the chunk size.
    async fn move_chunk(
        &self,
        file: &File,
        index: usize,
        src: &StoreRef,
        dst: &StoreRef,
        cancel: &CancellationToken,
    ) -> SlimeResult<u64> {
        let key = file.local_key(index);
        let prefix_id = file.prefix_id;
        run_meta(&self.db, move |tx| tx.wal_mark(&prefix_id)).await?;
        let result = self.copy_and_repoint(file, index, &key, src, dst, cancel).await;
        if let Err(e) = run_meta(&self.db, move |tx| tx.wal_clear(&prefix_id)).await {
            warn!("rebalance: clearing wal for {} failed: {}", file.path, e);
        }
        result
    }

    async fn copy_and_repoint(
        &self,
        file: &File,
        index: usize,
        key: &str,
        src: &StoreRef,
        dst: &StoreRef,
        cancel: &CancellationToken,
    ) -> SlimeResult<u64> {
        let (data, _) = src.get(key, GetOptions::default(), cancel).await?;
        let len = data.len() as u64;
        dst.cas(key, Precondition::Missing, CasTo::Data(data), cancel)
            .await?;

        let dst_uuid = dst.uuid();
        let seen = file.clone();
        let committed = run_meta(&self.db, move |tx| {
            let current = tx.get_file(&seen.path)?;
            match current {
                Some(mut cur) if cur.prefix_id == seen.prefix_id && cur.locations == seen.locations => {
                    cur.locations[index] = dst_uuid;
                    tx.set_file(&cur)
                }
                _ => Err(SlimeError::ModifiedDuringBalance(seen.path.clone())),
            }
        })
        .await;
        let cleanup = CancellationToken::new();
        if let Err(e) = committed {
            if let Err(err) = dst.cas(key, Precondition::Any, CasTo::Missing, &cleanup).await {
                warn!("rebalance: removing copy of {} from {} failed: {}", key, dst.name(), err);
            }
            return Err(e);
        }
        if let Err(e) = src.cas(key, Precondition::Any, CasTo::Missing, &cleanup).await {
            warn!("rebalance: removing {} from {} failed: {}", key, src.name(), e);
        }
        Ok(len)
    }
}

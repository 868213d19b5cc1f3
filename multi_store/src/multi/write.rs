use super::{check_precondition, Multi, Redundancy, STORE_BASE_WEIGHT};
use crate::finder::{Finder, FinderEntry};
use crate::meta_task::run_meta;
use futures::future::join_all;
use rand::Rng;
use slime_lib::{
    map_from_gf, map_to_gf, parity_matrix, sha256_bytes, unix_timestamp, CasTo, Precondition,
    SlimeError, SlimeResult, StoreRef,
};
use slime_meta::{new_prefix_id, File, PrefixId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Words per chunk for an object of `size` bytes split `need` ways.
pub(crate) fn chunk_width(size: u64, need: usize) -> usize {
    let words = size.div_ceil(4) as usize;
    words.div_ceil(need.max(1))
}

/// Weighted random order without replacement; roomier stores tend to come
/// first.
pub(crate) fn weighted_order(mut entries: Vec<FinderEntry>) -> Vec<FinderEntry> {
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(entries.len());
    while !entries.is_empty() {
        let weights: Vec<f64> = entries
            .iter()
            .map(|e| STORE_BASE_WEIGHT + e.free.max(0) as f64)
            .collect();
        let sum: f64 = weights.iter().sum();
        let mut r = rng.gen_range(0.0..sum);
        let mut pick = entries.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if r < *w {
                pick = i;
                break;
            }
            r -= w;
        }
        out.push(entries.swap_remove(pick));
    }
    out
}

/// Best-effort removal of every chunk of `file`, one request per location.
pub(crate) async fn delete_file_chunks(finder: Arc<Finder>, file: File) {
    let cancel = CancellationToken::new();
    let deletes = file.locations.iter().enumerate().map(|(i, loc)| {
        let key = file.local_key(i);
        let store = finder.store_for(loc);
        let cancel = &cancel;
        async move {
            let Some(store) = store else {
                debug!("Multi: no live store {} to delete {}", loc, key);
                return;
            };
            match store.cas(&key, Precondition::Any, CasTo::Missing, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Multi: deleting {} from {} failed: {}", key, store.name(), e),
            }
        }
    });
    join_all(deletes).await;
}

impl Multi {
    /// Compare-and-swap the object at `path`.
    pub async fn cas_file(
        &self,
        path: &str,
        from: Precondition,
        to: CasTo,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        let data = match to {
            CasTo::Data(data) => data,
            CasTo::Missing => return self.delete_path(path, from).await,
        };

        let prefix_id = new_prefix_id();
        let (p, f) = (path.to_string(), from);
        run_meta(&self.db, move |tx| {
            let current = tx.get_file(&p)?;
            check_precondition(&p, &f, current.as_ref())?;
            tx.wal_mark(&prefix_id)
        })
        .await?;

        let file = match self.write_chunks(path, &data, prefix_id, cancel).await {
            Ok(file) => file,
            Err(e) => {
                self.clear_wal(&prefix_id).await;
                return Err(e);
            }
        };

        let (p, new_file) = (path.to_string(), file.clone());
        let committed = run_meta(&self.db, move |tx| {
            let current = tx.get_file(&p)?;
            check_precondition(&p, &from, current.as_ref())?;
            tx.set_file(&new_file)?;
            tx.wal_clear(&prefix_id)?;
            Ok(current)
        })
        .await;

        match committed {
            Ok(old) => {
                debug!(
                    "Multi: wrote {} ({} bytes) as {}",
                    path,
                    file.size,
                    hex::encode(prefix_id)
                );
                if let Some(old) = old {
                    self.deleter
                        .spawn(delete_file_chunks(self.finder.clone(), old));
                }
                Ok(())
            }
            Err(e) => {
                debug!("Multi: commit of {} failed, removing new chunks: {}", path, e);
                delete_file_chunks(self.finder.clone(), file).await;
                self.clear_wal(&prefix_id).await;
                Err(e)
            }
        }
    }

    async fn delete_path(&self, path: &str, from: Precondition) -> SlimeResult<()> {
        let p = path.to_string();
        let old = run_meta(&self.db, move |tx| {
            let current = tx.get_file(&p)?;
            check_precondition(&p, &from, current.as_ref())?;
            if current.is_some() {
                tx.delete_file(&p)?;
            }
            Ok(current)
        })
        .await?;
        if let Some(old) = old {
            debug!("Multi: deleted {}", path);
            self.deleter
                .spawn(delete_file_chunks(self.finder.clone(), old));
        }
        Ok(())
    }

    async fn clear_wal(&self, prefix_id: &PrefixId) {
        let id = *prefix_id;
        if let Err(e) = run_meta(&self.db, move |tx| tx.wal_clear(&id)).await {
            warn!("Multi: clearing wal for {} failed: {}", hex::encode(prefix_id), e);
        }
    }

    /// Encode `data` and place every chunk on a distinct store. The returned
    /// record is not yet installed.
    pub(crate) async fn write_chunks(
        &self,
        path: &str,
        data: &[u8],
        prefix_id: PrefixId,
        cancel: &CancellationToken,
    ) -> SlimeResult<File> {
        let Redundancy { need, total } = self.redundancy();
        let matrix = parity_matrix(need, total)?;

        let candidates = weighted_order(self.alive_stores());
        if candidates.len() < total {
            return Err(SlimeError::InsufficientStores(format!(
                "{} live stores for {} chunks",
                candidates.len(),
                total
            )));
        }

        let width = chunk_width(data.len() as u64, need);
        let mut padded = data.to_vec();
        padded.resize(width * need * 4, 0);
        let (mapping_value, words) = map_to_gf(&padded);
        let data_vecs: Vec<Vec<u32>> = (0..need)
            .map(|i| words[i * width..(i + 1) * width].to_vec())
            .collect();

        let mut chunks: Vec<Vec<u8>> = data_vecs
            .iter()
            .map(|v| map_from_gf(mapping_value, v))
            .collect();
        let mut scratch = Vec::with_capacity(width);
        for index in need..total {
            matrix.create_parity(&data_vecs, index, &mut scratch)?;
            chunks.push(map_from_gf(mapping_value, &scratch));
        }

        let mut file = File {
            path: path.to_string(),
            size: data.len() as u64,
            sha256: sha256_bytes(data),
            write_time: unix_timestamp(),
            prefix_id,
            data_chunks: need as u16,
            mapping_value,
            locations: Vec::with_capacity(total),
        };

        let queue: Mutex<VecDeque<StoreRef>> =
            Mutex::new(candidates.into_iter().map(|e| e.store).collect());
        let writes = chunks.into_iter().enumerate().map(|(index, bytes)| {
            let key = file.local_key(index);
            let queue = &queue;
            async move {
                loop {
                    if cancel.is_cancelled() {
                        return Err(SlimeError::Cancelled);
                    }
                    let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                    let Some(store) = next else {
                        return Err(SlimeError::InsufficientStores(format!(
                            "no store left for chunk {}",
                            key
                        )));
                    };
                    match store
                        .cas(&key, Precondition::Any, CasTo::Data(bytes.clone()), cancel)
                        .await
                    {
                        Ok(()) => return Ok(store),
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => warn!("Multi: writing {} to {} failed: {}", key, store.name(), e),
                    }
                }
            }
        });
        let results = join_all(writes).await;

        let mut written = Vec::with_capacity(total);
        let mut first_err = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(store) => written.push((index, store)),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            let cleanup = CancellationToken::new();
            let deletes = written.iter().map(|(index, store)| {
                let key = file.local_key(*index);
                let cleanup = &cleanup;
                async move {
                    if let Err(err) = store.cas(&key, Precondition::Any, CasTo::Missing, cleanup).await {
                        warn!("Multi: cleanup of {} on {} failed: {}", key, store.name(), err);
                    }
                }
            });
            join_all(deletes).await;
            return Err(e);
        }
        file.locations = written.into_iter().map(|(_, store)| store.uuid()).collect();
        Ok(file)
    }
}

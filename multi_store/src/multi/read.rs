use super::write::chunk_width;
use super::Multi;
use slime_lib::{
    map_from_gf, parity_matrix, sha256_bytes, words_from_stored, GetOptions, SlimeError,
    SlimeResult, Stat, StoreRef,
};
use slime_meta::File;
use std::ops::Range;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type ChunkRead = (usize, Option<Vec<u8>>);

/// Fetch one chunk. Never fails: anything short of the expected bytes is
/// reported as absent.
async fn read_chunk(
    index: usize,
    store: Option<StoreRef>,
    key: String,
    expected_len: usize,
    opts: GetOptions,
    cancel: CancellationToken,
) -> ChunkRead {
    let Some(store) = store else {
        debug!("Multi: no live store for chunk {}", key);
        return (index, None);
    };
    match store.get(&key, opts, &cancel).await {
        Ok((data, _)) if data.len() == expected_len => (index, Some(data)),
        Ok((data, _)) => {
            warn!(
                "Multi: chunk {} on {} has {} bytes, expected {}",
                key,
                store.name(),
                data.len(),
                expected_len
            );
            (index, None)
        }
        Err(SlimeError::Cancelled) => (index, None),
        Err(e) => {
            warn!("Multi: reading chunk {} from {} failed: {}", key, store.name(), e);
            (index, None)
        }
    }
}

impl Multi {
    /// Read and reassemble the object at `path`.
    pub async fn get_file(
        &self,
        path: &str,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        let mut file = self
            .load_file(path)
            .await?
            .ok_or_else(|| SlimeError::NotFound(path.to_string()))?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.read_file(&file, opts, cancel).await {
                Ok(data) => return Ok((data, file.stat())),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };
            match self.load_file(path).await? {
                None => return Err(SlimeError::NotFound(path.to_string())),
                Some(current) if current.prefix_id != file.prefix_id => {
                    if attempts >= self.config.get_attempts {
                        return Err(SlimeError::TooManyRetries(format!(
                            "{} kept changing while being read: {}",
                            path, err
                        )));
                    }
                    debug!("Multi: {} was rewritten during a read, retrying", path);
                    file = current;
                }
                Some(_) => return Err(err),
            }
        }
    }

    /// Fan out chunk reads for one version of a file. Data chunks go first;
    /// parity is asked for once the data-only timer expires or a data read
    /// comes back empty.
    pub(crate) async fn read_file(
        &self,
        file: &File,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<Vec<u8>> {
        let need = file.data_chunks as usize;
        let total = file.locations.len();
        let chunk_len = chunk_width(file.size, need) * 4;

        let child = cancel.child_token();
        let _stop_stragglers = child.clone().drop_guard();
        let mut reads: JoinSet<ChunkRead> = JoinSet::new();
        let spawn_reads = |reads: &mut JoinSet<ChunkRead>, range: Range<usize>| {
            for index in range {
                reads.spawn(read_chunk(
                    index,
                    self.finder.store_for(&file.locations[index]),
                    file.local_key(index),
                    chunk_len,
                    opts,
                    child.clone(),
                ));
            }
        };

        spawn_reads(&mut reads, 0..need);
        let mut parity_started = need == total;
        let timer = tokio::time::sleep(self.config.read_data_timeout);
        tokio::pin!(timer);

        let mut chunks: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut have = 0;
        while have < need {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SlimeError::Cancelled),
                _ = &mut timer, if !parity_started => {
                    debug!("Multi: data chunks of {} slow, asking parity", file.path);
                    parity_started = true;
                    spawn_reads(&mut reads, need..total);
                }
                joined = reads.join_next() => match joined {
                    Some(Ok((index, Some(data)))) => {
                        chunks[index] = Some(data);
                        have += 1;
                    }
                    Some(Ok((_, None))) | Some(Err(_)) => {
                        if !parity_started {
                            parity_started = true;
                            spawn_reads(&mut reads, need..total);
                        }
                    }
                    None => {
                        if parity_started {
                            break;
                        }
                        parity_started = true;
                        spawn_reads(&mut reads, need..total);
                    }
                },
            }
        }
        drop(reads);

        if have < need {
            return Err(SlimeError::InsufficientChunks(format!(
                "{}: {} of {} chunks readable",
                file.path, have, need
            )));
        }

        let fast = file.mapping_value == 0 && chunks[..need].iter().all(Option::is_some);
        let mut data = if fast {
            chunks
                .into_iter()
                .take(need)
                .flatten()
                .flatten()
                .collect::<Vec<u8>>()
        } else {
            let mut surviving = Vec::with_capacity(need);
            let mut indices = Vec::with_capacity(need);
            for (index, chunk) in chunks.iter().enumerate() {
                if let Some(bytes) = chunk {
                    surviving.push(words_from_stored(file.mapping_value, bytes));
                    indices.push(index);
                    if surviving.len() == need {
                        break;
                    }
                }
            }
            let matrix = parity_matrix(need, total)?;
            matrix
                .recover_data(&surviving, &indices)?
                .iter()
                .flat_map(|v| map_from_gf(file.mapping_value, v))
                .collect()
        };

        data.truncate(file.size as usize);
        if !opts.no_verify && sha256_bytes(&data) != file.sha256 {
            return Err(SlimeError::BadHash(format!(
                "{}: reassembled content does not match",
                file.path
            )));
        }
        Ok(data)
    }
}

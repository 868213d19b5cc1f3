use crate::kv_db::{KvDb, KvTx};
use crate::records::*;
use crate::tuple::{key_after, prefix_range, TupleItem};
use slime_lib::{unix_timestamp, SlimeError, SlimeResult};
use std::time::Duration;
use uuid::Uuid;

const WAL_PAGE: usize = 100;
const REINDEX_PAGE: usize = 500;

/// Age limits for write-ahead marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalPolicy {
    /// Marks older than this are expired.
    pub expire_age: Duration,
    /// Marks older than this are considered corrupt and left alone.
    pub unsafe_old_age: Duration,
    /// Marks further in the future than this are considered corrupt.
    pub unsafe_future_age: Duration,
}

impl Default for WalPolicy {
    fn default() -> Self {
        Self {
            expire_age: Duration::from_secs(7 * 24 * 3600),
            unsafe_old_age: Duration::from_secs(90 * 24 * 3600),
            unsafe_future_age: Duration::from_secs(60),
        }
    }
}

/// Transactional metadata store shared by the multi store, the finder, the
/// scrubbers and the rebalancer.
pub struct MetaDb {
    kv: KvDb,
}

impl MetaDb {
    pub fn open(db_path: &str) -> SlimeResult<Self> {
        Ok(Self {
            kv: KvDb::open(db_path)?,
        })
    }

    pub fn open_in_memory() -> SlimeResult<Self> {
        Ok(Self {
            kv: KvDb::open_in_memory()?,
        })
    }

    pub fn db_path(&self) -> &str {
        &self.kv.db_path
    }

    /// Run `f` in one transaction; see [`KvDb::run`].
    pub fn run<T, F>(&self, mut f: F) -> SlimeResult<T>
    where
        F: FnMut(&MetaTx<'_>) -> SlimeResult<T>,
    {
        self.kv.run(|kv| f(&MetaTx { kv: *kv }))
    }

    /// Expire old WAL marks, one page per transaction. Returns the number of
    /// marks removed.
    pub fn wal_clear_old(&self, now: i64, policy: &WalPolicy) -> SlimeResult<usize> {
        let (low, high) = prefix_range(&wal_tag_prefix());
        let expire_before = now - policy.expire_age.as_secs() as i64;
        let unsafe_before = now - policy.unsafe_old_age.as_secs() as i64;
        let unsafe_after = now + policy.unsafe_future_age.as_secs() as i64;

        let mut cursor = low;
        let mut removed = 0;
        loop {
            let (page_removed, next) = self.kv.run(|kv| {
                let pairs = kv.range(&cursor, &high, WAL_PAGE)?;
                let mut page_removed = 0;
                for (key, value) in pairs.iter() {
                    let mut stamps = match decode_wal(value) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("MetaDb: skipping undecodable wal entry: {}", e);
                            continue;
                        }
                    };
                    let oldest = match stamps.iter().copied().min() {
                        Some(t) => t,
                        None => {
                            kv.delete(key)?;
                            continue;
                        }
                    };
                    if oldest >= expire_before {
                        continue;
                    }
                    if oldest < unsafe_before || oldest > unsafe_after {
                        warn!(
                            "MetaDb: wal entry with implausible timestamp {} (now {}), leaving it",
                            oldest, now
                        );
                        continue;
                    }
                    if let Some(pos) = stamps.iter().position(|t| *t == oldest) {
                        stamps.remove(pos);
                    }
                    if stamps.is_empty() {
                        kv.delete(key)?;
                    } else {
                        kv.set(key, &encode_wal(&stamps))?;
                    }
                    page_removed += 1;
                }
                let next = pairs.last().map(|(k, _)| key_after(k));
                Ok((page_removed, next))
            })?;
            removed += page_removed;
            match next {
                Some(k) => cursor = k,
                None => break,
            }
        }
        if removed > 0 {
            info!("MetaDb: expired {} wal marks", removed);
        }
        Ok(removed)
    }

    /// Rebuild every secondary index pair from the primary file records.
    ///
    /// Pairs implied by the files are written first and stale pairs are
    /// pruned afterwards, so the indices are complete at every page boundary
    /// and readers never see a live chunk as unowned.
    pub fn reindex(&self) -> SlimeResult<usize> {
        self.reindex_paged(REINDEX_PAGE, || Ok(()))
    }

    pub(crate) fn reindex_paged<B>(&self, page: usize, mut between_pages: B) -> SlimeResult<usize>
    where
        B: FnMut() -> SlimeResult<()>,
    {
        let (low, high) = file_range();
        let mut cursor = low;
        let mut count = 0;
        loop {
            let (n, next) = self.kv.run(|kv| {
                let pairs = kv.range(&cursor, &high, page)?;
                for (key, value) in pairs.iter() {
                    let file = decode_file(key, value)?;
                    for (k, v) in file_index_pairs(&file) {
                        kv.set(&k, &v)?;
                    }
                }
                Ok((pairs.len(), pairs.last().map(|(k, _)| key_after(k))))
            })?;
            count += n;
            between_pages()?;
            match next {
                Some(k) => cursor = k,
                None => break,
            }
        }

        let mut pruned = 0;
        for (low, high) in [file_location_range(), prefix_index_range(), location_list_range()] {
            let mut cursor = low;
            loop {
                let (n, next) = self.run(|tx| {
                    let pairs = tx.kv.range(&cursor, &high, page)?;
                    let mut n = 0;
                    for (key, value) in pairs.iter() {
                        if !tx.index_pair_is_live(key, value)? {
                            tx.kv.delete(key)?;
                            n += 1;
                        }
                    }
                    Ok((n, pairs.last().map(|(k, _)| key_after(k))))
                })?;
                pruned += n;
                between_pages()?;
                match next {
                    Some(k) => cursor = k,
                    None => break,
                }
            }
        }
        info!("MetaDb: reindexed {} files, pruned {} stale index pairs", count, pruned);
        Ok(count)
    }
}

/// Typed view of one KV transaction.
#[derive(Clone, Copy)]
pub struct MetaTx<'a> {
    kv: KvTx<'a>,
}

impl<'a> MetaTx<'a> {
    /// The file at `path`, or `None`.
    pub fn get_file(&self, path: &str) -> SlimeResult<Option<File>> {
        let key = file_key(path);
        match self.kv.get(&key)? {
            Some(v) => decode_file(&key, &v).map(Some),
            None => Ok(None),
        }
    }

    /// Install `file`, replacing any record at the same path along with the
    /// index pairs it implied.
    pub fn set_file(&self, file: &File) -> SlimeResult<()> {
        if let Some(old) = self.get_file(&file.path)? {
            for (k, _) in file_index_pairs(&old) {
                self.kv.delete(&k)?;
            }
        }
        let (k, v) = encode_file(file);
        self.kv.set(&k, &v)?;
        for (k, v) in file_index_pairs(file) {
            self.kv.set(&k, &v)?;
        }
        Ok(())
    }

    pub fn delete_file(&self, path: &str) -> SlimeResult<()> {
        if let Some(old) = self.get_file(path)? {
            for (k, _) in file_index_pairs(&old) {
                self.kv.delete(&k)?;
            }
            self.kv.delete(&file_key(path))?;
        }
        Ok(())
    }

    /// Files with path strictly after `after`, in path order.
    pub fn list_files(&self, after: &str, limit: i64) -> SlimeResult<Vec<File>> {
        let limit = check_limit(limit)?;
        let (low, high) = file_range();
        let start = if after.is_empty() {
            low
        } else {
            key_after(&file_key(after))
        };
        self.kv
            .range(&start, &high, limit)?
            .iter()
            .map(|(k, v)| decode_file(k, v))
            .collect()
    }

    /// Files with at least one chunk on `location`, after path `after`.
    pub fn get_files_by_location(
        &self,
        location: &Uuid,
        after: &str,
        limit: i64,
    ) -> SlimeResult<Vec<File>> {
        let limit = check_limit(limit)?;
        let prefix = file_location_prefix(location);
        let (low, high) = prefix_range(&prefix);
        let start = if after.is_empty() {
            low
        } else {
            let mut k = prefix.clone();
            k.extend(crate::tuple::pack(&[TupleItem::bytes(after.as_bytes())]));
            key_after(&k)
        };
        let mut files = Vec::new();
        for (k, _) in self.kv.range(&start, &high, limit)? {
            let path_bytes = last_element(&k)?.as_bytes()?.to_vec();
            let path = String::from_utf8(path_bytes)
                .map_err(|e| SlimeError::BadFormat(format!("file path not utf8: {}", e)))?;
            match self.get_file(&path)? {
                Some(f) => files.push(f),
                None => warn!("MetaTx: dangling location index for {}", path),
            }
        }
        Ok(files)
    }

    /// Chunk names expected on `location`, after `after`.
    pub fn get_location_contents(
        &self,
        location: &Uuid,
        after: &str,
        limit: i64,
    ) -> SlimeResult<Vec<String>> {
        let limit = check_limit(limit)?;
        let (low, high) = prefix_range(&location_list_prefix(location));
        let start = if after.is_empty() {
            low
        } else {
            key_after(&location_list_key(location, after))
        };
        self.kv
            .range(&start, &high, limit)?
            .iter()
            .map(|(k, _)| last_element(k).and_then(|i| i.as_str().map(str::to_string)))
            .collect()
    }

    pub fn all_locations(&self) -> SlimeResult<Vec<Location>> {
        let (low, high) = prefix_range(&location_tag_prefix());
        self.kv
            .range(&low, &high, 0)?
            .iter()
            .map(|(k, v)| decode_location(k, v))
            .collect()
    }

    pub fn get_location(&self, uuid: &Uuid) -> SlimeResult<Option<Location>> {
        let key = location_key(uuid);
        match self.kv.get(&key)? {
            Some(v) => decode_location(&key, &v).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_location(&self, loc: &Location) -> SlimeResult<()> {
        let (k, v) = encode_location(loc);
        self.kv.set(&k, &v)
    }

    /// Forget a location. Refused while any file still places a chunk there.
    pub fn delete_location(&self, uuid: &Uuid) -> SlimeResult<()> {
        if !self.get_files_by_location(uuid, "", 1)?.is_empty() {
            return Err(SlimeError::BadArgument(format!(
                "location {} still holds chunks",
                uuid
            )));
        }
        let (low, high) = prefix_range(&location_list_prefix(uuid));
        self.kv.clear_range(&low, &high)?;
        self.kv.delete(&location_key(uuid))
    }

    pub fn path_for_prefix_id(&self, prefix_id: &PrefixId) -> SlimeResult<Option<String>> {
        match self.kv.get(&prefix_key(prefix_id))? {
            Some(v) => String::from_utf8(v)
                .map(Some)
                .map_err(|e| SlimeError::BadFormat(format!("file path not utf8: {}", e))),
            None => Ok(None),
        }
    }

    /// Whether `location` should hold chunk `key` according to the file
    /// that owns it.
    pub fn location_should_have(&self, location: &Uuid, key: &str) -> SlimeResult<bool> {
        let (prefix_id, _) = match parse_local_key(key) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        let path = match self.path_for_prefix_id(&prefix_id)? {
            Some(p) => p,
            None => return Ok(false),
        };
        Ok(self
            .get_file(&path)?
            .map(|f| f.prefix_id == prefix_id && f.should_have(location, key))
            .unwrap_or(false))
    }

    /// Whether an index pair is still implied by the file records.
    fn index_pair_is_live(&self, key: &[u8], value: &[u8]) -> SlimeResult<bool> {
        if let Ok((location, path)) = parse_file_location_key(key) {
            return Ok(self
                .get_file(&path)?
                .map(|f| f.locations.contains(&location))
                .unwrap_or(false));
        }
        if let Ok((location, local)) = parse_location_list_key(key) {
            return self.location_should_have(&location, &local);
        }
        if let Ok(TupleItem::Bytes(prefix_id)) = last_element(key) {
            let path = match std::str::from_utf8(value) {
                Ok(p) => p,
                Err(_) => return Ok(false),
            };
            return Ok(self
                .get_file(path)?
                .map(|f| f.prefix_id[..] == prefix_id[..])
                .unwrap_or(false));
        }
        warn!("MetaDb: dropping undecodable index key {:?}", key);
        Ok(false)
    }

    /// Record one more holder of `prefix_id`.
    pub fn wal_mark(&self, prefix_id: &PrefixId) -> SlimeResult<()> {
        let key = wal_key(prefix_id);
        let mut stamps = match self.kv.get(&key)? {
            Some(v) => decode_wal(&v)?,
            None => Vec::new(),
        };
        stamps.push(unix_timestamp());
        self.kv.set(&key, &encode_wal(&stamps))
    }

    /// Drop the newest mark on `prefix_id`. A hung writer therefore keeps
    /// the oldest mark alive until it expires.
    pub fn wal_clear(&self, prefix_id: &PrefixId) -> SlimeResult<()> {
        let key = wal_key(prefix_id);
        let mut stamps = match self.kv.get(&key)? {
            Some(v) => decode_wal(&v)?,
            None => {
                warn!("MetaTx: wal_clear on unmarked prefix {}", hex::encode(prefix_id));
                return Ok(());
            }
        };
        if let Some((pos, _)) = stamps.iter().enumerate().max_by_key(|(_, t)| **t) {
            stamps.remove(pos);
        }
        if stamps.is_empty() {
            self.kv.delete(&key)
        } else {
            self.kv.set(&key, &encode_wal(&stamps))
        }
    }

    pub fn wal_check(&self, prefix_id: &PrefixId) -> SlimeResult<bool> {
        if self.kv.get(&wal_key(prefix_id))?.is_some() {
            return Ok(true);
        }
        Ok(self.kv.get(&wal_legacy_key(prefix_id))?.is_some())
    }

    pub fn get_config(&self, name: &str) -> SlimeResult<Option<Vec<u8>>> {
        self.kv.get(&config_key(name))
    }

    pub fn set_config(&self, name: &str, value: &[u8]) -> SlimeResult<()> {
        self.kv.set(&config_key(name), value)
    }

    pub fn get_config_string(&self, name: &str) -> SlimeResult<Option<String>> {
        match self.get_config(name)? {
            Some(v) => String::from_utf8(v)
                .map(Some)
                .map_err(|e| SlimeError::BadFormat(format!("config {} not utf8: {}", name, e))),
            None => Ok(None),
        }
    }
}

fn check_limit(limit: i64) -> SlimeResult<usize> {
    usize::try_from(limit).map_err(|_| SlimeError::BadArgument(format!("negative limit {}", limit)))
}

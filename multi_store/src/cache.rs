//! Read cache in front of one chunk store.
//!
//! Concurrent reads of a key share a single upstream fetch. Finished values
//! stay in memory under an LRU byte budget and are revalidated with a `stat`
//! before being served again. Errors are never kept.

use async_trait::async_trait;
use slime_lib::{
    Availability, CasTo, GetOptions, Precondition, SlimeError, SlimeResult, Stat, Store, StoreRef,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bookkeeping cost charged per entry on top of its payload.
pub const CACHE_ENTRY_OVERHEAD: u64 = 256;

type FetchResult = SlimeResult<(Arc<Vec<u8>>, Stat)>;
type FetchSignal = watch::Receiver<Option<FetchResult>>;

enum EntryState {
    Pending(FetchSignal),
    Ready(Arc<Vec<u8>>, Stat),
}

struct CacheEntry {
    id: u64,
    verified: bool,
    state: EntryState,
    waiters: usize,
    last_used: u64,
    fetch_cancel: CancellationToken,
}

impl CacheEntry {
    fn cost(&self) -> u64 {
        match &self.state {
            EntryState::Ready(data, _) => data.len() as u64 + CACHE_ENTRY_OVERHEAD,
            EntryState::Pending(_) => 0,
        }
    }
}

/// A fetch whose entry was dropped from the map while callers still wait on
/// it. The last of them to give up cancels it.
struct DetachedFetch {
    waiters: usize,
    fetch_cancel: CancellationToken,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    detached: HashMap<u64, DetachedFetch>,
    used: u64,
    clock: u64,
    next_id: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str, id: Option<u64>) -> Option<CacheEntry> {
        let matches = match (self.entries.get(key), id) {
            (Some(e), Some(id)) => e.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }
        let entry = self.entries.remove(key)?;
        self.used = self.used.saturating_sub(entry.cost());
        if let EntryState::Pending(_) = entry.state {
            if entry.waiters > 0 {
                self.detached.insert(
                    entry.id,
                    DetachedFetch {
                        waiters: entry.waiters,
                        fetch_cancel: entry.fetch_cancel.clone(),
                    },
                );
            } else {
                entry.fetch_cancel.cancel();
            }
        }
        Some(entry)
    }

    fn release_detached(&mut self, id: u64, cancelled: bool) {
        let Some(fetch) = self.detached.get_mut(&id) else {
            return;
        };
        fetch.waiters = fetch.waiters.saturating_sub(1);
        if fetch.waiters == 0 {
            if cancelled {
                fetch.fetch_cancel.cancel();
            }
            self.detached.remove(&id);
        }
    }

    fn evict(&mut self, max_size: u64) {
        while self.used > max_size {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| matches!(e.state, EntryState::Ready(..)))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    self.remove(&k, None);
                }
                None => break,
            }
        }
    }
}

enum Lookup {
    Hit(u64, Arc<Vec<u8>>, Stat),
    Wait(u64, FetchSignal),
}

pub struct CacheStore {
    inner: StoreRef,
    max_size: u64,
    state: Arc<Mutex<CacheState>>,
}

impl CacheStore {
    pub fn new(inner: StoreRef, max_size: u64) -> Self {
        Self {
            inner,
            max_size,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Bytes currently charged against the budget.
    pub fn used(&self) -> u64 {
        self.state.lock().map(|s| s.used).unwrap_or_default()
    }

    pub fn cached_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> SlimeResult<std::sync::MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| SlimeError::Internal("cache state poisoned".to_string()))
    }

    fn lookup(&self, key: &str, opts: GetOptions) -> SlimeResult<Lookup> {
        let mut state = self.lock()?;
        let now = state.tick();

        if let Some(entry) = state.entries.get(key) {
            if !opts.no_verify && !entry.verified {
                // The pending fetch, if any, keeps serving its own waiters.
                state.remove(key, None);
            }
        }

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used = now;
            return Ok(match &entry.state {
                EntryState::Ready(data, stat) => Lookup::Hit(entry.id, data.clone(), stat.clone()),
                EntryState::Pending(rx) => {
                    entry.waiters += 1;
                    Lookup::Wait(entry.id, rx.clone())
                }
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        let (tx, rx) = watch::channel(None);
        let fetch_cancel = CancellationToken::new();
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                id,
                verified: !opts.no_verify,
                state: EntryState::Pending(rx.clone()),
                waiters: 1,
                last_used: now,
                fetch_cancel: fetch_cancel.clone(),
            },
        );
        drop(state);

        let inner = self.inner.clone();
        let shared = self.state.clone();
        let max_size = self.max_size;
        let key = key.to_string();
        tokio::spawn(async move {
            let result = inner
                .get(&key, opts, &fetch_cancel)
                .await
                .map(|(data, stat)| (Arc::new(data), stat));
            if let Ok(mut state) = shared.lock() {
                let still_ours = state.entries.get(&key).map(|e| e.id == id).unwrap_or(false);
                if still_ours {
                    match &result {
                        Ok((data, stat)) => {
                            if let Some(entry) = state.entries.get_mut(&key) {
                                entry.state = EntryState::Ready(data.clone(), stat.clone());
                            }
                            state.used += data.len() as u64 + CACHE_ENTRY_OVERHEAD;
                            state.evict(max_size);
                        }
                        Err(_) => {
                            state.remove(&key, Some(id));
                        }
                    }
                }
                state.detached.remove(&id);
            }
            let _ = tx.send(Some(result));
        });

        Ok(Lookup::Wait(id, rx))
    }

    fn release_waiter(&self, key: &str, id: u64, cancelled: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(entry) = state.entries.get_mut(key).filter(|e| e.id == id) else {
            state.release_detached(id, cancelled);
            return;
        };
        entry.waiters = entry.waiters.saturating_sub(1);
        if cancelled && entry.waiters == 0 && matches!(entry.state, EntryState::Pending(_)) {
            entry.fetch_cancel.cancel();
            state.remove(key, Some(id));
        }
    }

    async fn wait(
        &self,
        key: &str,
        id: u64,
        mut rx: FetchSignal,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            r = rx.wait_for(|v| v.is_some()) => Some(match r {
                Ok(v) => v.clone().unwrap_or_else(|| Err(SlimeError::Internal("cache fetch vanished".to_string()))),
                Err(_) => Err(SlimeError::Internal("cache fetch dropped".to_string())),
            }),
        };
        match outcome {
            None => {
                self.release_waiter(key, id, true);
                Err(SlimeError::Cancelled)
            }
            Some(result) => {
                self.release_waiter(key, id, false);
                result.map(|(data, stat)| ((*data).clone(), stat))
            }
        }
    }
}

#[async_trait]
impl Store for CacheStore {
    fn uuid(&self) -> Uuid {
        self.inner.uuid()
    }

    fn name(&self) -> String {
        self.inner.name()
    }

    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        loop {
            if cancel.is_cancelled() {
                return Err(SlimeError::Cancelled);
            }
            match self.lookup(key, opts)? {
                Lookup::Wait(id, rx) => return self.wait(key, id, rx, cancel).await,
                Lookup::Hit(id, data, stat) => match self.inner.stat(key, cancel).await {
                    Ok(current) if current.same_content(&stat) => {
                        return Ok(((*data).clone(), stat));
                    }
                    Ok(_) | Err(SlimeError::NotFound(_)) => {
                        debug!("CacheStore: stale entry for {} on {}", key, self.inner.name());
                        self.lock()?.remove(key, Some(id));
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> SlimeResult<Stat> {
        self.inner.stat(key, cancel).await
    }

    async fn cas(
        &self,
        key: &str,
        from: Precondition,
        to: CasTo,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        self.inner.cas(key, from, to, cancel).await?;
        if let Ok(mut state) = self.state.lock() {
            state.remove(key, None);
        }
        Ok(())
    }

    async fn list(
        &self,
        after: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> SlimeResult<Vec<String>> {
        self.inner.list(after, limit, cancel).await
    }

    async fn free_space(&self, cancel: &CancellationToken) -> SlimeResult<i64> {
        self.inner.free_space(cancel).await
    }

    async fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            for entry in state.entries.values() {
                entry.fetch_cancel.cancel();
            }
            for fetch in state.detached.values() {
                fetch.fetch_cancel.cancel();
            }
            state.entries.clear();
            state.detached.clear();
            state.used = 0;
        }
        self.inner.close().await
    }

    fn as_availability(&self) -> Option<&dyn Availability> {
        self.inner.as_availability()
    }
}

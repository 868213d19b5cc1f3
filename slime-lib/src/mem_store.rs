//! In-memory chunk store.
//!
//! Holds every key in a `BTreeMap` and implements the full CAS contract of a
//! real chunk store. Beyond that it can be taken offline (every call fails),
//! blocked (reads park until released or cancelled), and it counts reads,
//! stats and cancelled reads, which makes it the workhorse of the multi store
//! and cache tests.

use crate::{
    sha256_bytes, slice_range, unix_timestamp, Availability, CasTo, GetOptions, Precondition,
    RangeReader, SlimeError, SlimeResult, Stat, Store,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_CAPACITY: i64 = 1 << 40;

struct MemEntry {
    data: Vec<u8>,
    stat: Stat,
}

pub struct MemStore {
    uuid: Uuid,
    name: String,
    items: Mutex<BTreeMap<String, MemEntry>>,
    capacity: Mutex<i64>,
    offline: AtomicBool,
    gate: watch::Sender<bool>,
    gets: AtomicUsize,
    stats: AtomicUsize,
    cancelled: AtomicUsize,
}

impl MemStore {
    pub fn new(name: &str) -> Self {
        Self::with_uuid(crate::new_uuid(), name)
    }

    pub fn with_uuid(uuid: Uuid, name: &str) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            uuid,
            name: name.to_string(),
            items: Mutex::new(BTreeMap::new()),
            capacity: Mutex::new(DEFAULT_CAPACITY),
            offline: AtomicBool::new(false),
            gate,
            gets: AtomicUsize::new(0),
            stats: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    /// Free space is `capacity - bytes stored`.
    pub fn set_capacity(&self, capacity: i64) {
        if let Ok(mut c) = self.capacity.lock() {
            *c = capacity;
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While blocked, `get` and `get_partial` wait until [`MemStore::unblock`]
    /// or until their cancellation token fires.
    pub fn block(&self) {
        self.gate.send_replace(true);
    }

    pub fn unblock(&self) {
        self.gate.send_replace(false);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn stat_count(&self) -> usize {
        self.stats.load(Ordering::SeqCst)
    }

    /// Reads that were cancelled while parked on the gate.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.items
            .lock()
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items
            .lock()
            .map(|items| items.contains_key(key))
            .unwrap_or(false)
    }

    /// Remove a key behind the store API's back, as an operator would.
    pub fn remove_raw(&self, key: &str) -> bool {
        self.items
            .lock()
            .map(|mut items| items.remove(key).is_some())
            .unwrap_or(false)
    }

    fn check_online(&self) -> SlimeResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SlimeError::IoError(format!("store {} is offline", self.name)));
        }
        Ok(())
    }

    async fn wait_gate(&self, cancel: &CancellationToken) -> SlimeResult<()> {
        let mut rx = self.gate.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(SlimeError::Cancelled)
            }
            r = rx.wait_for(|blocked| !*blocked) => r
                .map(|_| ())
                .map_err(|_| SlimeError::Internal("mem store gate closed".to_string())),
        }
    }

    fn lookup(&self, key: &str) -> SlimeResult<(Vec<u8>, Stat)> {
        let items = self.lock_items()?;
        items
            .get(key)
            .map(|e| (e.data.clone(), e.stat.clone()))
            .ok_or_else(|| SlimeError::NotFound(format!("{} in {}", key, self.name)))
    }

    fn lock_items(&self) -> SlimeResult<std::sync::MutexGuard<'_, BTreeMap<String, MemEntry>>> {
        self.items
            .lock()
            .map_err(|_| SlimeError::Internal("mem store poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemStore {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get(
        &self,
        key: &str,
        _opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.wait_gate(cancel).await?;
        self.check_online()?;
        self.lookup(key)
    }

    async fn stat(&self, key: &str, _cancel: &CancellationToken) -> SlimeResult<Stat> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.lookup(key).map(|(_, stat)| stat)
    }

    async fn cas(
        &self,
        key: &str,
        from: Precondition,
        to: CasTo,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        if cancel.is_cancelled() {
            return Err(SlimeError::Cancelled);
        }
        self.check_online()?;
        let mut items = self.lock_items()?;
        let current = items.get(key).map(|e| e.stat.sha256);
        if !from.matches(current.as_ref()) {
            return Err(SlimeError::CasFailure(format!(
                "{} in {}: expected {}",
                key, self.name, from
            )));
        }
        match to {
            CasTo::Missing => {
                items.remove(key);
            }
            CasTo::Data(data) => {
                let stat = Stat {
                    sha256: sha256_bytes(&data),
                    size: data.len() as u64,
                    write_time: unix_timestamp(),
                };
                items.insert(key.to_string(), MemEntry { data, stat });
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        after: &str,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> SlimeResult<Vec<String>> {
        self.check_online()?;
        let items = self.lock_items()?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(items
            .range::<str, _>((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn free_space(&self, _cancel: &CancellationToken) -> SlimeResult<i64> {
        self.check_online()?;
        let used: u64 = self.lock_items()?.values().map(|e| e.stat.size).sum();
        let capacity = *self
            .capacity
            .lock()
            .map_err(|_| SlimeError::Internal("mem store poisoned".to_string()))?;
        Ok(capacity - used as i64)
    }

    fn as_range_reader(&self) -> Option<&dyn RangeReader> {
        Some(self)
    }

    fn as_availability(&self) -> Option<&dyn Availability> {
        Some(self)
    }
}

#[async_trait]
impl RangeReader for MemStore {
    async fn get_partial(
        &self,
        key: &str,
        start: u64,
        length: i64,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.wait_gate(cancel).await?;
        self.check_online()?;
        let (data, stat) = self.lookup(key)?;
        Ok((slice_range(&data, start, length)?, stat))
    }
}

impl Availability for MemStore {
    fn available(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

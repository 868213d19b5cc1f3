use crate::cache::CacheStore;
use crate::config::{jittered, MultiConfig};
use crate::meta_task::run_meta;
use async_trait::async_trait;
use serde::Serialize;
use slime_lib::{
    list_store_uuids, new_http_client, unix_timestamp, ChunkStoreClient, RetryStore, SlimeError,
    SlimeResult, Store, StoreRef,
};
use slime_meta::{Location, MetaDb};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One live chunk store as seen by the finder.
#[derive(Clone)]
pub struct FinderEntry {
    pub store: StoreRef,
    pub url: String,
    pub free: i64,
    pub last_check: i64,
    pub dead: bool,
}

impl FinderEntry {
    pub fn uuid(&self) -> Uuid {
        self.store.uuid()
    }

    /// Not tombstoned, and not reporting itself unavailable.
    pub fn is_alive(&self) -> bool {
        !self.dead
            && self
                .store
                .as_availability()
                .map(|a| a.available())
                .unwrap_or(true)
    }
}

/// How the finder reaches the stores behind a URL.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn list_uuids(&self, url: &str, cancel: &CancellationToken) -> SlimeResult<Vec<Uuid>>;

    async fn connect(
        &self,
        url: &str,
        uuid: &Uuid,
        cancel: &CancellationToken,
    ) -> SlimeResult<StoreRef>;
}

/// Attempts per read-only request to a remote chunk store.
const REMOTE_READ_ATTEMPTS: u32 = 3;

/// Connector for chunk-server routers speaking the chunk HTTP protocol.
/// Clients are wrapped in a [`RetryStore`], then in a [`CacheStore`] when a
/// cache size is set.
pub struct HttpConnector {
    client: reqwest::Client,
    cache_size: u64,
}

impl HttpConnector {
    pub fn new(cache_size: u64) -> SlimeResult<Self> {
        Ok(Self {
            client: new_http_client()?,
            cache_size,
        })
    }
}

#[async_trait]
impl StoreConnector for HttpConnector {
    async fn list_uuids(&self, url: &str, cancel: &CancellationToken) -> SlimeResult<Vec<Uuid>> {
        list_store_uuids(&self.client, url, cancel).await
    }

    async fn connect(
        &self,
        url: &str,
        uuid: &Uuid,
        cancel: &CancellationToken,
    ) -> SlimeResult<StoreRef> {
        let store_url = format!("{}/{}/", url.trim_end_matches('/'), uuid);
        let client = ChunkStoreClient::connect(&store_url, cancel).await?;
        if client.uuid() != *uuid {
            return Err(SlimeError::BadFormat(format!(
                "{} answers as {} instead of {}",
                store_url,
                client.uuid(),
                uuid
            )));
        }
        let client: StoreRef = Arc::new(RetryStore::new(Arc::new(client), REMOTE_READ_ATTEMPTS));
        if self.cache_size > 0 {
            return Ok(Arc::new(CacheStore::new(client, self.cache_size)));
        }
        Ok(client)
    }
}

/// Admin view of one location.
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub uuid: Uuid,
    pub url: String,
    pub name: String,
    pub dead: bool,
    pub connected: bool,
    pub last_seen: i64,
    pub free: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Finder {
    db: Arc<MetaDb>,
    connector: Arc<dyn StoreConnector>,
    config: MultiConfig,
    entries: RwLock<HashMap<Uuid, FinderEntry>>,
    seed_urls: RwLock<BTreeSet<String>>,
    errors: RwLock<HashMap<Uuid, String>>,
}

impl Finder {
    pub fn new(db: Arc<MetaDb>, connector: Arc<dyn StoreConnector>, config: MultiConfig) -> Self {
        Self {
            db,
            connector,
            config,
            entries: RwLock::new(HashMap::new()),
            seed_urls: RwLock::new(BTreeSet::new()),
            errors: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of every live entry.
    pub fn stores(&self) -> HashMap<Uuid, FinderEntry> {
        self.entries
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn store_for(&self, uuid: &Uuid) -> Option<StoreRef> {
        self.entries
            .read()
            .ok()
            .and_then(|m| m.get(uuid).map(|e| e.store.clone()))
    }

    /// Remember `url` so that every later scan visits it even before it has
    /// produced a location.
    pub fn add_url(&self, url: &str) {
        if let Ok(mut urls) = self.seed_urls.write() {
            urls.insert(url.to_string());
        }
    }

    /// Discover the stores behind `url`. Returns how many answered.
    pub async fn scan(&self, url: &str, cancel: &CancellationToken) -> SlimeResult<usize> {
        let uuids = self.connector.list_uuids(url, cancel).await?;
        let mut seen = 0;
        for uuid in uuids {
            if cancel.is_cancelled() {
                return Err(SlimeError::Cancelled);
            }
            let store = match self.store_for(&uuid) {
                Some(store) => store,
                None => match self.connector.connect(url, &uuid, cancel).await {
                    Ok(store) => {
                        if let Err(e) = self.admit(url, store.clone(), cancel).await {
                            warn!("Finder: store {} at {} failed its first probe: {}", uuid, url, e);
                            self.note_error(&uuid, &e);
                            store.close().await;
                            continue;
                        }
                        info!("Finder: found store {} ({}) at {}", store.name(), uuid, url);
                        store
                    }
                    Err(e) => {
                        warn!("Finder: connect to {} at {} failed: {}", uuid, url, e);
                        self.note_error(&uuid, &e);
                        continue;
                    }
                },
            };
            self.touch_location(&uuid, url, &store.name()).await?;
            seen += 1;
        }
        Ok(seen)
    }

    /// Scan every known URL once.
    pub async fn scan_all(&self, cancel: &CancellationToken) -> SlimeResult<()> {
        let mut urls: BTreeSet<String> = run_meta(&self.db, |tx| tx.all_locations())
            .await?
            .into_iter()
            .map(|l| l.url)
            .collect();
        if let Ok(seeds) = self.seed_urls.read() {
            urls.extend(seeds.iter().cloned());
        }
        for url in urls.iter().filter(|u| !u.is_empty()) {
            match self.scan(url, cancel).await {
                Ok(n) => debug!("Finder: {} stores behind {}", n, url),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Finder: scan of {} failed: {}", url, e),
            }
        }
        Ok(())
    }

    /// Probe every entry's free space, dropping the ones that fail.
    pub async fn test_all(&self, cancel: &CancellationToken) -> SlimeResult<()> {
        let snapshot: Vec<(Uuid, StoreRef)> = self
            .stores()
            .into_iter()
            .map(|(uuid, e)| (uuid, e.store))
            .collect();

        for (n, (uuid, store)) in snapshot.into_iter().enumerate() {
            if n > 0 {
                let pause = jittered(self.config.test_interval_between, self.config.jitter);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SlimeError::Cancelled),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
            match store.free_space(cancel).await {
                Ok(free) => {
                    // A metadata hiccup keeps the last known tombstone.
                    let dead = match self.location_dead(&uuid).await {
                        Ok(dead) => Some(dead),
                        Err(e) => {
                            warn!("Finder: reading location {} failed: {}", uuid, e);
                            None
                        }
                    };
                    if let Ok(mut entries) = self.entries.write() {
                        if let Some(entry) = entries.get_mut(&uuid) {
                            entry.free = free;
                            entry.last_check = unix_timestamp();
                            if let Some(dead) = dead {
                                entry.dead = dead;
                            }
                        }
                    }
                    if let Ok(mut errors) = self.errors.write() {
                        errors.remove(&uuid);
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("Finder: store {} failed its probe, dropping it: {}", uuid, e);
                    self.note_error(&uuid, &e);
                    if let Some(dropped) = self.remove_store(&uuid) {
                        dropped.close().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Admit a store that was built outside the connector.
    pub async fn add_store(
        &self,
        url: &str,
        store: StoreRef,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        let uuid = store.uuid();
        let name = store.name();
        self.admit(url, store, cancel).await?;
        self.touch_location(&uuid, url, &name).await
    }

    /// Drop an entry without closing it.
    pub fn remove_store(&self, uuid: &Uuid) -> Option<StoreRef> {
        self.entries
            .write()
            .ok()
            .and_then(|mut m| m.remove(uuid))
            .map(|e| e.store)
    }

    pub fn set_dead(&self, uuid: &Uuid, dead: bool) -> SlimeResult<()> {
        self.db.run(|tx| {
            let mut loc = tx
                .get_location(uuid)?
                .ok_or_else(|| SlimeError::NotFound(format!("location {}", uuid)))?;
            loc.dead = dead;
            tx.set_location(&loc)
        })?;
        if let Ok(mut entries) = self.entries.write() {
            if let Some(entry) = entries.get_mut(uuid) {
                entry.dead = dead;
            }
        }
        info!("Finder: location {} marked {}", uuid, if dead { "dead" } else { "alive" });
        Ok(())
    }

    /// Forget a location entirely. Refused while files still use it.
    pub async fn delete_location(&self, uuid: &Uuid) -> SlimeResult<()> {
        let id = *uuid;
        run_meta(&self.db, move |tx| tx.delete_location(&id)).await?;
        if let Some(store) = self.remove_store(uuid) {
            store.close().await;
        }
        if let Ok(mut errors) = self.errors.write() {
            errors.remove(uuid);
        }
        info!("Finder: location {} deleted", uuid);
        Ok(())
    }

    /// Close every store reached through a URL and discover them again.
    pub async fn rescan(&self, cancel: &CancellationToken) -> SlimeResult<()> {
        let dropped: Vec<FinderEntry> = match self.entries.write() {
            Ok(mut m) => {
                let uuids: Vec<Uuid> = m
                    .iter()
                    .filter(|(_, e)| !e.url.is_empty())
                    .map(|(u, _)| *u)
                    .collect();
                uuids.iter().filter_map(|u| m.remove(u)).collect()
            }
            Err(_) => Vec::new(),
        };
        for entry in dropped {
            entry.store.close().await;
        }
        self.scan_all(cancel).await
    }

    pub fn stores_info(&self) -> SlimeResult<Vec<StoreInfo>> {
        let locations = self.db.run(|tx| tx.all_locations())?;
        let entries = self.stores();
        let errors = self.errors.read().map(|e| e.clone()).unwrap_or_default();
        Ok(locations
            .into_iter()
            .map(|loc| {
                let entry = entries.get(&loc.uuid);
                StoreInfo {
                    uuid: loc.uuid,
                    url: loc.url,
                    name: loc.name,
                    dead: loc.dead,
                    connected: entry.is_some(),
                    last_seen: loc.last_seen,
                    free: entry.map(|e| e.free).unwrap_or(0),
                    error: errors.get(&loc.uuid).cloned(),
                }
            })
            .collect())
    }

    async fn admit(&self, url: &str, store: StoreRef, cancel: &CancellationToken) -> SlimeResult<()> {
        let uuid = store.uuid();
        let free = store.free_space(cancel).await?;
        let dead = self.location_dead(&uuid).await?;
        let entry = FinderEntry {
            store,
            url: url.to_string(),
            free,
            last_check: unix_timestamp(),
            dead,
        };
        let mut entries = self
            .entries
            .write()
            .map_err(|_| SlimeError::Internal("finder entries poisoned".to_string()))?;
        entries.entry(uuid).or_insert(entry);
        Ok(())
    }

    async fn location_dead(&self, uuid: &Uuid) -> SlimeResult<bool> {
        let id = *uuid;
        Ok(run_meta(&self.db, move |tx| tx.get_location(&id))
            .await?
            .map(|l| l.dead)
            .unwrap_or(false))
    }

    async fn touch_location(&self, uuid: &Uuid, url: &str, name: &str) -> SlimeResult<()> {
        let (id, url, name) = (*uuid, url.to_string(), name.to_string());
        run_meta(&self.db, move |tx| {
            let mut loc = tx.get_location(&id)?.unwrap_or_else(|| Location::new(id));
            loc.url = url.clone();
            loc.name = name.clone();
            loc.last_seen = unix_timestamp();
            tx.set_location(&loc)
        })
        .await
    }

    fn note_error(&self, uuid: &Uuid, e: &SlimeError) {
        if let Ok(mut errors) = self.errors.write() {
            errors.insert(*uuid, e.to_string());
        }
    }
}

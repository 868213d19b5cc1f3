use log::{info, warn};
use multi_store::{Finder, HttpConnector, Multi, MultiConfig};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use slime_lib::{serve_stores_until, SlimeError, SlimeResult, StoreRef};
use slime_meta::{MetaDb, WalPolicy};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SLIME_DAEMON_CONFIG_PATH: &str = "/opt/slime/etc/slime_daemon.json";

pub const ENV_DB_PATH: &str = "SLIME_DB_PATH";
pub const ENV_STORE_URLS: &str = "SLIME_STORE_URLS";
pub const ENV_REDUNDANCY_NEED: &str = "SLIME_REDUNDANCY_NEED";
pub const ENV_REDUNDANCY_TOTAL: &str = "SLIME_REDUNDANCY_TOTAL";
pub const ENV_CACHE_SIZE: &str = "SLIME_CACHE_SIZE";

#[derive(Debug, Clone)]
pub struct SlimeDaemonRunOptions {
    pub config_path: Option<PathBuf>,
}

/// On-disk daemon configuration. Every field may be omitted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SlimeDaemonConfig {
    #[serde(alias = "meta_db_path")]
    pub db_path: PathBuf,
    /// Chunk-server routers to scan for stores.
    #[serde(alias = "stores")]
    pub store_urls: Vec<String>,
    /// Serve the multi store itself over the chunk protocol on this address.
    pub listen: Option<String>,
    pub need: Option<usize>,
    pub total: Option<usize>,
    pub cache_size: u64,
    pub read_data_timeout_secs: f64,
    pub scan_interval_secs: u64,
    pub test_interval_between_secs: u64,
    pub scrub_files_interval_secs: u64,
    pub scrub_locations_interval_secs: u64,
    pub scrub_wal_interval_secs: u64,
    pub rebalance_interval_secs: u64,
    pub config_reload_interval_secs: u64,
    pub jitter: f64,
    pub get_attempts: usize,
    pub rebalance_min_difference: i64,
    pub rebalance_max_files: usize,
    pub rebalance_max_moves: usize,
    pub scrub_files_page: usize,
    pub scrub_locations_page: usize,
    pub wal_expire_secs: u64,
}

impl Default for SlimeDaemonConfig {
    fn default() -> Self {
        let m = MultiConfig::default();
        Self {
            db_path: PathBuf::from("/opt/slime/var/slime_meta.db"),
            store_urls: Vec::new(),
            listen: None,
            need: None,
            total: None,
            cache_size: m.cache_size,
            read_data_timeout_secs: m.read_data_timeout.as_secs_f64(),
            scan_interval_secs: m.scan_interval.as_secs(),
            test_interval_between_secs: m.test_interval_between.as_secs(),
            scrub_files_interval_secs: m.scrub_files_interval.as_secs(),
            scrub_locations_interval_secs: m.scrub_locations_interval.as_secs(),
            scrub_wal_interval_secs: m.scrub_wal_interval.as_secs(),
            rebalance_interval_secs: m.rebalance_interval.as_secs(),
            config_reload_interval_secs: m.config_reload_interval.as_secs(),
            jitter: m.jitter,
            get_attempts: m.get_attempts,
            rebalance_min_difference: m.rebalance_min_difference,
            rebalance_max_files: m.rebalance_max_files,
            rebalance_max_moves: m.rebalance_max_moves,
            scrub_files_page: m.scrub_files_page,
            scrub_locations_page: m.scrub_locations_page,
            wal_expire_secs: m.wal.expire_age.as_secs(),
        }
    }
}

impl SlimeDaemonConfig {
    /// Apply `SLIME_*` overrides looked up through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> SlimeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_DB_PATH) {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_STORE_URLS) {
            self.store_urls = v
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup(ENV_REDUNDANCY_NEED) {
            self.need = Some(parse_env(ENV_REDUNDANCY_NEED, &v)?);
        }
        if let Some(v) = lookup(ENV_REDUNDANCY_TOTAL) {
            self.total = Some(parse_env(ENV_REDUNDANCY_TOTAL, &v)?);
        }
        if let Some(v) = lookup(ENV_CACHE_SIZE) {
            self.cache_size = parse_env(ENV_CACHE_SIZE, &v)?;
        }
        Ok(())
    }

    pub fn multi_config(&self) -> MultiConfig {
        let defaults = MultiConfig::default();
        MultiConfig {
            read_data_timeout: Duration::from_secs_f64(self.read_data_timeout_secs.max(0.0)),
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            test_interval_between: Duration::from_secs(self.test_interval_between_secs),
            scrub_files_interval: Duration::from_secs(self.scrub_files_interval_secs),
            scrub_locations_interval: Duration::from_secs(self.scrub_locations_interval_secs),
            scrub_wal_interval: Duration::from_secs(self.scrub_wal_interval_secs),
            rebalance_interval: Duration::from_secs(self.rebalance_interval_secs),
            config_reload_interval: Duration::from_secs(self.config_reload_interval_secs),
            jitter: self.jitter,
            get_attempts: self.get_attempts.max(1),
            rebalance_min_difference: self.rebalance_min_difference,
            rebalance_max_files: self.rebalance_max_files,
            rebalance_max_moves: self.rebalance_max_moves,
            scrub_files_page: self.scrub_files_page.max(1),
            scrub_locations_page: self.scrub_locations_page.max(1),
            wal: WalPolicy {
                expire_age: Duration::from_secs(self.wal_expire_secs),
                ..WalPolicy::default()
            },
            cache_size: self.cache_size,
            default_need: self.need.unwrap_or(defaults.default_need),
            default_total: self.total.unwrap_or(defaults.default_total),
        }
    }

    fn listen_addr(&self) -> SlimeResult<Option<SocketAddr>> {
        match self.listen.as_deref().filter(|v| !v.is_empty()) {
            Some(v) => v
                .parse::<SocketAddr>()
                .map(Some)
                .map_err(|e| SlimeError::BadArgument(format!("listen address {:?}: {}", v, e))),
            None => Ok(None),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> SlimeResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| SlimeError::BadArgument(format!("{}={:?}: {}", name, value, e)))
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> SlimeResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SlimeError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| SlimeError::BadFormat(format!("parse {} failed: {}", path.display(), e)))
}

/// Read the config file and apply the process environment on top. An
/// explicit path must exist; the default one may be missing.
pub fn load_config(path: Option<&Path>) -> SlimeResult<SlimeDaemonConfig> {
    let mut config = match path {
        Some(path) => read_json_config(path)?,
        None => {
            let default_path = Path::new(DEFAULT_SLIME_DAEMON_CONFIG_PATH);
            if default_path.exists() {
                read_json_config(default_path)?
            } else {
                info!("no config at {}, using defaults", default_path.display());
                SlimeDaemonConfig::default()
            }
        }
    };
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    Ok(config)
}

/// Open the metadata database, discover the configured stores and bring
/// up the multi store. Background loops are not started.
pub async fn init_multi(
    config: &SlimeDaemonConfig,
    cancel: &CancellationToken,
) -> SlimeResult<Arc<Multi>> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            SlimeError::IoError(format!("create db dir {} failed: {}", parent.display(), e))
        })?;
    }
    let db = Arc::new(MetaDb::open(&config.db_path.to_string_lossy())?);
    let multi_config = config.multi_config();

    let connector = Arc::new(HttpConnector::new(multi_config.cache_size)?);
    let finder = Arc::new(Finder::new(db.clone(), connector, multi_config.clone()));
    for url in config.store_urls.iter() {
        finder.add_url(url);
    }
    finder.scan_all(cancel).await?;
    info!("found {} chunk stores", finder.stores().len());

    let multi = Multi::new(db, finder, multi_config)?;
    if let (Some(need), Some(total)) = (config.need, config.total) {
        let current = multi.redundancy();
        if current.need != need || current.total != total {
            multi.set_redundancy(need, total)?;
        }
    } else if config.need.is_some() || config.total.is_some() {
        warn!("need and total must be given together, keeping the stored redundancy");
    }
    Ok(multi)
}

pub fn run_slime_daemon(options: SlimeDaemonRunOptions) -> SlimeResult<()> {
    let config = load_config(options.config_path.as_deref())?;
    let listen = config.listen_addr()?;
    let runtime = Runtime::new().map_err(|e| SlimeError::Internal(e.to_string()))?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let multi = init_multi(&config, &cancel).await?;
        multi.start();
        info!(
            "slime_daemon running, db={}, stores={:?}",
            config.db_path.display(),
            config.store_urls
        );

        let server = listen.map(|addr| {
            let stores: Vec<StoreRef> = vec![multi.clone() as StoreRef];
            tokio::spawn(serve_stores_until(addr, stores, cancel.clone()))
        });

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("waiting for ctrl-c failed: {}", e);
        }
        info!("slime_daemon shutting down");
        cancel.cancel();
        if let Some(server) = server {
            match server.await {
                Ok(Ok(addr)) => info!("stopped serving on {}", addr),
                Ok(Err(e)) => warn!("chunk server failed: {}", e),
                Err(e) => warn!("chunk server task failed: {}", e),
            }
        }
        multi.stop().await;
        Ok(())
    })
}

use rand::Rng;
use slime_meta::WalPolicy;
use std::time::Duration;

pub const CONFIG_NEED: &str = "need";
pub const CONFIG_TOTAL: &str = "total";
pub const CONFIG_UUID: &str = "uuid";
pub const CONFIG_SCRUB_POS: &str = "scrubpos";
pub const CONFIG_SCRUB_LOCATION_POS: &str = "scrublocationpos";
pub const CONFIG_REBALANCE_POS: &str = "rebalpos";

pub fn scrub_location_pos_key(uuid: &uuid::Uuid) -> String {
    format!("{}-{}", CONFIG_SCRUB_LOCATION_POS, uuid)
}

/// Tunables of one multi store and its finder.
#[derive(Debug, Clone)]
pub struct MultiConfig {
    /// How long a read waits on data chunks alone before asking parity.
    pub read_data_timeout: Duration,
    pub scan_interval: Duration,
    pub test_interval_between: Duration,
    pub scrub_files_interval: Duration,
    pub scrub_locations_interval: Duration,
    pub scrub_wal_interval: Duration,
    pub rebalance_interval: Duration,
    pub config_reload_interval: Duration,
    /// Fractional spread applied to every interval, e.g. 0.05 for ±5%.
    pub jitter: f64,
    pub get_attempts: usize,
    pub rebalance_min_difference: i64,
    pub rebalance_max_files: usize,
    pub rebalance_max_moves: usize,
    pub scrub_files_page: usize,
    pub scrub_locations_page: usize,
    pub wal: WalPolicy,
    /// Bytes of read cache in front of each chunk store; 0 disables it.
    pub cache_size: u64,
    pub default_need: usize,
    pub default_total: usize,
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            read_data_timeout: Duration::from_secs(5),
            scan_interval: Duration::from_secs(5 * 60),
            test_interval_between: Duration::from_secs(5),
            scrub_files_interval: Duration::from_secs(5),
            scrub_locations_interval: Duration::from_secs(10),
            scrub_wal_interval: Duration::from_secs(4 * 3600),
            rebalance_interval: Duration::from_secs(30),
            config_reload_interval: Duration::from_secs(15 * 60),
            jitter: 0.05,
            get_attempts: 10,
            rebalance_min_difference: 1 << 30,
            rebalance_max_files: 100,
            rebalance_max_moves: 10,
            scrub_files_page: 100,
            scrub_locations_page: 1000,
            wal: WalPolicy::default(),
            cache_size: 0,
            default_need: 3,
            default_total: 5,
        }
    }
}

/// `base` scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
pub fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    base.mul_f64(factor.max(0.0))
}

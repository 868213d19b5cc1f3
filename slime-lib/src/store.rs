//! The store capability set.
//!
//! Every backend that can hold named blobs (an in-memory map, a remote chunk
//! server, the redundant multi store, a cache or retry wrapper in front of any
//! of those) implements [`Store`]. Optional capabilities are reached through
//! the `as_*` accessors instead of separate trait objects so callers can keep
//! a single `Arc<dyn Store>` around.

use crate::{SlimeError, SlimeResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    #[serde(with = "hex_sha256")]
    pub sha256: [u8; 32],
    pub size: u64,
    pub write_time: i64,
}

impl Stat {
    /// Two stats describe the same content when hash and size agree; the
    /// write time is informational only.
    pub fn same_content(&self, other: &Stat) -> bool {
        self.sha256 == other.sha256 && self.size == other.size
    }
}

mod hex_sha256 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        crate::parse_sha256_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub no_verify: bool,
}

impl GetOptions {
    pub fn no_verify() -> Self {
        Self { no_verify: true }
    }
}

/// The `from` side of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Any,
    Missing,
    Sha256([u8; 32]),
}

impl Precondition {
    pub fn matches(&self, current: Option<&[u8; 32]>) -> bool {
        match (self, current) {
            (Precondition::Any, _) => true,
            (Precondition::Missing, None) => true,
            (Precondition::Sha256(want), Some(have)) => want == have,
            _ => false,
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::Any => write!(f, "any"),
            Precondition::Missing => write!(f, "missing"),
            Precondition::Sha256(h) => write!(f, "{}", hex::encode(h)),
        }
    }
}

/// The `to` side of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasTo {
    Missing,
    Data(Vec<u8>),
}

impl CasTo {
    pub fn is_present(&self) -> bool {
        matches!(self, CasTo::Data(_))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    fn uuid(&self) -> Uuid;

    fn name(&self) -> String;

    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)>;

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> SlimeResult<Stat>;

    async fn cas(
        &self,
        key: &str,
        from: Precondition,
        to: CasTo,
        cancel: &CancellationToken,
    ) -> SlimeResult<()>;

    /// Keys strictly after `after`, in lexicographic order. A `limit` of 0
    /// lists everything.
    async fn list(
        &self,
        after: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> SlimeResult<Vec<String>>;

    async fn free_space(&self, cancel: &CancellationToken) -> SlimeResult<i64>;

    async fn close(&self) {}

    fn as_range_reader(&self) -> Option<&dyn RangeReader> {
        None
    }

    fn as_availability(&self) -> Option<&dyn Availability> {
        None
    }
}

#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read `length` bytes from `start`; a negative length reads to the end.
    async fn get_partial(
        &self,
        key: &str,
        start: u64,
        length: i64,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)>;
}

pub trait Availability: Send + Sync {
    fn available(&self) -> bool;
}

pub type StoreRef = Arc<dyn Store>;

/// Read a byte range through the store's native range support when it has
/// one, falling back to a whole-object read.
pub async fn get_partial(
    store: &dyn Store,
    key: &str,
    start: u64,
    length: i64,
    cancel: &CancellationToken,
) -> SlimeResult<(Vec<u8>, Stat)> {
    if let Some(reader) = store.as_range_reader() {
        return reader.get_partial(key, start, length, cancel).await;
    }
    let (data, stat) = store.get(key, GetOptions::default(), cancel).await?;
    Ok((slice_range(&data, start, length)?, stat))
}

/// The `[start, start + length)` window of `data`; a negative length runs to the end.
pub fn slice_range(data: &[u8], start: u64, length: i64) -> SlimeResult<Vec<u8>> {
    let start = start as usize;
    if start > data.len() {
        return Err(SlimeError::BadArgument(format!(
            "range start {} beyond size {}",
            start,
            data.len()
        )));
    }
    let end = if length < 0 {
        data.len()
    } else {
        start.saturating_add(length as usize).min(data.len())
    };
    Ok(data[start..end].to_vec())
}

/// Race `fut` against cancellation.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> SlimeResult<T>
where
    F: std::future::Future<Output = SlimeResult<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SlimeError::Cancelled),
        r = fut => r,
    }
}

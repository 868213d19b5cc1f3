mod gf;
mod http_client;
mod http_server;
mod mem_store;
mod retry;
mod store;

pub use gf::*;
pub use http_client::*;
pub use http_server::*;
pub use mem_store::*;
pub use retry::*;
pub use store::*;

#[cfg(test)]
mod test_http;

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

#[macro_use]
extern crate log;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cas failure: {0}")]
    CasFailure(String),
    #[error("insufficient stores: {0}")]
    InsufficientStores(String),
    #[error("insufficient chunks: {0}")]
    InsufficientChunks(String),
    #[error("bad hash: {0}")]
    BadHash(String),
    #[error("too many retries: {0}")]
    TooManyRetries(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("bad format: {0}")]
    BadFormat(String),
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("modified during balance: {0}")]
    ModifiedDuringBalance(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("db conflict: {0}")]
    Conflict(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SlimeError {
    pub fn from_http_status(code: u16, info: String) -> Self {
        match code {
            404 => SlimeError::NotFound(info),
            412 => SlimeError::CasFailure(info),
            400 | 413 | 416 => SlimeError::BadArgument(format!("HTTP {} for {}", code, info)),
            _ => SlimeError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SlimeError::NotFound(_))
    }

    pub fn is_cas_failure(&self) -> bool {
        matches!(self, SlimeError::CasFailure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SlimeError::Cancelled)
    }

    /// Errors that say something definite about the object rather than about
    /// the path to it. Retrying them cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SlimeError::NotFound(_)
                | SlimeError::CasFailure(_)
                | SlimeError::BadHash(_)
                | SlimeError::BadArgument(_)
                | SlimeError::Cancelled
        )
    }
}

pub type SlimeResult<T> = std::result::Result<T, SlimeError>;

impl From<std::io::Error> for SlimeError {
    fn from(err: std::io::Error) -> Self {
        SlimeError::IoError(err.to_string())
    }
}

/// Largest number of chunks a single object may be split into.
pub const MAX_CHUNKS: usize = 100;

pub const HEADER_CONTENT_SHA256: &str = "x-content-sha256";

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn parse_sha256_hex(s: &str) -> SlimeResult<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s.trim(), &mut out)
        .map_err(|e| SlimeError::BadFormat(format!("invalid sha256 {:?}: {}", s, e)))?;
    Ok(out)
}

/// A fresh RFC 4122 v4 identifier, used both for store UUIDs and prefix ids.
pub fn new_uuid() -> Uuid {
    Uuid::new_v4()
}

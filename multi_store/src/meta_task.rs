use slime_lib::{SlimeError, SlimeResult};
use slime_meta::{MetaDb, MetaTx};
use std::sync::Arc;

/// Run one metadata transaction on the blocking pool so that lock waits and
/// conflict backoff inside the KV driver never stall a runtime worker.
pub(crate) async fn run_meta<T, F>(db: &Arc<MetaDb>, f: F) -> SlimeResult<T>
where
    T: Send + 'static,
    F: FnMut(&MetaTx<'_>) -> SlimeResult<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.run(f))
        .await
        .map_err(|e| SlimeError::Internal(format!("metadata task failed: {}", e)))?
}

/// Expire old WAL marks on the blocking pool.
pub(crate) async fn wal_clear_old(
    db: &Arc<MetaDb>,
    now: i64,
    policy: slime_meta::WalPolicy,
) -> SlimeResult<usize> {
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.wal_clear_old(now, &policy))
        .await
        .map_err(|e| SlimeError::Internal(format!("wal expiry task failed: {}", e)))?
}

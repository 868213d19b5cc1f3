use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use slime_lib::{Retrier, SlimeError, SlimeResult};
use std::sync::Mutex;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TX_ATTEMPTS: u32 = 20;

fn db_err(e: rusqlite::Error) -> SlimeError {
    if let rusqlite::Error::SqliteFailure(ref f, _) = e {
        if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
            return SlimeError::Conflict(e.to_string());
        }
    }
    SlimeError::DbError(e.to_string())
}

/// Ordered byte-keyed KV store over a single SQLite table.
pub struct KvDb {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl KvDb {
    pub fn open(db_path: &str) -> SlimeResult<Self> {
        debug!("KvDb: open db path: {}", db_path);
        let conn = Connection::open(db_path).map_err(|e| {
            warn!("KvDb: open db failed! {}", e);
            db_err(e)
        })?;
        Self::init(conn, db_path.to_string())
    }

    pub fn open_in_memory() -> SlimeResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, ":memory:".to_string())
    }

    fn init(conn: Connection, db_path: String) -> SlimeResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                k BLOB PRIMARY KEY,
                v BLOB NOT NULL
            ) WITHOUT ROWID",
            [],
        )
        .map_err(|e| {
            warn!("KvDb: create table kv failed! {}", e);
            db_err(e)
        })?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside one serializable transaction. The transaction commits
    /// when `f` returns `Ok` and rolls back otherwise. Lock conflicts, from
    /// `f` or from the commit, rerun `f` from scratch.
    ///
    /// Blocks the calling thread, backoff sleeps included. Async callers
    /// should hand the call to the blocking pool.
    pub fn run<T, F>(&self, mut f: F) -> SlimeResult<T>
    where
        F: FnMut(&KvTx<'_>) -> SlimeResult<T>,
    {
        let mut retrier = Retrier::new(MAX_TX_ATTEMPTS);
        let mut last_err = None;
        while retrier.next_blocking() {
            match self.run_once(&mut f) {
                Err(SlimeError::Conflict(msg)) => {
                    debug!("KvDb: transaction conflict, retrying: {}", msg);
                    last_err = Some(msg);
                }
                other => return other,
            }
        }
        Err(SlimeError::TooManyRetries(format!(
            "kv transaction: {}",
            last_err.unwrap_or_default()
        )))
    }

    fn run_once<T, F>(&self, f: &mut F) -> SlimeResult<T>
    where
        F: FnMut(&KvTx<'_>) -> SlimeResult<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| SlimeError::Internal("kv connection poisoned".to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let result = f(&KvTx { conn: &tx })?;
        tx.commit().map_err(db_err)?;
        Ok(result)
    }
}

/// Handle on an open transaction.
#[derive(Clone, Copy)]
pub struct KvTx<'a> {
    conn: &'a Connection,
}

impl<'a> KvTx<'a> {
    pub fn get(&self, key: &[u8]) -> SlimeResult<Option<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT v FROM kv WHERE k = ?1")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![key]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(row.get(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> SlimeResult<()> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)")
            .and_then(|mut stmt| stmt.execute(params![key, value]))
            .map_err(db_err)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> SlimeResult<()> {
        self.conn
            .prepare_cached("DELETE FROM kv WHERE k = ?1")
            .and_then(|mut stmt| stmt.execute(params![key]))
            .map_err(db_err)?;
        Ok(())
    }

    /// Pairs with `low <= key < high` in key order; `limit == 0` is unlimited.
    pub fn range(
        &self,
        low: &[u8],
        high: &[u8],
        limit: usize,
    ) -> SlimeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let limit: i64 = if limit == 0 { -1 } else { limit as i64 };
        let mut stmt = self
            .conn
            .prepare_cached("SELECT k, v FROM kv WHERE k >= ?1 AND k < ?2 ORDER BY k LIMIT ?3")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![low, high, limit], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn clear_range(&self, low: &[u8], high: &[u8]) -> SlimeResult<()> {
        self.conn
            .execute("DELETE FROM kv WHERE k >= ?1 AND k < ?2", params![low, high])
            .map_err(db_err)?;
        Ok(())
    }
}

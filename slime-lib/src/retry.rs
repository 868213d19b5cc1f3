use crate::{
    Availability, CasTo, GetOptions, Precondition, RangeReader, SlimeError, SlimeResult, Stat,
    Store, StoreRef,
};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const INITIAL_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Bounded retry with exponential, jittered backoff.
///
/// ```ignore
/// let mut r = Retrier::new(5);
/// while r.next(&cancel).await {
///     if attempt().await.is_ok() { break; }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Retrier {
    max_attempts: u32,
    attempt: u32,
    delay: Duration,
}

impl Retrier {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempt: 0,
            delay: INITIAL_DELAY,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt may be made. The first call returns at once;
    /// later calls sleep `delay * U[0, 1)` and double the delay, up to one
    /// second.
    pub async fn next(&mut self, cancel: &CancellationToken) -> bool {
        if self.attempt >= self.max_attempts || cancel.is_cancelled() {
            return false;
        }
        if self.attempt > 0 {
            let wait = self.next_wait();
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.attempt += 1;
        true
    }

    /// Blocking flavour for synchronous callers such as the KV driver.
    pub fn next_blocking(&mut self) -> bool {
        if self.attempt >= self.max_attempts {
            return false;
        }
        if self.attempt > 0 {
            std::thread::sleep(self.next_wait());
        }
        self.attempt += 1;
        true
    }

    fn next_wait(&mut self) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let wait = self.delay.mul_f64(factor);
        self.delay = self.delay.saturating_mul(2).min(MAX_DELAY);
        wait
    }
}

/// A store wrapper that retries transient failures of the read-only
/// operations. CAS is not idempotent from the caller's point of view and is
/// passed through untouched.
pub struct RetryStore {
    inner: StoreRef,
    attempts: u32,
}

impl RetryStore {
    pub fn new(inner: StoreRef, attempts: u32) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }

    async fn retry<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> SlimeResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = SlimeResult<T>> + Send,
    {
        let mut retrier = Retrier::new(self.attempts);
        let mut last_err = None;
        while retrier.next(cancel).await {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    debug!(
                        "RetryStore: {} on {} failed (attempt {}): {}",
                        what,
                        self.inner.name(),
                        retrier.attempts(),
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(SlimeError::Cancelled);
        }
        Err(match last_err {
            Some(e) => SlimeError::TooManyRetries(format!("{}: {}", what, e)),
            None => SlimeError::TooManyRetries(what.to_string()),
        })
    }
}

#[async_trait]
impl Store for RetryStore {
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
        self.retry("get", cancel, || self.inner.get(key, opts, cancel))
            .await
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> SlimeResult<Stat> {
        self.retry("stat", cancel, || self.inner.stat(key, cancel)).await
    }

    async fn cas(
        &self,
        key: &str,
        from: Precondition,
        to: CasTo,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        self.inner.cas(key, from, to, cancel).await
    }

    async fn list(
        &self,
        after: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> SlimeResult<Vec<String>> {
        self.retry("list", cancel, || self.inner.list(after, limit, cancel))
            .await
    }

    async fn free_space(&self, cancel: &CancellationToken) -> SlimeResult<i64> {
        self.retry("free_space", cancel, || self.inner.free_space(cancel))
            .await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn as_range_reader(&self) -> Option<&dyn RangeReader> {
        self.inner.as_range_reader()
    }

    fn as_availability(&self) -> Option<&dyn Availability> {
        self.inner.as_availability()
    }
}

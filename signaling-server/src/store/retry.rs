//! Retries transient [`Store`] failures with jittered exponential backoff
//! before giving up. Every backend error this crate sees is transient by
//! construction — `StoreError::Unavailable` only ever means "network blip
//! or backend hiccup," per §7 — so there's no error variant to branch on,
//! unlike an HTTP client retrying on 5xx but not 4xx. We just retry
//! everything, bounded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};

use super::{Store, StoreError};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

async fn sleep_with_jitter(backoff: Duration) {
    let jittered = backoff + Duration::from_millis(thread_rng().gen_range(0..=backoff.as_millis() as u64));
    tokio::time::sleep(jittered).await;
}

async fn with_retry<T, F, Fut>(op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS => {
                tracing::warn!(attempt, %err, "transient store error, retrying");
                sleep_with_jitter(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop always returns or errors on the final attempt");
}

/// Wraps a [`Store`] so a transient failure (§7: "backing-store
/// unavailable, network blip") is retried up to [`MAX_ATTEMPTS`] times with
/// jittered backoff before the caller ever sees it. Callers still map a
/// surfaced `Err` straight to `ServiceUnavailable` — this just shrinks how
/// often that mapping fires.
pub struct RetryingStore {
    inner: Arc<dyn Store>,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Store for RetryingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        with_retry(|| self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        with_retry(|| self.inner.set(key, value, ttl)).await
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        with_retry(|| self.inner.set_if_absent(key, value, ttl)).await
    }

    async fn cas_delete(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        with_retry(|| self.inner.cas_delete(key)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        with_retry(|| self.inner.delete(key)).await
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        with_retry(|| self.inner.extend_ttl(key, ttl)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// A `Store` that fails its first `fail_count` calls to every method,
    /// then succeeds. Lets tests pin down exactly how many attempts
    /// `RetryingStore` makes without a real backend.
    struct FlakyStore {
        fail_count: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_count {
                Err(StoreError::Unavailable("flaky".into()))
            } else {
                Ok(None)
            }
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn set_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<bool, StoreError> {
            unimplemented!()
        }

        async fn cas_delete(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            unimplemented!()
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn extend_ttl(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_budget() {
        let inner = Arc::new(FlakyStore { fail_count: 2, calls: AtomicU32::new(0) });
        let retrying = RetryingStore::new(inner.clone());

        let result = retrying.get("k").await;

        assert!(result.is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let inner = Arc::new(FlakyStore { fail_count: 10, calls: AtomicU32::new(0) });
        let retrying = RetryingStore::new(inner.clone());

        let result = retrying.get("k").await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn no_retry_needed_calls_once() {
        let inner = Arc::new(FlakyStore { fail_count: 0, calls: AtomicU32::new(0) });
        let retrying = RetryingStore::new(inner.clone());

        retrying.get("k").await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}

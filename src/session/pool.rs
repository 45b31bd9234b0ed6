use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

use crate::logger::Logger;

struct Lease<T> {
    cell: Arc<OnceCell<T>>,
    holders: usize,
}

/// Reference-counted resources keyed by configuration fingerprint. The
/// first `acquire` for a key loads the value, the last `release` hands it
/// back so the caller can unload it.
///
/// The map lock is never held across a load: each key loads through its
/// own cell, so a slow load only delays acquirers of that key.
pub struct SharedPool<T> {
    entries: Mutex<HashMap<String, Lease<T>>>,
    logger: Logger,
}

impl<T: Clone> SharedPool<T> {
    pub fn new(name: &str) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            logger: Logger::new(name),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Lease<T>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Concurrent acquires of a missing key wait for one load instead of
    /// loading twice. A failed load is not cached.
    pub async fn acquire<F, Fut, E>(&self, key: &str, load: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = {
            let mut entries = self.entries();
            let lease = entries.entry(key.to_string()).or_insert_with(|| Lease {
                cell: Arc::new(OnceCell::new()),
                holders: 0,
            });
            lease.holders += 1;
            Arc::clone(&lease.cell)
        };

        if let Some(value) = cell.get() {
            self.logger.debug(&format!("Reusing {}", key));
            return Ok(value.clone());
        }

        match cell.get_or_try_init(load).await {
            Ok(value) => {
                self.logger.info(&format!("Loaded {}", key));
                Ok(value.clone())
            }
            Err(e) => {
                let mut entries = self.entries();
                if let Some(lease) = entries.get_mut(key) {
                    lease.holders = lease.holders.saturating_sub(1);
                    if lease.holders == 0 && Arc::ptr_eq(&lease.cell, &cell) {
                        entries.remove(key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Returns the value once no holder is left.
    pub async fn release(&self, key: &str) -> Option<T> {
        let mut entries = self.entries();
        let lease = entries.get_mut(key)?;
        lease.holders = lease.holders.saturating_sub(1);
        if lease.holders > 0 {
            return None;
        }
        self.logger.info(&format!("Releasing {}", key));
        entries.remove(key).and_then(|lease| lease.cell.get().cloned())
    }

    pub async fn holders(&self, key: &str) -> usize {
        self.entries().get(key).map(|lease| lease.holders).unwrap_or(0)
    }

    /// Number of loaded values; keys still loading are not counted.
    pub async fn len(&self) -> usize {
        self.entries()
            .values()
            .filter(|lease| lease.cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loads_once_and_releases_at_zero() {
        let pool: SharedPool<Arc<String>> = SharedPool::new("TestPool");
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        let load = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(Arc::new("model".to_string()))
        };

        let a = pool.acquire("m", load).await.unwrap();
        let b = pool.acquire("m", load).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(pool.holders("m").await, 2);

        assert!(pool.release("m").await.is_none());
        assert!(pool.release("m").await.is_some());
        assert!(pool.is_empty().await);
        assert!(pool.release("m").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let pool: SharedPool<u32> = SharedPool::new("TestPool");
        let err = pool.acquire("k", || async { Err::<u32, _>("boom") }).await;
        assert_eq!(err, Err("boom"));
        assert_eq!(pool.holders("k").await, 0);
        assert_eq!(pool.acquire("k", || async { Ok::<_, &str>(7) }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_slow_load_does_not_block_other_keys() {
        let pool: Arc<SharedPool<u32>> = Arc::new(SharedPool::new("TestPool"));
        assert_eq!(pool.acquire("fast", || async { Ok::<_, ()>(1) }).await, Ok(1));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire("slow", || async move {
                    let _ = started_tx.send(());
                    let _ = finish_rx.await;
                    Ok::<_, ()>(2)
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            pool.acquire("other", || async { Ok::<_, ()>(3) }),
        )
        .await
        .expect("acquire of another key stalled behind a load");
        assert_eq!(other, Ok(3));
        let released = tokio::time::timeout(Duration::from_secs(1), pool.release("fast"))
            .await
            .expect("release stalled behind a load");
        assert_eq!(released, Some(1));
        assert_eq!(pool.len().await, 1);

        finish_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), Ok(2));
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_waiters_share_one_load() {
        let pool: Arc<SharedPool<u32>> = Arc::new(SharedPool::new("TestPool"));
        let loads = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let loads = Arc::clone(&loads);
            tasks.push(tokio::spawn(async move {
                pool.acquire("m", || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, ()>(9)
                })
                .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(9));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(pool.holders("m").await, 4);
    }
}

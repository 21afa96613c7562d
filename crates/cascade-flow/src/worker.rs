//! Bounded pool for collaborator calls.
//!
//! Calls run on their own task so the stage loop never waits on a model. A failing or
//! panicking call comes back as a [`WorkerError`]; it never takes the pool
//! down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0:#}")]
    Failed(anyhow::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("worker pool closed")]
    Closed,
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// A pool running at most `size` calls at once (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Calls currently running.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Run an async collaborator call on its own task.
    pub async fn run<F, T>(&self, call: F) -> Result<T, WorkerError>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            call.await
        });
        match handle.await {
            Ok(result) => result.map_err(WorkerError::Failed),
            Err(join) => Err(WorkerError::Panicked(join.to_string())),
        }
    }

    /// Like [`run`](Self::run), giving up after `limit`.
    ///
    /// The call is abandoned, not aborted: a timed-out task keeps its permit
    /// until it finishes.
    pub async fn run_with_timeout<F, T>(&self, limit: Duration, call: F) -> Result<T, WorkerError>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            call.await
        });
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(result)) => result.map_err(WorkerError::Failed),
            Ok(Err(join)) => Err(WorkerError::Panicked(join.to_string())),
            Err(_) => Err(WorkerError::TimedOut(limit)),
        }
    }

    /// Refuse further calls. Running calls finish.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = WorkerPool::new(2);
        let value = pool.run(async { Ok(21 * 2) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_failure_is_typed_and_pool_survives() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run(async { Err::<(), _>(anyhow::anyhow!("model offline")) })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Failed(_)));
        assert_eq!(err.to_string(), "model offline");

        assert_eq!(pool.run(async { Ok("next") }).await.unwrap(), "next");
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run(async {
                if true {
                    panic!("boom");
                }
                Ok::<(), anyhow::Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Panicked(_)));
        assert_eq!(pool.run(async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let pool = WorkerPool::new(1);
        let err = pool
            .run_with_timeout(Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::TimedOut(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut calls = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            calls.push(tokio::spawn(async move {
                pool.run(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(matches!(
            pool.run(async { Ok(()) }).await,
            Err(WorkerError::Closed)
        ));
    }
}

//! Bounded, supervised execution of independent units of work.
//!
//! Each unit runs in its own task so a slow RPC never blocks the loop that
//! received it, and a panicking unit is logged without disturbing others.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::error;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    capacity: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool running at most `capacity` units at once.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Units currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    /// Queue a unit of work. Returns immediately; the unit starts once a
    /// permit is free.
    pub fn spawn<F>(&self, label: &'static str, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let pool = self.name;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::spawn(work).await {
                if e.is_panic() {
                    error!(target: "bus.worker", pool = pool, unit = label, "Unit of work panicked");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_panicking_unit_does_not_affect_others() {
        let pool = WorkerPool::new("test", 4);
        let done = Arc::new(AtomicUsize::new(0));

        #[allow(clippy::panic)]
        let bad = pool.spawn("bad", async { panic!("boom") });
        let counter = Arc::clone(&done);
        let good = pool.spawn("good", async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bad.await.unwrap();
        good.await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_bounds_concurrency() {
        let pool = WorkerPool::new("test", 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (second_tx, mut second_rx) = oneshot::channel::<()>();

        pool.spawn("first", async move {
            let _ = release_rx.await;
        });
        pool.spawn("second", async move {
            let _ = second_tx.send(());
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(second_rx.try_recv().is_err(), "second unit must wait");
        assert_eq!(pool.in_flight(), 1);

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), second_rx)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Bounded parallel execution.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, error};

/// Fixed-width pool of execution slots.
///
/// Jobs are spawned eagerly but run at most `max_concurrent` at a time;
/// results come back in submission order regardless of completion order.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wait for a free execution slot. `None` can only occur if the
    /// semaphore were closed, which this pool never does.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }

    /// True when no slot is held.
    pub fn idle(&self) -> bool {
        self.semaphore.available_permits() == self.max_concurrent
    }

    /// Wait until every in-flight task has released its slot.
    pub async fn wait_idle(&self) {
        let all = Arc::clone(&self.semaphore)
            .acquire_many_owned(self.max_concurrent as u32)
            .await
            .ok();
        drop(all);
    }

    /// Run `f` over every item with bounded concurrency. The output
    /// vector lines up with the input: a panicked task yields an `Err`
    /// entry in its slot and the rest of the batch continues.
    pub async fn map<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> Vec<Result<R, JoinError>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = items.len();
        let mut handles = Vec::with_capacity(total);

        for item in items {
            let semaphore = Arc::clone(&self.semaphore);
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                // The semaphore is never closed, so acquisition cannot
                // fail; holding the permit bounds concurrency.
                let _permit = semaphore.acquire_owned().await.ok();
                f(item).await
            }));
        }

        let mut results = Vec::with_capacity(total);
        for handle in handles {
            let result = handle.await;
            if let Err(e) = &result {
                error!(error = %e, "pooled task aborted");
            }
            results.push(result);
            debug!(completed = results.len(), total, "pool batch progress");
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn map_preserves_input_order() {
        let pool = WorkerPool::new(4);

        // Later items finish first; order must still match input.
        let results: Vec<u64> = pool
            .map((0..8u64).collect(), |i| async move {
                tokio::time::sleep(Duration::from_millis(80 - i * 10)).await;
                i * 2
            })
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn map_keeps_failed_slots_in_place() {
        let pool = WorkerPool::new(2);

        let results = pool
            .map(vec![1, 2, 3], |i| async move {
                if i == 2 {
                    panic!("task blew up");
                }
                i * 10
            })
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 10);
        assert!(results[1].is_err());
        assert_eq!(*results[2].as_ref().unwrap(), 30);
    }

    #[tokio::test]
    async fn idle_tracks_held_slots() {
        let pool = WorkerPool::new(2);
        assert!(pool.idle());

        let permit = pool.acquire_slot().await.unwrap();
        assert!(!pool.idle());

        drop(permit);
        assert!(pool.idle());
        // With every slot free this returns immediately.
        pool.wait_idle().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn map_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        pool.map((0..10).collect::<Vec<i32>>(), {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn zero_width_pool_still_makes_progress() {
        let pool = WorkerPool::new(0);
        let results: Vec<i32> = pool
            .map(vec![1, 2, 3], |i| async move { i })
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(results, vec![1, 2, 3]);
    }
}

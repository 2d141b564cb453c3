use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct QueueState {
    /// Added but not yet started
    queued: usize,
    /// Started and not yet finished
    pending: usize,
    paused: bool,
    /// Bumped by `clear`; queued jobs from an older epoch are dropped
    epoch: u64,
}

/// Bounded-concurrency job queue with pause, clear and idle tracking.
///
/// Every added job waits on its own task for a concurrency permit, so a
/// paused or saturated queue never blocks the caller of [`add`](Self::add).
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    permits: Arc<Semaphore>,
    state: watch::Sender<QueueState>,
    spacing: Duration,
    next_start: Mutex<Instant>,
}

struct PendingGuard(Arc<Inner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.state.send_modify(|s| s.pending -= 1);
    }
}

impl WorkQueue {
    /// `spacing` is the minimum delay between two job starts.
    pub fn new(concurrency: usize, spacing: Duration) -> Self {
        let (state, _) = watch::channel(QueueState::default());
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                state,
                spacing,
                next_start: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn add<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut epoch = 0;
        self.inner.state.send_modify(|s| {
            s.queued += 1;
            epoch = s.epoch;
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Some(_permit) = inner.admit(epoch).await else {
                return;
            };
            let _pending = PendingGuard(inner);
            job.await;
        });
    }

    /// Stop starting new jobs. Running jobs continue.
    pub fn pause(&self) {
        self.inner.state.send_modify(|s| s.paused = true);
    }

    pub fn resume(&self) {
        self.inner.state.send_modify(|s| s.paused = false);
    }

    /// Drop every job that has not started yet.
    pub fn clear(&self) {
        self.inner.state.send_modify(|s| s.epoch += 1);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.borrow().paused
    }

    pub fn pending(&self) -> usize {
        self.inner.state.borrow().pending
    }

    pub fn queued(&self) -> usize {
        self.inner.state.borrow().queued
    }

    /// Resolve once nothing is queued or running.
    pub async fn on_idle(&self) {
        self.wait_until(|s| s.queued == 0 && s.pending == 0).await;
    }

    /// Resolve once at most `n` jobs are running.
    pub async fn on_pending_at_most(&self, n: usize) {
        self.wait_until(|s| s.pending <= n).await;
    }

    async fn wait_until(&self, ready: impl Fn(&QueueState) -> bool) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `inner`, so the channel cannot close here
        let _ = rx.wait_for(|s| ready(s)).await;
    }
}

impl Inner {
    /// Wait for a permit while the queue is running. Moves the job from
    /// queued to pending, or returns `None` if it was cleared.
    async fn admit(&self, epoch: u64) -> Option<OwnedSemaphorePermit> {
        let mut rx = self.state.subscribe();
        loop {
            let state = match rx.wait_for(|s| !s.paused || s.epoch != epoch).await {
                Ok(state) => *state,
                Err(_) => return self.drop_queued(),
            };
            if state.epoch != epoch {
                return self.drop_queued();
            }

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return self.drop_queued();
            };

            if !self.spacing.is_zero() {
                let mut next = self.next_start.lock().await;
                tokio::time::sleep_until(*next).await;
                *next = Instant::now() + self.spacing;
            }

            let state = *self.state.borrow();
            if state.epoch != epoch {
                return self.drop_queued();
            }
            if state.paused {
                drop(permit);
                continue;
            }

            self.state.send_modify(|s| {
                s.queued -= 1;
                s.pending += 1;
            });
            return Some(permit);
        }
    }

    fn drop_queued(&self) -> Option<OwnedSemaphorePermit> {
        self.state.send_modify(|s| s.queued -= 1);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrency_limit() {
        let queue = WorkQueue::new(2, Duration::ZERO);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let done = done.clone();
            queue.add(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        queue.on_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn test_pause_holds_new_jobs() {
        let queue = WorkQueue::new(4, Duration::ZERO);
        let done = Arc::new(AtomicUsize::new(0));
        queue.pause();

        for _ in 0..3 {
            let done = done.clone();
            queue.add(async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(queue.queued(), 3);
        assert!(queue.is_paused());

        queue.resume();
        queue.on_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clear_drops_waiting_jobs() {
        let queue = WorkQueue::new(1, Duration::ZERO);
        let done = Arc::new(AtomicUsize::new(0));
        queue.pause();
        for _ in 0..5 {
            let done = done.clone();
            queue.add(async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.clear();
        queue.on_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 0);

        // Jobs added after a clear still run
        queue.resume();
        let after = done.clone();
        queue.add(async move {
            after.fetch_add(1, Ordering::SeqCst);
        });
        queue.on_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_at_most() {
        let queue = WorkQueue::new(3, Duration::ZERO);
        let (tx, rx) = flume::unbounded::<()>();
        for _ in 0..3 {
            let rx = rx.clone();
            queue.add(async move {
                let _ = rx.recv_async().await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), 3);

        tx.send(()).unwrap();
        tx.send(()).unwrap();
        queue.on_pending_at_most(1).await;
        assert!(queue.pending() <= 1);
        drop(tx);
        queue.on_idle().await;
    }

    #[tokio::test]
    async fn test_spacing_between_starts() {
        let queue = WorkQueue::new(4, Duration::from_millis(20));
        let started = Instant::now();
        for _ in 0..3 {
            queue.add(async {});
        }
        queue.on_idle().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}

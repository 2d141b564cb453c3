use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::session::MailSession;
use crate::types::error::{MinerError, Result};

/// Creates and disposes the sessions of a [`SessionPool`].
#[async_trait]
pub trait ManageSession: Send + Sync + 'static {
    async fn create(&self) -> Result<Box<dyn MailSession>>;

    /// Log out and drop a session. Must not fail.
    async fn dispose(&self, session: Box<dyn MailSession>);
}

/// Bounded pool of authenticated sessions.
///
/// A semaphore permit travels with every checked-out session, so at most
/// `max_size` sessions exist outside the idle list at any time, and
/// callers wait for a permit when the pool is saturated.
pub struct SessionPool<M: ManageSession> {
    manager: M,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn MailSession>>>,
    generation: AtomicU64,
    max_size: usize,
}

/// A session checked out of the pool.
pub struct PooledSession {
    session: Box<dyn MailSession>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = dyn MailSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl<M: ManageSession> SessionPool<M> {
    pub fn new(manager: M, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            manager,
            permits: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            max_size,
        }
    }

    /// Take an idle session or open a new one, waiting while the pool is
    /// saturated.
    pub async fn acquire(&self) -> Result<PooledSession> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MinerError::Other("session pool is closed".into()))?;

        let generation = self.generation.load(Ordering::SeqCst);
        let idle = self.lock_idle().pop();
        let session = match idle {
            Some(session) => session,
            None => {
                debug!(in_use = self.in_use(), max = self.max_size, "Opening pooled session");
                self.manager.create().await?
            }
        };

        Ok(PooledSession {
            session,
            generation,
            _permit: permit,
        })
    }

    /// Return a session. Sessions checked out before the last
    /// [`drain`](Self::drain) are disposed instead of reused.
    pub async fn release(&self, session: PooledSession) {
        let PooledSession {
            session,
            generation,
            _permit,
        } = session;

        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("Disposing session from a drained generation");
            self.manager.dispose(session).await;
            return;
        }

        let rejected = match self.idle.lock() {
            Ok(mut idle) => {
                idle.push(session);
                None
            }
            Err(_) => Some(session),
        };
        if let Some(session) = rejected {
            warn!("Session pool lock poisoned, disposing released session");
            self.manager.dispose(session).await;
        }
    }

    /// Dispose a session without returning it to the idle list.
    pub async fn destroy(&self, session: PooledSession) {
        let PooledSession {
            session, _permit, ..
        } = session;
        self.manager.dispose(session).await;
    }

    /// Dispose every idle session and retire the ones currently checked out.
    pub async fn drain(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let sessions = std::mem::take(&mut *self.lock_idle());
        if !sessions.is_empty() {
            debug!(count = sessions.len(), "Draining session pool");
        }
        for session in sessions {
            self.manager.dispose(session).await;
        }
    }

    pub fn in_use(&self) -> usize {
        self.max_size - self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn MailSession>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use std::time::Duration;

    struct FakeManager(Arc<FakeServer>);

    #[async_trait]
    impl ManageSession for FakeManager {
        async fn create(&self) -> Result<Box<dyn MailSession>> {
            self.0.open_session()
        }

        async fn dispose(&self, mut session: Box<dyn MailSession>) {
            let _ = session.logout().await;
        }
    }

    #[tokio::test]
    async fn test_pool_reuses_released_sessions() {
        let server = FakeServer::new(&[("INBOX", 1)]);
        let pool = SessionPool::new(FakeManager(server.clone()), 2);

        let first = pool.acquire().await.unwrap();
        pool.release(first).await;
        let again = pool.acquire().await.unwrap();
        assert_eq!(server.stats().connects, 1);
        assert_eq!(pool.in_use(), 1);

        pool.destroy(again).await;
        assert_eq!(server.stats().live, 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_pool_enforces_ceiling() {
        let server = FakeServer::new(&[("INBOX", 1)]);
        let pool = Arc::new(SessionPool::new(FakeManager(server.clone()), 3));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let session = pool.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release(session).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = server.stats();
        assert!(stats.max_live <= 3, "max live sessions was {}", stats.max_live);
        assert!(stats.connects <= 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_drain_retires_checked_out_sessions() {
        let server = FakeServer::new(&[("INBOX", 1)]);
        let pool = SessionPool::new(FakeManager(server.clone()), 2);

        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(idle).await;
        assert_eq!(pool.idle_count(), 1);

        pool.drain().await;
        assert_eq!(pool.idle_count(), 0);

        pool.release(held).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(server.stats().live, 0);

        // Draining an empty pool is harmless
        pool.drain().await;
    }
}

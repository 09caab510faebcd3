//! Fixed-size session pool. The pool is the throttle for the whole pipeline:
//! every feed operation, from any job, holds one of its permits.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{FeedConnector, FeedSession, TransportError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no feed connection became free within {waited:?}")]
    Exhausted { waited: Duration },
    #[error("circuit breaker is open; next probe in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
    #[error("connection pool is shut down")]
    Closed,
    #[error("could not open a feed session: {0}")]
    Connect(#[source] TransportError),
    #[error(transparent)]
    Transport(TransportError),
}

impl PoolError {
    /// The pool, not the document, refused the work. Callers back off
    /// instead of retrying.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            PoolError::Exhausted { .. } | PoolError::CircuitOpen { .. } | PoolError::Closed
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Pool-wide consecutive-failure breaker. Open fails fast for the cooldown,
/// then admits exactly one probe; the probe's outcome closes or reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn admit(&self) -> Result<Admission, PoolError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.config.cooldown {
                    return Err(PoolError::CircuitOpen {
                        retry_in: self.config.cooldown - elapsed,
                    });
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                info!("circuit breaker half-open, admitting probe");
                Ok(Admission::Probe)
            }
            BreakerState::HalfOpen if inner.probe_in_flight => Err(PoolError::CircuitOpen {
                retry_in: Duration::ZERO,
            }),
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!("circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            warn!(
                failures = inner.consecutive_failures,
                cooldown = ?self.config.cooldown,
                "circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
        }
    }

    /// A probe ended without a verdict (the caller dropped it); let the next
    /// acquire probe instead.
    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub acquire_timeout: Duration,
    /// Idle sessions older than this are probed before reuse.
    pub keepalive_after: Duration,
    pub breaker: BreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout: Duration::from_secs(30),
            keepalive_after: Duration::from_secs(60),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub opened: u64,
    pub discarded: u64,
    pub breaker: BreakerState,
}

struct IdleSession {
    session: Box<dyn FeedSession>,
    returned_at: Instant,
}

struct PoolInner {
    connector: Arc<dyn FeedConnector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
    breaker: CircuitBreaker,
    opened: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleSession>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn FeedConnector>, config: PoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::with_capacity(size)),
                breaker: CircuitBreaker::new(config.breaker),
                config: PoolConfig { size, ..config },
                opened: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.inner.permits.available_permits();
        PoolStats {
            size: self.inner.config.size,
            in_use: self.inner.config.size.saturating_sub(available),
            idle: self.inner.idle().len(),
            opened: self.inner.opened.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            breaker: self.inner.breaker.state(),
        }
    }

    /// Wait for a free slot and hand out a live session. Fails fast while the
    /// breaker is open and with `Exhausted` after the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let inner = &self.inner;
        let admission = inner.breaker.admit()?;
        let abandon = |err: PoolError| {
            if admission == Admission::Probe {
                inner.breaker.abandon_probe();
            }
            err
        };

        let waited = inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(waited, inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(abandon(PoolError::Closed)),
            Err(_) => return Err(abandon(PoolError::Exhausted { waited })),
        };

        let session = match self.reuse_idle().await {
            Some(session) => session,
            None => match inner.connector.connect().await {
                Ok(session) => {
                    inner.opened.fetch_add(1, Ordering::Relaxed);
                    session
                }
                Err(err) => {
                    warn!(error = %err, "opening feed session failed");
                    inner.breaker.record_failure();
                    return Err(PoolError::Connect(err));
                }
            },
        };

        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            session: Some(session),
            in_flight: false,
            probe: admission == Admission::Probe,
            _permit: permit,
        })
    }

    async fn reuse_idle(&self) -> Option<Box<dyn FeedSession>> {
        loop {
            let IdleSession {
                mut session,
                returned_at,
            } = self.inner.idle().pop()?;
            if returned_at.elapsed() < self.inner.config.keepalive_after {
                return Some(session);
            }
            match session.probe().await {
                Ok(()) => return Some(session),
                Err(err) => {
                    debug!(error = %err, "stale idle session failed keep-alive probe");
                    self.inner.discarded.fetch_add(1, Ordering::Relaxed);
                    session.close().await;
                }
            }
        }
    }

    /// Explicit return; dropping the guard does the same.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Run `op` on a pooled connection and feed its outcome to the breaker.
    /// A missing file is a healthy reply; every other transport error counts
    /// as a failure.
    pub async fn with_circuit_breaker<T, F, Fut>(&self, op: F) -> Result<T, PoolError>
    where
        F: FnOnce(PooledConnection) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let conn = self.acquire().await?;
        match op(conn).await {
            Ok(value) => {
                self.inner.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.is_connection_failure() {
                    self.inner.breaker.record_failure();
                } else {
                    self.inner.breaker.record_success();
                }
                Err(PoolError::Transport(err))
            }
        }
    }

    /// Refuse new acquires and quit idle sessions. Checked-out sessions are
    /// dropped when their guards are.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let idle: Vec<IdleSession> = std::mem::take(&mut *self.inner.idle());
        let count = idle.len();
        for mut entry in idle {
            entry.session.close().await;
        }
        info!(closed = count, "connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

/// A checked-out session. Returned to the idle list on drop unless it was
/// discarded or dropped mid-operation.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    session: Option<Box<dyn FeedSession>>,
    in_flight: bool,
    probe: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        self.in_flight = true;
        let result = session.retrieve(path).await;
        self.in_flight = false;
        result
    }

    pub async fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        self.in_flight = true;
        let result = session.list(dir).await;
        self.in_flight = false;
        result
    }

    /// Drop the session instead of returning it; the slot is refilled with a
    /// fresh connection on the next acquire.
    pub fn discard(mut self) {
        if self.session.take().is_some() {
            self.pool.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.probe {
            self.pool.breaker.abandon_probe();
        }
        let Some(session) = self.session.take() else {
            return;
        };
        if self.in_flight || self.pool.permits.is_closed() {
            self.pool.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.pool.idle().push(IdleSession {
            session,
            returned_at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFeed;

    fn pool(feed: &MemoryFeed, size: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(feed.clone()),
            PoolConfig {
                size,
                acquire_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn sessions_are_reused_after_release() {
        let feed = MemoryFeed::new();
        let pool = pool(&feed, 2);

        let first = pool.acquire().await.unwrap();
        pool.release(first);
        let _second = pool.acquire().await.unwrap();

        assert_eq!(feed.connections_opened(), 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_every_slot_is_held() {
        let feed = MemoryFeed::new();
        let pool = pool(&feed, 1);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(err.is_backpressure());
    }

    #[tokio::test]
    async fn discarded_sessions_are_replaced() {
        let feed = MemoryFeed::new();
        let pool = pool(&feed, 1);

        pool.acquire().await.unwrap().discard();
        let _fresh = pool.acquire().await.unwrap();

        assert_eq!(feed.connections_opened(), 2);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_then_admits_a_single_probe() {
        let feed = MemoryFeed::new();
        feed.refuse_connections(5);
        let pool = ConnectionPool::new(
            Arc::new(feed.clone()),
            PoolConfig {
                size: 2,
                breaker: BreakerConfig {
                    failure_threshold: 5,
                    cooldown: Duration::from_secs(30),
                },
                ..PoolConfig::default()
            },
        );

        for _ in 0..5 {
            assert!(matches!(pool.acquire().await, Err(PoolError::Connect(_))));
        }
        assert_eq!(pool.breaker().state(), BreakerState::Open);
        assert!(matches!(pool.acquire().await, Err(PoolError::CircuitOpen { .. })));
        assert_eq!(feed.connections_opened(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = pool.acquire().await.unwrap();
        assert_eq!(pool.breaker().state(), BreakerState::HalfOpen);
        assert!(matches!(pool.acquire().await, Err(PoolError::CircuitOpen { .. })));

        pool.breaker().record_success();
        drop(probe);
        assert_eq!(pool.breaker().state(), BreakerState::Closed);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_the_breaker() {
        let feed = MemoryFeed::new();
        feed.refuse_connections(6);
        let pool = ConnectionPool::new(
            Arc::new(feed.clone()),
            PoolConfig {
                size: 1,
                ..PoolConfig::default()
            },
        );
        for _ in 0..5 {
            let _ = pool.acquire().await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(pool.acquire().await, Err(PoolError::Connect(_))));
        assert_eq!(pool.breaker().state(), BreakerState::Open);
        assert!(matches!(pool.acquire().await, Err(PoolError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn not_found_does_not_count_against_the_breaker() {
        let feed = MemoryFeed::new();
        let pool = pool(&feed, 1);
        for _ in 0..10 {
            let result = pool
                .with_circuit_breaker(|mut conn| async move { conn.retrieve("/missing.json").await })
                .await;
            assert!(matches!(
                result,
                Err(PoolError::Transport(TransportError::NotFound(_)))
            ));
        }
        assert_eq!(pool.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work_and_quits_idle_sessions() {
        let feed = MemoryFeed::new();
        let pool = pool(&feed, 2);
        pool.release(pool.acquire().await.unwrap());

        pool.shutdown().await;

        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        assert_eq!(feed.live_sessions(), 0);
    }
}

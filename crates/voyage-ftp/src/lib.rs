//! Feed transport: FTP sessions, the shared connection pool with its circuit
//! breaker, single-document fetches and mega-batch bulk downloads.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod bulk;
pub mod fetch;
pub mod ftp;
pub mod memory;
pub mod pool;

pub use bulk::{BulkConfig, BulkDownloader, BulkResult, FailureKind, FailureRecord, MEGA_BATCH_SIZE};
pub use fetch::{DocumentFetcher, FetchError, RetryPolicy};
pub use ftp::{FtpConfig, FtpConnector};
pub use memory::MemoryFeed;
pub use pool::{
    BreakerConfig, BreakerState, CircuitBreaker, ConnectionPool, PoolConfig, PoolError, PoolStats,
    PooledConnection,
};

pub const CRATE_NAME: &str = "voyage-ftp";

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("{0} does not exist on the feed")]
    NotFound(String),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("login rejected: {0}")]
    Auth(String),
    #[error("unexpected server reply: {0}")]
    Protocol(String),
    #[error("no reply within {after:?}")]
    Timeout { after: Duration },
    #[error("session already closed")]
    Closed,
}

impl TransportError {
    /// Failures that say the session or server is unhealthy, as opposed to
    /// the requested file. These count toward the circuit breaker and cost
    /// the pooled session.
    pub fn is_connection_failure(&self) -> bool {
        !matches!(self, TransportError::NotFound(_))
    }
}

/// Opens authenticated sessions against the feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, TransportError>;
}

/// One logged-in control connection. Not shareable; the pool hands it to
/// one task at a time.
#[async_trait]
pub trait FeedSession: Send {
    /// Whole file contents. A missing file is `TransportError::NotFound`.
    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, TransportError>;

    /// Entry names (last path segment) directly under `dir`. A missing
    /// directory lists as empty.
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError>;

    /// Cheap liveness check (`NOOP`).
    async fn probe(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self);
}

//! Single-document fetch over one pooled connection.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use voyage_feed::{DocumentError, ParsedDocument};

use crate::pool::{ConnectionPool, PoolError};
use crate::TransportError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
    /// Upper bound on a single attempt, including the transfer.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0} is not on the feed")]
    NotFound(String),
    #[error("downloading {path} failed after {attempts} attempts: {source}")]
    Download {
        path: String,
        attempts: usize,
        #[source]
        source: TransportError,
    },
    #[error("{path} is not a readable document: {source}")]
    Parse {
        path: String,
        #[source]
        source: DocumentError,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl FetchError {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, FetchError::Pool(err) if err.is_backpressure())
    }
}

#[derive(Clone)]
pub struct DocumentFetcher {
    pool: ConnectionPool,
    retry: RetryPolicy,
}

impl DocumentFetcher {
    pub fn new(pool: ConnectionPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Download, repair and parse one document.
    pub async fn fetch(&self, path: &str) -> Result<ParsedDocument, FetchError> {
        let bytes = self.fetch_bytes(path).await?;
        ParsedDocument::from_bytes(path, &bytes).map_err(|source| FetchError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        self.with_retries(path, || self.retrieve_once(path))
            .instrument(info_span!("feed_fetch", path))
            .await
    }

    /// Directory listing with the same retry and breaker accounting.
    pub async fn list(&self, dir: &str) -> Result<Vec<String>, FetchError> {
        self.with_retries(dir, || self.list_once(dir))
            .instrument(info_span!("feed_list", dir))
            .await
    }

    async fn retrieve_once(&self, path: &str) -> Result<Vec<u8>, PoolError> {
        let limit = self.retry.timeout;
        self.pool
            .with_circuit_breaker(|mut conn| async move {
                let result = match tokio::time::timeout(limit, conn.retrieve(path)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout { after: limit }),
                };
                if matches!(&result, Err(err) if err.is_connection_failure()) {
                    conn.discard();
                }
                result
            })
            .await
    }

    async fn list_once(&self, dir: &str) -> Result<Vec<String>, PoolError> {
        let limit = self.retry.timeout;
        self.pool
            .with_circuit_breaker(|mut conn| async move {
                let result = match tokio::time::timeout(limit, conn.list(dir)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout { after: limit }),
                };
                if result.is_err() {
                    conn.discard();
                }
                result
            })
            .await
    }

    /// Transient transport failures are retried with a fixed delay; a missing
    /// file and pool backpressure return at once.
    async fn with_retries<T, F, Fut>(&self, path: &str, mut attempt: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut last = TransportError::Closed;
        for n in 1..=attempts {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(PoolError::Transport(TransportError::NotFound(_))) => {
                    return Err(FetchError::NotFound(path.to_string()))
                }
                Err(PoolError::Transport(err)) | Err(PoolError::Connect(err)) => {
                    debug!(attempt = n, error = %err, "feed attempt failed");
                    last = err;
                    if n < attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
                Err(err) => return Err(FetchError::Pool(err)),
            }
        }
        warn!(path, attempts, error = %last, "giving up on feed path");
        Err(FetchError::Download {
            path: path.to_string(),
            attempts,
            source: last,
        })
    }
}

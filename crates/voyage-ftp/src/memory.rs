//! In-memory feed for tests and dry runs: a path → bytes map behind the same
//! connector/session traits, with failure injection, artificial latency and
//! gauges for concurrent use.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::{FeedConnector, FeedSession, TransportError};

#[derive(Default)]
struct FeedState {
    files: BTreeMap<String, Vec<u8>>,
    transient_failures: HashMap<String, usize>,
    stalled: BTreeSet<String>,
    refused_connections: usize,
    latency: Duration,
}

#[derive(Default)]
struct Gauges {
    live_sessions: AtomicUsize,
    max_live_sessions: AtomicUsize,
    active_transfers: AtomicUsize,
    max_active_transfers: AtomicUsize,
    connections_opened: AtomicUsize,
    retrievals: AtomicUsize,
}

fn raise(current: &AtomicUsize, max: &AtomicUsize) {
    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
    max.fetch_max(now, Ordering::SeqCst);
}

#[derive(Clone, Default)]
pub struct MemoryFeed {
    state: Arc<Mutex<FeedState>>,
    gauges: Arc<Gauges>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.state().files.insert(path.into(), bytes.into());
    }

    pub fn remove(&self, path: &str) -> bool {
        self.state().files.remove(path).is_some()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    /// The next `times` retrievals of `path` fail with a connection error.
    pub fn fail_next(&self, path: impl Into<String>, times: usize) {
        self.state().transient_failures.insert(path.into(), times);
    }

    /// Retrievals of `path` never complete.
    pub fn stall(&self, path: impl Into<String>) {
        self.state().stalled.insert(path.into());
    }

    /// The next `times` connection attempts are refused.
    pub fn refuse_connections(&self, times: usize) {
        self.state().refused_connections = times;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn connections_opened(&self) -> usize {
        self.gauges.connections_opened.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.gauges.live_sessions.load(Ordering::SeqCst)
    }

    pub fn max_live_sessions(&self) -> usize {
        self.gauges.max_live_sessions.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_transfers(&self) -> usize {
        self.gauges.max_active_transfers.load(Ordering::SeqCst)
    }

    pub fn retrievals(&self) -> usize {
        self.gauges.retrievals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedConnector for MemoryFeed {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, TransportError> {
        {
            let mut state = self.state();
            if state.refused_connections > 0 {
                state.refused_connections -= 1;
                return Err(TransportError::Connection("connection refused".into()));
            }
        }
        self.gauges.connections_opened.fetch_add(1, Ordering::SeqCst);
        raise(&self.gauges.live_sessions, &self.gauges.max_live_sessions);
        Ok(Box::new(MemorySession {
            feed: self.clone(),
            open: true,
        }))
    }
}

struct MemorySession {
    feed: MemoryFeed,
    open: bool,
}

/// Counts a transfer as active until dropped, including on cancellation.
struct TransferGuard<'a>(&'a Gauges);

impl<'a> TransferGuard<'a> {
    fn enter(gauges: &'a Gauges) -> Self {
        raise(&gauges.active_transfers, &gauges.max_active_transfers);
        Self(gauges)
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.0.active_transfers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FeedSession for MemorySession {
    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let gauges = Arc::clone(&self.feed.gauges);
        let _transfer = TransferGuard::enter(&gauges);
        gauges.retrievals.fetch_add(1, Ordering::SeqCst);

        let (latency, stalled) = {
            let state = self.feed.state();
            (state.latency, state.stalled.contains(path))
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.feed.state();
        if let Some(remaining) = state.transient_failures.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Connection(format!("injected failure on {path}")));
            }
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    async fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let state = self.feed.state();
        let names: BTreeSet<String> = state
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn probe(&mut self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.feed.gauges.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_direct_children_only() {
        let feed = MemoryFeed::new();
        feed.insert("/2025/05/22/231/345.json", "{}");
        feed.insert("/2025/05/22/232/346.json", "{}");
        feed.insert("/2025/05/7/1/1.json", "{}");

        let mut session = feed.connect().await.unwrap();
        assert_eq!(session.list("/2025/05").await.unwrap(), vec!["22", "7"]);
        assert_eq!(session.list("/2025/05/22/").await.unwrap(), vec!["231", "232"]);
        assert!(session.list("/2030/01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let feed = MemoryFeed::new();
        feed.insert("/a.json", "{}");
        feed.fail_next("/a.json", 1);

        let mut session = feed.connect().await.unwrap();
        assert!(matches!(
            session.retrieve("/a.json").await,
            Err(TransportError::Connection(_))
        ));
        assert_eq!(session.retrieve("/a.json").await.unwrap(), b"{}".to_vec());
        assert!(matches!(
            session.retrieve("/b.json").await,
            Err(TransportError::NotFound(_))
        ));
    }
}

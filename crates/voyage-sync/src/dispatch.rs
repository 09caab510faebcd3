//! Webhook intake: record the event, pick a processing mode, run the job in
//! the background. At most one line job runs per feed line; events arriving
//! while it runs are deferred and coalesced into a single follow-up run.
//!
//! Slots and job requests carry the feed line id, the one that names FTP
//! directories. The catalog id from the mapping table is only recorded on
//! the event; the upserter applies it when rows are written.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;
use voyage_core::{LineId, WebhookEvent, WebhookEventType, WebhookStatus};

use crate::config::LineMappings;
use crate::job::{JobKind, JobRequest, JobRunner, JobStatus, JobSummary};
use crate::notify::NotificationSink;
use crate::store::{CatalogStore, StoreError};

/// Inbound webhook body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEventType,
    #[serde(alias = "lineId", alias = "line_id")]
    pub lineid: LineId,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Realtime,
    Bulk,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub job_id: Uuid,
    pub event_id: Uuid,
    pub message: String,
    pub processing_mode: ProcessingMode,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("line id must be positive, got {0}")]
    InvalidLine(LineId),
    #[error("paths must not contain empty entries")]
    EmptyPath,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// The request itself was unacceptable, as opposed to a server fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, DispatchError::InvalidLine(_) | DispatchError::EmptyPath)
    }
}

#[derive(Debug, Clone, Copy)]
struct DeferredEvent {
    event_id: Uuid,
    job_id: Uuid,
}

struct LineSlot {
    running: Uuid,
    deferred: Vec<DeferredEvent>,
}

struct Inner {
    store: Arc<dyn CatalogStore>,
    runner: Arc<dyn JobRunner>,
    notifier: Arc<dyn NotificationSink>,
    mappings: LineMappings,
    fast_path_limit: usize,
    slots: Mutex<HashMap<LineId, LineSlot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        runner: Arc<dyn JobRunner>,
        notifier: Arc<dyn NotificationSink>,
        mappings: LineMappings,
        fast_path_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                notifier,
                mappings,
                fast_path_limit,
                slots: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.inner.store
    }

    pub fn mappings(&self) -> &LineMappings {
        &self.inner.mappings
    }

    /// Record the event and schedule its work. Returns before any feed I/O.
    pub async fn dispatch(&self, payload: WebhookPayload) -> Result<WebhookAck, DispatchError> {
        if payload.lineid <= 0 {
            return Err(DispatchError::InvalidLine(payload.lineid));
        }
        if payload.paths.iter().any(|p| p.trim().is_empty()) {
            return Err(DispatchError::EmptyPath);
        }

        let line_id = payload.lineid;
        let catalog_line = match self.inner.mappings.lookup(line_id) {
            Some(internal) => internal,
            None => {
                info!(
                    external_line_id = line_id,
                    mappings_version = self.inner.mappings.version(),
                    "line id not in mapping table; using it unchanged"
                );
                line_id
            }
        };

        let event = WebhookEvent {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            external_line_id: line_id,
            line_id: catalog_line,
            event_type: payload.event,
            currency: payload.currency.clone(),
            paths: payload.paths.clone(),
            received_at: Utc::now(),
            status: WebhookStatus::Pending,
            processed_at: None,
            error: None,
        };
        self.inner.store.record_webhook_event(&event).await?;

        let realtime =
            !payload.paths.is_empty() && payload.paths.len() <= self.inner.fast_path_limit;
        if realtime {
            let inner = Arc::clone(&self.inner);
            let request = JobRequest::Paths {
                line_id,
                paths: payload.paths,
            };
            let (job_id, event_id) = (event.job_id, event.id);
            self.spawn(async move { inner.execute(job_id, request, &[event_id]).await });
            info!(line_id, %job_id, "fast-path sync scheduled");
            return Ok(WebhookAck {
                job_id,
                event_id,
                message: format!("syncing {} documents for line {line_id}", event.paths.len()),
                processing_mode: ProcessingMode::Realtime,
            });
        }

        let deferred = DeferredEvent {
            event_id: event.id,
            job_id: event.job_id,
        };
        if self.claim_line(line_id, event.job_id, Some(deferred)) {
            self.spawn_line_jobs(line_id, event.job_id, None, vec![event.id]);
            info!(line_id, job_id = %event.job_id, "line sync scheduled");
            Ok(WebhookAck {
                job_id: event.job_id,
                event_id: event.id,
                message: format!("line {line_id} sync started"),
                processing_mode: ProcessingMode::Bulk,
            })
        } else {
            info!(line_id, event_id = %event.id, "line sync already running; event deferred");
            Ok(WebhookAck {
                job_id: event.job_id,
                event_id: event.id,
                message: format!("line {line_id} sync already running; queued for a follow-up run"),
                processing_mode: ProcessingMode::Deferred,
            })
        }
    }

    /// Start a line crawl unless one is already running. Used by the
    /// scheduler, which has no event to defer.
    pub fn schedule_line(&self, line_id: LineId) -> Option<Uuid> {
        let job_id = Uuid::new_v4();
        if !self.claim_line(line_id, job_id, None) {
            info!(line_id, "line sync already running; scheduled crawl skipped");
            return None;
        }
        self.spawn_line_jobs(line_id, job_id, None, Vec::new());
        Some(job_id)
    }

    /// Run a line crawl in the caller's task while holding the line's slot.
    /// `Ok(None)` when the line is already syncing. Events deferred during
    /// the run get their follow-up in the background.
    pub async fn run_line_now(
        &self,
        line_id: LineId,
        start: Option<(i32, u32)>,
    ) -> anyhow::Result<Option<JobSummary>> {
        let job_id = Uuid::new_v4();
        if !self.claim_line(line_id, job_id, None) {
            info!(line_id, "line sync already running; manual run refused");
            return Ok(None);
        }
        let result = self
            .inner
            .runner
            .run(job_id, JobRequest::Line { line_id, start })
            .await;
        if let Ok(summary) = &result {
            self.inner.notifier.job_finished(summary).await;
        }
        if let Some(deferred) = self.inner.next_deferred(line_id) {
            let events = deferred.iter().map(|d| d.event_id).collect();
            self.spawn_line_jobs(line_id, deferred[0].job_id, None, events);
        }
        result.map(Some)
    }

    /// Lines with a running line job.
    pub fn running_lines(&self) -> Vec<LineId> {
        let mut lines: Vec<LineId> = self.inner.slots().keys().copied().collect();
        lines.sort_unstable();
        lines
    }

    pub fn running_job(&self, line_id: LineId) -> Option<Uuid> {
        self.inner.slots().get(&line_id).map(|slot| slot.running)
    }

    pub fn deferred_events(&self, line_id: LineId) -> usize {
        self.inner
            .slots()
            .get(&line_id)
            .map_or(0, |slot| slot.deferred.len())
    }

    /// Wait for every spawned job, including follow-ups, to finish.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(error = %err, "dispatcher task panicked");
                }
            }
        }
    }

    /// `true` when the caller now owns the line. Otherwise the event, if
    /// any, joins the deferred list.
    fn claim_line(&self, line_id: LineId, job_id: Uuid, event: Option<DeferredEvent>) -> bool {
        let mut slots = self.inner.slots();
        match slots.get_mut(&line_id) {
            Some(slot) => {
                slot.deferred.extend(event);
                false
            }
            None => {
                slots.insert(
                    line_id,
                    LineSlot {
                        running: job_id,
                        deferred: Vec::new(),
                    },
                );
                true
            }
        }
    }

    fn spawn_line_jobs(
        &self,
        line_id: LineId,
        job_id: Uuid,
        start: Option<(i32, u32)>,
        events: Vec<Uuid>,
    ) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move { inner.run_line_jobs(line_id, job_id, start, events).await });
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.inner.tasks();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<LineId, LineSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the line job, then one coalesced follow-up per batch of events
    /// that arrived meanwhile, until none are left. Follow-ups always start
    /// at the current month.
    async fn run_line_jobs(
        &self,
        line_id: LineId,
        mut job_id: Uuid,
        mut start: Option<(i32, u32)>,
        mut events: Vec<Uuid>,
    ) {
        loop {
            self.execute(job_id, JobRequest::Line { line_id, start }, &events).await;

            let Some(deferred) = self.next_deferred(line_id) else {
                return;
            };
            job_id = deferred[0].job_id;
            start = None;
            events = deferred.iter().map(|d| d.event_id).collect();
            info!(line_id, %job_id, coalesced = events.len(), "starting follow-up line sync");
        }
    }

    /// Hand the slot to the deferred events, or release it when there are
    /// none.
    fn next_deferred(&self, line_id: LineId) -> Option<Vec<DeferredEvent>> {
        let mut slots = self.slots();
        match slots.get_mut(&line_id) {
            Some(slot) if !slot.deferred.is_empty() => {
                let deferred = std::mem::take(&mut slot.deferred);
                slot.running = deferred[0].job_id;
                Some(deferred)
            }
            _ => {
                slots.remove(&line_id);
                None
            }
        }
    }

    async fn execute(&self, job_id: Uuid, request: JobRequest, events: &[Uuid]) {
        for id in events {
            self.transition(*id, WebhookStatus::Processing, None).await;
        }

        let line_id = request.line_id();
        match self.runner.run(job_id, request).await {
            Ok(summary) => {
                let error = match &summary.status {
                    JobStatus::Completed => None,
                    JobStatus::Aborted { reason } => Some(reason.clone()),
                };
                let status = if error.is_none() {
                    WebhookStatus::Completed
                } else {
                    WebhookStatus::Failed
                };
                for id in events {
                    self.transition(*id, status, error.as_deref()).await;
                }
                if summary.kind == JobKind::Line {
                    self.notifier.job_finished(&summary).await;
                }
            }
            Err(err) => {
                error!(line_id, %job_id, error = %format!("{err:#}"), "sync job failed");
                let message = format!("{err:#}");
                for id in events {
                    self.transition(*id, WebhookStatus::Failed, Some(&message)).await;
                }
            }
        }
    }

    async fn transition(&self, id: Uuid, status: WebhookStatus, error: Option<&str>) {
        if let Err(err) = self.store.set_webhook_status(id, status, error).await {
            warn!(event_id = %id, status = status.as_str(), error = %err, "webhook status update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::notify::LogNotifier;
    use crate::progress::SyncStats;
    use crate::store::MemoryCatalogStore;

    /// Blocks every job until the test hands out a permit.
    struct GatedRunner {
        gate: Semaphore,
        requests: Mutex<Vec<JobRequest>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedRunner {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                requests: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn started(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(&self, job_id: Uuid, request: JobRequest) -> anyhow::Result<JobSummary> {
            self.requests.lock().unwrap().push(request.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(JobSummary {
                job_id,
                line_id: request.line_id(),
                kind: match request {
                    JobRequest::Line { .. } => JobKind::Line,
                    JobRequest::Paths { .. } => JobKind::Paths,
                },
                status: JobStatus::Completed,
                stats: SyncStats::default(),
                discovered: 0,
                resumed: 0,
                deactivated: 0,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            })
        }
    }

    fn dispatcher(runner: Arc<GatedRunner>, store: Arc<MemoryCatalogStore>) -> WebhookDispatcher {
        WebhookDispatcher::new(
            store,
            runner,
            Arc::new(LogNotifier),
            LineMappings::new(1, [(1022, 22)]),
            50,
        )
    }

    fn line_event(lineid: LineId) -> WebhookPayload {
        WebhookPayload {
            event: WebhookEventType::LinePricingUpdated,
            lineid,
            currency: Some("USD".into()),
            timestamp: None,
            paths: Vec::new(),
        }
    }

    async fn until(mut check: impl FnMut() -> bool) {
        while !check() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn second_event_for_a_busy_line_is_deferred_and_coalesced() {
        let runner = Arc::new(GatedRunner::new());
        let store = Arc::new(MemoryCatalogStore::new());
        let dispatcher = dispatcher(Arc::clone(&runner), Arc::clone(&store));

        let first = dispatcher.dispatch(line_event(22)).await.unwrap();
        assert_eq!(first.processing_mode, ProcessingMode::Bulk);
        until(|| runner.started() == 1).await;

        let second = dispatcher.dispatch(line_event(22)).await.unwrap();
        let third = dispatcher.dispatch(line_event(22)).await.unwrap();
        assert_eq!(second.processing_mode, ProcessingMode::Deferred);
        assert_eq!(third.processing_mode, ProcessingMode::Deferred);
        assert_eq!(runner.started(), 1);
        assert_eq!(dispatcher.running_lines(), vec![22]);
        assert_eq!(dispatcher.running_job(22), Some(first.job_id));
        assert_eq!(dispatcher.deferred_events(22), 2);
        let pending = store.webhook_event(second.event_id).await.unwrap().unwrap();
        assert_eq!(pending.status, WebhookStatus::Pending);

        runner.gate.add_permits(1);
        until(|| runner.started() == 2).await;
        assert_eq!(dispatcher.deferred_events(22), 0);
        assert_eq!(dispatcher.running_job(22), Some(second.job_id));

        runner.gate.add_permits(1);
        dispatcher.wait_idle().await;

        assert_eq!(runner.started(), 2);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert!(dispatcher.running_lines().is_empty());
        for ack in [&first, &second, &third] {
            let event = store.webhook_event(ack.event_id).await.unwrap().unwrap();
            assert_eq!(event.status, WebhookStatus::Completed);
            assert!(event.processed_at.is_some());
        }
    }

    #[tokio::test]
    async fn short_path_lists_take_the_fast_path() {
        let runner = Arc::new(GatedRunner::new());
        runner.gate.add_permits(10);
        let store = Arc::new(MemoryCatalogStore::new());
        let dispatcher = dispatcher(Arc::clone(&runner), Arc::clone(&store));

        let mut payload = line_event(1022);
        payload.event = WebhookEventType::LivePricingUpdated;
        payload.paths = vec!["/2025/05/1022/231/345.json".into()];
        let ack = dispatcher.dispatch(payload).await.unwrap();
        dispatcher.wait_idle().await;

        assert_eq!(ack.processing_mode, ProcessingMode::Realtime);
        let requests = runner.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![JobRequest::Paths {
                line_id: 1022,
                paths: vec!["/2025/05/1022/231/345.json".into()],
            }]
        );
        let event = store.webhook_event(ack.event_id).await.unwrap().unwrap();
        assert_eq!((event.external_line_id, event.line_id), (1022, 22));
        assert_eq!(event.status, WebhookStatus::Completed);
    }

    #[tokio::test]
    async fn long_path_lists_fall_back_to_a_line_job() {
        let runner = Arc::new(GatedRunner::new());
        runner.gate.add_permits(10);
        let store = Arc::new(MemoryCatalogStore::new());
        let dispatcher = dispatcher(Arc::clone(&runner), store);

        let mut payload = line_event(7);
        payload.paths = (0..51).map(|i| format!("/2025/05/7/1/{i}.json")).collect();
        let ack = dispatcher.dispatch(payload).await.unwrap();
        dispatcher.wait_idle().await;

        assert_eq!(ack.processing_mode, ProcessingMode::Bulk);
        assert_eq!(
            runner.requests.lock().unwrap().clone(),
            vec![JobRequest::Line {
                line_id: 7,
                start: None
            }]
        );
    }

    #[tokio::test]
    async fn webhook_and_scheduler_share_the_feed_line_slot() {
        let runner = Arc::new(GatedRunner::new());
        let store = Arc::new(MemoryCatalogStore::new());
        let dispatcher = dispatcher(Arc::clone(&runner), Arc::clone(&store));

        let ack = dispatcher.dispatch(line_event(1022)).await.unwrap();
        assert_eq!(ack.processing_mode, ProcessingMode::Bulk);
        until(|| runner.started() == 1).await;

        assert!(dispatcher.schedule_line(1022).is_none());
        assert_eq!(dispatcher.running_lines(), vec![1022]);
        assert_eq!(dispatcher.running_job(1022), Some(ack.job_id));

        runner.gate.add_permits(1);
        dispatcher.wait_idle().await;
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(
            runner.requests.lock().unwrap().clone(),
            vec![JobRequest::Line {
                line_id: 1022,
                start: None
            }]
        );
        let event = store.webhook_event(ack.event_id).await.unwrap().unwrap();
        assert_eq!((event.external_line_id, event.line_id), (1022, 22));
    }

    #[tokio::test]
    async fn manual_runs_hold_the_line_slot() {
        let runner = Arc::new(GatedRunner::new());
        let store = Arc::new(MemoryCatalogStore::new());
        let dispatcher = dispatcher(Arc::clone(&runner), Arc::clone(&store));

        assert!(dispatcher.schedule_line(22).is_some());
        until(|| runner.started() == 1).await;
        assert!(dispatcher.run_line_now(22, Some((2025, 5))).await.unwrap().is_none());
        runner.gate.add_permits(1);
        dispatcher.wait_idle().await;

        let manual = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run_line_now(22, Some((2025, 5))).await })
        };
        until(|| runner.started() == 2).await;
        assert_eq!(dispatcher.running_lines(), vec![22]);
        let deferred = dispatcher.dispatch(line_event(22)).await.unwrap();
        assert_eq!(deferred.processing_mode, ProcessingMode::Deferred);

        runner.gate.add_permits(2);
        let summary = manual.await.unwrap().unwrap().unwrap();
        assert_eq!(summary.line_id, 22);
        dispatcher.wait_idle().await;

        assert_eq!(runner.started(), 3);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(
            runner.requests.lock().unwrap()[1],
            JobRequest::Line {
                line_id: 22,
                start: Some((2025, 5))
            }
        );
        let event = store.webhook_event(deferred.event_id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Completed);
        assert!(dispatcher.running_lines().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_payloads_without_recording() {
        let runner = Arc::new(GatedRunner::new());
        let store = Arc::new(MemoryCatalogStore::new());
        let dispatcher = dispatcher(runner, Arc::clone(&store));

        let err = dispatcher.dispatch(line_event(0)).await.unwrap_err();
        assert!(err.is_rejection());

        let mut payload = line_event(22);
        payload.paths = vec![" ".into()];
        assert!(matches!(
            dispatcher.dispatch(payload).await,
            Err(DispatchError::EmptyPath)
        ));
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn scheduled_crawls_skip_busy_lines() {
        let runner = Arc::new(GatedRunner::new());
        let store = Arc::new(MemoryCatalogStore::new());
        let dispatcher = dispatcher(Arc::clone(&runner), store);

        assert!(dispatcher.schedule_line(22).is_some());
        assert!(dispatcher.schedule_line(22).is_none());
        runner.gate.add_permits(1);
        dispatcher.wait_idle().await;
        assert_eq!(runner.started(), 1);
    }
}

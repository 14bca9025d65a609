//! Request lifecycle coordinator: optimistic transitions over a local cache,
//! reconciled against the store by realtime pushes and scheduled refetches.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use svcreq_core::{
    plan_transition, BucketPolicy, ChangeEvent, NewServiceRequest, NotificationDraft,
    RequestActions, RequestBoard, RequestEvent, RequestStatus, Role, ServiceRequest,
    TransitionError, TransitionPlan,
};
use svcreq_storage::{
    NotificationSink, RealtimeChannel, RealtimeSignal, RequestFilter, RequestStore, RestStoreConfig,
    StoreError, Subscription, Topic,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};

mod cache;

pub use cache::{CacheRollback, QueryKey, RequestCache};

pub const CRATE_NAME: &str = "svcreq-sync";

/// Upper bound on `near_start_hours`: one year.
const MAX_NEAR_START_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub near_start_hours: i64,
    pub utc_offset_minutes: i32,
    pub refetch_enabled: bool,
    pub refetch_cron: String,
    pub rest_url: String,
    pub rest_api_key: Option<String>,
    pub http_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            near_start_hours: 5,
            utc_offset_minutes: 8 * 60,
            refetch_enabled: false,
            refetch_cron: "0 */5 * * * *".to_string(),
            rest_url: "http://localhost:54321".to_string(),
            rest_api_key: None,
            http_timeout_secs: 20,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults, then the YAML file named by `SVCREQ_CONFIG`, then `SVCREQ_*` variables.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var("SVCREQ_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text).context("decoding coordinator config")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that cannot be turned into a bucket policy or a scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.near_start_window().is_none() {
            bail!(
                "near_start_hours must be between 0 and {MAX_NEAR_START_HOURS}, got {}",
                self.near_start_hours
            );
        }
        if self.refetch_enabled && self.refetch_cron.trim().is_empty() {
            bail!("refetch_cron must be set when refetch is enabled");
        }
        Ok(())
    }

    /// Unparseable numeric values keep the current setting.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(hours) = lookup("SVCREQ_NEAR_START_HOURS").and_then(|v| v.parse().ok()) {
            self.near_start_hours = hours;
        }
        if let Some(minutes) = lookup("SVCREQ_UTC_OFFSET_MINUTES").and_then(|v| v.parse().ok()) {
            self.utc_offset_minutes = minutes;
        }
        if let Some(enabled) = lookup("SVCREQ_REFETCH_ENABLED") {
            self.refetch_enabled = matches!(enabled.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(cron) = lookup("SVCREQ_REFETCH_CRON") {
            self.refetch_cron = cron;
        }
        if let Some(url) = lookup("SVCREQ_REST_URL") {
            self.rest_url = url;
        }
        if let Some(key) = lookup("SVCREQ_REST_API_KEY") {
            self.rest_api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(secs) = lookup("SVCREQ_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = secs;
        }
        self
    }

    /// Out-of-range hours fall back to the default window.
    pub fn bucket_policy(&self) -> BucketPolicy {
        let near_start_window = self.near_start_window().unwrap_or_else(|| {
            warn!(
                near_start_hours = self.near_start_hours,
                "near-start window out of range; using default"
            );
            BucketPolicy::default().near_start_window
        });
        BucketPolicy {
            near_start_window,
            utc_offset_minutes: self.utc_offset_minutes,
        }
    }

    fn near_start_window(&self) -> Option<chrono::Duration> {
        if !(0..=MAX_NEAR_START_HOURS).contains(&self.near_start_hours) {
            return None;
        }
        chrono::Duration::try_hours(self.near_start_hours)
    }

    pub fn rest_store_config(&self) -> RestStoreConfig {
        RestStoreConfig {
            base_url: self.rest_url.clone(),
            api_key: self.rest_api_key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("svcreq/{}", env!("CARGO_PKG_VERSION"))),
            ..Default::default()
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("user {viewer} is not a party to request {id}")]
    NotAParty { id: String, viewer: String },
    #[error("request {id} not found")]
    NotFound { id: String },
    #[error("request {id} already has a mutation in flight")]
    Busy { id: String },
    #[error("request {id} cannot be deleted by this user while {status}")]
    NotDeletable { id: String, status: RequestStatus },
    #[error("remote store failed: {0}")]
    Remote(#[from] StoreError),
}

impl CoordinatorError {
    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::Remote(err) => err.is_retryable(),
            CoordinatorError::Busy { .. } => true,
            _ => false,
        }
    }
}

/// Keeps a realtime subscription alive. Dropping it stops the listener and
/// releases the subscription.
#[derive(Debug)]
pub struct WatchHandle {
    topic: Topic,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the listener and waits until its subscription is released.
    pub async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.ids).remove(&self.id);
    }
}

/// Drives one viewer's requests through the lifecycle.
///
/// Every mutation is applied to the cache first, then committed to the store.
/// A failed commit restores the cached copies; a successful one replaces them
/// with the stored row. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Coordinator {
    viewer_id: Arc<str>,
    store: Arc<dyn RequestStore>,
    notifier: Arc<dyn NotificationSink>,
    cache: RequestCache,
    clock: Arc<dyn Clock>,
    policy: BucketPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
    failures: Arc<Mutex<HashMap<String, String>>>,
    notification_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("viewer_id", &self.viewer_id)
            .field("policy", &self.policy)
            .field("revision", &self.cache.revision())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        viewer_id: impl Into<String>,
        store: Arc<dyn RequestStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let viewer_id: String = viewer_id.into();
        Self {
            viewer_id: Arc::from(viewer_id),
            store,
            notifier,
            cache: RequestCache::new(),
            clock: Arc::new(SystemClock),
            policy: BucketPolicy::default(),
            in_flight: Arc::default(),
            failures: Arc::default(),
            notification_tasks: Arc::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: BucketPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    /// Observes a new value after every cache change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.cache.subscribe()
    }

    /// Refetches the three list queries (and every cached detail) and returns the new board.
    pub async fn refresh(&self) -> Result<RequestBoard, CoordinatorError> {
        let span = info_span!("refresh", viewer = %self.viewer_id);
        self.refresh_lists().instrument(span).await
    }

    async fn refresh_lists(&self) -> Result<RequestBoard, CoordinatorError> {
        let [(sent_key, sent), (received_key, received), (active_key, active)] =
            self.list_queries();
        let (sent_rows, received_rows, active_rows) = tokio::try_join!(
            self.store.find_requests(&sent),
            self.store.find_requests(&received),
            self.store.find_requests(&active),
        )?;
        info!(
            sent = sent_rows.len(),
            received = received_rows.len(),
            active = active_rows.len(),
            "refreshed request lists"
        );
        self.cache.put_list(sent_key, sent_rows);
        self.cache.put_list(received_key, received_rows);
        self.cache.put_list(active_key, active_rows);

        for key in self.cache.keys() {
            if let QueryKey::Detail(id) = key {
                self.refetch_request(&id).await?;
            }
        }
        Ok(self.board())
    }

    /// Buckets everything cached, as of the clock's current time.
    pub fn board(&self) -> RequestBoard {
        let records = self.cache.records();
        RequestBoard::build(&records, &self.viewer_id, self.clock.now(), &self.policy)
    }

    pub fn request(&self, id: &str) -> Option<ServiceRequest> {
        self.cache.get(id)
    }

    /// Loads one request into the cache under its own detail entry.
    pub async fn load_request(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        let record = self
            .store
            .find_request(id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound { id: id.to_string() })?;
        if record.role_of(&self.viewer_id).is_none() {
            return Err(CoordinatorError::NotAParty {
                id: id.to_string(),
                viewer: self.viewer_id.to_string(),
            });
        }
        self.cache.put_list(QueryKey::Detail(id.to_string()), vec![record.clone()]);
        self.cache.reconcile(&record, &self.member_keys(&record));
        Ok(record)
    }

    /// What the viewer may do with a cached request. Everything is disabled
    /// while any mutation is in flight; `is_pending` tells which row it is.
    pub fn actions(&self, id: &str) -> Option<RequestActions> {
        let record = self.cache.get(id)?;
        let role = record.role_of(&self.viewer_id)?;
        if self.mutation_in_flight() {
            return Some(RequestActions::disabled());
        }
        Some(RequestActions::for_status(record.status, role))
    }

    pub fn mutation_in_flight(&self) -> bool {
        !lock(&self.in_flight).is_empty()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.in_flight).contains(id)
    }

    /// Message of the last failed mutation on `id`, until it is cleared or a later one succeeds.
    pub fn last_failure(&self, id: &str) -> Option<String> {
        lock(&self.failures).get(id).cloned()
    }

    pub fn clear_failure(&self, id: &str) {
        lock(&self.failures).remove(id);
    }

    /// Creates a request with the viewer as client. Not optimistic: the row id
    /// comes from the store.
    pub async fn create(&self, new: NewServiceRequest) -> Result<ServiceRequest, CoordinatorError> {
        if new.client_id != *self.viewer_id {
            return Err(CoordinatorError::NotAParty {
                id: String::new(),
                viewer: self.viewer_id.to_string(),
            });
        }
        let record = self.store.create_request(new).await?;
        self.cache.reconcile(&record, &self.member_keys(&record));
        Ok(record)
    }

    /// Runs one lifecycle event against request `id` as the viewer.
    pub async fn apply(
        &self,
        id: &str,
        event: &RequestEvent,
    ) -> Result<ServiceRequest, CoordinatorError> {
        let span = info_span!("transition", id, event = %event.kind(), viewer = %self.viewer_id);
        self.run_transition(id, event).instrument(span).await
    }

    async fn run_transition(
        &self,
        id: &str,
        event: &RequestEvent,
    ) -> Result<ServiceRequest, CoordinatorError> {
        let _guard = self.begin(id)?;
        let current = self.current_record(id).await?;
        let role = self.role_in(&current)?;
        let plan = plan_transition(&current, role, event, self.clock.now())?;
        debug!(from = %plan.from, to = %plan.to, %role, "planned transition");

        let record = self
            .optimistic(
                id,
                |cache| cache.patch(id, |row| plan.patch.apply_to(row)),
                self.commit(&plan),
            )
            .await?;

        self.cache.reconcile(&record, &self.member_keys(&record));
        self.dispatch_notifications(plan.notifications);
        info!(status = %record.status, "transition committed");
        Ok(record)
    }

    pub async fn accept(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::Accept).await
    }

    pub async fn reject(
        &self,
        id: &str,
        response: Option<String>,
    ) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::Reject { response }).await
    }

    pub async fn propose_price(
        &self,
        id: &str,
        price: i64,
        response: Option<String>,
    ) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::ProposePrice { price, response }).await
    }

    pub async fn confirm_price(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::ConfirmPrice).await
    }

    pub async fn reject_price(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::RejectPrice).await
    }

    pub async fn cancel(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::Cancel).await
    }

    pub async fn start_work(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::StartWork).await
    }

    pub async fn submit_details(
        &self,
        id: &str,
        description: impl Into<String>,
        photos: Vec<String>,
    ) -> Result<ServiceRequest, CoordinatorError> {
        let event = RequestEvent::SubmitDetails {
            description: description.into(),
            photos,
        };
        self.apply(id, &event).await
    }

    pub async fn confirm(
        &self,
        id: &str,
        rating: u8,
        comment: Option<String>,
    ) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::Confirm { rating, comment }).await
    }

    pub async fn payment_complete(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        self.apply(id, &RequestEvent::PaymentComplete).await
    }

    /// Client-only hard delete of a rejected or cancelled request.
    pub async fn delete(&self, id: &str) -> Result<(), CoordinatorError> {
        let span = info_span!("delete", id, viewer = %self.viewer_id);
        self.run_delete(id).instrument(span).await
    }

    async fn run_delete(&self, id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.begin(id)?;
        let current = self.current_record(id).await?;
        let role = self.role_in(&current)?;
        if !RequestActions::for_status(current.status, role).can_delete {
            return Err(CoordinatorError::NotDeletable {
                id: id.to_string(),
                status: current.status,
            });
        }

        self.optimistic(id, |cache| cache.remove(id), self.store.delete_request(id))
            .await?;
        self.cache.evict(id);
        info!("request deleted");
        Ok(())
    }

    /// Replaces every cached copy of `id` with the stored row, or evicts it
    /// when the row is gone or no longer visible to the viewer.
    pub async fn refetch_request(
        &self,
        id: &str,
    ) -> Result<Option<ServiceRequest>, CoordinatorError> {
        let record = self
            .store
            .find_request(id)
            .await?
            .filter(|record| record.role_of(&self.viewer_id).is_some());
        match &record {
            Some(record) => {
                let changed = self.cache.reconcile(record, &self.member_keys(record));
                debug!(id, changed, status = %record.status, "reconciled request");
            }
            None => {
                let removed = self.cache.evict(id);
                debug!(id, removed, "request gone; evicted");
            }
        }
        Ok(record)
    }

    /// Row change pushed by the realtime channel. The payload is only a hint;
    /// the row is always refetched.
    pub async fn handle_change(&self, event: &ChangeEvent) -> Result<(), CoordinatorError> {
        if !event.may_involve(&self.viewer_id) {
            return Ok(());
        }
        if let Some(id) = event.record_id() {
            self.refetch_request(id).await?;
        }
        Ok(())
    }

    pub async fn handle_signal(&self, signal: RealtimeSignal) -> Result<(), CoordinatorError> {
        match signal {
            RealtimeSignal::Change(event) => self.handle_change(&event).await,
            RealtimeSignal::Lagged(missed) => {
                warn!(missed, "realtime subscriber lagged; refreshing everything");
                self.refresh().await.map(|_| ())
            }
        }
    }

    /// Changes may have been missed while disconnected.
    pub async fn on_reconnect(&self) -> Result<RequestBoard, CoordinatorError> {
        info!(viewer = %self.viewer_id, "realtime reconnected; refreshing");
        self.refresh().await
    }

    /// Reconciles `id` whenever its row changes, for as long as the handle lives.
    pub async fn watch_request(
        &self,
        channel: &dyn RealtimeChannel,
        id: &str,
    ) -> Result<WatchHandle, CoordinatorError> {
        let subscription = channel.subscribe(Topic::Request(id.to_string())).await?;
        Ok(self.spawn_listener(subscription))
    }

    /// Reconciles every row change that may concern the viewer.
    pub async fn watch_all(
        &self,
        channel: &dyn RealtimeChannel,
    ) -> Result<WatchHandle, CoordinatorError> {
        let subscription = channel.subscribe(Topic::Table).await?;
        Ok(self.spawn_listener(subscription))
    }

    /// Waits for every notification dispatched so far.
    pub async fn flush_notifications(&self) {
        let tasks = std::mem::take(&mut *lock(&self.notification_tasks));
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "notification task did not finish");
            }
        }
    }

    /// Cron job that refreshes the lists, when enabled in `config`.
    pub async fn build_refresh_scheduler(
        &self,
        config: &CoordinatorConfig,
    ) -> Result<Option<JobScheduler>> {
        if !config.refetch_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let coordinator = self.clone();
        let job = Job::new_async(&config.refetch_cron, move |_uuid, _l| {
            let coordinator = coordinator.clone();
            Box::pin(async move {
                match coordinator.refresh().await {
                    Ok(board) => debug!(requests = board.len(), "scheduled refresh finished"),
                    Err(err) => warn!(error = %err, "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating refresh job for cron {}", config.refetch_cron))?;
        sched.add(job).await.context("adding refresh job")?;
        Ok(Some(sched))
    }

    /// Applies `forward` to the cache, awaits `remote`, and undoes `forward` if it fails.
    async fn optimistic<T, F>(
        &self,
        id: &str,
        forward: impl FnOnce(&RequestCache) -> CacheRollback,
        remote: F,
    ) -> Result<T, CoordinatorError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let rollback = forward(&self.cache);
        debug!(id, copies = rollback.len(), "optimistic write applied");

        match remote.await {
            Ok(value) => {
                self.clear_failure(id);
                Ok(value)
            }
            Err(err) => {
                let restored = self.cache.rollback(rollback);
                warn!(id, error = %err, restored, "remote mutation failed; rolled back");
                lock(&self.failures).insert(id.to_string(), err.to_string());
                if !err.is_retryable() {
                    if let Err(refetch) = self.refetch_request(id).await {
                        warn!(id, error = %refetch, "refetch after rejected mutation failed");
                    }
                }
                Err(CoordinatorError::Remote(err))
            }
        }
    }

    /// Stores the review (if any) before the status change. A review left behind by an
    /// earlier attempt whose status update failed is reused, so retrying a confirm works.
    async fn commit(&self, plan: &TransitionPlan) -> Result<ServiceRequest, StoreError> {
        if let Some(review) = &plan.review {
            let existing = self.store.find_reviews(&plan.request_id).await?;
            if existing.iter().any(|r| r.reviewer_id == review.reviewer_id) {
                debug!(id = %plan.request_id, "review already stored; finishing status update");
            } else {
                self.store.create_review(review.clone()).await?;
            }
        }
        self.store.update_request(&plan.request_id, &plan.patch).await
    }

    fn dispatch_notifications(&self, drafts: Vec<NotificationDraft>) {
        if drafts.is_empty() {
            return;
        }
        let notifier = Arc::clone(&self.notifier);
        let task = tokio::spawn(
            async move {
                for draft in drafts {
                    if let Err(err) = notifier.notify(&draft).await {
                        warn!(
                            user_id = %draft.user_id,
                            kind = ?draft.kind,
                            error = %err,
                            "notification dispatch failed"
                        );
                    }
                }
            }
            .instrument(info_span!("notify")),
        );
        let mut tasks = lock(&self.notification_tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn spawn_listener(&self, mut subscription: Subscription) -> WatchHandle {
        let topic = subscription.topic().clone();
        let coordinator = self.clone();
        let span = info_span!("watch", topic = %topic, viewer = %self.viewer_id);
        let task = tokio::spawn(
            async move {
                while let Some(signal) = subscription.recv().await {
                    if let Err(err) = coordinator.handle_signal(signal).await {
                        warn!(error = %err, "realtime reconciliation failed");
                    }
                }
                debug!("realtime channel closed");
            }
            .instrument(span),
        );
        WatchHandle { topic, task }
    }

    fn begin(&self, id: &str) -> Result<InFlightGuard, CoordinatorError> {
        if !lock(&self.in_flight).insert(id.to_string()) {
            return Err(CoordinatorError::Busy { id: id.to_string() });
        }
        Ok(InFlightGuard {
            ids: Arc::clone(&self.in_flight),
            id: id.to_string(),
        })
    }

    async fn current_record(&self, id: &str) -> Result<ServiceRequest, CoordinatorError> {
        match self.cache.get(id) {
            Some(record) => Ok(record),
            None => self.load_request(id).await,
        }
    }

    fn role_in(&self, record: &ServiceRequest) -> Result<Role, CoordinatorError> {
        record.role_of(&self.viewer_id).ok_or_else(|| CoordinatorError::NotAParty {
            id: record.id.clone(),
            viewer: self.viewer_id.to_string(),
        })
    }

    fn list_queries(&self) -> [(QueryKey, RequestFilter); 3] {
        let viewer = self.viewer_id.to_string();
        let active = RequestStatus::ALL
            .into_iter()
            .filter(|status| *status == RequestStatus::Accepted || status.is_work_in_flight());
        [
            (QueryKey::Sent, RequestFilter::sent_by(viewer.clone())),
            (QueryKey::Received, RequestFilter::received_by(viewer.clone())),
            (QueryKey::ActiveJobs, RequestFilter::involving(viewer).with_statuses(active)),
        ]
    }

    /// List queries whose results would contain `record`.
    fn member_keys(&self, record: &ServiceRequest) -> Vec<QueryKey> {
        self.list_queries()
            .into_iter()
            .filter(|(_, filter)| filter.matches(record))
            .map(|(key, _)| key)
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

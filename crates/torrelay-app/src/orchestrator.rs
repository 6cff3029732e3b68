//! Job orchestrator: the tick-driven state machine behind every job.
//!
//! # Design
//! - One driver tick at a time. A tick plans from a lightweight index (state,
//!   priority, category, added time, deadlines) and fans out one task per job
//!   needing work, bounded by the worker semaphore.
//! - Every job sits behind its own async mutex. User actions wait for it; tick
//!   tasks skip a job whose lock is held and pick it up on the next tick.
//! - Provider calls share one semaphore and observe the process cancellation
//!   token. A transfer holds a global download permit until it is harvested.
//! - Provider clients and downloaders only classify failures; this module alone
//!   decides between deferral, automatic retry, and terminal error.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use torrelay_config::OrchestratorSettings;
use torrelay_core::{
    Clock, DebridClient, DiskSpaceProbe, Download, DownloadAction, DownloadHandle,
    DownloadRequest, DownloadStatus, Downloader, EngineError, EngineResult, Job, JobPolicy,
    JobSource, JobState, JobStore, MagnetLink, ProviderStatus, SubmitJob, TransferFailure,
    validate_link,
};
use torrelay_events::{Event, EventBus};
use torrelay_telemetry::Metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::selection;

/// Collaborators injected into the orchestrator.
pub struct OrchestratorDeps {
    /// Provider client shared by every job.
    pub client: Arc<dyn DebridClient>,
    /// Transfer backend.
    pub downloader: Arc<dyn Downloader>,
    /// Job persistence.
    pub store: Arc<dyn JobStore>,
    /// Free-space probe for the download root.
    pub disk: Arc<dyn DiskSpaceProbe>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Notification channel.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Process-wide shutdown token.
    pub cancel: CancellationToken,
}

/// What `delete_job` removes besides the job record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Remove the provider entry.
    pub delete_remote: bool,
    /// Remove downloaded files.
    pub delete_files: bool,
}

struct ActiveTransfer {
    handle: DownloadHandle,
    last_reported: u64,
    _permit: OwnedSemaphorePermit,
}

struct JobCell {
    job: Job,
    transfers: HashMap<Uuid, ActiveTransfer>,
}

impl JobCell {
    fn cancel_transfers(&mut self) {
        for (_, transfer) in self.transfers.drain() {
            transfer.handle.cancel();
        }
        for download in &mut self.job.downloads {
            download.requeue_interrupted();
        }
    }
}

type JobSlot = Arc<AsyncMutex<JobCell>>;

/// Scheduling facts readable without taking a job lock.
#[derive(Debug, Clone)]
struct IndexEntry {
    state: JobState,
    priority: Option<i32>,
    category: Option<String>,
    added_at: DateTime<Utc>,
    hash: Option<String>,
    deferred_until: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    requeue_at: Option<DateTime<Utc>>,
}

impl IndexEntry {
    fn of(job: &Job) -> Self {
        let expires_at = job
            .policy
            .lifetime_minutes
            .filter(|minutes| *minutes > 0)
            .and_then(|minutes| i64::try_from(minutes).ok())
            .and_then(ChronoDuration::try_minutes)
            .and_then(|lifetime| job.added_at.checked_add_signed(lifetime));
        Self {
            state: job.state,
            priority: job.policy.priority,
            category: job.policy.category.clone(),
            added_at: job.added_at,
            hash: job.hash.clone(),
            deferred_until: job.deferred_until,
            expires_at,
            requeue_at: if job.state == JobState::Error {
                job.next_retry_at
            } else {
                None
            },
        }
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<Uuid, JobSlot>,
    index: HashMap<Uuid, IndexEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Expire,
    Admit,
    Advance,
    Requeue,
}

/// Drives every job from submission to completion.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    client: Arc<dyn DebridClient>,
    downloader: Arc<dyn Downloader>,
    store: Arc<dyn JobStore>,
    disk: Arc<dyn DiskSpaceProbe>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Metrics,
    cancel: CancellationToken,
    registry: Mutex<Registry>,
    workers: Arc<Semaphore>,
    provider_calls: Semaphore,
    download_slots: Arc<Semaphore>,
    disk_paused: AtomicBool,
    tick_lock: AsyncMutex<()>,
}

impl Orchestrator {
    /// Build an orchestrator with no jobs; call [`Self::hydrate`] to restore persisted ones.
    #[must_use]
    pub fn new(settings: OrchestratorSettings, deps: OrchestratorDeps) -> Self {
        let OrchestratorDeps {
            client,
            downloader,
            store,
            disk,
            clock,
            events,
            metrics,
            cancel,
        } = deps;
        Self {
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            provider_calls: Semaphore::new(settings.max_provider_calls.max(1)),
            download_slots: Arc::new(Semaphore::new(settings.max_parallel_downloads.max(1))),
            settings,
            client,
            downloader,
            store,
            disk,
            clock,
            events,
            metrics,
            cancel,
            registry: Mutex::new(Registry::default()),
            disk_paused: AtomicBool::new(false),
            tick_lock: AsyncMutex::new(()),
        }
    }

    /// Restore persisted jobs. Transfers interrupted by the previous shutdown
    /// go back to `Pending` without consuming a retry.
    ///
    /// # Errors
    ///
    /// Returns the store error when jobs cannot be loaded.
    pub fn hydrate(&self) -> EngineResult<usize> {
        let mut restored = 0;
        for mut job in self.store.load_jobs()? {
            let interrupted = job
                .downloads
                .iter()
                .any(|download| download.status == DownloadStatus::Downloading);
            if interrupted {
                for download in &mut job.downloads {
                    download.requeue_interrupted();
                }
                if let Err(err) = self.store.save_job(&job) {
                    warn!(job_id = %job.id, error = %err, "failed to persist hydrated job");
                }
            }
            let job_id = job.id;
            match self.insert(job, false) {
                Ok(()) => restored += 1,
                Err(err) => warn!(job_id = %job_id, error = %err, "skipping persisted job"),
            }
        }
        self.refresh_state_metrics();
        info!(jobs = restored, "jobs hydrated from store");
        Ok(restored)
    }

    /// Accept a new job in `Queued`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidArgument`] for malformed sources, invalid
    ///   selection expressions, or a hash already tracked by another job.
    /// - [`EngineError::Storage`] when the job cannot be persisted.
    pub fn submit(&self, mut request: SubmitJob) -> EngineResult<Uuid> {
        let (hash, display_name) = inspect_source(&request.source)?;
        selection::validate_patterns(&request.policy)?;
        if request.name_hint.is_none() {
            request.name_hint = display_name;
        }
        let job = Job::new(Uuid::new_v4(), request, hash, self.clock.now());
        let job_id = job.id;
        let name = job.name.clone();

        self.insert(job.clone(), true)?;
        if let Err(err) = self.store.save_job(&job) {
            self.unregister(job_id);
            return Err(err);
        }
        info!(job_id = %job_id, name = %name, kind = ?job.kind(), "job submitted");
        self.events.publish(Event::JobAdded { job_id, name });
        self.refresh_state_metrics();
        Ok(job_id)
    }

    /// Re-arm a failed job with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for unknown jobs, [`EngineError::InvalidArgument`]
    /// unless the job is in `Error`, and provider errors from removing the old entry.
    pub async fn retry_job(&self, job_id: Uuid) -> EngineResult<()> {
        let mut cell = self.lock_job(job_id).await?;
        if cell.job.state != JobState::Error {
            return Err(state_mismatch(cell.job.state, "not_failed"));
        }
        self.delete_remote(&cell.job).await?;
        cell.cancel_transfers();
        let job = &mut cell.job;
        job.retry_count = 0;
        job.last_error = None;
        job.error_retryable = false;
        job.next_retry_at = None;
        job.deferred_until = None;
        job.reset_provider_state();
        self.transition(job, JobState::Queued);
        info!(job_id = %job_id, "job re-armed by user");
        self.commit(&cell.job)
    }

    /// Reset one failed download; a job that failed because of it resumes downloading.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for unknown jobs or downloads and
    /// [`EngineError::InvalidArgument`] unless the download is in `Error`.
    pub async fn retry_download(&self, job_id: Uuid, download_id: Uuid) -> EngineResult<()> {
        let mut cell = self.lock_job(job_id).await?;
        let job = &mut cell.job;
        let download = job
            .download_mut(download_id)
            .ok_or_else(|| EngineError::not_found("download", download_id.to_string()))?;
        if download.status != DownloadStatus::Error {
            return Err(EngineError::InvalidArgument {
                field: "download",
                reason: "not_failed",
                value: Some(download_id.to_string()),
            });
        }
        download.reset();
        if job.state == JobState::Error {
            job.last_error = None;
            job.error_retryable = false;
            job.next_retry_at = None;
            self.transition(job, JobState::Downloading);
        }
        self.commit(&cell.job)
    }

    /// Record the user's file selection; the next tick forwards it to the provider.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for unknown jobs and
    /// [`EngineError::InvalidArgument`] for an empty or unknown selection or a
    /// job that is not waiting for one.
    pub async fn select_files(&self, job_id: Uuid, file_ids: Vec<String>) -> EngineResult<()> {
        if file_ids.is_empty() {
            return Err(EngineError::InvalidArgument {
                field: "file_ids",
                reason: "empty",
                value: None,
            });
        }
        let mut cell = self.lock_job(job_id).await?;
        if cell.job.state != JobState::WaitingForFileSelection {
            return Err(state_mismatch(cell.job.state, "not_waiting_for_selection"));
        }
        if let Some(unknown) = file_ids
            .iter()
            .find(|id| !cell.job.files.iter().any(|file| &file.id == *id))
        {
            return Err(EngineError::InvalidArgument {
                field: "file_ids",
                reason: "unknown_file",
                value: Some(unknown.clone()),
            });
        }
        cell.job.pending_selection = Some(file_ids);
        self.commit(&cell.job)
    }

    /// Replace a job's policy.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for unknown jobs and
    /// [`EngineError::InvalidArgument`] for invalid selection expressions.
    pub async fn update_policy(&self, job_id: Uuid, policy: JobPolicy) -> EngineResult<()> {
        selection::validate_patterns(&policy)?;
        let mut cell = self.lock_job(job_id).await?;
        let now = self.clock.now();
        let job = &mut cell.job;
        job.policy = policy;
        if job.state == JobState::Error
            && job.error_retryable
            && job.retry_count < job.policy.job_retry_budget
            && job.next_retry_at.is_none()
        {
            job.next_retry_at = Some(after(now, self.settings.job_retry_delay()));
        }
        self.commit(&cell.job)
    }

    /// Remove a job, cancelling its transfers.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for unknown jobs and provider errors when the
    /// remote entry cannot be removed (the job is then kept).
    pub async fn delete_job(&self, job_id: Uuid, options: DeleteOptions) -> EngineResult<()> {
        let mut cell = self.lock_job(job_id).await?;
        if options.delete_remote && cell.job.provider_id.is_some() && !cell.job.deleted_remotely {
            match self.call("delete", self.client.delete(&cell.job)).await {
                Ok(()) | Err(EngineError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        cell.cancel_transfers();
        if options.delete_files {
            remove_local_files(&cell.job).await;
        }
        self.remove_job(&mut cell);
        Ok(())
    }

    /// Every job, in scheduling order.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let slots: Vec<JobSlot> = self.registry().slots.values().cloned().collect();
        let mut jobs = Vec::with_capacity(slots.len());
        for slot in slots {
            jobs.push(slot.lock().await.job.clone());
        }
        jobs.sort_by(|a, b| {
            priority_order(a.policy.priority, b.policy.priority)
                .then(a.added_at.cmp(&b.added_at))
                .then(a.id.cmp(&b.id))
        });
        jobs
    }

    /// One job.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown jobs.
    pub async fn get_job(&self, job_id: Uuid) -> EngineResult<Job> {
        Ok(self.lock_job(job_id).await?.job.clone())
    }

    /// Jobs currently holding a concurrency slot.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.registry()
            .index
            .values()
            .filter(|entry| entry.state.is_active())
            .count()
    }

    /// Jobs currently in `state`.
    #[must_use]
    pub fn jobs_in_state(&self, state: JobState) -> usize {
        self.registry()
            .index
            .values()
            .filter(|entry| entry.state == state)
            .count()
    }

    /// Run ticks until the cancellation token fires, then park in-flight work.
    pub async fn run(self: Arc<Self>) {
        let period = self.settings.tick_interval().max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = period.as_millis(), "orchestrator started");
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        self.shutdown().await;
    }

    /// Cancel transfers and persist interrupted downloads as `Pending`.
    pub async fn shutdown(&self) {
        let slots: Vec<JobSlot> = self.registry().slots.values().cloned().collect();
        for slot in slots {
            let mut cell = slot.lock().await;
            let interrupted = !cell.transfers.is_empty()
                || cell
                    .job
                    .downloads
                    .iter()
                    .any(|download| download.status == DownloadStatus::Downloading);
            cell.cancel_transfers();
            if interrupted {
                self.persist(&cell.job);
            }
        }
        info!("orchestrator stopped");
    }

    /// Run one driver tick and return the jobs it changed.
    pub async fn tick(self: &Arc<Self>) -> Vec<Uuid> {
        let _tick = self.tick_lock.lock().await;
        let now = self.clock.now();
        let plan = self.plan(now);

        let mut tasks = JoinSet::new();
        for (job_id, work) in plan {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            let orchestrator = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                orchestrator.run_job(job_id, work, now).await
            });
        }

        let mut changed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(job_id)) => changed.push(job_id),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "job task failed"),
            }
        }
        changed.sort_unstable();
        if !changed.is_empty() {
            self.events.publish(Event::JobsChanged {
                job_ids: changed.clone(),
            });
        }
        self.refresh_state_metrics();
        self.metrics.inc_tick();
        changed
    }

    fn plan(&self, now: DateTime<Utc>) -> Vec<(Uuid, Work)> {
        let mut entries: Vec<(Uuid, IndexEntry)> = self
            .registry()
            .index
            .iter()
            .filter(|(_, entry)| entry.state != JobState::Finished)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries.sort_by(|(a_id, a), (b_id, b)| {
            priority_order(a.priority, b.priority)
                .then(a.added_at.cmp(&b.added_at))
                .then(a_id.cmp(b_id))
        });

        let mut active = 0_usize;
        let mut active_by_category: HashMap<String, usize> = HashMap::new();
        for (_, entry) in &entries {
            if entry.state.is_active() {
                active += 1;
                if let Some(category) = &entry.category {
                    *active_by_category.entry(category.clone()).or_default() += 1;
                }
            }
        }

        let mut plan = Vec::new();
        let mut queued = Vec::new();
        for (job_id, entry) in entries {
            if !entry.state.is_terminal() && entry.expires_at.is_some_and(|at| now > at) {
                plan.push((job_id, Work::Expire));
                continue;
            }
            if entry.deferred_until.is_some_and(|until| until > now) {
                continue;
            }
            match entry.state {
                JobState::Queued => queued.push((job_id, entry.category)),
                JobState::Processing
                | JobState::WaitingForFileSelection
                | JobState::Downloading => plan.push((job_id, Work::Advance)),
                JobState::Error if entry.requeue_at.is_some_and(|at| at <= now) => {
                    plan.push((job_id, Work::Requeue));
                }
                JobState::Error | JobState::Finished => {}
            }
        }

        if !queued.is_empty() && self.disk_space_allows() {
            let cap = self.settings.max_parallel_jobs.max(1);
            for (job_id, category) in queued {
                if active >= cap {
                    break;
                }
                if let Some(category) = category
                    && let Some(limit) = self.settings.category_limits.get(&category)
                {
                    let used = active_by_category.entry(category).or_default();
                    if *used >= *limit {
                        continue;
                    }
                    *used += 1;
                }
                active += 1;
                plan.push((job_id, Work::Admit));
            }
        }
        plan
    }

    fn disk_space_allows(&self) -> bool {
        let required = self.settings.min_free_space_bytes;
        if required == 0 {
            return true;
        }
        let available = match self.disk.available_space(&self.settings.download_root) {
            Ok(available) => available,
            Err(err) => {
                warn!(error = %err, "disk space probe failed; admitting jobs");
                return true;
            }
        };
        if available < required {
            if !self.disk_paused.swap(true, AtomicOrdering::AcqRel) {
                warn!(available, required, "download volume low on space; holding queued jobs");
                self.metrics.set_disk_space_paused(true);
                self.events.publish(Event::DiskSpacePaused {
                    available_bytes: available,
                    required_bytes: required,
                });
            }
            return false;
        }
        if self.disk_paused.swap(false, AtomicOrdering::AcqRel) {
            info!(available, "disk space recovered; admitting queued jobs");
            self.metrics.set_disk_space_paused(false);
            self.events.publish(Event::DiskSpaceResumed {
                available_bytes: available,
            });
        }
        true
    }

    async fn run_job(&self, job_id: Uuid, work: Work, now: DateTime<Utc>) -> Option<Uuid> {
        let slot = self.slot(job_id)?;
        let Ok(mut cell) = slot.try_lock() else {
            debug!(job_id = %job_id, "job busy; skipping this tick");
            return None;
        };
        let before = cell.job.clone();

        let outcome = match work {
            Work::Expire => {
                self.fail(&mut cell, "job exceeded its lifetime".to_string(), false, now)
                    .await;
                Ok(())
            }
            Work::Admit => self.admit(&mut cell.job).await,
            Work::Advance => self.advance(&mut cell, now).await,
            Work::Requeue => {
                self.requeue(&mut cell.job).await;
                Ok(())
            }
        };
        if let Err(err) = outcome {
            self.apply_failure(&mut cell, err, now).await;
        }

        if cell.job == before {
            return None;
        }
        if self.slot(job_id).is_some() {
            self.sync_index(&cell.job);
            self.persist(&cell.job);
        }
        Some(job_id)
    }

    async fn admit(&self, job: &mut Job) -> EngineResult<()> {
        let provider_id = self.call("add", self.client.add(&job.source)).await?;
        info!(
            job_id = %job.id,
            provider = self.client.provider_name(),
            provider_id = %provider_id,
            "job submitted to provider"
        );
        job.provider_id = Some(provider_id);
        job.deferred_until = None;
        self.transition(job, JobState::Processing);
        Ok(())
    }

    async fn advance(&self, cell: &mut JobCell, now: DateTime<Utc>) -> EngineResult<()> {
        match cell.job.state {
            JobState::Processing => self.process(&mut cell.job, now).await,
            JobState::WaitingForFileSelection => self.apply_selection(&mut cell.job).await,
            JobState::Downloading => self.drive_downloads(cell, now).await,
            JobState::Queued | JobState::Finished | JobState::Error => Ok(()),
        }
    }

    async fn process(&self, job: &mut Job, now: DateTime<Utc>) -> EngineResult<()> {
        self.call("update_data", self.client.update_data(job, None))
            .await?;
        if job.deleted_remotely {
            return Err(EngineError::not_found(
                "provider entry",
                job.provider_id.clone().unwrap_or_default(),
            ));
        }
        match job.provider_status {
            Some(ProviderStatus::WaitingForFileSelection) if job.selected_files.is_empty() => {
                if job.policy.download_action == DownloadAction::Manual {
                    self.transition(job, JobState::WaitingForFileSelection);
                    return Ok(());
                }
                self.auto_select(job).await
            }
            Some(ProviderStatus::Finished) => self.collect_downloads(job, now).await,
            Some(ProviderStatus::Error) => Err(EngineError::provider(
                "provider_status",
                job.provider_message
                    .clone()
                    .unwrap_or_else(|| "provider reported an error".to_string()),
            )),
            _ => Ok(()),
        }
    }

    async fn auto_select(&self, job: &mut Job) -> EngineResult<()> {
        if job.files.is_empty() {
            return Ok(());
        }
        let candidates = if job.policy.download_action == DownloadAction::AvailableOnly {
            let hash = job.hash.clone().ok_or(EngineError::InvalidArgument {
                field: "hash",
                reason: "unknown",
                value: None,
            })?;
            let available = self
                .call(
                    "get_available_files",
                    self.client.get_available_files(&hash),
                )
                .await?;
            selection::available_only(&job.files, &available)
        } else {
            job.files.clone()
        };
        let file_ids = selection::select_files(&candidates, &job.policy)?;
        let selected = self
            .call("select_files", self.client.select_files(job, &file_ids))
            .await?;
        if selected == 0 {
            return Err(EngineError::provider(
                "select_files",
                "provider selected no files",
            ));
        }
        debug!(job_id = %job.id, files = file_ids.len(), "files selected automatically");
        job.selected_files = file_ids;
        Ok(())
    }

    async fn apply_selection(&self, job: &mut Job) -> EngineResult<()> {
        let Some(file_ids) = job.pending_selection.clone() else {
            return Ok(());
        };
        let selected = self
            .call("select_files", self.client.select_files(job, &file_ids))
            .await?;
        if selected == 0 {
            return Err(EngineError::provider(
                "select_files",
                "provider selected no files",
            ));
        }
        job.pending_selection = None;
        job.selected_files = file_ids;
        self.transition(job, JobState::Processing);
        Ok(())
    }

    async fn collect_downloads(&self, job: &mut Job, now: DateTime<Utc>) -> EngineResult<()> {
        let infos = self
            .call("get_download_infos", self.client.get_download_infos(job))
            .await?;
        if infos.is_empty() {
            return Err(EngineError::provider(
                "get_download_infos",
                "provider returned no links",
            ));
        }
        let job_id = job.id;
        job.downloads = infos
            .into_iter()
            .map(|info| Download::new(job_id, info, now))
            .collect();
        info!(job_id = %job_id, downloads = job.downloads.len(), "provider finished; downloads created");
        self.transition(job, JobState::Downloading);
        Ok(())
    }

    async fn drive_downloads(&self, cell: &mut JobCell, now: DateTime<Utc>) -> EngineResult<()> {
        self.harvest(cell, now);
        if cell.job.downloads.is_empty() {
            return Err(EngineError::provider(
                "get_download_infos",
                "job has no downloads",
            ));
        }
        if let Some(failed) = cell
            .job
            .downloads
            .iter()
            .find(|download| download.status == DownloadStatus::Error)
        {
            let label = failed
                .file_name
                .clone()
                .unwrap_or_else(|| failed.restricted_link.clone());
            let detail = failed.last_error.clone().unwrap_or_default();
            return Err(EngineError::transfer(format!("{label}: {detail}")));
        }
        self.start_pending(cell).await?;
        if cell.transfers.is_empty() && cell.job.downloads_complete() {
            self.finish(cell, now).await?;
        }
        Ok(())
    }

    fn harvest(&self, cell: &mut JobCell, now: DateTime<Utc>) {
        let JobCell { job, transfers } = cell;
        let job_id = job.id;
        let budget = job.policy.download_retry_budget;
        let download_ids: Vec<Uuid> = transfers.keys().copied().collect();
        for download_id in download_ids {
            let Some(transfer) = transfers.get_mut(&download_id) else {
                continue;
            };
            let Some(outcome) = transfer.handle.poll_outcome() else {
                let progress = transfer.handle.progress();
                if let Some(download) = job.download_mut(download_id) {
                    download.bytes_done = progress.bytes_done;
                    if progress.bytes_total > 0 {
                        download.bytes_total = progress.bytes_total;
                    }
                    download.speed_bps = progress.speed_bps;
                }
                if progress.bytes_done != transfer.last_reported {
                    transfer.last_reported = progress.bytes_done;
                    self.events.publish(Event::DownloadProgress {
                        job_id,
                        download_id,
                        bytes_done: progress.bytes_done,
                        bytes_total: progress.bytes_total,
                        speed_bps: progress.speed_bps,
                    });
                }
                continue;
            };
            transfers.remove(&download_id);
            let Some(download) = job.download_mut(download_id) else {
                continue;
            };
            match outcome {
                Ok(success) => {
                    debug!(
                        job_id = %job_id,
                        download_id = %download_id,
                        attempts = success.attempts,
                        bytes = success.bytes_written,
                        "transfer finished"
                    );
                    let path = success.path.display().to_string();
                    download.finish(success.path, success.bytes_written, now);
                    self.metrics.inc_transfer("finished");
                    self.events.publish(Event::DownloadCompleted {
                        job_id,
                        download_id,
                        path,
                    });
                }
                Err(TransferFailure::Cancelled) => download.requeue_interrupted(),
                Err(TransferFailure::Failed { message }) => {
                    self.metrics.inc_transfer("failed");
                    download.link = None;
                    let status = download.record_failure(message.clone(), budget);
                    warn!(
                        job_id = %job_id,
                        download_id = %download_id,
                        retry_count = download.retry_count,
                        budget,
                        exhausted = status == DownloadStatus::Error,
                        error = %message,
                        "transfer failed"
                    );
                    self.events.publish(Event::DownloadFailed {
                        job_id,
                        download_id,
                        message,
                    });
                }
            }
        }
    }

    async fn start_pending(&self, cell: &mut JobCell) -> EngineResult<()> {
        let per_job = self.settings.max_downloads_per_job.max(1);
        let pending: Vec<Uuid> = cell
            .job
            .downloads
            .iter()
            .filter(|download| {
                download.status == DownloadStatus::Pending
                    && !cell.transfers.contains_key(&download.id)
            })
            .map(|download| download.id)
            .collect();

        for download_id in pending {
            if cell.transfers.len() >= per_job {
                break;
            }
            let Ok(permit) = Arc::clone(&self.download_slots).try_acquire_owned() else {
                debug!(job_id = %cell.job.id, "global download cap reached");
                break;
            };
            let url = self.resolve_link(&mut cell.job, download_id).await?;
            let destination_dir = self.destination_dir(&cell.job);
            let fallback_name = cell.job.name.clone();
            let job_id = cell.job.id;
            let Some(download) = cell.job.download_mut(download_id) else {
                continue;
            };
            let request = DownloadRequest {
                download_id,
                job_id,
                url,
                destination_dir,
                file_name: download.file_name.clone(),
                fallback_name,
                remote_path: download.remote_path.clone(),
                size_hint: download.size_hint,
                cancel: self.cancel.child_token(),
            };
            download.begin();
            debug!(
                job_id = %job_id,
                download_id = %download_id,
                downloader = self.downloader.name(),
                "starting transfer"
            );
            let handle = self.downloader.start(request);
            cell.transfers.insert(
                download_id,
                ActiveTransfer {
                    handle,
                    last_reported: 0,
                    _permit: permit,
                },
            );
        }
        Ok(())
    }

    async fn resolve_link(&self, job: &mut Job, download_id: Uuid) -> EngineResult<String> {
        let download = job
            .downloads
            .iter()
            .find(|download| download.id == download_id)
            .ok_or_else(|| EngineError::not_found("download", download_id.to_string()))?;
        if let Some(link) = &download.link {
            return Ok(link.clone());
        }
        let restricted = download.restricted_link.clone();
        let link = self
            .call("unrestrict", self.client.unrestrict(job, &restricted))
            .await?;
        if let Some(download) = job.download_mut(download_id) {
            download.link = Some(link.clone());
        }
        Ok(link)
    }

    fn destination_dir(&self, job: &Job) -> PathBuf {
        let mut dir = self.settings.download_root.clone();
        if let Some(category) = job.policy.category.as_deref().and_then(path_segment) {
            dir.push(category);
        }
        dir.push(path_segment(&job.name).unwrap_or_else(|| job.id.to_string()));
        dir
    }

    async fn finish(&self, cell: &mut JobCell, now: DateTime<Utc>) -> EngineResult<()> {
        let action = cell.job.policy.finished_action;
        if action.removes_remote() && cell.job.provider_id.is_some() && !cell.job.deleted_remotely {
            match self.call("delete", self.client.delete(&cell.job)).await {
                Ok(()) | Err(EngineError::NotFound { .. }) => {}
                Err(err @ (EngineError::RateLimited { .. } | EngineError::Cancelled { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(job_id = %cell.job.id, error = %err, "failed to remove provider entry after completion");
                }
            }
        }
        cell.job.completed_at = Some(now);
        cell.job.last_error = None;
        cell.job.speed_bps = 0;
        self.transition(&mut cell.job, JobState::Finished);
        info!(job_id = %cell.job.id, name = %cell.job.name, "job finished");
        if action.removes_local() {
            self.remove_job(cell);
        }
        Ok(())
    }

    async fn requeue(&self, job: &mut Job) {
        if !job.error_retryable || job.retry_count >= job.policy.job_retry_budget {
            job.next_retry_at = None;
            return;
        }
        if self.delete_remote(job).await.is_err() {
            return;
        }
        job.retry_count += 1;
        job.next_retry_at = None;
        job.error_retryable = false;
        job.reset_provider_state();
        info!(
            job_id = %job.id,
            attempt = job.retry_count,
            budget = job.policy.job_retry_budget,
            "re-queueing failed job"
        );
        self.transition(job, JobState::Queued);
    }

    async fn apply_failure(&self, cell: &mut JobCell, err: EngineError, now: DateTime<Utc>) {
        match err {
            EngineError::Cancelled { operation } => {
                debug!(job_id = %cell.job.id, operation, "operation cancelled; job left untouched");
            }
            EngineError::RateLimited {
                operation,
                retry_after,
            } => {
                let until = after(now, retry_after);
                cell.job.deferred_until = Some(until);
                self.metrics.inc_provider_rate_limited();
                info!(job_id = %cell.job.id, operation, until = %until, "provider rate limit; job deferred");
                self.events.publish(Event::JobDeferred {
                    job_id: cell.job.id,
                    until,
                });
            }
            EngineError::NotFound { resource, id } => {
                cell.job.mark_deleted_remotely();
                self.fail(cell, format!("{resource} {id} no longer exists"), false, now)
                    .await;
            }
            other => {
                let retryable = other.is_retryable();
                self.fail(cell, other.to_string(), retryable, now).await;
            }
        }
    }

    async fn fail(&self, cell: &mut JobCell, message: String, retryable: bool, now: DateTime<Utc>) {
        cell.cancel_transfers();
        let job = &mut cell.job;
        let message = match job.raw_status.as_deref() {
            Some(raw) => format!("{message} (provider status: {raw})"),
            None => message,
        };
        let will_retry = retryable && job.retry_count < job.policy.job_retry_budget;
        job.error_retryable = retryable;
        job.deferred_until = None;
        job.speed_bps = 0;
        job.next_retry_at = will_retry.then(|| after(now, self.settings.job_retry_delay()));
        if will_retry {
            info!(job_id = %job.id, error = %message, retry_count = job.retry_count, "job failed; retry scheduled");
        } else {
            warn!(job_id = %job.id, error = %message, "job failed");
        }
        job.last_error = Some(message);
        self.transition(job, JobState::Error);

        if !will_retry && cell.job.policy.delete_on_error {
            if self.delete_remote(&cell.job).await.is_err() {
                return;
            }
            remove_local_files(&cell.job).await;
            self.remove_job(cell);
        }
    }

    /// Best-effort removal of the provider entry. Only cancellation is reported.
    async fn delete_remote(&self, job: &Job) -> EngineResult<()> {
        if job.provider_id.is_none() || job.deleted_remotely {
            return Ok(());
        }
        match self.call("delete", self.client.delete(job)).await {
            Ok(()) | Err(EngineError::NotFound { .. }) => Ok(()),
            Err(err @ EngineError::Cancelled { .. }) => Err(err),
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to remove provider entry");
                Ok(())
            }
        }
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let Ok(_permit) = self.provider_calls.acquire().await else {
            return Err(EngineError::Cancelled { operation });
        };
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(EngineError::Cancelled { operation }),
            result = call => result,
        };
        self.metrics
            .inc_provider_request(operation, outcome_label(&result));
        result
    }

    fn transition(&self, job: &mut Job, state: JobState) {
        if job.state == state {
            return;
        }
        debug!(
            job_id = %job.id,
            from = job.state.as_str(),
            to = state.as_str(),
            "job state changed"
        );
        job.state = state;
        self.events.publish(Event::JobStateChanged {
            job_id: job.id,
            state,
        });
    }

    fn remove_job(&self, cell: &mut JobCell) {
        cell.cancel_transfers();
        let job_id = cell.job.id;
        if let Err(err) = self.store.delete_job(job_id) {
            warn!(job_id = %job_id, error = %err, "failed to delete persisted job");
        }
        self.unregister(job_id);
        self.events.publish(Event::JobRemoved { job_id });
        info!(job_id = %job_id, "job removed");
    }

    fn commit(&self, job: &Job) -> EngineResult<()> {
        self.sync_index(job);
        self.store.save_job(job)?;
        self.events.publish(Event::JobsChanged {
            job_ids: vec![job.id],
        });
        self.refresh_state_metrics();
        Ok(())
    }

    fn persist(&self, job: &Job) -> bool {
        match self.store.save_job(job) {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to persist job");
                false
            }
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, job: Job, reject_duplicate_hash: bool) -> EngineResult<()> {
        let mut registry = self.registry();
        if registry.slots.contains_key(&job.id) {
            return Err(EngineError::InvalidArgument {
                field: "job_id",
                reason: "duplicate",
                value: Some(job.id.to_string()),
            });
        }
        if reject_duplicate_hash
            && let Some(hash) = job.hash.as_deref()
            && registry
                .index
                .values()
                .any(|entry| entry.hash.as_deref() == Some(hash))
        {
            return Err(EngineError::InvalidArgument {
                field: "hash",
                reason: "duplicate",
                value: Some(hash.to_string()),
            });
        }
        registry.index.insert(job.id, IndexEntry::of(&job));
        registry.slots.insert(
            job.id,
            Arc::new(AsyncMutex::new(JobCell {
                job,
                transfers: HashMap::new(),
            })),
        );
        Ok(())
    }

    fn unregister(&self, job_id: Uuid) {
        let mut registry = self.registry();
        registry.slots.remove(&job_id);
        registry.index.remove(&job_id);
    }

    fn slot(&self, job_id: Uuid) -> Option<JobSlot> {
        self.registry().slots.get(&job_id).cloned()
    }

    async fn lock_job(&self, job_id: Uuid) -> EngineResult<OwnedMutexGuard<JobCell>> {
        let slot = self
            .slot(job_id)
            .ok_or_else(|| EngineError::not_found("job", job_id.to_string()))?;
        let cell = slot.lock_owned().await;
        if self.slot(job_id).is_none() {
            return Err(EngineError::not_found("job", job_id.to_string()));
        }
        Ok(cell)
    }

    fn sync_index(&self, job: &Job) {
        let mut registry = self.registry();
        if registry.slots.contains_key(&job.id) {
            registry.index.insert(job.id, IndexEntry::of(job));
        }
    }

    fn refresh_state_metrics(&self) {
        let mut counts: HashMap<JobState, i64> = HashMap::new();
        for entry in self.registry().index.values() {
            *counts.entry(entry.state).or_default() += 1;
        }
        for state in JobState::ALL {
            self.metrics
                .set_jobs_in_state(state.as_str(), counts.get(&state).copied().unwrap_or(0));
        }
    }
}

/// Delete every downloaded file of `job`; missing files are ignored.
async fn remove_local_files(job: &Job) {
    for path in job.downloads.iter().filter_map(|download| download.path.as_ref()) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(job_id = %job.id, path = %path.display(), "removed downloaded file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(job_id = %job.id, path = %path.display(), error = %err, "failed to remove downloaded file");
            }
        }
    }
}

/// Hash and display name carried by a submission, after validating it.
fn inspect_source(source: &JobSource) -> EngineResult<(Option<String>, Option<String>)> {
    let empty = |field: &'static str| EngineError::InvalidArgument {
        field,
        reason: "empty",
        value: None,
    };
    match source {
        JobSource::Magnet { uri } => {
            let magnet = MagnetLink::parse(uri)?;
            Ok((Some(magnet.info_hash), magnet.display_name))
        }
        JobSource::TorrentFile { bytes } if bytes.is_empty() => Err(empty("torrent_file")),
        JobSource::TorrentFile { .. } => Ok((None, None)),
        JobSource::NzbLink { url } => {
            validate_link(url)?;
            Ok((None, None))
        }
        JobSource::NzbFile { bytes, .. } if bytes.is_empty() => Err(empty("nzb_file")),
        JobSource::NzbFile { file_name, .. } => Ok((None, Some(file_name.clone()))),
    }
}

fn state_mismatch(state: JobState, reason: &'static str) -> EngineError {
    EngineError::InvalidArgument {
        field: "state",
        reason,
        value: Some(state.as_str().to_string()),
    }
}

/// Unset priority sorts last.
fn priority_order(a: Option<i32>, b: Option<i32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn path_segment(value: &str) -> Option<String> {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => None,
        _ => Some(cleaned),
    }
}

const fn outcome_label<T>(result: &EngineResult<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::RateLimited { .. }) => "rate_limited",
        Err(EngineError::NotFound { .. }) => "not_found",
        Err(EngineError::Cancelled { .. }) => "cancelled",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_priority_sorts_last() {
        let mut priorities = vec![None, Some(5), Some(-1), None, Some(2)];
        priorities.sort_by(|a, b| priority_order(*a, *b));
        assert_eq!(priorities, vec![Some(-1), Some(2), Some(5), None, None]);
    }

    #[test]
    fn path_segments_are_flattened() {
        assert_eq!(path_segment("Show/S01").as_deref(), Some("Show_S01"));
        assert_eq!(path_segment(" movies "), Some("movies".to_string()));
        assert_eq!(path_segment(".."), None);
        assert_eq!(path_segment("   "), None);
    }

    #[test]
    fn deadlines_saturate() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(60)), now + ChronoDuration::seconds(60));
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn sources_are_validated_before_queueing() -> anyhow::Result<()> {
        let (hash, name) = inspect_source(&JobSource::magnet(
            "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&dn=Movie",
        ))?;
        assert_eq!(hash.as_deref(), Some("0123456789abcdef0123456789abcdef01234567"));
        assert_eq!(name.as_deref(), Some("Movie"));

        assert!(inspect_source(&JobSource::magnet("magnet:?dn=nohash")).is_err());
        assert!(inspect_source(&JobSource::TorrentFile { bytes: Vec::new() }).is_err());
        assert!(inspect_source(&JobSource::NzbLink { url: "not a url".into() }).is_err());
        let (_, name) = inspect_source(&JobSource::NzbFile {
            bytes: b"<nzb/>".to_vec(),
            file_name: "show.nzb".into(),
        })?;
        assert_eq!(name.as_deref(), Some("show.nzb"));
        Ok(())
    }

    #[test]
    fn index_tracks_lifetime_and_requeue_deadlines() {
        let now = Utc::now();
        let mut job = Job::new(
            Uuid::new_v4(),
            SubmitJob {
                source: JobSource::magnet("magnet:?xt=urn:btih:abc"),
                policy: JobPolicy {
                    lifetime_minutes: Some(30),
                    ..JobPolicy::default()
                },
                name_hint: None,
            },
            None,
            now,
        );
        job.next_retry_at = Some(now);
        let entry = IndexEntry::of(&job);
        assert_eq!(entry.expires_at, Some(now + ChronoDuration::minutes(30)));
        assert_eq!(entry.requeue_at, None, "only failed jobs carry a requeue deadline");

        job.state = JobState::Error;
        assert_eq!(IndexEntry::of(&job).requeue_at, Some(now));
    }
}

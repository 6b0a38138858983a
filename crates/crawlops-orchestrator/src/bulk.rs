//! Two-phase bulk re-extraction: preview, commit, monitor, cancel pending.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use crawlops_client::{ApiError, BulkExtractionApi, JobService};
use crawlops_core::{
    plan_bulk_extraction, AggregateProgress, BulkCancelAck, BulkExtractionPreview,
    BulkExtractionRequest, BulkTriggerAck, CachedFile, JobId, JobKind, JobPriority, JobSpec,
    JobStatus,
};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::invalidation::{InvalidationBus, Topic};
use crate::OrchestratorError;

/// Source of the cached files a bulk run may re-process.
#[async_trait]
pub trait FileInventory: Send + Sync {
    async fn cached_files(&self) -> Result<Vec<CachedFile>, ApiError>;
}

/// Fixed list of files, typically loaded from an inventory file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    files: Vec<CachedFile>,
}

impl StaticInventory {
    pub fn new(files: Vec<CachedFile>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl FileInventory for StaticInventory {
    async fn cached_files(&self) -> Result<Vec<CachedFile>, ApiError> {
        Ok(self.files.clone())
    }
}

/// Bulk Extraction API served locally: one extract job per eligible file,
/// created through the regular Job Service at bulk priority. Status and cancel
/// cover the jobs of the latest trigger that enqueued anything.
pub struct InventoryBulkBackend {
    inventory: Arc<dyn FileInventory>,
    jobs: Arc<dyn JobService>,
    tracked: AsyncMutex<Vec<JobId>>,
}

impl InventoryBulkBackend {
    pub fn new(inventory: Arc<dyn FileInventory>, jobs: Arc<dyn JobService>) -> Self {
        Self {
            inventory,
            jobs,
            tracked: AsyncMutex::new(Vec::new()),
        }
    }

    pub async fn tracked_jobs(&self) -> Vec<JobId> {
        self.tracked.lock().await.clone()
    }

    fn extraction_spec(file: &CachedFile) -> JobSpec {
        JobSpec {
            target: file.target.clone(),
            year: Some(file.year),
            data_type: Some(file.data_type),
            job_type: JobKind::Extract,
            priority: JobPriority::Bulk,
            source_file: Some(file.file_id.clone()),
        }
    }
}

#[async_trait]
impl BulkExtractionApi for InventoryBulkBackend {
    async fn preview(&self, request: &BulkExtractionRequest) -> Result<BulkExtractionPreview, ApiError> {
        let files = self.inventory.cached_files().await?;
        Ok(plan_bulk_extraction(request, &files).preview)
    }

    async fn trigger(&self, request: &BulkExtractionRequest) -> Result<BulkTriggerAck, ApiError> {
        let files = self.inventory.cached_files().await?;
        let plan = plan_bulk_extraction(request, &files);
        let mut run = Vec::with_capacity(plan.eligible.len());
        let mut last_error = None;

        for file in &plan.eligible {
            match self.jobs.create_job(&Self::extraction_spec(file)).await {
                Ok(id) => run.push(id),
                Err(err) => {
                    warn!(file_id = %file.file_id, error = %err, "could not enqueue extraction");
                    last_error = Some(err);
                }
            }
        }

        let enqueued = run.len();
        match last_error {
            Some(err) if enqueued == 0 => Err(err),
            _ => {
                *self.tracked.lock().await = run;
                Ok(BulkTriggerAck { enqueued })
            }
        }
    }

    async fn status(&self) -> Result<AggregateProgress, ApiError> {
        let tracked = self.tracked_jobs().await;
        let mut progress = AggregateProgress {
            total: tracked.len(),
            ..Default::default()
        };
        for id in tracked {
            match self.jobs.get_job(id).await {
                Ok(job) => match job.status {
                    JobStatus::Pending => progress.pending += 1,
                    JobStatus::Running => progress.running += 1,
                    JobStatus::Completed => progress.completed += 1,
                    JobStatus::Failed => progress.failed += 1,
                    JobStatus::Cancelled => progress.cancelled += 1,
                },
                Err(err) if err.is_not_found() => progress.failed += 1,
                Err(err) => return Err(err),
            }
        }
        Ok(progress)
    }

    /// Checks each job and cancels the ones still pending. The Job Service has no
    /// conditional cancel, so a job that starts between the check and the cancel
    /// call is cancelled too.
    async fn cancel(&self) -> Result<BulkCancelAck, ApiError> {
        let mut cancelled = 0usize;
        for id in self.tracked_jobs().await {
            let job = match self.jobs.get_job(id).await {
                Ok(job) => job,
                Err(err) => {
                    debug!(%id, error = %err, "skipping job with unknown state");
                    continue;
                }
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            match self.jobs.cancel_job(id).await {
                Ok(ack) if ack.accepted => cancelled += 1,
                Ok(_) => debug!(%id, "cancel not accepted"),
                Err(err) => warn!(%id, error = %err, "cancel failed"),
            }
        }
        Ok(BulkCancelAck { cancelled })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkProgressState {
    pub progress: Option<AggregateProgress>,
    pub last_error: Option<String>,
    pub settled: bool,
}

/// Aggregate status polled on a fixed interval until nothing is pending or running.
pub struct BulkMonitor {
    rx: watch::Receiver<BulkProgressState>,
    task: Option<JoinHandle<()>>,
}

impl BulkMonitor {
    pub fn current(&self) -> BulkProgressState {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BulkProgressState> {
        self.rx.clone()
    }

    pub async fn settled(&self) -> BulkProgressState {
        let mut rx = self.rx.clone();
        let settled = match rx.wait_for(|s| s.settled).await {
            Ok(state) => state.clone(),
            Err(_) => self.current(),
        };
        settled
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BulkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct BulkExtractionCoordinator {
    api: Arc<dyn BulkExtractionApi>,
    bus: InvalidationBus,
    status_interval: Duration,
    last_preview: Mutex<Option<(BulkExtractionRequest, BulkExtractionPreview)>>,
}

impl BulkExtractionCoordinator {
    pub fn new(api: Arc<dyn BulkExtractionApi>, bus: InvalidationBus, status_interval: Duration) -> Self {
        Self {
            api,
            bus,
            status_interval,
            last_preview: Mutex::new(None),
        }
    }

    fn previewed(&self) -> MutexGuard<'_, Option<(BulkExtractionRequest, BulkExtractionPreview)>> {
        match self.last_preview.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Side-effect free. Remembered as the basis for the next commit.
    pub async fn preview(
        &self,
        request: &BulkExtractionRequest,
    ) -> Result<BulkExtractionPreview, OrchestratorError> {
        let preview = self
            .api
            .preview(request)
            .instrument(info_span!("bulk_preview", mode = %request.mode))
            .await?;
        info!(
            mode = %request.mode,
            total = preview.total_files,
            will_extract = preview.will_extract,
            protected = preview.protected_verified,
            overrides = preview.will_override_verified,
            "bulk preview computed"
        );
        *self.previewed() = Some((request.clone(), preview.clone()));
        Ok(preview)
    }

    /// Enqueue the previewed run. `acknowledged_overrides` must equal the previewed
    /// count of verified records that a destructive mode would overwrite.
    pub async fn commit(
        &self,
        request: &BulkExtractionRequest,
        acknowledged_overrides: Option<usize>,
    ) -> Result<BulkTriggerAck, OrchestratorError> {
        // The preview is consumed before the trigger is sent, so a concurrent
        // commit of the same preview sees `PreviewRequired`.
        let preview = {
            let mut previewed = self.previewed();
            let preview = match previewed.as_ref() {
                None => return Err(OrchestratorError::PreviewRequired),
                Some((previewed, _)) if previewed != request => return Err(OrchestratorError::PreviewMismatch),
                Some((_, preview)) => preview.clone(),
            };
            if preview.will_extract == 0 {
                return Err(OrchestratorError::NothingToExtract);
            }
            let expected = preview.will_override_verified;
            if request.mode.is_destructive() && expected > 0 && acknowledged_overrides != Some(expected) {
                return Err(OrchestratorError::OverrideNotAcknowledged { expected });
            }
            previewed.take();
            preview
        };

        let ack = match self
            .api
            .trigger(request)
            .instrument(info_span!("bulk_commit", mode = %request.mode))
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                warn!(error = %err, "bulk trigger failed; preview kept for a retry");
                let mut previewed = self.previewed();
                if previewed.is_none() {
                    *previewed = Some((request.clone(), preview));
                }
                return Err(err.into());
            }
        };
        info!(enqueued = ack.enqueued, previewed = preview.will_extract, "bulk extraction enqueued");
        self.bus.invalidate(Topic::JobList);
        self.bus.invalidate(Topic::BulkStatus);
        Ok(ack)
    }

    pub async fn status(&self) -> Result<AggregateProgress, OrchestratorError> {
        Ok(self.api.status().await?)
    }

    pub fn monitor(&self) -> BulkMonitor {
        self.spawn_monitor(false)
    }

    /// Monitor for a run that was just committed. An empty status is read as
    /// "not visible yet" rather than settled while the run enqueued jobs.
    pub fn monitor_run(&self, ack: &BulkTriggerAck) -> BulkMonitor {
        self.spawn_monitor(ack.enqueued > 0)
    }

    fn spawn_monitor(&self, expect_jobs: bool) -> BulkMonitor {
        let (tx, rx) = watch::channel(BulkProgressState::default());
        let api = Arc::clone(&self.api);
        let period = self.status_interval;
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let result = api.status().await;
                    tx.send_if_modified(|state| {
                        let before = state.clone();
                        match result {
                            Ok(progress) => {
                                state.settled = progress.is_settled()
                                    && (progress.total > 0 || !expect_jobs);
                                state.progress = Some(progress);
                                state.last_error = None;
                            }
                            Err(err) => {
                                debug!(error = %err, "bulk status fetch failed");
                                state.last_error = Some(err.to_string());
                            }
                        }
                        *state != before
                    });
                    if tx.borrow().settled {
                        info!("bulk extraction settled");
                        break;
                    }
                }
            }
            .instrument(info_span!("bulk_monitor")),
        );
        BulkMonitor {
            rx,
            task: Some(task),
        }
    }

    /// Running jobs are left to finish.
    pub async fn cancel_pending(&self) -> Result<BulkCancelAck, OrchestratorError> {
        let ack = self.api.cancel().instrument(info_span!("bulk_cancel")).await?;
        info!(cancelled = ack.cancelled, "pending bulk jobs cancelled");
        self.bus.invalidate(Topic::JobList);
        self.bus.invalidate(Topic::BulkStatus);
        Ok(ack)
    }
}

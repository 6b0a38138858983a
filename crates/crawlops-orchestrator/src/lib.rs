//! Client-side job orchestration: fan-out, polling, cancellation and bulk runs
//! against the external Job Service.

use std::sync::Arc;

use anyhow::Result;
use crawlops_client::{ApiError, BulkExtractionApi, HttpJobService, JobService};
use crawlops_core::{JobFilter, JobId, JobStatus, StepCatalog};
use thiserror::Error;

pub mod bulk;
pub mod cancel;
pub mod config;
pub mod expander;
pub mod invalidation;
pub mod poller;

#[cfg(test)]
mod testing;

pub use bulk::{
    BulkExtractionCoordinator, BulkMonitor, BulkProgressState, FileInventory, InventoryBulkBackend,
    StaticInventory,
};
pub use cancel::{CancelOutcome, CancellationController};
pub use config::{load_batch_file, load_inventory_file, load_step_catalog, OrchestratorConfig, PollSettings};
pub use expander::{expand, BatchOutcome, BatchVerdict, FailedSpec, JobRequestExpander};
pub use invalidation::{InvalidationBus, JobListView, Topic};
pub use poller::{JobPoller, PollPhase, PollSnapshot};

pub const CRATE_NAME: &str = "crawlops-orchestrator";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("job {job_id} is already {status}")]
    NotCancellable { job_id: JobId, status: JobStatus },
    #[error("a cancel request for job {0} is already in flight")]
    CancelInProgress(JobId),
    #[error("state of job {0} could not be loaded")]
    NotLoaded(JobId),
    #[error("none of the {requested} requested jobs could be created")]
    BatchFailed {
        requested: usize,
        failures: Vec<expander::FailedSpec>,
    },
    #[error("run a preview before committing a bulk extraction")]
    PreviewRequired,
    #[error("bulk request differs from the one last previewed")]
    PreviewMismatch,
    #[error("force override would overwrite {expected} verified records; acknowledge that count to proceed")]
    OverrideNotAcknowledged { expected: usize },
    #[error("no cached files are eligible for extraction")]
    NothingToExtract,
}

/// Wires the components around one Job Service and one invalidation bus.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    service: Arc<dyn JobService>,
    bulk_api: Arc<dyn BulkExtractionApi>,
    catalog: Arc<StepCatalog>,
    bus: InvalidationBus,
    cancellation: CancellationController,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        service: Arc<dyn JobService>,
        bulk_api: Arc<dyn BulkExtractionApi>,
        catalog: StepCatalog,
    ) -> Self {
        let bus = InvalidationBus::default();
        let cancellation = CancellationController::new(Arc::clone(&service), bus.clone());
        Self {
            config,
            service,
            bulk_api,
            catalog: Arc::new(catalog),
            bus,
            cancellation,
        }
    }

    /// HTTP-backed orchestrator; the backend serves the Bulk Extraction API too.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let http = Arc::new(HttpJobService::new(config.http_client_config())?);
        let catalog = config.step_catalog()?;
        Ok(Self::new(config, http.clone(), http, catalog))
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(OrchestratorConfig::from_env())
    }

    /// Plans bulk runs locally from `inventory` instead of asking the backend.
    pub fn with_inventory(mut self, inventory: Arc<dyn FileInventory>) -> Self {
        self.bulk_api = Arc::new(InventoryBulkBackend::new(inventory, Arc::clone(&self.service)));
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn service(&self) -> Arc<dyn JobService> {
        Arc::clone(&self.service)
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    pub fn expander(&self) -> JobRequestExpander {
        JobRequestExpander::new(Arc::clone(&self.service), self.bus.clone())
    }

    /// Unstarted poller for `job_id`.
    pub fn poller(&self, job_id: JobId) -> JobPoller {
        JobPoller::new(job_id, Arc::clone(&self.service), self.config.poll.clone())
    }

    pub fn watch(&self, job_id: JobId) -> JobPoller {
        let poller = self.poller(job_id);
        poller.start();
        poller
    }

    /// Shared by every caller so duplicate cancels are refused across views.
    pub fn cancellation(&self) -> &CancellationController {
        &self.cancellation
    }

    pub fn bulk(&self) -> BulkExtractionCoordinator {
        BulkExtractionCoordinator::new(
            Arc::clone(&self.bulk_api),
            self.bus.clone(),
            self.config.bulk_status_interval,
        )
    }

    pub fn job_list_view(&self, filter: JobFilter) -> JobListView {
        JobListView::new(Arc::clone(&self.service), &self.bus, filter)
    }
}

//! Fan-out of one operator action into sequential job-creation calls.

use std::fmt;
use std::sync::Arc;

use crawlops_client::JobService;
use crawlops_core::{JobId, JobPriority, JobSpec, UserIntent};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::invalidation::{InvalidationBus, Topic};
use crate::OrchestratorError;

/// Cartesian product targets × years × resolved data types, in that nesting order.
pub fn expand(intent: &UserIntent) -> Vec<JobSpec> {
    let data_types = intent.data_type.resolve();
    let mut specs = Vec::with_capacity(intent.targets.len() * intent.years.len() * data_types.len());
    for target in &intent.targets {
        for year in &intent.years {
            for data_type in &data_types {
                specs.push(JobSpec {
                    target: target.clone(),
                    year: Some(*year),
                    data_type: Some(*data_type),
                    job_type: intent.job_kind,
                    priority: JobPriority::Interactive,
                    source_file: None,
                });
            }
        }
    }
    specs
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSpec {
    pub spec: JobSpec,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVerdict {
    Empty,
    AllCreated,
    Partial,
    AllFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub requested: usize,
    pub created: Vec<JobId>,
    pub failed: Vec<FailedSpec>,
}

impl BatchOutcome {
    pub fn verdict(&self) -> BatchVerdict {
        match (self.created.len(), self.failed.len()) {
            (0, 0) => BatchVerdict::Empty,
            (_, 0) => BatchVerdict::AllCreated,
            (0, _) => BatchVerdict::AllFailed,
            _ => BatchVerdict::Partial,
        }
    }

    /// Zero successes out of a non-empty batch is an error; anything else is returned
    /// as is so partial failures stay visible to the caller.
    pub fn into_result(self) -> Result<BatchOutcome, OrchestratorError> {
        match self.verdict() {
            BatchVerdict::AllFailed => Err(OrchestratorError::BatchFailed {
                requested: self.requested,
                failures: self.failed,
            }),
            _ => Ok(self),
        }
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.verdict() {
            BatchVerdict::Empty => write!(f, "nothing to submit"),
            BatchVerdict::AllCreated => write!(f, "{} of {} jobs created", self.created.len(), self.requested),
            BatchVerdict::Partial | BatchVerdict::AllFailed => {
                write!(
                    f,
                    "{} of {} jobs created, {} failed",
                    self.created.len(),
                    self.requested,
                    self.failed.len()
                )?;
                for failure in &self.failed {
                    write!(f, "\n  {}: {}", failure.spec.describe(), failure.error)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct JobRequestExpander {
    service: Arc<dyn JobService>,
    bus: InvalidationBus,
}

impl JobRequestExpander {
    pub fn new(service: Arc<dyn JobService>, bus: InvalidationBus) -> Self {
        Self { service, bus }
    }

    pub async fn submit(&self, intent: &UserIntent) -> BatchOutcome {
        self.submit_batch(expand(intent)).await
    }

    /// Creates the specs one after another. A failed call never aborts the rest.
    pub async fn submit_batch(&self, specs: Vec<JobSpec>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            requested: specs.len(),
            ..Default::default()
        };
        if specs.is_empty() {
            return outcome;
        }

        let span = info_span!("job_batch", requested = specs.len());
        async {
            for spec in specs {
                match self.service.create_job(&spec).await {
                    Ok(id) => outcome.created.push(id),
                    Err(err) => {
                        warn!(spec = %spec.describe(), error = %err, "job creation failed");
                        outcome.failed.push(FailedSpec {
                            spec,
                            error: err.to_string(),
                        });
                    }
                }
            }
            info!(
                created = outcome.created.len(),
                failed = outcome.failed.len(),
                "batch submitted"
            );
        }
        .instrument(span)
        .await;

        self.bus.invalidate(Topic::JobList);
        outcome
    }
}

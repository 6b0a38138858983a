use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crawlops_client::JobService;
use crawlops_core::{JobId, JobStatus};
use tracing::{info, info_span, warn, Instrument};

use crate::invalidation::{InvalidationBus, Topic};
use crate::poller::{JobPoller, PollSnapshot};
use crate::OrchestratorError;

#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub job_id: JobId,
    pub accepted: bool,
    /// State fetched after the cancel round-trip.
    pub snapshot: PollSnapshot,
}

impl CancelOutcome {
    /// Whatever the backend reports, which is not necessarily `cancelled`.
    pub fn final_status(&self) -> Option<JobStatus> {
        self.snapshot.status()
    }
}

/// Issues cancel requests and re-syncs the poller from the backend afterwards.
/// Nothing is updated optimistically.
#[derive(Clone)]
pub struct CancellationController {
    service: Arc<dyn JobService>,
    bus: InvalidationBus,
    in_flight: Arc<Mutex<HashSet<JobId>>>,
}

struct InFlight {
    set: Arc<Mutex<HashSet<JobId>>>,
    job_id: JobId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.job_id);
    }
}

impl CancellationController {
    pub fn new(service: Arc<dyn JobService>, bus: InvalidationBus) -> Self {
        Self {
            service,
            bus,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_in_flight(&self, job_id: JobId) -> bool {
        match self.in_flight.lock() {
            Ok(set) => set.contains(&job_id),
            Err(poisoned) => poisoned.into_inner().contains(&job_id),
        }
    }

    fn claim(&self, job_id: JobId) -> Result<InFlight, OrchestratorError> {
        let mut set = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !set.insert(job_id) {
            return Err(OrchestratorError::CancelInProgress(job_id));
        }
        Ok(InFlight {
            set: Arc::clone(&self.in_flight),
            job_id,
        })
    }

    pub async fn cancel(&self, poller: &JobPoller) -> Result<CancelOutcome, OrchestratorError> {
        let job_id = poller.job_id();
        let mut snapshot = poller.snapshot();
        if snapshot.job.is_none() {
            snapshot = poller.refresh().await;
        }
        let status = snapshot.status().ok_or(OrchestratorError::NotLoaded(job_id))?;
        if status.is_terminal() {
            return Err(OrchestratorError::NotCancellable { job_id, status });
        }

        let _in_flight = self.claim(job_id)?;
        info!(%job_id, %status, "requesting cancellation");
        let ack = self
            .service
            .cancel_job(job_id)
            .instrument(info_span!("job_cancel", %job_id))
            .await
            .map_err(|err| {
                warn!(%job_id, error = %err, "cancel request failed");
                OrchestratorError::Api(err)
            })?;

        let snapshot = poller.refresh().await;
        if let Some(observed) = snapshot.status() {
            if observed != JobStatus::Cancelled {
                info!(%job_id, status = %observed, "job was not cancelled; backend reports a different state");
            }
        }
        self.bus.invalidate(Topic::JobList);
        Ok(CancelOutcome {
            job_id,
            accepted: ack.accepted,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::PollSettings;
    use crate::testing::{job, CancelBehavior, FakeJobService};
    use crawlops_client::ApiError;
    use crawlops_core::JobKind;

    fn setup(status: JobStatus) -> (Arc<FakeJobService>, JobId, JobPoller) {
        let svc = FakeJobService::new();
        let id = svc.insert(job(JobKind::Crawl, status));
        let poller = JobPoller::new(id, svc.clone(), PollSettings::default());
        (svc, id, poller)
    }

    #[tokio::test]
    async fn cancels_running_job_and_invalidates_once() {
        let (svc, id, poller) = setup(JobStatus::Running);
        let bus = InvalidationBus::default();
        let mut rx = bus.subscribe();
        let controller = CancellationController::new(svc.clone(), bus);

        let outcome = controller.cancel(&poller).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.final_status(), Some(JobStatus::Cancelled));
        assert_eq!(poller.snapshot().status(), Some(JobStatus::Cancelled));
        assert_eq!(svc.cancel_calls(), vec![id]);
        assert_eq!(rx.try_recv().unwrap(), Topic::JobList);
        assert!(rx.try_recv().is_err());
        assert!(!controller.is_in_flight(id));
    }

    #[tokio::test]
    async fn completion_racing_the_cancel_shows_completed() {
        let (svc, _id, poller) = setup(JobStatus::Running);
        poller.refresh().await;
        svc.on_cancel(CancelBehavior::CompleteFirst);
        let controller = CancellationController::new(svc.clone(), InvalidationBus::default());

        let outcome = controller.cancel(&poller).await.unwrap();
        assert_eq!(outcome.final_status(), Some(JobStatus::Completed));
        assert_eq!(poller.snapshot().status(), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn failed_cancel_leaves_state_untouched() {
        let (svc, id, poller) = setup(JobStatus::Running);
        let before = poller.refresh().await;
        svc.on_cancel(CancelBehavior::Fail(ApiError::Rejected {
            status: 409,
            message: "job is locked".to_string(),
        }));
        let bus = InvalidationBus::default();
        let mut rx = bus.subscribe();
        let controller = CancellationController::new(svc.clone(), bus);

        let err = controller.cancel(&poller).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Api(ApiError::Rejected { status: 409, .. })));
        assert_eq!(poller.snapshot(), before);
        assert_eq!(svc.status_of(id), Some(JobStatus::Running));
        assert!(rx.try_recv().is_err());
        assert!(!controller.is_in_flight(id));
    }

    #[tokio::test(start_paused = true)]
    async fn second_cancel_while_in_flight_is_refused() {
        let (svc, id, poller) = setup(JobStatus::Pending);
        poller.refresh().await;
        svc.cancel_latency(Duration::from_secs(1));
        let controller = CancellationController::new(svc.clone(), InvalidationBus::default());

        let (first, second) = tokio::join!(controller.cancel(&poller), controller.cancel(&poller));
        assert!(first.is_ok());
        assert!(matches!(second, Err(OrchestratorError::CancelInProgress(j)) if j == id));
        assert_eq!(svc.cancel_calls().len(), 1);
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_cancellable() {
        let (svc, _id, poller) = setup(JobStatus::Failed);
        let controller = CancellationController::new(svc.clone(), InvalidationBus::default());

        let err = controller.cancel(&poller).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NotCancellable { status: JobStatus::Failed, .. }
        ));
        assert!(svc.cancel_calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_reported_as_not_loaded() {
        let svc = FakeJobService::new();
        let poller = JobPoller::new(JobId::new_v4(), svc.clone(), PollSettings::default());
        let controller = CancellationController::new(svc.clone(), InvalidationBus::default());

        let err = controller.cancel(&poller).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotLoaded(_)));
        assert!(svc.cancel_calls().is_empty());
    }
}

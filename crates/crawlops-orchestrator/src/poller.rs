//! Per-job polling loop.
//!
//! A [`JobPoller`] fetches once immediately, then on a timer whose period depends
//! on the last observed status. Fetches for one job are serialized through a gate:
//! a scheduled tick that finds a fetch in flight is skipped, while an explicit
//! [`JobPoller::refresh`] waits its turn. Every fetch captures the poller's
//! generation; [`JobPoller::stop`] bumps it under the snapshot lock, so a fetch that
//! resolves after teardown is discarded without touching state.
//!
//! `Failed` and `NotFound` halt the timer but not the schedule: a later
//! [`JobPoller::refresh`] that observes the job again puts it back on its cadence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crawlops_client::{ApiError, JobService};
use crawlops_core::{Job, JobId, JobStatus};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::PollSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// Not started.
    Idle,
    /// Started, first snapshot not yet received.
    Loading,
    Live,
    /// Last fetch failed transiently; the last good snapshot is kept.
    Retrying,
    /// Terminal status observed.
    Settled,
    NotFound,
    /// Retry budget exhausted or the backend rejected the request.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollSnapshot {
    pub job_id: JobId,
    pub job: Option<Job>,
    pub phase: PollPhase,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl PollSnapshot {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            job: None,
            phase: PollPhase::Idle,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.job.as_ref().map(|j| j.status)
    }

    /// The timer is stopped. Only a refresh fetches again.
    pub fn is_halted(&self) -> bool {
        matches!(
            self.phase,
            PollPhase::Settled | PollPhase::NotFound | PollPhase::Failed
        )
    }
}

struct Shared {
    job_id: JobId,
    service: Arc<dyn JobService>,
    settings: PollSettings,
    generation: AtomicU64,
    fetches: AtomicU64,
    skipped_ticks: AtomicU64,
    fetch_gate: Arc<AsyncMutex<()>>,
    state: watch::Sender<PollSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn next_interval(&self) -> Option<Duration> {
        let snapshot = self.state.borrow();
        if snapshot.is_halted() {
            return None;
        }
        match &snapshot.job {
            Some(job) => self.settings.interval_for(job.kind, job.status),
            None => Some(self.settings.unknown_kind_interval()),
        }
    }

    async fn fetch(&self, generation: u64, _permit: OwnedMutexGuard<()>) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = self
            .service
            .get_job(self.job_id)
            .instrument(info_span!("job_poll", job_id = %self.job_id, generation))
            .await;
        self.apply(generation, result);
    }

    /// Returns whether the visible snapshot changed.
    fn apply(&self, generation: u64, result: Result<Job, ApiError>) -> bool {
        let max_failures = self.settings.max_consecutive_failures;
        self.state.send_if_modified(|snapshot| {
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(job_id = %self.job_id, generation, "discarding result from a stopped poller");
                return false;
            }
            let before = snapshot.clone();
            match result {
                Ok(job) => {
                    snapshot.consecutive_failures = 0;
                    snapshot.last_error = None;
                    let regressed = snapshot
                        .job
                        .as_ref()
                        .map(|prev| !prev.status.can_transition_to(job.status))
                        .unwrap_or(false);
                    if regressed {
                        warn!(
                            job_id = %self.job_id,
                            reported = %job.status,
                            "ignoring snapshot that would move status backwards"
                        );
                    } else {
                        let was_terminal = before.status().map(|s| s.is_terminal()).unwrap_or(false);
                        if job.status.is_terminal() && !was_terminal {
                            info!(job_id = %self.job_id, status = %job.status, "job reached terminal state");
                        }
                        snapshot.job = Some(job);
                    }
                    snapshot.phase = match snapshot.status() {
                        Some(status) if status.is_terminal() => PollPhase::Settled,
                        _ => PollPhase::Live,
                    };
                }
                Err(err) if err.is_not_found() => {
                    warn!(job_id = %self.job_id, "job not found; polling halted");
                    snapshot.last_error = Some(err.to_string());
                    snapshot.phase = PollPhase::NotFound;
                }
                Err(err) if err.is_transient() => {
                    snapshot.consecutive_failures += 1;
                    snapshot.last_error = Some(err.to_string());
                    if snapshot.consecutive_failures >= max_failures {
                        warn!(
                            job_id = %self.job_id,
                            failures = snapshot.consecutive_failures,
                            error = %err,
                            "retry budget exhausted; polling halted"
                        );
                        snapshot.phase = PollPhase::Failed;
                    } else {
                        debug!(job_id = %self.job_id, error = %err, "transient fetch failure");
                        snapshot.phase = PollPhase::Retrying;
                    }
                }
                Err(err) => {
                    warn!(job_id = %self.job_id, error = %err, "fetch rejected; polling halted");
                    snapshot.last_error = Some(err.to_string());
                    snapshot.phase = PollPhase::Failed;
                }
            }
            *snapshot != before
        })
    }

    /// Parks a schedule whose poller halted short of a terminal status until a
    /// refresh brings back a live snapshot. `false` means the schedule should end.
    async fn resumed(&self, generation: u64) -> bool {
        if self.state.borrow().phase == PollPhase::Settled {
            return false;
        }
        let mut rx = self.state.subscribe();
        let live = rx.wait_for(|s| !s.is_halted()).await.is_ok();
        if live {
            info!(job_id = %self.job_id, "poller revived by refresh");
        }
        live && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Claims the gate without waiting; `false` means a fetch is already in flight.
    fn try_launch(self: &Arc<Self>, generation: u64) -> bool {
        let Ok(permit) = self.fetch_gate.clone().try_lock_owned() else {
            return false;
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.fetch(generation, permit).await });
        true
    }
}

async fn run_schedule(shared: Arc<Shared>, generation: u64) {
    // The first fetch runs inline so the cadence is chosen from a real status.
    let permit = shared.fetch_gate.clone().lock_owned().await;
    shared.fetch(generation, permit).await;
    loop {
        let Some(interval) = shared.next_interval() else {
            if shared.resumed(generation).await {
                continue;
            }
            break;
        };
        tokio::time::sleep(interval).await;
        if shared.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        if shared.next_interval().is_none() {
            continue;
        }
        if !shared.try_launch(generation) {
            shared.skipped_ticks.fetch_add(1, Ordering::SeqCst);
            debug!(job_id = %shared.job_id, "tick skipped; fetch still in flight");
        }
    }
    debug!(job_id = %shared.job_id, generation, "poll schedule finished");
}

/// Live view of one job. Dropping the poller stops it.
pub struct JobPoller {
    shared: Arc<Shared>,
}

impl JobPoller {
    pub fn new(job_id: JobId, service: Arc<dyn JobService>, settings: PollSettings) -> Self {
        let (state, _rx) = watch::channel(PollSnapshot::new(job_id));
        Self {
            shared: Arc::new(Shared {
                job_id,
                service,
                settings,
                generation: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                skipped_ticks: AtomicU64::new(0),
                fetch_gate: Arc::new(AsyncMutex::new(())),
                state,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.shared.job_id
    }

    /// Start the schedule. A no-op while a schedule is already running.
    pub fn start(&self) {
        let mut task = lock(&self.shared.task);
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.state.send_if_modified(|snapshot| {
            if snapshot.phase == PollPhase::Idle {
                snapshot.phase = PollPhase::Loading;
                true
            } else {
                false
            }
        });
        *task = Some(tokio::spawn(run_schedule(Arc::clone(&self.shared), generation)));
    }

    /// Idempotent. Results of fetches already in flight are discarded.
    pub fn stop(&self) {
        self.shared.state.send_if_modified(|_| {
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            false
        });
        if let Some(handle) = lock(&self.shared.task).take() {
            handle.abort();
        }
    }

    /// Fetch authoritative state now, after any fetch already in flight. A live
    /// result resumes a schedule that halted on `Failed` or `NotFound`.
    pub async fn refresh(&self) -> PollSnapshot {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let permit = self.shared.fetch_gate.clone().lock_owned().await;
        self.shared.fetch(generation, permit).await;
        self.snapshot()
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.shared.state.subscribe()
    }

    /// Resolves with the first halted snapshot (settled, not found, or failed).
    pub async fn halted(&self) -> PollSnapshot {
        let mut rx = self.subscribe();
        let halted = match rx.wait_for(|s| s.is_halted()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        halted
    }

    pub fn fetch_count(&self) -> u64 {
        self.shared.fetches.load(Ordering::SeqCst)
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.shared.skipped_ticks.load(Ordering::SeqCst)
    }

    /// Poller for the extract job a `full` job spawned, if it has one yet.
    pub fn child(&self) -> Option<JobPoller> {
        let child_id = self.snapshot().job.and_then(|j| j.child_job_id)?;
        Some(JobPoller::new(
            child_id,
            Arc::clone(&self.shared.service),
            self.shared.settings.clone(),
        ))
    }
}

impl Drop for JobPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Scripted in-memory Job Service used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crawlops_client::{ApiError, JobService};
use crawlops_core::{CancelAck, Job, JobFilter, JobId, JobKind, JobSpec, JobStatus, JobSummary};
use tokio::sync::Notify;
use uuid::Uuid;

pub fn job(kind: JobKind, status: JobStatus) -> Job {
    Job {
        id: Uuid::new_v4(),
        kind,
        status,
        target: "springfield".to_string(),
        progress: 0.0,
        current_step: String::new(),
        steps: Vec::new(),
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        parent_job_id: None,
        child_job_id: None,
    }
}

#[derive(Debug, Clone)]
pub enum CancelBehavior {
    Cancel,
    /// The backend finished the job before the cancel landed.
    CompleteFirst,
    Fail(ApiError),
}

type CreatePredicate = Box<dyn Fn(&JobSpec) -> bool + Send + Sync>;

struct FakeState {
    jobs: HashMap<JobId, Job>,
    scripts: HashMap<JobId, VecDeque<Result<JobStatus, ApiError>>>,
    created: Vec<JobSpec>,
    created_ids: Vec<JobId>,
    fail_create: Option<CreatePredicate>,
    cancel_behavior: CancelBehavior,
    cancel_calls: Vec<JobId>,
    fetch_latency: Duration,
    cancel_latency: Duration,
    hold: Option<Arc<Notify>>,
}

pub struct FakeJobService {
    state: Mutex<FakeState>,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl Default for FakeJobService {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState {
                jobs: HashMap::new(),
                scripts: HashMap::new(),
                created: Vec::new(),
                created_ids: Vec::new(),
                fail_create: None,
                cancel_behavior: CancelBehavior::Cancel,
                cancel_calls: Vec::new(),
                fetch_latency: Duration::ZERO,
                cancel_latency: Duration::ZERO,
                hold: None,
            }),
            get_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeJobService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, job: Job) -> JobId {
        let id = job.id;
        self.state.lock().unwrap().jobs.insert(id, job);
        id
    }

    pub fn status_of(&self, id: JobId) -> Option<JobStatus> {
        self.state.lock().unwrap().jobs.get(&id).map(|j| j.status)
    }

    pub fn set_status(&self, id: JobId, status: JobStatus) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(&id) {
            job.status = status;
        }
    }

    pub fn set_progress(&self, id: JobId, progress: f64) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(&id) {
            job.progress = progress;
        }
    }

    /// Each `get_job` pops the next entry; once drained the stored job is returned as is.
    pub fn script(&self, id: JobId, steps: impl IntoIterator<Item = Result<JobStatus, ApiError>>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(id, steps.into_iter().collect());
    }

    pub fn fail_creates_when(&self, predicate: impl Fn(&JobSpec) -> bool + Send + Sync + 'static) {
        self.state.lock().unwrap().fail_create = Some(Box::new(predicate));
    }

    pub fn on_cancel(&self, behavior: CancelBehavior) {
        self.state.lock().unwrap().cancel_behavior = behavior;
    }

    pub fn fetch_latency(&self, latency: Duration) {
        self.state.lock().unwrap().fetch_latency = latency;
    }

    pub fn cancel_latency(&self, latency: Duration) {
        self.state.lock().unwrap().cancel_latency = latency;
    }

    /// Subsequent fetches block until the returned handle is notified.
    pub fn hold_fetches(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state.lock().unwrap().hold = Some(notify.clone());
        notify
    }

    pub fn created(&self) -> Vec<JobSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn created_ids(&self) -> Vec<JobId> {
        self.state.lock().unwrap().created_ids.clone()
    }

    pub fn cancel_calls(&self) -> Vec<JobId> {
        self.state.lock().unwrap().cancel_calls.clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobService for FakeJobService {
    async fn create_job(&self, spec: &JobSpec) -> Result<JobId, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create.as_ref().map(|f| f(spec)).unwrap_or(false) {
            return Err(ApiError::Transient(format!("queue unavailable for {}", spec.describe())));
        }
        let mut created = job(spec.job_type, JobStatus::Pending);
        created.target = spec.target.clone();
        let id = created.id;
        state.jobs.insert(id, created);
        state.created.push(spec.clone());
        state.created_ids.push(id);
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, ApiError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let (hold, latency) = {
            let state = self.state.lock().unwrap();
            (state.hold.clone(), state.fetch_latency)
        };
        if let Some(hold) = hold {
            hold.notified().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        let next = state.scripts.get_mut(&id).and_then(|s| s.pop_front());
        match next {
            Some(Err(err)) => return Err(err),
            Some(Ok(status)) => {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.status = status;
                }
            }
            None => {}
        }
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("job {id}")))
    }

    async fn cancel_job(&self, id: JobId) -> Result<CancelAck, ApiError> {
        let latency = self.state.lock().unwrap().cancel_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        state.cancel_calls.push(id);
        let behavior = state.cancel_behavior.clone();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;
        match behavior {
            CancelBehavior::Cancel => {
                if job.status.is_active() {
                    job.status = JobStatus::Cancelled;
                }
                Ok(CancelAck { id, accepted: true })
            }
            CancelBehavior::CompleteFirst => {
                job.status = JobStatus::Completed;
                Ok(CancelAck { id, accepted: true })
            }
            CancelBehavior::Fail(err) => Err(err),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let mut rows: Vec<JobSummary> = state
            .jobs
            .values()
            .filter(|j| filter.status.map(|s| s == j.status).unwrap_or(true))
            .filter(|j| filter.kind.map(|k| k == j.kind).unwrap_or(true))
            .map(|j| JobSummary {
                id: j.id,
                kind: j.kind,
                status: j.status,
                target: j.target.clone(),
                progress: j.progress,
                created_at: j.created_at,
            })
            .collect();
        rows.sort_by_key(|r| r.created_at);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

//! Core domain model for the crawlops job orchestration layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bulk;
pub mod steps;

pub use bulk::{
    plan_bulk_extraction, AggregateProgress, BulkCancelAck, BulkExtractionMode, BulkExtractionPlan,
    BulkExtractionPreview, BulkExtractionRequest, BulkTriggerAck, CachedFile, ExtractedRecord,
    RecordStatus,
};
pub use steps::{reconcile, RenderStep, StepCatalog, StepDefinition, Timeline, SEARCH_PIPELINE_STEPS};

pub const CRATE_NAME: &str = "crawlops-core";

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Crawl,
    Extract,
    Full,
    Search,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [JobKind::Crawl, JobKind::Extract, JobKind::Full, JobKind::Search];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Crawl => "crawl",
            JobKind::Extract => "extract",
            JobKind::Full => "full",
            JobKind::Search => "search",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job kind `{s}` (expected crawl, extract, full or search)"))
    }
}

/// Lifecycle status as reported by the Job Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Pending or running: the job still owes us state changes.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }

    /// Monotonic lifecycle: pending -> running -> terminal. Terminal states are final.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        *self == next || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// One step-status event as recorded by the backend for a job instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub label: String,
    pub status: StepStatus,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_job_id: Option<JobId>,
    #[serde(default)]
    pub child_job_id: Option<JobId>,
}

impl Job {
    /// Progress clamped to [0, 100]; backends occasionally overshoot.
    pub fn progress_percent(&self) -> f64 {
        if self.progress.is_finite() {
            self.progress.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Row shape returned by the job listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<JobKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Budget,
    Actuals,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Budget => "budget",
            DataType::Actuals => "actuals",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "budget" => Ok(DataType::Budget),
            "actuals" => Ok(DataType::Actuals),
            other => Err(format!("unknown data type `{other}` (expected budget or actuals)")),
        }
    }
}

/// Data type as chosen by an operator; `All` fans out to every concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTypeSelection {
    All,
    Budget,
    Actuals,
}

impl DataTypeSelection {
    pub fn resolve(&self) -> Vec<DataType> {
        match self {
            DataTypeSelection::All => vec![DataType::Budget, DataType::Actuals],
            DataTypeSelection::Budget => vec![DataType::Budget],
            DataTypeSelection::Actuals => vec![DataType::Actuals],
        }
    }
}

impl FromStr for DataTypeSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(DataTypeSelection::All),
            "budget" => Ok(DataTypeSelection::Budget),
            "actuals" => Ok(DataTypeSelection::Actuals),
            other => Err(format!("unknown data type `{other}` (expected all, budget or actuals)")),
        }
    }
}

/// Scheduling class. Bulk work is queued behind interactive triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Bulk,
    #[default]
    Interactive,
}

/// Creation payload for a single backend job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    pub job_type: JobKind,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl JobSpec {
    pub fn search(query: impl Into<String>) -> Self {
        Self {
            target: query.into(),
            year: None,
            data_type: None,
            job_type: JobKind::Search,
            priority: JobPriority::Interactive,
            source_file: None,
        }
    }

    pub fn describe(&self) -> String {
        let mut out = format!("{} {}", self.job_type, self.target);
        if let Some(year) = self.year {
            out.push_str(&format!(" {year}"));
        }
        if let Some(data_type) = self.data_type {
            out.push_str(&format!(" {data_type}"));
        }
        out
    }
}

/// What an operator asked for before fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIntent {
    pub targets: Vec<String>,
    pub years: Vec<i32>,
    pub data_type: DataTypeSelection,
    pub job_kind: JobKind,
}

/// Explicit queue of specs submitted as one operator action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    pub id: JobId,
    #[serde(default)]
    pub accepted: bool,
}

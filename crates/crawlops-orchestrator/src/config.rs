use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crawlops_client::{BackoffPolicy, HttpClientConfig};
use crawlops_core::{BatchRequest, CachedFile, JobKind, JobSpec, JobStatus, StepCatalog, StepDefinition};
use serde::Deserialize;

/// Per-kind polling cadence while a job is pending or running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub search: Duration,
    pub crawl: Duration,
    pub extract: Duration,
    pub full: Duration,
    /// Consecutive transient failures tolerated before the poller halts.
    pub max_consecutive_failures: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            search: Duration::from_millis(1500),
            crawl: Duration::from_millis(3000),
            extract: Duration::from_millis(3000),
            full: Duration::from_millis(5000),
            max_consecutive_failures: 5,
        }
    }
}

impl PollSettings {
    pub fn active_interval(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Search => self.search,
            JobKind::Crawl => self.crawl,
            JobKind::Extract => self.extract,
            JobKind::Full => self.full,
        }
    }

    /// `None` once the status is terminal: nothing further is scheduled.
    pub fn interval_for(&self, kind: JobKind, status: JobStatus) -> Option<Duration> {
        status.is_active().then(|| self.active_interval(kind))
    }

    /// Used before the first snapshot has arrived.
    pub fn unknown_kind_interval(&self) -> Duration {
        self.crawl
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub poll: PollSettings,
    pub bulk_status_interval: Duration,
    pub pipelines_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api".to_string(),
            api_token: None,
            user_agent: "crawlops/0.1".to_string(),
            http_timeout_secs: 20,
            poll: PollSettings::default(),
            bulk_status_interval: Duration::from_millis(5000),
            pipelines_file: None,
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let poll = PollSettings {
            search: env_millis("CRAWLOPS_POLL_SEARCH_MS", defaults.poll.search),
            crawl: env_millis("CRAWLOPS_POLL_CRAWL_MS", defaults.poll.crawl),
            extract: env_millis("CRAWLOPS_POLL_EXTRACT_MS", defaults.poll.extract),
            full: env_millis("CRAWLOPS_POLL_FULL_MS", defaults.poll.full),
            max_consecutive_failures: std::env::var("CRAWLOPS_POLL_MAX_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.poll.max_consecutive_failures),
        };
        Self {
            api_url: std::env::var("CRAWLOPS_API_URL").unwrap_or(defaults.api_url),
            api_token: std::env::var("CRAWLOPS_API_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("CRAWLOPS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("CRAWLOPS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            poll,
            bulk_status_interval: env_millis("CRAWLOPS_BULK_STATUS_MS", defaults.bulk_status_interval),
            pipelines_file: std::env::var("CRAWLOPS_PIPELINES_FILE").ok().map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            api_token: self.api_token.clone(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn step_catalog(&self) -> Result<StepCatalog> {
        match &self.pipelines_file {
            Some(path) => load_step_catalog(path),
            None => Ok(StepCatalog::builtin()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PipelinesFile {
    #[serde(default)]
    pipelines: Vec<PipelineEntry>,
}

#[derive(Debug, Deserialize)]
struct PipelineEntry {
    kind: JobKind,
    steps: Vec<String>,
}

/// Built-in catalog with per-kind overrides from a YAML file.
pub fn load_step_catalog(path: &Path) -> Result<StepCatalog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: PipelinesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut catalog = StepCatalog::builtin();
    for entry in file.pipelines {
        if entry.steps.is_empty() {
            bail!("{}: pipeline `{}` lists no steps", path.display(), entry.kind);
        }
        catalog = catalog.with_definition(entry.kind, StepDefinition::new(entry.steps));
    }
    Ok(catalog)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchFile {
    List(Vec<JobSpec>),
    Wrapped(BatchRequest),
}

/// Batch queue file: either a bare YAML list of specs or `{ jobs: [...] }`.
pub fn load_batch_file(path: &Path) -> Result<BatchRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: BatchFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match parsed {
        BatchFile::List(jobs) => BatchRequest { jobs },
        BatchFile::Wrapped(request) => request,
    })
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    files: Vec<CachedFile>,
}

/// Cached-file inventory for a locally planned bulk run (`files: [...]`).
pub fn load_inventory_file(path: &Path) -> Result<Vec<CachedFile>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: InventoryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.files)
}

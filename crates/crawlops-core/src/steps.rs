//! Canonical step definitions and the step-history reconciler.
//!
//! The backend reports step events sparsely and in arrival order. A timeline is
//! always rendered against a canonical, ordered definition: every canonical label
//! yields exactly one row, a repeated history label keeps its last record, and a
//! history label the definition does not know is dropped (and reported in
//! [`Timeline::dropped_labels`]).

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Job, JobKind, StepRecord, StepStatus};

/// Fixed stages of the search pipeline, in execution order.
pub const SEARCH_PIPELINE_STEPS: [&str; 8] = [
    "input_analysis",
    "cache_check",
    "external_search",
    "result_analysis",
    "document_discovery",
    "download",
    "validation",
    "extraction",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    labels: Vec<String>,
}

impl StepDefinition {
    /// Duplicate labels collapse onto their first position.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for label in labels {
            let label = label.into();
            if !out.contains(&label) {
                out.push(label);
            }
        }
        Self { labels: out }
    }

    pub fn search_pipeline() -> Self {
        Self::new(SEARCH_PIPELINE_STEPS)
    }

    /// Backend-driven definition: history labels in order of first occurrence.
    pub fn from_history(history: &[StepRecord]) -> Self {
        Self::new(history.iter().map(|r| r.label.clone()))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderStep {
    pub index: usize,
    pub label: String,
    pub status: StepStatus,
    pub detail: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub steps: Vec<RenderStep>,
    /// First running step in canonical order.
    pub active: Option<usize>,
    /// Highest-index done step.
    pub last_completed: Option<usize>,
    pub dropped_labels: Vec<String>,
}

impl Timeline {
    /// Step the presentation expands by default and draws the connector up to.
    pub fn focus(&self) -> Option<usize> {
        self.active.or(self.last_completed)
    }

    pub fn completed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count()
    }

    pub fn has_failure(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Merge a sparse step history onto a canonical definition.
pub fn reconcile(definition: &StepDefinition, history: &[StepRecord]) -> Timeline {
    let mut latest: HashMap<&str, &StepRecord> = HashMap::with_capacity(history.len());
    let mut dropped_labels: Vec<String> = Vec::new();
    for record in history {
        if definition.position(&record.label).is_none() {
            if !dropped_labels.contains(&record.label) {
                dropped_labels.push(record.label.clone());
            }
            continue;
        }
        latest.insert(record.label.as_str(), record);
    }

    let steps: Vec<RenderStep> = definition
        .labels()
        .iter()
        .enumerate()
        .map(|(index, label)| match latest.get(label.as_str()) {
            Some(record) => RenderStep {
                index,
                label: label.clone(),
                status: record.status,
                detail: record.detail.clone(),
                timestamp: record.timestamp,
            },
            None => RenderStep {
                index,
                label: label.clone(),
                status: StepStatus::Pending,
                detail: String::new(),
                timestamp: None,
            },
        })
        .collect();

    let active = steps
        .iter()
        .find(|s| s.status == StepStatus::Running)
        .map(|s| s.index);
    let last_completed = steps
        .iter()
        .rev()
        .find(|s| s.status == StepStatus::Done)
        .map(|s| s.index);

    Timeline {
        steps,
        active,
        last_completed,
        dropped_labels,
    }
}

/// Canonical definitions per job kind.
///
/// Kinds without an entry render against their own history
/// ([`StepDefinition::from_history`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCatalog {
    pipelines: BTreeMap<JobKind, StepDefinition>,
}

impl StepCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::empty().with_definition(JobKind::Search, StepDefinition::search_pipeline())
    }

    pub fn with_definition(mut self, kind: JobKind, definition: StepDefinition) -> Self {
        self.pipelines.insert(kind, definition);
        self
    }

    pub fn definition_for(&self, kind: JobKind) -> Option<&StepDefinition> {
        self.pipelines.get(&kind)
    }

    pub fn timeline_for(&self, job: &Job) -> Timeline {
        match self.definition_for(job.kind) {
            Some(definition) => reconcile(definition, &job.steps),
            None => reconcile(&StepDefinition::from_history(&job.steps), &job.steps),
        }
    }
}

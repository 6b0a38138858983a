//! Bulk re-extraction policy over cached source files.
//!
//! Preview and commit both go through [`plan_bulk_extraction`], so the counts an
//! operator confirms are computed by the same eligibility rule that later decides
//! which files get enqueued.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DataType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkExtractionMode {
    FlaggedOnly,
    #[default]
    Default,
    /// Re-extracts everything, verified data included.
    ForceOverride,
}

impl BulkExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkExtractionMode::FlaggedOnly => "flagged_only",
            BulkExtractionMode::Default => "default",
            BulkExtractionMode::ForceOverride => "force_override",
        }
    }

    pub fn admits(&self, status: RecordStatus) -> bool {
        match self {
            BulkExtractionMode::FlaggedOnly => status == RecordStatus::Flagged,
            BulkExtractionMode::Default => status != RecordStatus::Verified,
            BulkExtractionMode::ForceOverride => true,
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self, BulkExtractionMode::ForceOverride)
    }
}

impl fmt::Display for BulkExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkExtractionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "flagged_only" | "flagged" => Ok(BulkExtractionMode::FlaggedOnly),
            "default" => Ok(BulkExtractionMode::Default),
            "force_override" | "force" => Ok(BulkExtractionMode::ForceOverride),
            other => Err(format!(
                "unknown bulk mode `{other}` (expected flagged_only, default or force_override)"
            )),
        }
    }
}

/// State of the extracted record behind a cached file. A flag outranks verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Missing,
    Flagged,
    Unverified,
    Verified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub flagged: bool,
}

/// A previously downloaded source document and the record extracted from it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub file_id: String,
    pub target: String,
    pub year: i32,
    pub data_type: DataType,
    pub format: String,
    #[serde(default)]
    pub record: Option<ExtractedRecord>,
}

impl CachedFile {
    pub fn record_status(&self) -> RecordStatus {
        match self.record {
            None => RecordStatus::Missing,
            Some(record) if record.flagged => RecordStatus::Flagged,
            Some(record) if record.verified => RecordStatus::Verified,
            Some(_) => RecordStatus::Unverified,
        }
    }

    pub fn holds_verified_data(&self) -> bool {
        self.record.map(|r| r.verified).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkExtractionRequest {
    pub mode: BulkExtractionMode,
    /// Empty means every data type.
    #[serde(default)]
    pub data_types: Vec<DataType>,
    /// Empty means every format.
    #[serde(default)]
    pub formats: Vec<String>,
}

impl BulkExtractionRequest {
    pub fn matches(&self, file: &CachedFile) -> bool {
        let type_ok = self.data_types.is_empty() || self.data_types.contains(&file.data_type);
        let format_ok = self.formats.is_empty()
            || self
                .formats
                .iter()
                .any(|f| f.trim_start_matches('.').eq_ignore_ascii_case(&file.format));
        type_ok && format_ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkExtractionPreview {
    pub total_files: usize,
    pub will_extract: usize,
    pub protected_verified: usize,
    pub will_override_verified: usize,
    #[serde(default)]
    pub breakdown_by_status: BTreeMap<RecordStatus, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkExtractionPlan {
    pub preview: BulkExtractionPreview,
    pub eligible: Vec<CachedFile>,
}

/// Classify every file matching the request's filters under its mode.
pub fn plan_bulk_extraction(request: &BulkExtractionRequest, files: &[CachedFile]) -> BulkExtractionPlan {
    let mut preview = BulkExtractionPreview::default();
    let mut eligible = Vec::new();

    for file in files.iter().filter(|f| request.matches(f)) {
        let status = file.record_status();
        preview.total_files += 1;
        *preview.breakdown_by_status.entry(status).or_default() += 1;

        if request.mode.admits(status) {
            preview.will_extract += 1;
            if request.mode.is_destructive() && file.holds_verified_data() {
                preview.will_override_verified += 1;
            }
            eligible.push(file.clone());
        } else if status == RecordStatus::Verified {
            preview.protected_verified += 1;
        }
    }

    BulkExtractionPlan { preview, eligible }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateProgress {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(default)]
    pub cancelled: usize,
    pub total: usize,
}

impl AggregateProgress {
    /// Completed share of the total, 0 when nothing was enqueued.
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    /// No job is pending or running any more.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkTriggerAck {
    pub enqueued: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCancelAck {
    pub cancelled: usize,
}

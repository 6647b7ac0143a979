//! Test cases, runs and their outcomes.

use crate::request::Request;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Accepted response for a test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub bytes: Vec<u8>,
    pub is_text: bool,
}

/// A stored regression test definition.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: u64,
    pub name: String,
    pub description: Option<String>,
    pub category_id: Option<u64>,
    pub request: Request,
    pub baseline: Baseline,
    /// Whether the baseline was accepted for the current server build.
    /// Cases with a stale baseline are never executed.
    pub baseline_fresh: bool,
    pub latest_baseline_revision_id: Option<u64>,
    /// The user's "execute" flag.
    pub enabled: bool,
}

impl TestCase {
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.baseline_fresh
    }
}

/// Classification of one case within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OutcomeStatus {
    #[default]
    None,
    Success,
    Warning,
    Failed,
    Error,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeStatus::None => "NONE",
            OutcomeStatus::Success => "SUCCESS",
            OutcomeStatus::Warning => "WARNING",
            OutcomeStatus::Failed => "FAILED",
            OutcomeStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Result of executing one case inside one run.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub id: u64,
    pub status: OutcomeStatus,
    pub response_bytes: Vec<u8>,
    pub diff_image: Option<RgbaImage>,
    pub invalid_pixel_count: u64,
    pub big_diff_pixel_count: u64,
    pub run_id: u64,
    pub case_id: u64,
    pub case_name: String,
    /// Why the case ended in `Error`, if it did.
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Outcome {
    pub fn new(id: u64, run_id: u64, case: &TestCase) -> Self {
        Self {
            id,
            status: OutcomeStatus::None,
            response_bytes: Vec::new(),
            diff_image: None,
            invalid_pixel_count: 0,
            big_diff_pixel_count: 0,
            run_id,
            case_id: case.id,
            case_name: case.name.clone(),
            error: None,
            duration_ms: 0,
        }
    }

    /// Resolve a status still unset at publication time to `Error`.
    pub fn finalize_status(&mut self) {
        if self.status == OutcomeStatus::None {
            self.status = OutcomeStatus::Error;
            if self.error.is_none() {
                self.error = Some("comparison produced no status".to_string());
            }
        }
    }

    pub fn report(&self) -> OutcomeReport {
        OutcomeReport {
            id: self.id,
            run_id: self.run_id,
            case_id: self.case_id,
            case_name: self.case_name.clone(),
            status: self.status,
            invalid_pixel_count: self.invalid_pixel_count,
            big_diff_pixel_count: self.big_diff_pixel_count,
            response_size: self.response_bytes.len(),
            error: self.error.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Batch metadata for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: u64,
    pub started_at: DateTime<Utc>,
    pub description: String,
    pub server_prefix: String,
}

/// Narrows the set of cases a store hands out for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    /// Case-insensitive substring of the case name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category_id: Option<u64>,
}

impl RunFilter {
    pub fn matches(&self, case: &TestCase) -> bool {
        if let Some(name) = &self.name {
            if !case.name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        if let Some(category) = self.category_id {
            if case.category_id != Some(category) {
                return false;
            }
        }
        true
    }
}

/// Per-status counts for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub warning: usize,
    pub failed: usize,
    pub error: usize,
    /// Eligible cases that were never fetched because of cancellation.
    pub not_run: usize,
    pub cancelled: bool,
    pub duration_ms: u64,
    /// The run as registered with the result sink.
    #[serde(skip)]
    pub run: Option<TestRun>,
}

impl RunSummary {
    pub fn record(&mut self, status: OutcomeStatus) {
        self.total += 1;
        match status {
            OutcomeStatus::Success => self.success += 1,
            OutcomeStatus::Warning => self.warning += 1,
            OutcomeStatus::Failed => self.failed += 1,
            OutcomeStatus::Error | OutcomeStatus::None => self.error += 1,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.error == 0
    }
}

/// Serializable view of an [`Outcome`] without payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub id: u64,
    pub run_id: u64,
    pub case_id: u64,
    pub case_name: String,
    pub status: OutcomeStatus,
    pub invalid_pixel_count: u64,
    pub big_diff_pixel_count: u64,
    pub response_size: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Full report written at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: TestRun,
    pub outcomes: Vec<OutcomeReport>,
    pub summary: RunSummary,
}

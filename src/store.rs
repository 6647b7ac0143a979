//! Seams to the persistence layer: where cases come from and where
//! outcomes go.

use crate::codec::{self, PayloadKind};
use crate::diff::{DiffConfig, DiffEngine};
use crate::model::{Baseline, Outcome, OutcomeReport, RunFilter, TestCase, TestRun};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Receives runs and their outcomes.
///
/// `prepare` runs outside the run's critical section, on a blocking
/// worker thread for compared outcomes, and may do slow work such as
/// file output. `publish` is called
/// from inside the critical section, one outcome at a time, and is
/// called even when `prepare` failed. UI adapters re-dispatch from
/// `publish` onto their own thread.
pub trait ResultSink: Send + Sync {
    /// Persist run metadata and return the id assigned to the run.
    fn begin_run(&self, run: &TestRun) -> Result<u64>;

    fn prepare(&self, _outcome: &Outcome) -> Result<()> {
        Ok(())
    }

    fn publish(&self, outcome: Outcome) -> Result<()>;
}

/// Source of test cases and their baselines.
pub trait CaseStore {
    /// Cases matching `filter` that are enabled and have a fresh
    /// baseline.
    fn list_eligible_cases(&self, filter: &RunFilter) -> Result<Vec<TestCase>>;

    fn load_baseline(&self, case_id: u64) -> Result<Baseline>;
}

/// Keeps every published outcome in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    next_run_id: AtomicU64,
    outcomes: Mutex<Vec<Outcome>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes in publication order.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reports(&self) -> Vec<OutcomeReport> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Outcome::report)
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn begin_run(&self, _run: &TestRun) -> Result<u64> {
        Ok(self.next_run_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn publish(&self, outcome: Outcome) -> Result<()> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
        Ok(())
    }
}

/// Writes response, diff and overlay files for every outcome into a
/// `run-<id>` directory below `root`.
#[derive(Debug)]
pub struct DirectorySink {
    root: PathBuf,
    engine: DiffEngine,
    run_dir: Mutex<Option<PathBuf>>,
    reports: Mutex<Vec<OutcomeReport>>,
}

impl DirectorySink {
    pub fn new<P: AsRef<Path>>(root: P, diff: DiffConfig) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            engine: DiffEngine::new(diff),
            run_dir: Mutex::new(None),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Directory of the current run, once `begin_run` was called.
    pub fn run_dir(&self) -> Option<PathBuf> {
        self.run_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reports(&self) -> Vec<OutcomeReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_run_id(&self) -> Result<u64> {
        if !self.root.exists() {
            return Ok(1);
        }
        let mut max = 0;
        for entry in fs::read_dir(&self.root)
            .context(format!("Failed to read directory: {}", self.root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("run-"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                max = max.max(id);
            }
        }
        Ok(max + 1)
    }

    fn write_artifacts(&self, dir: &Path, outcome: &Outcome) -> Result<()> {
        let stem = format!("{}-{}", outcome.case_id, slugify(&outcome.case_name));

        let ext = match codec::sniff(&outcome.response_bytes) {
            PayloadKind::Empty => None,
            PayloadKind::Text => Some("txt"),
            PayloadKind::Image(format) => {
                Some(format.extensions_str().first().copied().unwrap_or("img"))
            }
        };
        if let Some(ext) = ext {
            let path = dir.join(format!("{stem}.response.{ext}"));
            fs::write(&path, &outcome.response_bytes)
                .context(format!("Failed to write {}", path.display()))?;
        }

        if let Some(diff) = &outcome.diff_image {
            let path = dir.join(format!("{stem}.diff.png"));
            fs::write(&path, codec::encode(diff))
                .context(format!("Failed to write {}", path.display()))?;

            if let Some(img) = codec::decode(&outcome.response_bytes) {
                let overlay = self.engine.compose(
                    &img,
                    diff,
                    self.engine.config().colors.background,
                );
                let path = dir.join(format!("{stem}.overlay.png"));
                fs::write(&path, codec::encode(&overlay))
                    .context(format!("Failed to write {}", path.display()))?;
            }
        }
        Ok(())
    }
}

impl ResultSink for DirectorySink {
    fn begin_run(&self, run: &TestRun) -> Result<u64> {
        let id = self.next_run_id()?;
        let dir = self.root.join(format!("run-{id}"));
        fs::create_dir_all(&dir)
            .context(format!("Failed to create run directory: {}", dir.display()))?;
        let meta = serde_json::to_string_pretty(&TestRun { id, ..run.clone() })?;
        fs::write(dir.join("run.json"), meta)?;
        info!("Writing run artifacts to {}", dir.display());
        *self.run_dir.lock().unwrap_or_else(PoisonError::into_inner) = Some(dir);
        Ok(id)
    }

    fn prepare(&self, outcome: &Outcome) -> Result<()> {
        if let Some(dir) = self.run_dir() {
            self.write_artifacts(&dir, outcome)?;
            debug!("Wrote artifacts for case {}", outcome.case_id);
        }
        Ok(())
    }

    fn publish(&self, outcome: Outcome) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome.report());
        Ok(())
    }
}

/// File-name friendly form of a case name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if (ch.is_whitespace() || matches!(ch, '-' | '_' | '.'))
            && !slug.ends_with('_')
        {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

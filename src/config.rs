//! Runner configuration and loading of test suites from disk.

use crate::codec;
use crate::diff::{DiffConfig, ThresholdPolicy};
use crate::model::{Baseline, RunFilter, TestCase};
use crate::request::Request;
use crate::store::CaseStore;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Settings for a run, usually read from `mapregress.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Address the raw requests are appended to, e.g.
    /// `http://localhost:8080/cgi-bin/mapserv`.
    #[serde(default)]
    pub server_prefix: String,
    /// Appended to the prefix for the connectivity probe.
    #[serde(default)]
    pub probe_path: String,
    /// Number of comparisons allowed to run at the same time.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub policy: ThresholdPolicy,
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            server_prefix: String::new(),
            probe_path: String::new(),
            worker_pool_size: default_worker_pool_size(),
            request_timeout: default_request_timeout(),
            diff: DiffConfig::default(),
            policy: ThresholdPolicy::default(),
        }
    }
}

impl RunnerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading runner config from {}", path.display());
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))
    }

    /// URL requested before any case runs.
    pub fn probe_url(&self) -> String {
        if self.probe_path.is_empty() {
            return self.server_prefix.clone();
        }
        format!(
            "{}/{}",
            self.server_prefix.trim_end_matches('/'),
            self.probe_path.trim_start_matches('/')
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_prefix.is_empty() {
            bail!("server_prefix is not configured");
        }
        url::Url::parse(&self.server_prefix)
            .context(format!("Invalid server_prefix: {}", self.server_prefix))?;
        if self.worker_pool_size == 0 {
            bail!("worker_pool_size must be at least 1");
        }
        Ok(())
    }
}

/// One test case as written in a suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDefinition {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Raw request, appended to the server prefix.
    pub request: String,
    /// Baseline file, relative to the suite file.
    pub baseline: PathBuf,
    #[serde(default = "default_true")]
    pub baseline_fresh: bool,
    #[serde(default)]
    pub baseline_revision: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Contents of a suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteFile {
    pub cases: Vec<CaseDefinition>,
}

impl CaseDefinition {
    fn into_test_case(self, base_dir: &Path) -> Result<TestCase> {
        let path = base_dir.join(&self.baseline);
        let bytes = fs::read(&path)
            .context(format!("Failed to read baseline: {}", path.display()))?;
        let is_text = codec::decode(&bytes).is_none();
        Ok(TestCase {
            id: self.id,
            name: self.name,
            description: self.description,
            category_id: self.category_id,
            request: Request::parse(&self.request),
            baseline: Baseline { bytes, is_text },
            baseline_fresh: self.baseline_fresh,
            latest_baseline_revision_id: self.baseline_revision,
            enabled: self.enabled,
        })
    }
}

/// Loads test cases from suite files (`.yaml` / `.yml`).
#[derive(Debug, Default)]
pub struct SuiteLoader {
    pub suite_paths: Vec<PathBuf>,
}

impl SuiteLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.suite_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load every case of one suite file.
    pub fn load_suite<P: AsRef<Path>>(&self, path: P) -> Result<Vec<TestCase>> {
        let path = path.as_ref();
        info!("Loading test suite from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read suite file: {}", path.display()))?;
        let suite: SuiteFile = serde_yaml::from_str(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut cases = Vec::with_capacity(suite.cases.len());
        for def in suite.cases {
            let name = def.name.clone();
            let case = def
                .into_test_case(base_dir)
                .context(format!("Failed to load case '{name}'"))?;
            if !case.request.is_plausible {
                warn!(
                    "Case '{}' has an implausible request: {} {} {}",
                    case.name,
                    case.request.service,
                    case.request.request_type,
                    case.request.format
                );
            }
            cases.push(case);
        }

        debug!("Loaded {} cases from {}", cases.len(), path.display());
        Ok(cases)
    }

    pub fn load_suites_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<TestCase>> {
        let dir = dir.as_ref();
        info!("Loading test suites from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_suite_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut cases = Vec::new();
        for path in paths {
            match self.load_suite(&path) {
                Ok(mut loaded) => cases.append(&mut loaded),
                Err(err) => {
                    warn!("Failed to load suite from {}: {:#}", path.display(), err);
                }
            }
        }
        Ok(cases)
    }

    /// Every case from every configured path, with duplicate ids
    /// rejected.
    pub fn load_all(&self) -> Result<Vec<TestCase>> {
        let mut all = Vec::new();
        for path in &self.suite_paths {
            if path.is_dir() {
                all.append(&mut self.load_suites_from_dir(path)?);
            } else if path.is_file() {
                all.append(&mut self.load_suite(path)?);
            } else {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
        }

        let mut seen = HashSet::new();
        for case in &all {
            if !seen.insert(case.id) {
                bail!("Duplicate test case id {} ('{}')", case.id, case.name);
            }
        }

        info!("Loaded {} test cases in total", all.len());
        Ok(all)
    }
}

impl CaseStore for SuiteLoader {
    fn list_eligible_cases(&self, filter: &RunFilter) -> Result<Vec<TestCase>> {
        let cases = self.load_all()?;
        let total = cases.len();
        let eligible: Vec<TestCase> = cases
            .into_iter()
            .filter(|c| c.is_eligible() && filter.matches(c))
            .collect();
        debug!("{} of {} cases are eligible", eligible.len(), total);
        Ok(eligible)
    }

    fn load_baseline(&self, case_id: u64) -> Result<Baseline> {
        self.load_all()?
            .into_iter()
            .find(|c| c.id == case_id)
            .map(|c| c.baseline)
            .ok_or_else(|| anyhow!("No test case with id {case_id}"))
    }
}

fn is_suite_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

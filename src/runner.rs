//! Batch execution of test cases.
//!
//! A run fetches cases one at a time on its own task and hands every
//! response to a bounded pool of comparison workers, so fetching never
//! waits for comparisons. Every outcome is finalized inside one critical
//! section that also counts pending comparisons; the run is done once
//! fetching has stopped and that count reaches zero.
//!
//! Cancellation is checked before each fetch only. Comparisons that were
//! already dispatched always finish and are published.

use crate::codec;
use crate::config::RunnerConfig;
use crate::diff::{DiffEngine, DiffResult, StatusPolicy};
use crate::error::{CaseError, RunError};
use crate::model::{Baseline, Outcome, OutcomeStatus, RunSummary, TestCase, TestRun};
use crate::store::ResultSink;
use crate::transport::Fetcher;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Starts runs against one server with one fetcher and result sink.
///
/// The comparison pool is shared by every run started from the same
/// runner.
pub struct TestRunner {
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn ResultSink>,
    engine: Arc<DiffEngine>,
    policy: Arc<dyn StatusPolicy>,
    workers: Arc<Semaphore>,
    server_prefix: String,
    probe_url: String,
}

impl TestRunner {
    pub fn new(
        config: &RunnerConfig,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            fetcher,
            sink,
            engine: Arc::new(DiffEngine::new(config.diff)),
            policy: Arc::new(config.policy),
            workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            server_prefix: config.server_prefix.clone(),
            probe_url: config.probe_url(),
        }
    }

    /// Replace the status policy derived from the config.
    pub fn with_policy(mut self, policy: Arc<dyn StatusPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Start a run over `cases` on the current tokio runtime.
    ///
    /// Only enabled cases with a fresh baseline are executed. Cancelling
    /// `cancel` (or calling [`RunHandle::cancel`]) stops further fetches.
    pub fn start_run(
        &self,
        description: &str,
        cases: Vec<TestCase>,
        cancel: CancellationToken,
    ) -> RunHandle {
        let (done_tx, done_rx) = watch::channel(false);
        let ctx = Arc::new(RunContext {
            sink: Arc::clone(&self.sink),
            engine: Arc::clone(&self.engine),
            policy: Arc::clone(&self.policy),
            state: Mutex::new(RunState::default()),
            done: done_tx,
            next_outcome_id: AtomicU64::new(1),
        });
        let run = TestRun {
            id: 0,
            started_at: Utc::now(),
            description: description.to_string(),
            server_prefix: self.server_prefix.clone(),
        };
        let driver = RunDriver {
            ctx,
            fetcher: Arc::clone(&self.fetcher),
            workers: Arc::clone(&self.workers),
            probe_url: self.probe_url.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.execute(run, cases));

        RunHandle {
            cancel,
            done: done_rx,
            task,
        }
    }
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    task: JoinHandle<Result<RunSummary, RunError>>,
}

impl RunHandle {
    /// True once every dispatched case has been published, or the run
    /// was aborted by the connectivity probe.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until [`is_done`](Self::is_done) turns true.
    pub async fn wait(&mut self) {
        // An error means the run task is gone, which also ends the wait.
        let _ = self.done.wait_for(|done| *done).await;
    }

    /// Wait for the run and return its summary.
    pub async fn join(self) -> Result<RunSummary, RunError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(RunError::Aborted(err.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    pending: usize,
    draining: bool,
    summary: RunSummary,
}

/// State shared between the fetch loop and comparison tasks of one run.
struct RunContext {
    sink: Arc<dyn ResultSink>,
    engine: Arc<DiffEngine>,
    policy: Arc<dyn StatusPolicy>,
    state: Mutex<RunState>,
    done: watch::Sender<bool>,
    next_outcome_id: AtomicU64,
}

impl RunContext {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_outcome_id(&self) -> u64 {
        self.next_outcome_id.fetch_add(1, Ordering::SeqCst)
    }

    fn begin_case(&self) {
        self.lock().pending += 1;
    }

    /// Publish one outcome. Every dispatched case passes through here
    /// exactly once.
    ///
    /// Blocks while the sink prepares the outcome; call it from a blocking
    /// worker for compared outcomes.
    fn finalize(&self, mut outcome: Outcome, started: Instant) {
        outcome.finalize_status();
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        if let Err(err) = self.sink.prepare(&outcome) {
            error!(
                "Failed to prepare outcome for case {}: {:#}",
                outcome.case_id, err
            );
        }

        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        state.summary.record(outcome.status);

        match &outcome.error {
            Some(err) => warn!(
                case = %outcome.case_name,
                status = %outcome.status,
                "{}", err
            ),
            None => info!(
                case = %outcome.case_name,
                status = %outcome.status,
                invalid = outcome.invalid_pixel_count,
                big = outcome.big_diff_pixel_count,
                "Case finished"
            ),
        }

        let case_id = outcome.case_id;
        if let Err(err) = self.sink.publish(outcome) {
            error!("Failed to publish outcome for case {}: {:#}", case_id, err);
        }

        if state.pending == 0 && state.draining {
            self.done.send_replace(true);
        }
    }

    /// Stop accepting work and wait for in-flight comparisons.
    async fn drain(&self) {
        {
            let mut state = self.lock();
            state.draining = true;
            if state.pending == 0 {
                self.done.send_replace(true);
            }
        }
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Compare a fetched response against the case's baseline.
    fn compare(&self, case: &TestCase, mut outcome: Outcome, bytes: Vec<u8>) -> Outcome {
        match self.compare_payload(&case.baseline, &bytes) {
            Ok((status, diff)) => {
                outcome.status = status;
                if let Some(diff) = diff {
                    outcome.invalid_pixel_count = diff.invalid_pixels;
                    outcome.big_diff_pixel_count = diff.big_diff_pixels;
                    outcome.diff_image = Some(diff.image);
                }
            }
            Err(err) => {
                outcome.status = OutcomeStatus::Error;
                outcome.error = Some(err.to_string());
            }
        }
        outcome.response_bytes = bytes;
        outcome
    }

    fn compare_payload(
        &self,
        baseline: &Baseline,
        bytes: &[u8],
    ) -> Result<(OutcomeStatus, Option<DiffResult>), CaseError> {
        let candidate = codec::decode(bytes);

        let candidate = match (candidate, baseline.is_text) {
            (None, true) => {
                return if codec::text_eq(bytes, &baseline.bytes) {
                    Ok((OutcomeStatus::Success, None))
                } else {
                    Err(CaseError::TextMismatch)
                };
            }
            (None, false) => {
                return Err(CaseError::DecodeMismatch {
                    expected: "an image",
                    actual: "not an image",
                })
            }
            (Some(_), true) => {
                return Err(CaseError::DecodeMismatch {
                    expected: "text",
                    actual: "an image",
                })
            }
            (Some(img), false) => img,
        };

        let reference = codec::decode(&baseline.bytes).ok_or(CaseError::CorruptBaseline)?;
        if candidate.dimensions() != reference.dimensions() {
            let (actual_w, actual_h) = candidate.dimensions();
            let (expected_w, expected_h) = reference.dimensions();
            return Err(CaseError::DimensionMismatch {
                expected_w,
                expected_h,
                actual_w,
                actual_h,
            });
        }

        let diff = self.engine.classify(&candidate, &reference);
        let status = self.policy.status(&diff);
        Ok((status, Some(diff)))
    }
}

/// Owns the fetch loop of one run.
struct RunDriver {
    ctx: Arc<RunContext>,
    fetcher: Arc<dyn Fetcher>,
    workers: Arc<Semaphore>,
    probe_url: String,
    cancel: CancellationToken,
}

impl RunDriver {
    #[instrument(skip_all, fields(run = %run.description))]
    async fn execute(self, mut run: TestRun, cases: Vec<TestCase>) -> Result<RunSummary, RunError> {
        let start = Instant::now();

        info!("Probing server at {}", self.probe_url);
        if let Err(source) = self.fetcher.fetch(&self.probe_url).await {
            error!("Connectivity probe failed, aborting run: {}", source);
            self.ctx.done.send_replace(true);
            return Err(RunError::ProbeFailed {
                url: self.probe_url.clone(),
                source,
            });
        }

        run.id = match self.ctx.sink.begin_run(&run) {
            Ok(id) => id,
            Err(err) => {
                self.ctx.done.send_replace(true);
                return Err(RunError::Sink(format!("{err:#}")));
            }
        };

        let total = cases.len();
        let selected: Vec<TestCase> = cases.into_iter().filter(TestCase::is_eligible).collect();
        info!(
            "Starting run {}: {} of {} cases selected",
            run.id,
            selected.len(),
            total
        );

        let mut dispatched = 0;
        for (idx, case) in selected.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Run cancelled before case {}/{}", idx + 1, selected.len());
                break;
            }
            dispatched += 1;
            self.ctx.begin_case();

            let started = Instant::now();
            let outcome = Outcome::new(self.ctx.next_outcome_id(), run.id, case);
            let url = case.request.url(&run.server_prefix);
            info!("Fetching case {}/{}: {}", idx + 1, selected.len(), case.name);

            match self.fetcher.fetch(&url).await {
                Ok(bytes) => self.dispatch(case.clone(), outcome, bytes, started),
                Err(err) => {
                    let mut outcome = outcome;
                    outcome.status = OutcomeStatus::Error;
                    outcome.error = Some(CaseError::from(err).to_string());
                    self.ctx.finalize(outcome, started);
                }
            }
        }

        debug!("Fetch loop finished, draining comparisons");
        self.ctx.drain().await;

        let mut summary = self.ctx.lock().summary.clone();
        summary.run = Some(run.clone());
        summary.not_run = selected.len() - dispatched;
        summary.cancelled = self.cancel.is_cancelled() && summary.not_run > 0;
        summary.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Run {} finished: {} success, {} warning, {} failed, {} error, {} not run ({} ms)",
            run.id,
            summary.success,
            summary.warning,
            summary.failed,
            summary.error,
            summary.not_run,
            summary.duration_ms
        );
        Ok(summary)
    }

    /// Queue a comparison on the worker pool without waiting for it.
    fn dispatch(&self, case: TestCase, outcome: Outcome, bytes: Vec<u8>, started: Instant) {
        let ctx = Arc::clone(&self.ctx);
        let workers = Arc::clone(&self.workers);

        tokio::spawn(async move {
            let fallback = outcome.clone();
            let permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    let mut outcome = fallback;
                    outcome.status = OutcomeStatus::Error;
                    outcome.error = Some(format!("worker pool closed: {err}"));
                    ctx.finalize(outcome, started);
                    return;
                }
            };

            let worker_ctx = Arc::clone(&ctx);
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let outcome = worker_ctx.compare(&case, outcome, bytes);
                worker_ctx.finalize(outcome, started);
            })
            .await;

            if let Err(err) = joined {
                error!("Comparison task failed: {}", err);
                let mut outcome = fallback;
                outcome.status = OutcomeStatus::Error;
                outcome.error = Some(format!("comparison task failed: {err}"));
                ctx.finalize(outcome, started);
            }
        });
    }
}

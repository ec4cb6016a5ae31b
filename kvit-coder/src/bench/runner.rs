//! The top-level benchmark runner.
//!
//! Runs every benchmark `runs_per_task` times, strictly sequentially,
//! appending each result to the CSV log as soon as it exists. A
//! pre-existing log implies resume: completed `(benchmark, run)` pairs
//! are skipped. Successful runs have their workspace removed; failed
//! runs keep it for forensic inspection.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;

use super::csvlog::ResultLog;
use super::definition::BenchmarkDefinition;
use super::executor::Executor;
use super::report::ReportGenerator;
use super::result::RunResult;

/// Window of recent run durations feeding the ETA estimate.
const ETA_WINDOW: usize = 10;

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Runs per benchmark.
    pub runs_per_task: u32,
    /// Ignore an existing CSV and start over.
    pub fresh_start: bool,
    /// Path of the append-only results CSV.
    pub results_csv: PathBuf,
    /// Where to write the Markdown report; `None` skips it.
    pub report_path: Option<PathBuf>,
    /// Version identifier embedded in the report appendix.
    pub version: String,
    /// Literal configuration text embedded in the report appendix.
    pub config_text: String,
    /// Suppress the stderr progress bar.
    pub quiet: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            runs_per_task: 1,
            fresh_start: false,
            results_csv: PathBuf::from("benchmark-results.csv"),
            report_path: None,
            version: concat!("kvit-coder ", env!("CARGO_PKG_VERSION")).to_owned(),
            config_text: String::new(),
            quiet: false,
        }
    }
}

/// Drives a benchmark suite through the [`Executor`].
#[derive(Debug)]
pub struct Harness {
    executor: Executor,
    config: HarnessConfig,
}

impl Harness {
    /// Create a harness.
    #[must_use]
    pub fn new(executor: Executor, config: HarnessConfig) -> Self {
        Self { executor, config }
    }

    /// Run the whole suite, returning every result (resumed and fresh).
    ///
    /// # Errors
    ///
    /// Surfaces CSV-log and report I/O errors; per-run failures are
    /// recorded as failed results instead.
    pub async fn run_all(
        &self,
        benchmarks: &[BenchmarkDefinition],
        cancel: &CancellationToken,
    ) -> Result<Vec<RunResult>> {
        let log = ResultLog::new(&self.config.results_csv);
        if self.config.fresh_start || !log.exists() {
            log.start_fresh()?;
        }
        let completed = log.completed()?;
        if !completed.is_empty() {
            info!(completed = completed.len(), "resuming from existing results");
        }

        let total = benchmarks.len() * self.config.runs_per_task as usize;
        let mut finished = 0usize;
        let mut recent: VecDeque<Duration> = VecDeque::with_capacity(ETA_WINDOW);

        for benchmark in benchmarks {
            for run in 1..=self.config.runs_per_task {
                if completed.contains(&(benchmark.id.clone(), run)) {
                    finished += 1;
                    continue;
                }
                if cancel.is_cancelled() {
                    warn!("benchmark run cancelled");
                    break;
                }

                let timer = Instant::now();
                let result = match self.executor.execute(benchmark, run, cancel).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(benchmark = %benchmark.id, run, error = %err, "run errored");
                        RunResult::failed(&benchmark.id, run, err.to_string())
                    }
                };
                log.append(&result)?;

                if result.success {
                    if let Err(err) = self.executor.environment().remove_workspace().await {
                        warn!(error = %err, "workspace cleanup failed");
                    }
                }

                finished += 1;
                if recent.len() == ETA_WINDOW {
                    recent.pop_front();
                }
                recent.push_back(timer.elapsed());
                if !self.config.quiet {
                    eprint!(
                        "\r{}",
                        progress_line(&benchmark.id, run, finished, total, eta(&recent, total - finished))
                    );
                }
            }
        }
        if !self.config.quiet {
            eprintln!();
        }

        let all = log.load()?;
        if let Some(path) = &self.config.report_path {
            let report = ReportGenerator::new(&self.config.version, &self.config.config_text)
                .generate(benchmarks, &all);
            tokio::fs::write(path, report).await?;
            info!(path = %path.display(), "report written");
        }
        Ok(all)
    }
}

/// Textual progress bar plus ETA.
fn progress_line(
    benchmark_id: &str,
    run: u32,
    finished: usize,
    total: usize,
    eta: Option<Duration>,
) -> String {
    const WIDTH: usize = 20;
    let filled = if total == 0 {
        WIDTH
    } else {
        (finished * WIDTH) / total
    };
    let bar: String = (0..WIDTH).map(|i| if i < filled { '#' } else { '-' }).collect();
    let eta_text = eta.map_or_else(
        || "--".to_owned(),
        |d| format!("{}s", d.as_secs()),
    );
    format!("[{bar}] {finished}/{total} ({benchmark_id} run {run}) ETA {eta_text}")
}

/// Rolling-window ETA over the most recent run durations.
fn eta(recent: &VecDeque<Duration>, remaining: usize) -> Option<Duration> {
    if recent.is_empty() || remaining == 0 {
        return None;
    }
    let total: Duration = recent.iter().sum();
    let avg = total / u32::try_from(recent.len()).unwrap_or(1);
    Some(avg * u32::try_from(remaining).unwrap_or(u32::MAX))
}

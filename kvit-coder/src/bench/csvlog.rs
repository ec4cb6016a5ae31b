//! Append-only CSV log of run results, with crash-resume support.
//!
//! The log is the harness's source of truth across process restarts: a
//! `(benchmark_id, run)` pair present in the log is never re-executed.
//! Three header generations exist in the wild (11, 13, and the current
//! 17 columns) and all of them load; new rows are always written in the
//! 17-column schema.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{CoderError, Result};

use super::result::{RunResult, ToolInvocation};

/// The current column set.
pub const CSV_HEADER: [&str; 17] = [
    "benchmark_id",
    "run",
    "success",
    "llm_calls",
    "tokens",
    "prompt_tokens",
    "generated_tokens",
    "cached_tokens",
    "context_used",
    "cost",
    "duration_ms",
    "prompt_ms",
    "generation_ms",
    "tool_calls_json",
    "errors_json",
    "started_at",
    "completed_at",
];

/// Column counts of the legacy header generations still accepted on read.
const LEGACY_WIDTHS: [usize; 3] = [11, 13, 17];

/// Handle to the on-disk results log.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    /// Create a handle; nothing is written until the first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The log's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a log already exists (implies resume).
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Truncate the log and write a fresh header.
    ///
    /// # Errors
    ///
    /// Surfaces I/O and CSV errors.
    pub fn start_fresh(&self) -> Result<()> {
        let mut writer = csv::Writer::from_path(&self.path)?;
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
        Ok(())
    }

    /// Append one result, creating the file with a header when missing.
    ///
    /// # Errors
    ///
    /// Surfaces I/O, CSV, and JSON errors.
    pub fn append(&self, result: &RunResult) -> Result<()> {
        if !self.exists() {
            self.start_fresh()?;
        }
        let file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        let row = [
            result.benchmark_id.clone(),
            result.run_number.to_string(),
            result.success.to_string(),
            result.llm_calls.to_string(),
            result.tokens.to_string(),
            result.prompt_tokens.to_string(),
            result.generated_tokens.to_string(),
            result.cached_tokens.to_string(),
            result.context_used.to_string(),
            result.cost.to_string(),
            result.duration_ms.to_string(),
            result.prompt_ms.to_string(),
            result.generation_ms.to_string(),
            serde_json::to_string(&result.tool_calls)?,
            serde_json::to_string(&result.errors)?,
            result.started_at.to_rfc3339(),
            result.completed_at.to_rfc3339(),
        ];
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }

    /// Load every row, accepting all legacy column counts.
    ///
    /// # Errors
    ///
    /// Surfaces I/O and CSV errors, and a benchmark error for rows with
    /// an unknown width.
    pub fn load(&self) -> Result<Vec<RunResult>> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)?;

        let mut results = Vec::new();
        for record in reader.records() {
            let record = record?;
            results.push(parse_record(&record)?);
        }
        Ok(results)
    }

    /// The `(benchmark_id, run)` pairs already completed.
    ///
    /// # Errors
    ///
    /// Everything [`load`](Self::load) reports.
    pub fn completed(&self) -> Result<HashSet<(String, u32)>> {
        Ok(self
            .load()?
            .into_iter()
            .map(|r| (r.benchmark_id, r.run_number))
            .collect())
    }
}

fn parse_record(record: &csv::StringRecord) -> Result<RunResult> {
    let width = record.len();
    if !LEGACY_WIDTHS.contains(&width) {
        return Err(CoderError::bench(format!(
            "unsupported results row width {width}"
        )));
    }

    let field = |idx: usize| record.get(idx).unwrap_or_default();
    let num = |idx: usize| field(idx).parse::<u64>().unwrap_or(0);

    let mut result = RunResult {
        benchmark_id: field(0).to_owned(),
        run_number: field(1).parse().unwrap_or(0),
        success: field(2).parse().unwrap_or(false),
        errors: Vec::new(),
        llm_calls: num(3),
        tokens: num(4),
        prompt_tokens: num(5),
        generated_tokens: num(6),
        cached_tokens: num(7),
        context_used: num(8),
        cost: field(9).parse().unwrap_or(0.0),
        duration_ms: num(10),
        prompt_ms: 0,
        generation_ms: 0,
        tool_calls: Vec::new(),
        started_at: DateTime::<Utc>::MIN_UTC,
        completed_at: DateTime::<Utc>::MIN_UTC,
    };

    if width >= 13 {
        result.prompt_ms = num(11);
        result.generation_ms = num(12);
    }
    if width >= 17 {
        result.tool_calls =
            serde_json::from_str::<Vec<ToolInvocation>>(field(13)).unwrap_or_default();
        result.errors = serde_json::from_str::<Vec<String>>(field(14)).unwrap_or_default();
        result.started_at = parse_timestamp(field(15));
        result.completed_at = parse_timestamp(field(16));
    }
    Ok(result)
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

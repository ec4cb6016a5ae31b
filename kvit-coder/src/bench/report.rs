//! Markdown report over a finished benchmark suite.
//!
//! Aggregates are grouped per category and per benchmark (natural-sorted,
//! so `E2` precedes `E10`), numeric columns are reported as mean ± stddev,
//! and the appendix embeds the harness version and the literal
//! configuration text the suite ran with.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;

use super::definition::BenchmarkDefinition;
use super::result::RunResult;

/// Builds the Markdown report.
#[derive(Debug, Clone)]
pub struct ReportGenerator {
    version: String,
    config_text: String,
}

impl ReportGenerator {
    /// Create a generator embedding `version` and `config_text` in the
    /// appendix.
    #[must_use]
    pub fn new(version: impl Into<String>, config_text: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            config_text: config_text.into(),
        }
    }

    /// Render the full report.
    #[must_use]
    pub fn generate(
        &self,
        benchmarks: &[BenchmarkDefinition],
        results: &[RunResult],
    ) -> String {
        let mut by_benchmark: BTreeMap<&str, Vec<&RunResult>> = BTreeMap::new();
        for result in results {
            by_benchmark
                .entry(result.benchmark_id.as_str())
                .or_default()
                .push(result);
        }

        let mut ids: Vec<&str> = by_benchmark.keys().copied().collect();
        ids.sort_by(|a, b| natural_cmp(a, b));

        let category_of = |id: &str| {
            benchmarks
                .iter()
                .find(|b| b.id == id)
                .map_or("uncategorised", |b| b.category.as_str())
        };

        let mut out = String::new();
        out.push_str("# Benchmark Report\n\n");
        out.push_str(&format!("Generated: {}\n\n", Utc::now().to_rfc3339()));

        // Per-category aggregates.
        out.push_str("## Results by category\n\n");
        out.push_str("| Category | Benchmarks | Runs | Passed | Success rate |\n");
        out.push_str("|---|---|---|---|---|\n");
        let mut categories: BTreeMap<&str, (usize, usize, usize)> = BTreeMap::new();
        for id in &ids {
            let runs = &by_benchmark[id];
            let entry = categories.entry(category_of(id)).or_default();
            entry.0 += 1;
            entry.1 += runs.len();
            entry.2 += runs.iter().filter(|r| r.success).count();
        }
        for (category, (benchmarks, runs, passed)) in &categories {
            out.push_str(&format!(
                "| {category} | {benchmarks} | {runs} | {passed} | {} |\n",
                rate(*passed, *runs)
            ));
        }
        out.push('\n');

        // Per-benchmark summary.
        out.push_str("## Results by benchmark\n\n");
        out.push_str(
            "| Benchmark | Category | Runs | Passed | LLM calls | Tokens | Cost | Duration (ms) |\n",
        );
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for id in &ids {
            let runs = &by_benchmark[id];
            let passed = runs.iter().filter(|r| r.success).count();
            out.push_str(&format!(
                "| {id} | {} | {} | {passed} | {} | {} | {} | {} |\n",
                category_of(id),
                runs.len(),
                mean_stddev_cell(runs, |r| r.llm_calls as f64),
                mean_stddev_cell(runs, |r| r.tokens as f64),
                mean_stddev_cell(runs, |r| r.cost),
                mean_stddev_cell(runs, |r| r.duration_ms as f64),
            ));
        }
        out.push('\n');

        // Per-run details.
        out.push_str("## Run details\n\n");
        for id in &ids {
            out.push_str(&format!("### {id}\n\n"));
            out.push_str("| Run | Result | LLM calls | Tokens | Cost | Duration (ms) | Tools |\n");
            out.push_str("|---|---|---|---|---|---|---|\n");
            let mut runs: Vec<&&RunResult> = by_benchmark[id].iter().collect();
            runs.sort_by_key(|r| r.run_number);
            for run in runs {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {:.4} | {} | {} |\n",
                    run.run_number,
                    if run.success { "pass" } else { "FAIL" },
                    run.llm_calls,
                    run.tokens,
                    run.cost,
                    run.duration_ms,
                    tool_summary(run),
                ));
            }
            let failures: Vec<&str> = by_benchmark[id]
                .iter()
                .flat_map(|r| r.errors.iter())
                .map(String::as_str)
                .collect();
            if !failures.is_empty() {
                out.push_str("\nFailures:\n\n");
                for failure in failures {
                    out.push_str(&format!("- {failure}\n"));
                }
            }
            out.push('\n');
        }

        // Appendix.
        out.push_str("## Appendix\n\n");
        out.push_str(&format!("Version: `{}`\n\n", self.version));
        out.push_str("Configuration:\n\n```\n");
        out.push_str(&self.config_text);
        if !self.config_text.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("```\n");
        out
    }
}

/// Compare with embedded integers ordered numerically: `E2` < `E10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars().peekable();
    let mut cb = b.chars().peekable();

    loop {
        match (ca.peek().copied(), cb.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                if x.is_ascii_digit() && y.is_ascii_digit() {
                    let na = take_number(&mut ca);
                    let nb = take_number(&mut cb);
                    match na.cmp(&nb) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                } else {
                    match x.cmp(&y) {
                        Ordering::Equal => {
                            ca.next();
                            cb.next();
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u64 {
    let mut value = 0u64;
    while let Some(c) = chars.peek().copied() {
        let Some(digit) = c.to_digit(10) else { break };
        value = value.saturating_mul(10).saturating_add(u64::from(digit));
        chars.next();
    }
    value
}

/// Sample mean and standard deviation.
#[must_use]
pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

#[allow(clippy::cast_precision_loss)]
fn mean_stddev_cell(runs: &[&RunResult], pick: impl Fn(&RunResult) -> f64) -> String {
    let values: Vec<f64> = runs.iter().map(|r| pick(r)).collect();
    let (mean, stddev) = mean_stddev(&values);
    format!("{mean:.2} ± {stddev:.2}")
}

fn rate(passed: usize, total: usize) -> String {
    if total == 0 {
        "n/a".to_owned()
    } else {
        format!("{:.0}%", 100.0 * passed as f64 / total as f64)
    }
}

fn tool_summary(run: &RunResult) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for call in &run.tool_calls {
        *counts.entry(call.name.as_str()).or_default() += 1;
    }
    if counts.is_empty() {
        "(none)".to_owned()
    } else {
        counts
            .iter()
            .map(|(name, count)| format!("{name}×{count}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

//! The per-run result record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::AgentStats;

/// One tool call observed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// The outcome of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Benchmark this run belongs to.
    pub benchmark_id: String,
    /// 1-based run number.
    pub run_number: u32,
    /// Whether every validation check passed.
    pub success: bool,
    /// Validation and execution errors.
    pub errors: Vec<String>,
    /// LLM calls made.
    pub llm_calls: u64,
    /// Total tokens.
    pub tokens: u64,
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub generated_tokens: u64,
    /// Cached prompt tokens.
    pub cached_tokens: u64,
    /// Largest context observed in one call.
    pub context_used: u64,
    /// Total cost in credits.
    pub cost: f64,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Milliseconds waiting for first tokens, summed.
    pub prompt_ms: u64,
    /// Milliseconds generating, summed.
    pub generation_ms: u64,
    /// Tool calls, in order.
    pub tool_calls: Vec<ToolInvocation>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run completed.
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    /// An empty, failed result for runs that never got to validation.
    #[must_use]
    pub fn failed(benchmark_id: impl Into<String>, run_number: u32, error: String) -> Self {
        let now = Utc::now();
        Self {
            benchmark_id: benchmark_id.into(),
            run_number,
            success: false,
            errors: vec![error],
            llm_calls: 0,
            tokens: 0,
            prompt_tokens: 0,
            generated_tokens: 0,
            cached_tokens: 0,
            context_used: 0,
            cost: 0.0,
            duration_ms: 0,
            prompt_ms: 0,
            generation_ms: 0,
            tool_calls: Vec::new(),
            started_at: now,
            completed_at: now,
        }
    }

    /// Fold agent statistics into the numeric columns.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn apply_stats(&mut self, stats: &AgentStats) {
        self.llm_calls = stats.steps;
        self.tokens = stats.total_tokens();
        self.prompt_tokens = stats.total_prompt_tokens;
        self.generated_tokens = stats.total_completion_tokens;
        self.cached_tokens = stats.total_cache_read_tokens;
        self.context_used = stats.max_context_observed;
        self.cost = stats.total_cost;
        self.duration_ms = u64::try_from(stats.total_agent_time.as_millis()).unwrap_or(u64::MAX);
        self.prompt_ms = stats.total_prompt_ms.max(0.0).round() as u64;
        self.generation_ms = stats.total_generation_ms.max(0.0).round() as u64;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::usage::Usage;

    #[test]
    fn failed_results_carry_the_error() {
        let result = RunResult::failed("E1", 2, "workspace rebuild failed".to_owned());
        assert!(!result.success);
        assert_eq!(result.run_number, 2);
        assert_eq!(result.errors, vec!["workspace rebuild failed".to_owned()]);
        assert_eq!(result.llm_calls, 0);
    }

    #[test]
    fn apply_stats_copies_the_numeric_columns() {
        let mut stats = AgentStats::default();
        stats.steps = 3;
        stats.record_usage(Usage::new(100, 40));
        stats.total_agent_time = Duration::from_millis(2500);
        stats.total_prompt_ms = 320.4;

        let mut result = RunResult::failed("E1", 1, String::new());
        result.apply_stats(&stats);

        assert_eq!(result.llm_calls, 3);
        assert_eq!(result.tokens, 140);
        assert_eq!(result.prompt_tokens, 100);
        assert_eq!(result.generated_tokens, 40);
        assert_eq!(result.duration_ms, 2500);
        assert_eq!(result.prompt_ms, 320);
        assert_eq!(result.context_used, 140);
    }
}

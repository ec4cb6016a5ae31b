//! Token usage and per-run statistics.
//!
//! [`Usage`] mirrors the usage object of the chat-completions wire format.
//! [`GenerationStats`] is the richer record returned by the optional
//! `/generation` follow-up query, carrying native token counts, latency,
//! and cost. [`AgentStats`] accumulates everything the agent loop observes
//! over one run, including tokens discarded by backtracking.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Token usage statistics from a single chat completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u64,

    /// Number of tokens in the completion.
    #[serde(default)]
    pub completion_tokens: u64,

    /// Total tokens used.
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Create a new usage record.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Detailed generation statistics from the `/generation` endpoint.
///
/// Native token counts come from the upstream provider's own tokenizer and
/// are preferred over the approximate counts in [`Usage`] when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Prompt tokens as counted by the gateway.
    #[serde(default)]
    pub tokens_prompt: u64,

    /// Completion tokens as counted by the gateway.
    #[serde(default)]
    pub tokens_completion: u64,

    /// Prompt tokens as counted by the native provider.
    #[serde(default)]
    pub native_tokens_prompt: u64,

    /// Completion tokens as counted by the native provider.
    #[serde(default)]
    pub native_tokens_completion: u64,

    /// Cached prompt tokens reused by the native provider.
    #[serde(default)]
    pub native_tokens_cached: u64,

    /// Milliseconds until the first token.
    #[serde(default)]
    pub latency: f64,

    /// Milliseconds spent generating.
    #[serde(default)]
    pub generation_time: f64,

    /// Total cost of the generation in credits.
    #[serde(default)]
    pub total_cost: f64,

    /// Fraction of the prompt cost discounted via caching.
    #[serde(default)]
    pub cache_discount: f64,
}

impl GenerationStats {
    /// Prompt token count, preferring the native figure when available.
    #[must_use]
    pub const fn prompt_tokens(&self) -> u64 {
        if self.native_tokens_prompt > 0 {
            self.native_tokens_prompt
        } else {
            self.tokens_prompt
        }
    }

    /// Completion token count, preferring the native figure when available.
    #[must_use]
    pub const fn completion_tokens(&self) -> u64 {
        if self.native_tokens_completion > 0 {
            self.native_tokens_completion
        } else {
            self.tokens_completion
        }
    }
}

/// Cumulative statistics for one agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    /// Prompt tokens across all LLM calls.
    pub total_prompt_tokens: u64,
    /// Completion tokens across all LLM calls.
    pub total_completion_tokens: u64,
    /// Cached prompt tokens reported by generation stats.
    pub total_cache_read_tokens: u64,
    /// Largest single-call context (prompt + completion) observed.
    pub max_context_observed: u64,
    /// Total cost in credits.
    pub total_cost: f64,
    /// Latest cache discount reported by generation stats.
    pub cache_discount: f64,
    /// Milliseconds spent waiting for first tokens, summed.
    pub total_prompt_ms: f64,
    /// Milliseconds spent generating, summed.
    pub total_generation_ms: f64,
    /// Number of LLM calls made, including failed attempts.
    pub steps: u64,
    /// Wall-clock time of the whole run.
    #[serde(with = "duration_ms")]
    pub total_agent_time: Duration,
    /// Time spent inside LLM calls.
    #[serde(with = "duration_ms")]
    pub total_llm_time: Duration,
    /// Time spent inside tool executors.
    #[serde(with = "duration_ms")]
    pub total_tool_time: Duration,
    /// Prompt tokens thrown away by backtracking.
    pub discarded_prompt_tokens: u64,
    /// Completion tokens thrown away by backtracking.
    pub discarded_completion_tokens: u64,
    /// Cost of discarded generations.
    pub discarded_cost: f64,
    /// Number of backtracks performed.
    pub backtrack_count: u64,
}

impl AgentStats {
    /// Fold one completed call's usage into the totals.
    pub fn record_usage(&mut self, usage: Usage) {
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_completion_tokens += usage.completion_tokens;
        self.max_context_observed = self.max_context_observed.max(usage.total_tokens);
    }

    /// Fold native generation stats into the totals. Call after
    /// [`record_usage`](Self::record_usage) for the same completion; the
    /// native token counts replace the wire counts recorded there.
    pub fn record_generation(&mut self, wire: Usage, stats: &GenerationStats) {
        self.total_prompt_tokens =
            self.total_prompt_tokens - wire.prompt_tokens + stats.prompt_tokens();
        self.total_completion_tokens =
            self.total_completion_tokens - wire.completion_tokens + stats.completion_tokens();
        self.total_cache_read_tokens += stats.native_tokens_cached;
        self.total_cost += stats.total_cost;
        self.cache_discount = stats.cache_discount;
        self.total_prompt_ms += stats.latency;
        self.total_generation_ms += stats.generation_time;
    }

    /// Move the last generation's tokens from the active totals to the
    /// discarded totals. Called when a backtrack throws the generation
    /// away: discarded work must not count as progress.
    pub fn move_to_discarded(&mut self, prompt: u64, completion: u64, cost: f64) {
        self.total_prompt_tokens = self.total_prompt_tokens.saturating_sub(prompt);
        self.total_completion_tokens = self.total_completion_tokens.saturating_sub(completion);
        self.total_cost = (self.total_cost - cost).max(0.0);
        self.discarded_prompt_tokens += prompt;
        self.discarded_completion_tokens += completion;
        self.discarded_cost += cost;
        self.backtrack_count += 1;
    }

    /// Total tokens across prompt and completion.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }

    /// One-line run summary for stderr.
    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "steps={} tokens={} (prompt={} completion={} cached={}) cost={:.4} time={:.1}s (llm={:.1}s tools={:.1}s)",
            self.steps,
            self.total_tokens(),
            self.total_prompt_tokens,
            self.total_completion_tokens,
            self.total_cache_read_tokens,
            self.total_cost,
            self.total_agent_time.as_secs_f64(),
            self.total_llm_time.as_secs_f64(),
            self.total_tool_time.as_secs_f64(),
        )
    }
}

mod duration_ms {
    //! Serialize `Duration` as integer milliseconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        u64::try_from(d.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn usage_new_computes_total() {
        let u = Usage::new(10, 5);
        assert_eq!(u.total_tokens, 15);
    }

    #[test]
    fn generation_stats_prefer_native_counts() {
        let stats = GenerationStats {
            tokens_prompt: 90,
            tokens_completion: 40,
            native_tokens_prompt: 100,
            native_tokens_completion: 50,
            ..GenerationStats::default()
        };
        assert_eq!(stats.prompt_tokens(), 100);
        assert_eq!(stats.completion_tokens(), 50);

        let stats = GenerationStats {
            tokens_prompt: 90,
            tokens_completion: 40,
            ..GenerationStats::default()
        };
        assert_eq!(stats.prompt_tokens(), 90);
        assert_eq!(stats.completion_tokens(), 40);
    }

    #[test]
    fn record_generation_replaces_wire_counts() {
        let mut stats = AgentStats::default();
        let wire = Usage::new(100, 20);
        stats.record_usage(wire);
        assert_eq!(stats.total_prompt_tokens, 100);

        let native = GenerationStats {
            native_tokens_prompt: 110,
            native_tokens_completion: 25,
            native_tokens_cached: 40,
            total_cost: 0.5,
            ..GenerationStats::default()
        };
        stats.record_generation(wire, &native);
        assert_eq!(stats.total_prompt_tokens, 110);
        assert_eq!(stats.total_completion_tokens, 25);
        assert_eq!(stats.total_cache_read_tokens, 40);
        assert!((stats.total_cost - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn max_context_tracks_largest_call() {
        let mut stats = AgentStats::default();
        stats.record_usage(Usage::new(100, 20));
        stats.record_usage(Usage::new(500, 50));
        stats.record_usage(Usage::new(200, 10));
        assert_eq!(stats.max_context_observed, 550);
    }

    #[test]
    fn discarded_tokens_leave_the_active_totals() {
        let mut stats = AgentStats::default();
        stats.record_usage(Usage::new(100, 20));
        stats.record_usage(Usage::new(80, 30));
        stats.move_to_discarded(80, 30, 0.1);

        assert_eq!(stats.total_prompt_tokens, 100);
        assert_eq!(stats.total_completion_tokens, 20);
        assert_eq!(stats.discarded_prompt_tokens, 80);
        assert_eq!(stats.discarded_completion_tokens, 30);
        assert_eq!(stats.backtrack_count, 1);
    }

    #[test]
    fn summary_line_mentions_steps_and_tokens() {
        let mut stats = AgentStats::default();
        stats.steps = 3;
        stats.record_usage(Usage::new(10, 5));
        let line = stats.summary_line();
        assert!(line.contains("steps=3"));
        assert!(line.contains("tokens=15"));
    }

    #[test]
    fn agent_stats_serde_roundtrip() {
        let mut stats = AgentStats::default();
        stats.steps = 2;
        stats.total_agent_time = Duration::from_millis(1500);
        let json = serde_json::to_string(&stats).unwrap();
        let parsed: AgentStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total_agent_time, Duration::from_millis(1500));
        assert_eq!(parsed.steps, 2);
    }
}

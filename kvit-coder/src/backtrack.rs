//! Bounded retry of backtrackable tool failures.
//!
//! When a tool call fails with a semantic (model-correctable) error, the
//! loop may discard the assistant turn and its tool errors and retry from
//! the previous history state. The tracker bounds how many times that is
//! allowed *at the same history length*: making progress (history grows)
//! resets the budget, spinning in place does not.

use std::sync::Mutex;

use crate::usage::Usage;

/// Backtracking policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct BacktrackConfig {
    /// Master switch. Disabled means every failure is written to history.
    pub enabled: bool,
    /// Retries allowed at one history length.
    pub max_retries: u32,
    /// On exhaustion, rewind anyway and inject a corrective user message
    /// instead of falling back to an in-history error.
    pub inject_user_on_exhaustion: bool,
}

impl Default for BacktrackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            inject_user_on_exhaustion: false,
        }
    }
}

/// Tokens and cost thrown away by backtracking.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiscardedStats {
    /// Discarded prompt tokens.
    pub prompt_tokens: u64,
    /// Discarded completion tokens.
    pub completion_tokens: u64,
    /// Discarded cost.
    pub cost: f64,
    /// Number of discarded generations.
    pub count: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    current_history_len: usize,
    retries_at_point: u32,
    discarded: DiscardedStats,
}

/// Retry counter keyed by history length.
#[derive(Debug)]
pub struct BacktrackTracker {
    config: BacktrackConfig,
    state: Mutex<TrackerState>,
}

impl BacktrackTracker {
    /// Create a tracker with the given policy.
    #[must_use]
    pub fn new(config: BacktrackConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// The active policy.
    #[must_use]
    pub const fn config(&self) -> &BacktrackConfig {
        &self.config
    }

    /// Decide whether to backtrack at the given history length.
    ///
    /// Moving to a new history length resets the counter; each call at the
    /// same length consumes one retry. Returns `false` when disabled or
    /// when the budget at this point is spent.
    #[must_use]
    pub fn should_backtrack(&self, history_len: usize) -> bool {
        if !self.config.enabled || self.config.max_retries == 0 {
            return false;
        }
        let mut state = self.lock();
        if state.current_history_len != history_len {
            state.current_history_len = history_len;
            state.retries_at_point = 0;
        }
        state.retries_at_point += 1;
        state.retries_at_point <= self.config.max_retries
    }

    /// Retries consumed at the current history length.
    #[must_use]
    pub fn retries_at_point(&self) -> u32 {
        self.lock().retries_at_point
    }

    /// Account for a generation discarded by a backtrack.
    pub fn record_discarded(&self, usage: Usage, cost: f64) {
        let mut state = self.lock();
        state.discarded.prompt_tokens += usage.prompt_tokens;
        state.discarded.completion_tokens += usage.completion_tokens;
        state.discarded.cost += cost;
        state.discarded.count += 1;
    }

    /// Snapshot of the discarded totals.
    #[must_use]
    pub fn discarded(&self) -> DiscardedStats {
        self.lock().discarded
    }

    /// The corrective user message injected on exhaustion.
    #[must_use]
    pub fn exhaustion_message(&self, error: &str) -> String {
        format!(
            "Your last action failed: {error}. You have retried {} times. \
             Read the error carefully and take the correct action.",
            self.retries_at_point()
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for BacktrackTracker {
    fn default() -> Self {
        Self::new(BacktrackConfig::default())
    }
}

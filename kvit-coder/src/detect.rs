//! Detection of repeated tool-call patterns.
//!
//! Every completed tool call is reduced to a [`fingerprint`], a short
//! hash of the tool name, the canonicalised arguments, and a prefix of the
//! result, and recorded in a bounded ring. Three independent detectors
//! run over the ring:
//!
//! | detector    | trigger                                                |
//! |-------------|--------------------------------------------------------|
//! | identical   | the last N records share one fingerprint               |
//! | error run   | the last N records are errors from the same tool       |
//! | alternating | the last 2N records flip between two fingerprints      |
//!
//! A detection is reported to the model as a `<system-reminder>` appended
//! to the most recent tool result, not as a run-terminating error.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Maximum number of records kept in the ring.
pub const HISTORY_CAP: usize = 20;

/// Result-prefix length folded into the fingerprint.
const RESULT_PREFIX_BYTES: usize = 200;

/// Recursively sort object keys so that fingerprints are stable under key
/// reordering.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by_key(|(k, _)| k.as_str());
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sort(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Fingerprint of one completed tool call: 16 hex characters over
/// `(tool_name, canonical args, first 200 bytes of the result)`.
#[must_use]
pub fn fingerprint(tool_name: &str, args: &Value, result: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_json(args).as_bytes());
    hasher.update([0]);
    let prefix = &result.as_bytes()[..result.len().min(RESULT_PREFIX_BYTES)];
    hasher.update(prefix);
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// One recorded tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRecord {
    /// Fingerprint of the call.
    pub fingerprint: String,
    /// Name of the tool.
    pub tool_name: String,
    /// Whether the call produced an error result.
    pub is_error: bool,
}

/// Classification of an identical-loop detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopClass {
    /// Every repeated call errored.
    Error,
    /// No repeated call errored.
    Success,
    /// A mix of errors and successes.
    Mixed,
}

/// The kind of loop detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// The same fingerprint repeated `identical_threshold` times.
    Identical(LoopClass),
    /// `error_threshold` consecutive errors from one tool.
    ErrorRun,
    /// Two distinct fingerprints alternating for `alternating_cycles`
    /// full cycles.
    Alternating,
}

/// A triggered detection, ready to be rendered for the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDetection {
    /// Which detector fired.
    pub kind: LoopKind,
    /// Tool involved in the loop (first of the pair, for alternating).
    pub tool_name: String,
    /// Number of repeats observed.
    pub count: usize,
}

impl LoopDetection {
    /// Reminder block appended to the most recent tool result.
    #[must_use]
    pub fn reminder(&self) -> String {
        let body = match self.kind {
            LoopKind::Identical(LoopClass::Error) => format!(
                "The last {} calls to '{}' were identical and all failed with the same error. \
                 Repeating the call will fail again. Read the error carefully and try a different approach.",
                self.count, self.tool_name
            ),
            LoopKind::Identical(LoopClass::Success | LoopClass::Mixed) => format!(
                "The last {} calls to '{}' were identical and returned the same result. \
                 You already have this information. Try a different approach.",
                self.count, self.tool_name
            ),
            LoopKind::ErrorRun => format!(
                "The last {} calls to '{}' all failed. The current approach is not working. \
                 Try a different approach.",
                self.count, self.tool_name
            ),
            LoopKind::Alternating => format!(
                "Your last {} tool calls alternate between the same two operations without \
                 making progress. Step back and try a different approach.",
                self.count
            ),
        };
        format!("\n\n<system-reminder>\n{body}\n</system-reminder>")
    }
}

/// Bounded ring of tool-call records with the three detectors.
#[derive(Debug)]
pub struct LoopDetector {
    records: Mutex<VecDeque<LoopRecord>>,
    identical_threshold: usize,
    error_threshold: usize,
    alternating_cycles: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(3, 4, 3)
    }
}

impl LoopDetector {
    /// Create a detector with explicit thresholds.
    #[must_use]
    pub fn new(identical_threshold: usize, error_threshold: usize, alternating_cycles: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            identical_threshold: identical_threshold.max(2),
            error_threshold: error_threshold.max(2),
            alternating_cycles: alternating_cycles.max(2),
        }
    }

    /// Record one completed tool call.
    pub fn record(&self, tool_name: &str, args: &Value, result: &str, is_error: bool) {
        let record = LoopRecord {
            fingerprint: fingerprint(tool_name, args, result),
            tool_name: tool_name.to_owned(),
            is_error,
        };
        let mut records = self.lock();
        if records.len() == HISTORY_CAP {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Clear all records. Called on new user input.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run the detectors in order: identical, error run, alternating.
    #[must_use]
    pub fn detect(&self) -> Option<LoopDetection> {
        let records = self.lock();
        detect_identical(&records, self.identical_threshold)
            .or_else(|| detect_error_run(&records, self.error_threshold))
            .or_else(|| detect_alternating(&records, self.alternating_cycles))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LoopRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn detect_identical(records: &VecDeque<LoopRecord>, threshold: usize) -> Option<LoopDetection> {
    if records.len() < threshold {
        return None;
    }
    let tail: Vec<&LoopRecord> = records.iter().rev().take(threshold).collect();
    let first = tail[0];
    if !tail.iter().all(|r| r.fingerprint == first.fingerprint) {
        return None;
    }
    let errors = tail.iter().filter(|r| r.is_error).count();
    let class = if errors == threshold {
        LoopClass::Error
    } else if errors == 0 {
        LoopClass::Success
    } else {
        LoopClass::Mixed
    };
    Some(LoopDetection {
        kind: LoopKind::Identical(class),
        tool_name: first.tool_name.clone(),
        count: threshold,
    })
}

fn detect_error_run(records: &VecDeque<LoopRecord>, threshold: usize) -> Option<LoopDetection> {
    if records.len() < threshold {
        return None;
    }
    let tail: Vec<&LoopRecord> = records.iter().rev().take(threshold).collect();
    let first = tail[0];
    if tail
        .iter()
        .all(|r| r.is_error && r.tool_name == first.tool_name)
    {
        Some(LoopDetection {
            kind: LoopKind::ErrorRun,
            tool_name: first.tool_name.clone(),
            count: threshold,
        })
    } else {
        None
    }
}

fn detect_alternating(records: &VecDeque<LoopRecord>, cycles: usize) -> Option<LoopDetection> {
    let span = cycles * 2;
    if records.len() < span {
        return None;
    }
    let tail: Vec<&LoopRecord> = records.iter().skip(records.len() - span).collect();
    let (a, b) = (&tail[0].fingerprint, &tail[1].fingerprint);
    if a == b {
        return None;
    }
    let alternates = tail
        .iter()
        .enumerate()
        .all(|(i, r)| r.fingerprint == *if i % 2 == 0 { a } else { b });
    alternates.then(|| LoopDetection {
        kind: LoopKind::Alternating,
        tool_name: tail[0].tool_name.clone(),
        count: span,
    })
}

//! Log deduplication with a time budget.
//!
//! Tor repeats itself. This module collapses repeated log lines into one
//! visible entry while keeping the cost of a pass bounded.
//!
//! # Algorithm
//!
//! Each [`LogEntry`] carries a content [`Fingerprint`]: SHA-256 over its
//! runlevel and whitespace-normalized text, so line wrapping differences do
//! not produce distinct messages. A pass walks the entries once, keeping a map
//! from fingerprint to the most recent position seen:
//!
//! ```text
//!   idx  text                      map after            status
//!   ───  ────────────────────────  ───────────────────  ──────────────
//!   0    "Bootstrapped 100%"       {A: 0}               Unique
//!   1    "Rate limiting  NEWNYM"   {A: 0, B: 1}         Unique
//!   2    "Bootstrapped   100%"     {A: 2, B: 1}         DuplicateOf(0)
//!   3    "Rate limiting NEWNYM"    {A: 2, B: 3}         DuplicateOf(1)
//!   ─── budget exhausted ───
//!   4    ...                                            Unchecked
//! ```
//!
//! When the budget runs out (or the pass is aborted) the remaining entries are
//! [`DedupStatus::Unchecked`] and the result is flagged
//! [`truncated`](DedupResult::truncated). Nothing is ever dropped.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use arm_rs::LogLevel;
//! use arm_rs::logdedup::{dedup, DedupStatus, LogEntry};
//!
//! let entries = vec![
//!     LogEntry::new(1.0, LogLevel::Notice, "Bootstrapped 100%"),
//!     LogEntry::new(2.0, LogLevel::Notice, "Bootstrapped  100%"),
//! ];
//! let result = dedup(&entries, Duration::from_secs(1));
//! assert_eq!(result.statuses[1], DedupStatus::DuplicateOf(0));
//! assert!(!result.truncated);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::config::LogLevel;

/// Content hash of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of `text` at `runlevel`, ignoring whitespace layout.
    pub fn of(runlevel: LogLevel, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(runlevel.to_string().as_bytes());
        hasher.update([0u8]);
        for (i, word) in text.split_whitespace().enumerate() {
            if i > 0 {
                hasher.update(b" ");
            }
            hasher.update(word.as_bytes());
        }
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// One Tor log line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    timestamp_bits: u64,
    runlevel: LogLevel,
    message: String,
    fingerprint: Fingerprint,
}

impl LogEntry {
    /// Creates an entry and computes its fingerprint.
    pub fn new(timestamp: f64, runlevel: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            timestamp_bits: timestamp.to_bits(),
            fingerprint: Fingerprint::of(runlevel, &message),
            runlevel,
            message,
        }
    }

    /// Arrival time, seconds since the Unix epoch.
    pub fn timestamp(&self) -> f64 {
        f64::from_bits(self.timestamp_bits)
    }

    /// Tor runlevel.
    pub fn runlevel(&self) -> LogLevel {
        self.runlevel
    }

    /// Raw message text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Content fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Formats the entry as `HH:MM:SS [RUNLEVEL] message` in UTC.
    pub fn format(&self) -> String {
        format!(
            "{} [{}] {}",
            format_time(self.timestamp()),
            self.runlevel,
            self.message
        )
    }
}

fn format_time(timestamp: f64) -> String {
    use chrono::DateTime;
    let secs = timestamp.floor() as i64;
    let nsecs = ((timestamp - secs as f64) * 1_000_000_000.0) as u32;
    match DateTime::from_timestamp(secs, nsecs) {
        Some(dt) => dt.format("%H:%M:%S").to_string(),
        None => format!("{:.3}", timestamp),
    }
}

/// Outcome for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStatus {
    /// First occurrence of its content.
    Unique,
    /// Repeats the entry at this index (its most recent prior occurrence).
    DuplicateOf(usize),
    /// Not examined before the pass stopped.
    Unchecked,
}

/// Outcome of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupResult {
    /// One status per input entry, in input order.
    pub statuses: Vec<DedupStatus>,
    /// Whether the pass stopped before examining every entry.
    pub truncated: bool,
}

impl DedupResult {
    /// Indices of entries that were examined.
    pub fn processed(&self) -> usize {
        self.statuses
            .iter()
            .take_while(|s| **s != DedupStatus::Unchecked)
            .count()
    }
}

/// Cancels a running pass from another thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Creates an un-aborted handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that passes using this handle stop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deduplicates `entries` within `budget`.
pub fn dedup(entries: &[LogEntry], budget: Duration) -> DedupResult {
    dedup_with_abort(entries, budget, &AbortHandle::new())
}

/// Like [`dedup`], also stopping when `abort` fires.
pub fn dedup_with_abort(entries: &[LogEntry], budget: Duration, abort: &AbortHandle) -> DedupResult {
    let deadline = Instant::now() + budget;
    dedup_until(entries, || abort.is_aborted() || Instant::now() >= deadline)
}

/// Deduplicates `entries`, checking `should_stop` before each one.
pub fn dedup_until(entries: &[LogEntry], mut should_stop: impl FnMut() -> bool) -> DedupResult {
    let mut statuses = Vec::with_capacity(entries.len());
    let mut latest: HashMap<Fingerprint, usize> = HashMap::with_capacity(entries.len());

    for (idx, entry) in entries.iter().enumerate() {
        if should_stop() {
            statuses.resize(entries.len(), DedupStatus::Unchecked);
            return DedupResult {
                statuses,
                truncated: true,
            };
        }
        let status = match latest.insert(entry.fingerprint, idx) {
            Some(prior) => DedupStatus::DuplicateOf(prior),
            None => DedupStatus::Unique,
        };
        statuses.push(status);
    }

    DedupResult {
        statuses,
        truncated: false,
    }
}

/// One line of the deduplicated view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogViewEntry {
    /// The most recent occurrence.
    pub entry: LogEntry,
    /// How many times the content appeared, this one included.
    pub count: usize,
    /// Whether deduplication examined this entry.
    pub checked: bool,
}

impl LogViewEntry {
    /// Formats the entry with a repeat marker, e.g. `... (x3)`.
    pub fn format(&self) -> String {
        if self.count > 1 {
            format!("{} (x{})", self.entry.format(), self.count)
        } else {
            self.entry.format()
        }
    }
}

/// Deduplicated log view published to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogView {
    /// Entries oldest first, each content shown once at its latest position.
    pub entries: Vec<LogViewEntry>,
    /// Whether the producing pass was truncated.
    pub truncated: bool,
}

/// Capped buffer of Tor log entries.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    limit: usize,
    min_runlevel: LogLevel,
}

impl LogBuffer {
    /// Creates a buffer keeping at most `limit` entries at or above
    /// `min_runlevel`.
    pub fn new(limit: usize, min_runlevel: LogLevel) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(4096)),
            limit: limit.max(1),
            min_runlevel,
        }
    }

    /// Appends an entry, evicting the oldest past the limit. Entries below
    /// the runlevel filter are ignored; returns whether it was kept.
    pub fn push(&mut self, entry: LogEntry) -> bool {
        if entry.runlevel < self.min_runlevel {
            return false;
        }
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        true
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffered entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Builds the deduplicated view within `budget`.
    ///
    /// Each examined content appears once, at its most recent position, with
    /// its repeat count. Unchecked entries are included as they are.
    pub fn view(&self, budget: Duration, abort: &AbortHandle) -> LogView {
        let entries: Vec<LogEntry> = self.entries.iter().cloned().collect();
        let result = dedup_with_abort(&entries, budget, abort);

        let mut counts = vec![1usize; entries.len()];
        let mut superseded = vec![false; entries.len()];
        for (idx, status) in result.statuses.iter().enumerate() {
            if let DedupStatus::DuplicateOf(prior) = *status {
                counts[idx] = counts[prior] + 1;
                superseded[prior] = true;
            }
        }

        let view = entries
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !superseded[*idx])
            .map(|(idx, entry)| LogViewEntry {
                entry,
                count: counts[idx],
                checked: result.statuses[idx] != DedupStatus::Unchecked,
            })
            .collect();

        LogView {
            entries: view,
            truncated: result.truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> LogEntry {
        LogEntry::new(0.0, LogLevel::Notice, text)
    }

    #[test]
    fn test_format() {
        let entry = LogEntry::new(3_723.5, LogLevel::Notice, "Bootstrapped 100%");
        assert_eq!(entry.format(), "01:02:03 [NOTICE] Bootstrapped 100%");

        let view = LogViewEntry {
            entry,
            count: 3,
            checked: true,
        };
        assert_eq!(view.format(), "01:02:03 [NOTICE] Bootstrapped 100% (x3)");
    }

    #[test]
    fn test_whitespace_insensitive_fingerprint() {
        assert_eq!(
            entry("Bootstrapped 100%:\n  Done").fingerprint(),
            entry(" Bootstrapped 100%: Done ").fingerprint()
        );
        assert_ne!(
            entry("a").fingerprint(),
            LogEntry::new(0.0, LogLevel::Warn, "a").fingerprint()
        );
    }

    #[test]
    fn test_duplicate_points_to_most_recent() {
        let entries = vec![entry("a"), entry("b"), entry("a"), entry("a")];
        let result = dedup(&entries, Duration::from_secs(5));
        assert_eq!(
            result.statuses,
            vec![
                DedupStatus::Unique,
                DedupStatus::Unique,
                DedupStatus::DuplicateOf(0),
                DedupStatus::DuplicateOf(2),
            ]
        );
        assert!(!result.truncated);
    }

    #[test]
    fn test_idempotent_on_deduplicated_sequence() {
        let entries = vec![entry("a"), entry("b"), entry("a"), entry("c"), entry("b")];
        let first = dedup(&entries, Duration::from_secs(5));
        let uniques: Vec<LogEntry> = entries
            .iter()
            .zip(&first.statuses)
            .filter(|(_, s)| **s == DedupStatus::Unique)
            .map(|(e, _)| e.clone())
            .collect();

        let second = dedup(&uniques, Duration::from_secs(5));
        assert!(second.statuses.iter().all(|s| *s == DedupStatus::Unique));
        assert_eq!(dedup(&entries, Duration::from_secs(5)), first);
    }

    #[test]
    fn test_truncated_keeps_processed_entries() {
        let entries: Vec<LogEntry> = (0..10).map(|i| entry(&format!("m{}", i % 3))).collect();
        let mut budget = 6;
        let result = dedup_until(&entries, || {
            if budget == 0 {
                return true;
            }
            budget -= 1;
            false
        });

        assert!(result.truncated);
        assert_eq!(result.statuses.len(), entries.len());
        assert_eq!(result.processed(), 6);
        assert_eq!(result.statuses[3], DedupStatus::DuplicateOf(0));
        assert!(result.statuses[6..].iter().all(|s| *s == DedupStatus::Unchecked));
    }

    #[test]
    fn test_zero_budget_truncates() {
        let entries = vec![entry("a"), entry("b")];
        let result = dedup(&entries, Duration::ZERO);
        assert!(result.truncated);
        assert_eq!(result.statuses.len(), 2);
    }

    #[test]
    fn test_abort_handle_stops_pass() {
        let abort = AbortHandle::new();
        abort.abort();
        let result = dedup_with_abort(&[entry("a")], Duration::from_secs(60), &abort);
        assert!(result.truncated);
        assert_eq!(result.statuses, vec![DedupStatus::Unchecked]);
    }

    #[test]
    fn test_buffer_cap_and_runlevel_filter() {
        let mut buffer = LogBuffer::new(3, LogLevel::Notice);
        assert!(!buffer.push(LogEntry::new(0.0, LogLevel::Info, "quiet")));
        for i in 0..5 {
            assert!(buffer.push(entry(&format!("m{}", i))));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.entries().next().unwrap().message(), "m2");
    }

    #[test]
    fn test_view_collapses_to_latest_with_counts() {
        let mut buffer = LogBuffer::new(10, LogLevel::Debug);
        for text in ["a", "b", "a", "c", "a"] {
            buffer.push(entry(text));
        }
        let view = buffer.view(Duration::from_secs(5), &AbortHandle::new());
        let summary: Vec<(&str, usize)> = view
            .entries
            .iter()
            .map(|e| (e.entry.message(), e.count))
            .collect();
        assert_eq!(summary, vec![("b", 1), ("c", 1), ("a", 3)]);
        assert!(!view.truncated);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn duplicates_point_backwards_to_equal_content(texts in prop::collection::vec("[abc ]{0,4}", 0..40)) {
            let entries: Vec<LogEntry> = texts.iter().map(|t| LogEntry::new(0.0, LogLevel::Notice, t.as_str())).collect();
            let result = dedup(&entries, Duration::from_secs(5));
            prop_assert!(!result.truncated);
            for (idx, status) in result.statuses.iter().enumerate() {
                if let DedupStatus::DuplicateOf(prior) = *status {
                    prop_assert!(prior < idx);
                    prop_assert_eq!(entries[prior].fingerprint(), entries[idx].fingerprint());
                    for between in &entries[prior + 1..idx] {
                        prop_assert_ne!(between.fingerprint(), entries[idx].fingerprint());
                    }
                }
            }
        }

        #[test]
        fn view_has_one_entry_per_content(texts in prop::collection::vec("[ab]{1,2}", 0..30)) {
            let mut buffer = LogBuffer::new(100, LogLevel::Debug);
            for t in &texts {
                buffer.push(LogEntry::new(0.0, LogLevel::Notice, t.as_str()));
            }
            let view = buffer.view(Duration::from_secs(5), &AbortHandle::new());
            let total: usize = view.entries.iter().map(|e| e.count).sum();
            prop_assert_eq!(total, texts.len());
            let mut fps: Vec<_> = view.entries.iter().map(|e| e.entry.fingerprint().to_string()).collect();
            let n = fps.len();
            fps.sort();
            fps.dedup();
            prop_assert_eq!(fps.len(), n);
        }
    }
}

//! Per-request outcome accounting.
//!
//! Every request handled by the proxy ends in exactly one [`OutcomeRecord`]:
//! blocked by policy, or proxied with whatever status the upstream (or the
//! gateway, when the upstream failed) returned.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Counter name in the exposition output.
pub const REQUEST_COUNT: &str = "request_count";

const REQUEST_COUNT_HELP: &str = "Number of metadata proxy requests broken down by filter result of request and HTTP response code.";

/// Whether the request was forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterResult {
    /// Denied by policy and answered locally.
    Blocked,

    /// Forwarded to the metadata server.
    Proxied,
}

impl FilterResult {
    /// The label value used for this result.
    pub fn as_label(&self) -> &'static str {
        match self {
            FilterResult::Blocked => "filter_result_blocked",
            FilterResult::Proxied => "filter_result_proxied",
        }
    }
}

impl std::fmt::Display for FilterResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutcomeRecord {
    pub filter_result: FilterResult,
    pub status: u16,
}

impl OutcomeRecord {
    /// A request denied by policy.
    pub fn blocked(status: u16) -> Self {
        Self {
            filter_result: FilterResult::Blocked,
            status,
        }
    }

    /// A request forwarded upstream.
    pub fn proxied(status: u16) -> Self {
        Self {
            filter_result: FilterResult::Proxied,
            status,
        }
    }
}

/// Destination for outcome records. Must be safe to call from every
/// connection task at once.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, outcome: &OutcomeRecord);
}

/// In-process request counter keyed by `(filter_result, code)`.
#[derive(Debug, Default)]
pub struct RequestCounter {
    counts: DashMap<(FilterResult, u16), AtomicU64>,
}

impl RequestCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for one label pair.
    pub fn count(&self, filter_result: FilterResult, status: u16) -> u64 {
        self.counts
            .get(&(filter_result, status))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over all label pairs.
    pub fn total(&self) -> u64 {
        self.counts
            .iter()
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// All counts, sorted by label pair.
    pub fn snapshot(&self) -> Vec<(OutcomeRecord, u64)> {
        let mut rows: Vec<_> = self
            .counts
            .iter()
            .map(|entry| {
                let (filter_result, status) = *entry.key();
                (
                    OutcomeRecord {
                        filter_result,
                        status,
                    },
                    entry.value().load(Ordering::Relaxed),
                )
            })
            .collect();
        rows.sort_by_key(|(record, _)| (record.filter_result, record.status));
        rows
    }

    /// Render in the Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "# HELP {REQUEST_COUNT} {REQUEST_COUNT_HELP}");
        let _ = writeln!(output, "# TYPE {REQUEST_COUNT} counter");
        for (record, value) in self.snapshot() {
            let _ = writeln!(
                output,
                "{REQUEST_COUNT}{{code=\"{}\",filter_result=\"{}\"}} {value}",
                record.status, record.filter_result
            );
        }
        output
    }
}

impl OutcomeSink for RequestCounter {
    fn record(&self, outcome: &OutcomeRecord) {
        self.counts
            .entry((outcome.filter_result, outcome.status))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }
}

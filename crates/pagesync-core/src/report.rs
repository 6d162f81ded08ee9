//! Operation results: records, failures, statistics and notices.
//!
//! A sync operation never throws away work. Whatever happens (partial
//! failure, deadline, cancellation) the caller gets a [`SyncReport`] holding
//! every record that was retrieved next to every page that was not.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Page, Record};

/// How the operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every page was retrieved.
    Complete,
    /// Some pages failed permanently.
    PartialFailure {
        /// The failure count exceeded the abort threshold and remaining work
        /// was cancelled.
        aborted: bool,
    },
    /// The wall-clock deadline passed before the operation finished.
    TimeoutExceeded,
    /// The caller cancelled the operation.
    Cancelled,
}

impl SyncStatus {
    /// Short label for summaries.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::PartialFailure { aborted: false } => "partial failure",
            Self::PartialFailure { aborted: true } => "aborted",
            Self::TimeoutExceeded => "timeout exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A page that could not be retrieved.
#[derive(Debug)]
pub struct PageFailure {
    /// Index of the page within the operation.
    pub page_index: usize,
    /// Offset the page starts at.
    pub offset: u64,
    /// Final error.
    pub error: Error,
    /// Network attempts made for this page.
    pub attempts: u32,
}

impl fmt::Display for PageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page {} (offset {}): {} after {} attempt{}",
            self.page_index,
            self.offset,
            self.error,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" }
        )
    }
}

/// Something the caller should know about that is not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A stored checkpoint belonged to a different query shape and was
    /// discarded; the operation restarted from offset 0.
    CheckpointMismatch {
        /// Job key of the discarded checkpoint.
        job_key: String,
        /// Signature recorded in the checkpoint.
        stored: String,
        /// Signature of the current query.
        current: String,
    },
    /// The operation resumed from a stored checkpoint.
    ResumedFromCheckpoint {
        /// Job key of the checkpoint.
        job_key: String,
        /// Offset the operation resumed at.
        offset: u64,
    },
    /// More records came back than the query was expected to match, which
    /// can mean the source ignored the filter.
    SuspectedUnfilteredResult {
        /// Upper bound declared on the query.
        expected_max: u64,
        /// Records observed (or reported by the count hint).
        observed: u64,
    },
    /// The source did not report a total count, so pages were fetched
    /// sequentially.
    CountUnavailable,
    /// The dataset grew after it was sized; the tail was fetched
    /// sequentially.
    DatasetGrew {
        /// Offset the tail sweep started at.
        from_offset: u64,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckpointMismatch {
                job_key,
                stored,
                current,
            } => write!(
                f,
                "checkpoint for '{job_key}' was recorded for query {stored}, not {current}; restarted from offset 0"
            ),
            Self::ResumedFromCheckpoint { job_key, offset } => {
                write!(f, "resumed '{job_key}' from offset {offset}")
            },
            Self::SuspectedUnfilteredResult {
                expected_max,
                observed,
            } => write!(
                f,
                "{observed} records exceed the expected maximum of {expected_max}; the filter may have been ignored"
            ),
            Self::CountUnavailable => {
                write!(f, "source reported no total count; fetched sequentially")
            },
            Self::DatasetGrew { from_offset } => {
                write!(f, "dataset grew during the run; swept tail from offset {from_offset}")
            },
        }
    }
}

/// Counters for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Pages scheduled (including tail-sweep pages).
    pub pages_total: usize,
    /// Pages retrieved.
    pub pages_completed: usize,
    /// Pages that failed permanently.
    pub pages_failed: usize,
    /// Records retrieved.
    pub records: usize,
    /// Network requests made, probes included.
    pub requests: u64,
    /// Requests that were retries.
    pub retries: u64,
    /// Results served from the cache (0 or 1 per operation).
    pub cache_hits: u64,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl SyncStats {
    /// Completed pages as a percentage of attempted pages.
    ///
    /// An operation that had nothing to fetch counts as fully successful.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for percentage calculation
    pub fn success_rate(&self) -> f64 {
        let attempted = self.pages_completed + self.pages_failed;
        if attempted == 0 {
            100.0
        } else {
            (self.pages_completed as f64 / attempted as f64) * 100.0
        }
    }
}

/// Everything a sync operation produced.
#[derive(Debug)]
pub struct SyncReport {
    /// Records retrieved, in delivery order.
    pub records: Vec<Record>,
    /// Pages that failed permanently.
    pub failures: Vec<PageFailure>,
    /// Counters.
    pub stats: SyncStats,
    /// How the operation ended.
    pub status: SyncStatus,
    /// Warnings that are not failures.
    pub notices: Vec<Notice>,
}

impl SyncReport {
    /// Whether every page was retrieved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == SyncStatus::Complete && self.failures.is_empty()
    }

    /// Offsets of failed pages, ascending.
    #[must_use]
    pub fn failed_offsets(&self) -> Vec<u64> {
        let mut offsets: Vec<u64> = self.failures.iter().map(|f| f.offset).collect();
        offsets.sort_unstable();
        offsets
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} records from {}/{} pages in {:.2}s ({:.1}% success)",
            self.status.label(),
            self.stats.records,
            self.stats.pages_completed,
            self.stats.pages_total,
            self.stats.duration.as_secs_f64(),
            self.stats.success_rate()
        )?;
        write!(
            f,
            "requests: {}, retries: {}, cache hits: {}",
            self.stats.requests, self.stats.retries, self.stats.cache_hits
        )?;
        for failure in &self.failures {
            write!(f, "\n  failed {failure}")?;
        }
        for notice in &self.notices {
            write!(f, "\n  note: {notice}")?;
        }
        Ok(())
    }
}

/// Progress snapshot reported after every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Pages finished, successfully or not.
    pub completed: usize,
    /// Pages expected, when the dataset size is known.
    pub total: Option<usize>,
}

impl Progress {
    /// Completion percentage, when the total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.completed as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Progress callback type.
///
/// Called from the coordinating task after each page finishes.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Receives pages in delivery order as they are released.
pub type PageSink = Arc<dyn Fn(&Page) + Send + Sync>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::FetchError;

    fn report() -> SyncReport {
        SyncReport {
            records: vec![Record::new().with("id", 1)],
            failures: vec![PageFailure {
                page_index: 3,
                offset: 300,
                error: Error::RetryExhausted {
                    attempts: 4,
                    last: FetchError::Server { status: 503 },
                },
                attempts: 4,
            }],
            stats: SyncStats {
                pages_total: 10,
                pages_completed: 9,
                pages_failed: 1,
                records: 900,
                requests: 14,
                retries: 3,
                cache_hits: 0,
                duration: Duration::from_millis(1500),
            },
            status: SyncStatus::PartialFailure { aborted: false },
            notices: vec![Notice::CountUnavailable],
        }
    }

    #[test]
    fn test_success_rate() {
        let stats = report().stats;
        assert!((stats.success_rate() - 90.0).abs() < f64::EPSILON);
        assert!((SyncStats::default().success_rate() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_mentions_failures_and_notices() {
        let text = report().to_string();
        assert!(text.starts_with("partial failure: 900 records from 9/10 pages"));
        assert!(text.contains("90.0% success"));
        assert!(text.contains("page 3 (offset 300)"));
        assert!(text.contains("after 4 attempts"));
        assert!(text.contains("no total count"));
    }

    #[test]
    fn test_is_complete() {
        let mut r = report();
        assert!(!r.is_complete());
        r.failures.clear();
        r.status = SyncStatus::Complete;
        assert!(r.is_complete());
        assert_eq!(r.failed_offsets(), Vec::<u64>::new());
    }

    #[test]
    fn test_progress_percent() {
        let p = Progress {
            completed: 3,
            total: Some(12),
        };
        assert!((p.percent().unwrap() - 25.0).abs() < f64::EPSILON);
        assert_eq!(
            Progress {
                completed: 3,
                total: None
            }
            .percent(),
            None
        );
        assert_eq!(
            Progress {
                completed: 0,
                total: Some(0)
            }
            .percent(),
            Some(100.0)
        );
    }
}

//! Concurrent retrieval of a sized dataset.
//!
//! Once the number of records is known (from a caller estimate or a one-record
//! count probe), the range is split into fixed-size pages and fetched by a
//! bounded pool of workers. Workers claim page indices from a single atomic
//! counter and report back over a channel; the coordinating loop is the only
//! place results are merged.
//!
//! ## Delivery modes
//!
//! - [`DeliveryMode::Ordered`]: pages are released in index order as soon as
//!   the contiguous prefix is available. Deterministic, buffers out-of-order
//!   pages.
//! - [`DeliveryMode::Streaming`]: pages are released as they arrive.
//!
//! Either way the checkpoint only advances over the contiguous prefix of
//! completed pages, so a resumed run never skips a hole.
//!
//! ## Failure handling
//!
//! A page that fails permanently is recorded as a [`PageFailure`]. Once more
//! than `abort_threshold` pages have failed, outstanding work is cancelled
//! and the run returns with what it has.
//!
//! When the source reports no total count the run falls back to fetching
//! sequentially, page after page, until a short page. The same watermark
//! rule holds there: nothing past the first failed page is committed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    CheckpointManager, Error, Notice, Page, PageFailure, PageRequest, PageSink, Progress,
    ProgressCallback, QuerySpec, Record, Result, RetryingFetcher, SyncReport, SyncStats,
    SyncStatus,
};

/// Order in which completed pages are handed to the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Re-sequence pages by index before delivery.
    #[default]
    Ordered,
    /// Deliver pages as they complete.
    Streaming,
}

/// Parameters of one scheduled run.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Worker pool size.
    pub max_concurrency: usize,
    /// Permanent page failures tolerated before aborting.
    pub abort_threshold: usize,
    /// Delivery order.
    pub mode: DeliveryMode,
    /// Known or estimated record count; `None` runs a count probe.
    pub total_estimate: Option<u64>,
    /// First offset to fetch (a resume point).
    pub start_offset: u64,
    /// Wall-clock budget for the whole run.
    pub deadline: Option<Duration>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            abort_threshold: 3,
            mode: DeliveryMode::Ordered,
            total_estimate: None,
            start_offset: 0,
            deadline: None,
        }
    }
}

/// Pages and bookkeeping produced by a run.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Pages in delivery order.
    pub pages: Vec<Page>,
    /// Permanently failed pages, by page index.
    pub failures: Vec<PageFailure>,
    /// How the run ended.
    pub status: SyncStatus,
    /// Non-failure observations.
    pub notices: Vec<Notice>,
    /// Counters.
    pub stats: SyncStats,
}

impl BatchOutcome {
    /// Whether every page was retrieved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == SyncStatus::Complete && self.failures.is_empty()
    }

    /// Flatten into a report.
    #[must_use]
    pub fn into_report(self) -> SyncReport {
        let records: Vec<Record> = self.pages.into_iter().flat_map(|p| p.records).collect();
        SyncReport {
            records,
            failures: self.failures,
            stats: self.stats,
            status: self.status,
            notices: self.notices,
        }
    }
}

/// Why the coordinator stopped before all pages were in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Aborted,
    Deadline,
    Cancelled,
}

struct WorkerResult {
    index: usize,
    offset: u64,
    result: Result<Page>,
    attempts: u32,
}

/// Bounded-concurrency page scheduler.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use pagesync_core::testing::MemorySource;
/// use pagesync_core::{
///     ConcurrentBatchScheduler, QuerySpec, RetryPolicy, RetryingFetcher, ScheduleOptions,
/// };
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let source = Arc::new(MemorySource::sequential(1000));
/// let scheduler = ConcurrentBatchScheduler::new(RetryingFetcher::new(source, RetryPolicy::default()));
/// let spec = QuerySpec::builder("https://example.com/items").page_size(100).build(100).unwrap();
///
/// let outcome = scheduler.schedule_range(&spec, &ScheduleOptions::default(), None).await;
/// assert!(outcome.is_complete());
/// assert_eq!(outcome.stats.records, 1000);
/// # });
/// ```
pub struct ConcurrentBatchScheduler {
    fetcher: RetryingFetcher,
    progress: Option<ProgressCallback>,
    sink: Option<PageSink>,
    cancel: CancellationToken,
}

impl ConcurrentBatchScheduler {
    /// Create a scheduler fetching through `fetcher`.
    #[must_use]
    pub fn new(fetcher: RetryingFetcher) -> Self {
        Self {
            fetcher,
            progress: None,
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set progress callback.
    ///
    /// The callback receives a [`Progress`] after each page finishes.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Hand every page to `sink` in delivery order.
    #[must_use]
    pub fn with_sink(mut self, sink: PageSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Stop the run when `token` is cancelled.
    ///
    /// Runs work on child tokens, so aborting a run never cancels `token`.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fetch `spec` from `options.start_offset` to the end of the dataset.
    ///
    /// Never fails as a whole: every ending, including partial failure,
    /// timeout and cancellation, comes back as a [`BatchOutcome`] holding the
    /// pages retrieved so far.
    pub async fn schedule_range(
        &self,
        spec: &QuerySpec,
        options: &ScheduleOptions,
        checkpoint: Option<&mut CheckpointManager>,
    ) -> BatchOutcome {
        let mut run = Run::new(self, spec, options, checkpoint);
        info!(
            "fetching {} from offset {} (concurrency {}, {:?})",
            spec.endpoint(),
            options.start_offset,
            options.max_concurrency,
            options.mode
        );

        let total = match options.total_estimate {
            Some(total) => Some(total),
            None => match self.probe_count(spec, &run.cancel).await {
                Ok(total) => total,
                Err(Error::Cancelled) => return run.finish(Some(Interrupt::Cancelled)),
                Err(e) => {
                    warn!("count probe failed ({}); fetching sequentially", e);
                    None
                },
            },
        };

        match total {
            Some(total) => {
                if let Some(expected_max) = spec.expected_max() {
                    if total > expected_max {
                        run.flag_unfiltered(expected_max, total);
                    }
                }
                let interrupt = run.concurrent(total).await;
                run.finish(interrupt)
            },
            None => {
                run.notices.push(Notice::CountUnavailable);
                let from = options.start_offset;
                let interrupt = run.sequential(from).await;
                run.finish(interrupt)
            },
        }
    }

    /// One-record request with the inline count. `Ok(None)` when the source
    /// reports no count.
    async fn probe_count(
        &self,
        spec: &QuerySpec,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        let request = PageRequest::new(0, 1).with_count();
        let page = self.fetcher.fetch_with_retry(spec, request, cancel).await?;
        debug!("count probe for {}: {:?}", spec.endpoint(), page.total_count);
        Ok(page.total_count)
    }
}

/// State of one run, owned by the coordinator.
struct Run<'a> {
    scheduler: &'a ConcurrentBatchScheduler,
    spec: &'a QuerySpec,
    options: &'a ScheduleOptions,
    checkpoint: Option<&'a mut CheckpointManager>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
    delivered: Vec<Page>,
    failures: Vec<PageFailure>,
    notices: Vec<Notice>,
    pages_total: usize,
    finished: usize,
}

impl<'a> Run<'a> {
    fn new(
        scheduler: &'a ConcurrentBatchScheduler,
        spec: &'a QuerySpec,
        options: &'a ScheduleOptions,
        checkpoint: Option<&'a mut CheckpointManager>,
    ) -> Self {
        let started = Instant::now();
        Self {
            scheduler,
            spec,
            options,
            checkpoint,
            cancel: scheduler.cancel.child_token(),
            deadline: options.deadline.map(|d| started + d),
            started,
            delivered: Vec::new(),
            failures: Vec::new(),
            notices: Vec::new(),
            pages_total: 0,
            finished: 0,
        }
    }

    fn deliver(&mut self, page: Page) {
        if let Some(sink) = &self.scheduler.sink {
            sink(&page);
        }
        self.delivered.push(page);
    }

    fn page_done(&mut self, total: Option<usize>) {
        self.finished += 1;
        if let Some(callback) = &self.scheduler.progress {
            callback(Progress {
                completed: self.finished,
                total,
            });
        }
    }

    fn commit(&mut self, offset: u64) {
        if let Some(manager) = self.checkpoint.as_deref_mut() {
            if let Err(e) = manager.commit(offset) {
                warn!("failed to save checkpoint: {}", e);
            }
        }
    }

    fn flush_checkpoint(&mut self) {
        if let Some(manager) = self.checkpoint.as_deref_mut() {
            if let Err(e) = manager.flush() {
                warn!("failed to save checkpoint: {}", e);
            }
        }
    }

    fn record_failure(&mut self, index: usize, offset: u64, error: Error, attempts: u32) {
        warn!("page {} (offset {}) failed: {}", index, offset, error);
        self.failures.push(PageFailure {
            page_index: index,
            offset,
            error,
            attempts,
        });
    }

    fn over_threshold(&self) -> bool {
        let over = self.failures.len() > self.options.abort_threshold;
        if over {
            warn!(
                "{} pages failed (threshold {}); aborting",
                self.failures.len(),
                self.options.abort_threshold
            );
        }
        over
    }

    fn flag_unfiltered(&mut self, expected_max: u64, observed: u64) {
        if self
            .notices
            .iter()
            .any(|n| matches!(n, Notice::SuspectedUnfilteredResult { .. }))
        {
            return;
        }
        warn!(
            "{} records observed, expected at most {}; the filter may have been ignored",
            observed, expected_max
        );
        self.notices.push(Notice::SuspectedUnfilteredResult {
            expected_max,
            observed,
        });
    }

    /// Fan out over a known total, then sweep the tail if the dataset grew.
    async fn concurrent(&mut self, total: u64) -> Option<Interrupt> {
        let page_size = self.spec.page_size();
        let start = self.options.start_offset;
        let remaining = total.saturating_sub(start);
        let page_count =
            usize::try_from(remaining.div_ceil(page_size as u64)).unwrap_or(usize::MAX);
        self.pages_total = page_count;
        if page_count == 0 {
            debug!("nothing to fetch past offset {}", start);
            return None;
        }

        let workers = self.options.max_concurrency.clamp(1, page_count);
        debug!(
            "{} records from offset {}: {} pages over {} workers",
            remaining, start, page_count, workers
        );

        let next_index = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel::<WorkerResult>(workers * 2);
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(worker(
                self.scheduler.fetcher.clone(),
                self.spec.clone(),
                Arc::clone(&next_index),
                page_count,
                start,
                self.cancel.clone(),
                tx.clone(),
            ));
        }
        drop(tx);

        // Ordered mode: pages waiting for their predecessors.
        let mut pending: BTreeMap<usize, Page> = BTreeMap::new();
        // Completed page index -> offset just past it, until the watermark
        // passes it.
        let mut ends: BTreeMap<usize, u64> = BTreeMap::new();
        let mut next_release = 0usize;
        let mut watermark = 0usize;
        let mut grew_from = None;
        let mut interrupt = None;

        loop {
            let message = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                },
                () = until(self.deadline) => {
                    warn!("deadline reached after {:?}", self.started.elapsed());
                    interrupt = Some(Interrupt::Deadline);
                    break;
                },
                message = rx.recv() => message,
            };
            let Some(message) = message else { break };

            match message.result {
                Ok(page) => {
                    if message.index + 1 == page_count
                        && !page.is_last
                        && page.total_count.is_some_and(|count| count > total)
                    {
                        grew_from = Some(page.next_offset());
                    }
                    ends.insert(message.index, page.next_offset());
                    match self.options.mode {
                        DeliveryMode::Streaming => self.deliver(page),
                        DeliveryMode::Ordered => {
                            pending.insert(message.index, page);
                        },
                    }
                },
                // Only raised once the run token is cancelled; the select
                // above picks that up on the next turn.
                Err(Error::Cancelled) => continue,
                Err(error) => {
                    self.record_failure(message.index, message.offset, error, message.attempts);
                },
            }
            self.page_done(Some(page_count));

            while let Some(page) = pending.remove(&next_release) {
                self.deliver(page);
                next_release += 1;
            }
            let mut advanced = None;
            while let Some(end) = ends.remove(&watermark) {
                advanced = Some(end);
                watermark += 1;
            }
            if let Some(offset) = advanced {
                self.commit(offset);
            }

            if self.over_threshold() {
                interrupt = Some(Interrupt::Aborted);
                break;
            }
        }

        self.cancel.cancel();
        drop(rx);
        tasks.shutdown().await;

        // Pages held back by a failed predecessor are still results.
        for page in pending.into_values() {
            self.deliver(page);
        }

        if let Some(from) = grew_from.filter(|_| interrupt.is_none() && self.failures.is_empty()) {
            info!("dataset grew past {} records; sweeping from offset {}", total, from);
            self.notices.push(Notice::DatasetGrew { from_offset: from });
            self.cancel = self.scheduler.cancel.child_token();
            return self.sequential(from).await;
        }

        self.flush_checkpoint();
        interrupt
    }

    /// Fetch page after page from `from` until a short page.
    ///
    /// A failed page is skipped by one page size; the run aborts once the
    /// failure threshold is exceeded. The checkpoint stops at the first
    /// failed page, so later pages are fetched but never committed.
    async fn sequential(&mut self, from: u64) -> Option<Interrupt> {
        let page_size = self.spec.page_size();
        let fetcher = self.scheduler.fetcher.clone();
        let mut offset = from;
        let mut hole = false;
        let mut interrupt = None;

        loop {
            let request = PageRequest::new(offset, page_size);
            let (result, attempts) = tokio::select! {
                biased;
                () = until(self.deadline) => {
                    warn!("deadline reached after {:?}", self.started.elapsed());
                    interrupt = Some(Interrupt::Deadline);
                    break;
                },
                outcome = fetcher.fetch_with_attempts(self.spec, request, &self.cancel) => outcome,
            };

            let index = self.pages_total;
            match result {
                Ok(page) if page.is_empty() => break,
                Ok(page) => {
                    self.pages_total += 1;
                    let last = page.is_last;
                    offset = page.next_offset();
                    self.deliver(page);
                    if !hole {
                        self.commit(offset);
                    }
                    self.page_done(None);
                    if last {
                        break;
                    }
                },
                Err(Error::Cancelled) => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                },
                Err(error) => {
                    self.pages_total += 1;
                    hole = true;
                    self.record_failure(index, offset, error, attempts);
                    self.page_done(None);
                    if self.over_threshold() {
                        interrupt = Some(Interrupt::Aborted);
                        break;
                    }
                    offset += page_size as u64;
                },
            }
        }

        self.flush_checkpoint();
        interrupt
    }

    fn finish(mut self, interrupt: Option<Interrupt>) -> BatchOutcome {
        // A run token cancelled through the caller's token reads as
        // cancellation even if a deadline or abort fired on the same turn.
        let interrupt = if self.scheduler.cancel.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else {
            interrupt
        };
        self.failures.sort_by_key(|f| f.page_index);

        let status = match interrupt {
            Some(Interrupt::Cancelled) => SyncStatus::Cancelled,
            Some(Interrupt::Deadline) => SyncStatus::TimeoutExceeded,
            Some(Interrupt::Aborted) => SyncStatus::PartialFailure { aborted: true },
            None if self.failures.is_empty() => SyncStatus::Complete,
            None => SyncStatus::PartialFailure { aborted: false },
        };

        let records: usize = self.delivered.iter().map(Page::len).sum();
        if let Some(expected_max) = self.spec.expected_max() {
            if records as u64 > expected_max {
                self.flag_unfiltered(expected_max, records as u64);
            }
        }

        let stats = SyncStats {
            pages_total: self.pages_total,
            pages_completed: self.delivered.len(),
            pages_failed: self.failures.len(),
            records,
            requests: self.scheduler.fetcher.stats().requests(),
            retries: self.scheduler.fetcher.stats().retries(),
            cache_hits: 0,
            duration: self.started.elapsed(),
        };

        info!(
            "{} {}: {} records, {} pages failed in {:?}",
            self.spec.endpoint(),
            status.label(),
            stats.records,
            stats.pages_failed,
            stats.duration
        );

        BatchOutcome {
            pages: self.delivered,
            failures: self.failures,
            status,
            notices: self.notices,
            stats,
        }
    }
}

/// Claim page indices until none are left, the run is cancelled, or the
/// coordinator stops listening.
async fn worker(
    fetcher: RetryingFetcher,
    spec: QuerySpec,
    next_index: Arc<AtomicUsize>,
    page_count: usize,
    start: u64,
    cancel: CancellationToken,
    tx: mpsc::Sender<WorkerResult>,
) {
    let page_size = spec.page_size();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let index = next_index.fetch_add(1, Ordering::SeqCst);
        if index >= page_count {
            break;
        }
        let offset = start + (index as u64) * (page_size as u64);
        let mut request = PageRequest::new(offset, page_size);
        // The final page carries a fresh count so growth since sizing shows up.
        if index + 1 == page_count {
            request = request.with_count();
        }
        let (result, attempts) = fetcher.fetch_with_attempts(&spec, request, &cancel).await;
        let message = WorkerResult {
            index,
            offset,
            result,
            attempts,
        };
        if tx.send(message).await.is_err() {
            break;
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

//! In-memory page source for tests and demos.
//!
//! [`MemorySource`] serves an in-memory dataset through the [`PageFetcher`]
//! trait and records what was asked of it: number of calls, every request,
//! and the peak number of requests in flight at once. Failures can be
//! scripted per offset.
//!
//! Filters are ignored (they are opaque to the client). Field selection and
//! ordering are honored so change-marker probes behave like a real source.
//!
//! ```rust
//! use pagesync_core::testing::MemorySource;
//! use pagesync_core::{FetchError, PageFetcher, PageRequest, QuerySpec};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let source = MemorySource::sequential(250);
//! source.fail_at(100, 1, FetchError::Server { status: 503 });
//!
//! let spec = QuerySpec::builder("https://example.com/items").build(100).unwrap();
//! let page = source.fetch(&spec, PageRequest::new(0, 100)).await.unwrap();
//! assert_eq!(page.len(), 100);
//! assert!(source.fetch(&spec, PageRequest::new(100, 100)).await.is_err());
//! assert_eq!(source.calls(), 2);
//! # });
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::query::SortDirection;
use crate::{FetchError, FetchResult, Page, PageFetcher, PageRequest, QuerySpec, Record};

/// Instrumented in-memory [`PageFetcher`].
#[derive(Debug)]
pub struct MemorySource {
    records: RwLock<Vec<Record>>,
    page_cap: usize,
    reports_count: bool,
    supports_ordering: bool,
    latency: Duration,
    failures: Mutex<HashMap<u64, VecDeque<(usize, FetchError)>>>,
    requests: Mutex<Vec<PageRequest>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemorySource {
    /// Serve `records` as-is.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: RwLock::new(records),
            page_cap: 100,
            reports_count: true,
            supports_ordering: true,
            latency: Duration::ZERO,
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// `n` records shaped `{"id": i, "name": "item-i"}`.
    #[must_use]
    pub fn sequential(n: usize) -> Self {
        Self::new((0..n).map(Self::record).collect())
    }

    /// The record [`sequential`](Self::sequential) generates at position `i`.
    #[must_use]
    pub fn record(i: usize) -> Record {
        Record::new().with("id", i).with("name", format!("item-{i}"))
    }

    /// Sleep this long inside every request.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Never report a total count.
    #[must_use]
    pub const fn without_count(mut self) -> Self {
        self.reports_count = false;
        self
    }

    /// Reject ordered requests with HTTP 400, like a source that cannot sort
    /// by the requested field.
    #[must_use]
    pub const fn without_ordering(mut self) -> Self {
        self.supports_ordering = false;
        self
    }

    /// Serve at most `cap` records per request regardless of the limit.
    #[must_use]
    pub const fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = cap;
        self
    }

    /// Fail the next `times` requests at `offset` with `error`.
    ///
    /// Calls queue up: `fail_at(0, 1, a)` then `fail_at(0, 1, b)` fails the
    /// first request with `a` and the second with `b`. Use `usize::MAX` for
    /// a permanent failure.
    pub fn fail_at(&self, offset: u64, times: usize, error: FetchError) {
        lock(&self.failures)
            .entry(offset)
            .or_default()
            .push_back((times, error));
    }

    /// Append a record to the dataset.
    pub fn push(&self, record: Record) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Set `field` on the record at `index`.
    pub fn update(&self, index: usize, field: &str, value: impl Into<Value>) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(index) {
            record.insert(field, value);
        }
    }

    /// Current dataset size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `fetch` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<PageRequest> {
        lock(&self.requests).clone()
    }

    /// Requests for at most one record (count and change-marker probes).
    #[must_use]
    pub fn probe_calls(&self) -> usize {
        lock(&self.requests).iter().filter(|r| r.limit == 1).count()
    }

    /// Requests for more than one record.
    #[must_use]
    pub fn page_calls(&self) -> usize {
        lock(&self.requests).iter().filter(|r| r.limit > 1).count()
    }

    /// Highest number of concurrent requests observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Forget recorded calls and requests.
    pub fn reset_counters(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.peak_in_flight.store(0, Ordering::SeqCst);
        lock(&self.requests).clear();
    }

    fn scripted_failure(&self, offset: u64) -> Option<FetchError> {
        let mut failures = lock(&self.failures);
        let queue = failures.get_mut(&offset)?;
        let (remaining, error) = queue.front_mut()?;
        let error = error.clone();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            queue.pop_front();
        }
        Some(error)
    }

    fn serve(&self, spec: &QuerySpec, request: PageRequest) -> FetchResult<Page> {
        if !spec.ordering().is_empty() && !self.supports_ordering {
            return Err(FetchError::Client { status: 400 });
        }

        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let total = records.len();

        let mut view: Vec<&Record> = records.iter().collect();
        if !spec.ordering().is_empty() {
            view.sort_by(|a, b| {
                for term in spec.ordering() {
                    let ord = compare(a.get(&term.field), b.get(&term.field));
                    let ord = match term.direction {
                        SortDirection::Ascending => ord,
                        SortDirection::Descending => ord.reverse(),
                    };
                    if ord != CmpOrdering::Equal {
                        return ord;
                    }
                }
                CmpOrdering::Equal
            });
        }

        let start = usize::try_from(request.offset).unwrap_or(usize::MAX).min(total);
        let take = request.limit.min(self.page_cap);
        let page: Vec<Record> = view
            .into_iter()
            .skip(start)
            .take(take)
            .map(|record| project(record, spec.selected()))
            .collect();

        let count = (request.include_count && self.reports_count).then_some(total as u64);
        Ok(Page::new(page, request.offset, request.limit, count))
    }
}

#[async_trait]
impl PageFetcher for MemorySource {
    async fn fetch(&self, spec: &QuerySpec, request: PageRequest) -> FetchResult<Page> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request);

        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(error) = self.scripted_failure(request.offset) {
            return Err(error);
        }
        self.serve(spec, request)
    }
}

/// Tracks one request in flight; decrements on drop so cancelled requests
/// are accounted for.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn project(record: &Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record.clone();
    }
    let mut out = Record::new();
    for field in fields {
        if let Some(value) = record.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => CmpOrdering::Equal,
        // Missing values sort first, as nulls do in most sources.
        (None | Some(Value::Null), Some(_)) => CmpOrdering::Less,
        (Some(_), None | Some(Value::Null)) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> QuerySpec {
        QuerySpec::builder("https://example.com/items").build(100).unwrap()
    }

    #[tokio::test]
    async fn test_pages_and_count() {
        let source = MemorySource::sequential(250);
        let page = source
            .fetch(&spec(), PageRequest::new(200, 100).with_count())
            .await
            .unwrap();
        assert_eq!(page.len(), 50);
        assert!(page.is_last);
        assert_eq!(page.total_count, Some(250));
        assert_eq!(page.records[0].get("id"), Some(&json!(200)));
    }

    #[tokio::test]
    async fn test_without_count() {
        let source = MemorySource::sequential(10).without_count();
        let page = source
            .fetch(&spec(), PageRequest::new(0, 1).with_count())
            .await
            .unwrap();
        assert_eq!(page.total_count, None);
    }

    #[tokio::test]
    async fn test_ordering_and_selection() {
        let source = MemorySource::new(vec![
            Record::new().with("id", 1).with("modifiedAt", "2024-01-02T00:00:00Z"),
            Record::new().with("id", 2).with("modifiedAt", "2024-03-01T00:00:00Z"),
            Record::new().with("id", 3).with("modifiedAt", "2024-02-01T00:00:00Z"),
        ]);
        let probe = spec().change_probe("modifiedAt");
        let page = source.fetch(&probe, PageRequest::new(0, 1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(
            page.records[0].get("modifiedAt"),
            Some(&json!("2024-03-01T00:00:00Z"))
        );
        assert!(page.records[0].get("id").is_none());
    }

    #[tokio::test]
    async fn test_scripted_failures_queue() {
        let source = MemorySource::sequential(10);
        source.fail_at(0, 2, FetchError::Server { status: 500 });
        source.fail_at(0, 1, FetchError::Client { status: 404 });

        let req = PageRequest::new(0, 5);
        assert_eq!(
            source.fetch(&spec(), req).await.unwrap_err(),
            FetchError::Server { status: 500 }
        );
        assert_eq!(
            source.fetch(&spec(), req).await.unwrap_err(),
            FetchError::Server { status: 500 }
        );
        assert_eq!(
            source.fetch(&spec(), req).await.unwrap_err(),
            FetchError::Client { status: 404 }
        );
        assert!(source.fetch(&spec(), req).await.is_ok());
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_unsupported_ordering_is_client_error() {
        let source = MemorySource::sequential(3).without_ordering();
        let err = source
            .fetch(&spec().change_probe("modifiedAt"), PageRequest::new(0, 1))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Client { status: 400 });
    }
}

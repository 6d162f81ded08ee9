//! Change-aware caching of complete query results.
//!
//! Instead of expiring entries on a timer, [`ChangeAwareCache`] asks the
//! source whether anything changed: it requests the single newest record
//! ordered by a change-marker field and compares that marker with the one
//! recorded when the entry was filled. Only if the probe is unavailable does
//! it fall back to a plain time-to-live.
//!
//! Entries are replaced wholesale, never patched, and only complete loads are
//! stored.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::JsonDir;
use crate::{
    Error, Page, PageRequest, Paginator, QuerySignature, QuerySpec, Result, RetryingFetcher,
};

/// Value of the source's change-marker field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ChangeMarker {
    /// RFC 3339 timestamp.
    Timestamp(DateTime<Utc>),
    /// Integer version or sequence number.
    Int(i64),
    /// Floating-point version.
    Float(f64),
    /// Any other string, compared lexically.
    Text(String),
}

impl ChangeMarker {
    /// Interpret a JSON field value as a marker.
    ///
    /// Strings that parse as RFC 3339 become timestamps. `null`, booleans,
    /// arrays and objects are not markers.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map(|ts| Self::Timestamp(ts.with_timezone(&Utc)))
                    .unwrap_or_else(|_| Self::Text(s.clone())),
            ),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            _ => None,
        }
    }

    /// Whether `self` indicates a change relative to `cached`.
    ///
    /// Markers of different kinds cannot be ordered and count as a change.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn is_newer_than(&self, cached: &Self) -> bool {
        let ord = match (self, cached) {
            (Self::Timestamp(a), Self::Timestamp(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Int(b)) => a.partial_cmp(b),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Text(a), Self::Text(b)) => a.partial_cmp(b),
            _ => None,
        };
        ord.is_none_or(|o| o == Ordering::Greater)
    }
}

impl std::fmt::Display for ChangeMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A cached, complete query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Query the pages belong to.
    pub query_signature: QuerySignature,
    /// Every page of the result, in offset order.
    pub pages: Vec<Page>,
    /// When the result was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Newest change marker seen just before the fetch, if the probe worked.
    pub source_change_marker: Option<ChangeMarker>,
}

impl CacheEntry {
    /// Total records across all pages.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.pages.iter().map(Page::len).sum()
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Key-value store for cache entries, keyed by query signature.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the entry for `signature`, if any.
    async fn get(&self, signature: &QuerySignature) -> Result<Option<CacheEntry>>;

    /// Insert or replace the entry for `signature`.
    async fn put(&self, signature: &QuerySignature, entry: CacheEntry) -> Result<()>;

    /// Drop the entry for `signature`. Missing entries are fine.
    async fn invalidate(&self, signature: &QuerySignature) -> Result<()>;
}

/// Process-local cache store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<QuerySignature, CacheEntry>>,
}

impl MemoryCacheStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, signature: &QuerySignature) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(signature).cloned())
    }

    async fn put(&self, signature: &QuerySignature, entry: CacheEntry) -> Result<()> {
        self.entries.write().await.insert(signature.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, signature: &QuerySignature) -> Result<()> {
        self.entries.write().await.remove(signature);
        Ok(())
    }
}

/// One JSON file per query signature.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: JsonDir,
}

impl FileCacheStore {
    /// Store entries under `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: JsonDir::new(dir),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(JsonDir) -> Result<T> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || op(dir))
            .await
            .map_err(|e| Error::Storage(format!("Cache task failed: {e}")))?
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, signature: &QuerySignature) -> Result<Option<CacheEntry>> {
        let key = signature.to_string();
        self.blocking(move |dir| dir.read(&key)).await
    }

    async fn put(&self, signature: &QuerySignature, entry: CacheEntry) -> Result<()> {
        let key = signature.to_string();
        self.blocking(move |dir| dir.write(&key, &entry)).await
    }

    async fn invalidate(&self, signature: &QuerySignature) -> Result<()> {
        let key = signature.to_string();
        self.blocking(move |dir| dir.remove(&key)).await
    }
}

/// How a cached result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from the cache; the source had not changed.
    Hit,
    /// A stale entry was dropped and the result re-fetched.
    Refreshed,
    /// Nothing was cached; the result was fetched.
    Loaded,
}

/// Pages plus how they were obtained.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    /// Result pages in offset order.
    pub pages: Vec<Page>,
    /// Provenance.
    pub source: CacheSource,
}

/// Result of checking the cache before a load.
#[derive(Debug)]
pub enum CacheLookup {
    /// The entry is current and can be served.
    Fresh(CacheEntry),
    /// A load is needed. `marker` is the probe result to record with the
    /// new entry; `had_entry` tells whether a stale entry was dropped.
    Load {
        /// Change marker observed before the load.
        marker: Option<ChangeMarker>,
        /// A stale entry existed.
        had_entry: bool,
    },
}

/// Cache front end that validates entries against the source.
pub struct ChangeAwareCache {
    store: Arc<dyn CacheStore>,
    fetcher: RetryingFetcher,
    marker_field: String,
    ttl: Duration,
}

impl ChangeAwareCache {
    /// Default time-to-live when the change probe is unavailable.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    /// Create a cache over `store` using `fetcher` for probes and loads.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, fetcher: RetryingFetcher) -> Self {
        Self {
            store,
            fetcher,
            marker_field: "modifiedAt".to_string(),
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Use `field` as the change marker.
    #[must_use]
    pub fn with_marker_field(mut self, field: impl Into<String>) -> Self {
        self.marker_field = field.into();
        self
    }

    /// Fallback time-to-live.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Serve `spec` from the cache, or paginate it sequentially and cache the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns store errors and the first page error of a load.
    pub async fn get(&self, spec: &QuerySpec) -> Result<CacheOutcome> {
        let paginator = Paginator::new(self.fetcher.clone(), spec.clone());
        self.get_with(spec, || paginator.collect_all()).await
    }

    /// Serve `spec` from the cache, or run `loader` and cache what it
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns store errors and whatever `loader` fails with. A failed load
    /// is not cached.
    pub async fn get_with<F, Fut>(&self, spec: &QuerySpec, loader: F) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Vec<Page>>> + Send,
    {
        match self.lookup(spec).await? {
            CacheLookup::Fresh(entry) => Ok(CacheOutcome {
                pages: entry.pages,
                source: CacheSource::Hit,
            }),
            CacheLookup::Load { marker, had_entry } => {
                let pages = loader().await?;
                self.store(spec, pages.clone(), marker).await?;
                Ok(CacheOutcome {
                    pages,
                    source: if had_entry {
                        CacheSource::Refreshed
                    } else {
                        CacheSource::Loaded
                    },
                })
            },
        }
    }

    /// Decide whether the cached entry for `spec` can be served.
    ///
    /// Probes the source once. A stale entry is invalidated before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or modified. Probe
    /// failures are not errors; they trigger the TTL fallback.
    pub async fn lookup(&self, spec: &QuerySpec) -> Result<CacheLookup> {
        let signature = spec.signature();
        let entry = self.store.get(&signature).await?;
        let marker = self.probe(spec).await;

        let Some(entry) = entry else {
            debug!("cache miss for {}", signature);
            return Ok(CacheLookup::Load {
                marker,
                had_entry: false,
            });
        };

        let fresh = match (&marker, &entry.source_change_marker) {
            (Some(current), Some(cached)) => {
                let changed = current.is_newer_than(cached);
                debug!(
                    "cache {}: marker {} vs cached {} ({})",
                    signature,
                    current,
                    cached,
                    if changed { "changed" } else { "unchanged" }
                );
                !changed
            },
            _ => {
                let age = entry.age();
                warn!(
                    "cache {}: change probe unavailable, using TTL (age {:?}, ttl {:?})",
                    signature, age, self.ttl
                );
                age < self.ttl
            },
        };

        if fresh {
            info!("cache hit for {} ({} records)", signature, entry.record_count());
            Ok(CacheLookup::Fresh(entry))
        } else {
            info!("cache entry for {} is stale, invalidating", signature);
            self.store.invalidate(&signature).await?;
            Ok(CacheLookup::Load {
                marker,
                had_entry: true,
            })
        }
    }

    /// Store a complete result for `spec`, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn store(
        &self,
        spec: &QuerySpec,
        pages: Vec<Page>,
        marker: Option<ChangeMarker>,
    ) -> Result<()> {
        let signature = spec.signature();
        let entry = CacheEntry {
            query_signature: signature.clone(),
            pages,
            fetched_at: Utc::now(),
            source_change_marker: marker,
        };
        debug!("caching {} records for {}", entry.record_count(), signature);
        self.store.put(&signature, entry).await
    }

    /// Drop the cached entry for `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be modified.
    pub async fn invalidate(&self, spec: &QuerySpec) -> Result<()> {
        self.store.invalidate(&spec.signature()).await
    }

    /// Read the newest change marker. One attempt, no retries; any failure
    /// yields `None`.
    async fn probe(&self, spec: &QuerySpec) -> Option<ChangeMarker> {
        let probe = spec.change_probe(&self.marker_field);
        let request = PageRequest::new(0, probe.page_size());
        let page = match self
            .fetcher
            .without_retries()
            .fetch_with_retry(&probe, request, &CancellationToken::new())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                debug!("change probe failed: {}", e);
                return None;
            },
        };
        let marker = page
            .records
            .first()
            .and_then(|record| record.get(&self.marker_field))
            .and_then(ChangeMarker::from_value);
        if marker.is_none() {
            debug!("change probe returned no '{}' value", self.marker_field);
        }
        marker
    }
}

//! High-level sync client.
//!
//! [`SyncClient`] ties the pieces together: a [`PageFetcher`] wrapped in the
//! configured retry policy, a checkpoint store for resumable runs, and a
//! change-aware cache. Most callers only need [`SyncClient::fetch_all`].
//!
//! ```rust,no_run
//! use pagesync_core::{Config, FetchOptions, SyncClient};
//!
//! # async fn run() -> pagesync_core::Result<()> {
//! let client = SyncClient::new(Config::load()?)?;
//! let spec = client
//!     .query("https://example.com/odata/Orders")
//!     .filter("Status eq 'Open'")
//!     .build(client.page_cap())?;
//!
//! let report = client
//!     .fetch_all(&spec, FetchOptions { resumable: true, ..FetchOptions::default() })
//!     .await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::{
    CacheEntry, CacheLookup, CacheStore, ChangeAwareCache, Checkpoint, CheckpointManager,
    CheckpointStore, ConcurrentBatchScheduler, Config, DeliveryMode, FileCacheStore,
    FileCheckpointStore, HttpFetcher, MemoryCacheStore, MemoryCheckpointStore, PageFetcher,
    PageSink, Paginator, Progress, ProgressCallback, QuerySpec, QuerySpecBuilder, Record, Result,
    ResumePoint, RetryPolicy, RetryingFetcher, ScheduleOptions, SyncReport, SyncStats, SyncStatus,
};

/// Options for [`SyncClient::fetch_all`].
#[derive(Clone)]
pub struct FetchOptions {
    /// Worker pool size.
    pub max_concurrency: usize,
    /// Resume from, and record progress to, the checkpoint store.
    pub resumable: bool,
    /// Serve from, and store complete results in, the cache.
    pub cache_enabled: bool,
    /// Permanent page failures tolerated before aborting.
    pub abort_threshold: usize,
    /// Delivery order.
    pub mode: DeliveryMode,
    /// Wall-clock budget for the operation.
    pub deadline: Option<Duration>,
    /// Persist the checkpoint every N committed pages.
    pub checkpoint_every: usize,
    /// Known record count; skips the count probe.
    pub total_estimate: Option<u64>,
    /// Caller's cancellation token.
    pub cancel: Option<CancellationToken>,
    /// Receives pages in delivery order.
    pub sink: Option<PageSink>,
}

impl FetchOptions {
    /// Options seeded from the `[sync]` configuration section.
    #[must_use]
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            max_concurrency: sync.max_concurrency,
            resumable: false,
            cache_enabled: false,
            abort_threshold: sync.abort_threshold,
            mode: DeliveryMode::Ordered,
            deadline: None,
            checkpoint_every: sync.checkpoint_every,
            total_estimate: None,
            cancel: None,
            sink: None,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("resumable", &self.resumable)
            .field("cache_enabled", &self.cache_enabled)
            .field("abort_threshold", &self.abort_threshold)
            .field("mode", &self.mode)
            .field("deadline", &self.deadline)
            .field("checkpoint_every", &self.checkpoint_every)
            .field("total_estimate", &self.total_estimate)
            .field("cancel", &self.cancel.is_some())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Entry point for paginating and syncing queries.
pub struct SyncClient {
    fetcher: Arc<dyn PageFetcher>,
    config: Config,
    checkpoints: Arc<dyn CheckpointStore>,
    cache: Arc<dyn CacheStore>,
    progress: Option<ProgressCallback>,
}

impl SyncClient {
    /// HTTP client with file-backed checkpoints and cache under
    /// `config.paths.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let fetcher = HttpFetcher::from_config(&config.http, config.wire.clone())?;
        let checkpoints = FileCheckpointStore::new(config.paths.checkpoint_dir());
        let cache = FileCacheStore::new(config.paths.cache_dir());
        Ok(Self {
            fetcher: Arc::new(fetcher),
            checkpoints: Arc::new(checkpoints),
            cache: Arc::new(cache),
            config,
            progress: None,
        })
    }

    /// Client over any fetcher, with in-memory checkpoints and cache.
    #[must_use]
    pub fn with_fetcher(fetcher: Arc<dyn PageFetcher>, config: Config) -> Self {
        Self {
            fetcher,
            config,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            cache: Arc::new(MemoryCacheStore::new()),
            progress: None,
        }
    }

    /// Replace the checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Replace the cache store.
    #[must_use]
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = store;
        self
    }

    /// Set progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Largest page size the source honors.
    #[must_use]
    pub const fn page_cap(&self) -> usize {
        self.config.http.page_cap
    }

    /// Query builder preset with the configured page size.
    pub fn query(&self, endpoint: impl Into<String>) -> QuerySpecBuilder {
        QuerySpec::builder(endpoint).page_size(self.config.sync.page_size)
    }

    /// Lazy sequential pagination over `spec`.
    #[must_use]
    pub fn paginate(&self, spec: QuerySpec) -> Paginator {
        Paginator::new(self.retrying(), spec)
    }

    /// Stored checkpoint for `job_key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn checkpoint(&self, job_key: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.load(job_key)
    }

    /// Delete the checkpoint for `job_key` so the next run starts at 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be modified.
    pub fn clear_checkpoint(&self, job_key: &str) -> Result<()> {
        self.checkpoints.clear(job_key)
    }

    /// Retrieve every record of `spec`.
    ///
    /// Page-level failures, deadlines and cancellation are reported in the
    /// returned [`SyncReport`]; they are never errors.
    ///
    /// # Errors
    ///
    /// Returns an error only when the checkpoint or cache store fails before
    /// any page is fetched.
    pub async fn fetch_all(&self, spec: &QuerySpec, options: FetchOptions) -> Result<SyncReport> {
        let started = Instant::now();
        let fetcher = self.retrying();
        info!("sync {} ({})", spec.endpoint(), spec.signature());

        let cache = options.cache_enabled.then(|| {
            ChangeAwareCache::new(Arc::clone(&self.cache), fetcher.clone())
                .with_marker_field(self.config.cache.change_marker_field.clone())
                .with_ttl(self.config.cache.ttl())
        });

        let mut marker = None;
        if let Some(cache) = &cache {
            match cache.lookup(spec).await? {
                CacheLookup::Fresh(entry) => {
                    return Ok(self.cached_report(entry, &options, &fetcher, started));
                },
                CacheLookup::Load { marker: probed, .. } => marker = probed,
            }
        }

        let (mut manager, resume) = if options.resumable {
            let (manager, resume) = CheckpointManager::begin(
                Arc::clone(&self.checkpoints),
                spec,
                options.checkpoint_every,
            )?;
            (Some(manager), resume)
        } else {
            (
                None,
                ResumePoint {
                    offset: 0,
                    notice: None,
                },
            )
        };

        let mut scheduler = ConcurrentBatchScheduler::new(fetcher.clone());
        if let Some(token) = &options.cancel {
            scheduler = scheduler.with_cancellation(token.clone());
        }
        if let Some(callback) = &self.progress {
            scheduler = scheduler.with_progress(Arc::clone(callback));
        }
        if let Some(sink) = &options.sink {
            scheduler = scheduler.with_sink(Arc::clone(sink));
        }

        let schedule = ScheduleOptions {
            max_concurrency: options.max_concurrency,
            abort_threshold: options.abort_threshold,
            mode: options.mode,
            total_estimate: options.total_estimate,
            start_offset: resume.offset,
            deadline: options.deadline,
        };
        let mut outcome = scheduler.schedule_range(spec, &schedule, manager.as_mut()).await;
        if let Some(notice) = resume.notice {
            outcome.notices.insert(0, notice);
        }

        let complete = outcome.is_complete();
        if complete {
            if let Some(manager) = manager {
                if let Err(e) = manager.finish() {
                    warn!("failed to clear checkpoint: {}", e);
                }
            }
        }

        if let Some(cache) = &cache {
            if complete && resume.offset == 0 {
                if let Err(e) = cache.store(spec, outcome.pages.clone(), marker).await {
                    warn!("failed to cache result for {}: {}", spec.signature(), e);
                }
            }
        }

        outcome.stats.duration = started.elapsed();
        Ok(outcome.into_report())
    }

    fn retrying(&self) -> RetryingFetcher {
        RetryingFetcher::new(
            Arc::clone(&self.fetcher),
            RetryPolicy::from_config(&self.config.retry),
        )
    }

    fn cached_report(
        &self,
        entry: CacheEntry,
        options: &FetchOptions,
        fetcher: &RetryingFetcher,
        started: Instant,
    ) -> SyncReport {
        let pages = entry.pages.len();
        if let Some(sink) = &options.sink {
            for page in &entry.pages {
                sink(page);
            }
        }
        if let Some(callback) = &self.progress {
            callback(Progress {
                completed: pages,
                total: Some(pages),
            });
        }

        let records: Vec<Record> = entry.pages.into_iter().flat_map(|p| p.records).collect();
        SyncReport {
            stats: SyncStats {
                pages_total: pages,
                pages_completed: pages,
                pages_failed: 0,
                records: records.len(),
                requests: fetcher.stats().requests(),
                retries: fetcher.stats().retries(),
                cache_hits: 1,
                duration: started.elapsed(),
            },
            records,
            failures: Vec::new(),
            status: SyncStatus::Complete,
            notices: Vec::new(),
        }
    }
}

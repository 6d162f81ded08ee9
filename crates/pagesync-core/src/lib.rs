//! # pagesync-core
//!
//! Core functionality for pagesync - a resilient client for offset-paginated
//! query APIs.
//!
//! This crate retrieves large, filtered result sets from services that cap
//! the number of records per response. It pages through them sequentially or
//! with a bounded worker pool, retries transient failures, checkpoints
//! progress so interrupted runs resume where they stopped, and caches
//! complete results until the source reports a change.
//!
//! ## Architecture
//!
//! The crate is organized around several key components:
//!
//! - **Fetching**: [`PageFetcher`] issues one request per page; [`HttpFetcher`]
//!   speaks OData-style query parameters
//! - **Retry**: [`RetryingFetcher`] adds bounded exponential backoff
//! - **Pagination**: [`Paginator`] for lazy sequential streams,
//!   [`ConcurrentBatchScheduler`] for bounded parallel retrieval
//! - **Persistence**: [`CheckpointManager`] and [`ChangeAwareCache`] over
//!   pluggable stores
//! - **Facade**: [`SyncClient`] wires everything together from a [`Config`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pagesync_core::testing::MemorySource;
//! use pagesync_core::{Config, FetchOptions, SyncClient};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let client = SyncClient::with_fetcher(Arc::new(MemorySource::sequential(250)), Config::default());
//! let spec = client.query("https://example.com/items").build(client.page_cap())?;
//!
//! let report = client.fetch_all(&spec, FetchOptions::default()).await?;
//! assert!(report.is_complete());
//! assert_eq!(report.records.len(), 250);
//! # Ok::<(), pagesync_core::Error>(())
//! # }).unwrap();
//! ```
//!
//! ## Error Handling
//!
//! Setup problems are [`Error`]s. Page-level trouble is not: an operation
//! always returns a [`SyncReport`] carrying the records it got next to the
//! pages it could not get.
//!
//! ```rust
//! use pagesync_core::{Error, FetchError};
//!
//! let err = Error::from(FetchError::Server { status: 503 });
//! assert!(err.is_recoverable());
//! assert_eq!(err.category(), "fetch");
//! ```

/// Change-aware result cache
pub mod cache;
/// Checkpoint persistence and resume decisions
pub mod checkpoint;
/// High-level sync client
pub mod client;
/// Configuration management
pub mod config;
/// Error types and result aliases
pub mod error;
/// Page fetching over HTTP
pub mod fetcher;
/// Page request and response types
pub mod page;
/// Sequential lazy pagination
pub mod paginator;
/// Query descriptors and signatures
pub mod query;
/// Schema-less records
pub mod record;
/// Operation reports, statistics and notices
pub mod report;
/// Retry with exponential backoff
pub mod retry;
/// Bounded concurrent retrieval
pub mod scheduler;
/// Local JSON file storage
pub mod storage;
/// In-memory sources for tests and examples
pub mod testing;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheLookup, CacheOutcome, CacheSource, CacheStore, ChangeAwareCache,
    ChangeMarker, FileCacheStore, MemoryCacheStore,
};
pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    ResumePoint,
};
pub use client::{FetchOptions, SyncClient};
pub use config::{
    CacheConfig, Config, HttpConfig, PathsConfig, RetryConfig, SyncConfig, WireFormat,
};
pub use error::{Error, FetchError, FetchResult, Result};
pub use fetcher::{HttpFetcher, PageFetcher};
pub use page::{Page, PageRequest};
pub use paginator::Paginator;
pub use query::{OrderTerm, QuerySignature, QuerySpec, QuerySpecBuilder, SortDirection};
pub use record::Record;
pub use report::{
    Notice, PageFailure, PageSink, Progress, ProgressCallback, SyncReport, SyncStats, SyncStatus,
};
pub use retry::{RetryPolicy, RetryStats, RetryingFetcher};
pub use scheduler::{BatchOutcome, ConcurrentBatchScheduler, DeliveryMode, ScheduleOptions};

//! Sequential, lazy pagination over one query.
//!
//! A [`Paginator`] walks a dataset page by page in strictly increasing offset
//! order. Nothing is fetched until the stream is polled, and each page is
//! requested only after the previous one has been handed out, so memory use
//! is bounded by one page.
//!
//! The offset advances by the number of records each page actually
//! returned. Traversal stops at the first short or empty page.
//!
//! Offset pagination over a dataset that is mutated during traversal can
//! skip or repeat records. That is a property of the access method and is not
//! corrected here.
//!
//! ```rust
//! use std::sync::Arc;
//! use futures::TryStreamExt;
//! use pagesync_core::testing::MemorySource;
//! use pagesync_core::{Paginator, QuerySpec, RetryPolicy, RetryingFetcher};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let source = Arc::new(MemorySource::sequential(250));
//! let fetcher = RetryingFetcher::new(source, RetryPolicy::default());
//! let spec = QuerySpec::builder("https://example.com/items").page_size(100).build(100)?;
//!
//! let records: Vec<_> = Paginator::new(fetcher, spec).records().try_collect().await?;
//! assert_eq!(records.len(), 250);
//! # Ok::<(), pagesync_core::Error>(())
//! # }).unwrap();
//! ```

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Checkpoint, Error, Page, PageRequest, QuerySpec, Record, Result, RetryingFetcher};

struct Cursor {
    fetcher: RetryingFetcher,
    spec: QuerySpec,
    offset: u64,
    cancel: CancellationToken,
}

/// Lazy page stream for one [`QuerySpec`].
#[derive(Clone)]
pub struct Paginator {
    fetcher: RetryingFetcher,
    spec: QuerySpec,
    start_offset: u64,
    cancel: CancellationToken,
}

impl Paginator {
    /// Paginate `spec` from offset 0.
    #[must_use]
    pub fn new(fetcher: RetryingFetcher, spec: QuerySpec) -> Self {
        Self {
            fetcher,
            spec,
            start_offset: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Start at `offset` instead of 0.
    #[must_use]
    pub const fn starting_at(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    /// Continue from a stored checkpoint.
    ///
    /// Unlike [`CheckpointManager::begin`](crate::CheckpointManager::begin),
    /// which restarts from offset 0 with a notice, a checkpoint from another
    /// query is rejected here. Callers decide whether to restart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CheckpointMismatch`] if the checkpoint was recorded for
    /// a query with a different signature. The paginator is consumed; build a
    /// new one to start from offset 0.
    pub fn resume_from(self, checkpoint: &Checkpoint) -> Result<Self> {
        let current = self.spec.signature();
        if checkpoint.query_signature != current {
            return Err(Error::CheckpointMismatch {
                job_key: checkpoint.job_key.clone(),
                stored: checkpoint.query_signature.to_string(),
                current: current.to_string(),
            });
        }
        Ok(self.starting_at(checkpoint.last_completed_offset))
    }

    /// Stop fetching when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Query being paginated.
    #[must_use]
    pub const fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// Offset of the first request.
    #[must_use]
    pub const fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Stream of non-empty pages.
    ///
    /// The stream ends after the last page, or right after the first error.
    pub fn pages(self) -> BoxStream<'static, Result<Page>> {
        let Self {
            fetcher,
            spec,
            start_offset,
            cancel,
        } = self;

        let initial = Cursor {
            fetcher,
            spec,
            offset: start_offset,
            cancel,
        };

        stream::unfold(Some(initial), |state| async move {
            let mut state = state?;
            let request = PageRequest::new(state.offset, state.spec.page_size());
            match state
                .fetcher
                .fetch_with_retry(&state.spec, request, &state.cancel)
                .await
            {
                Ok(page) if page.is_empty() => {
                    debug!("empty page at offset {}, done", state.offset);
                    None
                },
                Ok(page) => {
                    state.offset = page.next_offset();
                    let next = if page.is_last {
                        debug!("short page at offset {}, done", page.offset);
                        None
                    } else {
                        Some(state)
                    };
                    Some((Ok(page), next))
                },
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }

    /// Stream of records in page order.
    pub fn records(self) -> BoxStream<'static, Result<Record>> {
        self.pages()
            .map_ok(|page| stream::iter(page.records.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// Drain every page into memory.
    ///
    /// # Errors
    ///
    /// Returns the first page error; pages fetched before it are dropped.
    pub async fn collect_all(self) -> Result<Vec<Page>> {
        self.pages().try_collect().await
    }
}

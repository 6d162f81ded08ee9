//! Pages and page requests.

use serde::{Deserialize, Serialize};

use crate::Record;

/// Parameters of one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Number of records to skip.
    pub offset: u64,
    /// Number of records requested.
    pub limit: usize,
    /// Ask the source to report the total count inline.
    pub include_count: bool,
}

impl PageRequest {
    /// A regular page request.
    #[must_use]
    pub const fn new(offset: u64, limit: usize) -> Self {
        Self {
            offset,
            limit,
            include_count: false,
        }
    }

    /// Request the inline total count as well.
    #[must_use]
    pub const fn with_count(mut self) -> Self {
        self.include_count = true;
        self
    }
}

/// Records returned by a single request.
///
/// `records.len() <= requested` always holds; fetchers truncate oversized
/// responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Records in the order the source returned them.
    pub records: Vec<Record>,
    /// Offset the page was requested at.
    pub offset: u64,
    /// Page size that was requested.
    pub requested: usize,
    /// Total record count, when the source reports one.
    pub total_count: Option<u64>,
    /// Fewer records came back than were requested.
    pub is_last: bool,
}

impl Page {
    /// Assemble a page, deriving `is_last` from the record count.
    #[must_use]
    pub fn new(
        records: Vec<Record>,
        offset: u64,
        requested: usize,
        total_count: Option<u64>,
    ) -> Self {
        let is_last = records.len() < requested;
        Self {
            records,
            offset,
            requested,
            total_count,
            is_last,
        }
    }

    /// Number of records on the page.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the page carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Offset of the record following this page.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + self.records.len() as u64
    }
}

//! Query descriptors and their signatures.
//!
//! A [`QuerySpec`] captures everything that shapes the records a sync
//! operation retrieves: endpoint, filter, field selection, relationship
//! expansion, ordering and page size. It is built once, validated, and never
//! mutated afterwards.
//!
//! ## Signatures
//!
//! [`QuerySpec::signature`] derives a [`QuerySignature`] from every field. Two
//! specs with identical fields share a signature; changing any field (even the
//! order of the `select` list, which changes the request) changes it.
//! Checkpoints and cache entries record the signature so they are only ever
//! applied to the query that produced them.
//!
//! ```rust
//! use pagesync_core::{QuerySpec, SortDirection};
//!
//! let spec = QuerySpec::builder("https://api.example.com/v1/orders")
//!     .filter("status eq 'open'")
//!     .select(["id", "total"])
//!     .order_by("id", SortDirection::Ascending)
//!     .page_size(50)
//!     .build(100)?;
//!
//! assert!(spec.signature().as_str().starts_with("qs_"));
//! assert_eq!(spec.job_key(), "https://api.example.com/v1/orders");
//! # Ok::<(), pagesync_core::Error>(())
//! ```

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{Error, Result};

/// Sort direction of one ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

impl SortDirection {
    const fn keyword(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

/// One term of an ordering clause, e.g. `modifiedAt desc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderTerm {
    /// Field to order by.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

impl OrderTerm {
    /// Parse `"field"`, `"field asc"` or `"field desc"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();
        let field = parts
            .next()
            .ok_or_else(|| Error::InvalidQuery("empty ordering term".into()))?;
        let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => SortDirection::Ascending,
            Some("desc") => SortDirection::Descending,
            Some(other) => {
                return Err(Error::InvalidQuery(format!(
                    "unknown sort direction '{other}' in '{raw}'"
                )));
            },
        };
        if parts.next().is_some() {
            return Err(Error::InvalidQuery(format!(
                "unexpected tokens in ordering term '{raw}'"
            )));
        }
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }
}

impl std::fmt::Display for OrderTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.direction.keyword())
    }
}

/// Stable identifier of a query's full shape: `qs_<sha256_16>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuerySignature(String);

impl QuerySignature {
    /// Wrap an existing signature string (e.g. one read back from storage).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the string representation, including the `qs_` prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable query descriptor.
///
/// Construct with [`QuerySpec::builder`]. Fields are private so a built spec
/// cannot drift from the signature checkpoints were recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    endpoint: String,
    filter: Option<String>,
    select: Vec<String>,
    expand: Vec<String>,
    order: Vec<OrderTerm>,
    page_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected_max: Option<u64>,
}

impl QuerySpec {
    /// Default page size when the builder is not given one.
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    /// Start building a spec for `endpoint`.
    pub fn builder(endpoint: impl Into<String>) -> QuerySpecBuilder {
        QuerySpecBuilder {
            spec: Self {
                endpoint: endpoint.into(),
                filter: None,
                select: Vec::new(),
                expand: Vec::new(),
                order: Vec::new(),
                page_size: Self::DEFAULT_PAGE_SIZE,
                job_key: None,
                expected_max: None,
            },
        }
    }

    /// Target endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Filter expression, passed through verbatim.
    #[must_use]
    pub fn filter_expr(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Selected fields, in request order.
    #[must_use]
    pub fn selected(&self) -> &[String] {
        &self.select
    }

    /// Expanded relationships, in request order.
    #[must_use]
    pub fn expanded(&self) -> &[String] {
        &self.expand
    }

    /// Ordering terms.
    #[must_use]
    pub fn ordering(&self) -> &[OrderTerm] {
        &self.order
    }

    /// Ordering clause rendered as `a asc,b desc`, or `None` when unordered.
    #[must_use]
    pub fn order_clause(&self) -> Option<String> {
        if self.order.is_empty() {
            return None;
        }
        Some(
            self.order
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Records requested per page.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Upper bound the caller expects the result to respect, if any.
    #[must_use]
    pub const fn expected_max(&self) -> Option<u64> {
        self.expected_max
    }

    /// Key under which checkpoints for this query are stored.
    ///
    /// Defaults to the endpoint so that re-running the same endpoint with a
    /// different filter finds (and rejects) the old checkpoint.
    #[must_use]
    pub fn job_key(&self) -> &str {
        self.job_key.as_deref().unwrap_or(&self.endpoint)
    }

    /// Compute the signature over every field that shapes the request.
    ///
    /// The job key and the expectation hint are bookkeeping, not part of the
    /// query shape, and are excluded.
    #[must_use]
    pub fn signature(&self) -> QuerySignature {
        let mut hasher = Sha256::new();
        // Length-prefixed fields keep ("ab","c") and ("a","bc") apart.
        let mut feed = |tag: &str, value: &str| {
            hasher.update(tag.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        };
        feed("endpoint", &self.endpoint);
        feed("filter", self.filter.as_deref().unwrap_or(""));
        feed("filter?", if self.filter.is_some() { "1" } else { "0" });
        for field in &self.select {
            feed("select", field);
        }
        for rel in &self.expand {
            feed("expand", rel);
        }
        for term in &self.order {
            feed("order", &term.to_string());
        }
        feed("page_size", &self.page_size.to_string());
        let digest = hasher.finalize();

        let hex = digest.iter().take(8).fold(String::new(), |mut acc, b| {
            // write! to String is infallible
            let _ = write!(acc, "{b:02x}");
            acc
        });
        QuerySignature(format!("qs_{hex}"))
    }

    /// Derive the one-record probe used to read the newest change marker.
    ///
    /// Keeps endpoint and filter, selects only the marker field and orders by
    /// it descending.
    #[must_use]
    pub fn change_probe(&self, marker_field: &str) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            filter: self.filter.clone(),
            select: vec![marker_field.to_string()],
            expand: Vec::new(),
            order: vec![OrderTerm {
                field: marker_field.to_string(),
                direction: SortDirection::Descending,
            }],
            page_size: 1,
            job_key: None,
            expected_max: None,
        }
    }
}

/// Consuming builder for [`QuerySpec`].
#[derive(Debug, Clone)]
#[must_use]
pub struct QuerySpecBuilder {
    spec: QuerySpec,
}

impl QuerySpecBuilder {
    /// Set the filter expression.
    pub fn filter(mut self, expr: impl Into<String>) -> Self {
        self.spec.filter = Some(expr.into());
        self
    }

    /// Set the selected fields.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.select = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set the expanded relationships.
    pub fn expand<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.expand = relations.into_iter().map(Into::into).collect();
        self
    }

    /// Append an ordering term.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.spec.order.push(OrderTerm {
            field: field.into(),
            direction,
        });
        self
    }

    /// Append an already-parsed ordering term.
    pub fn order_term(mut self, term: OrderTerm) -> Self {
        self.spec.order.push(term);
        self
    }

    /// Set the page size.
    pub const fn page_size(mut self, size: usize) -> Self {
        self.spec.page_size = size;
        self
    }

    /// Store checkpoints under `key` instead of the endpoint.
    pub fn job_key(mut self, key: impl Into<String>) -> Self {
        self.spec.job_key = Some(key.into());
        self
    }

    /// Declare that the result should never exceed `n` records.
    ///
    /// Used only to flag suspicious results; nothing is truncated.
    pub const fn expect_at_most(mut self, n: u64) -> Self {
        self.spec.expected_max = Some(n);
        self
    }

    /// Validate and freeze the query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidQuery`] when the endpoint is not an absolute
    /// http(s) URL or the page size is outside `1..=page_cap`.
    pub fn build(self, page_cap: usize) -> Result<QuerySpec> {
        let spec = self.spec;
        let url = Url::parse(&spec.endpoint)
            .map_err(|e| Error::InvalidQuery(format!("bad endpoint '{}': {e}", spec.endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidQuery(format!(
                "unsupported scheme '{}' in '{}'",
                url.scheme(),
                spec.endpoint
            )));
        }
        if spec.page_size == 0 || spec.page_size > page_cap {
            return Err(Error::InvalidQuery(format!(
                "page size {} outside 1..={page_cap}",
                spec.page_size
            )));
        }
        if let Some(term) = spec.order.iter().find(|t| t.field.trim().is_empty()) {
            return Err(Error::InvalidQuery(format!("empty ordering field in '{term}'")));
        }
        Ok(spec)
    }
}

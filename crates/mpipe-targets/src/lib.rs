//! Downstream target contracts + HTTP/SQL adapters for Solr, the metrics
//! store and the link resolver.

pub mod links;
pub mod metrics;
pub mod solr;

use async_trait::async_trait;
use mpipe_core::{Document, Target};
use thiserror::Error;

pub use links::HttpLinkResolver;
pub use metrics::{MemoryMetricsStore, MetricsRow, PgMetricsStore};
pub use solr::{rewrite_collection, SolrIndex};

pub const CRATE_NAME: &str = "mpipe-targets";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("{target} request to {url} failed: {source}")]
    Transport {
        target: Target,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{target} endpoint {url} returned {status}: {body}")]
    Status {
        target: Target,
        url: String,
        status: u16,
        body: String,
    },
    #[error("invalid endpoint url {url}: {detail}")]
    InvalidUrl { url: String, detail: String },
    #[error("metrics row for {bibcode} is malformed: {detail}")]
    InvalidRow { bibcode: String, detail: String },
    #[error("metrics store error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{target} rejected the request: {detail}")]
    Rejected { target: Target, detail: String },
}

impl TargetError {
    /// True when the downstream response names `field`, e.g. Solr complaining
    /// about `body`. Endpoint URLs and transport failures never count.
    pub fn mentions_field(&self, field: &str) -> bool {
        match self {
            Self::Status { body, .. } => body.contains(field),
            Self::Rejected { detail, .. } => detail.contains(field),
            Self::Transport { .. }
            | Self::InvalidUrl { .. }
            | Self::InvalidRow { .. }
            | Self::Database(_) => false,
        }
    }
}

/// Search index accepting JSON document arrays.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Sends `documents` to every configured endpoint; succeeds only if all accept.
    async fn submit(&self, documents: &[Document], commit: bool) -> Result<(), TargetError>;

    async fn delete(&self, bibcode: &str) -> Result<(), TargetError>;
}

/// Relational metrics table keyed by bibcode.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Inserts or updates every row, all or nothing.
    async fn upsert(&self, rows: &[MetricsRow]) -> Result<(), TargetError>;

    /// Returns whether a row was removed.
    async fn delete(&self, bibcode: &str) -> Result<bool, TargetError>;
}

/// External link-resolver service.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn update(&self, documents: &[Document]) -> Result<(), TargetError>;
}

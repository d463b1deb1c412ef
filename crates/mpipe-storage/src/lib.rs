//! Record store adapter + shared HTTP client configuration.

pub mod memory;
pub mod postgres;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mpipe_core::{
    ChangeLogEntry, DataError, IdentifierMapping, Record, RecordStatus, Resolution, Slot,
    SourceUpdate, Target,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

pub const CRATE_NAME: &str = "mpipe-storage";

/// Upper bound on mapping hops followed when resolving or compacting a chain.
pub const MAX_MAPPING_HOPS: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Contract(String),
    #[error("identifier mapping from {bibcode} exceeds {hops} hops")]
    MappingTooDeep { bibcode: String, hops: usize },
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of one dispatch attempt for one identifier on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub bibcode: String,
    pub target: Target,
    pub result: DeliveryResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered { checksum: String },
    Failed,
}

impl DeliveryOutcome {
    pub fn delivered(bibcode: impl Into<String>, target: Target, checksum: impl Into<String>) -> Self {
        Self {
            bibcode: bibcode.into(),
            target,
            result: DeliveryResult::Delivered {
                checksum: checksum.into(),
            },
        }
    }

    pub fn failed(bibcode: impl Into<String>, target: Target) -> Self {
        Self {
            bibcode: bibcode.into(),
            target,
            result: DeliveryResult::Failed,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.result, DeliveryResult::Delivered { .. })
    }

    /// Applies this outcome to an in-memory record.
    pub fn apply(&self, record: &mut Record, now: DateTime<Utc>) {
        match &self.result {
            DeliveryResult::Delivered { checksum } => {
                record.mark_delivered(self.target, checksum.clone(), now)
            }
            DeliveryResult::Failed => record.mark_failed(self.target),
        }
    }
}

/// Storage seam for the pipeline. Every method is one scoped transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Overwrites one slot, creating the record on first write. A replaced
    /// payload is captured in the changelog under the slot name.
    async fn write_slot(
        &self,
        bibcode: &str,
        slot: Slot,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError>;

    async fn get(&self, bibcode: &str) -> Result<Option<Record>, StoreError>;

    /// Records for the identifiers that exist, in request order.
    async fn get_many(&self, bibcodes: &[String]) -> Result<Vec<Record>, StoreError>;

    /// Persists a batch of dispatch outcomes atomically.
    async fn record_outcomes(
        &self,
        outcomes: &[DeliveryOutcome],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_status(&self, bibcodes: &[String], status: RecordStatus) -> Result<u64, StoreError>;

    /// Identifiers whose shared status is a target failure marker, oldest rows first.
    async fn failed_bibcodes(&self, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Identifiers updated at or after `since`. Unless `force`, only those not
    /// processed since their last update.
    async fn updated_since(
        &self,
        since: DateTime<Utc>,
        force: bool,
    ) -> Result<Vec<String>, StoreError>;

    async fn all_bibcodes(&self) -> Result<Vec<String>, StoreError>;

    /// Removes the record and tombstones it in the changelog. `None` when absent.
    async fn delete(&self, bibcode: &str, now: DateTime<Utc>) -> Result<Option<Record>, StoreError>;

    /// Renames the record and compacts the mapping chain so every chain root
    /// points at `new` in one hop. Intermediate identifiers lose their edge:
    /// after A -> B then B -> C only `A -> C` remains and B resolves to itself.
    async fn rename(&self, old: &str, new: &str, now: DateTime<Utc>) -> Result<Record, StoreError>;

    async fn resolve(&self, bibcode: &str) -> Result<Resolution, StoreError>;

    async fn mappings(&self) -> Result<Vec<IdentifierMapping>, StoreError>;

    async fn changelog(&self, key: &str) -> Result<Vec<ChangeLogEntry>, StoreError>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Ingest entry point for updates already classified at the transport boundary.
    async fn apply_update(
        &self,
        bibcode: &str,
        update: SourceUpdate,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError> {
        let (slot, payload) = update.into_parts();
        self.write_slot(bibcode, slot, payload, now).await
    }
}

pub(crate) fn check_rename(old: &str, new: &str) -> Result<(), StoreError> {
    if old.trim().is_empty() || new.trim().is_empty() {
        return Err(StoreError::Contract("rename requires two identifiers".into()));
    }
    if old == new {
        return Err(StoreError::Contract(format!("rename of {old} onto itself")));
    }
    Ok(())
}

/// Keys whose mapping edges must be rewritten when `old` is renamed: every key
/// reaching `old` through the chain, plus an edge keyed by `old` itself.
pub fn chain_keys(
    mappings: &BTreeMap<String, String>,
    old: &str,
) -> Result<BTreeSet<String>, StoreError> {
    let mut reached = BTreeSet::from([old.to_string()]);
    let mut frontier = vec![old.to_string()];
    for _ in 0..MAX_MAPPING_HOPS {
        if frontier.is_empty() {
            break;
        }
        let next = mappings
            .iter()
            .filter(|(key, target)| frontier.contains(*target) && !reached.contains(*key))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        reached.extend(next.iter().cloned());
        frontier = next;
    }
    if !frontier.is_empty() {
        return Err(StoreError::MappingTooDeep {
            bibcode: old.to_string(),
            hops: MAX_MAPPING_HOPS,
        });
    }
    Ok(reached
        .into_iter()
        .filter(|key| mappings.contains_key(key))
        .collect())
}

/// Rewrites the chain through `old` to point at `new`. A fresh `old -> new`
/// edge is added only when no chain existed, so an `old` that was itself
/// reached by an earlier rename keeps no edge.
pub fn compact_chain(
    mappings: &mut BTreeMap<String, String>,
    old: &str,
    new: &str,
) -> Result<(), StoreError> {
    let keys = chain_keys(mappings, old)?;
    if keys.is_empty() {
        mappings.insert(old.to_string(), new.to_string());
    } else {
        for key in keys {
            mappings.insert(key, new.to_string());
        }
    }
    mappings.remove(new);
    Ok(())
}

/// Follows mapping edges from `bibcode` until none remain.
pub fn follow_mappings(
    mappings: &BTreeMap<String, String>,
    bibcode: &str,
) -> Result<Resolution, StoreError> {
    let mut current = bibcode.to_string();
    let mut hops = Vec::new();
    while let Some(target) = mappings.get(&current) {
        if hops.len() >= MAX_MAPPING_HOPS {
            return Err(StoreError::MappingTooDeep {
                bibcode: bibcode.to_string(),
                hops: MAX_MAPPING_HOPS,
            });
        }
        hops.push(IdentifierMapping {
            key: current.clone(),
            target: target.clone(),
        });
        current = target.clone();
    }
    Ok(Resolution {
        requested: bibcode.to_string(),
        canonical: current,
        hops,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build().context("building reqwest client")
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mpipe_core::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPool;
use tokio::sync::Mutex;

use crate::{MetricsStore, TargetError};

/// One row of the metrics table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsRow {
    pub bibcode: String,
    #[serde(default)]
    pub refereed: Option<bool>,
    #[serde(default)]
    pub rn_citations: Option<f64>,
    #[serde(default)]
    pub rn_citation_data: Option<JsonValue>,
    #[serde(default)]
    pub downloads: Option<Vec<i32>>,
    #[serde(default)]
    pub reads: Option<Vec<i32>>,
    #[serde(default)]
    pub an_citations: Option<f64>,
    #[serde(default)]
    pub refereed_citation_num: Option<i32>,
    #[serde(default)]
    pub citation_num: Option<i32>,
    #[serde(default)]
    pub reference_num: Option<i32>,
    #[serde(default)]
    pub citations: Option<Vec<String>>,
    #[serde(default)]
    pub refereed_citations: Option<Vec<String>>,
    #[serde(default)]
    pub author_num: Option<i32>,
    #[serde(default)]
    pub an_refereed_citations: Option<f64>,
    #[serde(default)]
    pub modtime: Option<DateTime<Utc>>,
}

impl MetricsRow {
    pub fn from_document(document: &Document) -> Result<Self, TargetError> {
        let bibcode = document
            .get("bibcode")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        serde_json::from_value(JsonValue::Object(document.clone())).map_err(|err| {
            TargetError::InvalidRow {
                bibcode,
                detail: err.to_string(),
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgMetricsStore {
    pool: PgPool,
}

impl PgMetricsStore {
    pub async fn connect(database_url: &str) -> Result<Self, TargetError> {
        Ok(Self {
            pool: PgPool::connect(database_url).await?,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The metrics table may share a database with the record tables.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let mut migrator = sqlx::migrate!("../../migrations/metrics");
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for PgMetricsStore {
    async fn upsert(&self, rows: &[MetricsRow]) -> Result<(), TargetError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO metrics (
                    bibcode, refereed, rn_citations, rn_citation_data, downloads, reads,
                    an_citations, refereed_citation_num, citation_num, reference_num,
                    citations, refereed_citations, author_num, an_refereed_citations, modtime
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (bibcode) DO UPDATE SET
                    refereed = EXCLUDED.refereed,
                    rn_citations = EXCLUDED.rn_citations,
                    rn_citation_data = EXCLUDED.rn_citation_data,
                    downloads = EXCLUDED.downloads,
                    reads = EXCLUDED.reads,
                    an_citations = EXCLUDED.an_citations,
                    refereed_citation_num = EXCLUDED.refereed_citation_num,
                    citation_num = EXCLUDED.citation_num,
                    reference_num = EXCLUDED.reference_num,
                    citations = EXCLUDED.citations,
                    refereed_citations = EXCLUDED.refereed_citations,
                    author_num = EXCLUDED.author_num,
                    an_refereed_citations = EXCLUDED.an_refereed_citations,
                    modtime = EXCLUDED.modtime
                "#,
            )
            .bind(&row.bibcode)
            .bind(row.refereed)
            .bind(row.rn_citations)
            .bind(&row.rn_citation_data)
            .bind(&row.downloads)
            .bind(&row.reads)
            .bind(row.an_citations)
            .bind(row.refereed_citation_num)
            .bind(row.citation_num)
            .bind(row.reference_num)
            .bind(&row.citations)
            .bind(&row.refereed_citations)
            .bind(row.author_num)
            .bind(row.an_refereed_citations)
            .bind(row.modtime.unwrap_or(now))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, bibcode: &str) -> Result<bool, TargetError> {
        let result = sqlx::query("DELETE FROM metrics WHERE bibcode = $1")
            .bind(bibcode)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Metrics table held in memory; upserts replace the whole map only on success.
#[derive(Debug, Default)]
pub struct MemoryMetricsStore {
    rows: Mutex<BTreeMap<String, MetricsRow>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<MetricsRow> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, bibcode: &str) -> Option<MetricsRow> {
        self.rows.lock().await.get(bibcode).cloned()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn upsert(&self, rows: &[MetricsRow]) -> Result<(), TargetError> {
        let mut guard = self.rows.lock().await;
        let mut working = guard.clone();
        let now = Utc::now();
        for row in rows {
            if row.bibcode.is_empty() {
                return Err(TargetError::InvalidRow {
                    bibcode: String::new(),
                    detail: "missing bibcode".into(),
                });
            }
            let mut row = row.clone();
            row.modtime.get_or_insert(now);
            working.insert(row.bibcode.clone(), row);
        }
        *guard = working;
        Ok(())
    }

    async fn delete(&self, bibcode: &str) -> Result<bool, TargetError> {
        Ok(self.rows.lock().await.remove(bibcode).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(bibcode: &str, citation_num: i32) -> MetricsRow {
        MetricsRow {
            bibcode: bibcode.into(),
            citation_num: Some(citation_num),
            ..MetricsRow::default()
        }
    }

    #[test]
    fn rows_parse_from_metrics_documents() {
        let doc = json!({
            "bibcode": "2019AJ....158..123X",
            "refereed": true,
            "citation_num": 4,
            "citations": ["a", "b"],
            "reads": [1, 2, 3],
        });
        let JsonValue::Object(doc) = doc else { unreachable!() };
        let row = MetricsRow::from_document(&doc).expect("row");
        assert_eq!(row.refereed, Some(true));
        assert_eq!(row.reads, Some(vec![1, 2, 3]));
        assert_eq!(row.author_num, None);
    }

    #[test]
    fn malformed_rows_name_the_bibcode() {
        let JsonValue::Object(doc) = json!({"bibcode": "X", "citation_num": "many"}) else {
            unreachable!()
        };
        match MetricsRow::from_document(&doc) {
            Err(TargetError::InvalidRow { bibcode, .. }) => assert_eq!(bibcode, "X"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_upsert_updates_in_place() {
        let store = MemoryMetricsStore::new();
        store.upsert(&[row("a", 1), row("b", 2)]).await.expect("first");
        store.upsert(&[row("a", 10), row("b", 20)]).await.expect("second");

        let rows = store.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].citation_num, Some(10));
        assert_eq!(rows[1].citation_num, Some(20));
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let store = MemoryMetricsStore::new();
        let err = store.upsert(&[row("a", 1), row("", 2)]).await;
        assert!(err.is_err());
        assert!(store.rows().await.is_empty());
        assert!(!store.delete("a").await.unwrap());
    }
}

//! Postgres-backed record store.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mpipe_core::{
    ChangeLogEntry, IdentifierMapping, Record, RecordStatus, Resolution, Slot, Target,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use tracing::debug;

use crate::{
    check_rename, compact_chain, DeliveryOutcome, DeliveryResult, RecordStore, StoreError,
    MAX_MAPPING_HOPS,
};

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut migrator = sqlx::migrate!("../../migrations/records");
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<Record, StoreError> {
    let bibcode: String = row.try_get("bibcode")?;
    let mut record = Record::new(row.try_get("id")?, bibcode, row.try_get("created")?);
    record.updated = row.try_get("updated")?;
    record.processed = row.try_get("processed")?;

    for slot in Slot::ALL {
        let updated_col = format!("{slot}_updated");
        let entry = record.slot_mut(slot);
        entry.payload = row.try_get(slot.as_str())?;
        entry.updated = row.try_get(updated_col.as_str())?;
    }
    for target in Target::ALL {
        let checksum_col = format!("{target}_checksum");
        let processed_col = format!("{target}_processed");
        let state = record.delivery_mut(target);
        state.checksum = row.try_get(checksum_col.as_str())?;
        state.processed = row.try_get(processed_col.as_str())?;
    }

    let status: Option<String> = row.try_get("status")?;
    record.status = status.map(|s| s.parse::<RecordStatus>()).transpose()?;
    Ok(record)
}

async fn append_changelog(
    conn: &mut PgConnection,
    key: &str,
    event: &str,
    old_value: Option<String>,
    permanent: bool,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO change_log (created, key, type, oldvalue, permanent)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(now)
    .bind(key)
    .bind(event)
    .bind(old_value)
    .bind(permanent)
    .execute(conn)
    .await?;
    Ok(())
}

/// Loads every edge reaching `old`, plus the edges keyed by `old` and `new`.
async fn load_chain(
    conn: &mut PgConnection,
    old: &str,
    new: &str,
) -> Result<BTreeMap<String, String>, StoreError> {
    let mut edges = BTreeMap::new();
    for key in [old, new] {
        let row = sqlx::query("SELECT key, target FROM identifiers WHERE key = $1")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(row) = row {
            edges.insert(row.try_get("key")?, row.try_get("target")?);
        }
    }

    let mut visited = BTreeSet::from([old.to_string()]);
    let mut frontier = vec![old.to_string()];
    for _ in 0..MAX_MAPPING_HOPS {
        if frontier.is_empty() {
            break;
        }
        let rows = sqlx::query("SELECT key, target FROM identifiers WHERE target = ANY($1)")
            .bind(&frontier)
            .fetch_all(&mut *conn)
            .await?;
        frontier = Vec::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let target: String = row.try_get("target")?;
            edges.insert(key.clone(), target);
            if visited.insert(key.clone()) {
                frontier.push(key);
            }
        }
    }
    if !frontier.is_empty() {
        return Err(StoreError::MappingTooDeep {
            bibcode: old.to_string(),
            hops: MAX_MAPPING_HOPS,
        });
    }
    Ok(edges)
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn write_slot(
        &self,
        bibcode: &str,
        slot: Slot,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError> {
        if bibcode.trim().is_empty() {
            return Err(StoreError::Contract("empty bibcode".into()));
        }
        let col = slot.as_str();
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT {col} FROM records WHERE bibcode = $1 FOR UPDATE");
        let existing = sqlx::query(&select)
            .bind(bibcode)
            .fetch_optional(&mut *tx)
            .await?;

        let row = match existing {
            Some(row) => {
                let previous: Option<JsonValue> = row.try_get(col)?;
                let old_value = previous
                    .filter(|p| !p.is_null())
                    .map(|p| serde_json::to_string(&p))
                    .transpose()?;
                append_changelog(&mut tx, bibcode, col, old_value, false, now).await?;
                let update = format!(
                    "UPDATE records SET {col} = $1, {col}_updated = $2, updated = $2 \
                     WHERE bibcode = $3 RETURNING *"
                );
                sqlx::query(&update)
                    .bind(&payload)
                    .bind(now)
                    .bind(bibcode)
                    .fetch_one(&mut *tx)
                    .await?
            }
            None => {
                let insert = format!(
                    "INSERT INTO records (bibcode, {col}, {col}_updated, created, updated) \
                     VALUES ($1, $2, $3, $3, $3) RETURNING *"
                );
                let row = sqlx::query(&insert)
                    .bind(bibcode)
                    .bind(&payload)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                append_changelog(&mut tx, bibcode, col, None, false, now).await?;
                row
            }
        };

        let record = record_from_row(&row)?;
        tx.commit().await?;
        debug!(bibcode, slot = col, "slot written");
        Ok(record)
    }

    async fn get(&self, bibcode: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query("SELECT * FROM records WHERE bibcode = $1")
            .bind(bibcode)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_many(&self, bibcodes: &[String]) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query("SELECT * FROM records WHERE bibcode = ANY($1)")
            .bind(bibcodes)
            .fetch_all(&self.pool)
            .await?;
        let mut by_bibcode = rows
            .iter()
            .map(|row| record_from_row(row).map(|r| (r.bibcode.clone(), r)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(bibcodes
            .iter()
            .filter_map(|b| by_bibcode.remove(b))
            .collect())
    }

    async fn record_outcomes(
        &self,
        outcomes: &[DeliveryOutcome],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for outcome in outcomes {
            match &outcome.result {
                DeliveryResult::Delivered { checksum } => {
                    let t = outcome.target.as_str();
                    let sql = format!(
                        "UPDATE records SET {t}_checksum = $1, {t}_processed = $2, \
                         processed = $2, status = $3 WHERE bibcode = $4"
                    );
                    sqlx::query(&sql)
                        .bind(checksum)
                        .bind(now)
                        .bind(RecordStatus::Success.as_str())
                        .bind(&outcome.bibcode)
                        .execute(&mut *tx)
                        .await?;
                }
                DeliveryResult::Failed => {
                    sqlx::query("UPDATE records SET status = $1 WHERE bibcode = $2")
                        .bind(outcome.target.failure_status().as_str())
                        .bind(&outcome.bibcode)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_status(&self, bibcodes: &[String], status: RecordStatus) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE records SET status = $1 WHERE bibcode = ANY($2)")
            .bind(status.as_str())
            .bind(bibcodes)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn failed_bibcodes(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let failures = RecordStatus::FAILURES
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>();
        let rows = sqlx::query(
            r#"
            SELECT bibcode
              FROM records
             WHERE status = ANY($1)
             ORDER BY id
             LIMIT $2
            "#,
        )
        .bind(&failures)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("bibcode").map_err(StoreError::from))
            .collect()
    }

    async fn updated_since(
        &self,
        since: DateTime<Utc>,
        force: bool,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bibcode
              FROM records
             WHERE updated >= $1
               AND ($2 OR processed IS NULL OR processed < updated)
             ORDER BY updated, id
            "#,
        )
        .bind(since)
        .bind(force)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("bibcode").map_err(StoreError::from))
            .collect()
    }

    async fn all_bibcodes(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT bibcode FROM records ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("bibcode").map_err(StoreError::from))
            .collect()
    }

    async fn delete(&self, bibcode: &str, now: DateTime<Utc>) -> Result<Option<Record>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM records WHERE bibcode = $1 FOR UPDATE")
            .bind(bibcode)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let record = record_from_row(&row)?;

        sqlx::query("DELETE FROM records WHERE bibcode = $1")
            .bind(bibcode)
            .execute(&mut *tx)
            .await?;
        let old_value = serde_json::to_string(&record)?;
        append_changelog(&mut tx, bibcode, ChangeLogEntry::DELETED, Some(old_value), false, now)
            .await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    async fn rename(&self, old: &str, new: &str, now: DateTime<Utc>) -> Result<Record, StoreError> {
        check_rename(old, new)?;
        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query("SELECT 1 FROM records WHERE bibcode = $1")
            .bind(new)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(StoreError::Contract(format!("{new} already exists")));
        }

        let row = sqlx::query(
            "UPDATE records SET bibcode = $1, updated = $2 WHERE bibcode = $3 RETURNING *",
        )
        .bind(new)
        .bind(now)
        .bind(old)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
        let record = record_from_row(&row)?;

        let before = load_chain(&mut tx, old, new).await?;
        let mut after = before.clone();
        compact_chain(&mut after, old, new)?;

        for key in before.keys().filter(|k| !after.contains_key(*k)) {
            sqlx::query("DELETE FROM identifiers WHERE key = $1")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        for (key, target) in after.iter().filter(|(k, t)| before.get(*k) != Some(*t)) {
            sqlx::query(
                r#"
                INSERT INTO identifiers (key, target) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET target = EXCLUDED.target
                "#,
            )
            .bind(key)
            .bind(target)
            .execute(&mut *tx)
            .await?;
        }

        append_changelog(&mut tx, new, ChangeLogEntry::RENAMED, Some(old.to_string()), true, now)
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn resolve(&self, bibcode: &str) -> Result<Resolution, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut current = bibcode.to_string();
        let mut hops = Vec::new();
        loop {
            let row = sqlx::query("SELECT target FROM identifiers WHERE key = $1")
                .bind(&current)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else { break };
            if hops.len() >= MAX_MAPPING_HOPS {
                return Err(StoreError::MappingTooDeep {
                    bibcode: bibcode.to_string(),
                    hops: MAX_MAPPING_HOPS,
                });
            }
            let target: String = row.try_get("target")?;
            hops.push(IdentifierMapping {
                key: current.clone(),
                target: target.clone(),
            });
            current = target;
        }
        tx.commit().await?;
        Ok(Resolution {
            requested: bibcode.to_string(),
            canonical: current,
            hops,
        })
    }

    async fn mappings(&self) -> Result<Vec<IdentifierMapping>, StoreError> {
        let rows = sqlx::query("SELECT key, target FROM identifiers ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(IdentifierMapping {
                    key: row.try_get("key")?,
                    target: row.try_get("target")?,
                })
            })
            .collect()
    }

    async fn changelog(&self, key: &str) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, created, key, type, oldvalue, permanent
              FROM change_log
             WHERE key = $1
             ORDER BY id
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ChangeLogEntry {
                    id: row.try_get("id")?,
                    created: row.try_get("created")?,
                    key: row.try_get("key")?,
                    event: row.try_get("type")?,
                    old_value: row.try_get("oldvalue")?,
                    permanent: row.try_get("permanent")?,
                })
            })
            .collect()
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM storage WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<Option<String>, _>("value"))
            .transpose()?
            .flatten())
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO storage (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

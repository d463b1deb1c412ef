//! In-process record store. Each operation works on a copy of the state that
//! replaces the original only when the operation succeeds.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mpipe_core::{ChangeLogEntry, IdentifierMapping, Record, RecordStatus, Resolution, Slot};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{
    check_rename, compact_chain, follow_mappings, DeliveryOutcome, RecordStore, StoreError,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    records: BTreeMap<String, Record>,
    next_record_id: i64,
    changelog: Vec<ChangeLogEntry>,
    mappings: BTreeMap<String, String>,
    kv: BTreeMap<String, String>,
}

impl MemoryState {
    fn log(&mut self, key: &str, event: &str, old_value: Option<String>, permanent: bool, now: DateTime<Utc>) {
        let id = self.changelog.len() as i64 + 1;
        self.changelog.push(ChangeLogEntry {
            id,
            created: now,
            key: key.to_string(),
            event: event.to_string(),
            old_value,
            permanent,
        });
    }

    fn record_mut(&mut self, bibcode: &str) -> Result<&mut Record, StoreError> {
        self.records
            .get_mut(bibcode)
            .ok_or_else(|| StoreError::NotFound(bibcode.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transaction<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let mut guard = self.state.lock().await;
        let mut working = guard.clone();
        let value = f(&mut working)?;
        *guard = working;
        Ok(value)
    }

    async fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T + Send) -> T {
        let guard = self.state.lock().await;
        f(&guard)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
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
        self.transaction(|state| {
            if !state.records.contains_key(bibcode) {
                state.next_record_id += 1;
                let record = Record::new(state.next_record_id, bibcode, now);
                state.records.insert(bibcode.to_string(), record);
            }
            let record = state.record_mut(bibcode)?;
            let previous = record.write_slot(slot, payload, now);
            let snapshot = record.clone();
            let old_value = previous
                .filter(|p| !p.is_null())
                .map(|p| serde_json::to_string(&p))
                .transpose()?;
            state.log(bibcode, slot.as_str(), old_value, false, now);
            Ok(snapshot)
        })
        .await
    }

    async fn get(&self, bibcode: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.read(|state| state.records.get(bibcode).cloned()).await)
    }

    async fn get_many(&self, bibcodes: &[String]) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .read(|state| {
                bibcodes
                    .iter()
                    .filter_map(|b| state.records.get(b).cloned())
                    .collect()
            })
            .await)
    }

    async fn record_outcomes(
        &self,
        outcomes: &[DeliveryOutcome],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transaction(|state| {
            for outcome in outcomes {
                // A record deleted mid-run has nothing left to stamp.
                if let Some(record) = state.records.get_mut(&outcome.bibcode) {
                    outcome.apply(record, now);
                }
            }
            Ok(())
        })
        .await
    }

    async fn set_status(&self, bibcodes: &[String], status: RecordStatus) -> Result<u64, StoreError> {
        self.transaction(|state| {
            let mut touched = 0;
            for bibcode in bibcodes {
                if let Some(record) = state.records.get_mut(bibcode) {
                    record.status = Some(status);
                    touched += 1;
                }
            }
            Ok(touched)
        })
        .await
    }

    async fn failed_bibcodes(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read(|state| {
                let mut failed = state
                    .records
                    .values()
                    .filter(|r| r.status.is_some_and(RecordStatus::is_failure))
                    .collect::<Vec<_>>();
                failed.sort_by_key(|r| r.id);
                failed
                    .into_iter()
                    .take(limit)
                    .map(|r| r.bibcode.clone())
                    .collect()
            })
            .await)
    }

    async fn updated_since(
        &self,
        since: DateTime<Utc>,
        force: bool,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read(|state| {
                let mut hits = state
                    .records
                    .values()
                    .filter(|r| r.updated >= since)
                    .filter(|r| force || r.processed.map_or(true, |p| p < r.updated))
                    .collect::<Vec<_>>();
                hits.sort_by_key(|r| (r.updated, r.id));
                hits.into_iter().map(|r| r.bibcode.clone()).collect()
            })
            .await)
    }

    async fn all_bibcodes(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read(|state| {
                let mut records = state.records.values().collect::<Vec<_>>();
                records.sort_by_key(|r| r.id);
                records.into_iter().map(|r| r.bibcode.clone()).collect()
            })
            .await)
    }

    async fn delete(&self, bibcode: &str, now: DateTime<Utc>) -> Result<Option<Record>, StoreError> {
        self.transaction(|state| {
            let Some(record) = state.records.remove(bibcode) else {
                return Ok(None);
            };
            let old_value = serde_json::to_string(&record)?;
            state.log(bibcode, ChangeLogEntry::DELETED, Some(old_value), false, now);
            Ok(Some(record))
        })
        .await
    }

    async fn rename(&self, old: &str, new: &str, now: DateTime<Utc>) -> Result<Record, StoreError> {
        check_rename(old, new)?;
        self.transaction(|state| {
            if state.records.contains_key(new) {
                return Err(StoreError::Contract(format!("{new} already exists")));
            }
            let mut record = state
                .records
                .remove(old)
                .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
            record.bibcode = new.to_string();
            record.updated = now;
            state.records.insert(new.to_string(), record.clone());
            compact_chain(&mut state.mappings, old, new)?;
            state.log(new, ChangeLogEntry::RENAMED, Some(old.to_string()), true, now);
            Ok(record)
        })
        .await
    }

    async fn resolve(&self, bibcode: &str) -> Result<Resolution, StoreError> {
        self.read(|state| follow_mappings(&state.mappings, bibcode)).await
    }

    async fn mappings(&self) -> Result<Vec<IdentifierMapping>, StoreError> {
        Ok(self
            .read(|state| {
                state
                    .mappings
                    .iter()
                    .map(|(key, target)| IdentifierMapping {
                        key: key.clone(),
                        target: target.clone(),
                    })
                    .collect()
            })
            .await)
    }

    async fn changelog(&self, key: &str) -> Result<Vec<ChangeLogEntry>, StoreError> {
        Ok(self
            .read(|state| {
                state
                    .changelog
                    .iter()
                    .filter(|entry| entry.key == key)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(|state| state.kv.get(key).cloned()).await)
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.transaction(|state| {
            state.kv.insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }
}

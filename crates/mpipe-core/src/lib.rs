//! Core record model, checksum gate, readiness rules and document merger.

pub mod checksum;
pub mod merge;
pub mod readiness;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use checksum::digest;
pub use merge::{DataIssue, DocumentMerger, MergeConfig, Merged};
pub use readiness::{evaluate, Readiness, SkipReason};

pub const CRATE_NAME: &str = "mpipe-core";

/// A candidate document as sent to a target. Keys are kept sorted.
pub type Document = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("unknown source slot: {0}")]
    UnknownSlot(String),
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("unknown record status: {0}")]
    UnknownStatus(String),
}

/// One upstream producer's contribution to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Slot {
    #[serde(rename = "bib_data", alias = "metadata")]
    BibData,
    #[serde(rename = "nonbib_data")]
    NonBibData,
    #[serde(rename = "orcid_claims")]
    OrcidClaims,
    #[serde(rename = "fulltext")]
    Fulltext,
    #[serde(rename = "metrics")]
    Metrics,
    #[serde(rename = "augments")]
    Augments,
}

impl Slot {
    pub const ALL: [Slot; 6] = [
        Slot::BibData,
        Slot::NonBibData,
        Slot::OrcidClaims,
        Slot::Fulltext,
        Slot::Metrics,
        Slot::Augments,
    ];

    /// Column name of the slot payload; the timestamp column is `{name}_updated`.
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::BibData => "bib_data",
            Slot::NonBibData => "nonbib_data",
            Slot::OrcidClaims => "orcid_claims",
            Slot::Fulltext => "fulltext",
            Slot::Metrics => "metrics",
            Slot::Augments => "augments",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bib_data" | "metadata" => Ok(Slot::BibData),
            "nonbib_data" => Ok(Slot::NonBibData),
            "orcid_claims" => Ok(Slot::OrcidClaims),
            "fulltext" => Ok(Slot::Fulltext),
            "metrics" => Ok(Slot::Metrics),
            "augments" => Ok(Slot::Augments),
            other => Err(DataError::UnknownSlot(other.to_string())),
        }
    }
}

/// A downstream system the pipeline publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Solr,
    Metrics,
    #[serde(rename = "datalinks")]
    Links,
}

impl Target {
    /// Dispatch order within one pipeline run.
    pub const ALL: [Target; 3] = [Target::Solr, Target::Metrics, Target::Links];

    pub fn as_str(self) -> &'static str {
        match self {
            Target::Solr => "solr",
            Target::Metrics => "metrics",
            Target::Links => "datalinks",
        }
    }

    pub fn failure_status(self) -> RecordStatus {
        match self {
            Target::Solr => RecordStatus::SolrFailed,
            Target::Metrics => RecordStatus::MetricsFailed,
            Target::Links => RecordStatus::LinksFailed,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "solr" => Ok(Target::Solr),
            "metrics" => Ok(Target::Metrics),
            "datalinks" | "links" => Ok(Target::Links),
            other => Err(DataError::UnknownTarget(other.to_string())),
        }
    }
}

/// Which targets a pipeline run should consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSet {
    pub solr: bool,
    pub metrics: bool,
    pub links: bool,
}

impl TargetSet {
    pub fn all() -> Self {
        Self {
            solr: true,
            metrics: true,
            links: true,
        }
    }

    pub fn none() -> Self {
        Self {
            solr: false,
            metrics: false,
            links: false,
        }
    }

    pub fn only(target: Target) -> Self {
        let mut set = Self::none();
        match target {
            Target::Solr => set.solr = true,
            Target::Metrics => set.metrics = true,
            Target::Links => set.links = true,
        }
        set
    }

    pub fn contains(&self, target: Target) -> bool {
        match target {
            Target::Solr => self.solr,
            Target::Metrics => self.metrics,
            Target::Links => self.links,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.solr || self.metrics || self.links)
    }

    pub fn iter(&self) -> impl Iterator<Item = Target> + '_ {
        Target::ALL.into_iter().filter(|t| self.contains(*t))
    }

    /// Parses the operator shorthand `s`/`m`/`l` (e.g. `"sml"`, `"s"`).
    pub fn from_letters(letters: &str) -> Self {
        let lower = letters.to_ascii_lowercase();
        Self {
            solr: lower.contains('s'),
            metrics: lower.contains('m'),
            links: lower.contains('l'),
        }
    }
}

impl Default for TargetSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Outcome of the most recent dispatch observed for a record, across all targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    Success,
    SolrFailed,
    MetricsFailed,
    LinksFailed,
    Retrying,
}

impl RecordStatus {
    pub const FAILURES: [RecordStatus; 3] = [
        RecordStatus::SolrFailed,
        RecordStatus::MetricsFailed,
        RecordStatus::LinksFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::SolrFailed => "solr-failed",
            RecordStatus::MetricsFailed => "metrics-failed",
            RecordStatus::LinksFailed => "links-failed",
            RecordStatus::Retrying => "retrying",
        }
    }

    pub fn is_failure(self) -> bool {
        Self::FAILURES.contains(&self)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RecordStatus::Success),
            "solr-failed" => Ok(RecordStatus::SolrFailed),
            "metrics-failed" => Ok(RecordStatus::MetricsFailed),
            "links-failed" => Ok(RecordStatus::LinksFailed),
            "retrying" => Ok(RecordStatus::Retrying),
            other => Err(DataError::UnknownStatus(other.to_string())),
        }
    }
}

/// Payload + last-write timestamp of one slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlotEntry {
    pub payload: Option<JsonValue>,
    pub updated: Option<DateTime<Utc>>,
}

impl SlotEntry {
    /// A slot counts as present once it has been written at least once.
    pub fn is_present(&self) -> bool {
        self.updated.is_some()
    }

    pub fn payload(&self) -> Option<&JsonValue> {
        self.payload.as_ref().filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Slots {
    pub bib_data: SlotEntry,
    pub nonbib_data: SlotEntry,
    pub orcid_claims: SlotEntry,
    pub fulltext: SlotEntry,
    pub metrics: SlotEntry,
    pub augments: SlotEntry,
}

/// Last successful delivery of a record to one target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryState {
    pub checksum: Option<String>,
    pub processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Deliveries {
    pub solr: DeliveryState,
    pub metrics: DeliveryState,
    pub links: DeliveryState,
}

/// Canonical stored record for one bibcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub bibcode: String,
    pub slots: Slots,
    pub delivery: Deliveries,
    pub status: Option<RecordStatus>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub processed: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(id: i64, bibcode: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            bibcode: bibcode.into(),
            slots: Slots::default(),
            delivery: Deliveries::default(),
            status: None,
            created: now,
            updated: now,
            processed: None,
        }
    }

    pub fn slot(&self, slot: Slot) -> &SlotEntry {
        match slot {
            Slot::BibData => &self.slots.bib_data,
            Slot::NonBibData => &self.slots.nonbib_data,
            Slot::OrcidClaims => &self.slots.orcid_claims,
            Slot::Fulltext => &self.slots.fulltext,
            Slot::Metrics => &self.slots.metrics,
            Slot::Augments => &self.slots.augments,
        }
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut SlotEntry {
        match slot {
            Slot::BibData => &mut self.slots.bib_data,
            Slot::NonBibData => &mut self.slots.nonbib_data,
            Slot::OrcidClaims => &mut self.slots.orcid_claims,
            Slot::Fulltext => &mut self.slots.fulltext,
            Slot::Metrics => &mut self.slots.metrics,
            Slot::Augments => &mut self.slots.augments,
        }
    }

    pub fn delivery(&self, target: Target) -> &DeliveryState {
        match target {
            Target::Solr => &self.delivery.solr,
            Target::Metrics => &self.delivery.metrics,
            Target::Links => &self.delivery.links,
        }
    }

    pub fn delivery_mut(&mut self, target: Target) -> &mut DeliveryState {
        match target {
            Target::Solr => &mut self.delivery.solr,
            Target::Metrics => &mut self.delivery.metrics,
            Target::Links => &mut self.delivery.links,
        }
    }

    /// Overwrites one slot and returns the payload it replaced.
    pub fn write_slot(
        &mut self,
        slot: Slot,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Option<JsonValue> {
        let entry = self.slot_mut(slot);
        let previous = entry.payload.replace(payload);
        entry.updated = Some(now);
        self.updated = now;
        previous
    }

    /// Successful delivery: stores the accepted checksum and stamps the target.
    pub fn mark_delivered(&mut self, target: Target, checksum: String, now: DateTime<Utc>) {
        let state = self.delivery_mut(target);
        state.checksum = Some(checksum);
        state.processed = Some(now);
        self.processed = Some(now);
        self.status = Some(RecordStatus::Success);
    }

    /// Terminal failure: checksum and timestamps stay untouched so a later pass retries.
    pub fn mark_failed(&mut self, target: Target) {
        self.status = Some(target.failure_status());
    }
}

/// Append-only history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub key: String,
    pub event: String,
    pub old_value: Option<String>,
    pub permanent: bool,
}

impl ChangeLogEntry {
    pub const DELETED: &'static str = "deleted";
    pub const RENAMED: &'static str = "renamed";
}

/// Directed edge from a retired bibcode to its current canonical bibcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    pub key: String,
    pub target: String,
}

/// Result of following mapping edges from a bibcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub requested: String,
    pub canonical: String,
    pub hops: Vec<IdentifierMapping>,
}

/// An upstream update, already classified at the transport boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slot", content = "payload")]
pub enum SourceUpdate {
    #[serde(rename = "bib_data", alias = "metadata")]
    BibData(JsonValue),
    #[serde(rename = "nonbib_data")]
    NonBibData(JsonValue),
    #[serde(rename = "orcid_claims")]
    OrcidClaims(JsonValue),
    #[serde(rename = "fulltext")]
    Fulltext(JsonValue),
    #[serde(rename = "metrics")]
    Metrics(JsonValue),
    #[serde(rename = "augments")]
    Augments(JsonValue),
}

impl SourceUpdate {
    /// Builds an update from a slot name, rejecting unknown names.
    pub fn named(slot: &str, payload: JsonValue) -> Result<Self, DataError> {
        Ok(Self::for_slot(slot.parse()?, payload))
    }

    pub fn for_slot(slot: Slot, payload: JsonValue) -> Self {
        match slot {
            Slot::BibData => SourceUpdate::BibData(payload),
            Slot::NonBibData => SourceUpdate::NonBibData(payload),
            Slot::OrcidClaims => SourceUpdate::OrcidClaims(payload),
            Slot::Fulltext => SourceUpdate::Fulltext(payload),
            Slot::Metrics => SourceUpdate::Metrics(payload),
            Slot::Augments => SourceUpdate::Augments(payload),
        }
    }

    pub fn slot(&self) -> Slot {
        match self {
            SourceUpdate::BibData(_) => Slot::BibData,
            SourceUpdate::NonBibData(_) => Slot::NonBibData,
            SourceUpdate::OrcidClaims(_) => Slot::OrcidClaims,
            SourceUpdate::Fulltext(_) => Slot::Fulltext,
            SourceUpdate::Metrics(_) => Slot::Metrics,
            SourceUpdate::Augments(_) => Slot::Augments,
        }
    }

    pub fn into_parts(self) -> (Slot, JsonValue) {
        let slot = self.slot();
        let payload = match self {
            SourceUpdate::BibData(v)
            | SourceUpdate::NonBibData(v)
            | SourceUpdate::OrcidClaims(v)
            | SourceUpdate::Fulltext(v)
            | SourceUpdate::Metrics(v)
            | SourceUpdate::Augments(v) => v,
        };
        (slot, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn slot_names_accept_metadata_alias_and_reject_unknown() {
        assert_eq!("metadata".parse::<Slot>().unwrap(), Slot::BibData);
        assert_eq!("augments".parse::<Slot>().unwrap(), Slot::Augments);
        assert_eq!(
            "citations".parse::<Slot>(),
            Err(DataError::UnknownSlot("citations".into()))
        );
        assert!(SourceUpdate::named("bogus", json!({})).is_err());
    }

    #[test]
    fn source_update_tags_round_trip_through_json() {
        let update: SourceUpdate =
            serde_json::from_value(json!({"slot": "metadata", "payload": {"title": ["x"]}}))
                .unwrap();
        assert_eq!(update.slot(), Slot::BibData);
        let (slot, payload) = update.into_parts();
        assert_eq!(slot, Slot::BibData);
        assert_eq!(payload, json!({"title": ["x"]}));
    }

    #[test]
    fn write_slot_returns_previous_payload_and_bumps_updated() {
        let mut record = Record::new(1, "2020A&A...1..1X", ts(1));
        assert_eq!(record.write_slot(Slot::Metrics, json!({"a": 1}), ts(2)), None);
        let previous = record.write_slot(Slot::Metrics, json!({"a": 2}), ts(3));
        assert_eq!(previous, Some(json!({"a": 1})));
        assert_eq!(record.slots.metrics.updated, Some(ts(3)));
        assert_eq!(record.updated, ts(3));
        assert!(record.slot(Slot::Metrics).is_present());
        assert!(!record.slot(Slot::BibData).is_present());
    }

    #[test]
    fn failure_leaves_delivery_state_untouched() {
        let mut record = Record::new(1, "b", ts(1));
        record.mark_delivered(Target::Solr, "0x00000001".into(), ts(2));
        record.mark_failed(Target::Solr);
        assert_eq!(record.delivery.solr.checksum.as_deref(), Some("0x00000001"));
        assert_eq!(record.delivery.solr.processed, Some(ts(2)));
        assert_eq!(record.status, Some(RecordStatus::SolrFailed));
    }

    #[test]
    fn target_letters_select_subsets() {
        let set = TargetSet::from_letters("sl");
        assert!(set.solr && set.links && !set.metrics);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Target::Solr, Target::Links]);
        assert!(TargetSet::from_letters("").is_empty());
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            RecordStatus::Success,
            RecordStatus::SolrFailed,
            RecordStatus::MetricsFailed,
            RecordStatus::LinksFailed,
            RecordStatus::Retrying,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!(RecordStatus::LinksFailed.is_failure());
        assert!(!RecordStatus::Retrying.is_failure());
    }
}

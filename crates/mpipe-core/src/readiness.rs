//! Decides, per target, whether a record has something worth publishing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::{Record, Slot, Target};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Skip(SkipReason),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Required slots that have never been written.
    MissingSlots(Vec<Slot>),
    /// Neither bib nor non-bib data carries link rows.
    NoLinkData,
    /// Nothing relevant changed since the target was last processed.
    Unchanged,
}

/// Slots that must be present before a first (non-forced) publish.
pub fn required_slots(target: Target) -> &'static [Slot] {
    match target {
        Target::Solr => &[Slot::BibData, Slot::NonBibData, Slot::OrcidClaims],
        Target::Metrics => &[Slot::Metrics],
        Target::Links => &[],
    }
}

/// Slots whose changes trigger a re-publish to the target.
pub fn relevant_slots(target: Target) -> &'static [Slot] {
    match target {
        Target::Solr => &Slot::ALL,
        Target::Metrics => &[Slot::Metrics],
        Target::Links => &[Slot::BibData, Slot::NonBibData],
    }
}

/// Evaluates one target. `force` skips the staleness check and relaxes the Solr
/// requirement to bib data alone; metrics and links still need their own data.
pub fn evaluate(record: &Record, target: Target, force: bool) -> Readiness {
    let required: &[Slot] = if force && target == Target::Solr {
        &[Slot::BibData]
    } else {
        required_slots(target)
    };

    let missing = required
        .iter()
        .copied()
        .filter(|slot| !record.slot(*slot).is_present())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Readiness::Skip(SkipReason::MissingSlots(missing));
    }

    if target == Target::Links && !has_link_data(record) {
        return Readiness::Skip(SkipReason::NoLinkData);
    }

    if force {
        return Readiness::Ready;
    }

    let processed = record
        .delivery(target)
        .processed
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let changed = relevant_slots(target)
        .iter()
        .filter_map(|slot| record.slot(*slot).updated)
        .any(|updated| updated >= processed);
    if changed {
        Readiness::Ready
    } else {
        Readiness::Skip(SkipReason::Unchanged)
    }
}

/// Evaluates every target in dispatch order.
pub fn evaluate_all(record: &Record, force: bool) -> Vec<(Target, Readiness)> {
    Target::ALL
        .into_iter()
        .map(|target| (target, evaluate(record, target, force)))
        .collect()
}

fn has_link_data(record: &Record) -> bool {
    let nonbib_rows = record
        .slot(Slot::NonBibData)
        .payload()
        .and_then(|p| p.get("data_links_rows"));
    let bib_links = record
        .slot(Slot::BibData)
        .payload()
        .and_then(|p| p.get("links_data"));
    nonbib_rows.is_some_and(non_empty) || bib_links.is_some_and(non_empty)
}

fn non_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
        _ => true,
    }
}

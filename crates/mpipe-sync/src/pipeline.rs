//! Readiness -> merge -> checksum gate -> dispatch -> state recording.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mpipe_core::checksum::{digest, unchanged};
use mpipe_core::{
    evaluate, Document, DocumentMerger, Readiness, Record, RecordStatus, Resolution,
    SourceUpdate, Target, TargetSet,
};
use mpipe_storage::RecordStore;
use mpipe_targets::{LinkResolver, MetricsStore, SearchIndex};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::dispatch::{self, Candidate, LinksSink, MetricsSink, Sink, SolrSink};
use crate::PipelineError;

const LAST_REINDEX_NORMAL: &str = "last.reindex.normal";
const LAST_REINDEX_FORCED: &str = "last.reindex.forced";

/// Downstream adapters; an absent target is skipped with a warning.
#[derive(Clone, Default)]
pub struct Targets {
    pub solr: Option<Arc<dyn SearchIndex>>,
    pub metrics: Option<Arc<dyn MetricsStore>>,
    pub links: Option<Arc<dyn LinkResolver>>,
}

impl Targets {
    fn sink(&self, target: Target, commit: bool) -> Option<Box<dyn Sink + '_>> {
        match target {
            Target::Solr => self
                .solr
                .as_deref()
                .map(|index| Box::new(SolrSink { index, commit }) as Box<dyn Sink + '_>),
            Target::Metrics => self
                .metrics
                .as_deref()
                .map(|store| Box::new(MetricsSink { store }) as Box<dyn Sink + '_>),
            Target::Links => self
                .links
                .as_deref()
                .map(|resolver| Box::new(LinksSink { resolver }) as Box<dyn Sink + '_>),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    pub targets: TargetSet,
    /// Skip the staleness check and relax Solr readiness to bib data alone.
    pub force: bool,
    pub ignore_checksums: bool,
    pub commit: bool,
    /// Persist checksums and status after dispatch.
    pub record_state: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            targets: TargetSet::all(),
            force: false,
            ignore_checksums: false,
            commit: false,
            record_state: true,
        }
    }
}

impl IndexOptions {
    /// Options used when resubmitting failed records.
    pub fn retry() -> Self {
        Self {
            force: true,
            ignore_checksums: true,
            commit: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub delivered: usize,
    pub failed: usize,
    pub not_ready: usize,
    pub unchanged_checksum: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub requested: usize,
    pub missing: Vec<String>,
    pub targets: BTreeMap<Target, TargetReport>,
    pub data_issues: usize,
}

impl IndexReport {
    pub fn delivered_total(&self) -> usize {
        self.targets.values().map(|t| t.delivered).sum()
    }

    pub fn failed_total(&self) -> usize {
        self.targets.values().map(|t| t.failed).sum()
    }

    pub fn target(&self, target: Target) -> TargetReport {
        self.targets.get(&target).cloned().unwrap_or_default()
    }

    fn absorb(&mut self, other: IndexReport) {
        self.requested += other.requested;
        self.missing.extend(other.missing);
        self.data_issues += other.data_issues;
        for (target, report) in other.targets {
            let entry = self.targets.entry(target).or_default();
            entry.delivered += report.delivered;
            entry.failed += report.failed;
            entry.not_ready += report.not_ready;
            entry.unchanged_checksum += report.unchanged_checksum;
        }
    }
}

/// Best-effort outcome of a delete fan-out. `None` means the target is not configured.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub bibcode: String,
    pub record: Option<Record>,
    pub search_index_deleted: Option<bool>,
    pub metrics_row_deleted: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ReindexOptions {
    /// Start of the window; defaults to the stamp left by the previous run.
    pub since: Option<DateTime<Utc>>,
    pub force: bool,
    pub batch_size: usize,
    pub targets: TargetSet,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            since: None,
            force: false,
            batch_size: 100,
            targets: TargetSet::all(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReindexReport {
    pub since: DateTime<Utc>,
    pub batches: usize,
    pub index: IndexReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetDiagnostics {
    pub target: Target,
    pub readiness: Readiness,
    pub stored_checksum: Option<String>,
    pub candidate_checksum: String,
    pub document: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub resolution: Resolution,
    pub record: Option<Record>,
    pub targets: Vec<TargetDiagnostics>,
}

pub struct IndexPipeline {
    store: Arc<dyn RecordStore>,
    merger: DocumentMerger,
    targets: Targets,
}

impl IndexPipeline {
    pub fn new(store: Arc<dyn RecordStore>, merger: DocumentMerger) -> Self {
        Self {
            store,
            merger,
            targets: Targets::default(),
        }
    }

    pub fn with_targets(mut self, targets: Targets) -> Self {
        self.targets = targets;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn merger(&self) -> &DocumentMerger {
        &self.merger
    }

    pub async fn ingest(&self, bibcode: &str, update: SourceUpdate) -> Result<Record, PipelineError> {
        let slot = update.slot();
        let record = self.store.apply_update(bibcode, update, Utc::now()).await?;
        debug!(bibcode, %slot, "slot written");
        Ok(record)
    }

    /// Ingest by slot name; unknown names are a data error.
    pub async fn write_named(
        &self,
        bibcode: &str,
        slot: &str,
        payload: JsonValue,
    ) -> Result<Record, PipelineError> {
        self.ingest(bibcode, SourceUpdate::named(slot, payload)?).await
    }

    pub async fn index_records(
        &self,
        bibcodes: &[String],
        options: IndexOptions,
    ) -> Result<IndexReport, PipelineError> {
        self.index_with(&self.targets, bibcodes, options)
            .instrument(info_span!("index_records", batch = bibcodes.len()))
            .await
    }

    async fn index_with(
        &self,
        targets: &Targets,
        bibcodes: &[String],
        options: IndexOptions,
    ) -> Result<IndexReport, PipelineError> {
        if options.targets.is_empty() {
            return Err(PipelineError::NoTargets);
        }

        let records = self.store.get_many(bibcodes).await?;
        let found = records
            .iter()
            .map(|r| r.bibcode.as_str())
            .collect::<BTreeSet<_>>();
        let missing = bibcodes
            .iter()
            .filter(|b| !found.contains(b.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        for bibcode in &missing {
            warn!(bibcode = %bibcode, "record not found; skipping");
        }

        let mut report = IndexReport {
            requested: bibcodes.len(),
            missing,
            ..IndexReport::default()
        };

        for target in options.targets.iter() {
            let Some(sink) = targets.sink(target, options.commit) else {
                warn!(%target, "target selected but not configured; skipping");
                continue;
            };
            let mut target_report = TargetReport::default();
            let candidates =
                self.candidates(&records, target, options, &mut target_report, &mut report);

            let outcomes = dispatch::deliver(sink.as_ref(), &candidates)
                .instrument(info_span!("deliver", %target, batch = candidates.len()))
                .await;
            target_report.delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
            target_report.failed = outcomes.len() - target_report.delivered;

            if options.record_state && !outcomes.is_empty() {
                self.store.record_outcomes(&outcomes, Utc::now()).await?;
            }
            report.targets.insert(target, target_report);
        }

        Ok(report)
    }

    fn candidates(
        &self,
        records: &[Record],
        target: Target,
        options: IndexOptions,
        target_report: &mut TargetReport,
        report: &mut IndexReport,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for record in records {
            let bibcode = record.bibcode.as_str();
            if let Readiness::Skip(reason) = evaluate(record, target, options.force) {
                debug!(bibcode, %target, ?reason, "not ready");
                target_report.not_ready += 1;
                continue;
            }

            let merged = self.merger.candidate(record, target);
            for issue in &merged.issues {
                warn!(bibcode, field = issue.field, detail = %issue.detail, "skipped malformed value");
            }
            report.data_issues += merged.issues.len();

            if target == Target::Links && !has_link_rows(&merged.document) {
                debug!(bibcode, "no link rows after merge");
                target_report.not_ready += 1;
                continue;
            }

            let checksum = digest(&merged.document);
            let stored = record.delivery(target).checksum.as_deref();
            if !options.ignore_checksums && unchanged(stored, &checksum) {
                debug!(bibcode, %target, %checksum, "checksum unchanged");
                target_report.unchanged_checksum += 1;
                continue;
            }

            candidates.push(Candidate {
                bibcode: record.bibcode.clone(),
                document: merged.document,
                checksum,
            });
        }
        candidates
    }

    /// Resubmits records whose status is a failure marker.
    pub async fn reconcile(&self, batch_size: usize) -> Result<IndexReport, PipelineError> {
        let failed = self.store.failed_bibcodes(batch_size).await?;
        if failed.is_empty() {
            info!("no failed records to reconcile");
            return Ok(IndexReport::default());
        }

        self.store.set_status(&failed, RecordStatus::Retrying).await?;
        info!(records = failed.len(), "reconciling failed records");
        let report = self
            .index_records(&failed, IndexOptions::retry())
            .instrument(info_span!("reconcile", records = failed.len()))
            .await?;
        if report.delivered_total() == 0 {
            return Err(PipelineError::BatchExhausted {
                attempted: failed.len(),
            });
        }
        Ok(report)
    }

    /// Removes the record, then deletes downstream regardless of whether it existed.
    pub async fn delete(&self, bibcode: &str) -> Result<DeleteReport, PipelineError> {
        let record = self.store.delete(bibcode, Utc::now()).await?;
        if record.is_none() {
            warn!(bibcode, "delete requested for unknown record");
        }

        let search_index_deleted = match &self.targets.solr {
            Some(index) => Some(match index.delete(bibcode).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(bibcode, error = %err, "solr delete failed");
                    false
                }
            }),
            None => None,
        };
        let metrics_row_deleted = match &self.targets.metrics {
            Some(store) => Some(match store.delete(bibcode).await {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(bibcode, error = %err, "metrics delete failed");
                    false
                }
            }),
            None => None,
        };

        info!(bibcode, deleted = record.is_some(), "delete fan-out finished");
        Ok(DeleteReport {
            bibcode: bibcode.to_string(),
            record,
            search_index_deleted,
            metrics_row_deleted,
        })
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<Record, PipelineError> {
        let record = self.store.rename(old, new, Utc::now()).await?;
        info!(old, new, "record renamed");
        Ok(record)
    }

    pub async fn resolve(&self, bibcode: &str) -> Result<Resolution, PipelineError> {
        Ok(self.store.resolve(bibcode).await?)
    }

    /// Reindexes records updated since the last run and advances the stored stamp.
    /// The previous stamp is restored when any batch fails.
    pub async fn reindex_since(
        &self,
        options: ReindexOptions,
    ) -> Result<ReindexReport, PipelineError> {
        let key = if options.force {
            LAST_REINDEX_FORCED
        } else {
            LAST_REINDEX_NORMAL
        };
        let previous = self.store.kv_get(key).await?;
        let since = match options.since {
            Some(since) => since,
            None => parse_stamp(key, previous.as_deref())?,
        };

        let started = Utc::now();
        self.store.kv_set(key, &started.to_rfc3339()).await?;

        match self.reindex_window(since, &options).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(key, error = %err, "reindex failed; restoring previous stamp");
                self.store
                    .kv_set(key, previous.as_deref().unwrap_or_default())
                    .await?;
                Err(err)
            }
        }
    }

    async fn reindex_window(
        &self,
        since: DateTime<Utc>,
        options: &ReindexOptions,
    ) -> Result<ReindexReport, PipelineError> {
        let bibcodes = self.store.updated_since(since, options.force).await?;
        info!(%since, records = bibcodes.len(), force = options.force, "reindexing");

        let index_options = IndexOptions {
            targets: options.targets,
            force: options.force,
            ignore_checksums: options.force,
            commit: true,
            record_state: true,
        };
        let mut report = ReindexReport {
            since,
            batches: 0,
            index: IndexReport::default(),
        };
        for chunk in bibcodes.chunks(options.batch_size.max(1)) {
            let batch = self.index_records(chunk, index_options).await?;
            report.index.absorb(batch);
            report.batches += 1;
        }
        Ok(report)
    }

    /// Re-sends every record to another Solr collection without touching stored state.
    pub async fn rebuild_collection(
        &self,
        index: Arc<dyn SearchIndex>,
        batch_size: usize,
    ) -> Result<IndexReport, PipelineError> {
        let targets = Targets {
            solr: Some(index),
            ..Targets::default()
        };
        let bibcodes = self.store.all_bibcodes().await?;
        let chunks = bibcodes.chunks(batch_size.max(1)).collect::<Vec<_>>();
        let mut report = IndexReport::default();
        for (n, chunk) in chunks.iter().enumerate() {
            let options = IndexOptions {
                targets: TargetSet::only(Target::Solr),
                force: true,
                ignore_checksums: true,
                commit: n + 1 == chunks.len(),
                record_state: false,
            };
            let batch = self
                .index_with(&targets, chunk, options)
                .instrument(info_span!("rebuild_collection", batch = n))
                .await?;
            report.absorb(batch);
        }
        info!(
            records = bibcodes.len(),
            delivered = report.delivered_total(),
            "collection rebuild finished"
        );
        Ok(report)
    }

    /// The stored record behind `bibcode` (after mapping) and what each target would receive.
    pub async fn diagnostics(&self, bibcode: &str) -> Result<Diagnostics, PipelineError> {
        let resolution = self.store.resolve(bibcode).await?;
        let record = self.store.get(&resolution.canonical).await?;
        let targets = record
            .iter()
            .flat_map(|record| {
                Target::ALL.into_iter().map(move |target| {
                    let merged = self.merger.candidate(record, target);
                    TargetDiagnostics {
                        target,
                        readiness: evaluate(record, target, false),
                        stored_checksum: record.delivery(target).checksum.clone(),
                        candidate_checksum: digest(&merged.document),
                        document: merged.document,
                    }
                })
            })
            .collect();
        Ok(Diagnostics {
            resolution,
            record,
            targets,
        })
    }
}

fn has_link_rows(document: &Document) -> bool {
    document
        .get("data_links_rows")
        .and_then(JsonValue::as_array)
        .is_some_and(|rows| !rows.is_empty())
}

fn parse_stamp(key: &str, value: Option<&str>) -> Result<DateTime<Utc>, PipelineError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(DateTime::<Utc>::UNIX_EPOCH),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| PipelineError::InvalidStamp {
                key: key.to_string(),
                value: raw.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mpipe_core::MergeConfig;
    use mpipe_storage::MemoryRecordStore;
    use serde_json::json;

    fn pipeline() -> IndexPipeline {
        IndexPipeline::new(
            Arc::new(MemoryRecordStore::new()),
            DocumentMerger::new(MergeConfig::default()),
        )
    }

    #[test]
    fn empty_stamp_means_the_epoch() {
        assert_eq!(parse_stamp("k", None).unwrap(), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(parse_stamp("k", Some("")).unwrap(), DateTime::<Utc>::UNIX_EPOCH);
        let stamp = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().unwrap();
        assert_eq!(parse_stamp("k", Some(&stamp.to_rfc3339())).unwrap(), stamp);
        assert!(matches!(
            parse_stamp("k", Some("yesterday")),
            Err(PipelineError::InvalidStamp { .. })
        ));
    }

    #[test]
    fn reports_accumulate_per_target() {
        let mut total = IndexReport::default();
        for delivered in [2, 3] {
            let mut batch = IndexReport {
                requested: 4,
                ..IndexReport::default()
            };
            batch.targets.insert(
                Target::Solr,
                TargetReport {
                    delivered,
                    failed: 1,
                    ..TargetReport::default()
                },
            );
            total.absorb(batch);
        }
        assert_eq!(total.requested, 8);
        assert_eq!(total.target(Target::Solr).delivered, 5);
        assert_eq!(total.failed_total(), 2);
        assert_eq!(total.target(Target::Links), TargetReport::default());
    }

    #[tokio::test]
    async fn unknown_slot_names_are_rejected() {
        let err = pipeline()
            .write_named("2020X", "citations", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Data(_)));
    }

    #[tokio::test]
    async fn empty_target_selection_is_a_contract_error() {
        let options = IndexOptions {
            targets: TargetSet::none(),
            ..IndexOptions::default()
        };
        let err = pipeline()
            .index_records(&["2020X".to_string()], options)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoTargets));
    }

    #[tokio::test]
    async fn unconfigured_targets_are_skipped() {
        let pipeline = pipeline();
        pipeline
            .ingest("2020X", SourceUpdate::BibData(json!({"title": ["t"]})))
            .await
            .expect("ingest");
        let report = pipeline
            .index_records(&["2020X".to_string(), "missing".to_string()], IndexOptions::default())
            .await
            .expect("report");
        assert!(report.targets.is_empty());
        assert_eq!(report.missing, vec!["missing".to_string()]);
    }

    #[tokio::test]
    async fn diagnostics_follow_mappings() {
        let pipeline = pipeline();
        pipeline
            .ingest("old", SourceUpdate::BibData(json!({"title": ["t"]})))
            .await
            .expect("ingest");
        pipeline.rename("old", "new").await.expect("rename");

        let diag = pipeline.diagnostics("old").await.expect("diagnostics");
        assert_eq!(diag.resolution.canonical, "new");
        assert_eq!(diag.record.as_ref().map(|r| r.bibcode.as_str()), Some("new"));
        assert_eq!(diag.targets.len(), 3);
        assert!(!diag.targets[0].readiness.is_ready());
    }
}

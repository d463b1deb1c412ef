//! Batch-then-individual delivery to one target.

use std::slice;

use async_trait::async_trait;
use mpipe_core::{Document, Target};
use mpipe_storage::DeliveryOutcome;
use mpipe_targets::{LinkResolver, MetricsRow, MetricsStore, SearchIndex, TargetError};
use tracing::{error, info, warn};

/// A merged document that passed the checksum gate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub bibcode: String,
    pub document: Document,
    pub checksum: String,
}

/// Uniform sending surface over the three target adapters.
#[async_trait]
pub(crate) trait Sink: Send + Sync {
    fn target(&self) -> Target;

    async fn send(&self, documents: &[Document]) -> Result<(), TargetError>;

    /// Field dropped on a last individual attempt when the failure names it.
    fn strippable_field(&self) -> Option<&'static str> {
        None
    }
}

pub(crate) struct SolrSink<'a> {
    pub index: &'a dyn SearchIndex,
    pub commit: bool,
}

#[async_trait]
impl Sink for SolrSink<'_> {
    fn target(&self) -> Target {
        Target::Solr
    }

    async fn send(&self, documents: &[Document]) -> Result<(), TargetError> {
        self.index.submit(documents, self.commit).await
    }

    fn strippable_field(&self) -> Option<&'static str> {
        Some("body")
    }
}

pub(crate) struct MetricsSink<'a> {
    pub store: &'a dyn MetricsStore,
}

#[async_trait]
impl Sink for MetricsSink<'_> {
    fn target(&self) -> Target {
        Target::Metrics
    }

    async fn send(&self, documents: &[Document]) -> Result<(), TargetError> {
        let rows = documents
            .iter()
            .map(MetricsRow::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        self.store.upsert(&rows).await
    }
}

pub(crate) struct LinksSink<'a> {
    pub resolver: &'a dyn LinkResolver,
}

#[async_trait]
impl Sink for LinksSink<'_> {
    fn target(&self) -> Target {
        Target::Links
    }

    async fn send(&self, documents: &[Document]) -> Result<(), TargetError> {
        self.resolver.update(documents).await
    }
}

/// Sends the whole batch; on rejection falls back to one call per candidate.
/// Returns exactly one outcome per candidate.
pub(crate) async fn deliver(sink: &dyn Sink, candidates: &[Candidate]) -> Vec<DeliveryOutcome> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let target = sink.target();
    let documents = candidates
        .iter()
        .map(|c| c.document.clone())
        .collect::<Vec<_>>();

    match sink.send(&documents).await {
        Ok(()) => {
            info!(%target, documents = candidates.len(), "batch delivered");
            return candidates
                .iter()
                .map(|c| DeliveryOutcome::delivered(&c.bibcode, target, &c.checksum))
                .collect();
        }
        Err(err) => {
            warn!(%target, documents = candidates.len(), error = %err, "batch rejected, retrying one by one");
        }
    }

    let mut outcomes = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        outcomes.push(deliver_one(sink, candidate).await);
    }
    outcomes
}

async fn deliver_one(sink: &dyn Sink, candidate: &Candidate) -> DeliveryOutcome {
    let target = sink.target();
    let bibcode = candidate.bibcode.as_str();
    let err = match sink.send(slice::from_ref(&candidate.document)).await {
        Ok(()) => return DeliveryOutcome::delivered(bibcode, target, &candidate.checksum),
        Err(err) => err,
    };

    let culprit = sink
        .strippable_field()
        .filter(|field| err.mentions_field(field) && candidate.document.contains_key(*field));
    if let Some(field) = culprit {
        let mut stripped = candidate.document.clone();
        stripped.remove(field);
        match sink.send(slice::from_ref(&stripped)).await {
            Ok(()) => {
                warn!(bibcode, %target, field, "delivered without oversized field");
                // The stored checksum still describes the unstripped document.
                return DeliveryOutcome::delivered(bibcode, target, &candidate.checksum);
            }
            Err(retry_err) => {
                error!(bibcode, %target, field, error = %retry_err, "delivery failed after stripping field");
                return DeliveryOutcome::failed(bibcode, target);
            }
        }
    }

    error!(bibcode, %target, error = %err, "delivery failed");
    DeliveryOutcome::failed(bibcode, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Rejects any call containing one of `poisoned`, recording every call.
    struct ScriptedSink {
        poisoned: Vec<&'static str>,
        reject_field: Option<&'static str>,
        unavailable_at: Option<&'static str>,
        calls: Mutex<Vec<Vec<Document>>>,
    }

    impl ScriptedSink {
        fn new(poisoned: &[&'static str]) -> Self {
            Self {
                poisoned: poisoned.to_vec(),
                reject_field: None,
                unavailable_at: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        fn target(&self) -> Target {
            Target::Solr
        }

        async fn send(&self, documents: &[Document]) -> Result<(), TargetError> {
            self.calls.lock().unwrap().push(documents.to_vec());
            if let Some(url) = self.unavailable_at {
                return Err(TargetError::Status {
                    target: Target::Solr,
                    url: url.into(),
                    status: 503,
                    body: "Service Unavailable".into(),
                });
            }
            if let Some(field) = self.reject_field {
                if documents.iter().any(|d| d.contains_key(field)) {
                    return Err(TargetError::Rejected {
                        target: Target::Solr,
                        detail: format!("immense term in field={field}"),
                    });
                }
            }
            let bad = documents.iter().any(|d| {
                d.get("bibcode")
                    .and_then(|b| b.as_str())
                    .is_some_and(|b| self.poisoned.contains(&b))
            });
            if bad {
                return Err(TargetError::Rejected {
                    target: Target::Solr,
                    detail: "poisoned".into(),
                });
            }
            Ok(())
        }

        fn strippable_field(&self) -> Option<&'static str> {
            Some("body")
        }
    }

    fn candidate(bibcode: &str, extra: serde_json::Value) -> Candidate {
        let mut document = Document::new();
        document.insert("bibcode".into(), json!(bibcode));
        if let serde_json::Value::Object(map) = extra {
            document.extend(map);
        }
        Candidate {
            bibcode: bibcode.into(),
            document,
            checksum: format!("sum-{bibcode}"),
        }
    }

    #[tokio::test]
    async fn accepted_batch_is_a_single_call() {
        let sink = ScriptedSink::new(&[]);
        let outcomes = deliver(&sink, &[candidate("a", json!({})), candidate("b", json!({}))]).await;
        assert!(outcomes.iter().all(DeliveryOutcome::is_delivered));
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_batch_isolates_the_bad_document() {
        let sink = ScriptedSink::new(&["b"]);
        let outcomes = deliver(&sink, &[candidate("a", json!({})), candidate("b", json!({}))]).await;
        assert_eq!(
            outcomes,
            vec![
                DeliveryOutcome::delivered("a", Target::Solr, "sum-a"),
                DeliveryOutcome::failed("b", Target::Solr),
            ]
        );
        assert_eq!(sink.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn body_is_stripped_only_when_named() {
        let mut sink = ScriptedSink::new(&[]);
        sink.reject_field = Some("body");
        let outcomes = deliver(&sink, &[candidate("a", json!({"body": "huge"}))]).await;
        assert_eq!(outcomes, vec![DeliveryOutcome::delivered("a", Target::Solr, "sum-a")]);

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(!calls[2][0].contains_key("body"));
    }

    #[tokio::test]
    async fn outage_at_a_body_named_host_keeps_the_body() {
        let mut sink = ScriptedSink::new(&[]);
        sink.unavailable_at = Some("http://somebody-solr:8983/solr/collection1/update");
        let outcomes = deliver(&sink, &[candidate("a", json!({"body": "text"}))]).await;
        assert_eq!(outcomes, vec![DeliveryOutcome::failed("a", Target::Solr)]);

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call[0].contains_key("body")));
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let sink = ScriptedSink::new(&[]);
        assert!(deliver(&sink, &[]).await.is_empty());
        assert!(sink.calls.lock().unwrap().is_empty());
    }
}

use async_trait::async_trait;
use mpipe_core::{Document, Target};
use mpipe_storage::HttpClientConfig;
use reqwest::{StatusCode, Url};
use serde_json::json;
use tracing::{debug, warn};

use crate::{SearchIndex, TargetError};

/// Solr update handler reachable at one or more endpoints (replicas or collections).
#[derive(Debug, Clone)]
pub struct SolrIndex {
    client: reqwest::Client,
    update_urls: Vec<String>,
}

impl SolrIndex {
    pub fn new(http: &HttpClientConfig, update_urls: Vec<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            update_urls,
        })
    }

    pub fn with_client(client: reqwest::Client, update_urls: Vec<String>) -> Self {
        Self {
            client,
            update_urls,
        }
    }

    pub fn update_urls(&self) -> &[String] {
        &self.update_urls
    }

    /// Same client, every endpoint pointed at another collection.
    pub fn for_collection(&self, collection: &str) -> Result<Self, TargetError> {
        let update_urls = self
            .update_urls
            .iter()
            .map(|url| rewrite_collection(url, collection))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            client: self.client.clone(),
            update_urls,
        })
    }

    async fn post_all(&self, body: &serde_json::Value, commit: bool) -> Result<(), TargetError> {
        let mut first_error = None;
        for url in &self.update_urls {
            let mut request = self.client.post(url).json(body);
            if commit {
                request = request.query(&[("commit", "true")]);
            }
            let outcome = match request.send().await {
                Ok(resp) if resp.status() == StatusCode::OK => Ok(()),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    Err(TargetError::Status {
                        target: Target::Solr,
                        url: url.clone(),
                        status,
                        body,
                    })
                }
                Err(source) => Err(TargetError::Transport {
                    target: Target::Solr,
                    url: url.clone(),
                    source,
                }),
            };
            if let Err(err) = outcome {
                warn!(url = %url, error = %err, "solr endpoint rejected update");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SearchIndex for SolrIndex {
    async fn submit(&self, documents: &[Document], commit: bool) -> Result<(), TargetError> {
        debug!(documents = documents.len(), commit, "posting to solr");
        self.post_all(&json!(documents), commit).await
    }

    async fn delete(&self, bibcode: &str) -> Result<(), TargetError> {
        let query = format!("bibcode:\"{bibcode}\"");
        self.post_all(&json!({"delete": {"query": query}}), true).await
    }
}

/// Replaces the collection segment (the one before the handler) of a Solr URL.
///
/// `http://host/solr/collection1/update` -> `http://host/solr/{collection}/update`
pub fn rewrite_collection(url: &str, collection: &str) -> Result<String, TargetError> {
    let invalid = |detail: &str| TargetError::InvalidUrl {
        url: url.to_string(),
        detail: detail.to_string(),
    };
    let mut parsed = Url::parse(url).map_err(|err| invalid(&err.to_string()))?;
    let mut segments = parsed
        .path_segments()
        .map(|s| s.map(str::to_string).collect::<Vec<_>>())
        .ok_or_else(|| invalid("url has no path"))?;
    if segments.len() < 2 {
        return Err(invalid("url has no collection segment"));
    }
    let idx = segments.len() - 2;
    segments[idx] = collection.to_string();
    parsed.set_path(&segments.join("/"));
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_rewrite_targets_second_to_last_segment() {
        assert_eq!(
            rewrite_collection("http://solr:8983/solr/collection1/update", "rebuild").unwrap(),
            "http://solr:8983/solr/rebuild/update"
        );
        assert_eq!(
            rewrite_collection("http://solr/solr/c1/update?wt=json", "c2").unwrap(),
            "http://solr/solr/c2/update?wt=json"
        );
        assert!(rewrite_collection("http://solr/update", "c2").is_err());
        assert!(matches!(
            rewrite_collection("not a url", "c2"),
            Err(TargetError::InvalidUrl { .. })
        ));
    }
}

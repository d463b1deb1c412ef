use async_trait::async_trait;
use mpipe_core::{Document, Target};
use mpipe_storage::HttpClientConfig;
use reqwest::StatusCode;
use tracing::debug;

use crate::{LinkResolver, TargetError};

/// Link-resolver update endpoint authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpLinkResolver {
    client: reqwest::Client,
    update_url: String,
    token: String,
}

impl HttpLinkResolver {
    pub fn new(
        http: &HttpClientConfig,
        update_url: impl Into<String>,
        token: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            update_url: update_url.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl LinkResolver for HttpLinkResolver {
    async fn update(&self, documents: &[Document]) -> Result<(), TargetError> {
        debug!(documents = documents.len(), "putting link rows");
        let resp = self
            .client
            .put(&self.update_url)
            .bearer_auth(&self.token)
            .json(documents)
            .send()
            .await
            .map_err(|source| TargetError::Transport {
                target: Target::Links,
                url: self.update_url.clone(),
                source,
            })?;
        if resp.status() == StatusCode::OK {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(TargetError::Status {
            target: Target::Links,
            url: self.update_url.clone(),
            status,
            body,
        })
    }
}

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::Story,
    error::{ApiError, ApiException},
    protocol::{StatusResponse, StoryDraft, StoryList},
};
use tracing::debug;
use url::Url;

use crate::RemoteStore;

/// REST client for the story server.
pub struct HttpRemoteStore {
    http: Client,
    base_url: Url,
}

impl HttpRemoteStore {
    pub fn new(server_url: &str) -> Result<Self> {
        let mut base_url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        // Url::join drops the last path segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("failed to build url for {path}"))
    }

    /// Creates a story on the server. The board learns about it through the
    /// server's `added` push, not through this return value.
    pub async fn create_story(&self, draft: &StoryDraft) -> Result<Story> {
        let url = self.endpoint("api/story")?;
        let res = self.http.post(url).json(draft).send().await?;
        let body: StatusResponse = ensure_success(res).await?.json().await?;
        body.data
            .ok_or_else(|| anyhow!("server accepted story but returned no data"))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_all(&self) -> Result<StoryList> {
        let url = self.endpoint("api/story")?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .context("failed to fetch stories")?;
        let list: StoryList = ensure_success(res).await?.json().await?;
        debug!(stories = list.stories.len(), "fetched story snapshot");
        Ok(list)
    }

    async fn delete_story(&self, story: &Story) -> Result<()> {
        let url = self.endpoint(&format!("api/story/{}", story.id))?;
        let res = self
            .http
            .delete(url)
            .send()
            .await
            .with_context(|| format!("failed to delete story {}", story.id))?;
        ensure_success(res).await?;
        Ok(())
    }
}

/// Turns a non-2xx response into an error, preferring the server's
/// structured [`ApiError`] body when it has one.
async fn ensure_success(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow::Error::new(ApiException::from(api_error))
            .context(format!("server responded {status}"))),
        Err(_) => Err(anyhow!("server responded {status}: {body}")),
    }
}

// Full-fetch access to a remote store over HTTP.
//
// Endpoints, relative to the configured base URL:
//   GET events/{event_id}/participants -> [Participant]
//   GET events/{event_id}/allocations  -> [Allocation]
//   GET events/{event_id}/slots        -> [Slot]

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use sweepdraw_core::model::{Slot, Snapshot, StreamKind};
use sweepdraw_core::transport::Fetcher;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpStore {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, event_id: &str, resource: &str) -> String {
        format!("{}/events/{event_id}/{resource}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("GET {url}");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("store rejected {url}"))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("invalid response body from {url}"))
    }
}

#[async_trait]
impl Fetcher for HttpStore {
    async fn fetch_all(&self, stream: StreamKind, event_id: &str) -> Result<Snapshot> {
        let url = self.endpoint(event_id, stream.as_str());
        Ok(match stream {
            StreamKind::Participants => Snapshot::Participants(self.get_json(&url).await?),
            StreamKind::Allocations => Snapshot::Allocations(self.get_json(&url).await?),
        })
    }

    async fn fetch_slots(&self, event_id: &str) -> Result<Vec<Slot>> {
        self.get_json(&self.endpoint(event_id, "slots")).await
    }
}

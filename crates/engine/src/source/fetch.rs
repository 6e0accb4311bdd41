use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stepwise_types::FetchRequest;
use stepwise_util::{FetchError, HttpJsonClient};

/// Performs the network side of a cache miss.
#[async_trait]
pub trait JsonFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<Value>;
}

/// Default fetcher backed by `reqwest` with strict JSON parsing.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: HttpJsonClient,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            client: HttpJsonClient::new(timeout)?,
        })
    }
}

#[async_trait]
impl JsonFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<Value> {
        Ok(self.client.fetch_json(request).await?)
    }
}

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::StrategyConfig;
use crate::error::{Classify, FailureKind, RecoveryError, RecoveryResult};

/// Whether a PAC source names a remote URL that can be re-downloaded
pub fn is_remote_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Response data of a completed request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status_code: u16,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code: status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status_code
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as UTF-8, falling back to Latin-1 so any byte sequence yields text
    pub fn text(self) -> String {
        match String::from_utf8(self.body) {
            Ok(text) => text,
            Err(err) => err.into_bytes().iter().map(|&b| char::from(b)).collect(),
        }
    }

    /// Check if successful (2xx status)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Trait for HTTP GET requests, allowing PAC downloads to be mocked
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, headers: &HashMap<String, String>) -> RecoveryResult<HttpResponse>;
}

/// Implementation of HttpClient using reqwest
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> RecoveryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RecoveryError::Config {
                reason: format!("failed to build HTTP client: {}", err),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, headers: &HashMap<String, String>) -> RecoveryResult<HttpResponse> {
        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| RecoveryError::fetch(url, err.failure_kind(), &err))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| RecoveryError::fetch(url, err.failure_kind(), &err))?;

        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

/// Downloads PAC scripts
#[derive(Clone)]
pub struct PacFetcher {
    client: Arc<dyn HttpClient>,
    user_agent: String,
}

impl PacFetcher {
    pub fn new(client: Arc<dyn HttpClient>, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }

    /// Fetcher backed by reqwest with the configured timeout and user agent
    pub fn from_config(config: &StrategyConfig) -> RecoveryResult<Self> {
        let client = ReqwestHttpClient::new(config.pac_fetch_timeout())?;
        Ok(Self::new(Arc::new(client), config.user_agent.clone()))
    }

    /// Download the PAC body at `url`; non-2xx statuses fail with [`FailureKind::Http`]
    pub async fn fetch(&self, url: &str) -> RecoveryResult<String> {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), self.user_agent.clone());

        let response = self.client.get(url, &headers).await?;
        if !response.is_success() {
            return Err(RecoveryError::fetch(
                url,
                FailureKind::Http,
                format!("HTTP status {}", response.status()),
            ));
        }

        let content = response.text();
        debug!(url, bytes = content.len(), "Downloaded PAC file");
        Ok(content)
    }
}

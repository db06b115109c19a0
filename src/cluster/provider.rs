//! Per-node provider client: a uniform async interface over whatever
//! concrete OpenAI-compatible backend a node happens to be.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::TryStreamExt;
use serde_json::Value;
use std::pin::Pin;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("upstream {url} returned {status}: {body}")]
    UpstreamStatus { url: String, status: u16, body: String },
    #[error("connection to {url} failed: {source}")]
    Connect { url: String, source: reqwest::Error },
    #[error("failed to parse response from {url}: {source}")]
    Parse { url: String, source: reqwest::Error },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Uniform call site for per-backend chat completion clients (§9's
/// "per-node polymorphic provider client").
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn base_url(&self) -> &str;

    /// Non-streaming chat completion; returns the raw OpenAI JSON body.
    async fn chat(&self, request: &Value) -> Result<Value, ProviderError>;

    /// Streaming chat completion; yields raw SSE byte chunks for the
    /// translator to parse.
    async fn chat_stream(&self, request: &Value) -> Result<ChatStream, ProviderError>;
}

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("failed to build provider HTTP client"),
            base_url: base_url.into(),
            request_timeout,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat(&self, request: &Value) -> Result<Value, ProviderError> {
        let url = self.completions_url();
        let response = tokio::time::timeout(self.request_timeout, self.client.post(&url).json(request).send())
            .await
            .map_err(|_| ProviderError::Timeout { url: url.clone() })?
            .map_err(|e| ProviderError::Connect { url: url.clone(), source: e })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamStatus { url, status: status.as_u16(), body });
        }

        response.json().await.map_err(|e| ProviderError::Parse { url, source: e })
    }

    async fn chat_stream(&self, request: &Value) -> Result<ChatStream, ProviderError> {
        let url = self.completions_url();
        let response = tokio::time::timeout(self.request_timeout, self.client.post(&url).json(request).send())
            .await
            .map_err(|_| ProviderError::Timeout { url: url.clone() })?
            .map_err(|e| ProviderError::Connect { url: url.clone(), source: e })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamStatus { url, status: status.as_u16(), body });
        }

        let url_for_stream = url.clone();
        let byte_stream = response
            .bytes_stream()
            .map_err(move |e| ProviderError::Connect { url: url_for_stream.clone(), source: e });
        Ok(Box::pin(byte_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_trims_trailing_slash() {
        let provider = OpenAiCompatibleProvider::new("http://localhost:9000/", Duration::from_secs(5));
        assert_eq!(provider.completions_url(), "http://localhost:9000/chat/completions");
    }

    #[test]
    fn base_url_accessor_returns_configured_url() {
        let provider = OpenAiCompatibleProvider::new("http://localhost:9000", Duration::from_secs(5));
        assert_eq!(provider.base_url(), "http://localhost:9000");
    }
}

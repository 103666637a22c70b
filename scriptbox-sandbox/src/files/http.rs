//! Remote file fetcher backed by the content server

use super::FileFetcher;
use crate::config::FileServerConfig;
use crate::error::{ConfigError, FetchError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::StatusCode;

/// Fetches file bytes with `GET {base_url}?location=...` and an agent-key header
pub struct HttpFileFetcher {
    client: reqwest::Client,
    base_url: url::Url,
    key_header: HeaderName,
    agent_key: HeaderValue,
}

impl HttpFileFetcher {
    /// Create a fetcher from the file server configuration
    pub fn new(config: &FileServerConfig) -> Result<Self, ConfigError> {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Create a fetcher sharing an existing HTTP client
    pub fn with_client(
        client: reqwest::Client,
        config: &FileServerConfig,
    ) -> Result<Self, ConfigError> {
        let base_url = url::Url::parse(&config.base_url).map_err(|e| {
            ConfigError::Invalid(format!("invalid file server URL {}: {}", config.base_url, e))
        })?;
        let key_header = HeaderName::from_bytes(config.agent_key_header.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("invalid agent key header: {}", e)))?;
        let mut agent_key = HeaderValue::from_str(&config.agent_key)
            .map_err(|e| ConfigError::Invalid(format!("invalid agent key: {}", e)))?;
        agent_key.set_sensitive(true);

        Ok(Self {
            client,
            base_url,
            key_header,
            agent_key,
        })
    }
}

#[async_trait]
impl FileFetcher for HttpFileFetcher {
    async fn fetch(&self, location: &str) -> Result<Bytes, FetchError> {
        tracing::debug!(location = %location, "Fetching file from content server");

        let transport = |source| FetchError::Transport {
            location: location.to_string(),
            source,
        };

        let response = self
            .client
            .get(self.base_url.clone())
            .query(&[("location", location)])
            .header(self.key_header.clone(), self.agent_key.clone())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            tracing::warn!(location = %location, status = status.as_u16(), "File fetch rejected");
            return Err(FetchError::Status {
                location: location.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        tracing::debug!(location = %location, size = body.len(), "File fetched");
        Ok(body)
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> FileServerConfig {
        FileServerConfig {
            base_url: format!("{}/v1/files", server.uri()),
            agent_key: "agent-secret".to_string(),
            agent_key_header: "x-agent-key".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_sends_location_and_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/files"))
            .and(query_param("location", "uploads/a b.csv"))
            .and(header("x-agent-key", "agent-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a,b\n1,2\n".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFileFetcher::new(&config_for(&server)).unwrap();
        let bytes = fetcher.fetch("uploads/a b.csv").await.unwrap();
        assert_eq!(&bytes[..], b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_non_200_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFileFetcher::new(&config_for(&server)).unwrap();
        let err = fetcher.fetch("missing").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_other_success_codes_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let fetcher = HttpFileFetcher::new(&config_for(&server)).unwrap();
        let err = fetcher.fetch("empty").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 204, .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let config = FileServerConfig {
            base_url: "http://127.0.0.1:9/v1/files".to_string(),
            ..Default::default()
        };
        let fetcher = HttpFileFetcher::new(&config).unwrap();
        let err = fetcher.fetch("anything").await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = FileServerConfig {
            base_url: "::not-a-url".to_string(),
            ..Default::default()
        };
        assert!(HttpFileFetcher::new(&config).is_err());
    }
}

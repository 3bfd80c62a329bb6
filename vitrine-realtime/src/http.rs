//! REST collaborators: collection snapshots and mutation submission.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::time::Duration;
use tracing::{trace, warn};
use vitrine_cache::{CollectionFetcher, MutationCall, MutationEndpoint};
use vitrine_core::{ApiConfig, AuthConfig, FetchError, MutationError, VitrineError};

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<HttpClientError> for VitrineError {
    fn from(e: HttpClientError) -> Self {
        VitrineError::Transport {
            reason: e.to_string(),
        }
    }
}

/// Auth headers shared by the REST and WebSocket clients.
pub(crate) fn auth_pairs(auth: &AuthConfig) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(api_key) = auth.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        pairs.push(("x-api-key", api_key.to_string()));
    }
    if let Some(jwt) = auth.jwt.as_deref().filter(|t| !t.trim().is_empty()) {
        pairs.push(("authorization", format!("Bearer {}", jwt)));
    }
    pairs
}

fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, HttpClientError> {
    let mut headers = HeaderMap::new();
    for (name, value) in auth_pairs(auth) {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(&value).map_err(|e| HttpClientError::Config(e.to_string()))?,
        );
    }
    Ok(headers)
}

/// REST path for a cache key: `chat:messages:42` -> `/api/v1/chat/messages/42`.
pub fn collection_path(key: &str) -> String {
    format!("/api/v1/{}", key.trim_matches(':').replace(':', "/"))
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
    timeout: Duration,
}

impl RestClient {
    pub fn new(config: &ApiConfig) -> Result<Self, HttpClientError> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn fetch_error(&self, key: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                key: key.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Network {
                key: key.to_string(),
                reason: err.to_string(),
            }
        }
    }

    fn mutation_error(&self, err: reqwest::Error) -> MutationError {
        if err.is_timeout() {
            MutationError::Timeout {
                after: self.timeout,
            }
        } else {
            MutationError::Transport {
                reason: err.to_string(),
            }
        }
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Pull `message` out of a JSON error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl CollectionFetcher for RestClient {
    async fn fetch(&self, key: &str) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, collection_path(key));
        trace!(key = %key, url = %url, "Fetching collection");
        let response = self
            .client
            .get(url)
            .headers(self.auth_header.clone())
            .send()
            .await
            .map_err(|e| self.fetch_error(key, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                key: key.to_string(),
                status: status.as_u16(),
                body: error_message(&body),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl MutationEndpoint for RestClient {
    async fn submit(&self, call: MutationCall) -> Result<Option<Value>, MutationError> {
        let url = format!("{}/api/v1/{}", self.base_url, call.path.trim_start_matches('/'));
        let response = self
            .client
            .post(url)
            .headers(self.auth_header.clone())
            .json(&call.body)
            .send()
            .await
            .map_err(|e| self.mutation_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MutationError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        if status.as_u16() == 204 {
            return Ok(None);
        }

        let bytes = response.bytes().await.map_err(|e| self.mutation_error(e))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Null) => Ok(None),
            Ok(entity) => Ok(Some(entity)),
            Err(e) => {
                warn!(path = %call.path, error = %e, "Mutation accepted with unreadable body");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(auth: AuthConfig) -> ApiConfig {
        ApiConfig {
            base_url: "http://localhost:8080/".to_string(),
            push_endpoint: "ws://localhost:8080/ws".to_string(),
            auth,
            request_timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_collection_path() {
        assert_eq!(collection_path("orders"), "/api/v1/orders");
        assert_eq!(collection_path("chat:messages:42"), "/api/v1/chat/messages/42");
    }

    #[test]
    fn test_auth_pairs_skip_blank_credentials() {
        let pairs = auth_pairs(&AuthConfig {
            api_key: Some("  ".to_string()),
            jwt: Some("tok".to_string()),
        });
        assert_eq!(pairs, vec![("authorization", "Bearer tok".to_string())]);
    }

    #[test]
    fn test_rest_client_trims_base_url() {
        let client = RestClient::new(&api(AuthConfig {
            api_key: Some("key".to_string()),
            jwt: None,
        }))
        .expect("client should build");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(
            client.auth_header.get("x-api-key").and_then(|v| v.to_str().ok()),
            Some("key")
        );
    }

    #[test]
    fn test_invalid_header_value_is_config_error() {
        let err = RestClient::new(&api(AuthConfig {
            api_key: Some("bad\nkey".to_string()),
            jwt: None,
        }))
        .expect_err("newline is not a valid header value");
        assert!(matches!(err, HttpClientError::Config(_)));
    }

    #[test]
    fn test_error_message_prefers_json_message() {
        assert_eq!(error_message(r#"{"code":"x","message":"nope"}"#), "nope");
        assert_eq!(error_message("plain failure"), "plain failure");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let client = RestClient::new(&ApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            ..api(AuthConfig::default())
        })
        .expect("client should build");
        let err = client.fetch("orders").await.expect_err("nothing listens on port 1");
        assert!(err.is_transient());
    }
}

//! reqwest-backed network client

use std::time::Duration;

use async_trait::async_trait;
use hostbridge_protocol::{HttpRequestSpec, HttpResponse, KeyValue};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};

use crate::{ConnectorError, NetworkClient};

/// Configuration for [`HttpClient`]
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: concat!("hostbridge/", env!("CARGO_PKG_VERSION")).to_string(),
            accept_invalid_certs: false,
        }
    }
}

/// Network client backed by a shared `reqwest::Client`
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ConnectorError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| ConnectorError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn build_url(request: &HttpRequestSpec) -> Result<Url, ConnectorError> {
        let mut url = Url::parse(&request.url)
            .map_err(|e| ConnectorError::InvalidRequest(format!("bad url `{}`: {e}", request.url)))?;
        if !request.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for param in &request.params {
                pairs.append_pair(&param.name, &param.value);
            }
        }
        Ok(url)
    }

    fn build_headers(headers: &[KeyValue]) -> Result<HeaderMap, ConnectorError> {
        let mut map = HeaderMap::new();
        for header in headers {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
                ConnectorError::InvalidRequest(format!("bad header name `{}`", header.name))
            })?;
            let value = HeaderValue::from_str(&header.value).map_err(|_| {
                ConnectorError::InvalidRequest(format!("bad value for header `{}`", header.name))
            })?;
            map.append(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl NetworkClient for HttpClient {
    async fn perform(&self, request: HttpRequestSpec) -> Result<HttpResponse, ConnectorError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| ConnectorError::InvalidRequest(format!("bad method `{}`", request.method)))?;
        let url = Self::build_url(&request)?;
        let headers = Self::build_headers(&request.headers)?;

        tracing::debug!(%method, %url, "Performing script request");

        let timeout_ms = self.config.timeout_ms;
        let map_send_error = |e: reqwest::Error| {
            if e.is_timeout() {
                ConnectorError::Timeout(timeout_ms)
            } else {
                ConnectorError::Network(e.to_string())
            }
        };

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                KeyValue::new(
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let text = response.text().await.map_err(map_send_error)?;

        Ok(HttpResponse::new(status, headers, text))
    }
}

//! HTTP transport abstraction.
//!
//! The dispatcher never talks to reqwest directly: it hands a fully built
//! [`OutboundRequest`] to a [`Transport`], which makes retry behaviour
//! testable without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client};
use tracing::{debug, warn};

use crate::error::TransportFailure;
use crate::proxy::ProxyConfig;
use crate::Result;

/// Which network path a request takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    /// Straight out, or through the operator's proxy.
    #[default]
    Direct,
    /// Through the anonymity network.
    Anonymized,
}

/// A fully assembled GET request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub route: Route,
}

impl OutboundRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout: Duration::from_secs(30),
            route: Route::Direct,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw upstream response; the body is never interpreted beyond classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub body: String,
}

/// Sends a single GET without any retry logic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &OutboundRequest) -> std::result::Result<RawResponse, TransportFailure>;
}

/// reqwest-backed transport with one client per route.
pub struct ReqwestTransport {
    direct: Client,
    anonymized: Option<Client>,
}

impl ReqwestTransport {
    /// Builds the clients; `anonymity` is the SOCKS route, if any.
    pub fn new(proxy: Option<&ProxyConfig>, anonymity: Option<&ProxyConfig>) -> Result<Self> {
        let direct = build_client(proxy)?;
        let anonymized = anonymity.map(|p| build_client(Some(p))).transpose()?;
        Ok(Self { direct, anonymized })
    }

    fn client(&self, route: Route) -> std::result::Result<&Client, TransportFailure> {
        match route {
            Route::Direct => Ok(&self.direct),
            Route::Anonymized => self.anonymized.as_ref().ok_or_else(|| {
                TransportFailure::Request("no anonymity route configured".to_string())
            }),
        }
    }
}

fn build_client(proxy: Option<&ProxyConfig>) -> Result<Client> {
    let mut builder = Client::builder()
        .redirect(redirect::Policy::limited(10))
        .timeout(Duration::from_secs(30));

    if let Some(proxy) = proxy {
        debug!("Using proxy: {}:{}", proxy.host, proxy.port);
        builder = builder.proxy(proxy.to_reqwest()?);
    }

    builder
        .build()
        .map_err(|e| crate::DispatchError::Config(format!("failed to create HTTP client: {}", e)))
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Dropping invalid header {}", name),
        }
    }
    map
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &OutboundRequest) -> std::result::Result<RawResponse, TransportFailure> {
        let client = self.client(request.route)?;
        let response = client
            .get(&request.url)
            .headers(header_map(&request.headers))
            .timeout(request.timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await?;
        Ok(RawResponse { status, url, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyProtocol;

    #[test]
    fn test_outbound_request_builder() {
        let request = OutboundRequest::new("https://example.com")
            .with_header("User-Agent", "ua")
            .with_timeout(Duration::from_secs(5))
            .with_route(Route::Anonymized);
        assert_eq!(request.header("user-agent"), Some("ua"));
        assert_eq!(request.header("Cookie"), None);
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert_eq!(request.route, Route::Anonymized);
    }

    #[test]
    fn test_header_map_skips_invalid() {
        let map = header_map(&[
            ("Accept".to_string(), "text/html".to_string()),
            ("Bad Header".to_string(), "x".to_string()),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map["accept"], "text/html");
    }

    #[test]
    fn test_transport_new_without_proxy() {
        let transport = ReqwestTransport::new(None, None).unwrap();
        assert!(transport.client(Route::Direct).is_ok());
        assert!(transport.client(Route::Anonymized).is_err());
    }

    #[test]
    fn test_transport_new_with_anonymity_route() {
        let socks = ProxyConfig::new("127.0.0.1", 9050).with_protocol(ProxyProtocol::Socks5h);
        let transport = ReqwestTransport::new(None, Some(&socks)).unwrap();
        assert!(transport.client(Route::Anonymized).is_ok());
    }

    #[tokio::test]
    async fn test_missing_anonymity_route_fails_request() {
        let transport = ReqwestTransport::new(None, None).unwrap();
        let request = OutboundRequest::new("http://127.0.0.1:9/").with_route(Route::Anonymized);
        let err = transport.get(&request).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::errors::{ErrorCategory, TransportError};
use crate::utils::{parse_headers_with_escapes, split_header};

/// Status reported when no HTTP response was received.
pub const NO_RESPONSE_STATUS: u16 = 0;

/// A fully substituted request ready to be sent.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub timeout: Duration,
}

/// Outcome of one request. Transport failures are responses too, with
/// `status == 0` and `error` set, so callers never have to unwind.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub elapsed: Duration,
    pub error: Option<TransportError>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    pub fn transport_failure(error: TransportError, elapsed: Duration) -> Self {
        Self {
            status: NO_RESPONSE_STATUS,
            headers: HeaderMap::new(),
            body: String::new(),
            elapsed,
            error: Some(error),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            self.headers.insert(n, v);
        }
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// A 2xx response that was actually received.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && ErrorCategory::from_status_code(self.status).is_none()
    }

    /// Failure category, `None` for successful requests.
    pub fn error_category(&self) -> Option<ErrorCategory> {
        match &self.error {
            Some(e) => Some(e.category),
            None => ErrorCategory::from_status_code(self.status),
        }
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The transport used by the engine. Implementations must never fail; every
/// problem is reported inside the returned [`HttpResponse`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> HttpResponse;
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections to keep per host
    pub max_idle_per_host: usize,

    /// How long idle connections stay in the pool before cleanup
    pub idle_timeout: Duration,

    /// TCP keepalive duration
    pub tcp_keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl PoolConfig {
    pub fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        let mut builder = builder
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout);

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder
    }
}

/// Configuration for building the HTTP client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub skip_tls_verify: bool,
    pub custom_headers: Option<String>,
    pub pool_config: PoolConfig,
}

/// Production transport backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> HttpResponse {
        let start = Instant::now();

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return HttpResponse::transport_failure(TransportError::from_reqwest(&e), start.elapsed()),
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        match response.text().await {
            Ok(body) => HttpResponse {
                status,
                headers,
                body,
                elapsed: start.elapsed(),
                error: None,
            },
            Err(e) => HttpResponse::transport_failure(TransportError::from_reqwest(&e), start.elapsed()),
        }
    }
}

/// Builds the production HTTP client.
pub fn build_client(
    config: &ClientConfig,
) -> Result<ReqwestClient, Box<dyn std::error::Error + Send + Sync>> {
    let mut client_builder = reqwest::Client::builder();

    let parsed_headers = configure_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        info!(count = parsed_headers.len(), "Configured custom default headers");
        client_builder = client_builder.default_headers(parsed_headers);
    }

    client_builder = config.pool_config.apply_to_builder(client_builder);
    info!(
        max_idle_per_host = config.pool_config.max_idle_per_host,
        idle_timeout = ?config.pool_config.idle_timeout,
        "Connection pool configured"
    );

    let client = if config.skip_tls_verify {
        warn!("Skipping TLS certificate verification");
        client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?
    } else {
        client_builder.build()?
    };

    Ok(ReqwestClient::new(client))
}

/// Parses `Name:Value,Name2:Value2` (with `\,` escapes) into a header map.
pub fn configure_custom_headers(
    custom_headers_str: Option<&str>,
) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for entry in parse_headers_with_escapes(headers_str) {
        let entry = entry.trim();
        let (name_str, value_str) = split_header(entry).ok_or_else(|| {
            format!(
                "Invalid header format in custom headers: '{}'. Expected 'Name:Value'.",
                entry
            )
        })?;

        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| format!("Invalid header name: {}. Name: '{}'", e, name_str))?;
        let header_value = HeaderValue::from_str(value_str).map_err(|e| {
            format!(
                "Invalid header value for '{}': {}. Value: '{}'",
                name_str, e, value_str
            )
        })?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}

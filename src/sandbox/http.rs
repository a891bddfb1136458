//! reqwest-backed `ctx.http` capability with egress filtering.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::context::{CapabilityError, HttpCapability, HttpRequest, HttpResponse};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub default_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    /// When false, requests to loopback/private/link-local addresses are
    /// rejected before any connection is made.
    pub allow_private_networks: bool,
    pub max_response_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            allow_private_networks: false,
            max_response_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Pooled HTTP client shared across step executions. One instance per
/// process; per-call timeouts override the pool default.
pub struct PooledHttpClient {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl PooledHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .timeout(config.default_timeout)
            .build()
            .map_err(|e| CapabilityError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn check_egress(&self, url: &Url) -> Result<(), CapabilityError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(CapabilityError::new(
                    "NET_001",
                    format!("scheme '{other}' is not allowed"),
                ))
            }
        }
        if self.config.allow_private_networks {
            return Ok(());
        }
        let Some(host) = url.host_str() else {
            return Err(CapabilityError::new("NET_001", "URL has no host"));
        };
        if host.eq_ignore_ascii_case("localhost") {
            return Err(CapabilityError::new("NET_002", "egress to localhost denied"));
        }
        if let Ok(addr) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            if is_denied_addr(&addr) {
                return Err(CapabilityError::new(
                    "NET_002",
                    format!("egress to {addr} denied"),
                ));
            }
        }
        Ok(())
    }
}

fn is_denied_addr(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

#[async_trait]
impl HttpCapability for PooledHttpClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        let url = Url::parse(&request.url)
            .map_err(|e| CapabilityError::new("NET_001", format!("invalid URL: {e}")))?;
        self.check_egress(&url)?;

        let method: reqwest::Method = request
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| CapabilityError::new("NET_001", format!("invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, url).timeout(Duration::from_millis(
            request.timeout_ms.unwrap_or(self.config.default_timeout.as_millis() as u64),
        ));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = match body {
                Value::String(raw) => builder.body(raw.clone()),
                other => builder.json(other),
            };
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CapabilityError::new("SYS_002", format!("HTTP request timed out: {e}"))
            } else {
                CapabilityError::new("NET_003", format!("HTTP request failed: {e}"))
            }
        })?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CapabilityError::new("NET_003", format!("failed to read body: {e}")))?;
        if bytes.len() > self.config.max_response_bytes {
            return Err(CapabilityError::new(
                "NET_004",
                format!(
                    "response body of {} bytes exceeds limit {}",
                    bytes.len(),
                    self.config.max_response_bytes
                ),
            ));
        }

        // JSON bodies are surfaced structurally, anything else as a string.
        let body = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PooledHttpClient {
        PooledHttpClient::new(HttpClientConfig::default()).unwrap()
    }

    #[test]
    fn test_egress_denies_loopback_and_private() {
        let c = client();
        for denied in [
            "http://127.0.0.1/x",
            "http://localhost:8080/",
            "http://10.0.0.5/",
            "http://192.168.1.1/admin",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
        ] {
            let url = Url::parse(denied).unwrap();
            assert!(c.check_egress(&url).is_err(), "{denied} should be denied");
        }
    }

    #[test]
    fn test_egress_allows_public_hosts() {
        let c = client();
        for allowed in ["https://api.github.com/repos", "http://example.com/"] {
            let url = Url::parse(allowed).unwrap();
            assert!(c.check_egress(&url).is_ok(), "{allowed} should be allowed");
        }
    }

    #[test]
    fn test_egress_rejects_non_http_schemes() {
        let c = client();
        let url = Url::parse("ftp://example.com/file").unwrap();
        let err = c.check_egress(&url).unwrap_err();
        assert_eq!(err.code, "NET_001");
    }

    #[test]
    fn test_private_networks_can_be_allowed() {
        let c = PooledHttpClient::new(HttpClientConfig {
            allow_private_networks: true,
            ..HttpClientConfig::default()
        })
        .unwrap();
        let url = Url::parse("http://127.0.0.1:9000/hook").unwrap();
        assert!(c.check_egress(&url).is_ok());
    }
}

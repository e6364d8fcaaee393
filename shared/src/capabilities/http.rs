use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::connectivity::{ProbeError, ReachabilityCheck};

pub const MAX_URL_LENGTH: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if trimmed.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        let parsed = Url::parse(trimmed).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(trimmed),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
                ),
            });
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: "URL must have a host".to_string(),
            })?
            .to_lowercase();

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
            scheme,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            url.to_string()
        } else {
            let mut end = 100;
            while !url.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &url[..end])
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("DNS resolution failed for {host}: {message}")]
    DnsError { host: String, message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("TLS error for {host}: {message}")]
    TlsError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("request cancelled")]
    Cancelled,
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpError::Timeout { .. }
                | HttpError::ConnectionError { .. }
                | HttpError::DnsError { .. }
        )
    }
}

/// The host's HTTP stack, reduced to what a reachability probe needs.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issues an uncached HEAD request and returns the status code. Any
    /// response, whatever its status, proves the host was reached.
    async fn head(&self, url: &ValidatedUrl, timeout: Duration) -> Result<u16, HttpError>;
}

/// Probe against one well-known external endpoint.
pub struct HttpReachabilityCheck {
    url: ValidatedUrl,
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl HttpReachabilityCheck {
    pub fn new(url: ValidatedUrl, transport: Arc<dyn HttpTransport>, timeout: Duration) -> Self {
        Self {
            url,
            transport,
            timeout,
        }
    }

    /// One check per URL, sharing the same transport.
    pub fn for_endpoints<I, S>(
        urls: I,
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
    ) -> Result<Vec<Arc<dyn ReachabilityCheck>>, HttpError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .map(|u| {
                let url = ValidatedUrl::new(u)?;
                Ok(Arc::new(Self::new(url, Arc::clone(&transport), timeout))
                    as Arc<dyn ReachabilityCheck>)
            })
            .collect()
    }
}

#[async_trait]
impl ReachabilityCheck for HttpReachabilityCheck {
    fn name(&self) -> &str {
        self.url.host()
    }

    async fn check(&self) -> Result<(), ProbeError> {
        self.transport
            .head(&self.url, self.timeout)
            .await
            .map(|_status| ())
            .map_err(ProbeError::from)
    }
}

//! Outbound fetching pinned to validated addresses.
//!
//! Each hop is validated by [`SsrfGuard`] and then fetched with a client
//! whose DNS answers are pinned to the addresses that passed validation, so
//! a second lookup cannot be steered elsewhere. Redirects are never followed
//! by the HTTP client; every `Location` is validated as a fresh URL.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use thiserror::Error;
use url::Url;

use crate::config::FetchConfig;
use crate::security::ssrf::{SsrfError, SsrfGuard, ValidatedUrl};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Rejected(#[from] SsrfError),

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("redirect without a Location header")]
    MissingLocation,

    #[error("more than {0} redirects")]
    TooManyRedirects(usize),

    #[error("upstream answered with status {0}")]
    UpstreamStatus(u16),

    #[error("response body exceeds {max} bytes")]
    TooLarge { max: u64 },
}

/// What to require of the first URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Any,
    /// The path must name an image file.
    Image,
}

#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub final_url: Url,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub struct SafeFetcher {
    guard: Arc<SsrfGuard>,
    timeout: Duration,
    max_bytes: u64,
    user_agent: String,
}

impl SafeFetcher {
    pub fn new(guard: Arc<SsrfGuard>, config: &FetchConfig) -> Self {
        Self {
            guard,
            timeout: Duration::from_secs(config.timeout_secs),
            max_bytes: config.max_bytes,
            user_agent: format!("pim-security-gateway/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn guard(&self) -> &SsrfGuard {
        &self.guard
    }

    pub async fn fetch(&self, raw: &str, kind: FetchKind) -> Result<FetchedResource, FetchError> {
        let max_redirects = self.guard.policy().max_redirects;
        let mut target = match kind {
            FetchKind::Any => self.guard.validate(raw).await?,
            FetchKind::Image => self.guard.validate_image_url(raw).await?,
        };

        for hop in 0..=max_redirects {
            let response = self.send(&target).await?;
            let status = response.status();

            if status.is_redirection() {
                if hop == max_redirects {
                    break;
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or(FetchError::MissingLocation)?;
                tracing::debug!(from = %target.url, to = %location, hop, "Following redirect");
                target = self.guard.validate_redirect(&target.url, location).await?;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::UpstreamStatus(status.as_u16()));
            }

            return self.read_body(target.url, response).await;
        }

        tracing::warn!(url = %raw, max_redirects, "Redirect limit reached");
        Err(FetchError::TooManyRedirects(max_redirects))
    }

    async fn send(&self, target: &ValidatedUrl) -> Result<reqwest::Response, FetchError> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .no_proxy();

        if target.is_domain {
            let pinned: Vec<SocketAddr> = target
                .addrs
                .iter()
                .map(|ip| SocketAddr::new(*ip, target.port))
                .collect();
            builder = builder.resolve_to_addrs(&target.host, &pinned);
        }

        let client = builder.build()?;
        Ok(client.get(target.url.clone()).send().await?)
    }

    async fn read_body(&self, final_url: Url, mut response: reqwest::Response) -> Result<FetchedResource, FetchError> {
        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        if matches!(declared, Some(len) if len > self.max_bytes) {
            return Err(FetchError::TooLarge { max: self.max_bytes });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge { max: self.max_bytes });
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedResource {
            final_url,
            content_type,
            bytes,
        })
    }
}

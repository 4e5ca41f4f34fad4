//! Client authorization against the upstream git server.
//!
//! A mirror holds every object of a repository, so before serving from it
//! the proxy asks upstream whether the client's credentials may read that
//! repository: the client's `Authorization` header is replayed on an
//! upload-pack ref advertisement request.  Positive answers are cached for a
//! short TTL.  Transport errors and gateway errors are retried with the same
//! backoff as upstream syncs.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use tracing::{debug, instrument, warn};

use crate::auth::cache::{cache_key, AuthCache};
use crate::cache::RepositoryIdentity;
use crate::metrics::Metrics;
use crate::sync::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthorized { challenge: Option<String> },
    #[error("access denied")]
    Forbidden,
    #[error("repository not found")]
    NotFound,
    #[error("upstream authorization check failed: {0}")]
    Upstream(String),
}

pub struct UpstreamAuthorizer {
    client: reqwest::Client,
    upstream_base: Url,
    enabled: bool,
    cache: AuthCache,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl UpstreamAuthorizer {
    pub fn new(
        client: reqwest::Client,
        upstream_base: Url,
        enabled: bool,
        cache_ttl: Duration,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            upstream_base,
            enabled,
            cache: AuthCache::new(cache_ttl),
            retry,
            metrics,
        }
    }

    /// Succeeds when upstream lets `authorization` read `identity`.
    #[instrument(skip(self, authorization), fields(repo = %identity))]
    pub async fn authorize(
        &self,
        identity: &RepositoryIdentity,
        authorization: Option<&str>,
    ) -> Result<(), AuthError> {
        // Local upstreams carry no access control.
        if !self.enabled || self.upstream_base.scheme() == "file" {
            return Ok(());
        }

        let key = cache_key(authorization, identity);
        if self.cache.is_allowed(&key) {
            self.metrics.auth_cache_hits.inc();
            return Ok(());
        }
        self.metrics.auth_cache_misses.inc();

        let mut url = identity.upstream_url(&self.upstream_base);
        url.set_path(&format!("{}/info/refs", url.path()));
        url.set_query(Some("service=git-upload-pack"));

        let resp = self.send_with_retry(url, authorization).await?;

        let status = resp.status();
        match status {
            s if s.is_success() => {
                debug!("client authorized by upstream");
                self.cache.allow(key);
                Ok(())
            }
            StatusCode::UNAUTHORIZED => {
                let challenge = resp
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                debug!("upstream requires authentication");
                Err(AuthError::Unauthorized { challenge })
            }
            StatusCode::FORBIDDEN => Err(AuthError::Forbidden),
            StatusCode::NOT_FOUND => Err(AuthError::NotFound),
            other => {
                warn!(status = %other, "unexpected upstream status during authorization");
                Err(AuthError::Upstream(format!("upstream returned {other}")))
            }
        }
    }

    async fn send_with_retry(
        &self,
        url: Url,
        authorization: Option<&str>,
    ) -> Result<reqwest::Response, AuthError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.get(url.clone()).timeout(self.retry.attempt_timeout);
            if let Some(header) = authorization {
                request = request.header(reqwest::header::AUTHORIZATION, header);
            }
            let reason = match request.send().await {
                Ok(resp) if !is_retryable(resp.status()) => return Ok(resp),
                Ok(resp) => format!("upstream returned {}", resp.status()),
                Err(e) => format!("upstream authorization request failed: {e}"),
            };
            if attempt >= self.retry.max_attempts {
                return Err(AuthError::Upstream(reason));
            }
            let delay = self.retry.backoff(attempt);
            warn!(
                attempt,
                %reason,
                delay_ms = delay.as_millis() as u64,
                "upstream authorization check failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

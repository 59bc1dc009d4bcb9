//! # Artifact Fetcher
//!
//! Downloads a source artifact and verifies it against the advertised checksum
//! while the body streams in. Bytes that fail verification never leave this
//! module.

use super::source::Artifact;
use crate::config::ControllerConfig;
use crate::constants::{DEFAULT_ARTIFACT_TIMEOUT_SECS, HTTP_RETRY_MAX_WAIT_SECS, HTTP_RETRY_MIN_WAIT_SECS};
use crate::observability::metrics;
use futures::StreamExt;
use reqwest::StatusCode;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to download artifact from {url}, error: {message}")]
    Transport { url: String, message: String },
    #[error("failed to download artifact from {url}, status: {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed to verify artifact: computed checksum '{computed}' doesn't match advertised '{advertised}'")]
    ChecksumMismatch { computed: String, advertised: String },
    #[error("invalid artifact url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error("unsupported artifact digest algorithm '{algorithm}'")]
    UnsupportedDigest { algorithm: String },
}

impl ArtifactError {
    fn metric_kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Status { .. } => "status",
            Self::ChecksumMismatch { .. } => "checksum",
            Self::InvalidUrl { .. } => "url",
            Self::UnsupportedDigest { .. } => "digest",
        }
    }
}

/// Exponential retry window: `min_wait * 2^attempt`, capped at `max_wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            min_wait: Duration::from_secs(HTTP_RETRY_MIN_WAIT_SECS),
            max_wait: Duration::from_secs(HTTP_RETRY_MAX_WAIT_SECS),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.min_wait.saturating_mul(factor).min(self.max_wait)
    }
}

/// Statuses worth another attempt; everything else non-200 fails at once
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    /// Hasher and expected hex for an advertised checksum
    ///
    /// `<algorithm>:<hex>` digests name their algorithm. Bare checksums are
    /// SHA-1 when 40 characters long (older source controllers), SHA-256 otherwise.
    fn for_checksum(checksum: &str) -> Result<(Self, &str), ArtifactError> {
        let hasher = match checksum.split_once(':') {
            None if checksum.len() == 40 => return Ok((Self::Sha1(Sha1::new()), checksum)),
            None => return Ok((Self::Sha256(Sha256::new()), checksum)),
            Some(("sha1", hex)) => (Self::Sha1(Sha1::new()), hex),
            Some(("sha256", hex)) => (Self::Sha256(Sha256::new()), hex),
            Some(("sha384", hex)) => (Self::Sha384(Sha384::new()), hex),
            Some(("sha512", hex)) => (Self::Sha512(Sha512::new()), hex),
            Some((algorithm, _)) => {
                return Err(ArtifactError::UnsupportedDigest {
                    algorithm: algorithm.to_string(),
                })
            }
        };
        Ok(hasher)
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(chunk),
            Self::Sha256(h) => h.update(chunk),
            Self::Sha384(h) => h.update(chunk),
            Self::Sha512(h) => h.update(chunk),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => format!("{:x}", h.finalize()),
            Self::Sha256(h) => format!("{:x}", h.finalize()),
            Self::Sha384(h) => format!("{:x}", h.finalize()),
            Self::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    /// `host[:port]` replacing the artifact URL host
    host_override: Option<String>,
}

impl ArtifactFetcher {
    pub fn new(client: reqwest::Client, retry: RetryPolicy, host_override: Option<String>) -> Self {
        Self {
            client,
            retry,
            host_override,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_ARTIFACT_TIMEOUT_SECS))
            .build()?;
        Ok(Self::new(
            client,
            RetryPolicy::new(config.http_retry),
            config.source_controller_localhost.clone(),
        ))
    }

    fn resolve_url(&self, url: &str) -> Result<String, ArtifactError> {
        let Some(host) = self.host_override.as_deref() else {
            return Ok(url.to_string());
        };
        let invalid = |message: String| ArtifactError::InvalidUrl {
            url: url.to_string(),
            message,
        };
        let mut parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        let (hostname, port) = match host.rsplit_once(':') {
            Some((h, p)) => (h, Some(p.parse::<u16>().map_err(|e| invalid(e.to_string()))?)),
            None => (host, None),
        };
        parsed
            .set_host(Some(hostname))
            .map_err(|e| invalid(e.to_string()))?;
        parsed
            .set_port(port)
            .map_err(|()| invalid("cannot set port".to_string()))?;
        Ok(parsed.to_string())
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ArtifactError> {
        let mut attempt = 0;
        loop {
            let outcome = self.client.get(url).send().await;
            let retryable = match &outcome {
                Ok(response) => is_retryable_status(response.status()),
                Err(_) => true,
            };
            if !retryable || attempt >= self.retry.max_retries {
                return outcome.map_err(|e| ArtifactError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                });
            }

            let delay = self.retry.delay(attempt);
            match &outcome {
                Ok(response) => warn!(
                    "Artifact download from {} returned {}, retrying in {:?} ({}/{})",
                    url,
                    response.status(),
                    delay,
                    attempt + 1,
                    self.retry.max_retries
                ),
                Err(e) => warn!(
                    "Artifact download from {} failed: {}, retrying in {:?} ({}/{})",
                    url,
                    e,
                    delay,
                    attempt + 1,
                    self.retry.max_retries
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Download and verify an artifact
    pub async fn fetch(&self, artifact: &Artifact) -> Result<Vec<u8>, ArtifactError> {
        let started = Instant::now();
        let result = self.fetch_verified(artifact).await;
        match &result {
            Ok(bytes) => {
                metrics::increment_artifact_downloads();
                metrics::observe_artifact_download_duration(started.elapsed().as_secs_f64());
                info!(
                    "📦 Downloaded artifact {} ({} bytes)",
                    artifact.revision,
                    bytes.len()
                );
            }
            Err(e) => metrics::increment_artifact_download_errors(e.metric_kind()),
        }
        result
    }

    async fn fetch_verified(&self, artifact: &Artifact) -> Result<Vec<u8>, ArtifactError> {
        let url = self.resolve_url(&artifact.url)?;
        let (mut hasher, expected) = Hasher::for_checksum(&artifact.checksum)?;
        debug!("Downloading artifact from {}", url);

        let response = self.get_with_retry(&url).await?;
        if response.status() != StatusCode::OK {
            return Err(ArtifactError::Status {
                url,
                status: response.status(),
            });
        }

        let mut bytes = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ArtifactError::Transport {
                url: url.clone(),
                message: e.to_string(),
            })?;
            hasher.update(&chunk);
            bytes.extend_from_slice(&chunk);
        }

        let computed = hasher.finalize_hex();
        if computed != expected {
            return Err(ArtifactError::ChecksumMismatch {
                computed,
                advertised: artifact.checksum.clone(),
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy::new(9);
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(30));
        assert_eq!(policy.delay(30), Duration::from_secs(30));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_IMPLEMENTED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_host_override() {
        let fetcher = ArtifactFetcher::new(
            reqwest::Client::new(),
            RetryPolicy::new(0),
            Some("localhost:9090".to_string()),
        );
        assert_eq!(
            fetcher
                .resolve_url("http://source-controller.flux-system.svc.cluster.local./gitrepository/ns/repo/abc.tar.gz")
                .unwrap(),
            "http://localhost:9090/gitrepository/ns/repo/abc.tar.gz"
        );
    }

    fn digest_of(checksum: &str, body: &[u8]) -> (String, String) {
        let (mut hasher, expected) = Hasher::for_checksum(checksum).unwrap();
        hasher.update(body);
        (hasher.finalize_hex(), expected.to_string())
    }

    #[test]
    fn test_hasher_selected_by_checksum_length() {
        let (sha1, _) = digest_of(&"a".repeat(40), b"hello");
        assert_eq!(sha1, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");

        let (sha256, _) = digest_of(&"a".repeat(64), b"hello");
        assert_eq!(
            sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hasher_selected_by_digest_algorithm() {
        let (sha512, expected) = digest_of("sha512:abcd", b"hello");
        assert_eq!(expected, "abcd");
        assert_eq!(sha512.len(), 128);
        assert!(sha512.starts_with("9b71d224bd62f3785d96d46ad3ea3d73"));

        let (sha384, _) = digest_of("sha384:abcd", b"hello");
        assert_eq!(sha384.len(), 96);

        let (sha256, expected) = digest_of("sha256:cafe", b"hello");
        assert_eq!(expected, "cafe");
        assert_eq!(sha256.len(), 64);
    }

    #[test]
    fn test_unknown_digest_algorithm_rejected() {
        let err = Hasher::for_checksum("blake3:abcd").err().unwrap();
        assert_eq!(
            err.to_string(),
            "unsupported artifact digest algorithm 'blake3'"
        );
    }
}

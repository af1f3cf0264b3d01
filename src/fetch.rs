use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header::CONTENT_TYPE, Url};
use serde::Serialize;

use crate::backoff::RetryPolicy;
use crate::config::FetchCfg;
use crate::fingerprint::{Fingerprint, Fingerprinter};

/// Why a record could not be fingerprinted. Records that fail are treated as
/// unique and never become deletion candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailure {
    InvalidUrl,
    WrongContentType,
    ExceededMaxSize,
    ZeroBytes,
    Timeout,
    DownloadError,
    DecodeError,
}

impl FetchFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            FetchFailure::InvalidUrl => "invalid_url",
            FetchFailure::WrongContentType => "wrong_content_type",
            FetchFailure::ExceededMaxSize => "exceeded_max_size",
            FetchFailure::ZeroBytes => "zero_bytes",
            FetchFailure::Timeout => "timeout",
            FetchFailure::DownloadError => "download_error",
            FetchFailure::DecodeError => "decode_error",
        }
    }

    /// Host-side trouble worth retrying, as opposed to bad content.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchFailure::Timeout | FetchFailure::DownloadError)
    }
}

pub type FetchOutcome = std::result::Result<Fingerprint, FetchFailure>;

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Never fails past its own boundary: every problem is a `FetchFailure`.
    async fn fetch(&self, url: &str) -> FetchOutcome;
    fn name(&self) -> &'static str;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    fingerprinter: Fingerprinter,
    timeout: Duration,
    max_bytes: u64,
    allowed_types: Vec<String>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn from_cfg(cfg: &FetchCfg, fingerprinter: Fingerprinter) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            fingerprinter,
            timeout,
            max_bytes: cfg.max_bytes,
            allowed_types: cfg.allowed_content_types.iter().map(|s| s.to_ascii_lowercase()).collect(),
            retry: RetryPolicy::from_cfg(cfg),
        })
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn download(&self, url: &Url) -> std::result::Result<Vec<u8>, FetchFailure> {
        let resp = self.client.get(url.clone()).send().await.map_err(classify)?;
        if !resp.status().is_success() {
            tracing::debug!(%url, status = %resp.status(), "non-success status");
            return Err(FetchFailure::DownloadError);
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type_allowed(content_type, &self.allowed_types) {
            return Err(FetchFailure::WrongContentType);
        }
        if resp.content_length().is_some_and(|n| n > self.max_bytes) {
            return Err(FetchFailure::ExceededMaxSize);
        }

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchFailure::ExceededMaxSize);
            }
            body.extend_from_slice(&chunk);
        }
        if body.is_empty() {
            return Err(FetchFailure::ZeroBytes);
        }
        Ok(body)
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let url = parse_http_url(url)?;

        let mut attempt = 1;
        let bytes = loop {
            let res = match tokio::time::timeout(self.timeout, self.download(&url)).await {
                Ok(res) => res,
                Err(_) => Err(FetchFailure::Timeout),
            };
            match res {
                Err(f) if f.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::debug!(%url, attempt, reason = f.reason(), ?delay, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other?,
            }
        };

        // decoding is CPU bound and may panic on hostile input
        let fingerprinter = self.fingerprinter;
        match tokio::task::spawn_blocking(move || fingerprinter.fingerprint(&bytes)).await {
            Ok(Ok(fp)) => Ok(fp),
            Ok(Err(e)) => {
                tracing::debug!(%url, error = %e, "decode failed");
                Err(FetchFailure::DecodeError)
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "decoder panicked");
                Err(FetchFailure::DecodeError)
            }
        }
    }

    fn name(&self) -> &'static str { "http" }
}

fn classify(e: reqwest::Error) -> FetchFailure {
    if e.is_timeout() { FetchFailure::Timeout } else { FetchFailure::DownloadError }
}

pub fn parse_http_url(raw: &str) -> std::result::Result<Url, FetchFailure> {
    let url = Url::parse(raw.trim()).map_err(|_| FetchFailure::InvalidUrl)?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(FetchFailure::InvalidUrl),
    }
}

/// Compares the MIME essence (parameters stripped) against the allow-list.
pub fn content_type_allowed(header: &str, allowed: &[String]) -> bool {
    let essence = header.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    !essence.is_empty() && allowed.iter().any(|a| *a == essence)
}

//! HTTP fetch capability shared by every crawl.
//!
//! One pooled `reqwest::Client` per process, built explicitly and handed to the
//! crawler; each request carries its own timeout and headers.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::error::AppError;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

#[derive(Debug, Clone, Copy)]
pub enum ClientType {
    /// Crawling: short connect timeout, idle connections kept per host
    Crawler,
    /// API calls: no pool tuning
    Standard,
}

/// Factory for creating an HTTP client for the given workload.
pub fn create_client(client_type: ClientType) -> Result<Client> {
    let builder = Client::builder().connect_timeout(Duration::from_secs(5));

    match client_type {
        ClientType::Crawler => builder
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to build crawler reqwest client"),
        ClientType::Standard => builder
            .build()
            .context("Failed to build standard reqwest client"),
    }
}

/// Pick one of the bundled browser User-Agent strings.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Browser-like headers with a freshly rotated User-Agent.
pub fn crawl_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {0}")]
    Timeout(String),

    #[error("connection failed for {url}: {message}")]
    Connection { url: String, message: String },

    #[error("request to {url} failed: {message}")]
    Other { url: String, message: String },
}

impl From<FetchError> for AppError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Timeout(_) => AppError::timeout(error.to_string()),
            FetchError::Connection { .. } => AppError::connection(error.to_string()),
            FetchError::Other { .. } => AppError::Other(anyhow::anyhow!(error.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Where the request ended up after redirects
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Sitemaps are served as some flavour of XML or as plain text. A missing
    /// header gets the benefit of the doubt.
    pub fn is_sitemap_content(&self) -> bool {
        match self.content_type.as_deref() {
            None => true,
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                ct.contains("xml") || ct.starts_with("text/plain")
            }
        }
    }
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: create_client(ClientType::Crawler)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// GET `url`. Any HTTP status is a successful fetch; only transport
    /// problems are errors.
    pub async fn get(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> std::result::Result<FetchResponse, FetchError> {
        log::trace!("[HTTP] GET {} (timeout {:?})", url, timeout);
        let response = self
            .client
            .get(url)
            .headers(headers.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let final_url = response.url().to_string();
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| classify(url, e))?;

        log::trace!("[HTTP] {} -> {} ({} bytes)", final_url, status, body.len());
        Ok(FetchResponse {
            final_url,
            status,
            content_type,
            body,
        })
    }
}

fn classify(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else if error.is_connect() {
        FetchError::Connection {
            url: url.to_string(),
            message: error.to_string(),
        }
    } else {
        FetchError::Other {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}

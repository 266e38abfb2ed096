//! Rich domain entities - behavior lives WITH data

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ====== Enums ======

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "complete" => Ok(JobStatus::Complete),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Which discovery stage produced the URL set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DiscoverySource {
    /// `Sitemap:` directive in robots.txt
    Robots,
    /// One of the well-known sitemap paths
    WellKnownPath,
    /// Same-domain links scraped from the homepage
    HtmlFallback,
    #[default]
    Nothing,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::Robots => "robots",
            DiscoverySource::WellKnownPath => "well_known_path",
            DiscoverySource::HtmlFallback => "html_fallback",
            DiscoverySource::Nothing => "nothing",
        }
    }
}

// ====== Crawl output ======

/// Result of one domain crawl.
///
/// `degraded` separates "the site answered and listed nothing" from "we never got
/// a usable answer": it is set when the budget ran out or when no fetch succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryOutcome {
    pub urls: Vec<String>,
    pub source: DiscoverySource,
    pub truncated: bool,
    pub budget_exhausted: bool,
    pub degraded: bool,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl DiscoveryOutcome {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ====== Persisted company record ======

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub company_name: String,
    pub website_url: String,
    pub discovered_urls: Vec<String>,
    pub insight_text: String,
    pub last_updated: DateTime<Utc>,
}

impl CompanyRecord {
    pub fn new(
        company_name: impl Into<String>,
        website_url: impl Into<String>,
        discovered_urls: Vec<String>,
        insight_text: impl Into<String>,
    ) -> Self {
        Self {
            company_name: company_name.into(),
            website_url: website_url.into(),
            discovered_urls,
            insight_text: insight_text.into(),
            last_updated: Utc::now(),
        }
    }

    pub fn normalized_name(&self) -> String {
        normalize_company_name(&self.company_name)
    }
}

// ====== Batch ingestion ======

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub company_name: String,
    pub website_url: String,
}

impl BatchItem {
    pub fn new(company_name: impl Into<String>, website_url: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            website_url: website_url.into(),
        }
    }

    /// Composite key used to drop repeats within one batch.
    pub fn dedup_key(&self) -> (String, String) {
        (
            normalize_company_name(&self.company_name),
            normalize_website(&self.website_url),
        )
    }

    pub fn is_blank(&self) -> bool {
        self.company_name.trim().is_empty() || self.website_url.trim().is_empty()
    }
}

// ====== Jobs ======

/// Payload of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub record: CompanyRecord,
    pub url_count: usize,
    pub truncated: bool,
    pub degraded: bool,
    pub source: DiscoverySource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub company_name: String,
    pub website_url: String,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn queued(item: &BatchItem) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            company_name: item.company_name.trim().to_string(),
            website_url: item.website_url.trim().to_string(),
            status: JobStatus::Queued,
            result: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Queued -> Complete. Returns false if the job already left the queue.
    pub fn complete(&mut self, result: JobResult) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Complete;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        true
    }

    /// Queued -> Error. Returns false if the job already left the queue.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Error;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
        true
    }
}

// ====== Normalization ======

/// Lowercase, trimmed, inner whitespace collapsed.
pub fn normalize_company_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lowercase host+path without scheme, `www.` prefix or trailing slash.
pub fn normalize_website(url: &str) -> String {
    let lowered = url.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www.trim_end_matches('/').to_string()
}

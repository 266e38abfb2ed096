//! Runtime configuration.
//!
//! Everything is read from the environment (after loading an optional `.env`
//! file). Unparseable values fall back to their defaults with a warning so a
//! typo in one knob never prevents the pipeline from starting.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://sitemap-insight.db?mode=rwc";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Caps and timings for one domain crawl.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Maximum sitemap-index nesting that is still followed.
    pub depth_cap: usize,
    /// Children resolved per sitemap index.
    pub fanout_cap: usize,
    /// Page locations kept per leaf sitemap.
    pub per_document_cap: usize,
    /// Concurrent well-known path probes.
    pub probe_workers: usize,
    /// Links kept from the homepage fallback.
    pub fallback_cap: usize,
    /// Final URL set size.
    pub max_urls: usize,
    /// Fraction of the budget after which no new fan-out work starts.
    pub high_water: f64,
    /// Per-request timeout, independent of the crawl budget.
    pub request_timeout: Duration,
    /// Overall crawl ceiling.
    pub budget: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            depth_cap: 3,
            fanout_cap: 3,
            per_document_cap: 100,
            probe_workers: 4,
            fallback_cap: 100,
            max_urls: 500,
            high_water: 0.85,
            request_timeout: Duration::from_secs(10),
            budget: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 3,
            reset_timeout: Duration::from_secs(300),
        }
    }
}

/// Insight service connection details.
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub worker_count: usize,
    pub crawl: CrawlSettings,
    pub breaker: BreakerSettings,
    pub gemini: GeminiSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            worker_count: 5,
            crawl: CrawlSettings::default(),
            breaker: BreakerSettings::default(),
            gemini: GeminiSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if present) and read the configuration from the environment.
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("[CONFIG] No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let crawl = CrawlSettings {
            budget: Duration::from_secs(parse_or(
                &lookup,
                "CRAWL_BUDGET_SECS",
                defaults.crawl.budget.as_secs(),
            )),
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                defaults.crawl.request_timeout.as_secs(),
            )),
            ..defaults.crawl
        };

        let breaker = BreakerSettings {
            max_failures: parse_or(
                &lookup,
                "BREAKER_MAX_FAILURES",
                defaults.breaker.max_failures,
            )
            .max(1),
            reset_timeout: Duration::from_secs(parse_or(
                &lookup,
                "BREAKER_RESET_SECS",
                defaults.breaker.reset_timeout.as_secs(),
            )),
        };

        let gemini = GeminiSettings {
            api_key: lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()),
            model: lookup("GEMINI_MODEL").unwrap_or(defaults.gemini.model),
            base_url: lookup("GEMINI_BASE_URL").unwrap_or(defaults.gemini.base_url),
            timeout: defaults.gemini.timeout,
        };

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            worker_count: parse_or(&lookup, "WORKER_COUNT", defaults.worker_count).max(1),
            crawl,
            breaker,
            gemini,
        }
    }
}

fn parse_or<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("[CONFIG] Ignoring invalid {}={:?}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}

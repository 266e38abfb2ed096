//! Per-domain page discovery: robots.txt, well-known sitemap paths, then the
//! homepage's own links.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use reqwest::header::HeaderMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::CrawlSettings;
use crate::domain::models::{DiscoveryOutcome, DiscoverySource};
use crate::error::{AppError, Result};
use crate::extractor::{links, robots};
use crate::service::budget::CrawlBudget;
use crate::service::http::{crawl_headers, HttpFetcher};
use crate::service::sitemap_resolver::{FetchStats, SitemapResolver};

/// Probed in this order when robots.txt names no usable sitemap.
pub const WELL_KNOWN_SITEMAP_PATHS: [&str; 8] = [
    "/sitemap.xml",
    "/sitemaps.xml",
    "/sitemap_index.xml",
    "/sitemap-index.xml",
    "/sitemap1.xml",
    "/post-sitemap.xml",
    "/page-sitemap.xml",
    "/sitemap/sitemap.xml",
];

/// What a crawl has produced so far.
#[derive(Debug, Clone, Default)]
struct PartialCrawl {
    urls: Vec<String>,
    source: DiscoverySource,
}

/// Results published by the crawl task. The caller snapshots it only when
/// the ceiling fires; anything written afterwards is never read.
type SharedPartial = Arc<Mutex<PartialCrawl>>;

/// Everything one crawl task needs, owned so it can run detached.
struct CrawlRun {
    start_url: Url,
    origin: String,
    headers: HeaderMap,
    budget: CrawlBudget,
    token: CancellationToken,
    stats: Arc<FetchStats>,
    partial: SharedPartial,
}

impl CrawlRun {
    fn halted(&self) -> bool {
        self.token.is_cancelled() || self.budget.expired()
    }

    fn publish(&self, urls: &[String], source: DiscoverySource) {
        if self.token.is_cancelled() {
            return;
        }
        let mut partial = match self.partial.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        partial.urls.extend_from_slice(urls);
        partial.source = source;
    }
}

#[derive(Clone)]
pub struct PageDiscovery {
    fetcher: HttpFetcher,
    resolver: SitemapResolver,
    settings: CrawlSettings,
}

impl PageDiscovery {
    pub fn new(fetcher: HttpFetcher, settings: CrawlSettings) -> Self {
        Self {
            resolver: SitemapResolver::new(fetcher.clone(), &settings),
            fetcher,
            settings,
        }
    }

    pub fn settings(&self) -> &CrawlSettings {
        &self.settings
    }

    /// Discover the pages of `domain_or_url` within `budget_seconds`.
    pub async fn discover(&self, domain_or_url: &str, budget_seconds: u64) -> Result<DiscoveryOutcome> {
        self.discover_within(domain_or_url, Duration::from_secs(budget_seconds))
            .await
    }

    /// Run one crawl as a detached task and wait for it at most
    /// `budget + request_timeout`.
    ///
    /// Only an unusable input is an error. Network trouble and budget
    /// exhaustion show up as an empty or partial, `degraded` outcome.
    pub async fn discover_within(&self, domain_or_url: &str, budget: Duration) -> Result<DiscoveryOutcome> {
        let start_url = normalize_start_url(domain_or_url)?;
        let started = Instant::now();

        let run = CrawlRun {
            origin: start_url.origin().ascii_serialization(),
            start_url,
            headers: crawl_headers(),
            budget: CrawlBudget::new(budget),
            token: CancellationToken::new(),
            stats: Arc::new(FetchStats::default()),
            partial: Arc::new(Mutex::new(PartialCrawl::default())),
        };
        let token = run.token.clone();
        let stats = run.stats.clone();
        let partial = run.partial.clone();
        let crawl_budget = run.budget;

        log::info!("[DISCOVERY] Starting discovery for {} (budget {:?})", run.start_url, budget);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(run).await });
        let ceiling = budget.saturating_add(self.settings.request_timeout);

        let (found, ceiling_hit) = match wait_bounded(handle, ceiling, &token).await {
            Some(found) => (found, false),
            None => {
                log::warn!("[DISCOVERY] Ceiling of {:?} reached, using partial results", ceiling);
                let snapshot = match partial.lock() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                (snapshot, true)
            }
        };

        let (urls, truncated) = dedup_and_cap(found.urls, self.settings.max_urls);
        let budget_exhausted = ceiling_hit || crawl_budget.expired();
        let outcome = DiscoveryOutcome {
            degraded: budget_exhausted || stats.responses() == 0,
            urls,
            source: found.source,
            truncated,
            budget_exhausted,
            elapsed: started.elapsed(),
        };

        if outcome.truncated {
            log::info!("[DISCOVERY] URL set truncated to {}", self.settings.max_urls);
        }
        log::info!(
            "[DISCOVERY] Found {} URLs via {} in {}ms (degraded: {})",
            outcome.urls.len(),
            outcome.source.as_str(),
            outcome.elapsed.as_millis(),
            outcome.degraded
        );
        if stats.failures() > 0 || stats.malformed() > 0 {
            log::debug!(
                "[DISCOVERY] {} fetches failed ({} timeouts), {} documents unreadable",
                stats.failures(),
                stats.timeouts(),
                stats.malformed()
            );
        }
        Ok(outcome)
    }

    async fn run(&self, run: CrawlRun) -> PartialCrawl {
        let from_robots = self.robots_stage(&run).await;
        if !from_robots.is_empty() {
            return PartialCrawl {
                urls: from_robots,
                source: DiscoverySource::Robots,
            };
        }

        if run.halted() {
            log::debug!("[DISCOVERY] Stopping after robots stage for {}", run.origin);
            return PartialCrawl::default();
        }
        let from_paths = self.probe_stage(&run).await;
        if !from_paths.is_empty() {
            return PartialCrawl {
                urls: from_paths,
                source: DiscoverySource::WellKnownPath,
            };
        }

        if run.halted() || run.budget.past(self.settings.high_water) {
            log::debug!("[DISCOVERY] No time left for homepage fallback on {}", run.origin);
            return PartialCrawl::default();
        }
        let from_html = self.fallback_stage(&run).await;
        if !from_html.is_empty() {
            return PartialCrawl {
                urls: from_html,
                source: DiscoverySource::HtmlFallback,
            };
        }

        PartialCrawl::default()
    }

    async fn robots_stage(&self, run: &CrawlRun) -> Vec<String> {
        let robots_url = format!("{}/robots.txt", run.origin);
        log::debug!("[DISCOVERY] Checking {}", robots_url);

        let body = match self
            .fetcher
            .get(&robots_url, &run.headers, self.settings.request_timeout)
            .await
        {
            Ok(response) => {
                run.stats.record_response();
                if !response.is_success() {
                    log::debug!("[DISCOVERY] robots.txt returned HTTP {}", response.status);
                    return Vec::new();
                }
                response.body
            }
            Err(e) => {
                let error = AppError::from(e);
                run.stats.record_error(&error);
                log::debug!("[DISCOVERY] robots.txt unavailable: {}", error);
                return Vec::new();
            }
        };

        let mut urls = Vec::new();
        for sitemap_url in robots::sitemap_directives(&body) {
            if run.halted() {
                break;
            }
            log::info!("[DISCOVERY] Found sitemap in robots.txt: {}", sitemap_url);
            let found = self
                .resolver
                .resolve_tracked(
                    &sitemap_url,
                    &run.headers,
                    &run.budget,
                    self.settings.depth_cap,
                    self.settings.fanout_cap,
                    &run.stats,
                )
                .await;
            run.publish(&found, DiscoverySource::Robots);
            urls.extend(found);
        }
        urls
    }

    async fn probe_stage(&self, run: &CrawlRun) -> Vec<String> {
        let mut probes = stream::iter(WELL_KNOWN_SITEMAP_PATHS.map(|path| format!("{}{}", run.origin, path)))
            .map(move |url: String| {
                async move {
                    if run.halted() {
                        return Vec::new();
                    }
                    log::debug!("[DISCOVERY] Trying sitemap at {}", url);
                    self.resolver
                        .resolve_tracked(
                            &url,
                            &run.headers,
                            &run.budget,
                            self.settings.depth_cap,
                            self.settings.fanout_cap,
                            &run.stats,
                        )
                        .await
                }
                .boxed()
            })
            .buffer_unordered(self.settings.probe_workers.max(1));

        // First non-empty probe wins; dropping the stream abandons the rest
        while let Some(urls) = probes.next().await {
            if !urls.is_empty() {
                run.publish(&urls, DiscoverySource::WellKnownPath);
                return urls;
            }
        }
        Vec::new()
    }

    async fn fallback_stage(&self, run: &CrawlRun) -> Vec<String> {
        log::debug!("[DISCOVERY] Falling back to homepage links for {}", run.start_url);
        let response = match self
            .fetcher
            .get(run.start_url.as_str(), &run.headers, self.settings.request_timeout)
            .await
        {
            Ok(response) => {
                run.stats.record_response();
                response
            }
            Err(e) => {
                let error = AppError::from(e);
                run.stats.record_error(&error);
                log::debug!("[DISCOVERY] Homepage unavailable: {}", error);
                return Vec::new();
            }
        };
        if !response.is_success() {
            log::debug!("[DISCOVERY] Homepage returned HTTP {}", response.status);
            return Vec::new();
        }

        // Relative links resolve against wherever the redirects landed
        let base = Url::parse(&response.final_url).unwrap_or_else(|_| run.start_url.clone());
        let urls = links::same_domain_links(&response.body, &base, self.settings.fallback_cap);
        run.publish(&urls, DiscoverySource::HtmlFallback);
        urls
    }
}

/// Wait for `handle` at most `ceiling`. On expiry the token is cancelled and
/// the task is left to finish on its own; its result is dropped.
pub(crate) async fn wait_bounded<T>(
    handle: JoinHandle<T>,
    ceiling: Duration,
    token: &CancellationToken,
) -> Option<T> {
    match tokio::time::timeout(ceiling, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(join_error)) => {
            log::error!("[DISCOVERY] Crawl task failed: {}", join_error);
            token.cancel();
            None
        }
        Err(_) => {
            token.cancel();
            None
        }
    }
}

/// Accept bare domains (`example.com`) as well as full URLs.
pub fn normalize_start_url(domain_or_url: &str) -> Result<Url> {
    let trimmed = domain_or_url.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidUrl("empty website".to_string()));
    }
    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = Url::parse(&candidate).map_err(|e| AppError::InvalidUrl(format!("{}: {}", trimmed, e)))?;
    if url.host_str().is_none() {
        return Err(AppError::InvalidUrl(trimmed.to_string()));
    }
    Ok(url)
}

fn dedup_and_cap(urls: Vec<String>, max: usize) -> (Vec<String>, bool) {
    let mut seen = HashSet::new();
    let mut unique: Vec<String> = urls.into_iter().filter(|u| seen.insert(u.clone())).collect();
    let truncated = unique.len() > max;
    unique.truncate(max);
    (unique, truncated)
}

//! Recursive sitemap resolution under a time budget.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::header::HeaderMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::CrawlSettings;
use crate::error::AppError;
use crate::extractor::sitemap::{parse_sitemap, SitemapKind};
use crate::service::budget::CrawlBudget;
use crate::service::http::HttpFetcher;

/// Fetch outcomes across one crawl. A response with any status counts as an
/// answer; timeouts and refused connections do not.
///
/// Failures are absorbed where they happen and only counted here, so one bad
/// document never aborts its siblings.
#[derive(Debug, Default)]
pub struct FetchStats {
    responses: AtomicUsize,
    timeouts: AtomicUsize,
    transport_failures: AtomicUsize,
    malformed: AtomicUsize,
}

impl FetchStats {
    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &AppError) {
        let counter = match error {
            AppError::NetworkTimeout(_) => &self.timeouts,
            AppError::MalformedDocument(_) => &self.malformed,
            _ => &self.transport_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn responses(&self) -> usize {
        self.responses.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Fetches that got no HTTP response at all.
    pub fn failures(&self) -> usize {
        self.timeouts() + self.transport_failures.load(Ordering::Relaxed)
    }

    /// Documents that answered but held nothing recognisable.
    pub fn malformed(&self) -> usize {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Dedup state private to one `resolve` call tree.
#[derive(Default)]
struct ResolutionTree {
    pages: Mutex<HashSet<String>>,
    sitemaps: Mutex<HashSet<String>>,
}

impl ResolutionTree {
    /// False if this sitemap URL was already fetched in this tree.
    fn first_visit(&self, sitemap_url: &str) -> bool {
        match self.sitemaps.lock() {
            Ok(mut seen) => seen.insert(sitemap_url.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(sitemap_url.to_string()),
        }
    }

    fn keep_new(&self, locs: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut seen = match self.pages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locs.into_iter().filter(|loc| seen.insert(loc.clone())).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Caps {
    depth: usize,
    fanout: usize,
}

#[derive(Clone)]
pub struct SitemapResolver {
    fetcher: HttpFetcher,
    request_timeout: Duration,
    per_document_cap: usize,
    high_water: f64,
}

impl SitemapResolver {
    pub fn new(fetcher: HttpFetcher, settings: &CrawlSettings) -> Self {
        Self {
            fetcher,
            request_timeout: settings.request_timeout,
            per_document_cap: settings.per_document_cap,
            high_water: settings.high_water,
        }
    }

    /// Resolve `url` to page URLs, following index documents.
    ///
    /// Never fails: every fetch or parse problem contributes an empty result.
    /// Output is unique; its order carries no meaning.
    pub async fn resolve(
        &self,
        url: &str,
        headers: &HeaderMap,
        budget: &CrawlBudget,
        depth_cap: usize,
        fanout_cap: usize,
    ) -> Vec<String> {
        let stats = FetchStats::default();
        self.resolve_tracked(url, headers, budget, depth_cap, fanout_cap, &stats)
            .await
    }

    /// Same as [`resolve`](Self::resolve), reporting transport outcomes into `stats`.
    pub async fn resolve_tracked(
        &self,
        url: &str,
        headers: &HeaderMap,
        budget: &CrawlBudget,
        depth_cap: usize,
        fanout_cap: usize,
        stats: &FetchStats,
    ) -> Vec<String> {
        let tree = ResolutionTree::default();
        let caps = Caps {
            depth: depth_cap,
            fanout: fanout_cap,
        };
        let urls = self
            .resolve_node(url.to_string(), 0, headers, budget, caps, &tree, stats)
            .await;
        log::debug!("[SITEMAP] {} resolved to {} URLs", url, urls.len());
        urls
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_node<'a>(
        &'a self,
        url: String,
        depth: usize,
        headers: &'a HeaderMap,
        budget: &'a CrawlBudget,
        caps: Caps,
        tree: &'a ResolutionTree,
        stats: &'a FetchStats,
    ) -> BoxFuture<'a, Vec<String>> {
        async move {
            if budget.expired() {
                log::debug!("[SITEMAP] Budget spent, skipping {}", url);
                return Vec::new();
            }
            if !tree.first_visit(&url) {
                log::trace!("[SITEMAP] Already visited {}", url);
                return Vec::new();
            }

            let response = match self.fetcher.get(&url, headers, self.request_timeout).await {
                Ok(response) => {
                    stats.record_response();
                    response
                }
                Err(e) => {
                    let error = AppError::from(e);
                    stats.record_error(&error);
                    log::debug!("[SITEMAP] {}", error);
                    return Vec::new();
                }
            };

            if !response.is_success() {
                log::debug!("[SITEMAP] {} returned HTTP {}", url, response.status);
                return Vec::new();
            }
            if !response.is_sitemap_content() {
                log::debug!(
                    "[SITEMAP] {} is not a sitemap ({})",
                    url,
                    response.content_type.as_deref().unwrap_or("unknown")
                );
                return Vec::new();
            }

            let doc = parse_sitemap(&url, &response.body);
            match doc.kind {
                SitemapKind::UrlSet => {
                    if doc.page_locs.len() > self.per_document_cap {
                        log::debug!(
                            "[SITEMAP] {} lists {} pages, keeping {}",
                            url,
                            doc.page_locs.len(),
                            self.per_document_cap
                        );
                    }
                    tree.keep_new(doc.page_locs.into_iter().take(self.per_document_cap))
                }
                SitemapKind::Index => {
                    if depth >= caps.depth {
                        log::debug!("[SITEMAP] Depth cap {} reached at {}", caps.depth, url);
                        return Vec::new();
                    }
                    log::debug!(
                        "[SITEMAP] Index {} has {} children, following {}",
                        url,
                        doc.child_locs.len(),
                        doc.child_locs.len().min(caps.fanout)
                    );

                    let mut pending: FuturesUnordered<_> = doc
                        .child_locs
                        .into_iter()
                        .take(caps.fanout)
                        .map(move |child| async move {
                            if budget.past(self.high_water) {
                                log::debug!("[SITEMAP] High-water mark passed, not starting {}", child);
                                return Vec::new();
                            }
                            self.resolve_node(child, depth + 1, headers, budget, caps, tree, stats)
                                .await
                        })
                        .collect();

                    // Completion order, not declaration order
                    let mut merged = Vec::new();
                    while let Some(urls) = pending.next().await {
                        merged.extend(urls);
                    }
                    merged
                }
                SitemapKind::Unknown => {
                    let error = AppError::MalformedDocument(format!("nothing recognisable in {}", url));
                    stats.record_error(&error);
                    log::debug!("[SITEMAP] {}", error);
                    Vec::new()
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::http::crawl_headers;
    use crate::test_utils::mocks;
    use std::io::Write;
    use std::time::Instant;

    fn resolver() -> SitemapResolver {
        SitemapResolver::new(HttpFetcher::new().unwrap(), &CrawlSettings::default())
    }

    #[tokio::test]
    async fn test_resolves_leaf_sitemap() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(mocks::urlset(&base, &["/a", "/b", "/c", "/a"]))
            .create_async()
            .await;

        let urls = resolver()
            .resolve(
                &format!("{}/sitemap.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
            )
            .await;

        assert_eq!(urls.len(), 3);
        for path in ["/a", "/b", "/c"] {
            assert!(urls.contains(&format!("{}{}", base, path)));
        }
    }

    #[tokio::test]
    async fn test_index_visits_at_most_fanout_children() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let children: Vec<String> = (1..=5).map(|i| format!("/child{}.xml", i)).collect();
        let child_refs: Vec<&str> = children.iter().map(String::as_str).collect();

        let _index = server
            .mock("GET", "/sitemap_index.xml")
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(mocks::sitemap_index(&base, &child_refs))
            .create_async()
            .await;

        let mut visited = Vec::new();
        let mut skipped = Vec::new();
        for (i, child) in children.iter().enumerate() {
            let page = format!("/page{}", i);
            let mock = server
                .mock("GET", child.as_str())
                .with_status(200)
                .with_header("content-type", "application/xml")
                .with_body(mocks::urlset(&base, &[page.as_str()]))
                .expect(if i < 3 { 1 } else { 0 })
                .create_async()
                .await;
            if i < 3 {
                visited.push(mock);
            } else {
                skipped.push(mock);
            }
        }

        let urls = resolver()
            .resolve(
                &format!("{}/sitemap_index.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
            )
            .await;

        assert_eq!(urls.len(), 3);
        for mock in visited.iter().chain(skipped.iter()) {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_failing_child_does_not_abort_siblings() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _index = server
            .mock("GET", "/index.xml")
            .with_status(200)
            .with_body(mocks::sitemap_index(&base, &["/broken.xml", "/ok.xml"]))
            .create_async()
            .await;
        let _broken = server
            .mock("GET", "/broken.xml")
            .with_status(500)
            .create_async()
            .await;
        let _ok = server
            .mock("GET", "/ok.xml")
            .with_status(200)
            .with_body(mocks::urlset(&base, &["/x", "/y"]))
            .create_async()
            .await;

        let urls = resolver()
            .resolve(
                &format!("{}/index.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
            )
            .await;

        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn test_children_are_deduplicated_across_the_tree() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _index = server
            .mock("GET", "/index.xml")
            .with_status(200)
            .with_body(mocks::sitemap_index(&base, &["/one.xml", "/two.xml"]))
            .create_async()
            .await;
        let _one = server
            .mock("GET", "/one.xml")
            .with_status(200)
            .with_body(mocks::urlset(&base, &["/shared", "/only-one"]))
            .create_async()
            .await;
        let _two = server
            .mock("GET", "/two.xml")
            .with_status(200)
            .with_body(mocks::urlset(&base, &["/shared", "/only-two"]))
            .create_async()
            .await;

        let mut urls = resolver()
            .resolve(
                &format!("{}/index.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
            )
            .await;
        urls.sort();

        let mut expected: Vec<String> = ["/only-one", "/only-two", "/shared"]
            .iter()
            .map(|p| format!("{}{}", base, p))
            .collect();
        expected.sort();
        assert_eq!(urls, expected);
    }

    #[tokio::test]
    async fn test_depth_cap_stops_nested_indexes() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _root = server
            .mock("GET", "/root.xml")
            .with_status(200)
            .with_body(mocks::sitemap_index(&base, &["/nested.xml"]))
            .create_async()
            .await;
        let _nested = server
            .mock("GET", "/nested.xml")
            .with_status(200)
            .with_body(mocks::sitemap_index(&base, &["/leaf.xml"]))
            .create_async()
            .await;
        let _leaf = server
            .mock("GET", "/leaf.xml")
            .with_status(200)
            .with_body(mocks::urlset(&base, &["/deep"]))
            .create_async()
            .await;

        let root = format!("{}/root.xml", base);
        let shallow = resolver()
            .resolve(&root, &crawl_headers(), &CrawlBudget::from_secs(30), 1, 3)
            .await;
        assert!(shallow.is_empty(), "nested index sits at the depth cap");

        let deep = resolver()
            .resolve(&root, &crawl_headers(), &CrawlBudget::from_secs(30), 2, 3)
            .await;
        assert_eq!(deep, vec![format!("{}/deep", base)]);
    }

    #[tokio::test]
    async fn test_html_content_type_is_not_parsed() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(mocks::urlset(&base, &["/looks-valid"]))
            .create_async()
            .await;

        let urls = resolver()
            .resolve(
                &format!("{}/sitemap.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
            )
            .await;
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn test_per_document_cap() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let paths: Vec<String> = (0..250).map(|i| format!("/p{}", i)).collect();
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let _mock = server
            .mock("GET", "/big.xml")
            .with_status(200)
            .with_body(mocks::urlset(&base, &path_refs))
            .create_async()
            .await;

        let urls = resolver()
            .resolve(
                &format!("{}/big.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
            )
            .await;
        assert_eq!(urls.len(), 100);
    }

    #[tokio::test]
    async fn test_expired_budget_fetches_nothing() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_body(mocks::urlset(&base, &["/a"]))
            .expect(0)
            .create_async()
            .await;

        let stats = FetchStats::default();
        let urls = resolver()
            .resolve_tracked(
                &format!("{}/sitemap.xml", base),
                &crawl_headers(),
                &CrawlBudget::new(Duration::ZERO),
                3,
                3,
                &stats,
            )
            .await;

        assert!(urls.is_empty());
        assert_eq!(stats.responses(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_index_children_not_started_past_high_water() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let index = server
            .mock("GET", "/index.xml")
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(mocks::sitemap_index(&base, &["/late1.xml", "/late2.xml"]))
            .expect(1)
            .create_async()
            .await;
        let children = server
            .mock("GET", mockito::Matcher::Regex(r"^/late\d\.xml$".into()))
            .with_status(200)
            .with_body(mocks::urlset(&base, &["/never"]))
            .expect(0)
            .create_async()
            .await;

        let settings = CrawlSettings {
            high_water: 0.5,
            ..CrawlSettings::default()
        };
        let resolver = SitemapResolver::new(HttpFetcher::new().unwrap(), &settings);
        let budget = CrawlBudget::new(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let stats = FetchStats::default();
        let urls = resolver
            .resolve_tracked(&format!("{}/index.xml", base), &crawl_headers(), &budget, 3, 3, &stats)
            .await;

        assert!(urls.is_empty());
        assert!(!budget.expired(), "only the high-water mark should have stopped the children");
        assert_eq!(stats.responses(), 1);
        index.assert_async().await;
        children.assert_async().await;
    }

    #[tokio::test]
    async fn test_index_children_are_fetched_concurrently() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let children: Vec<String> = (1..=3).map(|i| format!("/slow{}.xml", i)).collect();
        let child_refs: Vec<&str> = children.iter().map(String::as_str).collect();
        let _index = server
            .mock("GET", "/index.xml")
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(mocks::sitemap_index(&base, &child_refs))
            .create_async()
            .await;

        let mut slow = Vec::new();
        for (i, child) in children.iter().enumerate() {
            let page = format!("/slow-page{}", i);
            let body = mocks::urlset(&base, &[page.as_str()]);
            let mock = server
                .mock("GET", child.as_str())
                .with_status(200)
                .with_header("content-type", "application/xml")
                .with_chunked_body(move |w| {
                    std::thread::sleep(Duration::from_millis(500));
                    w.write_all(body.as_bytes())
                })
                .create_async()
                .await;
            slow.push(mock);
        }

        let started = Instant::now();
        let urls = resolver()
            .resolve(
                &format!("{}/index.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
            )
            .await;
        let elapsed = started.elapsed();

        assert_eq!(urls.len(), 3);
        assert!(
            elapsed < Duration::from_millis(1200),
            "three 500ms children took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_unreadable_document_is_counted_as_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body("<html><body>nothing to see here</body></html>")
            .create_async()
            .await;

        let stats = FetchStats::default();
        let urls = resolver()
            .resolve_tracked(
                &format!("{}/sitemap.xml", server.url()),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
                &stats,
            )
            .await;

        assert!(urls.is_empty());
        assert_eq!(stats.responses(), 1);
        assert_eq!(stats.malformed(), 1);
        assert_eq!(stats.failures(), 0);
    }

    #[tokio::test]
    async fn test_refused_connection_is_counted_as_failure() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let stats = FetchStats::default();
        let urls = resolver()
            .resolve_tracked(
                &format!("http://127.0.0.1:{}/sitemap.xml", port),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
                &stats,
            )
            .await;

        assert!(urls.is_empty());
        assert_eq!(stats.responses(), 0);
        assert_eq!(stats.failures(), 1);
        assert_eq!(stats.timeouts(), 0);
    }

    #[tokio::test]
    async fn test_slow_document_is_counted_as_timeout() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let body = mocks::urlset(&base, &["/late"]);
        let _mock = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_chunked_body(move |w| {
                std::thread::sleep(Duration::from_secs(1));
                w.write_all(body.as_bytes())
            })
            .create_async()
            .await;

        let settings = CrawlSettings {
            request_timeout: Duration::from_millis(200),
            ..CrawlSettings::default()
        };
        let stats = FetchStats::default();
        let urls = SitemapResolver::new(HttpFetcher::new().unwrap(), &settings)
            .resolve_tracked(
                &format!("{}/sitemap.xml", base),
                &crawl_headers(),
                &CrawlBudget::from_secs(30),
                3,
                3,
                &stats,
            )
            .await;

        assert!(urls.is_empty());
        assert_eq!(stats.timeouts(), 1);
        assert_eq!(stats.failures(), 1);
    }
}

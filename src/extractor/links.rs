use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

/// Extract all absolute links (`<a href="…">`) from HTML.
/// Uses a cached selector for performance.
/// Strips URL fragments (#...) from links.
pub fn extract_links(html: &str, base_url: &Url) -> Vec<Url> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = SELECTOR.get_or_init(|| Selector::parse("a[href]").expect("valid selector"));

    Html::parse_document(html)
        .select(selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|raw| !raw.is_empty() && !raw.starts_with('#'))
        .filter_map(|raw| base_url.join(raw).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|mut u| {
            u.set_fragment(None);
            u
        })
        .collect()
}

/// Same-site links from a page, deduplicated, at most `cap` of them.
///
/// Hosts match when equal after dropping a leading `www.`, so
/// `example.com` and `www.example.com` count as one site.
pub fn same_domain_links(html: &str, base_url: &Url, cap: usize) -> Vec<String> {
    let base_host = base_url.host_str().map(strip_www);
    let base_port = base_url.port_or_known_default();

    let mut seen = HashSet::new();
    extract_links(html, base_url)
        .into_iter()
        .filter(|link| {
            link.host_str().map(strip_www) == base_host
                && link.port_or_known_default() == base_port
        })
        .map(String::from)
        .filter(|link| seen.insert(link.clone()))
        .take(cap)
        .collect()
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

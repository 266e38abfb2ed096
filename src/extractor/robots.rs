/// Collect every `Sitemap:` directive from a robots.txt body.
///
/// Directive names are case-insensitive; values that are not absolute URLs are
/// skipped. Order of appearance is kept and repeats are dropped.
pub fn sitemap_directives(robots_txt: &str) -> Vec<String> {
    let mut sitemaps: Vec<String> = Vec::new();

    for line in robots_txt.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("sitemap") {
            continue;
        }
        // Comments may trail the value
        let value = value.split('#').next().unwrap_or_default().trim();
        if url::Url::parse(value).is_err() {
            log::debug!("[ROBOTS] Ignoring unusable sitemap directive: {:?}", value);
            continue;
        }
        if !sitemaps.iter().any(|s| s == value) {
            sitemaps.push(value.to_string());
        }
    }

    sitemaps
}

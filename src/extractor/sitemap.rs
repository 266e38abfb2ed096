use quick_xml::events::Event;
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitemapKind {
    /// `<sitemapindex>`: entries point at other sitemaps
    Index,
    /// `<urlset>` (or a plain-text list): entries are pages
    UrlSet,
    Unknown,
}

/// One parsed sitemap body. Locations keep document order and are always
/// absolute http(s) URLs.
#[derive(Debug, Clone)]
pub struct SitemapDocument {
    pub url: String,
    pub kind: SitemapKind,
    pub child_locs: Vec<String>,
    pub page_locs: Vec<String>,
}

impl SitemapDocument {
    fn new(url: &str, kind: SitemapKind) -> Self {
        Self {
            url: url.to_string(),
            kind,
            child_locs: Vec::new(),
            page_locs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.child_locs.is_empty() && self.page_locs.is_empty()
    }
}

/// Parser selection. `detect` is the classification step; both variants share
/// `parse` and neither can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitemapFormat {
    /// Well-formed XML with a `urlset` or `sitemapindex` root.
    Xml,
    /// Anything else: regex scan for `<loc>` markers, then plain-text URLs.
    Lenient,
}

impl SitemapFormat {
    pub fn detect(text: &str) -> Self {
        match xml_root(text) {
            Some(root) if root == "urlset" || root == "sitemapindex" => SitemapFormat::Xml,
            _ => SitemapFormat::Lenient,
        }
    }

    pub fn parse(&self, url: &str, text: &str) -> SitemapDocument {
        match self {
            SitemapFormat::Xml => Self::parse_xml(url, text),
            SitemapFormat::Lenient => Self::parse_lenient(url, text),
        }
    }

    fn parse_xml(url: &str, text: &str) -> SitemapDocument {
        let mut reader = quick_xml::Reader::from_str(text);
        let mut buf = Vec::new();
        let mut stack: Vec<String> = Vec::new();
        let mut doc = SitemapDocument::new(url, SitemapKind::Unknown);
        let mut loc: Option<String> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                    if stack.is_empty() {
                        doc.kind = match name.as_str() {
                            "sitemapindex" => SitemapKind::Index,
                            "urlset" => SitemapKind::UrlSet,
                            _ => SitemapKind::Unknown,
                        };
                    }
                    if name == "loc" {
                        loc = Some(String::new());
                    }
                    stack.push(name);
                }
                Ok(Event::Text(ref e)) => {
                    if let Some(acc) = loc.as_mut() {
                        acc.push_str(&String::from_utf8_lossy(e));
                    }
                }
                Ok(Event::CData(ref e)) => {
                    if let Some(acc) = loc.as_mut() {
                        acc.push_str(&String::from_utf8_lossy(e));
                    }
                }
                Ok(Event::GeneralRef(ref e)) => {
                    if let Some(acc) = loc.as_mut() {
                        match e.resolve_char_ref() {
                            Ok(Some(ch)) => acc.push(ch),
                            _ => {
                                let name = String::from_utf8_lossy(e);
                                match quick_xml::escape::resolve_predefined_entity(&name) {
                                    Some(resolved) => acc.push_str(resolved),
                                    None => log::trace!("[SITEMAP] Unknown entity &{}; in {}", name, url),
                                }
                            }
                        }
                    }
                }
                Ok(Event::End(ref e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                    if name == "loc" {
                        let parent = stack.len().checked_sub(2).and_then(|i| stack.get(i));
                        if let Some(raw) = loc.take() {
                            match parent.map(String::as_str) {
                                Some("sitemap") => push_loc(&mut doc.child_locs, &raw),
                                Some("url") => push_loc(&mut doc.page_locs, &raw),
                                _ if doc.kind == SitemapKind::Index => {
                                    push_loc(&mut doc.child_locs, &raw)
                                }
                                _ => push_loc(&mut doc.page_locs, &raw),
                            }
                        }
                    }
                    stack.pop();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    // detect() already vetted the document; keep what we have.
                    log::warn!("[SITEMAP] XML error in {} at {}: {}", url, reader.buffer_position(), e);
                    break;
                }
                _ => {}
            }
            buf.clear();
        }
        doc
    }

    fn parse_lenient(url: &str, text: &str) -> SitemapDocument {
        static LOC: OnceLock<Regex> = OnceLock::new();
        let loc_re = LOC.get_or_init(|| {
            Regex::new(r"(?is)<(?:[a-z0-9_]+:)?loc>\s*(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?\s*</(?:[a-z0-9_]+:)?loc>")
                .expect("valid loc regex")
        });

        let lowered = text.to_lowercase();
        let is_index = lowered.contains("<sitemapindex")
            || (!lowered.contains("<urlset") && lowered.contains("<sitemap>"));

        let mut locs = Vec::new();
        for caps in loc_re.captures_iter(text) {
            push_loc(&mut locs, &unescape_basic(&caps[1]));
        }

        if locs.is_empty() && !lowered.contains('<') {
            // Plain-text sitemap: one URL per line
            for token in text.split_whitespace() {
                push_loc(&mut locs, token);
            }
        }

        if locs.is_empty() {
            let kind = if is_index {
                SitemapKind::Index
            } else if lowered.contains("<urlset") {
                SitemapKind::UrlSet
            } else {
                SitemapKind::Unknown
            };
            return SitemapDocument::new(url, kind);
        }

        let mut doc = SitemapDocument::new(url, SitemapKind::UrlSet);
        if is_index {
            doc.kind = SitemapKind::Index;
            doc.child_locs = locs;
        } else {
            doc.page_locs = locs;
        }
        doc
    }
}

/// Classify and parse a sitemap body.
pub fn parse_sitemap(url: &str, text: &str) -> SitemapDocument {
    let format = SitemapFormat::detect(text);
    log::trace!("[SITEMAP] {} parsed as {:?}", url, format);
    format.parse(url, text)
}

/// Local name of the root element if the whole document is well-formed XML.
fn xml_root(text: &str) -> Option<String> {
    let mut reader = quick_xml::Reader::from_str(text);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut root = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if depth == 0 {
                    if root.is_some() {
                        return None;
                    }
                    root = Some(String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase());
                }
                depth += 1;
            }
            Ok(Event::End(_)) => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return None,
            },
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }

    // Truncated bodies end with open elements
    if depth == 0 {
        root
    } else {
        None
    }
}

fn push_loc(target: &mut Vec<String>, raw: &str) {
    let candidate = raw.trim();
    match Url::parse(candidate) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
            target.push(candidate.to_string())
        }
        _ => log::trace!("[SITEMAP] Dropping non-URL location: {:?}", candidate),
    }
}

fn unescape_basic(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

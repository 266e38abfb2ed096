//! Parsing of `company,website` batch input.

use super::models::BatchItem;

/// One item per `company,website` line.
///
/// Blank lines and `#` comments are ignored, as is a leading
/// `company,website` header. The website is taken after the last comma so
/// company names may contain commas.
pub fn parse_batch_lines(input: &str) -> Vec<BatchItem> {
    let mut items = Vec::new();

    for (index, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((company, website)) = line.rsplit_once(',') else {
            log::warn!("Line {}: expected `company,website`, got {:?}", index + 1, line);
            continue;
        };
        let company = company.trim().trim_matches('"').trim();
        let website = website.trim().trim_matches('"').trim();

        if items.is_empty() && is_header(company, website) {
            continue;
        }
        items.push(BatchItem::new(company, website));
    }

    items
}

fn is_header(company: &str, website: &str) -> bool {
    matches!(company.to_ascii_lowercase().as_str(), "company" | "company_name" | "name")
        && matches!(website.to_ascii_lowercase().as_str(), "website" | "website_url" | "url")
}

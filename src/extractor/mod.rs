//! Pure parsers: sitemap bodies, robots.txt and HTML anchors.

pub mod links;
pub mod robots;
pub mod sitemap;

pub use sitemap::{parse_sitemap, SitemapDocument, SitemapFormat, SitemapKind};

pub mod budget;
pub mod circuit_breaker;
pub mod discovery;
pub mod gemini;
pub mod http;
pub mod job_processor;
pub mod sitemap_resolver;

pub use budget::CrawlBudget;
pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use discovery::PageDiscovery;
pub use gemini::{GeminiClient, GuardedInsight, InsightGenerator};
pub use http::HttpFetcher;
pub use job_processor::JobProcessor;
pub use sitemap_resolver::SitemapResolver;

//! Startup and shutdown of the long-running services.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::AppConfig;
use crate::db;
use crate::repository::{CompanyStore, SqliteCompanyStore};
use crate::service::gemini::INSIGHT_SERVICE;
use crate::service::{CircuitBreaker, GeminiClient, GuardedInsight, HttpFetcher, JobProcessor, PageDiscovery};

/// Initialize logging with tracing_subscriber.
///
/// `log` records are picked up through the subscriber's `tracing-log` bridge.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("sqlx=warn".parse().expect("valid directive"))
        .add_directive("sitemap_insight=debug".parse().expect("valid directive"))
        .add_directive("info".parse().expect("valid directive"));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("logging already initialized: {}", e);
    }
}

/// The wired-up pipeline and the handles needed to inspect or stop it.
pub struct Services {
    pub pool: SqlitePool,
    pub store: Arc<dyn CompanyStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub processor: JobProcessor,
}

/// Open the database and start the worker pool.
///
/// Must be called from within a Tokio runtime.
pub async fn setup(config: &AppConfig) -> Result<Services> {
    let pool = db::init_db(&config.database_url)
        .await
        .context("failed to init db")?;
    let store: Arc<dyn CompanyStore> = Arc::new(SqliteCompanyStore::new(pool.clone()));

    let fetcher = HttpFetcher::new().context("failed to build crawler client")?;
    let discovery = PageDiscovery::new(fetcher, config.crawl.clone());

    if config.gemini.api_key.is_none() {
        log::warn!("GEMINI_API_KEY is not set; every insight call will fail");
    }
    let generator = GeminiClient::new(config.gemini.clone()).context("failed to build Gemini client")?;
    let breaker = Arc::new(CircuitBreaker::new(INSIGHT_SERVICE, config.breaker));
    let insight = GuardedInsight::new(breaker.clone(), Arc::new(generator));

    let processor = JobProcessor::start(
        discovery,
        insight,
        store.clone(),
        config.worker_count,
        config.crawl.budget,
    );

    Ok(Services {
        pool,
        store,
        breaker,
        processor,
    })
}

/// Stop the workers and close the pool.
pub async fn shutdown(services: Services) {
    log::info!("Shutting down services...");
    services.processor.shutdown().await;
    services.pool.close().await;
    log::info!("Services shut down");
}

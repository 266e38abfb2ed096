use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncReadExt;

use sitemap_insight::config::AppConfig;
use sitemap_insight::domain::batch::parse_batch_lines;
use sitemap_insight::domain::models::{CompanyRecord, JobStatus};
use sitemap_insight::lifecycle;

#[derive(Parser)]
#[command(name = "sitemap-insight")]
#[command(about = "Discover company websites' pages and summarise them")]
#[command(version)]
struct Cli {
    /// File with one `company,website` pair per line (stdin when omitted or `-`)
    input: Option<PathBuf>,

    /// Number of concurrent jobs (overrides WORKER_COUNT)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Crawl budget per site in seconds (overrides CRAWL_BUDGET_SECS)
    #[arg(short, long)]
    budget: Option<u64>,

    /// Delete all stored records before running
    #[arg(long)]
    reset: bool,
}

#[derive(Serialize)]
struct JobSummary {
    id: String,
    company_name: String,
    website_url: String,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    url_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct RunReport {
    jobs: Vec<JobSummary>,
    records: Vec<CompanyRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    lifecycle::init_logging();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(workers) = cli.workers {
        config.worker_count = workers.max(1);
    }
    if let Some(secs) = cli.budget {
        config.crawl.budget = Duration::from_secs(secs);
    }

    let input = read_input(cli.input.as_ref()).await?;
    let items = parse_batch_lines(&input);
    log::info!("Read {} batch items", items.len());

    let services = lifecycle::setup(&config).await?;
    if cli.reset {
        services.processor.reset().await?;
    }

    let ids = services.processor.submit_batch(&items)?;
    services.processor.wait_until_idle().await;

    let mut jobs = Vec::with_capacity(ids.len());
    for id in &ids {
        let job = services.processor.status(id)?;
        jobs.push(JobSummary {
            id: job.id,
            company_name: job.company_name,
            website_url: job.website_url,
            status: job.status,
            url_count: job.result.as_ref().map(|r| r.url_count),
            degraded: job.result.as_ref().map(|r| r.degraded),
            error: job.error_message,
        });
    }
    let report = RunReport {
        jobs,
        records: services.processor.collect_completed(),
    };

    let failed = report
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Error)
        .count();
    log::info!(
        "Batch finished: {} complete, {} failed",
        report.jobs.len() - failed,
        failed
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode report")?
    );

    lifecycle::shutdown(services).await;
    Ok(())
}

async fn read_input(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) if path.as_os_str() != "-" => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        _ => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("failed to read stdin")?;
            Ok(input)
        }
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool};

use super::{format_datetime, parse_datetime};
use crate::domain::models::{normalize_website, CompanyRecord};
use crate::repository::CompanyStore;

const UPSERT_SQL: &str = r#"
    INSERT INTO companies (
        company_name, normalized_name, website_url, normalized_website,
        discovered_urls, insight_text, last_updated
    )
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(company_name) DO UPDATE SET
        normalized_name = excluded.normalized_name,
        website_url = excluded.website_url,
        normalized_website = excluded.normalized_website,
        discovered_urls = excluded.discovered_urls,
        insight_text = excluded.insight_text,
        last_updated = excluded.last_updated
"#;

pub struct SqliteCompanyStore {
    pool: SqlitePool,
}

impl SqliteCompanyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert_with<'e, E>(executor: E, record: &CompanyRecord) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let urls = serde_json::to_string(&record.discovered_urls)
            .context("Failed to encode discovered urls")?;

        sqlx::query(UPSERT_SQL)
            .bind(&record.company_name)
            .bind(record.normalized_name())
            .bind(&record.website_url)
            .bind(normalize_website(&record.website_url))
            .bind(urls)
            .bind(&record.insight_text)
            .bind(format_datetime(&record.last_updated))
            .execute(executor)
            .await
            .with_context(|| format!("Failed to upsert company {}", record.company_name))?;

        Ok(())
    }
}

#[async_trait]
impl CompanyStore for SqliteCompanyStore {
    async fn upsert(&self, record: &CompanyRecord) -> Result<()> {
        Self::upsert_with(&self.pool, record).await?;
        log::debug!("[DB] Upserted company {}", record.company_name);
        Ok(())
    }

    async fn upsert_batch(&self, records: &[CompanyRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            Self::upsert_with(&mut *tx, record).await?;
        }
        tx.commit().await.context("Failed to commit company batch")?;

        log::debug!("[DB] Upserted {} companies", records.len());
        Ok(())
    }

    async fn find_by_name(&self, company_name: &str) -> Result<Option<CompanyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT company_name, website_url, discovered_urls, insight_text, last_updated
            FROM companies
            WHERE company_name = ?
            "#,
        )
        .bind(company_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch company by name")?;

        row.map(|r| row_to_record(&r)).transpose()
    }

    async fn find_by_website(&self, website_url: &str) -> Result<Vec<CompanyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT company_name, website_url, discovered_urls, insight_text, last_updated
            FROM companies
            WHERE normalized_website = ?
            ORDER BY last_updated DESC
            "#,
        )
        .bind(normalize_website(website_url))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch companies by website")?;

        rows.iter().map(row_to_record).collect()
    }

    async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM companies")
            .execute(&self.pool)
            .await
            .context("Failed to clear companies")?;

        log::info!("[DB] Deleted {} companies", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn latest_per_normalized_name(&self) -> Result<Vec<CompanyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT company_name, website_url, discovered_urls, insight_text, last_updated
            FROM (
                SELECT
                    *,
                    ROW_NUMBER() OVER (
                        PARTITION BY normalized_name
                        ORDER BY last_updated DESC, company_name ASC
                    ) AS rn
                FROM companies
            )
            WHERE rn = 1
            ORDER BY normalized_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch latest companies")?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<CompanyRecord> {
    let urls: String = row.get("discovered_urls");
    Ok(CompanyRecord {
        company_name: row.get("company_name"),
        website_url: row.get("website_url"),
        discovered_urls: serde_json::from_str(&urls)
            .context("Corrupt discovered_urls column")?,
        insight_text: row.get("insight_text"),
        last_updated: parse_datetime(row.get("last_updated")),
    })
}

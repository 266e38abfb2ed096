use anyhow::Result;
use async_trait::async_trait;

use crate::domain::models::CompanyRecord;

pub mod sqlite;

pub use sqlite::SqliteCompanyStore;

#[async_trait]
pub trait CompanyStore: Send + Sync {
    /// Insert or replace the record stored under `record.company_name`.
    async fn upsert(&self, record: &CompanyRecord) -> Result<()>;
    async fn upsert_batch(&self, records: &[CompanyRecord]) -> Result<()>;
    async fn find_by_name(&self, company_name: &str) -> Result<Option<CompanyRecord>>;
    /// Records whose website matches after normalization.
    async fn find_by_website(&self, website_url: &str) -> Result<Vec<CompanyRecord>>;
    async fn delete_all(&self) -> Result<u64>;
    /// The most recently updated record for every normalized company name.
    async fn latest_per_normalized_name(&self) -> Result<Vec<CompanyRecord>>;
}

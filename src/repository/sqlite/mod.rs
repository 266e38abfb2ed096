//! SQLite-backed stores.
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision so that
//! string ordering matches time ordering.

mod company_repository;

pub use company_repository::SqliteCompanyStore;

use chrono::{DateTime, SecondsFormat, Utc};

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

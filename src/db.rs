use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Duration;

/// Per-connection SQLite settings, applied from the pool's `after_connect` hook.
async fn configure_sqlite_pragmas(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Executor;

    // WAL lets readers proceed while a worker writes
    conn.execute("PRAGMA journal_mode = WAL").await?;
    conn.execute("PRAGMA synchronous = NORMAL").await?;
    // Negative value = KB, so -16384 = 16MB
    conn.execute("PRAGMA cache_size = -16384").await?;
    // Workers upsert concurrently; wait instead of failing with "database is locked"
    conn.execute("PRAGMA busy_timeout = 5000").await?;
    conn.execute("PRAGMA temp_store = MEMORY").await?;

    Ok(())
}

/// Open (creating if needed) the database at `database_url` and run migrations.
pub async fn init_db(database_url: &str) -> Result<SqlitePool> {
    log::info!("[DB] Connecting to {}", database_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                configure_sqlite_pragmas(conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", database_url))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    log::info!("[DB] Database ready");
    Ok(pool)
}

use crate::types::{ChatwireError, Result};
use sqlx::sqlite::SqlitePool;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ChatwireError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(ChatwireError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(ChatwireError::internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in crate::constants::DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(ChatwireError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Marks messages stuck in a non-terminal status for longer than
/// `older_than_hours` as cancelled. Their producers are gone (crash, restart,
/// client abort) and nothing else will ever finish them.
pub async fn sweep_stale_streams(
    pool: &DbPool,
    older_than_hours: i64,
) -> std::result::Result<u64, sqlx::Error> {
    let now = chrono::Utc::now().timestamp_millis();
    let cutoff = now - older_than_hours * 60 * 60 * 1000;

    let swept = sqlx::query(
        "UPDATE messages SET status = 'cancelled', resumable_stream_id = NULL, updated_at = ? \
         WHERE status IN ('pending', 'streaming', 'waiting') AND updated_at < ?",
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;

    if swept.rows_affected() > 0 {
        tracing::info!(
            "Stale stream sweep: cancelled {} messages idle for more than {}h",
            swept.rows_affected(),
            older_than_hours
        );
    }

    Ok(swept.rows_affected())
}

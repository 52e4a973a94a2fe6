//! SQLite pool for the version store.
//!
//! A delegated publish through the local contractor runs `fpub resume` as a
//! child process against the same file while the parent's pool is still
//! open, so every connection uses WAL and waits on locks instead of failing
//! with `SQLITE_BUSY`.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let store = &config.store;

    if let Some(parent) = store.path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create store directory: {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", store.path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(store.busy_timeout_secs));

    SqlitePoolOptions::new()
        .max_connections(store.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open version store: {}", store.path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_uses_wal_and_busy_timeout() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.store.path = tmp.path().join("nested/store.sqlite");
        config.store.busy_timeout_secs = 7;

        let pool = connect(&config).await.unwrap();
        assert!(config.store.path.is_file());

        let mode: String = sqlx::query("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(mode, "wal");
        let timeout: i64 = sqlx::query("PRAGMA busy_timeout")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(timeout, 7000);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_connect_reports_unusable_path() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let mut config = Config::minimal(tmp.path());
        config.store.path = blocker.join("store.sqlite");

        let err = connect(&config).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to create store directory"));
    }
}

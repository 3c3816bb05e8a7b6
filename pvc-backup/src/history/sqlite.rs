use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use tracing::info;

use crate::history::{HistoryRecord, HistoryStore, HistoryStoreError, LastSuccessMap};
use crate::orchestrator::{AttemptStatus, BackupStage};

/// SQLite is written by one attempt at a time.
const NUM_POOL_CONNECTIONS: u32 = 1;

#[derive(Debug, FromRow)]
struct HistoryRow {
    namespace: String,
    claim_name: String,
    claim_uid: String,
    status: String,
    stage: String,
    archive_path: Option<String>,
    checksum: Option<String>,
    message: String,
    created_at: String,
}

impl TryFrom<HistoryRow> for HistoryRecord {
    type Error = HistoryStoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let status = AttemptStatus::from_str(&row.status)
            .map_err(|err| HistoryStoreError::Corrupt(err.to_string()))?;
        let stage = BackupStage::from_str(&row.stage)
            .map_err(|err| HistoryStoreError::Corrupt(err.to_string()))?;

        Ok(HistoryRecord {
            namespace: row.namespace,
            claim_name: row.claim_name,
            claim_uid: row.claim_uid,
            status,
            stage,
            archive_path: row.archive_path,
            checksum: row.checksum,
            message: row.message,
            timestamp: parse_timestamp(&row.created_at)?,
        })
    }
}

/// Fixed width UTC timestamps, so text order is time order.
fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, HistoryStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| HistoryStoreError::Corrupt(format!("invalid timestamp `{value}`: {err}")))
}

/// History persisted in a local SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Opens, creating if needed, the database at `path`.
    ///
    /// Call [`SqliteHistoryStore::initialize`] before use.
    pub async fn connect(path: &Path) -> Result<Self, HistoryStoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        Self::connect_with(options).await
    }

    /// A private in-memory database that lives as long as the store.
    pub async fn in_memory() -> Result<Self, HistoryStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, HistoryStoreError> {
        // The single connection must never be recycled: an in-memory database
        // disappears with it.
        let pool = SqlitePoolOptions::new()
            .min_connections(NUM_POOL_CONNECTIONS)
            .max_connections(NUM_POOL_CONNECTIONS)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Creates the schema when missing.
    pub async fn initialize(&self) -> Result<(), HistoryStoreError> {
        sqlx::query(
            r#"
            create table if not exists backup_history (
                id integer primary key autoincrement,
                namespace text not null,
                claim_name text not null,
                claim_uid text not null,
                status text not null,
                stage text not null,
                archive_path text,
                checksum text,
                message text not null,
                created_at text not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            create index if not exists idx_backup_history_claim
                on backup_history (namespace, claim_name, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("backup history schema ready");

        Ok(())
    }
}

impl HistoryStore for SqliteHistoryStore {
    async fn record(&self, record: HistoryRecord) -> Result<(), HistoryStoreError> {
        sqlx::query(
            r#"
            insert into backup_history
                (namespace, claim_name, claim_uid, status, stage, archive_path, checksum, message, created_at)
            values (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.namespace)
        .bind(&record.claim_name)
        .bind(&record.claim_uid)
        .bind(record.status.as_str())
        .bind(record.stage.as_str())
        .bind(&record.archive_path)
        .bind(&record.checksum)
        .bind(&record.message)
        .bind(format_timestamp(&record.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_success_map(&self) -> Result<LastSuccessMap, HistoryStoreError> {
        let rows = sqlx::query(
            r#"
            select namespace, claim_name, max(created_at) as last_success
            from backup_history
            where status = 'success'
            group by namespace, claim_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map = LastSuccessMap::new();
        for row in rows {
            let namespace: String = row.try_get("namespace")?;
            let claim_name: String = row.try_get("claim_name")?;
            let last_success: String = row.try_get("last_success")?;
            map.insert((namespace, claim_name), parse_timestamp(&last_success)?);
        }

        Ok(map)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            select namespace, claim_name, claim_uid, status, stage, archive_path, checksum, message, created_at
            from backup_history
            order by created_at desc, id desc
            limit ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HistoryRecord::try_from).collect()
    }

    async fn count(&self) -> Result<u64, HistoryStoreError> {
        let count: i64 = sqlx::query_scalar("select count(*) from backup_history")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}

//! Take metadata repository
//!
//! The engine only ever needs four operations on the `takes` table, so the
//! seam is a narrow trait. Rows are never deleted through it.

use async_trait::async_trait;
use blackhole_common::db::{TakeRow, TakeStatus};
use blackhole_common::time::{from_db_string, now, to_db_string};
use blackhole_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::utils::retry_on_lock;

/// Default wall-clock budget for lock-contention retries (ms)
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5_000;

/// Metadata store for takes
#[async_trait]
pub trait TakeRepository: Send + Sync {
    async fn get(&self, take_id: &str) -> Result<Option<TakeRow>>;

    /// Insert or replace a row; `created_at` of an existing row is kept
    async fn upsert(&self, row: &TakeRow) -> Result<()>;

    /// All rows, optionally filtered by status, ordered by take id
    async fn scan(&self, status: Option<TakeStatus>) -> Result<Vec<TakeRow>>;

    /// Returns false if no row exists for the take id
    async fn set_status(&self, take_id: &str, status: TakeStatus) -> Result<bool>;
}

/// SQLite-backed repository
#[derive(Debug, Clone)]
pub struct SqliteTakeRepository {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteTakeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn with_max_lock_wait(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT take_id, production, shot, camera_id, frame_start, frame_end,
           fps, start_timecode, end_timecode, description, map, valid,
           sample_count, entity_count, file_path, checksum, status,
           created_at, updated_at
    FROM takes
"#;

fn row_to_take(row: &SqliteRow) -> Result<TakeRow> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(TakeRow {
        take_id: row.try_get("take_id")?,
        production: row.try_get("production")?,
        shot: row.try_get("shot")?,
        camera_id: row.try_get("camera_id")?,
        frame_start: row.try_get("frame_start")?,
        frame_end: row.try_get("frame_end")?,
        fps: row.try_get("fps")?,
        start_timecode: row.try_get("start_timecode")?,
        end_timecode: row.try_get("end_timecode")?,
        description: row.try_get("description")?,
        map: row.try_get("map")?,
        valid: row.try_get("valid")?,
        sample_count: row.try_get("sample_count")?,
        entity_count: row.try_get("entity_count")?,
        file_path: row.try_get("file_path")?,
        checksum: row.try_get("checksum")?,
        status: status.parse()?,
        created_at: from_db_string(&created_at)?,
        updated_at: from_db_string(&updated_at)?,
    })
}

#[async_trait]
impl TakeRepository for SqliteTakeRepository {
    async fn get(&self, take_id: &str) -> Result<Option<TakeRow>> {
        let row = sqlx::query(&format!("{} WHERE take_id = ?", SELECT_COLUMNS))
            .bind(take_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_take).transpose()
    }

    async fn upsert(&self, row: &TakeRow) -> Result<()> {
        // Prepare all data before touching the pool
        let status = row.status.as_str();
        let created_at = to_db_string(&row.created_at);
        let updated_at = to_db_string(&row.updated_at);

        retry_on_lock("upsert_take", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await.map_err(Error::Database)?;
            sqlx::query(
                r#"
                INSERT INTO takes (
                    take_id, production, shot, camera_id, frame_start, frame_end,
                    fps, start_timecode, end_timecode, description, map, valid,
                    sample_count, entity_count, file_path, checksum, status,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(take_id) DO UPDATE SET
                    production = excluded.production,
                    shot = excluded.shot,
                    camera_id = excluded.camera_id,
                    frame_start = excluded.frame_start,
                    frame_end = excluded.frame_end,
                    fps = excluded.fps,
                    start_timecode = excluded.start_timecode,
                    end_timecode = excluded.end_timecode,
                    description = excluded.description,
                    map = excluded.map,
                    valid = excluded.valid,
                    sample_count = excluded.sample_count,
                    entity_count = excluded.entity_count,
                    file_path = excluded.file_path,
                    checksum = excluded.checksum,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&row.take_id)
            .bind(&row.production)
            .bind(&row.shot)
            .bind(&row.camera_id)
            .bind(row.frame_start)
            .bind(row.frame_end)
            .bind(&row.fps)
            .bind(&row.start_timecode)
            .bind(&row.end_timecode)
            .bind(&row.description)
            .bind(&row.map)
            .bind(row.valid)
            .bind(row.sample_count)
            .bind(row.entity_count)
            .bind(&row.file_path)
            .bind(&row.checksum)
            .bind(status)
            .bind(&created_at)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            tx.commit().await.map_err(Error::Database)?;
            Ok::<_, Error>(())
        })
        .await?;

        tracing::debug!(take_id = %row.take_id, status, "Upserted take row");
        Ok(())
    }

    async fn scan(&self, status: Option<TakeStatus>) -> Result<Vec<TakeRow>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!("{} WHERE status = ? ORDER BY take_id", SELECT_COLUMNS))
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(&format!("{} ORDER BY take_id", SELECT_COLUMNS))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_take).collect()
    }

    async fn set_status(&self, take_id: &str, status: TakeStatus) -> Result<bool> {
        let updated_at = to_db_string(&now());
        let affected = retry_on_lock("set_take_status", self.max_lock_wait_ms, || async {
            let result = sqlx::query("UPDATE takes SET status = ?, updated_at = ? WHERE take_id = ?")
                .bind(status.as_str())
                .bind(&updated_at)
                .bind(take_id)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        tracing::debug!(take_id, status = %status, affected, "Set take status");
        Ok(affected > 0)
    }
}

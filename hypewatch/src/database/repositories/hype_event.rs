//! Hype event repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{CSV_HEADER, HypeEventDbModel};
use crate::database::time::datetime_to_ms;
use crate::pipeline::HypeEvent;
use crate::{Error, Result};

/// Maximum rows in a CSV export.
pub const EXPORT_LIMIT: i64 = 10_000;

/// Hype event repository trait.
#[async_trait]
pub trait HypeEventRepository: Send + Sync {
    /// Store a detected event and return its id.
    async fn create(&self, event: &HypeEvent) -> Result<i64>;
    /// Newest first, optionally for one channel.
    async fn list(
        &self,
        channel: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HypeEventDbModel>>;
    async fn get_by_id(&self, id: i64) -> Result<HypeEventDbModel>;
    /// Events at or after `since`, newest first.
    async fn list_since(
        &self,
        channel: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<HypeEventDbModel>>;
    async fn count(&self, channel: Option<&str>) -> Result<i64>;
    /// CSV with header, newest first, at most [`EXPORT_LIMIT`] rows.
    async fn export_csv(&self, channel: Option<&str>) -> Result<String>;
}

/// SQLx implementation of HypeEventRepository.
pub struct SqlxHypeEventRepository {
    pool: SqlitePool,
}

impl SqlxHypeEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HypeEventRepository for SqlxHypeEventRepository {
    async fn create(&self, event: &HypeEvent) -> Result<i64> {
        let row = HypeEventDbModel::from_event(event)?;
        let result = sqlx::query(
            r#"
            INSERT INTO hype_events (
                channel, timestamp, velocity, baseline_mean, baseline_std, multiplier,
                top_emotes_json
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.channel)
        .bind(row.timestamp)
        .bind(row.velocity)
        .bind(row.baseline_mean)
        .bind(row.baseline_std)
        .bind(row.multiplier)
        .bind(&row.top_emotes_json)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list(
        &self,
        channel: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HypeEventDbModel>> {
        let events = sqlx::query_as::<_, HypeEventDbModel>(
            r#"
            SELECT * FROM hype_events
            WHERE (?1 IS NULL OR channel = ?1)
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(channel)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn get_by_id(&self, id: i64) -> Result<HypeEventDbModel> {
        sqlx::query_as::<_, HypeEventDbModel>("SELECT * FROM hype_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("HypeEvent", id.to_string()))
    }

    async fn list_since(
        &self,
        channel: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<HypeEventDbModel>> {
        let events = sqlx::query_as::<_, HypeEventDbModel>(
            r#"
            SELECT * FROM hype_events
            WHERE timestamp >= ?1 AND (?2 IS NULL OR channel = ?2)
            ORDER BY timestamp DESC, id DESC
            "#,
        )
        .bind(datetime_to_ms(since))
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn count(&self, channel: Option<&str>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM hype_events WHERE (?1 IS NULL OR channel = ?1)",
        )
        .bind(channel)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn export_csv(&self, channel: Option<&str>) -> Result<String> {
        let events = self.list(channel, EXPORT_LIMIT, 0).await?;
        let mut lines = Vec::with_capacity(events.len() + 1);
        lines.push(CSV_HEADER.to_string());
        lines.extend(events.iter().map(HypeEventDbModel::to_csv_row));
        Ok(lines.join("\n"))
    }
}

//! Postgres 事件存储（PgOutboxStore）
//!
//! 表 `outbox_events`，时间一律取数据库 `now()`，多实例共享同一时钟：
//! - 领取：`FOR UPDATE SKIP LOCKED` 选出候选行，再以 `status = 'pending'` 条件更新，逐行 CAS；
//! - 入队：`ON CONFLICT (dedupe_key) DO NOTHING`，幂等键冲突不会中断调用方事务；
//! - 事务入队：`enqueue_in_tx` 直接写入调用方的 `sqlx::Transaction`。

use super::{OutboxStore, TransactionalOutbox};
use crate::error::{OutboxError, OutboxResult as Result};
use crate::policy::OutboxPolicy;
use crate::record::{NewOutboxEvent, OutboxId, OutboxRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgConnection, PgExecutor, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id              UUID PRIMARY KEY,
    aggregate_type  TEXT NOT NULL,
    aggregate_id    TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    payload         JSONB NOT NULL,
    exchange        TEXT NOT NULL,
    routing_key     TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'publishing', 'published')),
    attempts        INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT 'epoch',
    locked_by       TEXT,
    locked_at       TIMESTAMPTZ,
    occurred_at     TIMESTAMPTZ NOT NULL,
    error           TEXT,
    published_at    TIMESTAMPTZ,
    dedupe_key      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS outbox_events_status_next_attempt_idx
    ON outbox_events (status, next_attempt_at);
CREATE INDEX IF NOT EXISTS outbox_events_status_locked_at_idx
    ON outbox_events (status, locked_at);
CREATE UNIQUE INDEX IF NOT EXISTS outbox_events_dedupe_key_idx
    ON outbox_events (dedupe_key);
"#;

const INSERT: &str = r#"
INSERT INTO outbox_events
    (id, aggregate_type, aggregate_id, event_type, payload, exchange, routing_key,
     occurred_at, dedupe_key)
VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, now()), $9)
ON CONFLICT (dedupe_key) DO NOTHING
RETURNING *
"#;

const CLAIM: &str = r#"
UPDATE outbox_events
SET status = 'publishing', locked_by = $1, locked_at = now()
WHERE id IN (
    SELECT id FROM outbox_events
    WHERE status = 'pending' AND next_attempt_at <= now() AND attempts < $2
    ORDER BY created_at, id
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
AND status = 'pending'
RETURNING *
"#;

/// 数据库行映射，仅在存储内部使用
#[derive(FromRow)]
struct OutboxRow {
    id: OutboxId,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: Value,
    exchange: String,
    routing_key: String,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    occurred_at: DateTime<Utc>,
    error: Option<String>,
    published_at: Option<DateTime<Utc>>,
    dedupe_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            exchange: row.exchange,
            routing_key: row.routing_key,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts)
                .map_err(|_| OutboxError::database(format!("negative attempts: {}", row.attempts)))?,
            next_attempt_at: row.next_attempt_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            occurred_at: row.occurred_at,
            error: row.error,
            published_at: row.published_at,
            dedupe_key: row.dedupe_key,
            created_at: row.created_at,
        })
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn row_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

async fn insert<'e, E>(executor: E, event: NewOutboxEvent) -> Result<Option<OutboxRecord>>
where
    E: PgExecutor<'e>,
{
    event.validate()?;

    let row: Option<OutboxRow> = sqlx::query_as(INSERT)
        .bind(OutboxId::now_v7())
        .bind(event.aggregate_type())
        .bind(event.aggregate_id())
        .bind(event.event_type())
        .bind(event.payload())
        .bind(event.exchange())
        .bind(event.routing_key())
        .bind(event.occurred_at())
        .bind(event.dedupe_key())
        .fetch_optional(executor)
        .await?;

    row.map(OutboxRecord::try_from).transpose()
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    policy: OutboxPolicy,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, OutboxPolicy::default())
    }

    pub fn with_policy(pool: PgPool, policy: OutboxPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn connect(url: &str, policy: OutboxPolicy) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self::with_policy(pool, policy))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    /// 建表与索引，可重复执行
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// 在调用方持有的连接上入队（连接上若已开启事务，则随该事务提交/回滚）
    pub async fn enqueue_with(
        &self,
        conn: &mut PgConnection,
        event: NewOutboxEvent,
    ) -> Result<Option<OutboxRecord>> {
        insert(conn, event).await
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.policy.max_attempts).unwrap_or(i32::MAX)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<Option<OutboxRecord>> {
        insert(&self.pool, event).await
    }

    async fn claim_batch(&self, limit: usize, worker_id: &str) -> Result<Vec<OutboxRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<OutboxRow> = sqlx::query_as(CLAIM)
            .bind(worker_id)
            .bind(self.max_attempts())
            .bind(row_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        // RETURNING 不保证顺序
        let mut records = rows
            .into_iter()
            .map(OutboxRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| (r.created_at(), r.id()));
        Ok(records)
    }

    async fn mark_published(&self, id: OutboxId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published', published_at = now(), error = NULL,
                locked_by = NULL, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(&self, id: OutboxId, error: &str, attempts_at_failure: u32) -> Result<()> {
        let delay = self.policy.backoff.delay(attempts_at_failure);

        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET status = 'pending', error = $2, attempts = attempts + 1,
                next_attempt_at = now() + ($3::bigint * interval '1 millisecond'),
                locked_by = NULL, locked_at = NULL
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(millis(delay))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(attempts) = attempts.filter(|a| *a >= self.max_attempts()) {
            warn!(id = %id, attempts, "outbox event exhausted its delivery attempts");
        }
        Ok(())
    }

    async fn recover_stuck_publishing(&self, stale_threshold: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', locked_by = NULL, locked_at = NULL
            WHERE status = 'publishing'
              AND locked_at < now() - ($1::bigint * interval '1 millisecond')
            "#,
        )
        .bind(millis(stale_threshold))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>> {
        let row: Option<OutboxRow> = sqlx::query_as("SELECT * FROM outbox_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxRecord::try_from).transpose()
    }

    async fn purge_published(&self, retention: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE status = 'published'
              AND published_at < now() - ($1::bigint * interval '1 millisecond')
            "#,
        )
        .bind(millis(retention))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn exhausted(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT * FROM outbox_events
            WHERE status = 'pending' AND attempts >= $1
            ORDER BY created_at, id
            LIMIT $2
            "#,
        )
        .bind(self.max_attempts())
        .bind(row_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboxRecord::try_from).collect()
    }
}

#[async_trait]
impl TransactionalOutbox for PgOutboxStore {
    type Tx = Transaction<'static, Postgres>;

    async fn enqueue_in_tx(
        &self,
        tx: &mut Self::Tx,
        event: NewOutboxEvent,
    ) -> Result<Option<OutboxRecord>> {
        insert(&mut **tx, event).await
    }
}

//! 事件存储（OutboxStore）
//!
//! 定义 Outbox 记录的入队、原子领取与状态流转协议：
//! - `enqueue`：幂等入队（`dedupe_key` 冲突时返回 `None`）；
//! - `claim_batch`：逐条 compare-and-set 领取，多实例并发安全；
//! - `mark_published` / `reschedule`：投递结果落盘；
//! - `recover_stuck_publishing`：回收崩溃实例遗留的锁；
//! - `purge_published`：按保留期清理已发布记录。
//!
//! `TransactionalOutbox` 允许入队加入调用方已开启的事务，保证领域写入与事件记录同生共死。
//!
mod inmemory;
#[cfg(feature = "postgres")]
mod postgres;

pub use inmemory::{InMemoryOutboxStore, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use postgres::PgOutboxStore;

use crate::{
    error::OutboxResult as Result,
    record::{NewOutboxEvent, OutboxId, OutboxRecord},
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

/// 默认锁超时阈值（5 分钟）
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 入队一条事件；`dedupe_key` 冲突时为空操作并返回 `None`
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<Option<OutboxRecord>>;

    /// 领取至多 `limit` 条到期事件，转为 publishing 并记录持有者
    async fn claim_batch(&self, limit: usize, worker_id: &str) -> Result<Vec<OutboxRecord>>;

    /// 标记投递成功（未知 id 静默忽略）
    async fn mark_published(&self, id: OutboxId) -> Result<()>;

    /// 投递失败：attempts + 1，并按 `attempts_at_failure` 计算下次尝试时间
    async fn reschedule(&self, id: OutboxId, error: &str, attempts_at_failure: u32) -> Result<()>;

    /// 将锁早于 `now - stale_threshold` 的 publishing 记录放回 pending，返回回收数量
    async fn recover_stuck_publishing(&self, stale_threshold: Duration) -> Result<u64>;

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>>;

    /// 删除 `published_at` 早于 `now - retention` 的记录，返回删除数量
    async fn purge_published(&self, retention: Duration) -> Result<u64>;

    /// 已耗尽重试次数、不再被领取的 pending 记录（人工排查/告警）
    async fn exhausted(&self, limit: usize) -> Result<Vec<OutboxRecord>>;
}

/// 支持在调用方事务内入队的存储
#[async_trait]
pub trait TransactionalOutbox: OutboxStore {
    type Tx: Send;

    async fn enqueue_in_tx(
        &self,
        tx: &mut Self::Tx,
        event: NewOutboxEvent,
    ) -> Result<Option<OutboxRecord>>;
}

#[async_trait]
impl<T> OutboxStore for Arc<T>
where
    T: OutboxStore + ?Sized,
{
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<Option<OutboxRecord>> {
        (**self).enqueue(event).await
    }

    async fn claim_batch(&self, limit: usize, worker_id: &str) -> Result<Vec<OutboxRecord>> {
        (**self).claim_batch(limit, worker_id).await
    }

    async fn mark_published(&self, id: OutboxId) -> Result<()> {
        (**self).mark_published(id).await
    }

    async fn reschedule(&self, id: OutboxId, error: &str, attempts_at_failure: u32) -> Result<()> {
        (**self).reschedule(id, error, attempts_at_failure).await
    }

    async fn recover_stuck_publishing(&self, stale_threshold: Duration) -> Result<u64> {
        (**self).recover_stuck_publishing(stale_threshold).await
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>> {
        (**self).get(id).await
    }

    async fn purge_published(&self, retention: Duration) -> Result<u64> {
        (**self).purge_published(retention).await
    }

    async fn exhausted(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        (**self).exhausted(limit).await
    }
}

/// `at - d`，越界时取最小时间
pub(crate) fn shift_back(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `at + d`，越界时取最大时间
pub(crate) fn shift_forward(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifting_saturates() {
        let now = Utc::now();
        assert_eq!(
            shift_forward(now, Duration::from_secs(5)) - now,
            TimeDelta::seconds(5)
        );
        assert_eq!(
            now - shift_back(now, Duration::from_secs(5)),
            TimeDelta::seconds(5)
        );
        assert_eq!(shift_forward(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(shift_back(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}

//! 内存版事件存储（InMemoryOutboxStore）
//!
//! 基于 `Arc<RwLock<..>>` 的轻量实现，满足 `OutboxStore` 与 `TransactionalOutbox` 协议：
//! - 克隆共享同一份存储，可模拟多个调度实例竞争同一张表；
//! - 领取时每条记录在一次写锁内完成“检查谓词 + 状态转换”，即单条 CAS；
//! - `begin/commit` 提供最小事务语义，未提交的事务被丢弃即回滚；
//!   事务内入队时即占用幂等键，丢弃事务时释放。
//!
//! 典型用途：测试环境、示例与本地开发。

use super::{OutboxStore, TransactionalOutbox, shift_back, shift_forward};
use crate::error::{OutboxError, OutboxResult as Result};
use crate::policy::OutboxPolicy;
use crate::record::{NewOutboxEvent, OutboxId, OutboxRecord, OutboxStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::warn;

#[derive(Default)]
struct State {
    /// 入队序号 -> 记录，序号即 FIFO 顺序
    records: BTreeMap<u64, OutboxRecord>,
    by_id: HashMap<OutboxId, u64>,
    /// 幂等键 -> 持有者；未提交事务暂存的记录也在此占位
    dedupe: HashMap<String, OutboxId>,
    next_seq: u64,
}

impl State {
    /// 占用幂等键；键已被其他记录持有时返回 false
    fn reserve(&mut self, key: &str, id: OutboxId) -> bool {
        match self.dedupe.get(key) {
            Some(owner) => *owner == id,
            None => {
                self.dedupe.insert(key.to_string(), id);
                true
            }
        }
    }

    fn release(&mut self, key: &str, id: OutboxId) {
        if self.dedupe.get(key) == Some(&id) {
            self.dedupe.remove(key);
        }
    }

    fn insert(&mut self, record: OutboxRecord) -> bool {
        if let Some(key) = record.dedupe_key() {
            if !self.reserve(key, record.id()) {
                return false;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(record.id(), seq);
        self.records.insert(seq, record);
        true
    }

    fn get_mut(&mut self, id: OutboxId) -> Option<&mut OutboxRecord> {
        let seq = self.by_id.get(&id)?;
        self.records.get_mut(seq)
    }

    fn remove(&mut self, seq: u64) {
        if let Some(record) = self.records.remove(&seq) {
            self.by_id.remove(&record.id());
            if let Some(key) = record.dedupe_key() {
                self.dedupe.remove(key);
            }
        }
    }
}

/// 内存事件存储
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<RwLock<State>>,
    policy: OutboxPolicy,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: OutboxPolicy) -> Self {
        Self {
            state: Arc::default(),
            policy,
        }
    }

    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    /// 开启事务；事务被丢弃而未 `commit` 即视为回滚
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
        }
    }

    /// 提交事务，返回写入的记录数
    ///
    /// 暂存记录的幂等键在入队时已占用，因此提交不会因冲突丢弃记录。
    pub fn commit(&self, mut tx: InMemoryTransaction) -> Result<usize> {
        if !Arc::ptr_eq(&self.state, &tx.state) {
            return Err(OutboxError::validation(
                "transaction belongs to another outbox store",
            ));
        }

        let staged = std::mem::take(&mut tx.staged);
        let mut state = self.write()?;
        let mut inserted = 0;
        for record in staged {
            if state.insert(record) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// 当前全部记录（按入队顺序）
    pub fn snapshot(&self) -> Result<Vec<OutboxRecord>> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| OutboxError::database("in-memory outbox lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| OutboxError::database("in-memory outbox lock poisoned"))
    }

    /// 单条 CAS：在同一把写锁内找到最早的可领取记录并转为 publishing
    fn claim_one(&self, worker_id: &str) -> Result<Option<OutboxRecord>> {
        let mut state = self.write()?;
        let now = Utc::now();
        let max_attempts = self.policy.max_attempts;

        let claimed = state
            .records
            .values_mut()
            .find(|record| record.is_claimable(now, max_attempts))
            .map(|record| {
                record.claim(worker_id, now);
                record.clone()
            });

        Ok(claimed)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<Option<OutboxRecord>> {
        event.validate()?;
        let record = OutboxRecord::pending(event, Utc::now());

        let mut state = self.write()?;
        Ok(state.insert(record.clone()).then_some(record))
    }

    async fn claim_batch(&self, limit: usize, worker_id: &str) -> Result<Vec<OutboxRecord>> {
        let mut claimed = Vec::new();

        while claimed.len() < limit {
            match self.claim_one(worker_id)? {
                Some(record) => claimed.push(record),
                None => break,
            }
        }

        Ok(claimed)
    }

    async fn mark_published(&self, id: OutboxId) -> Result<()> {
        let mut state = self.write()?;
        if let Some(record) = state.get_mut(id) {
            record.mark_published(Utc::now());
        }
        Ok(())
    }

    async fn reschedule(&self, id: OutboxId, error: &str, attempts_at_failure: u32) -> Result<()> {
        let next_attempt_at = shift_forward(
            Utc::now(),
            self.policy.backoff.delay(attempts_at_failure),
        );
        let max_attempts = self.policy.max_attempts;

        let mut state = self.write()?;
        if let Some(record) = state.get_mut(id) {
            record.reschedule(error, next_attempt_at);
            if record.is_exhausted(max_attempts) {
                warn!(id = %id, attempts = record.attempts(), "outbox event exhausted its delivery attempts");
            }
        }
        Ok(())
    }

    async fn recover_stuck_publishing(&self, stale_threshold: Duration) -> Result<u64> {
        let cutoff = shift_back(Utc::now(), stale_threshold);

        let mut state = self.write()?;
        let mut recovered = 0;
        for record in state.records.values_mut() {
            if record.is_stale(cutoff) {
                record.release();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>> {
        let state = self.read()?;
        Ok(state
            .by_id
            .get(&id)
            .and_then(|seq| state.records.get(seq))
            .cloned())
    }

    async fn purge_published(&self, retention: Duration) -> Result<u64> {
        let cutoff = shift_back(Utc::now(), retention);

        let mut state = self.write()?;
        let expired: Vec<u64> = state
            .records
            .iter()
            .filter(|(_, r)| {
                r.status() == OutboxStatus::Published
                    && r.published_at().is_some_and(|at| at < cutoff)
            })
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &expired {
            state.remove(*seq);
        }
        Ok(expired.len() as u64)
    }

    async fn exhausted(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let max_attempts = self.policy.max_attempts;
        Ok(self
            .read()?
            .records
            .values()
            .filter(|r| r.is_exhausted(max_attempts))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// 内存事务：暂存待写入的记录，`commit` 时一次性落盘
pub struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    staged: Vec<OutboxRecord>,
}

impl InMemoryTransaction {
    pub fn staged(&self) -> &[OutboxRecord] {
        &self.staged
    }
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("staged", &self.staged)
            .finish_non_exhaustive()
    }
}

impl Drop for InMemoryTransaction {
    // 回滚：释放未提交记录占用的幂等键
    fn drop(&mut self) {
        if self.staged.iter().all(|r| r.dedupe_key().is_none()) {
            return;
        }
        if let Ok(mut state) = self.state.write() {
            for record in &self.staged {
                if let Some(key) = record.dedupe_key() {
                    state.release(key, record.id());
                }
            }
        }
    }
}

#[async_trait]
impl TransactionalOutbox for InMemoryOutboxStore {
    type Tx = InMemoryTransaction;

    async fn enqueue_in_tx(
        &self,
        tx: &mut Self::Tx,
        event: NewOutboxEvent,
    ) -> Result<Option<OutboxRecord>> {
        event.validate()?;
        if !Arc::ptr_eq(&self.state, &tx.state) {
            return Err(OutboxError::validation(
                "transaction belongs to another outbox store",
            ));
        }

        let record = OutboxRecord::pending(event, Utc::now());
        if let Some(key) = record.dedupe_key() {
            if !self.write()?.reserve(key, record.id()) {
                return Ok(None);
            }
        }

        tx.staged.push(record.clone());
        Ok(Some(record))
    }
}

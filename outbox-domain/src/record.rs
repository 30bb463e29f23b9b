//! Outbox 事件记录（OutboxRecord）
//!
//! 定义待投递事件在存储层的标准形态、状态机以及入队输入 `NewOutboxEvent`。
//!
//! 状态流转：
//! - `pending --claim--> publishing --success--> published`（终态）
//! - `publishing --failure--> pending`（attempts + 1，按退避推迟）
//! - `publishing --stale--> pending`（锁超时回收，attempts 不变）
//!
use crate::error::{OutboxError, OutboxResult};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 记录标识，由存储生成（UUID v7，按时间有序）
pub type OutboxId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Published => "published",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "publishing" => Ok(OutboxStatus::Publishing),
            "published" => Ok(OutboxStatus::Published),
            other => Err(OutboxError::Database {
                reason: format!("unknown outbox status: {other}"),
            }),
        }
    }
}

/// 入队输入：由生产方（领域模块）构造
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    #[builder(into)]
    aggregate_type: String,
    #[builder(into)]
    aggregate_id: String,
    #[builder(into)]
    event_type: String,
    payload: Value,
    #[builder(into)]
    exchange: String,
    #[builder(into)]
    routing_key: String,
    /// 业务发生时间，缺省为入队时间
    occurred_at: Option<DateTime<Utc>>,
    /// 幂等键：同一键的重复入队为空操作
    #[builder(into)]
    dedupe_key: Option<String>,
}

impl NewOutboxEvent {
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.occurred_at
    }

    pub fn dedupe_key(&self) -> Option<&str> {
        self.dedupe_key.as_deref()
    }

    /// 校验必填字段；校验失败的输入不会被存储，也不会重试
    pub fn validate(&self) -> OutboxResult<()> {
        let required = [
            ("aggregate_type", &self.aggregate_type),
            ("aggregate_id", &self.aggregate_id),
            ("event_type", &self.event_type),
            ("exchange", &self.exchange),
            ("routing_key", &self.routing_key),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OutboxError::validation(format!("{field} is required")));
            }
        }

        if self.payload.is_null() {
            return Err(OutboxError::validation("payload is required"));
        }

        if matches!(self.dedupe_key.as_deref(), Some(k) if k.trim().is_empty()) {
            return Err(OutboxError::validation("dedupe_key must not be blank"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub(crate) id: OutboxId,
    pub(crate) aggregate_type: String,
    pub(crate) aggregate_id: String,
    pub(crate) event_type: String,
    pub(crate) payload: Value,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) status: OutboxStatus,
    pub(crate) attempts: u32,
    pub(crate) next_attempt_at: DateTime<Utc>,
    pub(crate) locked_by: Option<String>,
    pub(crate) locked_at: Option<DateTime<Utc>>,
    pub(crate) occurred_at: DateTime<Utc>,
    pub(crate) error: Option<String>,
    pub(crate) published_at: Option<DateTime<Utc>>,
    pub(crate) dedupe_key: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// 以入队输入创建一条 pending 记录（attempts=0，立即可领取）
    pub(crate) fn pending(event: NewOutboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            exchange: event.exchange,
            routing_key: event.routing_key,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: DateTime::<Utc>::UNIX_EPOCH,
            locked_by: None,
            locked_at: None,
            occurred_at: event.occurred_at.unwrap_or(now),
            error: None,
            published_at: None,
            dedupe_key: event.dedupe_key,
            created_at: now,
        }
    }

    pub fn id(&self) -> OutboxId {
        self.id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_attempt_at(&self) -> DateTime<Utc> {
        self.next_attempt_at
    }

    pub fn locked_by(&self) -> Option<&str> {
        self.locked_by.as_deref()
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.locked_at
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn dedupe_key(&self) -> Option<&str> {
        self.dedupe_key.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 领取谓词：`pending ∧ next_attempt_at ≤ now ∧ attempts < max_attempts`
    pub fn is_claimable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.status == OutboxStatus::Pending
            && self.next_attempt_at <= now
            && self.attempts < max_attempts
    }

    /// 锁是否早于 `cutoff`（仅对 publishing 记录有意义）
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Publishing && self.locked_at.is_some_and(|at| at < cutoff)
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status == OutboxStatus::Pending && self.attempts >= max_attempts
    }

    pub(crate) fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = OutboxStatus::Publishing;
        self.locked_by = Some(worker_id.to_string());
        self.locked_at = Some(now);
    }

    pub(crate) fn mark_published(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        self.error = None;
        self.locked_by = None;
        self.locked_at = None;
    }

    pub(crate) fn reschedule(&mut self, error: &str, next_attempt_at: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.error = Some(error.to_string());
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt_at = next_attempt_at;
        self.locked_by = None;
        self.locked_at = None;
    }

    /// 锁超时回收：不计入 attempts，也不改动 error
    pub(crate) fn release(&mut self) {
        self.status = OutboxStatus::Pending;
        self.locked_by = None;
        self.locked_at = None;
    }
}

//! 消息代理发布协议（BrokerPublisher）
//!
//! 调度器只依赖该协议，不关心具体的传输实现：
//! - `BrokerEnvelope`：发往下游的统一信封 `{type, occurredAt, aggregate, payload}`；
//! - `DeliveryOptions`：投递元数据，`message_id` 恒等于记录 id，供消费方去重；
//! - 内置 `InMemoryBroker`（测试/本地）、`LogPublisher`（仅记录日志）与可选的 `AmqpPublisher`。
//!
#[cfg(feature = "amqp")]
mod amqp;
mod inmemory;
mod log;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpPublisher};
pub use inmemory::{InMemoryBroker, PublishedMessage};
pub use log::LogPublisher;

use crate::error::OutboxResult;
use crate::record::OutboxRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRef {
    pub id: String,
    #[serde(rename = "type")]
    pub aggregate_type: String,
}

/// 发往消息代理的事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub aggregate: AggregateRef,
    pub payload: Value,
}

impl BrokerEnvelope {
    pub fn to_json_bytes(&self) -> OutboxResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl From<&OutboxRecord> for BrokerEnvelope {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            event_type: record.event_type().to_string(),
            occurred_at: record.occurred_at(),
            aggregate: AggregateRef {
                id: record.aggregate_id().to_string(),
                aggregate_type: record.aggregate_type().to_string(),
            },
            payload: record.payload().clone(),
        }
    }
}

/// 投递元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    pub message_id: String,
    pub persistent: bool,
    pub content_type: String,
}

impl From<&OutboxRecord> for DeliveryOptions {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            message_id: record.id().to_string(),
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_string(),
        }
    }
}

/// 消息代理发布器：投递成功返回 `Ok(())`，任何错误都会被调度器视为可重试失败
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &BrokerEnvelope,
        options: &DeliveryOptions,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<T> BrokerPublisher for Arc<T>
where
    T: BrokerPublisher + ?Sized,
{
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &BrokerEnvelope,
        options: &DeliveryOptions,
    ) -> anyhow::Result<()> {
        (**self)
            .publish(exchange, routing_key, envelope, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NewOutboxEvent;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let occurred_at = DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = OutboxRecord::pending(
            NewOutboxEvent::builder()
                .aggregate_type("user")
                .aggregate_id("user-123")
                .event_type("user.created")
                .payload(json!({"name": "John Doe", "email": "john@example.com"}))
                .exchange("user-exchange")
                .routing_key("user.created")
                .occurred_at(occurred_at)
                .build(),
            Utc::now(),
        );

        let envelope = BrokerEnvelope::from(&record);
        let wire: Value = serde_json::from_slice(&envelope.to_json_bytes().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "user.created",
                "occurredAt": "2023-01-01T00:00:00Z",
                "aggregate": {"id": "user-123", "type": "user"},
                "payload": {"name": "John Doe", "email": "john@example.com"}
            })
        );

        let options = DeliveryOptions::from(&record);
        assert_eq!(options.message_id, record.id().to_string());
        assert!(options.persistent);
        assert_eq!(options.content_type, "application/json");
    }
}

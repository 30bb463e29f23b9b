//! 日志发布器：不连接任何代理，只把信封写入 tracing 日志（本地调试、演练用）

use super::{BrokerEnvelope, BrokerPublisher, DeliveryOptions};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

impl LogPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerPublisher for LogPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &BrokerEnvelope,
        options: &DeliveryOptions,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_string(envelope)?;
        info!(
            target: "outbox::broker",
            exchange,
            routing_key,
            message_id = %options.message_id,
            persistent = options.persistent,
            %body,
            "[OUTBOX] {}",
            envelope.event_type
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::AggregateRef;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn log_publisher_always_succeeds() {
        let envelope = BrokerEnvelope {
            event_type: "user.created".into(),
            occurred_at: Utc::now(),
            aggregate: AggregateRef {
                id: "user-1".into(),
                aggregate_type: "user".into(),
            },
            payload: json!({"name": "Jane"}),
        };
        let options = DeliveryOptions {
            message_id: "m-1".into(),
            persistent: true,
            content_type: "application/json".into(),
        };

        LogPublisher::new()
            .publish("users", "user.created", &envelope, &options)
            .await
            .unwrap();
    }
}

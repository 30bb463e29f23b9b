//! AMQP（RabbitMQ）发布器
//!
//! 通过 deadpool 连接池获取连接，通道开启 publisher confirm 模式；
//! 每条消息携带 `message_id`（记录 id）、持久化投递（`delivery_mode = 2`）与 `content_type`，
//! 等待代理确认后才视为成功，nack 视为失败。

use super::{BrokerEnvelope, BrokerPublisher, DeliveryOptions};
use crate::error::{OutboxError, OutboxResult};
use anyhow::Context;
use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// 连接地址，例如 `amqp://localhost:5672`
    pub url: String,
    pub pool_size: usize,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 4,
        }
    }
}

pub struct AmqpPublisher {
    pool: Pool,
    /// confirm 模式通道，出错后丢弃并在下次发布时重建
    channel: Mutex<Option<Channel>>,
}

impl AmqpPublisher {
    pub async fn connect(config: AmqpConfig) -> OutboxResult<Self> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| OutboxError::Config {
                reason: format!("failed to create amqp pool: {e}"),
            })?;

        let publisher = Self {
            pool,
            channel: Mutex::new(None),
        };

        // 启动时即校验连接
        let channel = publisher
            .open_channel()
            .await
            .map_err(|e| OutboxError::Publish {
                reason: format!("{e:#}"),
            })?;
        *publisher.channel.lock().await = Some(channel);

        info!(url = %config.url, "connected to AMQP broker");
        Ok(publisher)
    }

    async fn open_channel(&self) -> anyhow::Result<Channel> {
        let conn = self
            .pool
            .get()
            .await
            .context("failed to get amqp connection from pool")?;
        let channel = conn
            .create_channel()
            .await
            .context("failed to create amqp channel")?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("failed to enable publisher confirms")?;
        Ok(channel)
    }

    async fn channel(&self) -> anyhow::Result<Channel> {
        let mut cached = self.channel.lock().await;
        if let Some(channel) = cached.as_ref().filter(|c| c.status().connected()) {
            return Ok(channel.clone());
        }

        let channel = self.open_channel().await?;
        *cached = Some(channel.clone());
        Ok(channel)
    }

    async fn discard_channel(&self) {
        self.channel.lock().await.take();
    }
}

#[async_trait]
impl BrokerPublisher for AmqpPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &BrokerEnvelope,
        options: &DeliveryOptions,
    ) -> anyhow::Result<()> {
        let body = envelope.to_json_bytes()?;
        let properties = BasicProperties::default()
            .with_message_id(options.message_id.clone().into())
            .with_content_type(options.content_type.clone().into())
            .with_delivery_mode(if options.persistent { 2 } else { 1 });

        let channel = self.channel().await?;
        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
        {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };

        let confirmation = match confirm {
            Ok(confirmation) => confirmation,
            Err(e) => {
                self.discard_channel().await;
                return Err(e).context("amqp publish failed");
            }
        };

        if confirmation.is_nack() {
            anyhow::bail!("broker nacked message {}", options.message_id);
        }

        debug!(exchange, routing_key, message_id = %options.message_id, "published to AMQP");
        Ok(())
    }
}

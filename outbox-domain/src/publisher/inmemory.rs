//! 内存版消息代理（InMemoryBroker）
//!
//! 基于 `tokio::sync::broadcast` 的发布器，满足 `BrokerPublisher` 协议：
//! - `publish`：记录到投递日志并广播给订阅者；
//! - `subscribe`：返回 `'static` 消息流，便于在 `tokio::spawn` 中消费；
//! - `fail_next`：令接下来的 N 次发布失败，用于演练重试路径。
//!
//! 注意：无订阅者时广播被忽略，但投递日志始终保留。

use super::{BrokerEnvelope, BrokerPublisher, DeliveryOptions};
use crate::error::{OutboxError, OutboxResult};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// 一次成功的投递
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: BrokerEnvelope,
    pub options: DeliveryOptions,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    tx: broadcast::Sender<PublishedMessage>,
    log: Arc<Mutex<Vec<PublishedMessage>>>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryBroker {
    /// `capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            log: Arc::default(),
            failures: Arc::default(),
        }
    }

    /// 接下来的 `n` 次发布返回错误
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// 已成功投递的消息（按投递顺序）
    pub fn published(&self) -> OutboxResult<Vec<PublishedMessage>> {
        let log = self.log.lock().map_err(|_| OutboxError::Publish {
            reason: "in-memory broker log poisoned".to_string(),
        })?;
        Ok(log.clone())
    }

    pub fn subscribe(&self) -> BoxStream<'static, OutboxResult<PublishedMessage>> {
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).map(|r| {
            r.map_err(|e| OutboxError::Publish {
                reason: e.to_string(),
            })
        });
        Box::pin(stream)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BrokerPublisher for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &BrokerEnvelope,
        options: &DeliveryOptions,
    ) -> anyhow::Result<()> {
        if self.take_failure() {
            anyhow::bail!("broker unavailable");
        }

        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
            options: options.clone(),
        };

        self.log
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory broker log poisoned"))?
            .push(message.clone());

        // 无订阅者时 send 返回错误，视为非致命
        let _ = self.tx.send(message);
        Ok(())
    }
}

//! 投递调度器（Dispatcher）
//!
//! 编排三个长驻周期任务：
//! - tick：领取到期事件，逐条发布到消息代理并落盘结果；
//! - reap：回收锁超时的 publishing 记录；
//! - purge：清理超过保留期的已发布记录。
//!
//! 发布失败与存储写入失败都视为可重试，统一走 `reschedule`；
//! 发布成功但未能标记时会产生重复投递，由消费方按 `messageId` 去重（至少一次语义）。
//!
mod config;

pub use config::DispatcherConfig;

use crate::error::OutboxError;
use crate::publisher::{BrokerEnvelope, BrokerPublisher, DeliveryOptions};
use crate::record::OutboxRecord;
use crate::store::OutboxStore;
use bon::Builder;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

fn default_worker_id() -> String {
    format!("dispatcher@{}", std::process::id())
}

/// 单次 tick 的统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub rescheduled: usize,
}

#[derive(Builder)]
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn BrokerPublisher>,
    #[builder(default)]
    config: DispatcherConfig,
    /// 写入 `locked_by`，便于排查哪个实例持有锁
    #[builder(into, default = default_worker_id())]
    worker_id: String,
}

impl Dispatcher {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// 领取一批到期事件并逐条投递；单条失败不影响同批其余记录
    pub async fn tick(&self) -> TickReport {
        let records = match self
            .store
            .claim_batch(self.config.batch_size, &self.worker_id)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "claim batch failed");
                return TickReport::default();
            }
        };

        let mut report = TickReport {
            claimed: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return report;
        }

        for record in &records {
            let Err(e) = self.deliver(record).await else {
                report.published += 1;
                continue;
            };

            // `{:#}` 保留完整的 context 链
            let reason = format!("{e:#}");
            match self
                .store
                .reschedule(record.id(), &reason, record.attempts())
                .await
            {
                Ok(()) => report.rescheduled += 1,
                // 记录仍处于 publishing，等待 reap 回收
                Err(e) => error!(id = %record.id(), error = %e, "reschedule failed"),
            }
        }

        debug!(
            worker_id = %self.worker_id,
            claimed = report.claimed,
            published = report.published,
            rescheduled = report.rescheduled,
            "outbox tick finished"
        );
        report
    }

    /// 回收锁超时的记录，返回回收数量；错误只记录日志
    pub async fn reap(&self) -> u64 {
        match self
            .store
            .recover_stuck_publishing(self.config.stale_lock_threshold)
            .await
        {
            Ok(0) => 0,
            Ok(n) => {
                info!(recovered = n, "recovered stuck outbox events");
                n
            }
            Err(e) => {
                error!(error = %e, "recover stuck publishing failed");
                0
            }
        }
    }

    /// 清理超过保留期的已发布记录，返回删除数量；错误只记录日志
    pub async fn purge(&self) -> u64 {
        match self.store.purge_published(self.config.retention).await {
            Ok(0) => 0,
            Ok(n) => {
                info!(purged = n, "purged published outbox events");
                n
            }
            Err(e) => {
                error!(error = %e, "purge published failed");
                0
            }
        }
    }

    /// 启动调度器，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        {
            let this = self.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                self.config.tick_interval,
                move || {
                    let this = this.clone();
                    async move {
                        this.tick().await;
                    }
                },
            ));
        }

        {
            let this = self.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                self.config.reap_interval,
                move || {
                    let this = this.clone();
                    async move {
                        this.reap().await;
                    }
                },
            ));
        }

        {
            let this = self.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                self.config.purge_interval,
                move || {
                    let this = this.clone();
                    async move {
                        this.purge().await;
                    }
                },
            ));
        }

        info!(worker_id = %self.worker_id, "outbox dispatcher started");
        DispatcherHandle { token, tasks }
    }

    async fn deliver(&self, record: &OutboxRecord) -> anyhow::Result<()> {
        let envelope = BrokerEnvelope::from(record);
        let options = DeliveryOptions::from(record);
        let timeout = self.config.confirm_timeout;

        let published = time::timeout(
            timeout,
            self.publisher.publish(
                record.exchange(),
                record.routing_key(),
                &envelope,
                &options,
            ),
        )
        .await
        .map_err(|_| anyhow::Error::from(OutboxError::ConfirmTimeout { timeout }))
        .and_then(|r| r);

        if let Err(e) = published {
            error!(id = %record.id(), error = %format!("{e:#}"), "publish failed");
            return Err(e);
        }

        if let Err(e) = self.store.mark_published(record.id()).await {
            error!(id = %record.id(), error = %e, "mark published failed");
            return Err(e.into());
        }

        Ok(())
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        // tokio 的 interval 不接受零周期
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }
}

/// 调度器运行句柄：用于优雅关闭与等待任务结束；丢弃即取消
pub struct DispatcherHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            if let Err(e) = t.await {
                error!(error = %e, "dispatcher task panicked");
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

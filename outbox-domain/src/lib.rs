//! 事务性 Outbox 与投递调度（outbox-domain）
//!
//! 领域写入与待发布事件在同一事务中落盘，再由后台调度器以“至少一次”语义投递到消息代理：
//! - 事件记录（`record`）：入队输入、存储形态与状态机
//! - 重试策略（`policy`）：指数退避与最大尝试次数
//! - 事件存储（`store`）：幂等入队、原子领取、结果落盘与锁回收，内存与 Postgres 两种实现
//! - 发布器（`publisher`）：消息代理协议与内存/日志/AMQP 实现
//! - 调度器（`dispatcher`）：tick/reap/purge 三个周期任务
//!
//! 典型用法：
//! 1. 在业务事务中调用 `TransactionalOutbox::enqueue_in_tx` 写入事件；
//! 2. 选择一个 `BrokerPublisher` 实现；
//! 3. 使用 `Dispatcher::builder()` 组装存储与发布器并 `start`；
//! 4. 进程退出前调用 `DispatcherHandle::shutdown` 与 `join`。
//!
pub mod dispatcher;
pub mod error;
pub mod policy;
pub mod publisher;
pub mod record;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, TickReport};
pub use error::{OutboxError, OutboxResult};
pub use policy::{Backoff, OutboxPolicy};
pub use publisher::{BrokerEnvelope, BrokerPublisher, DeliveryOptions};
pub use record::{NewOutboxEvent, OutboxId, OutboxRecord, OutboxStatus};
pub use store::{OutboxStore, TransactionalOutbox};

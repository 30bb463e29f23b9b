//! 内存存储 + 内存代理的完整投递流程
//!
//! `cargo run -p outbox-domain --example inmemory_dispatcher`

use anyhow::Result;
use futures_util::StreamExt;
use outbox_domain::dispatcher::{Dispatcher, DispatcherConfig};
use outbox_domain::policy::{Backoff, OutboxPolicy};
use outbox_domain::publisher::InMemoryBroker;
use outbox_domain::record::NewOutboxEvent;
use outbox_domain::store::{InMemoryOutboxStore, OutboxStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let store = InMemoryOutboxStore::with_policy(OutboxPolicy {
        max_attempts: 5,
        backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(2)),
    });
    let broker = InMemoryBroker::new(64);
    let mut consumer = broker.subscribe();

    for (id, name) in [("user-1", "Ada"), ("user-2", "Grace"), ("user-3", "Linus")] {
        store
            .enqueue(
                NewOutboxEvent::builder()
                    .aggregate_type("user")
                    .aggregate_id(id)
                    .event_type("user.created")
                    .payload(json!({ "name": name }))
                    .exchange("user-exchange")
                    .routing_key("user.created")
                    .build(),
            )
            .await?;
    }
    // 模拟代理短暂不可用
    broker.fail_next(2);

    let dispatcher = Arc::new(
        Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .publisher(Arc::new(broker.clone()))
            .config(DispatcherConfig {
                tick_interval: Duration::from_millis(100),
                ..Default::default()
            })
            .build(),
    );
    let handle = dispatcher.start();

    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(5), consumer.next()).await {
            Ok(Some(Ok(msg))) => println!(
                "consumed {} ({}) -> {}",
                msg.envelope.event_type, msg.options.message_id, msg.envelope.payload
            ),
            Ok(Some(Err(e))) => println!("consumer lagged: {e}"),
            _ => break,
        }
    }

    handle.shutdown();
    handle.join().await;

    for rec in store.snapshot()? {
        println!(
            "{} status={} attempts={}",
            rec.id(),
            rec.status(),
            rec.attempts()
        );
    }
    Ok(())
}

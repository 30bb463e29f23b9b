use anyhow::Result as AnyResult;
use futures_util::StreamExt;
use outbox_domain::dispatcher::{Dispatcher, DispatcherConfig, TickReport};
use outbox_domain::policy::{Backoff, OutboxPolicy};
use outbox_domain::publisher::InMemoryBroker;
use outbox_domain::record::{NewOutboxEvent, OutboxId, OutboxStatus};
use outbox_domain::store::{InMemoryOutboxStore, OutboxStore};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn order_created(id: &str) -> NewOutboxEvent {
    NewOutboxEvent::builder()
        .aggregate_type("order")
        .aggregate_id(id)
        .event_type("order.created")
        .payload(json!({"orderId": id, "total": 42}))
        .exchange("orders")
        .routing_key("order.created")
        .build()
}

fn fast_policy() -> OutboxPolicy {
    OutboxPolicy {
        max_attempts: 10,
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(100)),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatcher_delivers_and_retries_until_published() -> AnyResult<()> {
    let store = InMemoryOutboxStore::with_policy(fast_policy());
    let broker = InMemoryBroker::new(64);
    let mut received = broker.subscribe();

    let mut ids = HashSet::new();
    for id in ["o-1", "o-2", "o-3"] {
        ids.insert(store.enqueue(order_created(id)).await?.unwrap().id());
    }
    // 第一次投递失败，走退避重试
    broker.fail_next(1);

    let dispatcher = Arc::new(
        Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .publisher(Arc::new(broker.clone()))
            .config(DispatcherConfig {
                tick_interval: Duration::from_millis(30),
                reap_interval: Duration::from_millis(100),
                purge_interval: Duration::from_millis(200),
                ..Default::default()
            })
            .worker_id("it-worker")
            .build(),
    );

    let handle = dispatcher.start();
    // 使用 timeout + 条件轮询，减少固定 sleep 的脆弱性
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let done = store
                .snapshot()
                .map(|all| all.iter().all(|r| r.status() == OutboxStatus::Published))
                .unwrap_or(false);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    handle.shutdown();
    handle.join().await;

    let records = store.snapshot()?;
    assert!(records.iter().all(|r| r.status() == OutboxStatus::Published));
    assert_eq!(records.iter().filter(|r| r.attempts() == 1).count(), 1);

    let published: HashSet<OutboxId> = broker
        .published()?
        .into_iter()
        .map(|m| m.options.message_id.parse().unwrap())
        .collect();
    assert_eq!(published, ids);

    let first = received.next().await.unwrap()?;
    assert_eq!(first.exchange, "orders");
    assert_eq!(first.routing_key, "order.created");
    assert_eq!(first.envelope.event_type, "order.created");
    assert_eq!(first.envelope.aggregate.aggregate_type, "order");
    assert!(first.options.persistent);
    Ok(())
}

#[tokio::test]
async fn crashed_claim_is_redelivered_after_recovery() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::default();
    let rec = store.enqueue(order_created("o-1")).await?.unwrap();

    // 另一个实例领取后崩溃，记录停留在 publishing
    let claimed = store.claim_batch(10, "crashed@1").await?;
    assert_eq!(claimed.len(), 1);

    let dispatcher = Dispatcher::builder()
        .store(Arc::new(store.clone()))
        .publisher(Arc::new(broker.clone()))
        .config(DispatcherConfig {
            stale_lock_threshold: Duration::from_millis(10),
            ..Default::default()
        })
        .build();

    assert_eq!(dispatcher.tick().await, TickReport::default());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(dispatcher.reap().await, 1);

    let report = dispatcher.tick().await;
    assert_eq!(report.published, 1);

    let after = store.get(rec.id()).await?.unwrap();
    assert_eq!(after.status(), OutboxStatus::Published);
    assert_eq!(after.attempts(), 0);
    assert_eq!(broker.published()?.len(), 1);
    assert_eq!(broker.published()?[0].options.message_id, rec.id().to_string());
    Ok(())
}

#[tokio::test]
async fn purge_drops_nothing_within_retention() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::default();
    store.enqueue(order_created("o-1")).await?;

    let dispatcher = Dispatcher::builder()
        .store(Arc::new(store.clone()))
        .publisher(Arc::new(broker))
        .build();

    assert_eq!(dispatcher.tick().await.published, 1);
    assert_eq!(dispatcher.purge().await, 0);
    assert_eq!(store.len()?, 1);
    Ok(())
}

#[tokio::test]
async fn dropping_the_handle_stops_the_dispatcher() -> AnyResult<()> {
    let store = InMemoryOutboxStore::new();
    let broker = InMemoryBroker::default();
    let dispatcher = Arc::new(
        Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .publisher(Arc::new(broker.clone()))
            .config(DispatcherConfig {
                tick_interval: Duration::from_millis(10),
                ..Default::default()
            })
            .build(),
    );

    let handle = dispatcher.start();
    assert!(!handle.is_shutdown());
    drop(handle);
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.enqueue(order_created("late")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.published()?.is_empty());
    Ok(())
}

//! 需要真实数据库：设置 `OUTBOX_TEST_DATABASE_URL` 后运行
//! `cargo test -p outbox-domain --features postgres --test postgres_store`
#![cfg(feature = "postgres")]

use anyhow::Result as AnyResult;
use outbox_domain::record::{NewOutboxEvent, OutboxStatus};
use outbox_domain::store::{OutboxStore, PgOutboxStore, TransactionalOutbox};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

async fn connect() -> AnyResult<Option<PgOutboxStore>> {
    let Ok(url) = std::env::var("OUTBOX_TEST_DATABASE_URL") else {
        eprintln!("OUTBOX_TEST_DATABASE_URL not set, skipping");
        return Ok(None);
    };
    let store = PgOutboxStore::connect(&url, Default::default()).await?;
    store.migrate().await?;
    // 重复执行迁移应当无副作用
    store.migrate().await?;
    Ok(Some(store))
}

async fn reset(store: &PgOutboxStore) -> AnyResult<()> {
    sqlx::query("TRUNCATE outbox_events")
        .execute(store.pool())
        .await?;
    Ok(())
}

fn event(id: &str, dedupe_key: Option<&str>) -> NewOutboxEvent {
    NewOutboxEvent::builder()
        .aggregate_type("user")
        .aggregate_id(id)
        .event_type("user.created")
        .payload(json!({"name": id}))
        .exchange("user-exchange")
        .routing_key("user.created")
        .maybe_dedupe_key(dedupe_key)
        .build()
}

// 各场景共享同一张表，放在一个测试里顺序执行
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_store_lifecycle() -> AnyResult<()> {
    let Some(store) = connect().await? else {
        return Ok(());
    };

    // 幂等入队
    reset(&store).await?;
    assert!(store.enqueue(event("u-1", Some("k-1"))).await?.is_some());
    assert!(store.enqueue(event("u-1", Some("k-1"))).await?.is_none());
    assert!(store.enqueue(event("u-2", None)).await?.is_some());
    assert!(store.enqueue(event("u-3", None)).await?.is_some());

    // 并发领取互不重叠
    let mut tasks = Vec::new();
    for i in 0..6 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.claim_batch(1, &format!("worker-{i}")).await
        }));
    }
    let mut seen = HashSet::new();
    for t in tasks {
        for rec in t.await?? {
            assert_eq!(rec.status(), OutboxStatus::Publishing);
            assert!(seen.insert(rec.id()), "record claimed twice");
        }
    }
    assert_eq!(seen.len(), 3);

    // 失败重排与退避
    let id = *seen.iter().next().unwrap();
    store.reschedule(id, "broker down", 0).await?;
    let rec = store.get(id).await?.unwrap();
    assert_eq!(rec.status(), OutboxStatus::Pending);
    assert_eq!(rec.attempts(), 1);
    assert_eq!(rec.error(), Some("broker down"));
    assert!(rec.locked_by().is_none());
    assert!(store.claim_batch(10, "w").await?.is_empty());

    // 锁超时回收
    assert_eq!(
        store
            .recover_stuck_publishing(Duration::from_secs(300))
            .await?,
        0
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store
            .recover_stuck_publishing(Duration::from_millis(10))
            .await?,
        2
    );

    // 发布后不再被领取或回收
    let claimed = store.claim_batch(10, "w").await?;
    assert_eq!(claimed.len(), 2);
    for rec in &claimed {
        store.mark_published(rec.id()).await?;
    }
    assert_eq!(store.recover_stuck_publishing(Duration::ZERO).await?, 0);
    assert_eq!(store.purge_published(Duration::from_secs(3600)).await?, 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.purge_published(Duration::ZERO).await?, 2);

    reset(&store).await?;
    transactional_enqueue(&store).await
}

async fn transactional_enqueue(store: &PgOutboxStore) -> AnyResult<()> {
    let tag = uuid::Uuid::now_v7().to_string();

    let mut tx = store.pool().begin().await?;
    let rolled_back = store
        .enqueue_in_tx(&mut tx, event(&format!("rb-{tag}"), None))
        .await?
        .unwrap();
    tx.rollback().await?;
    assert!(store.get(rolled_back.id()).await?.is_none());

    let mut tx = store.pool().begin().await?;
    let committed = store
        .enqueue_in_tx(&mut tx, event(&format!("ok-{tag}"), Some(&tag)))
        .await?
        .unwrap();
    // 同一事务中的重复幂等键不会中断事务
    assert!(
        store
            .enqueue_with(&mut tx, event(&format!("ok-{tag}"), Some(&tag)))
            .await?
            .is_none()
    );
    tx.commit().await?;

    let rec = store.get(committed.id()).await?.unwrap();
    assert_eq!(rec.status(), OutboxStatus::Pending);
    assert_eq!(rec.dedupe_key(), Some(tag.as_str()));
    Ok(())
}

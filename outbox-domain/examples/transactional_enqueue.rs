//! 业务写入与事件入队同事务提交/回滚
//!
//! `cargo run -p outbox-domain --example transactional_enqueue`

use anyhow::{Result, bail};
use outbox_domain::dispatcher::Dispatcher;
use outbox_domain::publisher::LogPublisher;
use outbox_domain::record::NewOutboxEvent;
use outbox_domain::store::{InMemoryOutboxStore, InMemoryTransaction, TransactionalOutbox};
use serde_json::json;
use std::sync::Arc;

async fn register_user(
    outbox: &InMemoryOutboxStore,
    tx: &mut InMemoryTransaction,
    email: &str,
) -> Result<()> {
    outbox
        .enqueue_in_tx(
            tx,
            NewOutboxEvent::builder()
                .aggregate_type("user")
                .aggregate_id(email)
                .event_type("user.created")
                .payload(json!({ "email": email }))
                .exchange("user-exchange")
                .routing_key("user.created")
                .dedupe_key(format!("user.created:{email}"))
                .build(),
        )
        .await?;

    if !email.contains('@') {
        bail!("invalid email: {email}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let outbox = InMemoryOutboxStore::new();

    for email in ["ada@example.com", "not-an-email"] {
        let mut tx = outbox.begin();
        match register_user(&outbox, &mut tx, email).await {
            Ok(()) => {
                outbox.commit(tx)?;
                println!("committed {email}");
            }
            // 事务被丢弃，事件随之回滚
            Err(e) => println!("rolled back: {e}"),
        }
    }
    println!("outbox holds {} event(s)", outbox.len()?);

    let dispatcher = Dispatcher::builder()
        .store(Arc::new(outbox.clone()))
        .publisher(Arc::new(LogPublisher::new()))
        .build();
    let report = dispatcher.tick().await;
    println!("{report:?}");
    Ok(())
}

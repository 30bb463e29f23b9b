//! Outbox 中继进程：按配置组装存储与发布器，运行调度器直到收到退出信号
//!
//! `outbox-relay [config.yaml]`

mod settings;

use anyhow::{Context, Result};
use outbox_domain::dispatcher::Dispatcher;
use outbox_domain::policy::OutboxPolicy;
use outbox_domain::publisher::{BrokerPublisher, LogPublisher};
use outbox_domain::store::{InMemoryOutboxStore, OutboxStore};
use settings::{BrokerKind, RelaySettings, StoreKind};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("OUTBOX_RELAY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_store(settings: &RelaySettings, policy: OutboxPolicy) -> Result<Arc<dyn OutboxStore>> {
    match settings.store.kind {
        StoreKind::Memory => {
            warn!("using in-memory outbox store, events do not survive a restart");
            Ok(Arc::new(InMemoryOutboxStore::with_policy(policy)))
        }
        #[cfg(feature = "postgres")]
        StoreKind::Postgres => {
            let url = settings
                .store
                .url
                .as_deref()
                .context("store.url is required for postgres")?;
            let store = outbox_domain::store::PgOutboxStore::connect(url, policy)
                .await
                .context("failed to connect to postgres")?;
            store.migrate().await.context("failed to migrate outbox schema")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreKind::Postgres => {
            anyhow::bail!("store.kind is postgres but outbox-relay was built without the `postgres` feature")
        }
    }
}

async fn build_publisher(settings: &RelaySettings) -> Result<Arc<dyn BrokerPublisher>> {
    match settings.broker.kind {
        BrokerKind::Log => Ok(Arc::new(LogPublisher::new())),
        #[cfg(feature = "amqp")]
        BrokerKind::Amqp => {
            use outbox_domain::publisher::{AmqpConfig, AmqpPublisher};

            let url = settings
                .broker
                .url
                .as_deref()
                .context("broker.url is required for amqp")?;
            let publisher = AmqpPublisher::connect(AmqpConfig::new(url))
                .await
                .context("failed to connect to AMQP broker")?;
            Ok(Arc::new(publisher))
        }
        #[cfg(not(feature = "amqp"))]
        BrokerKind::Amqp => {
            anyhow::bail!("broker.kind is amqp but outbox-relay was built without the `amqp` feature")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = std::env::args().nth(1);
    let settings = RelaySettings::load(path.as_deref()).context("failed to load relay settings")?;

    let store = build_store(&settings, settings.outbox_policy()).await?;
    let publisher = build_publisher(&settings).await?;

    let dispatcher = Arc::new(
        Dispatcher::builder()
            .store(store)
            .publisher(publisher)
            .config(settings.dispatcher_config())
            .maybe_worker_id(settings.dispatcher.worker_id.clone())
            .build(),
    );

    info!(
        worker_id = dispatcher.worker_id(),
        store = ?settings.store.kind,
        broker = ?settings.broker.kind,
        "starting outbox relay"
    );
    let handle = dispatcher.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown signal received, stopping dispatcher");
    handle.shutdown();
    handle.join().await;
    Ok(())
}

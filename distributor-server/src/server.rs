use std::collections::HashMap;
use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use time::OffsetDateTime;

use distributor::clientpool::{spawn_pool_pruner, ClientFactory, PrintClient, PushClient};
use distributor::distributor::{Distributor, DistributorConfig};
use distributor::kv::{KvStore, MemoryKvStore};
use distributor::lifecycle::{Lifecycler, LifecyclerConfig, DISTRIBUTOR_RING_KEY};
use distributor::ring::{
    generate_tokens, InstanceDesc, InstanceState, ReadRing, Ring, INGESTER_RING_KEY,
    DEFAULT_TOKENS_PER_INSTANCE,
};
use distributor::router;
use distributor::validation::{IngestionRateStrategy, Limits, Overrides};

use crate::config::Config;

const RING_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const POOL_PRUNE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()>,
{
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::default());
    seed_ingester_ring(&config, kv.as_ref()).await;

    // The statically-configured ingester ring never heartbeats, so its
    // staleness check is disabled.
    let ingesters_ring: Arc<dyn ReadRing> = Arc::new(
        Ring::new(
            Arc::clone(&kv),
            INGESTER_RING_KEY,
            config.replication_factor,
            time::Duration::ZERO,
            RING_POLL_INTERVAL,
        )
        .await,
    );

    let strategy: IngestionRateStrategy = config
        .rate_limit_strategy
        .parse()
        .expect("invalid rate limit strategy");

    let (distributors_ring, lifecycler) = if strategy == IngestionRateStrategy::Global {
        let lifecycler = Lifecycler::new(
            LifecyclerConfig {
                ring_key: DISTRIBUTOR_RING_KEY.to_string(),
                instance_id: config.instance_id.clone(),
                instance_addr: config.instance_addr.clone(),
                num_tokens: DEFAULT_TOKENS_PER_INSTANCE,
                heartbeat_period: std::time::Duration::from_secs(config.heartbeat_period_secs),
            },
            Arc::clone(&kv),
        );
        lifecycler
            .start()
            .await
            .expect("failed to join distributor ring");
        let ring: Arc<dyn ReadRing> = Arc::new(
            Ring::new(
                Arc::clone(&kv),
                DISTRIBUTOR_RING_KEY,
                1,
                time::Duration::seconds(config.heartbeat_timeout_secs),
                RING_POLL_INTERVAL,
            )
            .await,
        );
        (Some(ring), Some(lifecycler))
    } else {
        (None, None)
    };

    let overrides = Arc::new(Overrides::new(
        default_limits(&config, strategy),
        tenant_overrides(&config),
    ));

    // The push transport to real ingesters is deployment-specific and
    // injected here; this binary ships the logging client.
    let factory: ClientFactory =
        Arc::new(|addr| Ok(Arc::new(PrintClient::new(addr)) as Arc<dyn PushClient>));

    let distributor = Arc::new(
        Distributor::new(
            DistributorConfig {
                remote_timeout: std::time::Duration::from_millis(config.remote_timeout_ms),
                ..DistributorConfig::default()
            },
            overrides,
            Arc::clone(&ingesters_ring),
            distributors_ring,
            factory,
        )
        .expect("failed to create distributor"),
    );

    let _pruner = spawn_pool_pruner(
        distributor.pool(),
        Arc::clone(&ingesters_ring),
        POOL_PRUNE_INTERVAL,
    );

    let app = router::router(Arc::clone(&distributor), config.export_metrics);

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::Server::from_tcp(listener)
        .unwrap()
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();

    if let Some(lifecycler) = lifecycler {
        if let Err(err) = lifecycler.shutdown().await {
            tracing::warn!(error = %err, "failed to leave distributor ring");
        }
    }
}

async fn seed_ingester_ring(config: &Config, kv: &dyn KvStore) {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for (i, addr) in config
        .ingester_addresses
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .enumerate()
    {
        kv.update_instance(
            INGESTER_RING_KEY,
            InstanceDesc {
                id: format!("ingester-{i}"),
                addr: addr.to_string(),
                tokens: generate_tokens(DEFAULT_TOKENS_PER_INSTANCE),
                state: InstanceState::Active,
                heartbeat: now,
            },
        )
        .await
        .expect("failed to seed ingester ring");
    }
}

fn default_limits(config: &Config, strategy: IngestionRateStrategy) -> Limits {
    Limits {
        ingestion_rate_strategy: strategy,
        ingestion_rate_bytes: config.ingestion_rate_bytes,
        ingestion_burst_bytes: config.ingestion_burst_bytes,
        ..Limits::default()
    }
}

fn tenant_overrides(config: &Config) -> HashMap<String, Limits> {
    serde_json::from_str(&config.tenant_overrides).expect("invalid tenant overrides JSON")
}

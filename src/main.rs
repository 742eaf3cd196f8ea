//! fulcrum-registry service binary.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use registry_store::{create_store, RedisConfig, StoreBackend, StoreFactoryConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use registry::bus::{BusSubscriber, MessageHandler, RedisPublisher};
use registry::config::{HeartbeatConfig, RegistryConfig, RouteConfig};
use registry::RegistryService;

#[derive(Parser, Debug)]
#[command(name = "fulcrum-registry", version, about = "Fulcrum fleet registry and routing coordinator")]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "FULCRUM_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Redis connection pool size
    #[arg(long, env = "FULCRUM_REDIS_POOL", default_value_t = 16)]
    redis_pool: usize,

    /// Key prefix for everything the registry writes
    #[arg(long, env = "FULCRUM_KEY_PREFIX", default_value = "registry")]
    key_prefix: String,

    /// Sender identity on published messages
    #[arg(long, env = "FULCRUM_IDENTITY", default_value = "fulcrum-registry")]
    identity: String,

    /// Seconds between staleness scans
    #[arg(long, env = "FULCRUM_HEARTBEAT_SCAN_SECS", default_value_t = 5)]
    heartbeat_scan_secs: u64,

    /// Seconds of silence before an entity is parked as unavailable
    #[arg(long, env = "FULCRUM_HEARTBEAT_TIMEOUT_SECS", default_value_t = 30)]
    heartbeat_timeout_secs: u64,

    /// Seconds an unavailable entity is retained before release
    #[arg(long, env = "FULCRUM_RECLAIM_WINDOW_SECS", default_value_t = 900)]
    reclaim_window_secs: u64,

    /// Placement attempts before a route request fails
    #[arg(long, env = "FULCRUM_ROUTE_MAX_RETRIES", default_value_t = 5)]
    route_max_retries: u32,

    /// Seconds a placement request may wait before failing
    #[arg(long, env = "FULCRUM_ROUTE_WAIT_SECS", default_value_t = 20)]
    route_wait_secs: u64,

    /// Bound on concurrently handled bus messages
    #[arg(long, env = "FULCRUM_WORKER_PERMITS", default_value_t = 32)]
    worker_permits: usize,

    /// Emit logs as JSON
    #[arg(long, env = "FULCRUM_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

impl Cli {
    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            identity: self.identity.clone(),
            heartbeat: HeartbeatConfig {
                scan_interval_secs: self.heartbeat_scan_secs,
                timeout_secs: self.heartbeat_timeout_secs,
                reclaim_window_secs: self.reclaim_window_secs,
            },
            route: RouteConfig {
                max_retries: self.route_max_retries,
                wait_threshold_secs: self.route_wait_secs,
                ..Default::default()
            },
            worker_permits: self.worker_permits,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.registry_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid registry configuration")?;

    let store = create_store(StoreFactoryConfig {
        backend: StoreBackend::Redis,
        redis: RedisConfig {
            url: cli.redis_url.clone(),
            pool_max: cli.redis_pool,
            key_prefix: cli.key_prefix.clone(),
        },
    })
    .context("failed to build store")?;

    let publisher = Arc::new(
        RedisPublisher::connect(&cli.redis_url)
            .await
            .context("failed to connect publisher")?,
    );

    let service = RegistryService::new(config.clone(), store, publisher);
    service.restore().await.context("failed to restore registry")?;

    let cancel = CancellationToken::new();
    let monitor = service.monitor(cancel.clone()).spawn();

    let handler: Arc<dyn MessageHandler> = service.clone();
    let subscriber = BusSubscriber::new(
        cli.redis_url,
        config.identity.clone(),
        handler,
        config.worker_permits,
        cancel.clone(),
    )
    .spawn();

    info!(identity = %config.identity, "Registry service running");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutting down");

    cancel.cancel();
    let _ = monitor.await;
    let _ = subscriber.await;
    Ok(())
}

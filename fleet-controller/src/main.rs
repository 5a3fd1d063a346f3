//! fleet-controller: sentinel and adapter workers for the fleet API.
//!
//! The sentinel polls the API and publishes reconcile events; each adapter
//! config gets its own subscription and worker pool. Both halves share an
//! in-process broker, so `--sentinel-only` and `--adapters-only` are mainly
//! useful for running one half against a stub.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_core::{LabelSelector, ResourceKind};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_controller::{
    Adapter, AdapterConfig, Broker, DecisionConfig, HttpResourceClient, MemoryBroker,
    ResourceClient, Sentinel, SentinelConfig, WorkerConfig, run_worker,
};

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_target(s: &str) -> Result<(ResourceKind, String), String> {
    let (kind, id) = s
        .split_once('/')
        .filter(|(_, id)| !id.is_empty())
        .ok_or_else(|| format!("expected KIND/ID, got '{s}'"))?;
    let kind = kind.parse::<ResourceKind>().map_err(|e| e.to_string())?;
    Ok((kind, id.to_string()))
}

/// Fleet controller
#[derive(Parser, Debug)]
#[command(name = "fleet-controller", version, about)]
struct Args {
    /// Fleet API endpoint
    #[arg(long, env = "FLEET_API_ENDPOINT", default_value = "http://[::1]:8080")]
    api_endpoint: String,

    /// How often the sentinel lists resources
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    poll_interval: Duration,

    /// Re-reconcile interval for Ready resources
    #[arg(long, default_value = "30m", value_parser = parse_duration)]
    backoff_ready: Duration,

    /// Re-reconcile interval for resources that are not Ready
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    backoff_not_ready: Duration,

    /// Resource kinds the sentinel watches (can be repeated, default: all)
    #[arg(long)]
    resource_kind: Vec<ResourceKind>,

    /// Label selector restricting the sentinel to a shard, e.g. shard=a
    #[arg(long, default_value = "")]
    selector: LabelSelector,

    /// Broker topic for reconcile events
    #[arg(long, default_value = "fleet.reconcile")]
    topic: String,

    /// Adapter config file (can be repeated)
    #[arg(long, env = "FLEET_ADAPTER_CONFIGS", value_delimiter = ',')]
    adapter_config: Vec<PathBuf>,

    /// Events in flight per adapter, and publishes in flight per sentinel tick
    #[arg(long, default_value_t = 100)]
    max_concurrency: usize,

    /// Time an adapter may spend on one event before it is redelivered
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    ack_deadline: Duration,

    /// Envelope source name (defaults to hostname)
    #[arg(long)]
    source: Option<String>,

    /// Publish a manual reconcile event for KIND/ID at start-up (can be repeated)
    #[arg(long, value_parser = parse_target, conflicts_with = "adapters_only")]
    reconcile: Vec<(ResourceKind, String)>,

    /// Run only the sentinel
    #[arg(long, conflicts_with = "adapters_only")]
    sentinel_only: bool,

    /// Run only the adapters
    #[arg(long)]
    adapters_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fleet_controller=info,fleet_core=info,reqwest=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let source = args.source.unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let kinds = if args.resource_kind.is_empty() {
        ResourceKind::ALL.to_vec()
    } else {
        args.resource_kind
    };

    info!("Starting fleet-controller: {}", source);
    info!("API endpoint: {}", args.api_endpoint);

    let client: Arc<dyn ResourceClient> = Arc::new(
        HttpResourceClient::new(&args.api_endpoint).context("Failed to build API client")?,
    );
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if !args.sentinel_only {
        if args.adapter_config.is_empty() {
            warn!("No --adapter-config given, no adapters will run");
        }
        let worker_config = WorkerConfig {
            max_concurrency: args.max_concurrency,
            ack_deadline: args.ack_deadline,
        };
        // Subscribe before the sentinel starts so no early event is dropped.
        for path in &args.adapter_config {
            let config = AdapterConfig::load(path)
                .with_context(|| format!("Failed to load adapter config {}", path.display()))?;
            let subscription = broker
                .subscribe(&args.topic, &config.name)
                .await
                .with_context(|| format!("Failed to subscribe adapter {}", config.name))?;
            info!(
                adapter = %config.name,
                kinds = ?config.resource_kinds,
                "Loaded adapter from {}",
                path.display()
            );
            let adapter = Arc::new(Adapter::new(Arc::new(config), Arc::clone(&client)));
            tasks.spawn(run_worker(
                adapter,
                subscription,
                worker_config,
                shutdown_rx.clone(),
            ));
        }
    }

    if !args.adapters_only {
        let sentinel = Sentinel::new(
            Arc::clone(&client),
            Arc::clone(&broker),
            SentinelConfig {
                topic: args.topic.clone(),
                source,
                kinds,
                selector: args.selector,
                poll_interval: args.poll_interval,
                decision: DecisionConfig {
                    backoff_ready: args.backoff_ready,
                    backoff_not_ready: args.backoff_not_ready,
                    poll_interval: args.poll_interval,
                },
                max_concurrency: args.max_concurrency,
            },
        );
        for (kind, id) in &args.reconcile {
            if let Err(e) = sentinel.trigger(*kind, id).await {
                warn!(%kind, resource_id = %id, "Manual reconcile failed: {e}");
            }
        }
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { sentinel.run(shutdown).await });
    }

    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);
    broker.close(&args.topic).await;
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

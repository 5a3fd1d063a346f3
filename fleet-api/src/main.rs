use anyhow::Context;
use clap::Parser;
use fleet_core::ResourceKind;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_api::rest::{AppState, create_router};
use fleet_api::{
    DEFAULT_HISTORY_LIMIT, DataStore, FleetState, MemoryStore, RequiredAdapters,
    create_audit_logger,
};

#[derive(Parser)]
#[command(name = "fleet-api")]
#[command(about = "Fleet API - resource store and adapter status aggregation")]
struct Args {
    /// Listen address for the REST API
    #[arg(short, long, env = "FLEET_API_LISTEN", default_value = "[::]:8080")]
    listen: String,

    /// Adapter that must report before a kind is Available (format: kind=name, can be repeated)
    #[arg(long, env = "FLEET_API_REQUIRED_ADAPTERS", value_delimiter = ',', value_parser = parse_required_adapter)]
    required_adapter: Vec<(ResourceKind, String)>,

    /// Number of status reports kept per resource
    #[arg(long, env = "FLEET_API_HISTORY_LIMIT", default_value_t = DEFAULT_HISTORY_LIMIT)]
    history_limit: usize,
}

fn parse_required_adapter(s: &str) -> Result<(ResourceKind, String), String> {
    let (kind, name) = s
        .split_once('=')
        .ok_or("Expected format: kind=name".to_string())?;
    let kind: ResourceKind = kind.parse().map_err(|e| format!("{e}"))?;
    if name.is_empty() {
        return Err("Adapter name must not be empty".to_string());
    }
    Ok((kind, name.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fleet_api=info".parse()?)
                .add_directive("audit=info".parse()?)
                .add_directive("tower=warn".parse()?)
                .add_directive("hyper=warn".parse()?),
        )
        .init();

    let args = Args::parse();

    let required: RequiredAdapters = args.required_adapter.into_iter().collect();
    for kind in ResourceKind::ALL {
        let adapters = required.for_kind(kind);
        if adapters.is_empty() {
            info!("{kind}: no required adapters, aggregating over reporting adapters");
        } else {
            info!("{kind}: required adapters {}", adapters.join(", "));
        }
    }

    let store = Arc::new(MemoryStore::new(FleetState::new(
        required,
        args.history_limit,
    )));
    let audit = create_audit_logger();

    // Trace state changes
    let mut events = store.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    event = event.name(),
                    resource_id = event.resource_id(),
                    "store event"
                ),
                Err(RecvError::Lagged(n)) => warn!("Event listener lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let app_state = Arc::new(AppState { store, audit });
    let router = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("REST API listening on {}", args.listen);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let rest_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
    });

    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);
    rest_handle.await??;

    info!("Shutdown complete");
    Ok(())
}

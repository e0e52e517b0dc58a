use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kvproxy::{
    AdminState, Coordinator, FileRouteSource, InMemoryConnector, MemcacheConnector,
    NodeConnector, Operation, ProxyConfig, RouteSource, admin_router, spawn_route_poller,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvproxy")]
#[command(about = "Replica-aware routing proxy for a key-value storage cluster")]
struct Cli {
    /// Directory holding proxy.yaml and the route file
    #[arg(long, default_value = "conf")]
    config: PathBuf,

    /// Serve from in-memory nodes and drive a small synthetic workload
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = ProxyConfig::load_dir(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let route_path = config.route_path(&cli.config);
    let source: Arc<dyn RouteSource> = Arc::new(FileRouteSource::new(&route_path));
    let route_text = source
        .fetch()
        .await
        .with_context(|| format!("failed to read route file {}", route_path.display()))?;

    let connector: Arc<dyn NodeConnector> = if cli.demo {
        info!("node backend: in-memory demo nodes");
        Arc::new(InMemoryConnector::new())
    } else {
        info!("node backend: memcache");
        Arc::new(MemcacheConnector::new(config.pool_config()))
    };

    let coordinator = Arc::new(
        Coordinator::new(&route_text, connector, config.coordinator_options())
            .await
            .context("failed to apply initial route")?,
    );
    info!(
        version = coordinator.last_applied_version(),
        nodes = coordinator.current().table().nodes().len(),
        "routing initialized"
    );

    let poller = config
        .poll_interval()
        .map(|interval| spawn_route_poller(coordinator.clone(), source.clone(), interval));
    let workload = cli.demo.then(|| tokio::spawn(demo_workload(coordinator.clone())));

    let addr = config.web_addr();
    let app = admin_router(AdminState::new(coordinator.clone(), config, source));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(address = %addr, "admin server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(poller) = poller {
        poller.abort();
    }
    if let Some(workload) = workload {
        workload.abort();
    }
    coordinator.shutdown().await;
    info!("kvproxy stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to install Ctrl+C signal handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn demo_workload(coordinator: Arc<Coordinator>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut round: u64 = 0;
    loop {
        ticker.tick().await;
        round += 1;
        let key = format!("demo:{}", round % 64);
        let op = if round % 4 == 0 {
            Operation::Set(round.to_string().into_bytes())
        } else {
            Operation::Get
        };
        match coordinator.dispatch(&key, op).await {
            Ok(reply) => debug!(key = %key, ?reply, "demo request served"),
            Err(err) => warn!(key = %key, error = %err, "demo request failed"),
        }
    }
}

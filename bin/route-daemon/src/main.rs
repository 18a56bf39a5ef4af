use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use route_core::{NodeFacts, Planner, Reconciler, ReconcilerHandle};
use route_host::{CalicoCmd, IpHost};
use route_kube::watch::watch_routes;
use route_kube::KubeClient;

mod config;

use config::DaemonArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();
    setup_subscriber(args.log_json);

    info!("Starting route-daemon...");
    let config = args.node_config()?;

    let host = Arc::new(IpHost::new());
    let calico = CalicoCmd::new();
    let facts = NodeFacts::discover(host.as_ref(), &calico, args.pod_ip, &config).await?;
    if facts.tunnel_present {
        info!("Routes over {} found, tunnel routes will be managed", config.tunnel_device);
    }

    let reconciler = Reconciler::new(Planner::new(facts, config), host);
    let (handle, events) = ReconcilerHandle::channel();
    let mut reconciler_task = tokio::spawn(reconciler.run(events));

    let client = KubeClient::new(&args.namespace).await?;
    let name = args.config_map_name();
    let watch_handle = handle.clone();
    let watch_task = tokio::spawn(async move {
        if let Err(e) = watch_routes(&client, &name, watch_handle).await {
            error!("Routes ConfigMap watch stopped: {}", e);
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, removing routes...");
            watch_task.abort();
            match handle.shutdown().await {
                Ok(report) => info!(
                    "Routes removed: {} applied, {} skipped, {} failed",
                    report.applied, report.skipped, report.failed
                ),
                Err(e) => error!("Route cleanup did not run: {}", e),
            }
            Ok(())
        }
        result = &mut reconciler_task => {
            watch_task.abort();
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("ERROR: {}", e);
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

fn setup_subscriber(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "route_daemon=info,route_core=info,route_host=info,route_kube=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("captured ctrl_c signal"),
        _ = terminate => info!("captured SIGTERM"),
    }
}

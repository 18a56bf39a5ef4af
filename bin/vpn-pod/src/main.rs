use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use route_core::{Applier, IpPools, Placement, SnatSignal, TopologyProvider};
use route_host::{CalicoCmd, IpHost};
use route_kube::KubeClient;

mod config;

use config::PodArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = PodArgs::parse();
    setup_subscriber(args.log_json);

    info!("Starting vpn-pod...");
    let calico = Arc::new(CalicoCmd::new());
    let mut pools = IpPools::new(calico.clone());

    let outcome = tokio::select! {
        result = configure(&args, calico.as_ref(), &mut pools) => Some(result),
        _ = shutdown_signal() => None,
    };
    let result = match outcome {
        Some(Ok(())) => {
            info!("VPN pod routing is configured");
            shutdown_signal().await;
            Ok(())
        }
        Some(Err(e)) => {
            error!("ERROR: {:#}", e);
            Err(e)
        }
        None => {
            info!("Shutdown signal received during setup");
            Ok(())
        }
    };

    pools.cleanup().await;
    info!("Exiting vpn-pod");
    result
}

/// Work out the placement, prepare NAT and IP pools, publish the routes record
/// and wait for this node's SNAT rule when connecting through the load balancer
async fn configure(args: &PodArgs, calico: &CalicoCmd, pools: &mut IpPools<CalicoCmd>) -> Result<()> {
    let settings = args.pod_settings()?;
    let client = KubeClient::new(&args.namespace).await?;

    info!("Set up routing through the VPN pod");
    info!("   vpn pod name: {}", args.pod_name);
    let pod = client.pod_info(&args.pod_name).await?;
    info!("   vpn pod ip: {}", pod.pod_ip);
    info!("   worker node private ip: {}", pod.host_ip);

    let load_balancer_ip = client
        .load_balancer_ip(&args.service_name(), &args.load_balancer_request())
        .await?;
    info!("   load balancer ip: {}", load_balancer_ip);

    let worker_subnet = calico.node_subnet(pod.host_ip).await?;
    info!("   worker subnet: {}", worker_subnet);
    let vpn_pod_device = calico.pod_interface().await?;
    info!("   vpn pod device name: {}", vpn_pod_device);

    let placement = Placement {
        vpn_pod_name: args.pod_name.clone(),
        vpn_pod_ip: pod.pod_ip,
        vpn_pod_device,
        worker_node_ip: pod.host_ip,
        worker_subnet,
        load_balancer_ip,
        connect_using_lb: args.connect_using_lb(),
    };
    settings.validate_placement(&placement)?;
    let record = settings.route_record(&placement);
    let connect_using_lb = record.connects_using_lb();
    info!("   route table: {}", record.route_table);

    let nat_plan = settings.subnet_nat_plan();
    if !nat_plan.is_empty() {
        let report = Applier::new(Arc::new(IpHost::new())).apply(&nat_plan).await;
        if report.failed > 0 {
            warn!("{} subnet NAT rules failed to apply", report.failed);
        }
    }

    pools.create(&settings.pool_subnets(placement.vpn_pod_ip, connect_using_lb)).await?;

    let signal = if connect_using_lb {
        info!("   creating a TCP listener so that route daemon can inform us when SNAT rule is in place");
        Some(SnatSignal::bind(args.signal_port).await?)
    } else {
        None
    };

    info!("   updating config map: {}", args.config_map_name());
    client.publish_routes(&args.config_map_name(), &record).await?;

    if let Some(signal) = signal {
        signal.wait().await?;
    }
    Ok(())
}

fn setup_subscriber(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vpn_pod=info,route_core=info,route_host=info,route_kube=info".into());
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

//! Consul register controller
//!
//! Watches Kubernetes pods, endpoints or services (selectable via
//! configuration) and keeps matching service entries registered in one
//! or more Consul agents. Periodic sweeps reconcile in both directions:
//! `sync` registers anything the event stream missed, `clean` removes
//! owner-tagged entries whose source object is gone.

mod config;
mod consul;
mod controller;
mod error;
mod metrics;

use crate::config::ControllerConfig;
use crate::consul::{AgentFactory, HttpAgentFactory};
use crate::error::ControllerError;
use crate::metrics::ControllerMetrics;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "consul-register", version, about = "Registers Kubernetes workloads in Consul")]
struct Args {
    /// Namespace to watch for pods. Empty watches all namespaces.
    #[arg(long = "watch-namespace", default_value = "")]
    watch_namespace: String,

    /// Absolute path to the kubeconfig file (used with --in-cluster=false).
    #[arg(long, default_value = "./kubeconfig")]
    kubeconfig: String,

    /// Name of the ConfigMap with the controller configuration, as namespace/name.
    #[arg(long, default_value = "default/consul-register-config")]
    configmap: String,

    /// Use the in-cluster config. Keep enabled when the controller runs
    /// inside the cluster.
    #[arg(long = "in-cluster", default_value_t = true, action = clap::ArgAction::Set)]
    in_cluster: bool,

    /// Seconds between synchronization sweeps.
    #[arg(long = "sync-interval", default_value_t = 120)]
    sync_interval: u64,

    /// Seconds between cleaning sweeps for inactive services.
    #[arg(long = "clean-interval", default_value_t = 1800)]
    clean_interval: u64,

    /// Address to listen on for HTTP metric requests.
    #[arg(long = "metrics-listen-address", default_value = "0.0.0.0:8080")]
    metrics_listen_address: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    info!("Using build: {}", env!("CARGO_PKG_VERSION"));

    let kube_client = build_kube_client(&args).await?;

    let (cm_namespace, cm_name) = config::parse_ns_name(&args.configmap)?;
    // Boot must not fail on a slow API server or a ConfigMap that is
    // still being rolled out; keep retrying until it loads.
    let cfg = loop {
        match ControllerConfig::load(&kube_client, &cm_namespace, &cm_name).await {
            Ok(cfg) => break Arc::new(cfg),
            Err(e) => {
                error!("Unable to load configuration: {}", e);
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    };
    info!("Current configuration: {:?}", cfg);

    let metrics = ControllerMetrics::new()?;
    let factory: Arc<dyn AgentFactory> = Arc::new(HttpAgentFactory::new(cfg.clone()));
    let namespace = if args.watch_namespace.is_empty() {
        None
    } else {
        Some(args.watch_namespace.clone())
    };

    let reconciler =
        controller::new_reconciler(kube_client, factory, cfg, namespace, metrics.clone());

    let clean_task = {
        let reconciler = reconciler.clone();
        let interval = Duration::from_secs(args.clean_interval);
        tokio::spawn(async move {
            loop {
                info!("Start cleaning...");
                match reconciler.clean().await {
                    Ok(()) => info!("Cleaning has been ended"),
                    Err(e) => error!("Unable to clean inactive services: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    let sync_task = {
        let reconciler = reconciler.clone();
        let interval = Duration::from_secs(args.sync_interval);
        tokio::spawn(async move {
            loop {
                info!("Start syncing...");
                match reconciler.sync().await {
                    Ok(()) => info!("Synchronization's been ended"),
                    Err(e) => error!("Unable to sync: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    let watch_task = tokio::spawn(reconciler.clone().watch());

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ControllerError::Serve(format!("cannot install SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| ControllerError::Serve(format!("cannot install SIGINT handler: {}", e)))?;

    tokio::select! {
        result = metrics::serve(metrics.registry().clone(), args.metrics_listen_address) => {
            result?;
        }
        result = watch_task => {
            match result {
                Ok(Ok(())) => error!("Watcher exited unexpectedly"),
                Ok(Err(e)) => error!("Watcher failed: {}", e),
                Err(e) => error!("Watcher task panicked: {}", e),
            }
            return Err(ControllerError::Watch("watcher exited".to_string()));
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    clean_task.abort();
    sync_task.abort();
    info!("Exiting with 0");
    Ok(())
}

async fn build_kube_client(args: &Args) -> Result<Client, ControllerError> {
    let config = if args.in_cluster {
        Config::incluster().map_err(|e| {
            ControllerError::InvalidConfig(format!("error configuring in-cluster client: {}", e))
        })?
    } else {
        let kubeconfig = Kubeconfig::read_from(&args.kubeconfig).map_err(|e| {
            ControllerError::InvalidConfig(format!(
                "cannot read kubeconfig {}: {}",
                args.kubeconfig, e
            ))
        })?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                ControllerError::InvalidConfig(format!("error configuring the client: {}", e))
            })?
    };
    Ok(Client::try_from(config)?)
}

//! RabbitMQ Cluster Kubernetes Operator
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! rabbitmq-cluster-operator
//!
//! # Watch a single namespace with plain-text debug logs
//! RUST_LOG=debug rabbitmq-cluster-operator --namespace messaging --log-json false
//! ```

use clap::Parser;
use kube::Client;
use rabbitmq_cluster_operator::leader_election::{self, LeaderElector};
use rabbitmq_cluster_operator::{Args, ClusterController, OperatorConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = OperatorConfig::try_from(&args)?;

    info!(
        leader_election = args.leader_election,
        namespace = %config.namespace.as_deref().unwrap_or("all"),
        workers = config.workers,
        "Starting RabbitMQ Cluster Kubernetes Operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await;
        Some(Arc::new(elector))
    } else {
        None
    };

    let shutdown = CancellationToken::new();

    let controller = ClusterController::new(client, config);
    let mut controller_handle = tokio::spawn(controller.run(shutdown.clone()));

    let renew_handle = {
        let elector = elector.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let Some(elector) = elector else {
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(elector.renew_interval()) => {}
                }
                match elector.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease, initiating shutdown");
                        shutdown.cancel();
                        return;
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to renew leader lease, initiating shutdown");
                        shutdown.cancel();
                        return;
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {}
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Cluster controller task failed");
            }
        }
    }

    shutdown.cancel();
    if !controller_handle.is_finished() {
        if let Err(e) = controller_handle.await {
            error!(error = %e, "Cluster controller task failed during shutdown");
        }
    }
    renew_handle.abort();

    if let Some(elector) = &elector {
        elector.release().await;
    }

    info!("RabbitMQ Cluster Operator shutting down");
    Ok(())
}

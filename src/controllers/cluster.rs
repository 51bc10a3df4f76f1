//! RabbitmqCluster controller
//!
//! Wires the Kubernetes-backed platform, the reconciler and the dispatcher
//! together for the operator binary.

use super::dispatcher::Dispatcher;
use super::reconciler::Reconciler;
use crate::config::OperatorConfig;
use crate::platform::{KubePlatform, Platform};
use crate::resources::RandomSecretGenerator;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Controller for RabbitmqCluster resources
pub struct ClusterController {
    platform: Arc<dyn Platform>,
    config: OperatorConfig,
}

impl ClusterController {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let platform: Arc<dyn Platform> = Arc::new(KubePlatform::new(client, &config));
        Self { platform, config }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            namespace = %self.config.namespace.as_deref().unwrap_or("all"),
            workers = self.config.workers,
            "Starting RabbitmqCluster controller"
        );

        let reconciler = Arc::new(Reconciler::new(
            self.platform.clone(),
            Arc::new(RandomSecretGenerator),
        ));
        Dispatcher::new(reconciler, &self.config)
            .run(self.platform, shutdown)
            .await;

        info!("RabbitmqCluster controller stopped");
    }
}

//! Resource reconciler
//!
//! One pass per cluster key: read the parent, synthesize the desired children,
//! bring each live child in line (create, update, or leave alone), then report
//! status. Every pass starts from a fresh read, so re-running after a partial
//! failure picks up where the previous attempt stopped.

use super::finalizer;
use super::status::{compute_status, failed_status, observe};
use crate::crd::{ClusterStatus, RabbitmqCluster};
use crate::error::{OperatorError, Result};
use crate::platform::{ClusterKey, Platform};
use crate::resources::{
    controller_of, merge_for_update, needs_update, secret_value, synthesize, validate,
    ApplyPolicy, ChildResource, ClusterNames, DesiredChild, ExistingSecrets, ResourceKind,
    SecretGenerator, ADMIN_PASSWORD_KEY, ADMIN_USERNAME_KEY,
};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a successful pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Children match the desired state; `changes` counts creates and updates
    Applied { changes: usize },
    /// Teardown finished and the parent was released
    Finalized,
    /// The parent no longer exists
    NotFound,
}

pub struct Reconciler {
    platform: Arc<dyn Platform>,
    generator: Arc<dyn SecretGenerator>,
}

impl Reconciler {
    pub fn new(platform: Arc<dyn Platform>, generator: Arc<dyn SecretGenerator>) -> Self {
        Self {
            platform,
            generator,
        }
    }

    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn reconcile(&self, key: &ClusterKey) -> Result<ReconcileOutcome> {
        let Some(cluster) = self.platform.get_cluster(key).await? else {
            debug!("RabbitmqCluster not found, nothing to do");
            return Ok(ReconcileOutcome::NotFound);
        };

        if cluster.metadata.deletion_timestamp.is_some() {
            if let Err(err) = finalizer::finalize(self.platform.as_ref(), &cluster).await {
                self.report_failure(&cluster, &err).await;
                return Err(err);
            }
            return Ok(ReconcileOutcome::Finalized);
        }

        let mut current = cluster;
        match self.converge(&mut current).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.report_failure(&current, &err).await;
                Err(err)
            }
        }
    }

    /// `cluster` is kept pointing at the latest stored version so that a
    /// failure report can be written against it.
    async fn converge(&self, cluster: &mut RabbitmqCluster) -> Result<ReconcileOutcome> {
        validate(&cluster.spec)?;
        let names = ClusterNames::from_cluster(cluster)?;

        *cluster = finalizer::ensure_registered(self.platform.as_ref(), cluster.clone()).await?;

        let existing = self.existing_secrets(&names).await?;
        if existing.erlang_cookie.is_none() {
            let workload = self
                .platform
                .get_child(&names.namespace, ResourceKind::StatefulSet, &names.statefulset())
                .await?;
            if workload.is_some() {
                return Err(OperatorError::IrrecoverableState(format!(
                    "secret {} is missing while StatefulSet {} exists; restore it or delete the \
                     StatefulSet so the nodes can agree on a new cookie",
                    names.erlang_cookie(),
                    names.statefulset()
                )));
            }
        }

        let desired = synthesize(cluster, &existing, self.generator.as_ref())?;
        let mut changes = 0;
        for child in desired.into_ordered() {
            if self.apply_child(cluster, &names, child).await? {
                changes += 1;
            }
        }

        let live = observe(self.platform.as_ref(), &names, cluster.spec.replicas).await?;
        let mut status = compute_status(&live, cluster.status.as_ref(), Utc::now());
        status.admin_secret_name = Some(names.admin_secret());
        status.service_name = Some(names.client_service());
        status.observed_generation = cluster.metadata.generation;
        self.write_status(cluster, status).await?;

        if changes > 0 {
            info!(changes, "Reconciled RabbitMQ cluster");
        }
        Ok(ReconcileOutcome::Applied { changes })
    }

    async fn existing_secrets(&self, names: &ClusterNames) -> Result<ExistingSecrets> {
        Ok(ExistingSecrets {
            erlang_cookie: self.get_secret(names, &names.erlang_cookie()).await?,
            admin: self.get_secret(names, &names.admin_secret()).await?,
        })
    }

    async fn get_secret(&self, names: &ClusterNames, name: &str) -> Result<Option<Secret>> {
        match self
            .platform
            .get_child(&names.namespace, ResourceKind::Secret, name)
            .await?
        {
            Some(ChildResource::Secret(secret)) => Ok(Some(secret)),
            _ => Ok(None),
        }
    }

    /// Returns whether a write was issued.
    async fn apply_child(
        &self,
        cluster: &RabbitmqCluster,
        names: &ClusterNames,
        child: DesiredChild,
    ) -> Result<bool> {
        let DesiredChild { resource, policy } = child;
        let kind = resource.kind();
        let name = resource.name().to_string();

        let Some(live) = self
            .platform
            .get_child(resource.namespace(), kind, &name)
            .await?
        else {
            info!(%kind, %name, "Creating child resource");
            self.platform.create_child(&resource).await?;
            return Ok(true);
        };

        verify_ownership(cluster, &live)?;

        if policy == ApplyPolicy::CreateOnly {
            return Ok(false);
        }
        if !needs_update(&resource, &live) {
            return Ok(false);
        }

        if let (ChildResource::Secret(desired), ChildResource::Secret(current)) = (&resource, &live) {
            if name == names.admin_secret() {
                self.sync_admin_password(names, desired, current).await?;
            }
        }

        info!(%kind, %name, "Updating child resource");
        let merged = merge_for_update(resource, &live);
        self.platform.update_child(&merged).await?;
        Ok(true)
    }

    /// A rotated password has to reach the broker before the Secret does, or
    /// clients reading the Secret are locked out. If the change fails the
    /// Secret keeps the old password and the next pass tries again.
    async fn sync_admin_password(
        &self,
        names: &ClusterNames,
        desired: &Secret,
        live: &Secret,
    ) -> Result<()> {
        let password = secret_value(desired, ADMIN_PASSWORD_KEY);
        if password == secret_value(live, ADMIN_PASSWORD_KEY) {
            return Ok(());
        }
        let (Some(username), Some(password)) = (secret_value(desired, ADMIN_USERNAME_KEY), password)
        else {
            return Ok(());
        };
        let statefulset = self
            .platform
            .get_child(&names.namespace, ResourceKind::StatefulSet, &names.statefulset())
            .await?;
        if statefulset.is_none() {
            // Nodes that have not started yet pick the password up from the
            // Secret on first boot.
            return Ok(());
        }
        let pod = format!("{}-0", names.statefulset());
        info!(%pod, user = %username, "Rotating admin password on the broker");
        self.platform
            .change_user_password(&names.namespace, &pod, &username, &password)
            .await
    }

    /// Skips the write when nothing changed, so a converged cluster costs
    /// reads only.
    async fn write_status(&self, cluster: &RabbitmqCluster, status: ClusterStatus) -> Result<()> {
        if cluster.status.as_ref() == Some(&status) {
            return Ok(());
        }
        self.platform.replace_status(cluster, &status).await
    }

    async fn report_failure(&self, cluster: &RabbitmqCluster, err: &OperatorError) {
        if err.is_conflict() {
            debug!(error = %err, "Conflict during reconcile, retrying with a fresh read");
        } else {
            warn!(error = %err, reason = err.reason(), "Reconcile failed");
        }
        let status = failed_status(err, cluster.status.as_ref(), Utc::now());
        if let Err(write_err) = self.write_status(cluster, status).await {
            debug!(error = %write_err, "Could not record failure in status");
        }
    }
}

/// A child controlled by some other object is never taken over.
fn verify_ownership(cluster: &RabbitmqCluster, live: &ChildResource) -> Result<()> {
    let Some(uid) = cluster.metadata.uid.as_deref() else {
        return Ok(());
    };
    let foreign_controller = controller_of(live.meta()).filter(|owner| owner.uid != uid);
    if let Some(owner) = foreign_controller {
        return Err(OperatorError::IrrecoverableState(format!(
            "{} {} is controlled by {} {}",
            live.kind(),
            live.name(),
            owner.kind,
            owner.name
        )));
    }
    Ok(())
}

//! Platform API seam
//!
//! The reconciler, status aggregator and finalizer only talk to the cluster
//! through [`Platform`]. [`KubePlatform`] is the production implementation;
//! tests use an in-memory one.

mod kubernetes;
#[cfg(test)]
pub(crate) mod memory;

pub use kubernetes::KubePlatform;

use crate::crd::{ClusterStatus, RabbitmqCluster};
use crate::error::Result;
use crate::resources::{ChildResource, ResourceKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use std::fmt;

/// Identifies one RabbitmqCluster; the unit of work for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_cluster(cluster: &RabbitmqCluster) -> Option<Self> {
        Some(Self::new(
            cluster.metadata.namespace.clone()?,
            cluster.metadata.name.clone()?,
        ))
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Cluster API operations used during reconciliation.
///
/// Writes that carry a resource version fail with `OperatorError::Conflict`
/// when the stored object has moved on.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<RabbitmqCluster>>;

    async fn list_clusters(&self) -> Result<Vec<ClusterKey>>;

    /// Replace the finalizer list, guarded by the cluster's resource version
    async fn set_finalizers(
        &self,
        cluster: &RabbitmqCluster,
        finalizers: Vec<String>,
    ) -> Result<RabbitmqCluster>;

    /// Overwrite the status block, guarded by the cluster's resource version
    async fn replace_status(&self, cluster: &RabbitmqCluster, status: &ClusterStatus) -> Result<()>;

    async fn get_child(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ChildResource>>;

    async fn create_child(&self, child: &ChildResource) -> Result<ChildResource>;

    /// Full replacement of an existing child; the object must carry the live
    /// resource version
    async fn update_child(&self, child: &ChildResource) -> Result<ChildResource>;

    /// Returns `false` when the object was already gone. With `uid` set the
    /// delete only succeeds against that exact object; a replacement created
    /// under the same name yields `Conflict`.
    async fn delete_child(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        uid: Option<&str>,
    ) -> Result<bool>;

    /// Number of ready addresses behind a service
    async fn ready_endpoint_addresses(&self, namespace: &str, service: &str) -> Result<usize>;

    /// Persistent volume claims matching a label selector
    async fn list_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// Same precondition semantics as [`Platform::delete_child`]
    async fn delete_claim(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<bool>;

    /// Set a broker user's password on a running node. The user database is
    /// shared across the cluster, so one node is enough.
    async fn change_user_password(
        &self,
        namespace: &str,
        pod: &str,
        username: &str,
        password: &str,
    ) -> Result<()>;

    /// Change notifications for clusters and their children, mapped to the
    /// owning cluster's key
    fn watch(&self) -> BoxStream<'static, ClusterKey>;
}

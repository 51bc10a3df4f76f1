//! Finalizer registration and ordered teardown

use crate::conditions::CLUSTER_FINALIZER;
use crate::crd::RabbitmqCluster;
use crate::error::Result;
use crate::platform::Platform;
use crate::resources::{controlled_by, controller_of, ClusterNames, PERSISTENCE_VOLUME};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

pub fn has_finalizer(cluster: &RabbitmqCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
}

/// Register the cleanup hook. Returns the cluster as stored afterwards.
pub async fn ensure_registered(
    platform: &dyn Platform,
    cluster: RabbitmqCluster,
) -> Result<RabbitmqCluster> {
    if has_finalizer(&cluster) {
        return Ok(cluster);
    }
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(CLUSTER_FINALIZER.to_string());
    info!(cluster = %cluster.name_any(), "Adding finalizer");
    platform.set_finalizers(&cluster, finalizers).await
}

/// Tear down everything the cluster owns, then release the parent.
///
/// Children go in reverse apply order so the workload stops before its
/// identity and credentials disappear. Only objects this cluster controls are
/// removed, and each delete is pinned to the uid that was checked. Every step
/// tolerates objects that are already gone; a failure leaves the finalizer in
/// place and the next pass resumes from wherever this one stopped.
#[instrument(skip_all, fields(cluster = %cluster.name_any()))]
pub async fn finalize(platform: &dyn Platform, cluster: &RabbitmqCluster) -> Result<()> {
    if !has_finalizer(cluster) {
        debug!("Finalizer already removed");
        return Ok(());
    }
    let names = ClusterNames::from_cluster(cluster)?;
    let uid = cluster.metadata.uid.as_deref().unwrap_or_default();
    info!("Cleaning up RabbitMQ cluster resources");

    for child in names.children().iter().rev() {
        let Some(live) = platform
            .get_child(&names.namespace, child.kind, &child.name)
            .await?
        else {
            continue;
        };
        if !controlled_by(live.meta(), uid) {
            warn!(kind = %child.kind, name = %child.name, "Leaving object controlled by another owner");
            continue;
        }
        if platform
            .delete_child(&names.namespace, child.kind, &child.name, live.meta().uid.as_deref())
            .await?
        {
            info!(kind = %child.kind, name = %child.name, "Deleted child resource");
        }
    }

    for claim in platform
        .list_claims(&names.namespace, &names.instance_selector())
        .await?
    {
        let name = claim.name_any();
        if !is_cluster_claim(&claim, &names, uid) {
            warn!(pvc = %name, "Leaving claim not created for this cluster");
            continue;
        }
        if platform
            .delete_claim(&names.namespace, &name, claim.metadata.uid.as_deref())
            .await?
        {
            info!(pvc = %name, "Deleted persistent volume claim");
        }
    }

    let remaining: Vec<String> = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != CLUSTER_FINALIZER)
        .cloned()
        .collect();
    platform.set_finalizers(cluster, remaining).await?;
    info!("Finalizer removed");
    Ok(())
}

/// Claims come from the StatefulSet's volume claim template, so the name is
/// `<volume>-<statefulset>-<ordinal>`. The StatefulSet controller may own them
/// through the set or one of its pods; anything else is somebody else's.
fn is_cluster_claim(claim: &PersistentVolumeClaim, names: &ClusterNames, uid: &str) -> bool {
    let statefulset = names.statefulset();
    let prefix = format!("{}-{}-", PERSISTENCE_VOLUME, statefulset);
    if !claim.name_any().starts_with(&prefix) {
        return false;
    }
    match controller_of(&claim.metadata) {
        None => true,
        Some(owner) => {
            owner.uid == uid
                || (owner.kind == "StatefulSet" && owner.name == statefulset)
                || (owner.kind == "Pod" && owner.name.starts_with(&format!("{}-", statefulset)))
        }
    }
}

//! Platform implementation backed by the Kubernetes API

use super::{ClusterKey, Platform};
use crate::config::OperatorConfig;
use crate::crd::{ClusterStatus, RabbitmqCluster};
use crate::error::{OperatorError, Result};
use crate::resources::{
    ChildResource, ResourceKind, LABEL_INSTANCE, LABEL_MANAGED_BY, MANAGER_NAME,
    RABBITMQ_CONTAINER, ROTATION_ANNOTATION,
};
use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions,
};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads the new password from stdin so it never shows up in the exec
/// request or the API server audit log.
const CHANGE_PASSWORD_SCRIPT: &str = r#"read -r password && rabbitmqctl change_password "$1" "$password""#;

/// Talks to the API server through a shared `kube::Client`
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    namespace: Option<String>,
    field_manager: String,
    watched_kinds: Vec<ResourceKind>,
}

impl KubePlatform {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            field_manager: config.field_manager.clone(),
            watched_kinds: config.watched_kinds.clone(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    /// Api scoped to the watched namespace, or cluster-wide
    fn scoped_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self.namespaced::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let namespace = obj.namespace().unwrap_or_default();
        Ok(self
            .namespaced::<K>(&namespace)
            .create(&self.post_params(), obj)
            .await?)
    }

    async fn replace<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let namespace = obj.namespace().unwrap_or_default();
        Ok(self
            .namespaced::<K>(&namespace)
            .replace(&obj.name_any(), &self.post_params(), obj)
            .await?)
    }

    async fn delete<K>(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<bool>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        match self
            .namespaced::<K>(namespace)
            .delete(name, &delete_params(uid))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn watch_clusters(&self) -> BoxStream<'static, ClusterKey> {
        let seen: Arc<Mutex<HashMap<ClusterKey, ClusterFingerprint>>> = Arc::default();
        watcher(self.scoped_api::<RabbitmqCluster>(), watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| future::ready(route_cluster_event(&seen, event)))
            .boxed()
    }

    fn watch_owned<K>(&self) -> BoxStream<'static, ClusterKey>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let config = watcher::Config::default().labels(&managed_selector());
        watcher(self.scoped_api::<K>(), config)
            .default_backoff()
            .filter_map(|event| future::ready(route_child_event(event, owner_key)))
            .boxed()
    }

    /// Endpoints inherit the service labels, so the instance label leads back
    /// to the cluster.
    fn watch_endpoints(&self) -> BoxStream<'static, ClusterKey> {
        let config = watcher::Config::default().labels(&managed_selector());
        watcher(self.scoped_api::<Endpoints>(), config)
            .default_backoff()
            .filter_map(|event| future::ready(route_child_event(event, instance_key)))
            .boxed()
    }
}

fn delete_params(uid: Option<&str>) -> DeleteParams {
    DeleteParams {
        preconditions: uid.map(|uid| Preconditions {
            uid: Some(uid.to_string()),
            resource_version: None,
        }),
        ..DeleteParams::background()
    }
}

fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, MANAGER_NAME)
}

/// The parts of a cluster whose change warrants a reconcile pass. Status-only
/// writes (including our own) are filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClusterFingerprint {
    generation: Option<i64>,
    deleting: bool,
    finalizers: Vec<String>,
    rotation: Option<String>,
}

impl ClusterFingerprint {
    fn of(cluster: &RabbitmqCluster) -> Self {
        Self {
            generation: cluster.metadata.generation,
            deleting: cluster.metadata.deletion_timestamp.is_some(),
            finalizers: cluster.finalizers().to_vec(),
            rotation: cluster.annotations().get(ROTATION_ANNOTATION).cloned(),
        }
    }
}

fn route_cluster_event(
    seen: &Mutex<HashMap<ClusterKey, ClusterFingerprint>>,
    event: std::result::Result<Event<RabbitmqCluster>, watcher::Error>,
) -> Option<ClusterKey> {
    let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
    match event {
        Ok(Event::Apply(cluster)) | Ok(Event::InitApply(cluster)) => {
            let key = ClusterKey::for_cluster(&cluster)?;
            let fingerprint = ClusterFingerprint::of(&cluster);
            if seen.get(&key) == Some(&fingerprint) {
                debug!(cluster = %key, "Ignoring status-only change");
                return None;
            }
            seen.insert(key.clone(), fingerprint);
            Some(key)
        }
        Ok(Event::Delete(cluster)) => {
            let key = ClusterKey::for_cluster(&cluster)?;
            seen.remove(&key);
            Some(key)
        }
        Ok(Event::Init) | Ok(Event::InitDone) => None,
        Err(e) => {
            warn!(error = %e, "RabbitmqCluster watch error");
            None
        }
    }
}

fn route_child_event<K>(
    event: std::result::Result<Event<K>, watcher::Error>,
    key_of: fn(&K) -> Option<ClusterKey>,
) -> Option<ClusterKey>
where
    K: Resource<DynamicType = ()>,
{
    match event {
        Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) | Ok(Event::Delete(obj)) => key_of(&obj),
        Ok(Event::Init) | Ok(Event::InitDone) => None,
        Err(e) => {
            warn!(error = %e, kind = %K::kind(&()), "Child watch error");
            None
        }
    }
}

/// Map a child to the RabbitmqCluster that controls it.
fn owner_key<K: Resource>(obj: &K) -> Option<ClusterKey> {
    let namespace = obj.meta().namespace.clone()?;
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| {
            owner.kind == RabbitmqCluster::kind(&())
                && owner.api_version == RabbitmqCluster::api_version(&())
        })
        .map(|owner| ClusterKey::new(namespace, owner.name.clone()))
}

fn instance_key<K: Resource>(obj: &K) -> Option<ClusterKey> {
    let namespace = obj.meta().namespace.clone()?;
    let instance = obj.meta().labels.as_ref()?.get(LABEL_INSTANCE)?;
    Some(ClusterKey::new(namespace, instance.clone()))
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<RabbitmqCluster>> {
        self.get_opt::<RabbitmqCluster>(&key.namespace, &key.name)
            .await
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterKey>> {
        let list = self
            .scoped_api::<RabbitmqCluster>()
            .list(&ListParams::default())
            .await?;
        Ok(list.items.iter().filter_map(ClusterKey::for_cluster).collect())
    }

    async fn set_finalizers(
        &self,
        cluster: &RabbitmqCluster,
        finalizers: Vec<String>,
    ) -> Result<RabbitmqCluster> {
        let namespace = cluster.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": cluster.resource_version(),
            }
        });
        Ok(self
            .namespaced::<RabbitmqCluster>(&namespace)
            .patch(&cluster.name_any(), &self.patch_params(), &Patch::Merge(&patch))
            .await?)
    }

    async fn replace_status(&self, cluster: &RabbitmqCluster, status: &ClusterStatus) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": { "resourceVersion": cluster.resource_version() },
            "status": status,
        });
        self.namespaced::<RabbitmqCluster>(&namespace)
            .patch_status(&cluster.name_any(), &self.patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_child(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ChildResource>> {
        Ok(match kind {
            ResourceKind::Secret => self
                .get_opt::<Secret>(namespace, name)
                .await?
                .map(ChildResource::Secret),
            ResourceKind::ConfigMap => self
                .get_opt::<ConfigMap>(namespace, name)
                .await?
                .map(ChildResource::ConfigMap),
            ResourceKind::ServiceAccount => self
                .get_opt::<ServiceAccount>(namespace, name)
                .await?
                .map(ChildResource::ServiceAccount),
            ResourceKind::Role => self
                .get_opt::<Role>(namespace, name)
                .await?
                .map(ChildResource::Role),
            ResourceKind::RoleBinding => self
                .get_opt::<RoleBinding>(namespace, name)
                .await?
                .map(ChildResource::RoleBinding),
            ResourceKind::Service => self
                .get_opt::<Service>(namespace, name)
                .await?
                .map(ChildResource::Service),
            ResourceKind::StatefulSet => self
                .get_opt::<StatefulSet>(namespace, name)
                .await?
                .map(ChildResource::StatefulSet),
        })
    }

    async fn create_child(&self, child: &ChildResource) -> Result<ChildResource> {
        Ok(match child {
            ChildResource::Secret(obj) => ChildResource::Secret(self.create(obj).await?),
            ChildResource::ConfigMap(obj) => ChildResource::ConfigMap(self.create(obj).await?),
            ChildResource::ServiceAccount(obj) => {
                ChildResource::ServiceAccount(self.create(obj).await?)
            }
            ChildResource::Role(obj) => ChildResource::Role(self.create(obj).await?),
            ChildResource::RoleBinding(obj) => ChildResource::RoleBinding(self.create(obj).await?),
            ChildResource::Service(obj) => ChildResource::Service(self.create(obj).await?),
            ChildResource::StatefulSet(obj) => ChildResource::StatefulSet(self.create(obj).await?),
        })
    }

    async fn update_child(&self, child: &ChildResource) -> Result<ChildResource> {
        Ok(match child {
            ChildResource::Secret(obj) => ChildResource::Secret(self.replace(obj).await?),
            ChildResource::ConfigMap(obj) => ChildResource::ConfigMap(self.replace(obj).await?),
            ChildResource::ServiceAccount(obj) => {
                ChildResource::ServiceAccount(self.replace(obj).await?)
            }
            ChildResource::Role(obj) => ChildResource::Role(self.replace(obj).await?),
            ChildResource::RoleBinding(obj) => {
                ChildResource::RoleBinding(self.replace(obj).await?)
            }
            ChildResource::Service(obj) => ChildResource::Service(self.replace(obj).await?),
            ChildResource::StatefulSet(obj) => {
                ChildResource::StatefulSet(self.replace(obj).await?)
            }
        })
    }

    async fn delete_child(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        uid: Option<&str>,
    ) -> Result<bool> {
        match kind {
            ResourceKind::Secret => self.delete::<Secret>(namespace, name, uid).await,
            ResourceKind::ConfigMap => self.delete::<ConfigMap>(namespace, name, uid).await,
            ResourceKind::ServiceAccount => {
                self.delete::<ServiceAccount>(namespace, name, uid).await
            }
            ResourceKind::Role => self.delete::<Role>(namespace, name, uid).await,
            ResourceKind::RoleBinding => self.delete::<RoleBinding>(namespace, name, uid).await,
            ResourceKind::Service => self.delete::<Service>(namespace, name, uid).await,
            ResourceKind::StatefulSet => self.delete::<StatefulSet>(namespace, name, uid).await,
        }
    }

    async fn ready_endpoint_addresses(&self, namespace: &str, service: &str) -> Result<usize> {
        let endpoints = self.get_opt::<Endpoints>(namespace, service).await?;
        Ok(endpoints
            .and_then(|ep| ep.subsets)
            .unwrap_or_default()
            .iter()
            .map(|subset| subset.addresses.as_ref().map_or(0, Vec::len))
            .sum())
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let claims = self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(claims.items)
    }

    async fn delete_claim(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<bool> {
        self.delete::<PersistentVolumeClaim>(namespace, name, uid)
            .await
    }

    async fn change_user_password(
        &self,
        namespace: &str,
        pod: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let command = vec![
            "sh",
            "-c",
            CHANGE_PASSWORD_SCRIPT,
            "change-password",
            username,
        ];
        let params = AttachParams::default()
            .container(RABBITMQ_CONTAINER)
            .stdin(true)
            .stdout(false)
            .stderr(false);

        let mut process = self
            .namespaced::<Pod>(namespace)
            .exec(pod, command, &params)
            .await?;
        let mut stdin = process
            .stdin()
            .ok_or_else(|| OperatorError::Transient(format!("no stdin attached to {}", pod)))?;
        let line = format!("{}\n", password);
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| OperatorError::Transient(format!("writing to {}: {}", pod, e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| OperatorError::Transient(format!("writing to {}: {}", pod, e)))?;
        drop(stdin);

        let status = process
            .take_status()
            .ok_or_else(|| OperatorError::Transient(format!("no exec status from {}", pod)))?;
        let status = tokio::time::timeout(EXEC_TIMEOUT, status)
            .await
            .map_err(|_| OperatorError::Transient(format!("password change on {} timed out", pod)))?;
        match status {
            Some(status) if status.status.as_deref() == Some("Success") => {
                info!(pod = %pod, user = %username, "Changed broker user password");
                Ok(())
            }
            Some(status) => Err(OperatorError::Transient(format!(
                "password change on {} failed: {}",
                pod,
                status.message.unwrap_or_default()
            ))),
            None => Err(OperatorError::Transient(format!(
                "password change on {} ended without status",
                pod
            ))),
        }
    }

    fn watch(&self) -> BoxStream<'static, ClusterKey> {
        let mut streams = vec![self.watch_clusters()];
        for kind in &self.watched_kinds {
            streams.push(match kind {
                ResourceKind::Secret => self.watch_owned::<Secret>(),
                ResourceKind::ConfigMap => self.watch_owned::<ConfigMap>(),
                ResourceKind::ServiceAccount => self.watch_owned::<ServiceAccount>(),
                ResourceKind::Role => self.watch_owned::<Role>(),
                ResourceKind::RoleBinding => self.watch_owned::<RoleBinding>(),
                ResourceKind::Service => self.watch_owned::<Service>(),
                ResourceKind::StatefulSet => self.watch_owned::<StatefulSet>(),
            });
        }
        if self.watched_kinds.contains(&ResourceKind::Service) {
            streams.push(self.watch_endpoints());
        }
        stream::select_all(streams).boxed()
    }
}

//! In-memory platform used by the reconciler, finalizer and dispatcher tests.
//!
//! Mimics the API server behaviors the operator relies on: resource versions
//! with conflict detection, finalizer-gated deletion and server-side
//! defaulting of fields the operator does not set.

use super::{ClusterKey, Platform};
use crate::crd::{ClusterStatus, RabbitmqCluster};
use crate::error::{OperatorError, Result};
use crate::resources::{ChildResource, ResourceKind, LABEL_INSTANCE, LABEL_NAME};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSetStatus;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
    WriteStatus,
    PatchFinalizers,
    Exec,
}

/// One recorded call. `kind` is `None` for calls on the cluster object itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub verb: Verb,
    pub kind: Option<ResourceKind>,
    pub name: String,
}

impl Operation {
    pub fn is_write(&self) -> bool {
        !matches!(self.verb, Verb::Get | Verb::List)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    Transient,
    Conflict,
}

struct Failure {
    verb: Verb,
    kind: Option<ResourceKind>,
    error: Injected,
    remaining: usize,
}

type ChildId = (ResourceKind, String, String);

/// A password set on a broker node through exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordChange {
    pub pod: String,
    pub username: String,
    pub password: String,
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<ClusterKey, RabbitmqCluster>,
    children: BTreeMap<ChildId, ChildResource>,
    claims: BTreeMap<(String, String), PersistentVolumeClaim>,
    password_changes: Vec<PasswordChange>,
    endpoints: BTreeMap<(String, String), usize>,
    ready_replicas: BTreeMap<(String, String), i32>,
    version: u64,
    ops: Vec<Operation>,
    failures: Vec<Failure>,
    watchers: Vec<mpsc::UnboundedSender<ClusterKey>>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn record(&mut self, verb: Verb, kind: Option<ResourceKind>, name: &str) -> Result<()> {
        self.ops.push(Operation {
            verb,
            kind,
            name: name.to_string(),
        });
        let pos = self
            .failures
            .iter()
            .position(|f| f.verb == verb && (f.kind.is_none() || f.kind == kind));
        if let Some(pos) = pos {
            let failure = &mut self.failures[pos];
            failure.remaining -= 1;
            let error = failure.error;
            if failure.remaining == 0 {
                self.failures.remove(pos);
            }
            return Err(match error {
                Injected::Transient => OperatorError::Transient("injected failure".into()),
                Injected::Conflict => OperatorError::Conflict("injected conflict".into()),
            });
        }
        Ok(())
    }

    fn notify(&mut self, key: &ClusterKey) {
        self.watchers
            .retain(|tx| tx.unbounded_send(key.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
}

fn key_of(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn check_uid(expected: Option<&str>, actual: Option<&String>, what: &str) -> Result<()> {
    if expected.is_some() && expected != actual.map(String::as_str) {
        return Err(OperatorError::Conflict(format!(
            "precondition failed for {}: uid mismatch",
            what
        )));
    }
    Ok(())
}

/// Equality-only label selector, `k=v,k=v`
fn selector_matches(selector: &str, meta: &ObjectMeta) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

fn check_version(expected: Option<&String>, actual: Option<&String>, what: &str) -> Result<()> {
    if expected.is_some() && expected != actual {
        return Err(OperatorError::Conflict(format!(
            "{} has been modified; please apply your changes to the latest version",
            what
        )));
    }
    Ok(())
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Store a cluster as the API server would after a create.
    pub fn insert_cluster(&self, mut cluster: RabbitmqCluster) -> ClusterKey {
        let mut state = self.state();
        let key = ClusterKey::for_cluster(&cluster).unwrap();
        cluster.metadata.resource_version = Some(state.next_version());
        cluster.metadata.uid.get_or_insert_with(|| format!("uid-{}", key.name));
        cluster.metadata.generation.get_or_insert(1);
        state.clusters.insert(key.clone(), cluster);
        state.notify(&key);
        key
    }

    /// Apply a user edit to the spec, bumping generation.
    pub fn edit_cluster(&self, key: &ClusterKey, edit: impl FnOnce(&mut RabbitmqCluster)) {
        let mut state = self.state();
        let version = state.next_version();
        let cluster = state.clusters.get_mut(key).unwrap();
        edit(cluster);
        cluster.metadata.resource_version = Some(version);
        cluster.metadata.generation = Some(cluster.metadata.generation.unwrap_or(0) + 1);
        state.notify(key);
    }

    /// Request deletion. Objects without finalizers disappear immediately.
    pub fn delete_cluster(&self, key: &ClusterKey) {
        let mut state = self.state();
        let version = state.next_version();
        let Some(cluster) = state.clusters.get_mut(key) else {
            return;
        };
        if cluster.metadata.finalizers.as_ref().map_or(true, Vec::is_empty) {
            state.clusters.remove(key);
        } else {
            cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            cluster.metadata.resource_version = Some(version);
        }
        state.notify(key);
    }

    pub fn cluster(&self, key: &ClusterKey) -> Option<RabbitmqCluster> {
        self.state().clusters.get(key).cloned()
    }

    pub fn child(&self, namespace: &str, kind: ResourceKind, name: &str) -> Option<ChildResource> {
        self.state()
            .children
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn child_count(&self) -> usize {
        self.state().children.len()
    }

    /// Place an object as if someone else created it.
    pub fn put_child(&self, mut child: ChildResource) {
        let mut state = self.state();
        let version = state.next_version();
        let meta = child.meta_mut();
        meta.uid.get_or_insert_with(|| format!("child-uid-{}", version));
        meta.resource_version = Some(version);
        let id = (
            child.kind(),
            child.namespace().to_string(),
            child.name().to_string(),
        );
        state.children.insert(id, child);
    }

    pub fn remove_child(&self, namespace: &str, kind: ResourceKind, name: &str) {
        self.state()
            .children
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    /// A claim as the StatefulSet controller would create it from a volume
    /// claim template.
    pub fn add_claim(&self, namespace: &str, name: &str, instance: &str) {
        let labels = [
            (LABEL_NAME.to_string(), "rabbitmq".to_string()),
            (LABEL_INSTANCE.to_string(), instance.to_string()),
        ];
        self.put_claim(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(format!("claim-uid-{}", name)),
                labels: Some(labels.into_iter().collect()),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    pub fn put_claim(&self, claim: PersistentVolumeClaim) {
        let key = key_of(
            claim.metadata.namespace.as_deref().unwrap_or_default(),
            claim.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state().claims.insert(key, claim);
    }

    pub fn has_claim(&self, namespace: &str, name: &str) -> bool {
        self.state().claims.contains_key(&key_of(namespace, name))
    }

    pub fn password_changes(&self) -> Vec<PasswordChange> {
        self.state().password_changes.clone()
    }

    pub fn claim_count(&self) -> usize {
        self.state().claims.len()
    }

    pub fn set_ready_replicas(&self, namespace: &str, statefulset: &str, ready: i32) {
        let mut state = self.state();
        state
            .ready_replicas
            .insert(key_of(namespace, statefulset), ready);
        let id = (
            ResourceKind::StatefulSet,
            namespace.to_string(),
            statefulset.to_string(),
        );
        if let Some(ChildResource::StatefulSet(sts)) = state.children.get_mut(&id) {
            sts.status = Some(StatefulSetStatus {
                ready_replicas: Some(ready),
                ..Default::default()
            });
        }
    }

    pub fn set_ready_endpoints(&self, namespace: &str, service: &str, ready: usize) {
        self.state()
            .endpoints
            .insert(key_of(namespace, service), ready);
    }

    /// Fail the next `times` calls matching `verb` (and `kind`, when given).
    pub fn fail(&self, verb: Verb, kind: Option<ResourceKind>, error: Injected, times: usize) {
        self.state().failures.push(Failure {
            verb,
            kind,
            error,
            remaining: times,
        });
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state().ops.clone()
    }

    pub fn writes(&self) -> Vec<Operation> {
        self.operations()
            .into_iter()
            .filter(Operation::is_write)
            .collect()
    }

    pub fn clear_operations(&self) {
        self.state().ops.clear();
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<RabbitmqCluster>> {
        let mut state = self.state();
        state.record(Verb::Get, None, &key.name)?;
        Ok(state.clusters.get(key).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterKey>> {
        let mut state = self.state();
        state.record(Verb::List, None, "")?;
        Ok(state.clusters.keys().cloned().collect())
    }

    async fn set_finalizers(
        &self,
        cluster: &RabbitmqCluster,
        finalizers: Vec<String>,
    ) -> Result<RabbitmqCluster> {
        let mut state = self.state();
        let key = ClusterKey::for_cluster(cluster).unwrap();
        state.record(Verb::PatchFinalizers, None, &key.name)?;
        let version = state.next_version();
        let stored = state
            .clusters
            .get_mut(&key)
            .ok_or_else(|| OperatorError::Transient("not found".into()))?;
        check_version(
            cluster.metadata.resource_version.as_ref(),
            stored.metadata.resource_version.as_ref(),
            "RabbitmqCluster",
        )?;
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().map_or(true, Vec::is_empty);
        if released {
            state.clusters.remove(&key);
        }
        state.notify(&key);
        Ok(updated)
    }

    async fn replace_status(&self, cluster: &RabbitmqCluster, status: &ClusterStatus) -> Result<()> {
        let mut state = self.state();
        let key = ClusterKey::for_cluster(cluster).unwrap();
        state.record(Verb::WriteStatus, None, &key.name)?;
        let version = state.next_version();
        let stored = state
            .clusters
            .get_mut(&key)
            .ok_or_else(|| OperatorError::Transient("not found".into()))?;
        check_version(
            cluster.metadata.resource_version.as_ref(),
            stored.metadata.resource_version.as_ref(),
            "RabbitmqCluster",
        )?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn get_child(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<ChildResource>> {
        let mut state = self.state();
        state.record(Verb::Get, Some(kind), name)?;
        Ok(state
            .children
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_child(&self, child: &ChildResource) -> Result<ChildResource> {
        let mut state = self.state();
        state.record(Verb::Create, Some(child.kind()), child.name())?;
        let id = (
            child.kind(),
            child.namespace().to_string(),
            child.name().to_string(),
        );
        if state.children.contains_key(&id) {
            return Err(OperatorError::Conflict(format!(
                "{} {:?} already exists",
                child.kind(),
                child.name()
            )));
        }
        let mut stored = child.clone();
        let version = state.next_version();
        let meta = stored.meta_mut();
        meta.resource_version = Some(version.clone());
        meta.uid = Some(format!("child-uid-{}", version));
        apply_server_defaults(&mut stored);
        state.children.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_child(&self, child: &ChildResource) -> Result<ChildResource> {
        let mut state = self.state();
        state.record(Verb::Update, Some(child.kind()), child.name())?;
        let id = (
            child.kind(),
            child.namespace().to_string(),
            child.name().to_string(),
        );
        let version = state.next_version();
        let Some(live) = state.children.get(&id) else {
            return Err(OperatorError::Transient(format!(
                "{} {:?} not found",
                child.kind(),
                child.name()
            )));
        };
        check_version(
            child.meta().resource_version.as_ref(),
            live.meta().resource_version.as_ref(),
            child.kind().as_str(),
        )?;
        let mut stored = child.clone();
        if let (ChildResource::StatefulSet(next), ChildResource::StatefulSet(prev)) =
            (&mut stored, live)
        {
            next.status = prev.status.clone();
        }
        stored.meta_mut().resource_version = Some(version);
        apply_server_defaults(&mut stored);
        state.children.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete_child(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        uid: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state();
        state.record(Verb::Delete, Some(kind), name)?;
        let id = (kind, namespace.to_string(), name.to_string());
        let Some(live) = state.children.get(&id) else {
            return Ok(false);
        };
        check_uid(uid, live.meta().uid.as_ref(), kind.as_str())?;
        state.children.remove(&id);
        Ok(true)
    }

    async fn ready_endpoint_addresses(&self, namespace: &str, service: &str) -> Result<usize> {
        let mut state = self.state();
        state.record(Verb::Get, None, service)?;
        Ok(state
            .endpoints
            .get(&key_of(namespace, service))
            .copied()
            .unwrap_or(0))
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let mut state = self.state();
        state.record(Verb::List, None, selector)?;
        Ok(state
            .claims
            .iter()
            .filter(|((ns, _), claim)| ns == namespace && selector_matches(selector, &claim.metadata))
            .map(|(_, claim)| claim.clone())
            .collect())
    }

    async fn delete_claim(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<bool> {
        let mut state = self.state();
        state.record(Verb::Delete, None, name)?;
        let key = key_of(namespace, name);
        let Some(live) = state.claims.get(&key) else {
            return Ok(false);
        };
        check_uid(uid, live.metadata.uid.as_ref(), "PersistentVolumeClaim")?;
        state.claims.remove(&key);
        Ok(true)
    }

    async fn change_user_password(
        &self,
        _namespace: &str,
        pod: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let mut state = self.state();
        state.record(Verb::Exec, None, pod)?;
        state.password_changes.push(PasswordChange {
            pod: pod.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        });
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, ClusterKey> {
        let (tx, rx) = mpsc::unbounded();
        self.state().watchers.push(tx);
        rx.boxed()
    }
}

/// Fields the API server fills in on write.
fn apply_server_defaults(child: &mut ChildResource) {
    match child {
        ChildResource::StatefulSet(sts) => {
            if let Some(spec) = sts.spec.as_mut() {
                spec.revision_history_limit.get_or_insert(10);
            }
        }
        ChildResource::Service(svc) => {
            if let Some(spec) = svc.spec.as_mut() {
                if spec.cluster_ip.is_none() {
                    spec.cluster_ip = Some("10.96.0.10".to_string());
                    spec.cluster_ips = Some(vec!["10.96.0.10".to_string()]);
                }
                spec.session_affinity.get_or_insert_with(|| "None".to_string());
            }
        }
        _ => {}
    }
}

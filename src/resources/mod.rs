//! Kubernetes Resource Synthesizer
//!
//! Maps a `RabbitmqCluster` (plus any secret material that already exists in the
//! cluster) to the complete set of child resources the operator manages. Nothing
//! in this module performs I/O; randomness is only drawn through a
//! [`SecretGenerator`], and only for values that do not exist yet.

mod config;
mod diff;
mod rbac;
mod secrets;
mod services;
mod statefulset;
mod validation;

pub use config::{render_enabled_plugins, render_rabbitmq_conf, DEFAULT_PLUGINS};
pub use diff::{merge_for_update, needs_update};
pub use secrets::{secret_value, ADMIN_PASSWORD_KEY, ADMIN_USERNAME_KEY, ERLANG_COOKIE_KEY};
pub use statefulset::{PERSISTENCE_VOLUME, RABBITMQ_CONTAINER};
pub use validation::validate;

use crate::crd::RabbitmqCluster;
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation holding the hash of the operator-owned fields of a child resource
pub const SPEC_HASH_ANNOTATION: &str = "rabbitmq.com/spec-hash";

/// Pod template annotation holding the hash of the rendered configuration bundle
pub const CONFIG_HASH_ANNOTATION: &str = "rabbitmq.com/config-hash";

/// Parent annotation used to request a new admin password
pub const ROTATION_ANNOTATION: &str = "rabbitmq.com/rotate-admin-credentials";

/// Comma-separated annotation keys the operator set on a child, so that keys
/// it stops setting can be removed on the next update
pub const MANAGED_ANNOTATIONS: &str = "rabbitmq.com/managed-annotations";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const APP_NAME: &str = "rabbitmq";
pub const MANAGER_NAME: &str = "rabbitmq-cluster-operator";

/// The closed set of child resource kinds the operator creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Secret,
    ConfigMap,
    ServiceAccount,
    Role,
    RoleBinding,
    Service,
    StatefulSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Secret,
        ResourceKind::ConfigMap,
        ResourceKind::ServiceAccount,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::Service,
        ResourceKind::StatefulSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::Service => "Service",
            ResourceKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed child resource
#[derive(Debug, Clone, PartialEq)]
pub enum ChildResource {
    Secret(Secret),
    ConfigMap(ConfigMap),
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Service(Service),
    StatefulSet(StatefulSet),
}

impl ChildResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ChildResource::Secret(_) => ResourceKind::Secret,
            ChildResource::ConfigMap(_) => ResourceKind::ConfigMap,
            ChildResource::ServiceAccount(_) => ResourceKind::ServiceAccount,
            ChildResource::Role(_) => ResourceKind::Role,
            ChildResource::RoleBinding(_) => ResourceKind::RoleBinding,
            ChildResource::Service(_) => ResourceKind::Service,
            ChildResource::StatefulSet(_) => ResourceKind::StatefulSet,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ChildResource::Secret(r) => r.meta(),
            ChildResource::ConfigMap(r) => r.meta(),
            ChildResource::ServiceAccount(r) => r.meta(),
            ChildResource::Role(r) => r.meta(),
            ChildResource::RoleBinding(r) => r.meta(),
            ChildResource::Service(r) => r.meta(),
            ChildResource::StatefulSet(r) => r.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ChildResource::Secret(r) => r.meta_mut(),
            ChildResource::ConfigMap(r) => r.meta_mut(),
            ChildResource::ServiceAccount(r) => r.meta_mut(),
            ChildResource::Role(r) => r.meta_mut(),
            ChildResource::RoleBinding(r) => r.meta_mut(),
            ChildResource::Service(r) => r.meta_mut(),
            ChildResource::StatefulSet(r) => r.meta_mut(),
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn spec_hash(&self) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
            .map(String::as_str)
    }

    /// Serialize the operator-owned part of the object.
    ///
    /// Platform-managed metadata (resource version, uid, timestamps, managed
    /// fields) and status are dropped, as is the spec-hash annotation itself.
    fn owned_fields_json(&self) -> Result<Vec<u8>> {
        let mut owned = self.clone();
        let meta = owned.meta_mut();
        let mut annotations = meta.annotations.take().unwrap_or_default();
        annotations.remove(SPEC_HASH_ANNOTATION);
        *meta = ObjectMeta {
            name: meta.name.take(),
            namespace: meta.namespace.take(),
            labels: meta.labels.take(),
            annotations: Some(annotations),
            owner_references: meta.owner_references.take(),
            ..Default::default()
        };
        let bytes = match &mut owned {
            ChildResource::Secret(r) => serde_json::to_vec(r)?,
            ChildResource::ConfigMap(r) => serde_json::to_vec(r)?,
            ChildResource::ServiceAccount(r) => serde_json::to_vec(r)?,
            ChildResource::Role(r) => serde_json::to_vec(r)?,
            ChildResource::RoleBinding(r) => serde_json::to_vec(r)?,
            ChildResource::Service(r) => {
                r.status = None;
                serde_json::to_vec(r)?
            }
            ChildResource::StatefulSet(r) => {
                r.status = None;
                serde_json::to_vec(r)?
            }
        };
        Ok(bytes)
    }

    /// Compute and record the spec hash annotation.
    fn stamp_spec_hash(&mut self) -> Result<()> {
        let hash = sha256_hex(&self.owned_fields_json()?);
        self.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
        Ok(())
    }
}

/// Identifies a child resource without its payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChildRef {
    pub kind: ResourceKind,
    pub name: String,
}

/// How the reconciler may touch an existing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Create when absent, never modify afterwards
    CreateOnly,
    /// Create when absent, update in place when the spec hash differs
    Converge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredChild {
    pub resource: ChildResource,
    pub policy: ApplyPolicy,
}

/// The complete synthesized target for one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ChildResourceSet {
    pub erlang_cookie: Secret,
    pub admin_secret: Secret,
    pub server_config: ConfigMap,
    pub service_account: ServiceAccount,
    pub role: Role,
    pub role_binding: RoleBinding,
    pub headless_service: Service,
    pub client_service: Service,
    pub statefulset: StatefulSet,
}

impl ChildResourceSet {
    /// Children in apply order: secrets first, the workload last.
    pub fn into_ordered(self) -> Vec<DesiredChild> {
        let converge = |resource| DesiredChild {
            resource,
            policy: ApplyPolicy::Converge,
        };
        vec![
            DesiredChild {
                resource: ChildResource::Secret(self.erlang_cookie),
                policy: ApplyPolicy::CreateOnly,
            },
            converge(ChildResource::Secret(self.admin_secret)),
            converge(ChildResource::ConfigMap(self.server_config)),
            converge(ChildResource::ServiceAccount(self.service_account)),
            converge(ChildResource::Role(self.role)),
            converge(ChildResource::RoleBinding(self.role_binding)),
            converge(ChildResource::Service(self.headless_service)),
            converge(ChildResource::Service(self.client_service)),
            converge(ChildResource::StatefulSet(self.statefulset)),
        ]
    }
}

/// Secret material read back from the cluster before synthesis
#[derive(Debug, Clone, Default)]
pub struct ExistingSecrets {
    pub erlang_cookie: Option<Secret>,
    pub admin: Option<Secret>,
}

/// Source of new credential and identity values
pub trait SecretGenerator: Send + Sync {
    /// Generate an alphanumeric value of `len` characters
    fn generate(&self, len: usize) -> String;
}

/// Generator backed by the thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSecretGenerator;

impl SecretGenerator for RandomSecretGenerator {
    fn generate(&self, len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}

/// Names of every object derived from one RabbitmqCluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    pub instance: String,
    pub namespace: String,
}

impl ClusterNames {
    pub fn new(instance: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            namespace: namespace.into(),
        }
    }

    pub fn from_cluster(cluster: &RabbitmqCluster) -> Result<Self> {
        let instance = cluster.metadata.name.clone().ok_or_else(|| {
            OperatorError::InvalidSpec("metadata.name is required".to_string())
        })?;
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        Ok(Self::new(instance, namespace))
    }

    fn prefixed(&self, suffix: &str) -> String {
        format!("{}-rabbitmq-{}", self.instance, suffix)
    }

    pub fn erlang_cookie(&self) -> String {
        self.prefixed("erlang-cookie")
    }

    pub fn admin_secret(&self) -> String {
        self.prefixed("admin")
    }

    pub fn server_config(&self) -> String {
        self.prefixed("server-conf")
    }

    pub fn service_account(&self) -> String {
        self.prefixed("server")
    }

    pub fn role(&self) -> String {
        self.prefixed("endpoint-discovery")
    }

    pub fn role_binding(&self) -> String {
        self.prefixed("server")
    }

    pub fn headless_service(&self) -> String {
        self.prefixed("headless")
    }

    pub fn client_service(&self) -> String {
        self.prefixed("client")
    }

    pub fn statefulset(&self) -> String {
        self.prefixed("server")
    }

    /// Every child in apply order
    pub fn children(&self) -> Vec<ChildRef> {
        let child = |kind, name| ChildRef { kind, name };
        vec![
            child(ResourceKind::Secret, self.erlang_cookie()),
            child(ResourceKind::Secret, self.admin_secret()),
            child(ResourceKind::ConfigMap, self.server_config()),
            child(ResourceKind::ServiceAccount, self.service_account()),
            child(ResourceKind::Role, self.role()),
            child(ResourceKind::RoleBinding, self.role_binding()),
            child(ResourceKind::Service, self.headless_service()),
            child(ResourceKind::Service, self.client_service()),
            child(ResourceKind::StatefulSet, self.statefulset()),
        ]
    }

    /// Label selector matching pods and volume claims of this instance
    pub fn instance_selector(&self) -> String {
        format!(
            "{}={},{}={}",
            LABEL_NAME, APP_NAME, LABEL_INSTANCE, self.instance
        )
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NAME.to_string(), APP_NAME.to_string());
        labels.insert(LABEL_INSTANCE.to_string(), self.instance.clone());
        labels
    }

    pub fn labels(&self, component: &str) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
        labels
    }

    /// Metadata shared by every child object
    pub(crate) fn child_meta(
        &self,
        name: String,
        component: &str,
        owner: &OwnerReference,
    ) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels(component)),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        }
    }
}

pub fn owner_reference(cluster: &RabbitmqCluster) -> OwnerReference {
    OwnerReference {
        api_version: RabbitmqCluster::api_version(&()).to_string(),
        kind: RabbitmqCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The controlling owner of an object, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
}

/// Whether the object is controlled by the owner with `uid`.
pub fn controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    controller_of(meta).is_some_and(|owner| owner.uid == uid)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Synthesize the desired child resources for a cluster.
///
/// Returns `InvalidSpec` when the spec fails validation. Identity and credential
/// values are copied from `existing` when present, so the same inputs always
/// produce the same output.
pub fn synthesize(
    cluster: &RabbitmqCluster,
    existing: &ExistingSecrets,
    generator: &dyn SecretGenerator,
) -> Result<ChildResourceSet> {
    validate(&cluster.spec)?;
    let names = ClusterNames::from_cluster(cluster)?;
    let owner = owner_reference(cluster);

    let erlang_cookie =
        secrets::erlang_cookie(&names, &owner, existing.erlang_cookie.as_ref(), generator);
    let rotation = cluster.annotations().get(ROTATION_ANNOTATION).cloned();
    let admin_secret = secrets::admin_secret(
        &names,
        &owner,
        existing.admin.as_ref(),
        rotation.as_deref(),
        generator,
    );
    let server_config = config::server_config(&names, &owner, &cluster.spec);
    let config_hash = config::config_hash(&server_config);

    let mut children = ChildResourceSet {
        erlang_cookie,
        admin_secret,
        service_account: rbac::service_account(&names, &owner),
        role: rbac::role(&names, &owner),
        role_binding: rbac::role_binding(&names, &owner),
        headless_service: services::headless_service(&names, &owner),
        client_service: services::client_service(&names, &owner, &cluster.spec),
        statefulset: statefulset::statefulset(&names, &owner, &cluster.spec, &config_hash),
        server_config,
    };

    stamp(&mut children)?;
    Ok(children)
}

fn stamp(children: &mut ChildResourceSet) -> Result<()> {
    fn stamped<K>(obj: &mut K, wrap: fn(K) -> ChildResource) -> Result<()>
    where
        K: Resource + Clone,
    {
        record_managed_annotations(obj.meta_mut());
        let mut child = wrap(obj.clone());
        child.stamp_spec_hash()?;
        let hash = child.spec_hash().map(str::to_string);
        if let Some(hash) = hash {
            obj.meta_mut()
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
        }
        Ok(())
    }

    stamped(&mut children.erlang_cookie, ChildResource::Secret)?;
    stamped(&mut children.admin_secret, ChildResource::Secret)?;
    stamped(&mut children.server_config, ChildResource::ConfigMap)?;
    stamped(&mut children.service_account, ChildResource::ServiceAccount)?;
    stamped(&mut children.role, ChildResource::Role)?;
    stamped(&mut children.role_binding, ChildResource::RoleBinding)?;
    stamped(&mut children.headless_service, ChildResource::Service)?;
    stamped(&mut children.client_service, ChildResource::Service)?;
    stamped(&mut children.statefulset, ChildResource::StatefulSet)?;
    Ok(())
}

fn record_managed_annotations(meta: &mut ObjectMeta) {
    let Some(annotations) = meta.annotations.as_mut() else {
        return;
    };
    annotations.remove(MANAGED_ANNOTATIONS);
    let keys: Vec<&str> = annotations
        .keys()
        .map(String::as_str)
        .filter(|k| *k != SPEC_HASH_ANNOTATION)
        .collect();
    if keys.is_empty() {
        return;
    }
    let list = keys.join(",");
    annotations.insert(MANAGED_ANNOTATIONS.to_string(), list);
}

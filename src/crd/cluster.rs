//! RabbitmqCluster Custom Resource Definition
//!
//! Defines the specification for deploying a RabbitMQ cluster on Kubernetes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// RabbitmqCluster is the Schema for the rabbitmqclusters API
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "rabbitmq.com",
    version = "v1beta1",
    kind = "RabbitmqCluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "rmq",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of RabbitMQ nodes
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container image to use for RabbitMQ
    #[serde(default = "default_image")]
    pub image: String,

    /// Name of a Secret used to pull the image
    #[serde(default)]
    pub image_pull_secret: Option<String>,

    /// Persistent storage for each node
    #[serde(default)]
    pub persistence: Persistence,

    /// Resource requirements for each node
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Client-facing service settings
    #[serde(default)]
    pub service: ClientService,

    /// Broker configuration
    #[serde(default)]
    pub rabbitmq: RabbitmqConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: Option<ClusterTls>,
}

/// Persistent storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    /// Storage class name for PVCs
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// Size of the persistent volume (e.g., "10Gi")
    #[serde(default = "default_storage_size")]
    pub storage: String,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            storage_class_name: None,
            storage: default_storage_size(),
        }
    }
}

/// Resource requirements for the broker container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource limits
    #[serde(default = "default_limits")]
    pub limits: ResourceList,
    /// Resource requests
    #[serde(default = "default_requests")]
    pub requests: ResourceList,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            limits: default_limits(),
            requests: default_requests(),
        }
    }
}

/// Resource quantities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default)]
    pub memory: Option<String>,
}

/// Client service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientService {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default = "default_service_type")]
    pub r#type: String,
    /// Annotations added to the client service
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Default for ClientService {
    fn default() -> Self {
        Self {
            r#type: default_service_type(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Broker configuration overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqConfig {
    /// Entries merged into rabbitmq.conf, overriding the operator defaults
    #[serde(default)]
    pub additional_config: BTreeMap<String, String>,
    /// Plugins enabled in addition to the defaults
    #[serde(default)]
    pub additional_plugins: Vec<String>,
}

/// TLS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTls {
    /// Secret holding tls.crt and tls.key
    pub secret_name: String,
    /// Secret holding ca.crt, enables peer verification
    #[serde(default)]
    pub ca_secret_name: Option<String>,
}

/// Status of the RabbitmqCluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Conditions in reporting order: Ready, ClusterAvailable, ReconcileSuccess
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    /// Desired number of nodes
    #[serde(default)]
    pub replicas: i32,
    /// Number of ready nodes
    #[serde(default)]
    pub ready_replicas: i32,
    /// Secret holding the default admin credentials
    #[serde(default)]
    pub admin_secret_name: Option<String>,
    /// Client service name
    #[serde(default)]
    pub service_name: Option<String>,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// Condition of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_image() -> String {
    "rabbitmq:3.8.1".to_string()
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

fn default_limits() -> ResourceList {
    ResourceList {
        cpu: Some("2000m".to_string()),
        memory: Some("2Gi".to_string()),
    }
}

fn default_requests() -> ResourceList {
    ResourceList {
        cpu: Some("1000m".to_string()),
        memory: Some("2Gi".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_spec_defaults() {
        let spec: ClusterSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.image, "rabbitmq:3.8.1");
        assert_eq!(spec.persistence.storage, "10Gi");
        assert_eq!(spec.service.r#type, "ClusterIP");
        assert_eq!(spec.resources.limits.memory.as_deref(), Some("2Gi"));
        assert!(spec.tls.is_none());
    }

    #[test]
    fn test_cluster_spec_camel_case() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "replicas": 3,
            "imagePullSecret": "regcred",
            "persistence": { "storageClassName": "fast", "storage": "20Gi" },
            "rabbitmq": {
                "additionalConfig": { "vm_memory_high_watermark.relative": "0.6" },
                "additionalPlugins": ["rabbitmq_shovel"]
            },
            "tls": { "secretName": "rmq-tls" }
        }))
        .unwrap();
        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.image_pull_secret.as_deref(), Some("regcred"));
        assert_eq!(spec.persistence.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(spec.rabbitmq.additional_plugins, vec!["rabbitmq_shovel"]);
        assert_eq!(spec.tls.unwrap().secret_name, "rmq-tls");
    }

    #[test]
    fn test_status_roundtrips_camel_case() {
        let status = ClusterStatus {
            ready_replicas: 2,
            admin_secret_name: Some("a".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["readyReplicas"], 2);
        assert_eq!(value["adminSecretName"], "a");
    }
}

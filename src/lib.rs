//! RabbitMQ Cluster Kubernetes Operator
//!
//! Converges `RabbitmqCluster` resources into the Kubernetes objects that
//! run a RabbitMQ cluster: an Erlang cookie and admin credential Secret, a
//! server ConfigMap, peer discovery RBAC, headless and client Services and a
//! StatefulSet. Readiness is reported back as status conditions.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: rabbitmq.com/v1beta1
//! kind: RabbitmqCluster
//! metadata:
//!   name: orders
//! spec:
//!   replicas: 3
//!   persistence:
//!     storage: 10Gi
//! ```

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod platform;
pub mod resources;

pub use config::{Args, OperatorConfig};
pub use controllers::ClusterController;
pub use crd::{
    ClientService, ClusterCondition, ClusterSpec, ClusterStatus, ClusterTls, Persistence,
    RabbitmqCluster, RabbitmqConfig, ResourceList, ResourceRequirements,
};
pub use error::{OperatorError, Result};

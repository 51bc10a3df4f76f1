//! Custom Resource Definitions for the RabbitMQ cluster operator
//!
//! - RabbitmqCluster: a RabbitMQ cluster deployment

mod cluster;

pub use cluster::{
    ClientService, ClusterCondition, ClusterSpec, ClusterStatus, ClusterTls, Persistence,
    RabbitmqCluster, RabbitmqConfig, ResourceList, ResourceRequirements,
};

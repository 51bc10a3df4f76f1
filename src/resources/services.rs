//! Headless (peer discovery) and client services

use super::ClusterNames;
use crate::crd::ClusterSpec;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub const AMQP_PORT: i32 = 5672;
pub const AMQPS_PORT: i32 = 5671;
pub const MANAGEMENT_PORT: i32 = 15672;
pub const PROMETHEUS_PORT: i32 = 15692;
pub const EPMD_PORT: i32 = 4369;
pub const CLUSTERING_PORT: i32 = 25672;

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: number,
        target_port: Some(IntOrString::Int(number)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Governs the StatefulSet pod DNS names. Not-ready addresses are published
/// so that booting nodes can find each other.
pub(super) fn headless_service(names: &ClusterNames, owner: &OwnerReference) -> Service {
    Service {
        metadata: names.child_meta(names.headless_service(), "headless", owner),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(names.selector_labels()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![
                port("epmd", EPMD_PORT),
                port("cluster-links", CLUSTERING_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn client_service(
    names: &ClusterNames,
    owner: &OwnerReference,
    spec: &ClusterSpec,
) -> Service {
    let mut ports = vec![
        port("amqp", AMQP_PORT),
        port("management", MANAGEMENT_PORT),
        port("prometheus", PROMETHEUS_PORT),
    ];
    if spec.tls.is_some() {
        ports.push(port("amqps", AMQPS_PORT));
    }

    let mut metadata = names.child_meta(names.client_service(), "client", owner);
    if !spec.service.annotations.is_empty() {
        metadata.annotations = Some(spec.service.annotations.clone());
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(spec.service.r#type.clone()),
            selector: Some(names.selector_labels()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterTls;

    fn names() -> ClusterNames {
        ClusterNames::new("orders", "messaging")
    }

    fn port_names(svc: &Service) -> Vec<String> {
        svc.spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().filter_map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_headless_service() {
        let svc = headless_service(&names(), &OwnerReference::default());
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(port_names(&svc), vec!["epmd", "cluster-links"]);
    }

    #[test]
    fn test_client_service_type_and_annotations() {
        let mut spec: ClusterSpec = serde_json::from_str("{}").unwrap();
        spec.service.r#type = "LoadBalancer".into();
        spec.service
            .annotations
            .insert("service.beta.kubernetes.io/aws-load-balancer-internal".into(), "true".into());
        let svc = client_service(&names(), &OwnerReference::default(), &spec);

        assert_eq!(
            svc.spec.as_ref().unwrap().type_.as_deref(),
            Some("LoadBalancer")
        );
        assert!(svc
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .contains_key("service.beta.kubernetes.io/aws-load-balancer-internal"));
        assert_eq!(port_names(&svc), vec!["amqp", "management", "prometheus"]);
    }

    #[test]
    fn test_client_service_exposes_amqps_with_tls() {
        let mut spec: ClusterSpec = serde_json::from_str("{}").unwrap();
        spec.tls = Some(ClusterTls {
            secret_name: "orders-tls".into(),
            ca_secret_name: None,
        });
        let svc = client_service(&names(), &OwnerReference::default(), &spec);
        assert!(port_names(&svc).contains(&"amqps".to_string()));
    }
}

//! Broker StatefulSet

use super::config::{TLS_CA_MOUNT_PATH, TLS_MOUNT_PATH};
use super::secrets::{ADMIN_PASSWORD_KEY, ADMIN_USERNAME_KEY, ERLANG_COOKIE_KEY};
use super::services::{
    AMQPS_PORT, AMQP_PORT, CLUSTERING_PORT, EPMD_PORT, MANAGEMENT_PORT, PROMETHEUS_PORT,
};
use super::{ClusterNames, CONFIG_HASH_ANNOTATION};
use crate::crd::{ClusterSpec, Persistence};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, LocalObjectReference, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const PERSISTENCE_VOLUME: &str = "persistence";
pub const RABBITMQ_CONTAINER: &str = "rabbitmq";
const COOKIE_SECRET_MOUNT: &str = "/tmp/erlang-cookie-secret";
const RABBITMQ_HOME: &str = "/var/lib/rabbitmq";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 150;

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_resource_requirements(spec: &crate::crd::ResourceRequirements) -> ResourceRequirements {
    fn quantities(list: &crate::crd::ResourceList) -> Option<BTreeMap<String, Quantity>> {
        let mut out = BTreeMap::new();
        if let Some(cpu) = &list.cpu {
            out.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &list.memory {
            out.insert("memory".to_string(), Quantity(memory.clone()));
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    ResourceRequirements {
        limits: quantities(&spec.limits),
        requests: quantities(&spec.requests),
        ..Default::default()
    }
}

fn build_volume_claim_templates(
    names: &ClusterNames,
    persistence: &Persistence,
) -> Vec<PersistentVolumeClaim> {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(persistence.storage.clone()));

    vec![PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(PERSISTENCE_VOLUME.to_string()),
            labels: Some(names.selector_labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: persistence.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }]
}

/// Copies the cookie out of the read-only secret mount with the permissions
/// the Erlang runtime insists on.
fn init_container(spec: &ClusterSpec) -> Container {
    Container {
        name: "setup-container".to_string(),
        image: Some(spec.image.clone()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "cp {src}/{key} {home}/{key} && chmod 600 {home}/{key}",
                src = COOKIE_SECRET_MOUNT,
                key = ERLANG_COOKIE_KEY,
                home = RABBITMQ_HOME
            ),
        ]),
        volume_mounts: Some(vec![
            mount("erlang-cookie-secret", COOKIE_SECRET_MOUNT),
            mount("rabbitmq-erlang-cookie", RABBITMQ_HOME),
        ]),
        ..Default::default()
    }
}

fn rabbitmq_container(names: &ClusterNames, spec: &ClusterSpec) -> Container {
    let headless = names.headless_service();
    let admin = names.admin_secret();
    let env = vec![
        field_env("MY_POD_NAME", "metadata.name"),
        field_env("MY_POD_NAMESPACE", "metadata.namespace"),
        value_env("RABBITMQ_USE_LONGNAME", "true"),
        value_env("K8S_SERVICE_NAME", headless),
        value_env(
            "RABBITMQ_NODENAME",
            "rabbit@$(MY_POD_NAME).$(K8S_SERVICE_NAME).$(MY_POD_NAMESPACE)",
        ),
        value_env(
            "K8S_HOSTNAME_SUFFIX",
            ".$(K8S_SERVICE_NAME).$(MY_POD_NAMESPACE)",
        ),
        secret_env("RABBITMQ_DEFAULT_USER", &admin, ADMIN_USERNAME_KEY),
        secret_env("RABBITMQ_DEFAULT_PASS", &admin, ADMIN_PASSWORD_KEY),
    ];

    let mut ports = vec![
        container_port("epmd", EPMD_PORT),
        container_port("amqp", AMQP_PORT),
        container_port("management", MANAGEMENT_PORT),
        container_port("prometheus", PROMETHEUS_PORT),
        container_port("cluster-links", CLUSTERING_PORT),
    ];
    let mut volume_mounts = vec![
        mount("server-conf", "/etc/rabbitmq/"),
        mount("rabbitmq-erlang-cookie", RABBITMQ_HOME),
        mount(PERSISTENCE_VOLUME, &format!("{}/mnesia/", RABBITMQ_HOME)),
    ];
    if let Some(tls) = &spec.tls {
        ports.push(container_port("amqps", AMQPS_PORT));
        volume_mounts.push(mount("rabbitmq-tls", TLS_MOUNT_PATH));
        if tls.ca_secret_name.is_some() {
            volume_mounts.push(mount("rabbitmq-tls-ca", TLS_CA_MOUNT_PATH));
        }
    }

    Container {
        name: RABBITMQ_CONTAINER.to_string(),
        image: Some(spec.image.clone()),
        ports: Some(ports),
        env: Some(env),
        resources: Some(build_resource_requirements(&spec.resources)),
        volume_mounts: Some(volume_mounts),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::String("amqp".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        liveness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "rabbitmq-diagnostics".to_string(),
                    "-q".to_string(),
                    "ping".to_string(),
                ]),
            }),
            initial_delay_seconds: Some(60),
            period_seconds: Some(60),
            timeout_seconds: Some(15),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volumes(names: &ClusterNames, spec: &ClusterSpec) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: "server-conf".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: names.server_config(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "rabbitmq-erlang-cookie".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        secret_volume("erlang-cookie-secret", &names.erlang_cookie()),
    ];
    if let Some(tls) = &spec.tls {
        volumes.push(secret_volume("rabbitmq-tls", &tls.secret_name));
        if let Some(ca) = &tls.ca_secret_name {
            volumes.push(secret_volume("rabbitmq-tls-ca", ca));
        }
    }
    volumes
}

pub(super) fn statefulset(
    names: &ClusterNames,
    owner: &OwnerReference,
    spec: &ClusterSpec,
    config_hash: &str,
) -> StatefulSet {
    let selector = names.selector_labels();

    let mut template_labels = selector.clone();
    template_labels.insert(super::LABEL_COMPONENT.to_string(), "server".to_string());
    let mut template_annotations = BTreeMap::new();
    template_annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash.to_string());

    let pod_template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(template_labels),
            annotations: Some(template_annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(names.service_account()),
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
            image_pull_secrets: spec.image_pull_secret.as_ref().map(|name| {
                vec![LocalObjectReference {
                    name: name.clone(),
                }]
            }),
            init_containers: Some(vec![init_container(spec)]),
            containers: vec![rabbitmq_container(names, spec)],
            volumes: Some(volumes(names, spec)),
            ..Default::default()
        }),
    };

    StatefulSet {
        metadata: names.child_meta(names.statefulset(), "server", owner),
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            service_name: names.headless_service(),
            template: pod_template,
            volume_claim_templates: Some(build_volume_claim_templates(
                names,
                &spec.persistence,
            )),
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

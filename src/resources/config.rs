//! Broker configuration bundle: rabbitmq.conf and enabled_plugins

use super::{sha256_hex, ClusterNames};
use crate::crd::ClusterSpec;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;

pub const RABBITMQ_CONF_KEY: &str = "rabbitmq.conf";
pub const ENABLED_PLUGINS_KEY: &str = "enabled_plugins";

pub const TLS_MOUNT_PATH: &str = "/etc/rabbitmq-tls";
pub const TLS_CA_MOUNT_PATH: &str = "/etc/rabbitmq-tls-ca";

/// Plugins every node runs
pub const DEFAULT_PLUGINS: [&str; 3] = [
    "rabbitmq_peer_discovery_k8s",
    "rabbitmq_prometheus",
    "rabbitmq_management",
];

fn default_entries(names: &ClusterNames, spec: &ClusterSpec) -> Vec<(String, String)> {
    let headless = names.headless_service();
    let mut entries: Vec<(&str, String)> = vec![
        (
            "cluster_formation.peer_discovery_backend",
            "rabbit_peer_discovery_k8s".to_string(),
        ),
        ("cluster_formation.k8s.host", "kubernetes.default".to_string()),
        ("cluster_formation.k8s.address_type", "hostname".to_string()),
        ("cluster_formation.k8s.service_name", headless.clone()),
        (
            "cluster_formation.k8s.hostname_suffix",
            format!(".{}.{}", headless, names.namespace),
        ),
        ("cluster_formation.node_cleanup.interval", "30".to_string()),
        (
            "cluster_formation.node_cleanup.only_log_warning",
            "true".to_string(),
        ),
        ("cluster_partition_handling", "pause_minority".to_string()),
        ("queue_master_locator", "min-masters".to_string()),
        ("loopback_users.guest", "false".to_string()),
    ];

    if let Some(tls) = &spec.tls {
        entries.push(("listeners.ssl.default", "5671".to_string()));
        entries.push(("ssl_options.certfile", format!("{}/tls.crt", TLS_MOUNT_PATH)));
        entries.push(("ssl_options.keyfile", format!("{}/tls.key", TLS_MOUNT_PATH)));
        if tls.ca_secret_name.is_some() {
            entries.push((
                "ssl_options.cacertfile",
                format!("{}/ca.crt", TLS_CA_MOUNT_PATH),
            ));
            entries.push(("ssl_options.verify", "verify_peer".to_string()));
        }
        entries.push(("ssl_options.fail_if_no_peer_cert", "false".to_string()));
    }

    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Render rabbitmq.conf.
///
/// Defaults keep their position; a user entry with the same key replaces the
/// default value in place. Remaining user entries follow in key order.
pub fn render_rabbitmq_conf(names: &ClusterNames, spec: &ClusterSpec) -> String {
    let mut overrides: BTreeMap<&str, &str> = spec
        .rabbitmq
        .additional_config
        .iter()
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let mut out = String::new();
    for (key, default) in default_entries(names, spec) {
        let value = overrides
            .remove(key.as_str())
            .map(str::to_string)
            .unwrap_or(default);
        out.push_str(&format!("{} = {}\n", key, value));
    }
    for (key, value) in overrides {
        out.push_str(&format!("{} = {}\n", key, value));
    }
    out
}

/// Render enabled_plugins as an Erlang term, defaults first, duplicates dropped.
pub fn render_enabled_plugins(spec: &ClusterSpec) -> String {
    let mut plugins: Vec<&str> = Vec::new();
    let requested = DEFAULT_PLUGINS
        .iter()
        .copied()
        .chain(spec.rabbitmq.additional_plugins.iter().map(|p| p.trim()));
    for plugin in requested {
        if !plugins.contains(&plugin) {
            plugins.push(plugin);
        }
    }
    format!("[{}].\n", plugins.join(","))
}

pub(super) fn server_config(
    names: &ClusterNames,
    owner: &OwnerReference,
    spec: &ClusterSpec,
) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(
        RABBITMQ_CONF_KEY.to_string(),
        render_rabbitmq_conf(names, spec),
    );
    data.insert(ENABLED_PLUGINS_KEY.to_string(), render_enabled_plugins(spec));

    ConfigMap {
        metadata: names.child_meta(names.server_config(), "server-config", owner),
        data: Some(data),
        ..Default::default()
    }
}

/// Hash of the rendered bundle, stamped on the pod template so that
/// configuration edits roll the pods.
pub(super) fn config_hash(config: &ConfigMap) -> String {
    let mut buf = String::new();
    if let Some(data) = &config.data {
        for (key, value) in data {
            buf.push_str(key);
            buf.push('\0');
            buf.push_str(value);
            buf.push('\0');
        }
    }
    sha256_hex(buf.as_bytes())
}

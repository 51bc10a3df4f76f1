//! Desired vs. live comparison and update preparation

use super::{ChildResource, MANAGED_ANNOTATIONS};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::warn;

/// A live object needs an update when its recorded spec hash differs from the
/// desired one. Fields the platform defaults or manages never take part in
/// the comparison.
pub fn needs_update(desired: &ChildResource, live: &ChildResource) -> bool {
    desired.spec_hash() != live.spec_hash()
}

/// Build the object to send as a full replacement of `live`.
///
/// Carries the live resource version (for optimistic concurrency), keeps
/// labels and annotations added by others, drops annotations the operator
/// set earlier but no longer wants, and preserves fields the platform assigns
/// or refuses to change after creation.
pub fn merge_for_update(desired: ChildResource, live: &ChildResource) -> ChildResource {
    let mut merged = desired;
    merge_meta(merged.meta_mut(), live.meta());

    match (&mut merged, live) {
        (ChildResource::Service(desired), ChildResource::Service(live)) => {
            if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                spec.cluster_ip = live_spec.cluster_ip.clone();
                spec.cluster_ips = live_spec.cluster_ips.clone();
                preserve_node_ports(spec, live_spec);
            }
        }
        (ChildResource::StatefulSet(desired), ChildResource::StatefulSet(live)) => {
            if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                if spec.volume_claim_templates != live_spec.volume_claim_templates {
                    warn!(
                        statefulset = %live.metadata.name.as_deref().unwrap_or_default(),
                        "Volume claim templates cannot be changed in place, keeping the live ones"
                    );
                }
                spec.selector = live_spec.selector.clone();
                spec.service_name = live_spec.service_name.clone();
                spec.volume_claim_templates = live_spec.volume_claim_templates.clone();
                spec.pod_management_policy = live_spec.pod_management_policy.clone();
            }
        }
        _ => {}
    }
    merged
}

fn merge_meta(desired: &mut ObjectMeta, live: &ObjectMeta) {
    desired.resource_version = live.resource_version.clone();
    desired.uid = live.uid.clone();
    desired.creation_timestamp = live.creation_timestamp.clone();
    desired.generation = live.generation;
    desired.finalizers = live.finalizers.clone();

    desired.labels = Some(merge_map(live.labels.as_ref(), desired.labels.take()));
    desired.annotations = Some(merge_annotations(
        live.annotations.as_ref(),
        desired.annotations.take(),
    ));
}

/// Like [`merge_map`], except that keys listed in the live
/// [`MANAGED_ANNOTATIONS`] entry belong to the operator and disappear when
/// they are no longer desired.
fn merge_annotations(
    live: Option<&BTreeMap<String, String>>,
    desired: Option<BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let desired = desired.unwrap_or_default();
    let mut merged = live.cloned().unwrap_or_default();
    if let Some(previous) = merged.remove(MANAGED_ANNOTATIONS) {
        for key in previous.split(',').filter(|k| !k.is_empty()) {
            if !desired.contains_key(key) {
                merged.remove(key);
            }
        }
    }
    merged.extend(desired);
    merged
}

/// Live entries first, desired entries win.
fn merge_map(
    live: Option<&BTreeMap<String, String>>,
    desired: Option<BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = live.cloned().unwrap_or_default();
    merged.extend(desired.unwrap_or_default());
    merged
}

/// Allocated node ports only survive while the service keeps exposing them;
/// a ClusterIP service must not carry any.
fn preserve_node_ports(
    spec: &mut k8s_openapi::api::core::v1::ServiceSpec,
    live: &k8s_openapi::api::core::v1::ServiceSpec,
) {
    if !matches!(spec.type_.as_deref(), Some("NodePort" | "LoadBalancer")) {
        return;
    }
    let Some(ports) = spec.ports.as_mut() else {
        return;
    };
    let live_ports = live.ports.as_deref().unwrap_or_default();
    for port in ports.iter_mut() {
        if port.node_port.is_none() {
            port.node_port = live_ports
                .iter()
                .find(|p| p.name == port.name)
                .and_then(|p| p.node_port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::tests::test_cluster;
    use crate::resources::{synthesize, ExistingSecrets, RandomSecretGenerator};
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::Service;

    fn desired(replicas: i32) -> (Service, StatefulSet) {
        let set = synthesize(
            &test_cluster(replicas),
            &ExistingSecrets::default(),
            &RandomSecretGenerator,
        )
        .unwrap();
        (set.client_service, set.statefulset)
    }

    #[test]
    fn test_platform_defaults_do_not_trigger_update() {
        let (_, sts) = desired(3);
        let mut live = sts.clone();
        live.metadata.resource_version = Some("7".into());
        live.metadata.uid = Some("abc".into());
        if let Some(spec) = live.spec.as_mut() {
            spec.revision_history_limit = Some(10);
        }
        assert!(!needs_update(
            &ChildResource::StatefulSet(sts),
            &ChildResource::StatefulSet(live)
        ));
    }

    #[test]
    fn test_spec_change_triggers_update() {
        let (_, before) = desired(3);
        let (_, after) = desired(5);
        assert!(needs_update(
            &ChildResource::StatefulSet(after),
            &ChildResource::StatefulSet(before)
        ));
    }

    #[test]
    fn test_merge_keeps_resource_version_and_foreign_labels() {
        let (_, sts) = desired(3);
        let mut live = sts.clone();
        live.metadata.resource_version = Some("7".into());
        live.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("team".into(), "payments".into());

        let (_, next) = desired(5);
        let merged = merge_for_update(
            ChildResource::StatefulSet(next.clone()),
            &ChildResource::StatefulSet(live),
        );
        assert_eq!(merged.meta().resource_version.as_deref(), Some("7"));
        assert_eq!(
            merged.meta().labels.as_ref().unwrap().get("team").map(String::as_str),
            Some("payments")
        );
        assert_eq!(
            merged.spec_hash(),
            ChildResource::StatefulSet(next).spec_hash()
        );
    }

    fn with_service(
        build: impl FnOnce(&mut crate::crd::ClientService),
    ) -> Service {
        let mut cluster = test_cluster(1);
        build(&mut cluster.spec.service);
        synthesize(&cluster, &ExistingSecrets::default(), &RandomSecretGenerator)
            .unwrap()
            .client_service
    }

    fn annotation_keys(child: &ChildResource) -> Vec<String> {
        child
            .meta()
            .annotations
            .as_ref()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_merge_preserves_assigned_service_fields() {
        let svc = with_service(|s| s.r#type = "NodePort".into());
        let mut live = svc.clone();
        if let Some(spec) = live.spec.as_mut() {
            spec.cluster_ip = Some("10.0.0.12".into());
            spec.cluster_ips = Some(vec!["10.0.0.12".into()]);
            if let Some(ports) = spec.ports.as_mut() {
                ports[0].node_port = Some(31672);
            }
        }
        let merged = merge_for_update(ChildResource::Service(svc), &ChildResource::Service(live));
        let ChildResource::Service(merged) = merged else {
            panic!("kind changed");
        };
        let spec = merged.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.12"));
        assert_eq!(spec.ports.unwrap()[0].node_port, Some(31672));
    }

    #[test]
    fn test_merge_keeps_immutable_statefulset_fields() {
        let (_, sts) = desired(3);
        let mut live = sts.clone();
        if let Some(spec) = live.spec.as_mut() {
            spec.service_name = "legacy-headless".into();
        }
        let merged = merge_for_update(
            ChildResource::StatefulSet(sts),
            &ChildResource::StatefulSet(live),
        );
        let ChildResource::StatefulSet(merged) = merged else {
            panic!("kind changed");
        };
        assert_eq!(merged.spec.unwrap().service_name, "legacy-headless");
    }

    #[test]
    fn test_node_ports_dropped_when_switching_to_cluster_ip() {
        let mut live = with_service(|s| s.r#type = "NodePort".into());
        if let Some(ports) = live.spec.as_mut().and_then(|s| s.ports.as_mut()) {
            for (i, port) in ports.iter_mut().enumerate() {
                port.node_port = Some(31000 + i as i32);
            }
        }
        let desired = with_service(|s| s.r#type = "ClusterIP".into());

        let ChildResource::Service(merged) =
            merge_for_update(ChildResource::Service(desired), &ChildResource::Service(live))
        else {
            panic!("kind changed");
        };
        let spec = merged.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert!(spec.ports.unwrap().iter().all(|p| p.node_port.is_none()));
    }

    #[test]
    fn test_node_ports_kept_for_load_balancer() {
        let mut live = with_service(|s| s.r#type = "NodePort".into());
        if let Some(ports) = live.spec.as_mut().and_then(|s| s.ports.as_mut()) {
            ports[0].node_port = Some(30672);
        }
        let desired = with_service(|s| s.r#type = "LoadBalancer".into());

        let ChildResource::Service(merged) =
            merge_for_update(ChildResource::Service(desired), &ChildResource::Service(live))
        else {
            panic!("kind changed");
        };
        assert_eq!(merged.spec.unwrap().ports.unwrap()[0].node_port, Some(30672));
    }

    #[test]
    fn test_removed_service_annotation_is_cleared() {
        let mut live = with_service(|s| {
            s.annotations.insert("lb/internal".into(), "true".into());
        });
        live.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("team/owner".into(), "payments".into());
        let desired = with_service(|_| {});

        let merged = merge_for_update(ChildResource::Service(desired), &ChildResource::Service(live));
        let keys = annotation_keys(&merged);
        assert!(!keys.contains(&"lb/internal".to_string()), "{:?}", keys);
        assert!(!keys.contains(&MANAGED_ANNOTATIONS.to_string()), "{:?}", keys);
        assert!(keys.contains(&"team/owner".to_string()), "{:?}", keys);
        assert!(keys.contains(&crate::resources::SPEC_HASH_ANNOTATION.to_string()));
    }

    #[test]
    fn test_changed_service_annotation_replaces_old_one() {
        let live = with_service(|s| {
            s.annotations.insert("lb/internal".into(), "true".into());
            s.annotations.insert("lb/scheme".into(), "internet-facing".into());
        });
        let desired = with_service(|s| {
            s.annotations.insert("lb/scheme".into(), "internal".into());
        });

        let merged = merge_for_update(ChildResource::Service(desired), &ChildResource::Service(live));
        let annotations = merged.meta().annotations.clone().unwrap();
        assert_eq!(annotations.get("lb/internal"), None);
        assert_eq!(annotations.get("lb/scheme").map(String::as_str), Some("internal"));
        assert_eq!(
            annotations.get(MANAGED_ANNOTATIONS).map(String::as_str),
            Some("lb/scheme")
        );
    }
}

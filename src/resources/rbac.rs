//! Peer-discovery identity: ServiceAccount, Role and RoleBinding

use super::ClusterNames;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

pub(super) fn service_account(names: &ClusterNames, owner: &OwnerReference) -> ServiceAccount {
    ServiceAccount {
        metadata: names.child_meta(names.service_account(), "rbac", owner),
        ..Default::default()
    }
}

/// Nodes read the headless service endpoints to find their peers.
pub(super) fn role(names: &ClusterNames, owner: &OwnerReference) -> Role {
    Role {
        metadata: names.child_meta(names.role(), "rbac", owner),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["endpoints".to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["events".to_string()]),
                verbs: vec!["create".to_string()],
                ..Default::default()
            },
        ]),
    }
}

pub(super) fn role_binding(names: &ClusterNames, owner: &OwnerReference) -> RoleBinding {
    RoleBinding {
        metadata: names.child_meta(names.role_binding(), "rbac", owner),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: names.role(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: names.service_account(),
            namespace: Some(names.namespace.clone()),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_links_role_and_account() {
        let names = ClusterNames::new("orders", "messaging");
        let owner = OwnerReference::default();
        let binding = role_binding(&names, &owner);
        let account = service_account(&names, &owner);
        let role = role(&names, &owner);

        assert_eq!(binding.role_ref.name, role.metadata.name.unwrap());
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(Some(subject.name.clone()), account.metadata.name);
        assert_eq!(subject.namespace.as_deref(), Some("messaging"));
    }
}

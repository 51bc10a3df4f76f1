//! Erlang cookie and default admin credential secrets

use super::{ClusterNames, SecretGenerator, ROTATION_ANNOTATION};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

pub const ERLANG_COOKIE_KEY: &str = ".erlang.cookie";
pub const ADMIN_USERNAME_KEY: &str = "username";
pub const ADMIN_PASSWORD_KEY: &str = "password";

const COOKIE_LENGTH: usize = 32;
const USERNAME_LENGTH: usize = 16;
const PASSWORD_LENGTH: usize = 24;

/// Read a key from a secret, checking `data` before `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .cloned()
        })
}

fn opaque(data: BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    data.into_iter()
        .map(|(k, v)| (k, ByteString(v.into_bytes())))
        .collect()
}

/// The node identity secret. The cookie is generated once and then copied
/// from the live object on every later pass.
pub(super) fn erlang_cookie(
    names: &ClusterNames,
    owner: &OwnerReference,
    existing: Option<&Secret>,
    generator: &dyn SecretGenerator,
) -> Secret {
    let cookie = existing
        .and_then(|s| secret_value(s, ERLANG_COOKIE_KEY))
        .unwrap_or_else(|| generator.generate(COOKIE_LENGTH));

    let mut data = BTreeMap::new();
    data.insert(ERLANG_COOKIE_KEY.to_string(), cookie);

    Secret {
        metadata: names.child_meta(names.erlang_cookie(), "erlang-cookie", owner),
        type_: Some("Opaque".to_string()),
        data: Some(opaque(data)),
        ..Default::default()
    }
}

/// The default admin credentials.
///
/// The password is regenerated only when the parent carries a rotation token
/// that differs from the one recorded on the existing secret.
pub(super) fn admin_secret(
    names: &ClusterNames,
    owner: &OwnerReference,
    existing: Option<&Secret>,
    rotation: Option<&str>,
    generator: &dyn SecretGenerator,
) -> Secret {
    let recorded = existing
        .and_then(|s| s.metadata.annotations.as_ref())
        .and_then(|a| a.get(ROTATION_ANNOTATION))
        .map(String::as_str);
    let rotate = rotation.is_some() && rotation != recorded;

    let username = existing
        .and_then(|s| secret_value(s, ADMIN_USERNAME_KEY))
        .unwrap_or_else(|| generator.generate(USERNAME_LENGTH));
    let password = match existing.and_then(|s| secret_value(s, ADMIN_PASSWORD_KEY)) {
        Some(password) if !rotate => password,
        _ => generator.generate(PASSWORD_LENGTH),
    };

    let mut data = BTreeMap::new();
    data.insert(ADMIN_USERNAME_KEY.to_string(), username);
    data.insert(ADMIN_PASSWORD_KEY.to_string(), password);

    let mut metadata = names.child_meta(names.admin_secret(), "admin-credentials", owner);
    if let Some(token) = rotation {
        let mut annotations = BTreeMap::new();
        annotations.insert(ROTATION_ANNOTATION.to_string(), token.to_string());
        metadata.annotations = Some(annotations);
    }

    Secret {
        metadata,
        type_: Some("Opaque".to_string()),
        data: Some(opaque(data)),
        ..Default::default()
    }
}

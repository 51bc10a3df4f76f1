//! Spec validation, run before any platform call

use crate::crd::{ClusterSpec, ResourceList};
use crate::error::{OperatorError, Result};

const SERVICE_TYPES: [&str; 3] = ["ClusterIP", "NodePort", "LoadBalancer"];
const BINARY_SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_SUFFIXES: [&str; 7] = ["m", "k", "M", "G", "T", "P", "E"];

fn invalid(msg: impl Into<String>) -> OperatorError {
    OperatorError::InvalidSpec(msg.into())
}

/// Check the declared spec. Violations are reported as `InvalidSpec`.
pub fn validate(spec: &ClusterSpec) -> Result<()> {
    if spec.replicas < 1 {
        return Err(invalid(format!(
            "replicas must be at least 1, got {}",
            spec.replicas
        )));
    }
    if spec.image.trim().is_empty() {
        return Err(invalid("image must not be empty"));
    }
    if let Some(secret) = &spec.image_pull_secret {
        validate_dns_subdomain("imagePullSecret", secret)?;
    }

    validate_quantity("persistence.storage", &spec.persistence.storage)?;
    if let Some(class) = &spec.persistence.storage_class_name {
        validate_dns_subdomain("persistence.storageClassName", class)?;
    }
    validate_resource_list("resources.limits", &spec.resources.limits)?;
    validate_resource_list("resources.requests", &spec.resources.requests)?;

    if !SERVICE_TYPES.contains(&spec.service.r#type.as_str()) {
        return Err(invalid(format!(
            "service.type must be one of {:?}, got {:?}",
            SERVICE_TYPES, spec.service.r#type
        )));
    }

    for (key, value) in &spec.rabbitmq.additional_config {
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) || key.contains('=') {
            return Err(invalid(format!(
                "rabbitmq.additionalConfig key {:?} is not a valid setting name",
                key
            )));
        }
        if value.contains('\n') || value.contains('\r') || value.trim().is_empty() {
            return Err(invalid(format!(
                "rabbitmq.additionalConfig value for {:?} must be a single non-empty line",
                key
            )));
        }
    }
    for plugin in &spec.rabbitmq.additional_plugins {
        let plugin = plugin.trim();
        let valid = !plugin.is_empty()
            && plugin
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(invalid(format!(
                "rabbitmq.additionalPlugins entry {:?} is not a valid plugin name",
                plugin
            )));
        }
    }

    if let Some(tls) = &spec.tls {
        validate_dns_subdomain("tls.secretName", &tls.secret_name)?;
        if let Some(ca) = &tls.ca_secret_name {
            validate_dns_subdomain("tls.caSecretName", ca)?;
            if ca == &tls.secret_name {
                return Err(invalid(
                    "tls.caSecretName must differ from tls.secretName",
                ));
            }
        }
    }

    Ok(())
}

fn validate_resource_list(field: &str, list: &ResourceList) -> Result<()> {
    if let Some(cpu) = &list.cpu {
        validate_quantity(&format!("{}.cpu", field), cpu)?;
    }
    if let Some(memory) = &list.memory {
        validate_quantity(&format!("{}.memory", field), memory)?;
    }
    Ok(())
}

/// Accepts the plain and suffixed forms of a Kubernetes quantity, e.g.
/// `10Gi`, `500m`, `1.5`, `2G`.
fn validate_quantity(field: &str, value: &str) -> Result<()> {
    let number = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|suffix| value.strip_suffix(suffix))
        .unwrap_or(value);

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    let valid = digits(whole) && fraction.map_or(true, digits);
    if !valid {
        return Err(invalid(format!(
            "{} {:?} is not a valid quantity",
            field, value
        )));
    }
    Ok(())
}

/// RFC 1123 subdomain: lowercase alphanumerics, '-' and '.', alphanumeric at
/// both ends, at most 253 characters.
fn validate_dns_subdomain(field: &str, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let edge_ok = |b: Option<&u8>| b.is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let valid = !value.is_empty()
        && value.len() <= 253
        && edge_ok(bytes.first())
        && edge_ok(bytes.last())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-' || *b == b'.');
    if !valid {
        return Err(invalid(format!(
            "{} {:?} is not a valid DNS subdomain name",
            field, value
        )));
    }
    Ok(())
}

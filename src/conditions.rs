//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for the conditions reported on
//! `RabbitmqCluster.status`, following the Kubernetes API conventions.

use crate::crd::ClusterCondition;
use chrono::{DateTime, Utc};

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// RabbitmqCluster condition types, in reporting order
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_CLUSTER_AVAILABLE: &str = "ClusterAvailable";
pub const CONDITION_RECONCILE_SUCCESS: &str = "ReconcileSuccess";

pub const CONDITION_ORDER: [&str; 3] = [
    CONDITION_READY,
    CONDITION_CLUSTER_AVAILABLE,
    CONDITION_RECONCILE_SUCCESS,
];

/// Finalizer registered on every RabbitmqCluster the operator manages
pub const CLUSTER_FINALIZER: &str = "deletion.finalizers.rabbitmqclusters.rabbitmq.com";

/// Build a condition stamped with `now`.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> ClusterCondition {
    ClusterCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(now.to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

pub fn status_str(value: bool) -> &'static str {
    if value {
        CONDITION_TRUE
    } else {
        CONDITION_FALSE
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ClusterCondition>, new: ClusterCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(
    conditions: &'a [ClusterCondition],
    condition_type: &str,
) -> Option<&'a ClusterCondition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Drop unknown condition types and sort the rest into reporting order.
pub fn normalize(conditions: &mut Vec<ClusterCondition>) {
    conditions.retain(|c| CONDITION_ORDER.contains(&c.r#type.as_str()));
    conditions.sort_by_key(|c| {
        CONDITION_ORDER
            .iter()
            .position(|t| *t == c.r#type)
            .unwrap_or(CONDITION_ORDER.len())
    });
}

//! Status aggregation
//!
//! Observes the workload and client endpoints, then folds the observation
//! into the `RabbitmqCluster` status conditions.

use crate::conditions::{
    build_condition, normalize, set_condition, status_str, CONDITION_CLUSTER_AVAILABLE,
    CONDITION_READY, CONDITION_RECONCILE_SUCCESS, CONDITION_TRUE,
};
use crate::crd::ClusterStatus;
use crate::error::{OperatorError, Result};
use crate::platform::Platform;
use crate::resources::{ChildResource, ClusterNames, ResourceKind};
use chrono::{DateTime, Utc};

/// What the platform reports about a cluster's workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveState {
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub ready_endpoints: usize,
}

impl LiveState {
    pub fn all_ready(&self) -> bool {
        self.ready_replicas == self.desired_replicas && self.ready_endpoints > 0
    }

    pub fn available(&self) -> bool {
        self.ready_endpoints > 0
    }
}

/// Read ready replica and endpoint counts for a cluster.
pub async fn observe(
    platform: &dyn Platform,
    names: &ClusterNames,
    desired_replicas: i32,
) -> Result<LiveState> {
    let ready_replicas = match platform
        .get_child(&names.namespace, ResourceKind::StatefulSet, &names.statefulset())
        .await?
    {
        Some(ChildResource::StatefulSet(sts)) => sts
            .status
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
        _ => 0,
    };
    let ready_endpoints = platform
        .ready_endpoint_addresses(&names.namespace, &names.client_service())
        .await?;

    Ok(LiveState {
        desired_replicas,
        ready_replicas,
        ready_endpoints,
    })
}

/// Status after a successful pass. Transition times of unchanged conditions
/// are carried over from `previous`.
pub fn compute_status(
    live: &LiveState,
    previous: Option<&ClusterStatus>,
    now: DateTime<Utc>,
) -> ClusterStatus {
    let mut status = previous.cloned().unwrap_or_default();
    status.replicas = live.desired_replicas;
    status.ready_replicas = live.ready_replicas;

    let (ready_reason, ready_message) = if live.all_ready() {
        (
            "AllReplicasReady",
            format!("{}/{} replicas ready", live.ready_replicas, live.desired_replicas),
        )
    } else if live.ready_replicas != live.desired_replicas {
        (
            "NotAllReplicasReady",
            format!("{}/{} replicas ready", live.ready_replicas, live.desired_replicas),
        )
    } else {
        (
            "NoEndpointsAvailable",
            "all replicas ready but the client service has no ready endpoints".to_string(),
        )
    };
    set_condition(
        &mut status.conditions,
        build_condition(
            CONDITION_READY,
            status_str(live.all_ready()),
            ready_reason,
            &ready_message,
            now,
        ),
    );

    let (available_reason, available_message) = if live.available() {
        (
            "AtLeastOneEndpointAvailable",
            format!("{} ready endpoint address(es)", live.ready_endpoints),
        )
    } else {
        (
            "NoEndpointsAvailable",
            "the client service has no ready endpoints".to_string(),
        )
    };
    set_condition(
        &mut status.conditions,
        build_condition(
            CONDITION_CLUSTER_AVAILABLE,
            status_str(live.available()),
            available_reason,
            &available_message,
            now,
        ),
    );

    set_condition(
        &mut status.conditions,
        build_condition(
            CONDITION_RECONCILE_SUCCESS,
            CONDITION_TRUE,
            "Success",
            "all child resources match the desired state",
            now,
        ),
    );

    normalize(&mut status.conditions);
    status
}

/// Status after a failed pass: the previous observation stays, only the
/// reconcile condition changes.
pub fn failed_status(
    err: &OperatorError,
    previous: Option<&ClusterStatus>,
    now: DateTime<Utc>,
) -> ClusterStatus {
    let mut status = previous.cloned().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        build_condition(
            CONDITION_RECONCILE_SUCCESS,
            status_str(false),
            err.reason(),
            &err.to_string(),
            now,
        ),
    );
    normalize(&mut status.conditions);
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{find_condition, CONDITION_FALSE, CONDITION_ORDER};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn live(desired: i32, ready: i32, endpoints: usize) -> LiveState {
        LiveState {
            desired_replicas: desired,
            ready_replicas: ready,
            ready_endpoints: endpoints,
        }
    }

    fn condition_status<'a>(status: &'a ClusterStatus, t: &str) -> &'a str {
        find_condition(&status.conditions, t).unwrap().status.as_str()
    }

    #[test]
    fn test_partial_readiness() {
        let status = compute_status(&live(3, 2, 2), None, at(0));
        assert_eq!(condition_status(&status, CONDITION_READY), CONDITION_FALSE);
        assert_eq!(
            condition_status(&status, CONDITION_CLUSTER_AVAILABLE),
            CONDITION_TRUE
        );
        assert_eq!(
            condition_status(&status, CONDITION_RECONCILE_SUCCESS),
            CONDITION_TRUE
        );
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.replicas, 3);
    }

    #[test]
    fn test_all_ready() {
        let status = compute_status(&live(3, 3, 3), None, at(0));
        assert_eq!(condition_status(&status, CONDITION_READY), CONDITION_TRUE);
        let types: Vec<&str> = status.conditions.iter().map(|c| c.r#type.as_str()).collect();
        assert_eq!(types, CONDITION_ORDER.to_vec());
    }

    #[test]
    fn test_ready_replicas_without_endpoints_are_not_ready() {
        let status = compute_status(&live(1, 1, 0), None, at(0));
        assert_eq!(condition_status(&status, CONDITION_READY), CONDITION_FALSE);
        assert_eq!(
            condition_status(&status, CONDITION_CLUSTER_AVAILABLE),
            CONDITION_FALSE
        );
    }

    #[test]
    fn test_same_observation_is_stable() {
        let first = compute_status(&live(3, 3, 3), None, at(0));
        let second = compute_status(&live(3, 3, 3), Some(&first), at(120));
        assert_eq!(first, second);
    }

    #[test]
    fn test_transition_time_moves_only_on_flip() {
        let first = compute_status(&live(3, 2, 2), None, at(0));
        let second = compute_status(&live(3, 3, 3), Some(&first), at(60));

        let ready = find_condition(&second.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.last_transition_time, Some(at(60).to_rfc3339()));
        let available = find_condition(&second.conditions, CONDITION_CLUSTER_AVAILABLE).unwrap();
        assert_eq!(available.last_transition_time, Some(at(0).to_rfc3339()));
    }

    #[test]
    fn test_failed_status_keeps_observation() {
        let ok = compute_status(&live(3, 3, 3), None, at(0));
        let err = OperatorError::InvalidSpec("replicas must be at least 1".into());
        let failed = failed_status(&err, Some(&ok), at(30));

        assert_eq!(failed.ready_replicas, 3);
        assert_eq!(condition_status(&failed, CONDITION_READY), CONDITION_TRUE);
        let reconcile = find_condition(&failed.conditions, CONDITION_RECONCILE_SUCCESS).unwrap();
        assert_eq!(reconcile.status, CONDITION_FALSE);
        assert_eq!(reconcile.reason.as_deref(), Some("InvalidSpec"));
        assert!(reconcile.message.as_deref().unwrap().contains("replicas"));
    }
}

//! Lease-based leader election.
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! dispatcher; standbys wait in [`LeaderElector::acquire`] until the lease
//! expires or is released.

use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "rabbitmq-cluster-operator-leader";

/// Lease timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    pub duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Explicit argument, then the mounted service account namespace, then `default`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.trim().is_empty() {
        return explicit.trim().to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

/// A lease is free when nobody holds it or the holder stopped renewing.
fn is_expired(spec: Option<&LeaseSpec>, default_duration: Duration, now: DateTime<Utc>) -> bool {
    if spec.and_then(|s| s.holder_identity.as_deref()).is_none() {
        return true;
    }
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .map(i64::from)
        .unwrap_or(default_duration.as_secs() as i64);
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(renewed)) => now.signed_duration_since(*renewed).num_seconds() > duration_secs,
        None => true,
    }
}

pub struct LeaderElector {
    leases: Api<Lease>,
    identity: String,
    timing: LeaseTiming,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("rabbitmq-cluster-operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, "Initialized leader elector");
        Self {
            leases: Api::namespaced(client, namespace),
            identity,
            timing: LeaseTiming::default(),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        self.timing.renew_interval
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) {
        info!(identity = %self.identity, lease = LEASE_NAME, "Waiting for leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return;
                }
                Ok(false) => debug!("Lease held by another replica"),
                Err(e) => warn!(error = %e, "Lease acquisition failed"),
            }
            tokio::time::sleep(self.timing.retry_interval).await;
        }
    }

    /// `Ok(false)` means leadership was lost.
    pub async fn renew(&self) -> Result<bool> {
        let Some(lease) = self.leases.get_opt(LEASE_NAME).await? else {
            return Ok(false);
        };
        if holder(&lease) != Some(self.identity.as_str()) {
            return Ok(false);
        }
        let mut renewed = lease;
        if let Some(spec) = renewed.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.write(&renewed).await
    }

    /// Give up the lease so a standby can take over without waiting for expiry.
    pub async fn release(&self) {
        let lease = match self.leases.get_opt(LEASE_NAME).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        if holder(&lease) != Some(self.identity.as_str()) {
            return;
        }
        let mut released = lease;
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self.write(&released).await {
            Ok(true) => info!("Released leader lease"),
            Ok(false) => debug!("Lease changed before release"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(existing) = self.leases.get_opt(LEASE_NAME).await? else {
            return self.create(now).await;
        };

        let ours = holder(&existing) == Some(self.identity.as_str());
        if !ours && !is_expired(existing.spec.as_ref(), self.timing.duration, now) {
            return Ok(false);
        }

        let previous = existing.spec.clone().unwrap_or_default();
        let transitions = previous.lease_transitions.unwrap_or(0);
        let mut claimed = existing;
        claimed.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.timing.duration.as_secs() as i32),
            acquire_time: if ours {
                previous.acquire_time
            } else {
                Some(MicroTime(now))
            },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if ours { transitions } else { transitions + 1 }),
            ..Default::default()
        });
        self.write(&claimed).await
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.timing.duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.leases.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) => conflict_means_lost(e.into()),
        }
    }

    /// Replace guarded by the lease's resource version.
    async fn write(&self, lease: &Lease) -> Result<bool> {
        match self
            .leases
            .replace(LEASE_NAME, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => conflict_means_lost(e.into()),
        }
    }
}

fn conflict_means_lost(err: OperatorError) -> Result<bool> {
    if err.is_conflict() {
        Ok(false)
    } else {
        Err(err)
    }
}

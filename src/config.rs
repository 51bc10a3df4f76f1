//! Operator configuration
//!
//! Command-line flags (with environment fallbacks) are parsed into [`Args`]
//! and turned into an [`OperatorConfig`], which is passed explicitly to every
//! component that needs it.

use crate::error::{OperatorError, Result};
use crate::resources::ResourceKind;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_FIELD_MANAGER: &str = "rabbitmq-cluster-operator";

/// RabbitMQ Cluster Kubernetes Operator
#[derive(Parser, Debug, Clone)]
#[command(name = "rabbitmq-cluster-operator")]
#[command(version, about = "Kubernetes Operator for RabbitMQ clusters")]
pub struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    pub leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    pub leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "OPERATOR_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Seconds between full resyncs of every cluster
    #[arg(long, default_value_t = 300)]
    pub resync_period_secs: u64,

    /// First retry delay after a failed pass, in seconds
    #[arg(long, default_value_t = 5)]
    pub backoff_base_secs: u64,

    /// Upper bound for the retry delay, in seconds
    #[arg(long, default_value_t = 300)]
    pub backoff_ceiling_secs: u64,

    /// Conflicts retried immediately before switching to backoff
    #[arg(long, default_value_t = 3)]
    pub max_immediate_retries: u32,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "true", action = clap::ArgAction::Set)]
    pub log_json: bool,
}

/// Runtime configuration shared by the platform client and dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Restrict watching to one namespace; `None` watches all namespaces
    pub namespace: Option<String>,
    pub workers: usize,
    pub resync_period: Duration,
    pub backoff: BackoffPolicy,
    /// Name recorded as the field manager on writes
    pub field_manager: String,
    /// Child kinds whose changes are routed back to their parent cluster
    pub watched_kinds: Vec<ResourceKind>,
}

/// Retry timing for failed reconcile passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    pub max_immediate_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            ceiling: Duration::from_secs(300),
            max_immediate_retries: 3,
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            resync_period: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            watched_kinds: ResourceKind::ALL.to_vec(),
        }
    }
}

impl TryFrom<&Args> for OperatorConfig {
    type Error = OperatorError;

    fn try_from(args: &Args) -> Result<Self> {
        if args.workers == 0 {
            return Err(OperatorError::InvalidSpec(
                "--workers must be at least 1".to_string(),
            ));
        }
        if args.backoff_base_secs == 0 || args.backoff_ceiling_secs < args.backoff_base_secs {
            return Err(OperatorError::InvalidSpec(format!(
                "backoff base ({}s) must be positive and not exceed the ceiling ({}s)",
                args.backoff_base_secs, args.backoff_ceiling_secs
            )));
        }
        if args.resync_period_secs == 0 {
            return Err(OperatorError::InvalidSpec(
                "--resync-period-secs must be positive".to_string(),
            ));
        }

        Ok(Self {
            namespace: Some(args.namespace.trim())
                .filter(|ns| !ns.is_empty())
                .map(str::to_string),
            workers: args.workers,
            resync_period: Duration::from_secs(args.resync_period_secs),
            backoff: BackoffPolicy {
                base: Duration::from_secs(args.backoff_base_secs),
                ceiling: Duration::from_secs(args.backoff_ceiling_secs),
                max_immediate_retries: args.max_immediate_retries,
            },
            ..Default::default()
        })
    }
}

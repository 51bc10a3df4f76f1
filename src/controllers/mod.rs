//! Controllers for the RabbitMQ cluster operator
//!
//! - [`Reconciler`]: one convergence pass for a single cluster
//! - [`Dispatcher`]: keyed work queue and worker pool driving the passes
//! - [`ClusterController`]: production wiring against the Kubernetes API

mod cluster;
pub mod dispatcher;
pub mod finalizer;
pub mod reconciler;
pub mod status;

pub use cluster::ClusterController;
pub use dispatcher::{Completion, Dispatcher, KeyState, Reconcile, WorkQueue};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use status::{compute_status, LiveState};

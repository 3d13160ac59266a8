//! fleet-converge - convergence verification for scaled worker fleets
//!
//! After a provisioning group (MachineSet) is scaled, an external controller
//! creates or removes nodes, records them in a tracker ConfigMap, and writes a
//! credentials Secret per instance. None of these updates arrive in order.
//! This crate observes those side effects and decides whether the cluster has
//! converged to the requested fleet size.
//!
//! # Modules
//!
//! - [`poll`] - Convergence poller with an injectable clock
//! - [`identity`] - Instance identifier extraction and node correlation
//! - [`tracker`] - Tracker ConfigMap validation
//! - [`credentials`] - Per-instance credential secret validation
//! - [`node_meta`] - Worker label and taint validation
//! - [`bootstrap`] - Bootstrap data vs. private key validation
//! - [`scale`] - Scale-down flow with cleanup
//! - [`context`] - Test context and suite fixture
//! - [`cluster`] - Cluster API boundary (kube-rs)
//! - [`harness`] - Run-all-and-report test driver
//! - [`config`] - Environment-driven configuration
//! - [`retry`] - Backoff for establishing the cluster client
//! - [`error`] - Error types

#![deny(missing_docs)]

use std::time::Duration;

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod harness;
pub mod identity;
pub mod node_meta;
pub mod poll;
pub mod retry;
pub mod scale;
pub mod tracker;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace of the operator that tracks managed nodes
pub const OPERATOR_NAMESPACE: &str = "windows-machine-config-operator";

/// Namespace holding MachineSets and the bootstrap user data
pub const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";

/// Name of the tracker ConfigMap, keyed by instance id
pub const TRACKER_CONFIG_MAP: &str = "windows-node-tracker";

/// Label selector for nodes managed by the operator
pub const MANAGED_NODE_SELECTOR: &str = "kubernetes.io/os=windows";

/// Label key every managed node must carry
pub const WORKER_LABEL: &str = "node-role.kubernetes.io/worker";

/// Secret holding the cloud private key
pub const PRIVATE_KEY_SECRET: &str = "cloud-private-key";

/// Data key of the private key within [`PRIVATE_KEY_SECRET`]
pub const PRIVATE_KEY_KEY: &str = "private-key.pem";

/// Secret holding the bootstrap user data
pub const BOOTSTRAP_DATA_SECRET: &str = "windows-user-data";

/// Data key of the payload within [`BOOTSTRAP_DATA_SECRET`]
pub const BOOTSTRAP_DATA_KEY: &str = "userData";

/// Default sleep between poll attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Measured time for one node to be provisioned and fully configured
pub const DEFAULT_PER_NODE_TIMEOUT: Duration = Duration::from_secs(12 * 60);

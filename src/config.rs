//! Harness configuration
//!
//! Defaults match the Windows worker fleet managed by the machine config
//! operator. Every value can be overridden through `FLEET_*` environment
//! variables so the same suite runs against differently named deployments.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::{
    BOOTSTRAP_DATA_KEY, BOOTSTRAP_DATA_SECRET, DEFAULT_PER_NODE_TIMEOUT, DEFAULT_RETRY_INTERVAL,
    MACHINE_API_NAMESPACE, MANAGED_NODE_SELECTOR, OPERATOR_NAMESPACE, PRIVATE_KEY_KEY,
    PRIVATE_KEY_SECRET, TRACKER_CONFIG_MAP, WORKER_LABEL,
};

/// A taint that must be present on every managed node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequiredTaint {
    /// Taint key
    pub key: String,
    /// Taint value
    pub value: String,
    /// Taint effect (NoSchedule, PreferNoSchedule, NoExecute)
    pub effect: String,
}

impl Default for RequiredTaint {
    fn default() -> Self {
        Self {
            key: "os".to_string(),
            value: "Windows".to_string(),
            effect: "NoSchedule".to_string(),
        }
    }
}

/// A reference to one key inside a Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretKeyRef {
    /// Secret namespace
    pub namespace: String,
    /// Secret name
    pub name: String,
    /// Data key within the secret
    pub key: String,
}

impl SecretKeyRef {
    fn new(namespace: &str, name: &str, key: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        }
    }
}

/// Configuration for one convergence run
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Optional kubeconfig path; the in-cluster/default config is inferred when unset
    pub kubeconfig: Option<PathBuf>,
    /// Namespace holding the tracker ConfigMap and per-instance secrets
    pub namespace: String,
    /// Namespace holding the provisioning groups (MachineSets)
    pub provisioning_namespace: String,
    /// Sleep between poll attempts
    pub retry_interval: Duration,
    /// Per-node provisioning allowance; also the single-item poll timeout
    pub timeout: Duration,
    /// Label selector identifying managed worker nodes
    pub node_selector: String,
    /// Name of the tracker ConfigMap
    pub tracker_name: String,
    /// Label key that must be present on every managed node
    pub worker_label: String,
    /// Taint that must be present on every managed node
    pub required_taint: RequiredTaint,
    /// Secret holding the cloud private key
    pub private_key: SecretKeyRef,
    /// Secret holding the bootstrap (user) data
    pub bootstrap_data: SecretKeyRef,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: OPERATOR_NAMESPACE.to_string(),
            provisioning_namespace: MACHINE_API_NAMESPACE.to_string(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            timeout: DEFAULT_PER_NODE_TIMEOUT,
            node_selector: MANAGED_NODE_SELECTOR.to_string(),
            tracker_name: TRACKER_CONFIG_MAP.to_string(),
            worker_label: WORKER_LABEL.to_string(),
            required_taint: RequiredTaint::default(),
            private_key: SecretKeyRef::new(OPERATOR_NAMESPACE, PRIVATE_KEY_SECRET, PRIVATE_KEY_KEY),
            bootstrap_data: SecretKeyRef::new(
                MACHINE_API_NAMESPACE,
                BOOTSTRAP_DATA_SECRET,
                BOOTSTRAP_DATA_KEY,
            ),
        }
    }
}

impl HarnessConfig {
    /// Build a config from `FLEET_*` environment variables over the defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    ///
    /// Unparsable numeric values keep their default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("FLEET_KUBECONFIG").filter(|p| !p.is_empty()) {
            config.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(ns) = lookup("FLEET_NAMESPACE").filter(|n| !n.is_empty()) {
            config.private_key.namespace = ns.clone();
            config.namespace = ns;
        }
        if let Some(ns) = lookup("FLEET_PROVISIONING_NAMESPACE").filter(|n| !n.is_empty()) {
            config.bootstrap_data.namespace = ns.clone();
            config.provisioning_namespace = ns;
        }
        if let Some(selector) = lookup("FLEET_NODE_SELECTOR").filter(|s| !s.is_empty()) {
            config.node_selector = selector;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_RETRY_INTERVAL_SECS") {
            config.retry_interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_TIMEOUT_SECS") {
            config.timeout = secs;
        }

        config
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            warn!(variable = %key, value = %raw, error = %e, "ignoring unparsable duration");
            None
        }
    }
}

/// Parse the expected node count and provisioning-group names of an e2e suite.
///
/// Reads `FLEET_EXPECTED_NODES` (default 0) and the comma-separated
/// `FLEET_PROVISIONING_GROUPS`.
pub fn suite_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> (usize, Vec<String>) {
    let expected = match lookup("FLEET_EXPECTED_NODES") {
        Some(raw) => raw.trim().parse::<usize>().unwrap_or_else(|e| {
            warn!(value = %raw, error = %e, "ignoring unparsable FLEET_EXPECTED_NODES");
            0
        }),
        None => 0,
    };
    let groups = lookup("FLEET_PROVISIONING_GROUPS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    (expected, groups)
}

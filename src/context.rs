//! Test context and suite fixture
//!
//! A [`TestContext`] is created once per test: it owns the cluster handle, the
//! poll settings and the last tracker ConfigMap it observed. A
//! [`SuiteFixture`] is created once per suite and passed by reference to every
//! test; it carries the expected fleet size, the provisioning groups under
//! test and the node list recorded by the last node wait.

use std::sync::{Arc, Mutex, PoisonError};

use k8s_openapi::api::core::v1::{ConfigMap, Node};
use tracing::{debug, info};

use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::HarnessConfig;
use crate::identity::{
    active_instance_ids, find_node_by_instance_id, node_external_ip, node_name, provider_ref,
};
use crate::poll::{Convergence, Poller};
use crate::Error;

/// State shared by every test of one suite run
#[derive(Clone, Debug, Default)]
pub struct SuiteFixture {
    /// Provisioning groups (MachineSets) created for this run
    pub provisioning_groups: Vec<String>,
    /// Number of managed nodes the fleet should currently have
    pub expected_nodes: usize,
    /// Managed nodes recorded by the last [`TestContext::wait_for_nodes`]
    pub nodes: Vec<Node>,
}

impl SuiteFixture {
    /// Create a fixture for a fleet of `expected_nodes` nodes
    pub fn new(provisioning_groups: Vec<String>, expected_nodes: usize) -> Self {
        Self {
            provisioning_groups,
            expected_nodes,
            nodes: Vec::new(),
        }
    }
}

/// Per-test state
pub struct TestContext {
    cluster: Arc<dyn ClusterApi>,
    /// Names, namespaces and timing for this run
    pub config: HarnessConfig,
    poller: Poller,
    pub(crate) tracker: Option<ConfigMap>,
}

impl TestContext {
    /// Create a context polling on the tokio clock
    pub fn new(cluster: Arc<dyn ClusterApi>, config: HarnessConfig) -> Self {
        let poller = Poller::new(config.retry_interval, config.timeout);
        Self::with_poller(cluster, config, poller)
    }

    /// Create a context with an explicit poller
    pub fn with_poller(cluster: Arc<dyn ClusterApi>, config: HarnessConfig, poller: Poller) -> Self {
        Self {
            cluster,
            config,
            poller,
            tracker: None,
        }
    }

    /// Connect to the cluster described by `config`
    pub async fn connect(config: HarnessConfig) -> Result<Self, Error> {
        let cluster = KubeCluster::connect(config.kubeconfig.as_deref()).await?;
        Ok(Self::new(Arc::new(cluster), config))
    }

    /// Cluster handle
    pub fn cluster(&self) -> &dyn ClusterApi {
        self.cluster.as_ref()
    }

    /// Poll settings
    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Tracker ConfigMap observed by the last successful tracker wait
    pub fn tracker(&self) -> Option<&ConfigMap> {
        self.tracker.as_ref()
    }

    /// Managed nodes currently reported by the API server
    pub async fn list_managed_nodes(&self) -> Result<Vec<Node>, Error> {
        self.cluster.list_nodes(&self.config.node_selector).await
    }

    /// Wait until exactly `fixture.expected_nodes` managed nodes are Ready
    /// and expose a provider reference, then record them in the fixture.
    ///
    /// A timeout reports the last node list seen.
    pub async fn wait_for_nodes(&self, fixture: &mut SuiteFixture) -> Result<(), Error> {
        let expected = fixture.expected_nodes;
        let what = format!("{} ready managed nodes", expected);
        let last_seen: Mutex<Option<String>> = Mutex::new(None);
        let last_seen_ref = &last_seen;

        let result = self
            .poller
            .wait_for_fleet(&what, expected, || async move {
                let nodes = self.list_managed_nodes().await?;
                let ready = nodes
                    .iter()
                    .filter(|n| is_node_ready(n) && !provider_ref(n).is_empty())
                    .count();
                if nodes.len() == expected && ready == expected {
                    Ok(Convergence::Converged(nodes))
                } else {
                    debug!(expected, observed = nodes.len(), ready, "waiting for managed nodes");
                    *last_seen_ref.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(describe_nodes(&nodes, ready));
                    Ok(Convergence::Pending)
                }
            })
            .await;

        let nodes = match result {
            Ok(nodes) => nodes,
            Err(e) => {
                let last = last_seen.into_inner().unwrap_or_else(PoisonError::into_inner);
                return Err(match last {
                    Some(observed) => e.with_last_observed(observed),
                    None => e,
                });
            }
        };

        info!(count = nodes.len(), "managed nodes converged");
        fixture.nodes = nodes;
        Ok(())
    }

    /// External IP of the node hosting `instance_id`
    pub async fn node_ip(&self, instance_id: &str) -> Result<String, Error> {
        let node =
            find_node_by_instance_id(self.cluster(), &self.config.node_selector, instance_id)
                .await?;
        node_external_ip(&node)
            .map(str::to_string)
            .ok_or_else(|| Error::not_found("ExternalIP", node_name(&node)))
    }
}

/// One-line summary of a node list for timeout messages
fn describe_nodes(nodes: &[Node], ready: usize) -> String {
    let names: Vec<&str> = nodes.iter().map(node_name).collect();
    format!(
        "{} nodes ({} ready) {:?}, instances {:?}",
        nodes.len(),
        ready,
        names,
        active_instance_ids(nodes)
    )
}

/// True when the node's Ready condition is True
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

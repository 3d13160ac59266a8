//! Instance identifier correlation
//!
//! The cloud provider assigns every node a provider reference such as
//! `aws:///us-east-1e/i-078285fdadccb2eaa`. Its last path segment, the
//! instance id, is the join key between nodes, tracker entries and
//! credential secrets.

use k8s_openapi::api::core::v1::Node;

use crate::cluster::ClusterApi;
use crate::Error;

/// Node address type for the externally reachable IP
pub const EXTERNAL_IP: &str = "ExternalIP";

/// Return the instance id encoded in a provider reference.
///
/// This is the final `/`-separated segment. An empty reference yields an
/// empty id; malformed but non-empty references still yield a segment.
pub fn instance_id_from_provider_ref(provider_ref: &str) -> &str {
    provider_ref.rsplit('/').next().unwrap_or_default()
}

/// Provider reference of a node, empty when unset
pub fn provider_ref(node: &Node) -> &str {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .unwrap_or_default()
}

/// Instance ids of all nodes that carry a provider reference.
///
/// Order follows `nodes`; duplicates are kept.
pub fn active_instance_ids(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .map(provider_ref)
        .filter(|r| !r.is_empty())
        .map(|r| instance_id_from_provider_ref(r).to_string())
        .collect()
}

/// Find the managed node hosting `instance_id`.
///
/// Matches the first node (in list order) whose provider reference contains
/// the id as a substring, so `i-1` also matches a node for `i-10`.
pub async fn find_node_by_instance_id(
    cluster: &dyn ClusterApi,
    label_selector: &str,
    instance_id: &str,
) -> Result<Node, Error> {
    let nodes = cluster.list_nodes(label_selector).await?;
    nodes
        .into_iter()
        .find(|node| provider_ref(node).contains(instance_id))
        .ok_or_else(|| Error::not_found("Node", format!("instance {}", instance_id)))
}

/// External IP of a node, if it reports one
pub fn node_external_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == EXTERNAL_IP)
        .map(|a| a.address.as_str())
}

/// Name of a node for log and error messages
pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("<unnamed>")
}

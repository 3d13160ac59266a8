//! Worker label and taint validation
//!
//! The controller applies the worker label and the OS taint when the node
//! joins, so nodes returned by the API already carry their final metadata and
//! no polling is needed.

use k8s_openapi::api::core::v1::Node;

use crate::config::RequiredTaint;
use crate::context::{SuiteFixture, TestContext};
use crate::identity::node_name;
use crate::Error;

/// True when the node carries `label_key`, whatever its value
pub fn has_label(node: &Node, label_key: &str) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(label_key))
}

/// True when the node carries a taint matching key, value and effect
pub fn has_taint(node: &Node, required: &RequiredTaint) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| {
            taints.iter().any(|t| {
                t.key == required.key
                    && t.value.as_deref().unwrap_or_default() == required.value
                    && t.effect == required.effect
            })
        })
}

impl TestContext {
    /// Check that every recorded node carries the worker label
    pub fn validate_worker_label(&self, fixture: &SuiteFixture) -> Result<(), Error> {
        let label = &self.config.worker_label;
        let missing: Vec<String> = fixture
            .nodes
            .iter()
            .filter(|n| !has_label(n, label))
            .map(|n| node_name(n).to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::mismatch(
                format!("nodes without label {}", label),
                missing,
                Vec::new(),
            ))
        }
    }

    /// Check that every recorded node carries the required taint
    pub fn validate_node_taint(&self, fixture: &SuiteFixture) -> Result<(), Error> {
        let taint = &self.config.required_taint;
        let missing: Vec<String> = fixture
            .nodes
            .iter()
            .filter(|n| !has_taint(n, taint))
            .map(|n| node_name(n).to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::mismatch(
                format!(
                    "nodes without taint {}={}:{}",
                    taint.key, taint.value, taint.effect
                ),
                missing,
                Vec::new(),
            ))
        }
    }
}

//! Tracker ConfigMap validation
//!
//! The controller records every fully configured instance as a `binaryData`
//! entry of the tracker ConfigMap, keyed by instance id. Once the fleet has
//! converged the key set must equal the set of active instance ids exactly.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::{debug, info};

use crate::context::{SuiteFixture, TestContext};
use crate::identity::active_instance_ids;
use crate::poll::Convergence;
use crate::Error;

/// Keys of the tracker's `binaryData`
pub fn tracker_keys(tracker: &ConfigMap) -> BTreeSet<String> {
    tracker
        .binary_data
        .as_ref()
        .map(|data| data.keys().cloned().collect())
        .unwrap_or_default()
}

/// Number of instances the tracker currently records
pub fn tracked_count(tracker: &ConfigMap) -> usize {
    tracker.binary_data.as_ref().map_or(0, |d| d.len())
}

/// Compare expected instance ids against observed keys.
///
/// Every missing and every unexpected key is reported in one
/// [`Error::Mismatch`].
pub fn check_membership<'a>(
    context: &str,
    expected: impl IntoIterator<Item = &'a str>,
    observed: &BTreeSet<String>,
) -> Result<(), Error> {
    let expected: BTreeSet<&str> = expected.into_iter().collect();
    let missing: Vec<String> = expected
        .iter()
        .filter(|id| !observed.contains(**id))
        .map(|id| id.to_string())
        .collect();
    let unexpected: Vec<String> = observed
        .iter()
        .filter(|key| !expected.contains(key.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(Error::mismatch(context, missing, unexpected))
    }
}

impl TestContext {
    /// Wait until the tracker exists and records exactly `expected` instances.
    ///
    /// The deadline scales with `expected` since every node has to finish its
    /// configuration before it is recorded. The observed ConfigMap is cached
    /// on the context, including the last one seen before a timeout.
    pub async fn wait_for_tracker(&mut self, expected: usize) -> Result<&ConfigMap, Error> {
        let namespace = self.config.namespace.clone();
        let name = self.config.tracker_name.clone();
        let what = format!("{}/{} ConfigMap to track {} nodes", namespace, name, expected);
        let cluster = self.cluster();
        let last_seen: Mutex<Option<ConfigMap>> = Mutex::new(None);

        let result = self
            .poller()
            .wait_for_fleet(&what, expected, || {
                let namespace = namespace.clone();
                let name = name.clone();
                let last_seen = &last_seen;
                async move {
                    let Some(tracker) = cluster.get_config_map(&namespace, &name).await? else {
                        debug!(namespace = %namespace, name = %name, "waiting for tracker ConfigMap to be created");
                        return Ok(Convergence::Pending);
                    };
                    let tracked = tracked_count(&tracker);
                    if tracked == expected {
                        Ok(Convergence::Converged(tracker))
                    } else {
                        debug!(expected, tracked, "waiting for nodes to be tracked");
                        *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(tracker);
                        Ok(Convergence::Pending)
                    }
                }
            })
            .await;

        let tracker = match result {
            Ok(tracker) => tracker,
            Err(e) => {
                let last = last_seen
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some(last) = last else {
                    return Err(e);
                };
                let keys = tracker_keys(&last);
                self.tracker = Some(last);
                return Err(e.with_last_observed(format!(
                    "{} of {} entries {:?}",
                    keys.len(),
                    expected,
                    keys
                )));
            }
        };

        info!(namespace = %namespace, name = %name, expected, "tracker ConfigMap tracking required number of nodes");
        Ok(self.tracker.insert(tracker))
    }

    /// Validate that the tracker records exactly the fixture's active instances.
    ///
    /// Read-only, so repeated runs on a converged fleet give the same verdict.
    pub async fn validate_tracker(&mut self, fixture: &SuiteFixture) -> Result<(), Error> {
        let tracker = self.wait_for_tracker(fixture.expected_nodes).await?;
        let keys = tracker_keys(tracker);
        let ids = active_instance_ids(&fixture.nodes);
        check_membership(
            "tracker ConfigMap keys vs. active instances",
            ids.iter().map(String::as_str),
            &keys,
        )
    }
}

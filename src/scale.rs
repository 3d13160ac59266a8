//! Scale-down flow
//!
//! The only path in this crate that writes to the cluster. A provisioning
//! group's desired replicas are patched, the flow waits for the node list and
//! the tracker ConfigMap to follow, and finally every provisioning group of
//! the run is deleted whatever the outcome was.
//!
//! ```text
//! Idle -> ScaleRequested -> Converging -> Converged | TimedOut | Fatal -> Cleanup -> Done
//! ```

use tracing::{debug, info, warn};

use crate::context::{SuiteFixture, TestContext};
use crate::Error;

/// Phase of a scale request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleState {
    /// Nothing written yet
    Idle,
    /// Desired replicas written to the provisioning group
    ScaleRequested,
    /// Waiting for nodes and tracker to reach the target
    Converging,
    /// Nodes and tracker agree with the target
    Converged,
    /// Deadline elapsed before convergence
    TimedOut,
    /// Write failed, or an observation failed for a reason other than time
    Fatal,
    /// Deleting the run's provisioning groups
    Cleanup,
    /// Flow finished
    Done,
}

/// Result of a scale flow, including cleanup
#[derive(Debug)]
pub struct ScaleReport {
    /// Provisioning group that was scaled
    pub group: String,
    /// Requested replicas of `group`
    pub target: usize,
    /// States visited, in order
    pub states: Vec<ScaleState>,
    /// Convergence verdict
    pub outcome: Result<(), Error>,
    /// Provisioning groups that could not be deleted
    pub cleanup_failures: Vec<(String, Error)>,
}

impl ScaleReport {
    /// True when the fleet converged to the target
    pub fn converged(&self) -> bool {
        self.states.contains(&ScaleState::Converged)
    }

    /// Collapse the report into one verdict.
    ///
    /// A convergence failure wins over cleanup failures; a clean convergence
    /// with a failed cleanup still fails since groups were leaked.
    pub fn into_result(self) -> Result<(), Error> {
        self.outcome?;
        match self.cleanup_failures.into_iter().next() {
            Some((group, e)) => Err(Error::fatal(
                format!("delete provisioning group {}", group),
                e.to_string(),
            )),
            None => Ok(()),
        }
    }
}

struct Transitions<'a> {
    group: &'a str,
    states: Vec<ScaleState>,
}

impl<'a> Transitions<'a> {
    fn new(group: &'a str) -> Self {
        Self {
            group,
            states: vec![ScaleState::Idle],
        }
    }

    fn to(&mut self, next: ScaleState) {
        let from = self.states.last().copied().unwrap_or(ScaleState::Idle);
        info!(group = %self.group, from = ?from, to = ?next, "scale state transition");
        self.states.push(next);
    }
}

impl TestContext {
    /// Scale one provisioning group to `target` replicas and wait for the
    /// fleet to follow.
    ///
    /// Other provisioning groups keep their replicas, so the fleet target is
    /// the current expected size adjusted by this group's delta. On success
    /// the fixture holds the new expected size and node list.
    pub async fn scale_group(
        &mut self,
        fixture: &mut SuiteFixture,
        group: &str,
        target: usize,
    ) -> Result<(), Error> {
        let mut transitions = Transitions::new(group);
        self.request_and_converge(fixture, group, target, &mut transitions)
            .await
    }

    /// Scale `group` to `target`, then delete every provisioning group of the run.
    ///
    /// Cleanup runs on every outcome and its failures are reported separately
    /// in the [`ScaleReport`].
    pub async fn scale_and_cleanup(
        &mut self,
        fixture: &mut SuiteFixture,
        group: &str,
        target: usize,
    ) -> ScaleReport {
        let mut transitions = Transitions::new(group);
        let outcome = self
            .request_and_converge(fixture, group, target, &mut transitions)
            .await;

        transitions.to(ScaleState::Cleanup);
        let cleanup_failures = self.delete_provisioning_groups(fixture).await;
        transitions.to(ScaleState::Done);

        ScaleReport {
            group: group.to_string(),
            target,
            states: transitions.states,
            outcome,
            cleanup_failures,
        }
    }

    /// Scale `group` to zero, then delete every provisioning group of the run
    pub async fn scale_down(&mut self, fixture: &mut SuiteFixture, group: &str) -> ScaleReport {
        self.scale_and_cleanup(fixture, group, 0).await
    }

    async fn request_and_converge(
        &mut self,
        fixture: &mut SuiteFixture,
        group: &str,
        target: usize,
        transitions: &mut Transitions<'_>,
    ) -> Result<(), Error> {
        let fleet_target = match self.request_scale(fixture, group, target).await {
            Ok(fleet_target) => fleet_target,
            Err(e) => {
                transitions.to(ScaleState::Fatal);
                return Err(e);
            }
        };
        transitions.to(ScaleState::ScaleRequested);

        fixture.expected_nodes = fleet_target;
        transitions.to(ScaleState::Converging);

        let converged = match self.wait_for_nodes(fixture).await {
            Ok(()) => self.validate_tracker(fixture).await,
            Err(e) => Err(e),
        };

        match &converged {
            Ok(()) => {
                transitions.to(ScaleState::Converged);
                info!(group = %group, target, fleet = fleet_target, "fleet converged to requested size");
            }
            Err(e @ Error::Timeout { .. }) => {
                transitions.to(ScaleState::TimedOut);
                warn!(group = %group, target, error = %e, "fleet did not converge before deadline");
            }
            Err(e) => {
                transitions.to(ScaleState::Fatal);
                warn!(group = %group, target, error = %e, "fleet convergence failed");
            }
        }
        converged
    }

    /// Write the desired replicas and return the resulting fleet size
    async fn request_scale(
        &self,
        fixture: &SuiteFixture,
        group: &str,
        target: usize,
    ) -> Result<usize, Error> {
        let namespace = self.config.provisioning_namespace.as_str();
        let replicas = i32::try_from(target).map_err(|_| {
            Error::fatal(
                format!("scale {}", group),
                format!("replica count {} out of range", target),
            )
        })?;

        let current = self
            .cluster()
            .get_replicas(namespace, group)
            .await?
            .ok_or_else(|| Error::not_found("MachineSet", format!("{}/{}", namespace, group)))?;

        self.cluster()
            .set_replicas(namespace, group, replicas)
            .await
            .map_err(|e| Error::fatal(format!("scale {}/{}", namespace, group), e.to_string()))?;

        let current = usize::try_from(current).unwrap_or_default();
        let fleet_target = fixture.expected_nodes.saturating_sub(current) + target;
        info!(
            namespace = %namespace,
            group = %group,
            from = current,
            to = target,
            fleet = fleet_target,
            "requested provisioning group scale"
        );
        Ok(fleet_target)
    }

    /// Delete every provisioning group of the run, collecting failures
    async fn delete_provisioning_groups(&self, fixture: &SuiteFixture) -> Vec<(String, Error)> {
        let namespace = self.config.provisioning_namespace.as_str();
        let mut failures = Vec::new();
        for group in &fixture.provisioning_groups {
            match self
                .cluster()
                .delete_provisioning_group(namespace, group)
                .await
            {
                Ok(true) => info!(namespace = %namespace, group = %group, "deleted provisioning group"),
                Ok(false) => {
                    debug!(namespace = %namespace, group = %group, "provisioning group already gone")
                }
                Err(e) => {
                    warn!(namespace = %namespace, group = %group, error = %e, "failed to delete provisioning group");
                    failures.push((group.clone(), e));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterApi, MockClusterApi};
    use crate::config::HarnessConfig;
    use crate::identity::testing::managed_node;
    use crate::identity::active_instance_ids;
    use crate::poll::testing::manual_poller;
    use crate::tracker::testing::tracker_with;
    use crate::tracker::tracker_keys;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
    use mockall::predicate::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Group {
        replicas: i32,
        instances: Vec<String>,
        next: u32,
    }

    #[derive(Default)]
    struct FleetState {
        groups: BTreeMap<String, Group>,
        stuck: bool,
        fail_writes: bool,
        fail_deletes: BTreeSet<String>,
        writes: Vec<(String, i32)>,
    }

    /// In-memory fleet where each node listing moves every group one
    /// instance closer to its desired replicas.
    #[derive(Clone, Default)]
    struct FakeFleet {
        state: Arc<Mutex<FleetState>>,
    }

    impl FakeFleet {
        fn with_groups(groups: &[(&str, i32)]) -> Self {
            let fleet = Self::default();
            {
                let mut state = fleet.state.lock().unwrap();
                for (name, replicas) in groups {
                    let mut group = Group {
                        replicas: *replicas,
                        ..Default::default()
                    };
                    for _ in 0..*replicas {
                        group.next += 1;
                        group.instances.push(format!("i-{}-{}", name, group.next));
                    }
                    state.groups.insert(name.to_string(), group);
                }
            }
            fleet
        }

        fn instances(&self, group: &str) -> Vec<String> {
            let state = self.state.lock().unwrap();
            state
                .groups
                .get(group)
                .map(|g| g.instances.clone())
                .unwrap_or_default()
        }

        fn replicas(&self, group: &str) -> Option<i32> {
            let state = self.state.lock().unwrap();
            state.groups.get(group).map(|g| g.replicas)
        }

        fn all_instances(state: &FleetState) -> Vec<String> {
            state
                .groups
                .values()
                .flat_map(|g| g.instances.iter().cloned())
                .collect()
        }
    }

    #[async_trait]
    impl ClusterApi for FakeFleet {
        async fn list_nodes(&self, _label_selector: &str) -> Result<Vec<Node>, Error> {
            let mut state = self.state.lock().unwrap();
            if !state.stuck {
                for (name, group) in state.groups.iter_mut() {
                    let desired = usize::try_from(group.replicas).unwrap_or_default();
                    if group.instances.len() < desired {
                        group.next += 1;
                        group.instances.push(format!("i-{}-{}", name, group.next));
                    } else if group.instances.len() > desired {
                        group.instances.pop();
                    }
                }
            }
            Ok(Self::all_instances(&state)
                .iter()
                .map(|id| managed_node(id))
                .collect())
        }

        async fn get_config_map(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Option<ConfigMap>, Error> {
            let state = self.state.lock().unwrap();
            let ids = Self::all_instances(&state);
            let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            Ok(Some(tracker_with(&ids)))
        }

        async fn get_secret(&self, _namespace: &str, _name: &str) -> Result<Option<Secret>, Error> {
            Ok(None)
        }

        async fn get_replicas(&self, _namespace: &str, name: &str) -> Result<Option<i32>, Error> {
            Ok(self.replicas(name))
        }

        async fn set_replicas(&self, _namespace: &str, name: &str, replicas: i32) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(Error::fatal("patch MachineSet", "admission webhook denied"));
            }
            state.writes.push((name.to_string(), replicas));
            match state.groups.get_mut(name) {
                Some(group) => {
                    group.replicas = replicas;
                    Ok(())
                }
                None => Err(Error::not_found("MachineSet", name)),
            }
        }

        async fn delete_provisioning_group(&self, _namespace: &str, name: &str) -> Result<bool, Error> {
            let mut state = self.state.lock().unwrap();
            if state.fail_deletes.contains(name) {
                return Err(Error::fatal("delete MachineSet", "etcd unavailable"));
            }
            Ok(state.groups.remove(name).is_some())
        }
    }

    fn context(cluster: Arc<dyn ClusterApi>) -> TestContext {
        let (_clock, poller) = manual_poller(Duration::from_secs(30));
        TestContext::with_poller(cluster, HarnessConfig::default(), poller)
    }

    fn fixture(groups: &[&str], expected: usize) -> SuiteFixture {
        SuiteFixture::new(groups.iter().map(|g| g.to_string()).collect(), expected)
    }

    #[tokio::test]
    async fn scale_down_converges_and_cleans_up() {
        let fleet = FakeFleet::with_groups(&[("windows", 2)]);
        let mut ctx = context(Arc::new(fleet.clone()));
        let mut fixture = fixture(&["windows"], 2);

        let report = ctx.scale_down(&mut fixture, "windows").await;

        assert!(report.converged());
        assert_eq!(
            report.states,
            vec![
                ScaleState::Idle,
                ScaleState::ScaleRequested,
                ScaleState::Converging,
                ScaleState::Converged,
                ScaleState::Cleanup,
                ScaleState::Done,
            ]
        );
        assert!(report.cleanup_failures.is_empty());
        assert_eq!(fixture.expected_nodes, 0);
        assert!(fixture.nodes.is_empty());
        assert_eq!(fleet.replicas("windows"), None);
        report.into_result().unwrap();
    }

    #[tokio::test]
    async fn converged_ids_equal_tracker_keys() {
        let fleet = FakeFleet::with_groups(&[("windows", 1)]);
        let mut ctx = context(Arc::new(fleet.clone()));
        let mut fixture = fixture(&["windows"], 1);

        ctx.scale_group(&mut fixture, "windows", 3).await.unwrap();

        let ids: BTreeSet<String> = active_instance_ids(&fixture.nodes).into_iter().collect();
        let keys = tracker_keys(ctx.tracker().unwrap());
        assert_eq!(ids.len(), 3);
        assert_eq!(ids, keys);
        assert_eq!(fixture.expected_nodes, 3);
    }

    #[tokio::test]
    async fn scaling_one_group_leaves_the_other_untouched() {
        let fleet = FakeFleet::with_groups(&[("win-a", 2), ("win-b", 1)]);
        let before = fleet.instances("win-a");
        let mut ctx = context(Arc::new(fleet.clone()));
        let mut fixture = fixture(&["win-a", "win-b"], 3);

        ctx.scale_group(&mut fixture, "win-b", 0).await.unwrap();
        assert_eq!(fixture.expected_nodes, 2);
        assert_eq!(fleet.instances("win-a"), before);

        ctx.scale_group(&mut fixture, "win-b", 1).await.unwrap();
        assert_eq!(fixture.expected_nodes, 3);
        assert_eq!(fleet.replicas("win-a"), Some(2));
        assert_eq!(fleet.instances("win-a"), before);

        let keys = tracker_keys(ctx.tracker().unwrap());
        assert!(before.iter().all(|id| keys.contains(id)));

        let writes = fleet.state.lock().unwrap().writes.clone();
        assert!(writes.iter().all(|(group, _)| group == "win-b"));
    }

    #[tokio::test]
    async fn failed_write_is_fatal_without_polling() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_replicas()
            .with(eq(crate::MACHINE_API_NAMESPACE), eq("windows"))
            .returning(|_, _| Ok(Some(2)));
        cluster
            .expect_set_replicas()
            .times(1)
            .returning(|_, _, _| Err(Error::fatal("patch", "forbidden")));
        cluster.expect_list_nodes().never();
        cluster.expect_get_config_map().never();
        cluster
            .expect_delete_provisioning_group()
            .with(eq(crate::MACHINE_API_NAMESPACE), eq("windows"))
            .times(1)
            .returning(|_, _| Ok(true));
        let mut ctx = context(Arc::new(cluster));
        let mut fixture = fixture(&["windows"], 2);

        let report = ctx.scale_down(&mut fixture, "windows").await;

        assert_eq!(
            report.states,
            vec![
                ScaleState::Idle,
                ScaleState::Fatal,
                ScaleState::Cleanup,
                ScaleState::Done,
            ]
        );
        assert!(report.outcome.as_ref().unwrap_err().is_fatal());
        assert_eq!(fixture.expected_nodes, 2);
    }

    #[tokio::test]
    async fn missing_group_is_not_found() {
        let fleet = FakeFleet::with_groups(&[("windows", 1)]);
        let mut ctx = context(Arc::new(fleet));
        let mut fixture = fixture(&["windows"], 1);

        let err = ctx.scale_group(&mut fixture, "linux", 0).await.unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn group_without_replicas_is_not_reported_missing() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_replicas()
            .with(eq(crate::MACHINE_API_NAMESPACE), eq("windows"))
            .times(1)
            .returning(|ns, name| {
                Err(Error::decode(
                    format!("MachineSet {}/{}", ns, name),
                    "spec.replicas is unset or not an integer",
                ))
            });
        cluster.expect_set_replicas().never();
        cluster.expect_list_nodes().never();
        let mut ctx = context(Arc::new(cluster));
        let mut fixture = fixture(&["windows"], 2);

        let err = ctx.scale_group(&mut fixture, "windows", 1).await.unwrap_err();

        assert!(matches!(err, Error::Decode { .. }));
        assert!(!err.is_not_found());
        assert_eq!(fixture.expected_nodes, 2);
    }

    #[tokio::test]
    async fn timeout_still_runs_cleanup() {
        let fleet = FakeFleet::with_groups(&[("windows", 2)]);
        fleet.state.lock().unwrap().stuck = true;
        let mut ctx = context(Arc::new(fleet.clone()));
        let mut fixture = fixture(&["windows"], 2);

        let report = ctx.scale_down(&mut fixture, "windows").await;

        assert!(!report.converged());
        assert!(report.states.contains(&ScaleState::TimedOut));
        assert_eq!(report.states.last(), Some(&ScaleState::Done));
        assert!(matches!(report.outcome, Err(Error::Timeout { .. })));
        assert_eq!(fleet.replicas("windows"), None);
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_mask_convergence() {
        let fleet = FakeFleet::with_groups(&[("win-a", 1), ("win-b", 1)]);
        fleet
            .state
            .lock()
            .unwrap()
            .fail_deletes
            .insert("win-a".to_string());
        let mut ctx = context(Arc::new(fleet.clone()));
        let mut fixture = fixture(&["win-a", "win-b"], 2);

        let report = ctx.scale_down(&mut fixture, "win-b").await;

        assert!(report.converged());
        assert!(report.outcome.is_ok());
        assert_eq!(report.cleanup_failures.len(), 1);
        assert_eq!(report.cleanup_failures[0].0, "win-a");
        assert_eq!(fleet.replicas("win-b"), None);

        assert!(report.into_result().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn already_deleted_group_is_not_a_cleanup_failure() {
        let fleet = FakeFleet::with_groups(&[("windows", 1)]);
        let mut ctx = context(Arc::new(fleet));
        let mut fixture = fixture(&["windows", "gone"], 1);

        let report = ctx.scale_down(&mut fixture, "windows").await;

        assert!(report.cleanup_failures.is_empty());
        report.into_result().unwrap();
    }

    #[tokio::test]
    async fn convergence_failure_wins_over_cleanup_failure() {
        let fleet = FakeFleet::with_groups(&[("windows", 1)]);
        {
            let mut state = fleet.state.lock().unwrap();
            state.stuck = true;
            state.fail_deletes.insert("windows".to_string());
        }
        let mut ctx = context(Arc::new(fleet));
        let mut fixture = fixture(&["windows"], 1);

        let report = ctx.scale_down(&mut fixture, "windows").await;

        assert_eq!(report.cleanup_failures.len(), 1);
        assert!(matches!(report.into_result(), Err(Error::Timeout { .. })));
    }
}

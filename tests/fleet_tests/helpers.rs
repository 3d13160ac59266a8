//! Shared setup for the live-cluster suites

use std::time::Duration;

use fleet_converge::config::{suite_from_lookup, HarnessConfig};
use fleet_converge::context::{SuiteFixture, TestContext};
use fleet_converge::harness::TestHarness;
use fleet_converge::poll::deadline_for;
use tracing::info;

/// Install a fmt subscriber honouring `RUST_LOG`, defaulting to `info`
pub fn init_e2e_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Connect and build the suite fixture from the environment
pub async fn setup() -> Result<(TestContext, SuiteFixture), String> {
    let config = HarnessConfig::from_env();
    let (expected, groups) = suite_from_lookup(|key| std::env::var(key).ok());
    info!(expected, groups = ?groups, namespace = %config.namespace, "starting fleet suite");

    let ctx = TestContext::connect(config)
        .await
        .map_err(|e| format!("failed to connect to cluster: {}", e))?;
    Ok((ctx, SuiteFixture::new(groups, expected)))
}

/// Overall bound for a suite: creation plus teardown of the whole fleet,
/// plus slack for the single-item checks
pub fn suite_timeout(ctx: &TestContext, fixture: &SuiteFixture) -> Duration {
    deadline_for(ctx.config.timeout, fixture.expected_nodes) * 2 + ctx.config.timeout * 4
}

/// Run every read-only validator against the recorded fleet
pub async fn run_validators(harness: &TestHarness, ctx: &mut TestContext, fixture: &SuiteFixture) {
    harness
        .run("tracker ConfigMap", || ctx.validate_tracker(fixture))
        .await;
    harness
        .run("instance secrets", || async {
            ctx.validate_secrets(fixture).await.map(|_| ())
        })
        .await;
    harness
        .run("worker label", || async { ctx.validate_worker_label(fixture) })
        .await;
    harness
        .run("node taint", || async { ctx.validate_node_taint(fixture) })
        .await;
    harness
        .run("user data", || ctx.validate_user_data())
        .await;
}

//! Validators only, against a fleet that is already up

use tracing::info;

use fleet_converge::harness::TestHarness;

use super::helpers::{init_e2e_test, run_validators, setup, suite_timeout};

#[tokio::test]
#[ignore]
async fn converged_fleet_validates() {
    init_e2e_test();
    let (mut ctx, mut fixture) = setup().await.expect("setup failed");
    let timeout = suite_timeout(&ctx, &fixture);

    let result = tokio::time::timeout(timeout, async {
        let harness = TestHarness::new("fleet validation");
        ctx.wait_for_nodes(&mut fixture)
            .await
            .map_err(|e| format!("fleet not converged: {}", e))?;
        run_validators(&harness, &mut ctx, &fixture).await;
        harness.finish()
    })
    .await;

    match result {
        Ok(Ok(())) => info!("TEST PASSED: fleet validation"),
        Ok(Err(e)) => panic!("fleet validation failed: {}", e),
        Err(_) => panic!("fleet validation timed out after {:?}", timeout),
    }
}

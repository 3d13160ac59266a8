//! Full lifecycle: creation, validation, deletion

use tracing::info;

use fleet_converge::harness::TestHarness;

use super::helpers::{init_e2e_test, run_validators, setup, suite_timeout};

#[tokio::test]
#[ignore]
async fn fleet_lifecycle() {
    init_e2e_test();
    let (mut ctx, mut fixture) = setup().await.expect("setup failed");
    let timeout = suite_timeout(&ctx, &fixture);

    let result = tokio::time::timeout(timeout, async {
        let harness = TestHarness::new("fleet lifecycle");

        if !harness
            .run("creation", || ctx.wait_for_nodes(&mut fixture))
            .await
        {
            return harness.finish();
        }

        run_validators(&harness, &mut ctx, &fixture).await;

        match fixture.provisioning_groups.last().cloned() {
            Some(group) => {
                harness
                    .run("deletion", || async {
                        ctx.scale_down(&mut fixture, &group).await.into_result()
                    })
                    .await;
            }
            None => info!("no provisioning groups configured, skipping deletion"),
        }

        harness.finish()
    })
    .await;

    match result {
        Ok(Ok(())) => info!("TEST PASSED: fleet lifecycle"),
        Ok(Err(e)) => panic!("fleet lifecycle failed: {}", e),
        Err(_) => panic!("fleet lifecycle timed out after {:?}", timeout),
    }
}

//! Reserved and isolated core frequency tuning

use tracing::info;

use tunecheck_common::{Result, Target};

use super::{Outcome, ScenarioContext, ScenarioDriver};
use crate::change::ConfigurationChange;
use crate::verifier::{ExpectationTable, Probe};

/// Scenario name
pub const FREQUENCY_SCENARIO: &str = "frequency-tuning";

/// Profile field for the isolated-core maximum frequency (kHz)
pub const ISOLATED_FREQ_FIELD: &str = "hardwareTuning.isolatedCpuFreq";
/// Profile field for the reserved-core maximum frequency (kHz)
pub const RESERVED_FREQ_FIELD: &str = "hardwareTuning.reservedCpuFreq";

/// Set the isolated and reserved core frequencies, check the probe CPUs
/// report them, and check both return to their baselines after restore.
pub async fn run_frequency_tuning_scenario(
    driver: &ScenarioDriver,
    ctx: &ScenarioContext,
    desired_isolated: u64,
    desired_reserved: u64,
) -> Result<Outcome> {
    let site = ctx.node_target();
    let isolated = Target::Cpu(ctx.isolated_probe_cpu);
    let reserved = Target::Cpu(ctx.reserved_probe_cpu);

    let verifier = driver.verifier();
    let isolated_baseline = verifier.read(&site, Probe::ScalingMaxFreq, &isolated).await?;
    let reserved_baseline = verifier.read(&site, Probe::ScalingMaxFreq, &reserved).await?;
    info!(
        isolated_cpu = ctx.isolated_probe_cpu,
        isolated_baseline = %isolated_baseline,
        reserved_cpu = ctx.reserved_probe_cpu,
        reserved_baseline = %reserved_baseline,
        "Captured baseline core frequencies"
    );

    let baseline = ExpectationTable::new()
        .with(isolated.clone(), isolated_baseline)?
        .with(reserved.clone(), reserved_baseline)?;
    let desired = ExpectationTable::new()
        .with(isolated, desired_isolated.to_string())?
        .with(reserved, desired_reserved.to_string())?;

    let change = ConfigurationChange::new(FREQUENCY_SCENARIO)
        .set(ISOLATED_FREQ_FIELD, desired_isolated)?
        .set(RESERVED_FREQ_FIELD, desired_reserved)?;

    let body_site = site.clone();
    let outcome = driver
        .run(FREQUENCY_SCENARIO, change, |scope| async move {
            scope
                .verifier()
                .verify(&body_site, Probe::ScalingMaxFreq, &desired)
                .await?;
            Ok(Outcome::Passed)
        })
        .await?;

    verifier
        .verify(&site, Probe::ScalingMaxFreq, &baseline)
        .await?;
    info!("Core frequencies back at baseline");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedNode;
    use tunecheck_common::Error;

    /// Story: frequencies are applied on the probe cores and restored after
    #[tokio::test(start_paused = true)]
    async fn story_frequencies_apply_then_return_to_baseline() {
        let node = SimulatedNode::new();
        let before = node.spec();

        let outcome = run_frequency_tuning_scenario(&node.driver(), &node.context(), 2200002, 2500002)
            .await
            .expect("frequencies tuned");

        assert_eq!(outcome, Outcome::Passed);
        assert_eq!(node.rollouts(), 2);
        assert_eq!(node.spec(), before);
        assert_eq!(node.read_freq(2), SimulatedNode::ISOLATED_BASELINE.to_string());
        assert_eq!(node.read_freq(0), SimulatedNode::RESERVED_BASELINE.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn node_ignoring_the_change_fails_with_mismatch_and_restores() {
        let node = SimulatedNode::new();
        node.ignore_frequency_tuning();
        let before = node.spec();

        let err = run_frequency_tuning_scenario(&node.driver(), &node.context(), 2200002, 2500002)
            .await
            .expect_err("frequency not applied");

        assert_eq!(node.spec(), before);
        match err {
            Error::Scenario(failure) => match failure.primary {
                Some(Error::Mismatch {
                    target,
                    expected,
                    actual,
                    ..
                }) => {
                    assert_eq!(target, Target::Cpu(2));
                    assert_eq!(expected, "2200002");
                    assert_eq!(actual, SimulatedNode::ISOLATED_BASELINE.to_string());
                }
                other => panic!("Expected Mismatch, got {other:?}"),
            },
            other => panic!("Expected Scenario error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_probe_cpu_for_both_sets_is_rejected() {
        let node = SimulatedNode::new();
        let mut ctx = node.context();
        ctx.reserved_probe_cpu = ctx.isolated_probe_cpu;

        let err = run_frequency_tuning_scenario(&node.driver(), &ctx, 1, 2)
            .await
            .expect_err("duplicate target");
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(node.rollouts(), 0);
    }
}

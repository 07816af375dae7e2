//! Power-saving workload hints and per-pod power states

use tracing::info;

use tunecheck_common::cpuset::CpuSet;
use tunecheck_common::{Error, Result};

use super::{Outcome, ScenarioContext, ScenarioDriver};
use crate::change::ConfigurationChange;
use crate::verifier::Probe;

/// Scenario name for node-level power saving
pub const POWER_SAVING_SCENARIO: &str = "power-saving-mode";
/// Scenario name for per-pod power states
pub const PER_POD_SCENARIO: &str = "per-pod-power-states";

/// Kernel arguments a profile without workload hints puts on the command
/// line, as regex patterns
pub const DEFAULT_KERNEL_ARGS: &[&str] = &[
    "nohz_full=[0-9,-]+",
    "tsc=nowatchdog",
    "nosoftlockup",
    "nmi_watchdog=0",
    "mce=off",
    "skew_tick=1",
    "intel_pstate=disable",
];

const PASSIVE_PSTATE: &str = "intel_pstate=passive";
const DISABLED_PSTATE: &str = "intel_pstate=disable";

const RESUME_LATENCY_DISABLED: &str = "n/a";
const RESUME_LATENCY_DEFAULT: &str = "0";
const GOVERNOR_PERFORMANCE: &str = "performance";

/// Workload hints selecting power-saving mode with per-pod power management
pub fn power_saving_hints(name: &str) -> Result<ConfigurationChange> {
    ConfigurationChange::new(name)
        .set("workloadHints.perPodPowerManagement", true)?
        .set("workloadHints.highPowerConsumption", false)?
        .set("workloadHints.realTime", true)
}

/// Enable power-saving mode and check the kernel switched intel_pstate to
/// passive.
pub async fn run_power_saving_mode_scenario(
    driver: &ScenarioDriver,
    ctx: &ScenarioContext,
) -> Result<Outcome> {
    let site = ctx.node_target();
    driver
        .run(
            POWER_SAVING_SCENARIO,
            power_saving_hints(POWER_SAVING_SCENARIO)?,
            |scope| async move {
                scope
                    .verifier()
                    .verify_kernel_args(&site, &[PASSIVE_PSTATE], &[DISABLED_PSTATE])
                    .await?;
                Ok(Outcome::Passed)
            },
        )
        .await
}

/// Under power-saving mode, start a guaranteed pod that disables C-states on
/// its CPUs and check per-CPU resume latency and governor on the pod's CPUs,
/// on every other CPU, and on the pod's CPUs again after the pod is gone.
pub async fn run_per_pod_power_states_scenario(
    driver: &ScenarioDriver,
    ctx: &ScenarioContext,
) -> Result<Outcome> {
    let site = ctx.node_target();
    let all_cpus = ctx.all_cpus();
    let workload = ctx.power_qos_workload();

    driver
        .run(
            PER_POD_SCENARIO,
            power_saving_hints(PER_POD_SCENARIO)?,
            |scope| async move {
                let verifier = scope.verifier();
                let pod = scope.start_workload(&workload).await?;

                let cpuset = verifier.read(&pod, Probe::TaskCpuset, &pod).await?;
                let pod_cpus = CpuSet::parse(&cpuset)?;
                if pod_cpus.is_empty() {
                    return Err(Error::validation(format!("{pod} reported an empty cpuset")));
                }
                let other_cpus = all_cpus.difference(&pod_cpus);
                info!(pod = %pod, pod_cpus = %pod_cpus, other_cpus = %other_cpus, "Test pod is running");

                verifier
                    .verify_each(
                        &site,
                        &pod_cpus.targets(),
                        &[
                            (Probe::PmQosResumeLatency, RESUME_LATENCY_DISABLED),
                            (Probe::ScalingGovernor, GOVERNOR_PERFORMANCE),
                        ],
                    )
                    .await?;

                let defaults = [
                    (Probe::PmQosResumeLatency, RESUME_LATENCY_DEFAULT),
                    (Probe::ScalingGovernor, GOVERNOR_PERFORMANCE),
                ];
                verifier
                    .verify_each(&site, &other_cpus.targets(), &defaults)
                    .await?;

                scope.stop_workload(&pod).await?;
                verifier
                    .verify_each(&site, &pod_cpus.targets(), &defaults)
                    .await?;
                Ok(Outcome::Passed)
            },
        )
        .await
}

/// Check the kernel arguments of a profile without workload hints.
///
/// Read-only; skipped when the profile already sets workload hints.
pub async fn check_default_kernel_args(
    driver: &ScenarioDriver,
    ctx: &ScenarioContext,
) -> Result<Outcome> {
    if ctx.profile.has_workload_hints {
        return Ok(Outcome::skipped(format!(
            "performance profile {} already sets workload hints",
            ctx.profile.name
        )));
    }

    driver
        .verifier()
        .verify_kernel_args(&ctx.node_target(), DEFAULT_KERNEL_ARGS, &[])
        .await?;
    Ok(Outcome::Passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedNode;
    use tunecheck_common::Target;

    #[tokio::test(start_paused = true)]
    async fn default_kernel_args_present_without_hints() {
        let node = SimulatedNode::new();
        let outcome = check_default_kernel_args(&node.driver(), &node.context())
            .await
            .expect("defaults present");
        assert_eq!(outcome, Outcome::Passed);
        assert_eq!(node.rollouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_kernel_args_skipped_with_hints() {
        let node = SimulatedNode::new().with_workload_hints();
        let outcome = check_default_kernel_args(&node.driver(), &node.context())
            .await
            .expect("skipped");
        assert!(matches!(outcome, Outcome::Skipped { .. }));
    }

    /// Story: power-saving hints switch intel_pstate to passive and are
    /// rolled back afterwards
    #[tokio::test(start_paused = true)]
    async fn story_power_saving_mode_sets_passive_pstate() {
        let node = SimulatedNode::new();
        let before = node.spec();

        let outcome = run_power_saving_mode_scenario(&node.driver(), &node.context())
            .await
            .expect("passive pstate");

        assert_eq!(outcome, Outcome::Passed);
        assert_eq!(node.spec(), before);
        assert!(node.cmdline().contains(DISABLED_PSTATE));
    }

    /// Story: a pod's CPUs leave C-states disabled only while it runs
    #[tokio::test(start_paused = true)]
    async fn story_per_pod_power_states_follow_the_pod() {
        let node = SimulatedNode::new();
        let before = node.spec();

        let outcome = run_per_pod_power_states_scenario(&node.driver(), &node.context())
            .await
            .expect("per-pod power states");

        assert_eq!(outcome, Outcome::Passed);
        assert!(!node.pod_running());
        assert_eq!(node.spec(), before);
    }

    /// Story: a pod pinned to scattered CPUs disables C-states on exactly
    /// those CPUs
    #[tokio::test(start_paused = true)]
    async fn story_per_pod_power_states_with_non_contiguous_cpus() {
        let node = SimulatedNode::default().with_pod_cpus(&[2, 4, 6]);
        let before = node.spec();

        let outcome = run_per_pod_power_states_scenario(&node.driver(), &node.context())
            .await
            .expect("per-pod power states on 2,4,6");

        assert_eq!(outcome, Outcome::Passed);
        assert!(!node.pod_running());
        assert_eq!(node.spec(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_cpu_between_pod_cpus_still_disabled_fails_with_mismatch() {
        let node = SimulatedNode::default().with_pod_cpus(&[2, 4, 6]);
        node.leak_pod_state_to(3);

        let err = run_per_pod_power_states_scenario(&node.driver(), &node.context())
            .await
            .expect_err("cpu3 reports n/a");

        match err {
            Error::Scenario(failure) => match failure.primary {
                Some(Error::Mismatch { target, actual, .. }) => {
                    assert_eq!(target, Target::Cpu(3));
                    assert_eq!(actual, "n/a");
                }
                other => panic!("Expected Mismatch, got {other:?}"),
            },
            other => panic!("Expected Scenario error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn complement_core_still_disabled_fails_with_mismatch() {
        let node = SimulatedNode::new();
        node.leak_pod_state_to(0);

        let err = run_per_pod_power_states_scenario(&node.driver(), &node.context())
            .await
            .expect_err("cpu0 reports n/a");

        assert!(!node.pod_running());
        match err {
            Error::Scenario(failure) => match failure.primary {
                Some(Error::Mismatch {
                    target,
                    expected,
                    actual,
                    ..
                }) => {
                    assert_eq!(target, Target::Cpu(0));
                    assert_eq!(expected, "0");
                    assert_eq!(actual, "n/a");
                }
                other => panic!("Expected Mismatch, got {other:?}"),
            },
            other => panic!("Expected Scenario error, got {other:?}"),
        }
    }

    #[test]
    fn power_saving_hints_set_all_three_fields() {
        let change = power_saving_hints("x").expect("valid change");
        assert_eq!(change.desired().len(), 3);
    }
}

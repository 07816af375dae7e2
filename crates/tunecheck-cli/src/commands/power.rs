//! The power-management suite

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use kube::Client;
use tracing::{info, warn};

use tunecheck_common::config::PowerConfig;
use tunecheck_common::kube_utils::{delete_namespace_and_wait, ensure_namespace};
use tunecheck_common::poll::Poller;
use tunecheck_power::executor::shutdown_quietly;
use tunecheck_power::scenario::{
    check_default_kernel_args, run_frequency_tuning_scenario, run_per_pod_power_states_scenario,
    run_power_saving_mode_scenario,
};
use tunecheck_power::{
    discover, ChangeApplicator, ConvergenceWaiter, KubeWorkloads, MachineConfigPools,
    PerformanceProfiles, PodExecutor, ScenarioContext, ScenarioDriver, StateVerifier,
};

use super::{cancel_on_interrupt, connect};
use crate::harness::TestHarness;
use crate::{Error, GlobalArgs, Result};

/// Labels letting host-probe pods run privileged with host namespaces
const PRIVILEGED_POD_SECURITY: &[(&str, &str)] = &[
    ("pod-security.kubernetes.io/enforce", "privileged"),
    ("pod-security.kubernetes.io/audit", "privileged"),
    ("pod-security.kubernetes.io/warn", "privileged"),
    ("security.openshift.io/scc.podSecurityLabelSync", "false"),
];

/// Power-management scenarios, in the order they run
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PowerScenario {
    /// Kernel arguments of a profile without workload hints
    DefaultKernelArgs,
    /// Isolated and reserved core frequencies
    FrequencyTuning,
    /// intel_pstate under power-saving workload hints
    PowerSavingMode,
    /// Per-pod C-state and governor control
    PerPodPowerStates,
}

impl PowerScenario {
    const ALL: [PowerScenario; 4] = [
        PowerScenario::DefaultKernelArgs,
        PowerScenario::FrequencyTuning,
        PowerScenario::PowerSavingMode,
        PowerScenario::PerPodPowerStates,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PowerScenario::DefaultKernelArgs => "default-kernel-args",
            PowerScenario::FrequencyTuning => "frequency-tuning",
            PowerScenario::PowerSavingMode => "power-saving-mode",
            PowerScenario::PerPodPowerStates => "per-pod-power-states",
        }
    }
}

#[derive(Args, Debug)]
pub struct PowerArgs {
    /// Scenario to run; repeat for several (default: all)
    #[arg(long = "scenario", value_enum)]
    pub scenarios: Vec<PowerScenario>,

    /// Desired isolated-core maximum frequency in kHz
    #[arg(long, default_value_t = 2_200_002)]
    pub isolated_freq: u64,

    /// Desired reserved-core maximum frequency in kHz
    #[arg(long, default_value_t = 2_500_002)]
    pub reserved_freq: u64,
}

impl PowerArgs {
    /// Selected scenarios in run order, without duplicates
    pub fn selected(&self) -> Vec<PowerScenario> {
        PowerScenario::ALL
            .into_iter()
            .filter(|s| self.scenarios.is_empty() || self.scenarios.contains(s))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.isolated_freq == 0 || self.reserved_freq == 0 {
            return Err(Error::validation("frequencies must be positive"));
        }
        Ok(())
    }
}

/// Run the power-management suite
pub async fn run(global: &GlobalArgs, args: PowerArgs) -> Result<()> {
    args.validate()?;
    let (config, client) = connect(global).await?;
    let power = &config.power;

    ensure_namespace(&client, &power.privileged_namespace, PRIVILEGED_POD_SECURITY).await?;
    let executor = Arc::new(PodExecutor::new(
        client.clone(),
        &power.privileged_namespace,
        &power.probe_image,
        power.workload_timeout(),
    ));

    let result = run_suite(global, &args, power, &client, executor.clone()).await;

    shutdown_quietly(&executor).await;
    if let Err(e) =
        delete_namespace_and_wait(&client, &power.privileged_namespace, power.workload_timeout())
            .await
    {
        warn!(namespace = %power.privileged_namespace, error = %e, "Failed to delete namespace");
    }
    result
}

async fn run_suite(
    global: &GlobalArgs,
    args: &PowerArgs,
    power: &PowerConfig,
    client: &Client,
    executor: Arc<PodExecutor>,
) -> Result<()> {
    let ctx = discover(client, power).await?;
    let driver = build_driver(global, power, client, &ctx, executor);

    let harness = TestHarness::new("power");
    for scenario in args.selected() {
        let (driver, ctx) = (&driver, &ctx);
        harness
            .run(scenario.name(), || async move {
                match scenario {
                    PowerScenario::DefaultKernelArgs => check_default_kernel_args(driver, ctx).await,
                    PowerScenario::FrequencyTuning => {
                        run_frequency_tuning_scenario(
                            driver,
                            ctx,
                            args.isolated_freq,
                            args.reserved_freq,
                        )
                        .await
                    }
                    PowerScenario::PowerSavingMode => {
                        run_power_saving_mode_scenario(driver, ctx).await
                    }
                    PowerScenario::PerPodPowerStates => {
                        run_per_pod_power_states_scenario(driver, ctx).await
                    }
                }
            })
            .await;
    }
    harness.finish()
}

fn build_driver(
    global: &GlobalArgs,
    power: &PowerConfig,
    client: &Client,
    ctx: &ScenarioContext,
    executor: Arc<PodExecutor>,
) -> ScenarioDriver {
    let waiter = ConvergenceWaiter::new(
        Arc::new(MachineConfigPools::new(client.clone())),
        power.rollout_poll_interval(),
        power.updating_timeout(),
        power.updated_timeout(),
    );
    let applicator = ChangeApplicator::new(
        Arc::new(PerformanceProfiles::new(client.clone())),
        waiter,
        &ctx.profile.name,
        &power.pool,
    );
    let verifier = StateVerifier::new(
        executor,
        Poller::new(power.verify_poll_interval(), power.verify_timeout()),
    );
    let workloads = Arc::new(KubeWorkloads::new(client.clone(), power.workload_timeout()));

    let driver = ScenarioDriver::new(applicator, verifier, workloads)
        .with_cancellation(cancel_on_interrupt());
    match global.deadline_secs {
        Some(secs) => {
            info!(deadline_secs = secs, "Bounding each scenario");
            driver.with_deadline(Duration::from_secs(secs))
        }
        None => driver,
    }
}

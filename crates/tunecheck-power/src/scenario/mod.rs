//! End-to-end scenarios: apply a change, verify, clean up, restore.
//!
//! [`ScenarioDriver::run`] owns the whole lifecycle of one scenario:
//!
//! 1. apply the [`ConfigurationChange`] and wait for the rollout
//! 2. run the scenario body (verification, test pods)
//! 3. delete test pods the body left behind
//! 4. restore the captured original configuration and wait again
//!
//! Steps 3 and 4 always run. Steps 1 and 2 are bounded by the scenario
//! deadline and the cancellation token; restoration runs with neither. A
//! cancelled driver writes nothing. When the deadline or cancellation cut a
//! rollout short, restoration waits for the pool to go idle before writing.
//! Failures of each phase are reported separately in a [`ScenarioFailure`].

mod frequency;
mod powersave;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunecheck_common::cpuset::CpuSet;
use tunecheck_common::{Error, Result, ScenarioFailure, Target};

use crate::applicator::ChangeApplicator;
use crate::change::ConfigurationChange;
use crate::profile::ProfileInfo;
use crate::rollout::Convergence;
use crate::verifier::StateVerifier;
use crate::workload::{power_state_annotations, WorkloadLifecycle, WorkloadSpec};

pub use frequency::{
    run_frequency_tuning_scenario, FREQUENCY_SCENARIO, ISOLATED_FREQ_FIELD, RESERVED_FREQ_FIELD,
};
pub use powersave::{
    check_default_kernel_args, power_saving_hints, run_per_pod_power_states_scenario,
    run_power_saving_mode_scenario, DEFAULT_KERNEL_ARGS, PER_POD_SCENARIO, POWER_SAVING_SCENARIO,
};

/// How a scenario ended when it did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every check passed
    Passed,
    /// The scenario does not apply to this cluster
    Skipped {
        /// Why it was skipped
        reason: String,
    },
}

impl Outcome {
    /// Create a skipped outcome
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Cluster facts every scenario works against
#[derive(Clone, Debug)]
pub struct ScenarioContext {
    /// The single node of the cluster
    pub node: String,
    /// Number of logical CPUs on the node
    pub cpu_count: u32,
    /// Performance profile under test
    pub profile: ProfileInfo,
    /// Namespace for test pods
    pub namespace: String,
    /// Image for test pods
    pub image: String,
    /// CPU probed for the isolated-core frequency
    pub isolated_probe_cpu: u32,
    /// CPU probed for the reserved-core frequency
    pub reserved_probe_cpu: u32,
}

impl ScenarioContext {
    /// Where node-level probes run
    pub fn node_target(&self) -> Target {
        Target::node(&self.node)
    }

    /// Every CPU on the node
    pub fn all_cpus(&self) -> CpuSet {
        CpuSet::first_n(self.cpu_count)
    }

    /// Guaranteed-QoS pod with per-pod power management annotations
    pub fn power_qos_workload(&self) -> WorkloadSpec {
        WorkloadSpec {
            name: "power-qos-test".to_string(),
            namespace: self.namespace.clone(),
            node: self.node.clone(),
            image: self.image.clone(),
            cpus: 2,
            memory: "100Mi".to_string(),
            annotations: power_state_annotations(),
            runtime_class: Some(self.profile.runtime_class()),
        }
    }
}

/// Test pods a scenario body created and has not deleted yet
#[derive(Clone, Default)]
pub struct EphemeralWorkloads {
    targets: Arc<Mutex<Vec<Target>>>,
}

impl EphemeralWorkloads {
    fn with_targets<R>(&self, f: impl FnOnce(&mut Vec<Target>) -> R) -> R {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut targets)
    }

    /// Track `target` for teardown
    pub fn register(&self, target: Target) {
        self.with_targets(|t| {
            if !t.contains(&target) {
                t.push(target)
            }
        });
    }

    /// Stop tracking `target`
    pub fn forget(&self, target: &Target) {
        self.with_targets(|t| t.retain(|x| x != target));
    }

    /// Take every tracked target
    pub fn drain(&self) -> Vec<Target> {
        self.with_targets(std::mem::take)
    }

    /// Currently tracked targets
    pub fn pending(&self) -> Vec<Target> {
        self.with_targets(|t| t.clone())
    }
}

/// What a scenario body can use
#[derive(Clone)]
pub struct ScenarioScope {
    verifier: StateVerifier,
    workloads: Arc<dyn WorkloadLifecycle>,
    ephemeral: EphemeralWorkloads,
}

impl ScenarioScope {
    /// Verifier bound to the scenario's deadline
    pub fn verifier(&self) -> &StateVerifier {
        &self.verifier
    }

    /// Create a test pod and wait for it to run. The pod is deleted at
    /// scenario end unless [`stop_workload`](Self::stop_workload) got to it
    /// first.
    pub async fn start_workload(&self, spec: &WorkloadSpec) -> Result<Target> {
        self.ephemeral.register(spec.target());
        let target = self.workloads.create(spec).await?;
        self.workloads.wait_running(&target).await?;
        Ok(target)
    }

    /// Delete a test pod and wait until it is gone
    pub async fn stop_workload(&self, target: &Target) -> Result<()> {
        self.workloads.delete(target).await?;
        self.ephemeral.forget(target);
        Ok(())
    }
}

/// Runs scenarios with guaranteed teardown and restoration
pub struct ScenarioDriver {
    applicator: ChangeApplicator,
    verifier: StateVerifier,
    workloads: Arc<dyn WorkloadLifecycle>,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl ScenarioDriver {
    /// Create a driver with no deadline
    pub fn new(
        applicator: ChangeApplicator,
        verifier: StateVerifier,
        workloads: Arc<dyn WorkloadLifecycle>,
    ) -> Self {
        Self {
            applicator,
            verifier,
            workloads,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound the apply and verification phase of every scenario
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Abort the apply and verification phase when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Verifier without deadline, for checks outside of [`run`](Self::run)
    pub fn verifier(&self) -> &StateVerifier {
        &self.verifier
    }

    /// Apply `change`, run `body`, then tear down and restore.
    ///
    /// Returns the body's outcome when every phase succeeded, otherwise
    /// [`Error::Scenario`] carrying each phase's failure.
    pub async fn run<F, Fut>(
        &self,
        name: &str,
        mut change: ConfigurationChange,
        body: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(ScenarioScope) -> Fut,
        Fut: Future<Output = Result<Outcome>>,
    {
        info!(scenario = %name, change = %change.name(), "Starting scenario");

        // Cancelling the child aborts this run without touching the caller's
        // token.
        let token = self.cancel.child_token();
        let ephemeral = EphemeralWorkloads::default();
        let scope = ScenarioScope {
            verifier: self.verifier.with_cancellation(token.clone()),
            workloads: self.workloads.clone(),
            ephemeral: ephemeral.clone(),
        };
        let applicator = self.applicator.with_cancellation(token.clone());

        let primary = async {
            if token.is_cancelled() {
                return Err(Error::cancelled(format!("scenario {name}")));
            }
            applicator.apply(&mut change).await?;
            body(scope).await
        };
        let primary = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, primary).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    Err(Error::timeout(format!("scenario {name}"), deadline))
                }
            },
            None => primary.await,
        };

        let interrupted = matches!(
            primary,
            Err(ref e) if e.is_timeout() || matches!(e, Error::Cancelled { .. })
        );
        let teardown = self.teardown(&ephemeral).await.err();
        let restore = self.restore(&change, interrupted).await.err();

        let (outcome, primary) = match primary {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => (None, Some(e)),
        };
        match (ScenarioFailure::collect(name, primary, teardown, restore), outcome) {
            (Some(failure), _) => {
                error!(scenario = %name, error = %failure, "Scenario failed");
                Err(failure.into())
            }
            (None, Some(outcome)) => {
                info!(scenario = %name, ?outcome, "Scenario finished");
                Ok(outcome)
            }
            (None, None) => Err(Error::internal_with_context(
                "scenario",
                format!("scenario {name} finished without an outcome"),
            )),
        }
    }

    async fn teardown(&self, ephemeral: &EphemeralWorkloads) -> Result<()> {
        let mut first_error = None;
        for target in ephemeral.drain() {
            let result = match self.workloads.exists(&target).await {
                Ok(false) => Ok(()),
                Ok(true) => {
                    info!(pod = %target, "Deleting leftover test pod");
                    self.workloads.delete(&target).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(pod = %target, error = %e, "Failed to tear down test pod");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Put the captured originals back. After an `interrupted` primary phase
    /// the rollout it started may still be running, so wait it out first.
    async fn restore(&self, change: &ConfigurationChange, interrupted: bool) -> Result<()> {
        if change.original().is_none() {
            info!(change = %change.name(), "Change was never applied, nothing to restore");
            return Ok(());
        }

        let applicator = self.applicator.uncancellable();
        if interrupted {
            warn!(change = %change.name(), "Scenario was interrupted, letting the rollout settle before restoring");
            if let Err(e) = applicator.settle().await {
                warn!(change = %change.name(), error = %e, "Rollout did not settle, not restoring");
                return Err(e);
            }
        }

        let mut restoration = change.restoration()?;
        match applicator.apply(&mut restoration).await {
            Ok(Convergence::Unchanged) => {
                info!(change = %change.name(), "Configuration already at its original value");
                Ok(())
            }
            Ok(Convergence::Updated) => {
                info!(change = %change.name(), "Restored original configuration");
                Ok(())
            }
            Err(e) => {
                warn!(change = %change.name(), error = %e, "Failed to restore original configuration");
                Err(e)
            }
        }
    }
}

//! Convergence and verification engine for node power-management checks.
//!
//! A scenario submits a [`ConfigurationChange`] to a performance profile,
//! waits for the machine config pool to roll it out, probes sysfs and the
//! kernel command line on the node, then restores the profile. The pieces:
//!
//! - [`change`]: field-level changes with captured originals
//! - [`applicator`] and [`rollout`]: write a spec and wait for convergence
//! - [`executor`] and [`verifier`]: run probes on the node and compare values
//! - [`workload`]: guaranteed-QoS test pods
//! - [`scenario`]: the driver tying it together, plus the concrete scenarios
//! - [`discovery`]: single-node topology and profile selection

#![deny(missing_docs)]

pub mod applicator;
pub mod change;
pub mod discovery;
pub mod executor;
pub mod profile;
pub mod rollout;
pub mod scenario;
pub mod verifier;
pub mod workload;

#[cfg(test)]
mod testing;

pub use applicator::ChangeApplicator;
pub use change::{ConfigurationChange, FieldPath};
pub use discovery::discover;
pub use executor::{PodExecutor, RemoteExecutor};
pub use profile::{PerformanceProfiles, ProfileInfo, SpecStore};
pub use rollout::{ConditionStore, Convergence, ConvergenceWaiter, MachineConfigPools};
pub use scenario::{Outcome, ScenarioContext, ScenarioDriver};
pub use verifier::{ExpectationTable, Probe, StateVerifier};
pub use workload::{KubeWorkloads, WorkloadLifecycle, WorkloadSpec};

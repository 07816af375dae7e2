//! Probe system state on targets and compare it with expectations.
//!
//! Every read goes through the [`Poller`]: right after a rollout or a pod
//! start, sysfs files can briefly read back empty, so empty output keeps
//! polling. A non-empty value is final and is compared exactly after
//! trimming spaces and line endings.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tunecheck_common::poll::Poller;
use tunecheck_common::{Error, Result, Target};

use crate::executor::RemoteExecutor;

/// Characters stripped from both ends of probe output
const TRIM_CHARS: &[char] = &[' ', '\r', '\n'];

/// A read-only command inspecting one piece of system state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// `scaling_max_freq` of a CPU's cpufreq policy
    ScalingMaxFreq,
    /// Power-QoS resume latency of a CPU
    PmQosResumeLatency,
    /// cpufreq governor of a CPU
    ScalingGovernor,
    /// The kernel command line
    KernelCmdline,
    /// CPUs the probing shell may run on
    TaskCpuset,
}

impl Probe {
    /// Short name used in logs and mismatch reports
    pub fn name(&self) -> &'static str {
        match self {
            Probe::ScalingMaxFreq => "scaling_max_freq",
            Probe::PmQosResumeLatency => "pm_qos_resume_latency_us",
            Probe::ScalingGovernor => "scaling_governor",
            Probe::KernelCmdline => "kernel_cmdline",
            Probe::TaskCpuset => "task_cpuset",
        }
    }

    /// Shell command reading this probe's value for `target`.
    ///
    /// Per-CPU probes need a CPU target; the others ignore it.
    pub fn command(&self, target: &Target) -> Result<String> {
        let cpu = || {
            target.cpu_index().ok_or_else(|| {
                Error::validation(format!("probe {} needs a cpu target, got {target}", self.name()))
            })
        };
        Ok(match self {
            Probe::ScalingMaxFreq => format!(
                "cat /sys/devices/system/cpu/cpufreq/policy{}/scaling_max_freq | cat -",
                cpu()?
            ),
            Probe::PmQosResumeLatency => format!(
                "sleep 0.01; cat /sys/devices/system/cpu/cpu{}/power/pm_qos_resume_latency_us | cat -",
                cpu()?
            ),
            Probe::ScalingGovernor => format!(
                "sleep 0.01; cat /sys/devices/system/cpu/cpu{}/cpufreq/scaling_governor | cat -",
                cpu()?
            ),
            Probe::KernelCmdline => "cat /proc/cmdline".to_string(),
            Probe::TaskCpuset => "taskset -c -p $$ | cut -d: -f2".to_string(),
        })
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Expected value per target for one verification pass.
///
/// Iteration follows insertion order. A target can appear only once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExpectationTable {
    entries: Vec<(Target, String)>,
}

impl ExpectationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The same expected value for every target
    pub fn uniform(targets: &[Target], expected: &str) -> Result<Self> {
        let mut table = Self::new();
        for target in targets {
            table.insert(target.clone(), expected)?;
        }
        Ok(table)
    }

    /// Add an expectation. Duplicate targets are rejected.
    pub fn insert(&mut self, target: Target, expected: impl Into<String>) -> Result<()> {
        if self.entries.iter().any(|(t, _)| *t == target) {
            return Err(Error::validation(format!(
                "duplicate expectation for {target}"
            )));
        }
        self.entries.push((target, expected.into()));
        Ok(())
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, target: Target, expected: impl Into<String>) -> Result<Self> {
        self.insert(target, expected)?;
        Ok(self)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Target, &str)> {
        self.entries.iter().map(|(t, v)| (t, v.as_str()))
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Issues probes through a [`RemoteExecutor`] and compares the results
#[derive(Clone)]
pub struct StateVerifier {
    executor: Arc<dyn RemoteExecutor>,
    poller: Poller,
}

impl StateVerifier {
    /// Create a verifier that polls each read with `poller`
    pub fn new(executor: Arc<dyn RemoteExecutor>, poller: Poller) -> Self {
        Self { executor, poller }
    }

    /// Abort reads when `token` is cancelled
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            executor: self.executor.clone(),
            poller: self.poller.clone().with_cancellation(token),
        }
    }

    /// Copy of this verifier that ignores cancellation
    pub fn uncancellable(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            poller: self.poller.uncancellable(),
        }
    }

    /// Run a command on `site` once, untrimmed, without polling
    pub async fn execute(&self, site: &Target, command: &str) -> Result<String> {
        self.executor.execute(site, command).await
    }

    /// Read `probe` for `target` on `site`, waiting for non-empty output
    pub async fn read(&self, site: &Target, probe: Probe, target: &Target) -> Result<String> {
        let command = probe.command(target)?;
        let description = format!("{probe} of {target} on {site}");
        let executor = &self.executor;
        let command = command.as_str();

        self.poller
            .poll(&description, || async move {
                let output = executor.execute(site, command).await?;
                let value = output.trim_matches(TRIM_CHARS);
                if value.is_empty() {
                    return Err(Error::transient(
                        target.to_string(),
                        format!("empty output from {probe}"),
                    ));
                }
                Ok(Some(value.to_string()))
            })
            .await
    }

    /// Check every expectation in table order.
    ///
    /// Fails with [`Error::Mismatch`] on the first differing target; a fatal
    /// error stops probing immediately.
    pub async fn verify(
        &self,
        site: &Target,
        probe: Probe,
        expectations: &ExpectationTable,
    ) -> Result<()> {
        for (target, expected) in expectations.iter() {
            self.check(site, probe, target, expected).await?;
        }
        info!(probe = %probe, targets = expectations.len(), "Verified probe values");
        Ok(())
    }

    /// Check several probes per target, target by target
    pub async fn verify_each(
        &self,
        site: &Target,
        targets: &[Target],
        checks: &[(Probe, &str)],
    ) -> Result<()> {
        for target in targets {
            for (probe, expected) in checks {
                self.check(site, *probe, target, expected).await?;
            }
        }
        info!(
            targets = targets.len(),
            probes = checks.len(),
            "Verified probe values"
        );
        Ok(())
    }

    /// Check `/proc/cmdline` on `site` against regex patterns that must and
    /// must not match
    pub async fn verify_kernel_args(
        &self,
        site: &Target,
        required: &[&str],
        forbidden: &[&str],
    ) -> Result<()> {
        let cmdline = self.read(site, Probe::KernelCmdline, site).await?;

        for pattern in required {
            if !compile(pattern)?.is_match(&cmdline) {
                return Err(Error::mismatch(
                    site.clone(),
                    Probe::KernelCmdline.name(),
                    format!("contains {pattern}"),
                    cmdline,
                ));
            }
            debug!(pattern = %pattern, "Kernel argument present");
        }

        for pattern in forbidden {
            if compile(pattern)?.is_match(&cmdline) {
                return Err(Error::mismatch(
                    site.clone(),
                    Probe::KernelCmdline.name(),
                    format!("does not contain {pattern}"),
                    cmdline,
                ));
            }
        }

        info!(
            site = %site,
            required = required.len(),
            forbidden = forbidden.len(),
            "Verified kernel arguments"
        );
        Ok(())
    }

    async fn check(&self, site: &Target, probe: Probe, target: &Target, expected: &str) -> Result<()> {
        let actual = self.read(site, probe, target).await?;
        if actual != expected {
            return Err(Error::mismatch(target.clone(), probe.name(), expected, actual));
        }
        debug!(target = %target, probe = %probe, value = %actual, "Probe value matches");
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::validation(format!("invalid kernel argument pattern {pattern:?}: {e}")))
}

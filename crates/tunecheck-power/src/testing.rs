//! In-memory single-node cluster for scenario tests

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use tunecheck_common::poll::Poller;
use tunecheck_common::{Error, Result, Target};

use crate::applicator::ChangeApplicator;
use crate::executor::RemoteExecutor;
use crate::profile::{ProfileInfo, SpecStore};
use crate::rollout::{ConditionStore, ConvergenceWaiter, CONDITION_DEGRADED, CONDITION_UPDATING};
use crate::scenario::{ScenarioContext, ScenarioDriver};
use crate::workload::{WorkloadLifecycle, WorkloadSpec};

const NODE: &str = "sno-0";
const PROFILE: &str = "du";
const POOL: &str = "master";
const NAMESPACE: &str = "tunecheck-privileged";
const CPU_COUNT: u32 = 8;
const DEFAULT_POD_CPUS: &[u32] = &[2, 3];
/// Updating polls a rollout stays true for
const ROLLOUT_POLLS: u32 = 3;
const BASE_CMDLINE: &str = "BOOT_IMAGE=(hd0,gpt3)/ostree/vmlinuz-5.14 nohz_full=2-7 \
    tsc=nowatchdog nosoftlockup nmi_watchdog=0 mce=off skew_tick=1";

struct Rollout {
    target: Value,
    polls_left: u32,
}

struct State {
    spec: Value,
    applied: Value,
    rollout: Option<Rollout>,
    /// A write arrived while a rollout was in flight
    queued: bool,
    rollouts: u32,
    pod: Option<Target>,
    pod_cpus: Vec<u32>,
    fail_reads: bool,
    fail_writes: bool,
    ignore_frequency: bool,
    leaked_cpu: Option<u32>,
}

impl State {
    fn start_rollout(&mut self) {
        self.rollout = Some(Rollout {
            target: self.spec.clone(),
            polls_left: ROLLOUT_POLLS,
        });
    }
}

/// A node with 8 CPUs, profile `du` (isolated 2-7, reserved 0-1) and a pool
/// that rolls out each write over a few polls.
///
/// A write during a rollout is only picked up after that rollout finished
/// and the pool was seen idle once.
#[derive(Clone)]
pub struct SimulatedNode {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedNode {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNode {
    pub const ISOLATED_BASELINE: u64 = 2_000_000;
    pub const RESERVED_BASELINE: u64 = 3_000_000;

    pub fn new() -> Self {
        let spec = json!({
            "cpu": {"isolated": "2-7", "reserved": "0-1"},
            "hardwareTuning": {"isolatedCpuFreq": Self::ISOLATED_BASELINE},
            "numa": {"topologyPolicy": "single-numa-node"},
        });
        Self {
            state: Arc::new(Mutex::new(State {
                applied: spec.clone(),
                spec,
                rollout: None,
                queued: false,
                rollouts: 0,
                pod: None,
                pod_cpus: DEFAULT_POD_CPUS.to_vec(),
                fail_reads: false,
                fail_writes: false,
                ignore_frequency: false,
                leaked_cpu: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The test pod is pinned to `cpus`
    pub fn with_pod_cpus(self, cpus: &[u32]) -> Self {
        self.state().pod_cpus = cpus.to_vec();
        self
    }

    /// Profile that already carries workload hints
    pub fn with_workload_hints(self) -> Self {
        {
            let mut state = self.state();
            let hints = json!({"realTime": true, "highPowerConsumption": false});
            state.spec["workloadHints"] = hints.clone();
            state.applied["workloadHints"] = hints;
        }
        self
    }

    pub fn spec(&self) -> Value {
        self.state().spec.clone()
    }

    pub fn rollouts(&self) -> u32 {
        self.state().rollouts
    }

    pub fn pod_running(&self) -> bool {
        self.state().pod.is_some()
    }

    pub fn fail_reads(&self) {
        self.state().fail_reads = true;
    }

    pub fn fail_writes(&self) {
        self.state().fail_writes = true;
    }

    /// Frequencies stay at their baselines whatever the profile says
    pub fn ignore_frequency_tuning(&self) {
        self.state().ignore_frequency = true;
    }

    /// `cpu` reports C-states disabled while the test pod runs, although
    /// the pod is not pinned to it
    pub fn leak_pod_state_to(&self, cpu: u32) {
        self.state().leaked_cpu = Some(cpu);
    }

    pub fn read_freq(&self, cpu: u32) -> String {
        frequency(&self.state(), cpu)
    }

    pub fn cmdline(&self) -> String {
        cmdline(&self.state())
    }

    pub fn context(&self) -> ScenarioContext {
        let profile = ProfileInfo::from_spec(PROFILE, &self.spec())
            .expect("valid cpusets")
            .expect("profile has cpusets");
        ScenarioContext {
            node: NODE.to_string(),
            cpu_count: CPU_COUNT,
            profile,
            namespace: NAMESPACE.to_string(),
            image: "ubi".to_string(),
            isolated_probe_cpu: 2,
            reserved_probe_cpu: 0,
        }
    }

    pub fn driver(&self) -> ScenarioDriver {
        let waiter = ConvergenceWaiter::new(
            Arc::new(self.clone()),
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(120),
        );
        let applicator = ChangeApplicator::new(Arc::new(self.clone()), waiter, PROFILE, POOL);
        let verifier = crate::verifier::StateVerifier::new(
            Arc::new(self.clone()),
            Poller::new(Duration::from_secs(1), Duration::from_secs(30)),
        );
        ScenarioDriver::new(applicator, verifier, Arc::new(self.clone()))
    }
}

fn frequency(state: &State, cpu: u32) -> String {
    let (field, baseline) = if cpu < 2 {
        ("reservedCpuFreq", SimulatedNode::RESERVED_BASELINE)
    } else {
        ("isolatedCpuFreq", SimulatedNode::ISOLATED_BASELINE)
    };
    if state.ignore_frequency {
        return baseline.to_string();
    }
    state.applied["hardwareTuning"][field]
        .as_u64()
        .unwrap_or(baseline)
        .to_string()
}

fn per_pod_power_management(state: &State) -> bool {
    state.applied["workloadHints"]["perPodPowerManagement"].as_bool() == Some(true)
}

fn cmdline(state: &State) -> String {
    let pstate = if per_pod_power_management(state) {
        "intel_pstate=passive"
    } else {
        "intel_pstate=disable"
    };
    format!("{BASE_CMDLINE} {pstate}")
}

fn resume_latency(state: &State, cpu: u32) -> &'static str {
    let pod_cpu = state.pod_cpus.contains(&cpu) && per_pod_power_management(state);
    let leaked = state.leaked_cpu == Some(cpu);
    if state.pod.is_some() && (pod_cpu || leaked) {
        "n/a"
    } else {
        "0"
    }
}

fn cpu_in(command: &str) -> Option<u32> {
    let re = Regex::new(r"(?:policy|cpu)(\d+)/").expect("valid regex");
    re.captures(command)?.get(1)?.as_str().parse().ok()
}

#[async_trait]
impl SpecStore for SimulatedNode {
    async fn read_spec(&self, resource: &str) -> Result<Value> {
        let state = self.state();
        if state.fail_reads {
            return Err(Error::transient(resource, "read rejected"));
        }
        Ok(state.spec.clone())
    }

    async fn write_spec(&self, resource: &str, spec: Value) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(Error::internal_with_context(resource, "write rejected"));
        }
        state.spec = spec;
        state.rollouts += 1;
        if state.rollout.is_some() {
            state.queued = true;
        } else {
            state.start_rollout();
        }
        Ok(())
    }
}

#[async_trait]
impl ConditionStore for SimulatedNode {
    async fn get_condition(&self, _rollout: &str, condition: &str) -> Result<bool> {
        let mut guard = self.state();
        let state = &mut *guard;
        match condition {
            CONDITION_DEGRADED => Ok(false),
            CONDITION_UPDATING => match state.rollout.as_mut() {
                Some(rollout) if rollout.polls_left > 0 => {
                    rollout.polls_left -= 1;
                    Ok(true)
                }
                Some(_) => {
                    if let Some(done) = state.rollout.take() {
                        state.applied = done.target;
                    }
                    Ok(false)
                }
                None => {
                    if std::mem::take(&mut state.queued) {
                        state.start_rollout();
                    }
                    Ok(false)
                }
            },
            other => Err(Error::validation(format!("unknown condition {other}"))),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedNode {
    async fn execute(&self, target: &Target, command: &str) -> Result<String> {
        let state = self.state();
        match target {
            Target::Node(name) if name == NODE => {}
            Target::Pod { .. } if state.pod.as_ref() == Some(target) => {
                if command.contains("taskset") {
                    let cpus: Vec<String> = state.pod_cpus.iter().map(u32::to_string).collect();
                    return Ok(format!(" {}\n", cpus.join(",")));
                }
                return Err(Error::exec(target, format!("unknown command {command}")));
            }
            other => return Err(Error::exec(other, "no such target")),
        }

        if command.contains("/proc/cmdline") {
            return Ok(format!("{}\n", cmdline(&state)));
        }
        let Some(cpu) = cpu_in(command) else {
            return Err(Error::exec(target, format!("unknown command {command}")));
        };
        if cpu >= CPU_COUNT {
            return Ok(String::new());
        }
        let value = if command.contains("scaling_max_freq") {
            frequency(&state, cpu)
        } else if command.contains("pm_qos_resume_latency_us") {
            resume_latency(&state, cpu).to_string()
        } else if command.contains("scaling_governor") {
            "performance".to_string()
        } else {
            return Err(Error::exec(target, format!("unknown command {command}")));
        };
        Ok(format!("{value}\n"))
    }
}

#[async_trait]
impl WorkloadLifecycle for SimulatedNode {
    async fn create(&self, spec: &WorkloadSpec) -> Result<Target> {
        let target = spec.target();
        self.state().pod = Some(target.clone());
        Ok(target)
    }

    async fn wait_running(&self, target: &Target) -> Result<()> {
        match &self.state().pod {
            Some(pod) if pod == target => Ok(()),
            _ => Err(Error::validation(format!("{target} is not running"))),
        }
    }

    async fn exists(&self, target: &Target) -> Result<bool> {
        Ok(self.state().pod.as_ref() == Some(target))
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        let mut state = self.state();
        if state.pod.as_ref() == Some(target) {
            state.pod = None;
        }
        Ok(())
    }
}

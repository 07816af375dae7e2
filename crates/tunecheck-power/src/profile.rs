//! PerformanceProfile access.
//!
//! Profiles are read and written as untyped JSON specs through [`SpecStore`]
//! so that a [`ConfigurationChange`](crate::change::ConfigurationChange) can
//! address any field, including ones newer operator versions add.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use tunecheck_common::cpuset::CpuSet;
use tunecheck_common::kube_utils::build_api_resource;
use tunecheck_common::retry::{retry_if, RetryConfig};
use tunecheck_common::{Error, Result, FIELD_MANAGER};

/// API group of PerformanceProfile
pub const PROFILE_GROUP: &str = "performance.openshift.io";
/// API version of PerformanceProfile
pub const PROFILE_VERSION: &str = "v2";
/// Kind of PerformanceProfile
pub const PROFILE_KIND: &str = "PerformanceProfile";

/// Prefix of the runtime class the node tuning operator creates per profile
pub const RUNTIME_CLASS_PREFIX: &str = "performance";

/// Read/write access to the spec of a configuration object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Current spec of `resource`
    async fn read_spec(&self, resource: &str) -> Result<Value>;

    /// Replace the spec of `resource`
    async fn write_spec(&self, resource: &str, spec: Value) -> Result<()>;
}

/// [`SpecStore`] over cluster-scoped PerformanceProfiles
pub struct PerformanceProfiles {
    api: Api<DynamicObject>,
    retry: RetryConfig,
}

impl PerformanceProfiles {
    /// Create a store backed by the cluster's PerformanceProfiles
    pub fn new(client: Client) -> Self {
        let ar = build_api_resource(PROFILE_GROUP, PROFILE_VERSION, PROFILE_KIND);
        Self {
            api: Api::all_with(client, &ar),
            retry: RetryConfig::default(),
        }
    }

    /// Every profile with its spec
    pub async fn list(&self) -> Result<Vec<(String, Value)>> {
        let profiles = self.api.list(&ListParams::default()).await?;
        Ok(profiles
            .items
            .into_iter()
            .filter_map(|p| {
                let name = p.metadata.name?;
                let spec = p.data.get("spec").cloned().unwrap_or(Value::Null);
                Some((name, spec))
            })
            .collect())
    }

    async fn replace_spec_once(&self, resource: &str, spec: &Value) -> Result<()> {
        // The fetched object carries the resourceVersion, so a concurrent
        // writer turns this replace into a 409.
        let mut profile = self.api.get(resource).await?;
        match profile.data.as_object_mut() {
            Some(data) => {
                data.insert("spec".to_string(), spec.clone());
            }
            None => {
                return Err(Error::serialization_for_kind(
                    PROFILE_KIND,
                    format!("profile {resource} is not an object"),
                ))
            }
        }

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api.replace(resource, &params, &profile).await?;
        Ok(())
    }
}

#[async_trait]
impl SpecStore for PerformanceProfiles {
    async fn read_spec(&self, resource: &str) -> Result<Value> {
        let profile = self.api.get(resource).await?;
        profile.data.get("spec").cloned().ok_or_else(|| {
            Error::serialization_for_kind(PROFILE_KIND, format!("profile {resource} has no spec"))
        })
    }

    async fn write_spec(&self, resource: &str, spec: Value) -> Result<()> {
        retry_if(
            &self.retry,
            "replace_performance_profile",
            |e| e.is_conflict() || e.is_transient(),
            || self.replace_spec_once(resource, &spec),
        )
        .await?;
        info!(profile = %resource, "Replaced performance profile spec");
        Ok(())
    }
}

/// The facts about a profile the scenarios depend on
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileInfo {
    /// Profile name
    pub name: String,
    /// CPUs isolated for workloads
    pub isolated: CpuSet,
    /// CPUs reserved for housekeeping
    pub reserved: CpuSet,
    /// Whether `spec.workloadHints` is set
    pub has_workload_hints: bool,
}

impl ProfileInfo {
    /// Extract profile facts from its spec. Returns `None` unless both
    /// `cpu.isolated` and `cpu.reserved` are set.
    pub fn from_spec(name: &str, spec: &Value) -> Result<Option<Self>> {
        let cpu = spec.get("cpu");
        let isolated = cpu.and_then(|c| c.get("isolated")).and_then(Value::as_str);
        let reserved = cpu.and_then(|c| c.get("reserved")).and_then(Value::as_str);
        let (Some(isolated), Some(reserved)) = (isolated, reserved) else {
            return Ok(None);
        };

        Ok(Some(Self {
            name: name.to_string(),
            isolated: CpuSet::parse(isolated)?,
            reserved: CpuSet::parse(reserved)?,
            has_workload_hints: spec.get("workloadHints").is_some_and(|h| !h.is_null()),
        }))
    }

    /// Runtime class the operator creates for this profile
    pub fn runtime_class(&self) -> String {
        format!("{RUNTIME_CLASS_PREFIX}-{}", self.name)
    }
}

/// The first profile, in listing order, that sets both isolated and reserved
/// CPUs
pub fn select_profile(profiles: &[(String, Value)]) -> Result<ProfileInfo> {
    for (name, spec) in profiles {
        if let Some(info) = ProfileInfo::from_spec(name, spec)? {
            debug!(profile = %name, isolated = %info.isolated, reserved = %info.reserved, "Selected performance profile");
            return Ok(info);
        }
        debug!(profile = %name, "Skipping profile without isolated and reserved CPUs");
    }
    Err(Error::topology(
        "no performance profile sets both cpu.isolated and cpu.reserved",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_profile_with_both_cpusets_is_selected() {
        let profiles = vec![
            ("no-cpus".to_string(), json!({"numa": {}})),
            ("only-reserved".to_string(), json!({"cpu": {"reserved": "0-1"}})),
            (
                "du".to_string(),
                json!({"cpu": {"isolated": "2-7", "reserved": "0-1"}}),
            ),
            (
                "other".to_string(),
                json!({"cpu": {"isolated": "1-7", "reserved": "0"}}),
            ),
        ];

        let info = select_profile(&profiles).expect("profile found");
        assert_eq!(info.name, "du");
        assert_eq!(info.isolated.list(), vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(info.reserved.list(), vec![0, 1]);
        assert!(!info.has_workload_hints);
        assert_eq!(info.runtime_class(), "performance-du");
    }

    #[test]
    fn no_matching_profile_is_a_topology_error() {
        let profiles = vec![("x".to_string(), json!({}))];
        assert!(matches!(
            select_profile(&profiles),
            Err(Error::Topology { .. })
        ));
    }

    #[test]
    fn workload_hints_are_detected() {
        let spec = json!({
            "cpu": {"isolated": "2-3", "reserved": "0-1"},
            "workloadHints": {"realTime": true}
        });
        let info = ProfileInfo::from_spec("p", &spec)
            .expect("valid")
            .expect("has cpus");
        assert!(info.has_workload_hints);
    }

    #[test]
    fn malformed_cpuset_is_rejected() {
        let spec = json!({"cpu": {"isolated": "7-2", "reserved": "0"}});
        assert!(ProfileInfo::from_spec("p", &spec).is_err());
    }
}

//! Discover the node and performance profile the scenarios run against

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::info;

use tunecheck_common::config::PowerConfig;
use tunecheck_common::{Error, Result};

use crate::profile::{select_profile, PerformanceProfiles, ProfileInfo};
use crate::scenario::ScenarioContext;

/// Build the [`ScenarioContext`] for a single-node cluster
pub async fn discover(client: &Client, config: &PowerConfig) -> Result<ScenarioContext> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node = single_node(nodes.list(&ListParams::default()).await?.items)?;
    let node_name = node
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::topology("node has no name"))?;
    let cpu_count = cpu_capacity(&node)?;

    let profiles = PerformanceProfiles::new(client.clone()).list().await?;
    let profile = select_profile(&profiles)?;
    check_probe_cpus(&profile, config)?;

    info!(
        node = %node_name,
        cpus = cpu_count,
        profile = %profile.name,
        isolated = %profile.isolated,
        reserved = %profile.reserved,
        workload_hints = profile.has_workload_hints,
        "Discovered cluster under test"
    );

    Ok(ScenarioContext {
        node: node_name,
        cpu_count,
        profile,
        namespace: config.privileged_namespace.clone(),
        image: config.probe_image.clone(),
        isolated_probe_cpu: config.isolated_probe_cpu,
        reserved_probe_cpu: config.reserved_probe_cpu,
    })
}

/// The only node of the cluster
pub fn single_node(mut nodes: Vec<Node>) -> Result<Node> {
    match nodes.len() {
        1 => Ok(nodes.remove(0)),
        n => Err(Error::topology(format!(
            "expected a single-node cluster, found {n} nodes"
        ))),
    }
}

/// Logical CPUs from `status.capacity.cpu`, in whole CPUs or millicores
pub fn cpu_capacity(node: &Node) -> Result<u32> {
    let raw = node
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("cpu"))
        .map(|q| q.0.as_str())
        .ok_or_else(|| Error::topology("node reports no cpu capacity"))?;

    let parsed = match raw.strip_suffix('m') {
        Some(milli) => milli.parse::<u32>().map(|m| m / 1000),
        None => raw.parse::<u32>(),
    };
    match parsed {
        Ok(0) | Err(_) => Err(Error::topology(format!("unusable cpu capacity {raw:?}"))),
        Ok(count) => Ok(count),
    }
}

/// The frequency probe CPUs must sit in the sets they stand for
pub fn check_probe_cpus(profile: &ProfileInfo, config: &PowerConfig) -> Result<()> {
    if !profile.isolated.contains(config.isolated_probe_cpu) {
        return Err(Error::validation_for_field(
            "isolatedProbeCpu",
            format!(
                "cpu{} is not isolated in profile {} ({})",
                config.isolated_probe_cpu, profile.name, profile.isolated
            ),
        ));
    }
    if !profile.reserved.contains(config.reserved_probe_cpu) {
        return Err(Error::validation_for_field(
            "reservedProbeCpu",
            format!(
                "cpu{} is not reserved in profile {} ({})",
                config.reserved_probe_cpu, profile.name, profile.reserved
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;
    use serde_json::json;

    fn node(name: &str, cpu: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: cpu.map(|c| BTreeMap::from([("cpu".to_string(), Quantity(c.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn profile() -> ProfileInfo {
        ProfileInfo::from_spec("du", &json!({"cpu": {"isolated": "2-7", "reserved": "0-1"}}))
            .expect("valid")
            .expect("cpusets set")
    }

    #[test]
    fn exactly_one_node_is_required() {
        assert!(single_node(vec![]).is_err());
        assert!(single_node(vec![node("a", None), node("b", None)]).is_err());

        let only = single_node(vec![node("sno-0", Some("8"))]).expect("single node");
        assert_eq!(only.metadata.name.as_deref(), Some("sno-0"));
    }

    #[rstest]
    #[case("8", 8)]
    #[case("64", 64)]
    #[case("16000m", 16)]
    fn capacity_parses(#[case] raw: &str, #[case] expected: u32) {
        assert_eq!(cpu_capacity(&node("n", Some(raw))).expect("parses"), expected);
    }

    #[rstest]
    #[case(None)]
    #[case(Some("0"))]
    #[case(Some("500m"))]
    #[case(Some("lots"))]
    fn unusable_capacity_is_a_topology_error(#[case] raw: Option<&str>) {
        assert!(matches!(
            cpu_capacity(&node("n", raw)),
            Err(Error::Topology { .. })
        ));
    }

    #[test]
    fn probe_cpus_must_match_their_sets() {
        let config = PowerConfig::default();
        check_probe_cpus(&profile(), &config).expect("defaults fit the profile");

        let swapped = PowerConfig {
            isolated_probe_cpu: 0,
            reserved_probe_cpu: 2,
            ..PowerConfig::default()
        };
        let err = check_probe_cpus(&profile(), &swapped).expect_err("cpu0 is reserved");
        assert!(matches!(err, Error::Validation { field: Some(ref f), .. } if f == "isolatedProbeCpu"));
    }
}

//! The MetalLB operator suite

use std::time::Duration;

use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::core::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tracing::info;

use tunecheck_common::config::MetalLbConfig;
use tunecheck_common::kube_utils::{
    build_api_resource, namespace_exists, wait_for_daemonset, wait_for_deployment,
};
use tunecheck_common::poll::Poller;
use tunecheck_common::{Error, Result, FIELD_MANAGER, MANAGED_BY_LABEL};
use tunecheck_power::Outcome;

use super::connect;
use crate::harness::TestHarness;
use crate::GlobalArgs;

const OLM_GROUP: &str = "operators.coreos.com";
const CSV_SUCCEEDED: &str = "Succeeded";
/// How long the namespace lookup rides out API blips
const NAMESPACE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

fn package_manifests() -> ApiResource {
    build_api_resource("packages.operators.coreos.com", "v1", "PackageManifest")
}

fn install_plans() -> ApiResource {
    build_api_resource(OLM_GROUP, "v1alpha1", "InstallPlan")
}

fn subscriptions() -> ApiResource {
    build_api_resource(OLM_GROUP, "v1alpha1", "Subscription")
}

fn cluster_service_versions() -> ApiResource {
    build_api_resource(OLM_GROUP, "v1alpha1", "ClusterServiceVersion")
}

fn metallbs() -> ApiResource {
    build_api_resource("metallb.io", "v1beta1", "MetalLB")
}

/// Run the MetalLB operator suite
pub async fn run(global: &GlobalArgs) -> crate::Result<()> {
    let (config, client) = connect(global).await?;
    let metallb = &config.metallb;

    let harness = TestHarness::new("metallb");
    harness
        .run("namespace-exists", || check_namespace(&client, metallb))
        .await;
    harness
        .run("operator-installed", || check_operator(&client, metallb))
        .await;
    harness.finish()
}

async fn check_namespace(client: &Client, config: &MetalLbConfig) -> Result<Outcome> {
    if namespace_exists(client, &config.namespace, NAMESPACE_LOOKUP_TIMEOUT).await? {
        Ok(Outcome::Passed)
    } else {
        Err(Error::validation(format!(
            "namespace {} does not exist",
            config.namespace
        )))
    }
}

async fn check_operator(client: &Client, config: &MetalLbConfig) -> Result<Outcome> {
    let ns = config.namespace.as_str();

    let manifests: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &config.operators_namespace, &package_manifests());
    if manifests.get_opt(&config.operator_name).await?.is_none() {
        return Err(Error::validation(format!(
            "package manifest {} not found in {}",
            config.operator_name, config.operators_namespace
        )));
    }
    info!(operator = %config.operator_name, "Operator package is available");

    let plans: Api<DynamicObject> = Api::namespaced_with(client.clone(), ns, &install_plans());
    let plan_names: Vec<String> = plans
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter_map(|p| p.metadata.name)
        .collect();
    expect_single_install_plan(ns, &plan_names)?;

    let subs: Api<DynamicObject> = Api::namespaced_with(client.clone(), ns, &subscriptions());
    let subscription = subs.get(&config.subscription_name).await?;
    let csv_name = current_csv(&subscription)?;

    let csvs: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), ns, &cluster_service_versions());
    let csv = csvs.get(&csv_name).await?;
    match csv_phase(&csv) {
        Some(CSV_SUCCEEDED) => info!(csv = %csv_name, "Operator CSV succeeded"),
        phase => {
            return Err(Error::validation(format!(
                "csv {csv_name} in {ns} is in phase {}, expected {CSV_SUCCEEDED}",
                phase.unwrap_or("<none>")
            )))
        }
    }

    let instances: Api<DynamicObject> = Api::namespaced_with(client.clone(), ns, &metallbs());
    if instances.get_opt(&config.instance_name).await?.is_none() {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        instances.create(&params, &metallb_instance(config)).await?;
        info!(instance = %config.instance_name, "Created MetalLB instance");

        wait_for_deployment(client, &config.deployment_name, ns, config.deployment_timeout())
            .await?;
        ensure_instance_present(&instances, &config.instance_name).await?;
    }

    wait_for_daemonset(client, &config.daemonset_name, ns, config.daemonset_timeout()).await?;
    info!(daemonset = %config.daemonset_name, "Speaker daemonset is ready");
    Ok(Outcome::Passed)
}

async fn ensure_instance_present(instances: &Api<DynamicObject>, name: &str) -> Result<()> {
    Poller::new(Duration::from_secs(1), Duration::from_secs(10))
        .poll(&format!("MetalLB instance {name}"), || async move {
            Ok(instances.get_opt(name).await?.map(|_| ()))
        })
        .await
}

/// The MetalLB resource the suite creates when none exists
pub fn metallb_instance(config: &MetalLbConfig) -> DynamicObject {
    let mut instance = DynamicObject::new(&config.instance_name, &metallbs())
        .within(&config.namespace)
        .data(json!({
            "spec": {
                "nodeSelector": config.worker_label_map,
            }
        }));
    instance.metadata.labels = Some(
        [(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string())]
            .into_iter()
            .collect(),
    );
    instance
}

/// The CSV a subscription currently installs
pub fn current_csv(subscription: &DynamicObject) -> Result<String> {
    subscription
        .data
        .get("status")
        .and_then(|s| s.get("currentCSV"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::validation(format!(
                "subscription {} has no current CSV",
                subscription.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))
        })
}

/// `status.phase` of a ClusterServiceVersion
pub fn csv_phase(csv: &DynamicObject) -> Option<&str> {
    csv.data
        .get("status")
        .and_then(|s| s.get("phase"))
        .and_then(Value::as_str)
}

/// The operator must have been installed by exactly one plan
pub fn expect_single_install_plan(namespace: &str, plans: &[String]) -> Result<()> {
    match plans {
        [only] => {
            info!(plan = %only, namespace = %namespace, "Found install plan");
            Ok(())
        }
        _ => Err(Error::validation(format!(
            "expected exactly one install plan in {namespace}, found {}: [{}]",
            plans.len(),
            plans.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn object(name: &str, data: Value) -> DynamicObject {
        DynamicObject::new(name, &subscriptions()).data(data)
    }

    #[test]
    fn instance_selects_worker_nodes() {
        let instance = metallb_instance(&MetalLbConfig::default());
        assert_eq!(instance.metadata.name.as_deref(), Some("metallb"));
        assert_eq!(instance.metadata.namespace.as_deref(), Some("metallb-system"));
        assert_eq!(
            instance.data["spec"]["nodeSelector"],
            json!({"node-role.kubernetes.io/worker": ""})
        );
        assert_eq!(instance.types.as_ref().map(|t| t.kind.as_str()), Some("MetalLB"));
    }

    #[test]
    fn current_csv_comes_from_subscription_status() {
        let sub = object(
            "metallb-operator-sub",
            json!({"status": {"currentCSV": "metallb-operator.v4.16.0"}}),
        );
        assert_eq!(current_csv(&sub).expect("csv set"), "metallb-operator.v4.16.0");

        let pending = object("metallb-operator-sub", json!({"status": {"currentCSV": ""}}));
        assert!(current_csv(&pending).is_err());
        assert!(current_csv(&object("s", json!({}))).is_err());
    }

    #[rstest]
    #[case(json!({"status": {"phase": "Succeeded"}}), Some("Succeeded"))]
    #[case(json!({"status": {"phase": "Installing"}}), Some("Installing"))]
    #[case(json!({}), None)]
    fn csv_phase_reads_status(#[case] data: Value, #[case] expected: Option<&str>) {
        assert_eq!(csv_phase(&object("csv", data)), expected);
    }

    #[rstest]
    #[case(&[], false)]
    #[case(&["install-abc"], true)]
    #[case(&["install-abc", "install-def"], false)]
    fn exactly_one_install_plan(#[case] plans: &[&str], #[case] ok: bool) {
        let plans: Vec<String> = plans.iter().map(|p| p.to_string()).collect();
        assert_eq!(expect_single_install_plan("metallb-system", &plans).is_ok(), ok);
    }
}

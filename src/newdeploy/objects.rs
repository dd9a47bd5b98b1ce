//! Desired deployment, service and autoscaler of a new-deploy function.

use std::collections::BTreeMap;

use data_model::{
    crd::{Environment, Function, DEFAULT_TARGET_CPU_PERCENT},
    ExecutorType,
    ANNOTATION_EXECUTOR_INSTANCE_ID,
    ENV_RESOURCE_VERSION_COUNT,
    FETCHER_SERVICE_ACCOUNT,
    LABEL_ENVIRONMENT_NAME,
    LABEL_ENVIRONMENT_NAMESPACE,
    LABEL_ENVIRONMENT_UID,
    LABEL_EXECUTOR_TYPE,
    LABEL_FUNCTION_NAME,
    LABEL_FUNCTION_NAMESPACE,
    LABEL_FUNCTION_UID,
    RUNTIME_PORT,
    RUNTIME_PORT_NAME,
};
use executor_utils::names::{dns_label, tail};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        autoscaling::v1::{
            CrossVersionObjectReference,
            HorizontalPodAutoscaler,
            HorizontalPodAutoscalerSpec,
        },
        core::v1::{
            Container,
            ContainerPort,
            EnvVar,
            ExecAction,
            Lifecycle,
            LifecycleHandler,
            LocalObjectReference,
            PodSpec,
            PodTemplateSpec,
            ResourceRequirements,
            Service,
            ServicePort,
            ServiceSpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{api::ObjectMeta, ResourceExt};
use tracing::warn;

use crate::{
    cluster::Cluster,
    config::ServerConfig,
    error::ExecutorResult,
    fetcher::FetcherConfig,
    podspec::{merge_container, merge_pod_spec},
    poolmgr::deployment::{ISTIO_INJECT_ANNOTATION, TERMINATION_MESSAGE_PATH},
};

const SERVICE_PORT: i32 = 80;
const MAX_SURGE_AND_UNAVAILABLE: &str = "20%";

/// `newdeploy-<fn>-<ns>-<uid tail>`, shortened to a DNS label. Shared by the
/// deployment, service and autoscaler of the function.
pub fn object_name(function: &Function) -> String {
    let uid = function.uid().unwrap_or_default();
    dns_label(&[
        "newdeploy",
        &function.name_any(),
        &function.namespace().unwrap_or_default(),
        tail(&uid, 17),
    ])
}

/// Pods of one function, across environment changes.
pub fn function_selector(function: &Function) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            LABEL_EXECUTOR_TYPE.to_string(),
            ExecutorType::Newdeploy.to_string(),
        ),
        (LABEL_FUNCTION_NAME.to_string(), function.name_any()),
        (
            LABEL_FUNCTION_NAMESPACE.to_string(),
            function.namespace().unwrap_or_default(),
        ),
        (
            LABEL_FUNCTION_UID.to_string(),
            function.uid().unwrap_or_default(),
        ),
    ])
}

pub fn object_labels(function: &Function, env: &Environment) -> BTreeMap<String, String> {
    let mut labels = function_selector(function);
    labels.extend([
        (LABEL_ENVIRONMENT_NAME.to_string(), env.name_any()),
        (
            LABEL_ENVIRONMENT_NAMESPACE.to_string(),
            env.namespace().unwrap_or_default(),
        ),
        (
            LABEL_ENVIRONMENT_UID.to_string(),
            env.uid().unwrap_or_default(),
        ),
    ]);
    labels
}

fn object_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>, instance_id: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        annotations: Some(BTreeMap::from([(
            ANNOTATION_EXECUTOR_INSTANCE_ID.to_string(),
            instance_id.to_string(),
        )])),
        ..Default::default()
    }
}

/// Minimum replica count of a function; never below one.
pub fn min_replicas(function: &Function) -> i32 {
    function.spec.strategy().min_scale.max(1)
}

pub fn max_replicas(function: &Function) -> i32 {
    function.spec.strategy().max_scale.max(min_replicas(function))
}

/// Environment resources with the function's requests and limits on top.
fn merge_resources(env: &ResourceRequirements, function: &ResourceRequirements) -> ResourceRequirements {
    let merge = |base: &Option<BTreeMap<_, _>>, overlay: &Option<BTreeMap<_, _>>| {
        let mut merged = base.clone().unwrap_or_default();
        merged.extend(overlay.clone().unwrap_or_default());
        (!merged.is_empty()).then_some(merged)
    };
    ResourceRequirements {
        requests: merge(&env.requests, &function.requests),
        limits: merge(&env.limits, &function.limits),
        claims: function.claims.clone().or_else(|| env.claims.clone()),
    }
}

/// Sum of the resourceVersions of the function's secrets and config maps.
/// Any of them changing changes the pod template and rolls the deployment.
pub async fn resource_version_count(cluster: &Cluster, function: &Function) -> u64 {
    let function_namespace = function.namespace().unwrap_or_default();
    let resolve = |namespace: &str| {
        if namespace.is_empty() {
            function_namespace.clone()
        } else {
            namespace.to_string()
        }
    };
    let version = |rv: Option<String>| rv.and_then(|rv| rv.parse::<u64>().ok()).unwrap_or_default();

    let mut count = 0;
    for secret in &function.spec.secrets {
        match cluster.secrets.get(&resolve(&secret.namespace), &secret.name).await {
            Ok(found) => count += version(found.resource_version()),
            Err(err) => warn!(secret = %secret.name, error = %err, "skipping secret in resource version count"),
        }
    }
    for config_map in &function.spec.configmaps {
        match cluster
            .config_maps
            .get(&resolve(&config_map.namespace), &config_map.name)
            .await
        {
            Ok(found) => count += version(found.resource_version()),
            Err(err) => warn!(configmap = %config_map.name, error = %err, "skipping configmap in resource version count"),
        }
    }
    count
}

#[allow(clippy::too_many_arguments)]
pub fn deployment(
    function: &Function,
    env: &Environment,
    name: &str,
    namespace: &str,
    replicas: i32,
    resource_version_count: u64,
    config: &ServerConfig,
    fetcher: &FetcherConfig,
    instance_id: &str,
) -> ExecutorResult<Deployment> {
    let container_name = function.name_any();
    let grace = env.spec.termination_grace();

    let mut container = Container {
        name: container_name.clone(),
        image: Some(env.spec.runtime.image.clone()),
        image_pull_policy: Some(config.runtime_image_pull_policy.as_str().to_string()),
        termination_message_path: Some(TERMINATION_MESSAGE_PATH.to_string()),
        resources: Some(merge_resources(&env.spec.resources, &function.spec.resources)),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec!["/bin/sleep".to_string(), grace.to_string()]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ports: Some(vec![ContainerPort {
            name: Some(RUNTIME_PORT_NAME.to_string()),
            container_port: i32::from(RUNTIME_PORT),
            ..Default::default()
        }]),
        env: Some(vec![EnvVar {
            name: ENV_RESOURCE_VERSION_COUNT.to_string(),
            value: Some(resource_version_count.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };
    if let Some(overlay) = &env.spec.runtime.container {
        container = merge_container(&container, overlay)?;
    }

    let mut pod_spec = PodSpec {
        containers: vec![container],
        service_account_name: Some(FETCHER_SERVICE_ACCOUNT.to_string()),
        termination_grace_period_seconds: Some(grace),
        image_pull_secrets: env
            .spec
            .image_pull_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .map(|secret| vec![LocalObjectReference { name: secret }]),
        ..Default::default()
    };
    fetcher.add_specializing_fetcher_to_pod_spec(&mut pod_spec, &container_name, function, env)?;
    if let Some(overlay) = &env.spec.runtime.pod_spec {
        pod_spec = merge_pod_spec(&pod_spec, overlay)?;
    }

    let labels = object_labels(function, env);
    let mut pod_annotations = env.annotations().clone();
    if config.enable_istio && env.spec.allow_access_to_external_network {
        pod_annotations.insert(ISTIO_INJECT_ANNOTATION.to_string(), "false".to_string());
    }
    let surge = || Some(IntOrString::String(MAX_SURGE_AND_UNAVAILABLE.to_string()));

    Ok(Deployment {
        metadata: object_meta(name, namespace, labels.clone(), instance_id),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(function_selector(function)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: surge(),
                    max_unavailable: surge(),
                }),
            }),
            revision_history_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: (!pod_annotations.is_empty()).then_some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

pub fn service(function: &Function, env: &Environment, name: &str, namespace: &str, instance_id: &str) -> Service {
    Service {
        metadata: object_meta(name, namespace, object_labels(function, env), instance_id),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(RUNTIME_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(i32::from(RUNTIME_PORT))),
                ..Default::default()
            }]),
            selector: Some(function_selector(function)),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn autoscaler(
    function: &Function,
    env: &Environment,
    name: &str,
    namespace: &str,
    instance_id: &str,
) -> HorizontalPodAutoscaler {
    let target_cpu = match function.spec.strategy().target_cpu_percent {
        percent if percent > 0 => percent,
        _ => DEFAULT_TARGET_CPU_PERCENT,
    };
    HorizontalPodAutoscaler {
        metadata: object_meta(name, namespace, object_labels(function, env), instance_id),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: name.to_string(),
            },
            min_replicas: Some(min_replicas(function)),
            max_replicas: max_replicas(function),
            target_cpu_utilization_percentage: Some(target_cpu),
        }),
        status: None,
    }
}

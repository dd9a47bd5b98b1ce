//! Naming, labels and the deployment spec of generic pools.

use std::collections::BTreeMap;

use data_model::{
    crd::{Environment, Function},
    ExecutorType,
    ANNOTATION_EXECUTOR_INSTANCE_ID,
    FETCHER_SERVICE_ACCOUNT,
    LABEL_ENVIRONMENT_NAME,
    LABEL_ENVIRONMENT_NAMESPACE,
    LABEL_ENVIRONMENT_UID,
    LABEL_EXECUTOR_TYPE,
    LABEL_FUNCTION_NAME,
    LABEL_FUNCTION_NAMESPACE,
    LABEL_FUNCTION_UID,
    LABEL_MANAGED,
    RUNTIME_PORT,
    RUNTIME_PORT_NAME,
};
use executor_utils::names::dns_label;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container,
            ContainerPort,
            ExecAction,
            Lifecycle,
            LifecycleHandler,
            LocalObjectReference,
            PodSpec,
            PodTemplateSpec,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{api::ObjectMeta, ResourceExt};

use crate::{
    config::ServerConfig,
    error::ExecutorResult,
    fetcher::FetcherConfig,
    podspec::{merge_container, merge_pod_spec},
};

pub const ISTIO_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";
pub const TERMINATION_MESSAGE_PATH: &str = "/dev/termination-log";

/// `poolmgr-<env>-<ns>-<env resourceVersion>`, shortened to a DNS label.
pub fn pool_deployment_name(env: &Environment) -> String {
    dns_label(&[
        "poolmgr",
        &env.name_any(),
        &env.namespace().unwrap_or_default(),
        &env.resource_version().unwrap_or_default(),
    ])
}

/// Labels shared by every pod of an environment's pool, specialized or not.
pub fn environment_labels(env: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            LABEL_EXECUTOR_TYPE.to_string(),
            ExecutorType::Poolmgr.to_string(),
        ),
        (LABEL_ENVIRONMENT_NAME.to_string(), env.name_any()),
        (
            LABEL_ENVIRONMENT_NAMESPACE.to_string(),
            env.namespace().unwrap_or_default(),
        ),
        (
            LABEL_ENVIRONMENT_UID.to_string(),
            env.uid().unwrap_or_default(),
        ),
    ])
}

/// Selector of the generic, not yet specialized pods of a pool.
pub fn pool_selector(env: &Environment) -> BTreeMap<String, String> {
    let mut labels = environment_labels(env);
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels
}

/// Labels of a pod specialized for `function`. Flipping `managed` takes the
/// pod out of the pool's selector.
pub fn specialized_pod_labels(env: &Environment, function: &Function) -> BTreeMap<String, String> {
    let mut labels = environment_labels(env);
    labels.extend([
        (LABEL_FUNCTION_NAME.to_string(), function.name_any()),
        (
            LABEL_FUNCTION_NAMESPACE.to_string(),
            function.namespace().unwrap_or_default(),
        ),
        (
            LABEL_FUNCTION_UID.to_string(),
            function.uid().unwrap_or_default(),
        ),
        (LABEL_MANAGED.to_string(), "false".to_string()),
    ]);
    labels
}

fn pre_stop_sleep(grace: i64) -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec!["/bin/sleep".to_string(), grace.to_string()]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(port),
        ..Default::default()
    }
}

/// Desired pool deployment for `env` in `namespace`.
pub fn pool_deployment(
    env: &Environment,
    namespace: &str,
    name: &str,
    config: &ServerConfig,
    fetcher: &FetcherConfig,
    instance_id: &str,
) -> ExecutorResult<Deployment> {
    let env_name = env.name_any();
    let grace = env.spec.termination_grace();

    let mut container = Container {
        name: env_name.clone(),
        image: Some(env.spec.runtime.image.clone()),
        image_pull_policy: Some(config.runtime_image_pull_policy.as_str().to_string()),
        termination_message_path: Some(TERMINATION_MESSAGE_PATH.to_string()),
        resources: Some(env.spec.resources.clone()),
        lifecycle: Some(pre_stop_sleep(grace)),
        ports: Some(vec![port(RUNTIME_PORT_NAME, RUNTIME_PORT)]),
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
    fetcher.add_fetcher_to_pod_spec(&mut pod_spec, &env_name)?;
    if let Some(overlay) = &env.spec.runtime.pod_spec {
        pod_spec = merge_pod_spec(&pod_spec, overlay)?;
    }

    let selector = pool_selector(env);
    let mut labels = env.labels().clone();
    labels.extend(selector.clone());

    let mut pod_annotations = env.annotations().clone();
    if config.enable_istio && env.spec.allow_access_to_external_network {
        pod_annotations.insert(ISTIO_INJECT_ANNOTATION.to_string(), "false".to_string());
    }
    let mut annotations = env.annotations().clone();
    annotations.insert(
        ANNOTATION_EXECUTOR_INSTANCE_ID.to_string(),
        instance_id.to_string(),
    );

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(env.spec.pool_size()),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
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

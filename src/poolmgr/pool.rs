//! One generic pool: a deployment of unspecialized runtime pods for an
//! environment, and the worker that hands its pods out to functions.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use data_model::{
    crd::{Environment, Function},
    EnvironmentMeta,
    ExecutorType,
    FuncSvc,
    FuncSvcBuilder,
    FunctionMeta,
    ObjectKind,
    ObjectRef,
    ANNOTATION_EXECUTOR_INSTANCE_ID,
    ANNOTATION_FUNCTION_GENERATION,
    ANNOTATION_FUNCTION_RESOURCE_VERSION,
    ANNOTATION_SVC_HOST,
    LABEL_FUNCTION_NAME,
    LABEL_FUNCTION_UID,
    RUNTIME_PORT,
    RUNTIME_PORT_NAME,
};
use executor_utils::{names::dns_label, retry::Backoff};
use itertools::Itertools;
use k8s_openapi::{
    api::core::v1::{Pod, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{api::ObjectMeta, ResourceExt};
use serde_json::json;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    deployment::{pool_deployment, pool_deployment_name, pool_selector, specialized_pod_labels},
    PoolContext,
};
use crate::{
    cluster::{create_or_adopt, delete_ignore_missing, labels_match, retry_on_conflict, Cluster, ClusterError, Propagation},
    error::{ExecutorError, ExecutorResult},
    fetcher::{fetcher_url, FETCHER_PORT_NAME},
    fscache::AddResult,
};

const CHOOSE_BACKOFF: Backoff = Backoff::Exponential {
    initial: Duration::from_millis(100),
    max: Duration::from_secs(2),
};

/// Ready to serve: running, every container ready, an IP assigned and not
/// being deleted.
pub fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty())
        && status
            .container_statuses
            .as_ref()
            .is_some_and(|statuses| !statuses.is_empty() && statuses.iter().all(|c| c.ready))
}

/// Not finished and not being deleted.
pub fn is_pod_active(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    pod.metadata.deletion_timestamp.is_none() && !matches!(phase, Some("Succeeded" | "Failed"))
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// Name of the per-function service used when running inside a mesh.
pub fn istio_service_name(function: &Function) -> String {
    dns_label(&[
        "istio",
        &function.name_any(),
        &function.namespace().unwrap_or_default(),
    ])
}

/// Creates the per-function mesh service in `namespace` unless it exists.
pub async fn ensure_istio_service(
    cluster: &Cluster,
    function: &Function,
    namespace: &str,
    fetcher_port: u16,
) -> ExecutorResult<String> {
    let name = istio_service_name(function);
    let function_name = function.name_any();
    let port = |port_name: &str, port: u16| ServicePort {
        name: Some(port_name.to_string()),
        protocol: Some("TCP".to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        ..Default::default()
    };
    let service = Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_FUNCTION_NAME.to_string(),
                function_name.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![
                port(FETCHER_PORT_NAME, fetcher_port),
                port(RUNTIME_PORT_NAME, RUNTIME_PORT),
            ]),
            selector: Some(BTreeMap::from([
                (LABEL_FUNCTION_NAME.to_string(), function_name),
                (
                    LABEL_FUNCTION_UID.to_string(),
                    function.uid().unwrap_or_default(),
                ),
            ])),
            ..Default::default()
        }),
        status: None,
    };
    match cluster.services.create(namespace, &service).await {
        Ok(_) => info!(service = %name, namespace, "created mesh service for function"),
        Err(ClusterError::AlreadyExists(_)) => {}
        Err(err) => return Err(err.into()),
    }
    Ok(name)
}

struct ChooseRequest {
    env: Arc<Environment>,
    function: Arc<Function>,
    deadline: Instant,
    reply: oneshot::Sender<ExecutorResult<Pod>>,
}

/// Serves choose requests of one pool one at a time, so two functions never
/// race for the same pod.
struct PodChooser {
    ctx: Arc<PoolContext>,
    namespace: String,
    deployment_name: String,
}

impl PodChooser {
    async fn run(self, mut requests: mpsc::Receiver<ChooseRequest>, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = requests.recv() => request,
            };
            let Some(request) = request else {
                break;
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ExecutorError::Transient(format!(
                    "pool {} is shutting down", self.deployment_name
                ))),
                result = self.choose_pod(&request) => result,
            };
            let _ = request.reply.send(result);
        }
        debug!(pool = %self.deployment_name, "pod chooser stopped");
    }

    async fn choose_pod(&self, request: &ChooseRequest) -> ExecutorResult<Pod> {
        let selector = pool_selector(&request.env);
        let target_labels = specialized_pod_labels(&request.env, &request.function);
        let shared = request.env.spec.allowed_functions_per_container.is_infinite();
        let mut attempt = 0;

        loop {
            let candidate = self
                .ctx
                .cluster
                .pods
                .list(Some(&self.namespace), &selector)
                .await?
                .into_iter()
                .filter(is_pod_ready)
                .sorted_by_key(|pod| pod.name_any())
                .next();

            if let Some(pod) = candidate {
                if shared {
                    return Ok(pod);
                }
                match self.relabel(&pod, &target_labels).await {
                    Ok(pod) => return Ok(pod),
                    Err(err) => warn!(
                        pod = %pod.name_any(),
                        pool = %self.deployment_name,
                        error = %err,
                        "failed to claim pod, retrying"
                    ),
                }
            }

            let now = Instant::now();
            if now >= request.deadline {
                return Err(self.readiness_timeout(&selector).await);
            }
            let delay = CHOOSE_BACKOFF
                .delay_for_attempt(attempt)
                .min(request.deadline - now);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// Moves the pod out of the pool and stamps it with our instance id.
    async fn relabel(&self, pod: &Pod, target: &BTreeMap<String, String>) -> ExecutorResult<Pod> {
        let name = pod.name_any();
        let patch = json!({
            "metadata": {
                "labels": target,
                "annotations": { ANNOTATION_EXECUTOR_INSTANCE_ID: self.ctx.instance_id },
            }
        });
        let patched = self
            .ctx
            .cluster
            .pods
            .patch(&self.namespace, &name, &patch)
            .await?;
        let stamped = patched
            .annotations()
            .get(ANNOTATION_EXECUTOR_INSTANCE_ID)
            .is_some_and(|id| *id == self.ctx.instance_id);
        if !stamped || !labels_match(Some(patched.labels()), target) {
            return Err(ExecutorError::Conflict(format!(
                "pod {name} did not keep the function labels"
            )));
        }
        Ok(patched)
    }

    async fn readiness_timeout(&self, selector: &BTreeMap<String, String>) -> ExecutorError {
        let pods = self
            .ctx
            .cluster
            .pods
            .list(Some(&self.namespace), selector)
            .await
            .unwrap_or_default();
        let waiting = pods.iter().find_map(|pod| {
            pod.status
                .as_ref()?
                .container_statuses
                .as_ref()?
                .iter()
                .filter(|c| !c.ready)
                .find_map(|c| {
                    let waiting = c.state.as_ref()?.waiting.as_ref()?;
                    Some(format!(
                        "container {} is waiting: {} ({})",
                        c.name,
                        waiting.reason.as_deref().unwrap_or("unknown"),
                        waiting.message.as_deref().unwrap_or_default()
                    ))
                })
        });
        match waiting {
            Some(detail) => ExecutorError::timeout(format!(
                "waiting for a ready pod in pool {}: {detail}",
                self.deployment_name
            )),
            None => ExecutorError::timeout(format!(
                "waited too long for a ready pod in pool {}",
                self.deployment_name
            )),
        }
    }
}

pub struct GenericPool {
    ctx: Arc<PoolContext>,
    env: RwLock<Arc<Environment>>,
    namespace: String,
    deployment_name: String,
    chooser: mpsc::Sender<ChooseRequest>,
    cancel: CancellationToken,
}

impl GenericPool {
    /// Creates or adopts the pool deployment for `env` in `namespace` and
    /// starts the pod chooser.
    pub async fn create(
        ctx: Arc<PoolContext>,
        env: Arc<Environment>,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> ExecutorResult<Self> {
        let deployment_name = pool_deployment_name(&env);
        let desired = pool_deployment(
            &env,
            namespace,
            &deployment_name,
            &ctx.config,
            &ctx.fetcher_config,
            &ctx.instance_id,
        )?;
        let (_, claim) = create_or_adopt(
            ctx.cluster.deployments.as_ref(),
            namespace,
            &desired,
            &ctx.instance_id,
        )
        .await?;
        info!(
            pool = %deployment_name,
            namespace,
            environment = %env.name_any(),
            claim = ?claim,
            "pool deployment ready"
        );

        let (chooser, requests) = mpsc::channel(128);
        let cancel = cancel.child_token();
        let worker = PodChooser {
            ctx: ctx.clone(),
            namespace: namespace.to_string(),
            deployment_name: deployment_name.clone(),
        };
        tokio::spawn(worker.run(requests, cancel.clone()));

        Ok(Self {
            ctx,
            env: RwLock::new(env),
            namespace: namespace.to_string(),
            deployment_name,
            chooser,
            cancel,
        })
    }

    pub fn env(&self) -> Arc<Environment> {
        match self.env.read() {
            Ok(env) => env.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_env(&self, env: Arc<Environment>) {
        match self.env.write() {
            Ok(mut current) => *current = env,
            Err(poisoned) => *poisoned.into_inner() = env,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn deployment_name(&self) -> &str {
        &self.deployment_name
    }

    /// Chooses a pod, specializes it for `function` and records it in the
    /// cache. Bounded by the pod readiness timeout.
    pub async fn get_func_svc(&self, function: Arc<Function>) -> ExecutorResult<FuncSvc> {
        let env = self.env();
        let timeout = self.ctx.config.pod_ready_timeout;
        let deadline = Instant::now() + timeout;
        let shared = env.spec.allowed_functions_per_container.is_infinite();
        let function_name = function.name_any();
        let function_namespace = function.namespace().unwrap_or_default();

        let (reply, response) = oneshot::channel();
        self.chooser
            .send(ChooseRequest {
                env: env.clone(),
                function: function.clone(),
                deadline,
                reply,
            })
            .await
            .map_err(|_| self.stopped())?;
        let pod = response.await.map_err(|_| self.stopped())??;
        let pod_name = pod.name_any();
        info!(
            function_name,
            function_namespace,
            pod = %pod_name,
            pool = %self.deployment_name,
            "chose pod for function"
        );

        let remaining = deadline.saturating_duration_since(Instant::now());
        let svc_host =
            match tokio::time::timeout(remaining, self.specialize_pod(&pod, &function, &env)).await
            {
                Ok(Ok(host)) => host,
                Ok(Err(err)) => {
                    error!(
                        function_name,
                        function_namespace,
                        pod = %pod_name,
                        phase = "specialize",
                        error = %err,
                        "failed to specialize pod"
                    );
                    if !shared {
                        self.schedule_delete_pod(&pod_name);
                    }
                    return Err(err);
                }
                Err(_) => {
                    if !shared {
                        self.schedule_delete_pod(&pod_name);
                    }
                    return Err(ExecutorError::timeout(format!(
                        "specializing pod {pod_name} for function {function_namespace}/{function_name} took longer than {timeout:?}"
                    )));
                }
            };

        let annotations = json!({
            "metadata": {
                "annotations": {
                    ANNOTATION_SVC_HOST: svc_host,
                    ANNOTATION_FUNCTION_RESOURCE_VERSION: function.resource_version().unwrap_or_default(),
                    ANNOTATION_FUNCTION_GENERATION: function.metadata.generation.unwrap_or_default().to_string(),
                }
            }
        });
        let pod = match self
            .ctx
            .cluster
            .pods
            .patch(&self.namespace, &pod_name, &annotations)
            .await
        {
            Ok(patched) => patched,
            Err(err) => {
                warn!(pod = %pod_name, error = %err, "failed to annotate specialized pod");
                pod
            }
        };

        let fsvc = FuncSvcBuilder::default()
            .name(pod_name.clone())
            .function(FunctionMeta::from_function(&function))
            .environment(EnvironmentMeta::from_environment(&env))
            .address(svc_host)
            .kube_objects(vec![ObjectRef::from_meta(ObjectKind::Pod, &pod.metadata)])
            .executor(ExecutorType::Poolmgr)
            .requests_per_pod(function.spec.request_slots())
            .build()?;
        match self.ctx.cache.add(fsvc.clone()).await? {
            AddResult::Inserted(entry) => Ok(entry),
            AddResult::NameExists(existing) => {
                if existing.address != fsvc.address {
                    debug!(pod = %pod_name, winner = %existing.address, "function already served elsewhere");
                    self.schedule_delete_pod(&pod_name);
                }
                Ok(existing)
            }
        }
    }

    /// Loads the function into the chosen pod. Returns the address the
    /// function is served at.
    async fn specialize_pod(
        &self,
        pod: &Pod,
        function: &Function,
        env: &Environment,
    ) -> ExecutorResult<String> {
        let ip = pod_ip(pod)
            .ok_or_else(|| ExecutorError::Internal(anyhow::anyhow!("pod {} has no IP", pod.name_any())))?;

        for config_map in &function.spec.configmaps {
            if self
                .ctx
                .cluster
                .config_maps
                .get_opt(&self.namespace, &config_map.name)
                .await?
                .is_none()
            {
                return Err(ExecutorError::invalid(format!(
                    "configmap {} must be in namespace {}",
                    config_map.name, self.namespace
                )));
            }
        }
        for secret in &function.spec.secrets {
            if self
                .ctx
                .cluster
                .secrets
                .get_opt(&self.namespace, &secret.name)
                .await?
                .is_none()
            {
                return Err(ExecutorError::invalid(format!(
                    "secret {} must be in namespace {}",
                    secret.name, self.namespace
                )));
            }
        }

        let host = if self.ctx.config.enable_istio {
            let service = ensure_istio_service(
                &self.ctx.cluster,
                function,
                &self.namespace,
                self.ctx.fetcher_config.port(),
            )
            .await?;
            format!("{service}.{}", self.namespace)
        } else {
            ip.to_string()
        };

        let request = self.ctx.fetcher_config.new_specialize_request(function, env);
        let fetcher = if self.ctx.config.enable_istio {
            format!("http://{host}:{}", self.ctx.fetcher_config.port())
        } else {
            fetcher_url(ip, self.ctx.fetcher_config.port())
        };
        self.ctx.fetcher.specialize(&fetcher, &request).await?;
        Ok(format!("{host}:{RUNTIME_PORT}"))
    }

    /// Deletes the pod after the configured delay so its logs can still be
    /// read. Runs detached and is never cancelled.
    pub fn schedule_delete_pod(&self, name: &str) {
        let pods = self.ctx.cluster.pods.clone();
        let namespace = self.namespace.clone();
        let name = name.to_string();
        let delay = self.ctx.config.specialize_failure_delete_delay;
        info!(pod = %name, delay_secs = delay.as_secs(), "scheduling pod deletion");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match delete_ignore_missing(pods.as_ref(), &namespace, &name, Propagation::Background).await {
                Ok(()) => info!(pod = %name, namespace, "deleted pod"),
                Err(err) => error!(pod = %name, namespace, error = %err, "failed to delete pod"),
            }
        });
    }

    /// Rolls the pool onto a changed environment. The deployment keeps its
    /// name; its spec is regenerated.
    pub async fn update_deployment(&self, env: Arc<Environment>) -> ExecutorResult<()> {
        if self.env().resource_version() == env.resource_version() {
            return Ok(());
        }
        let desired = pool_deployment(
            &env,
            &self.namespace,
            &self.deployment_name,
            &self.ctx.config,
            &self.ctx.fetcher_config,
            &self.ctx.instance_id,
        )?;
        let deployments = self.ctx.cluster.deployments.as_ref();
        let (namespace, name, desired) = (self.namespace.as_str(), self.deployment_name.as_str(), &desired);
        retry_on_conflict(&format!("pool deployment {name}"), move || async move {
            let mut current = deployments.get(namespace, name).await?;
            current.metadata.labels = desired.metadata.labels.clone();
            current.metadata.annotations = desired.metadata.annotations.clone();
            current.spec = desired.spec.clone();
            deployments.replace(namespace, &current).await
        })
        .await?;
        info!(
            pool = %self.deployment_name,
            environment = %env.name_any(),
            resource_version = ?env.resource_version(),
            "updated pool deployment"
        );
        self.set_env(env);
        Ok(())
    }

    /// Stops the chooser and deletes the pool deployment. Specialized pods
    /// left the deployment's selector and are cleaned up separately.
    pub async fn destroy(&self) -> ExecutorResult<()> {
        self.cancel.cancel();
        delete_ignore_missing(
            self.ctx.cluster.deployments.as_ref(),
            &self.namespace,
            &self.deployment_name,
            Propagation::Background,
        )
        .await?;
        info!(pool = %self.deployment_name, namespace = %self.namespace, "destroyed pool");
        Ok(())
    }

    fn stopped(&self) -> ExecutorError {
        ExecutorError::Transient(format!("pool {} is not running", self.deployment_name))
    }
}

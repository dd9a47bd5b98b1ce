//! New-deploy strategy: one deployment, service and autoscaler per
//! function, specialized at pod start.

pub mod handlers;
pub mod objects;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::{
    crd::{Environment, Function, DEFAULT_SPECIALIZATION_TIMEOUT_SECS},
    EnvironmentMeta,
    ExecutorType,
    FuncSvc,
    FuncSvcBuilder,
    FunctionKey,
    FunctionMeta,
    ObjectKind,
    ObjectRef,
};
use executor_utils::retry::poll_until_deadline;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::Service,
};
use kube::ResourceExt;
use objects::{autoscaler, deployment, min_replicas, object_name, resource_version_count, service};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{
        create_or_adopt,
        delete_ignore_missing,
        informer::Store,
        retry_on_conflict,
        Claim,
        Cluster,
        ClusterResult,
        Propagation,
    },
    config::ServerConfig,
    error::{ExecutorError, ExecutorResult},
    executor::ExecutorStrategy,
    fetcher::FetcherConfig,
    fscache::{AddResult, FunctionServiceCache},
    rbac::setup_fetcher_access,
    reaper::cleanup_orphans,
    throttler::Throttler,
};

pub struct NewDeployManager {
    cluster: Cluster,
    config: Arc<ServerConfig>,
    fetcher_config: FetcherConfig,
    cache: FunctionServiceCache,
    throttler: Arc<Throttler>,
    instance_id: String,
    functions: Arc<Store<Function>>,
    environments: Arc<Store<Environment>>,
    deployments: Arc<Store<Deployment>>,
    services: Arc<Store<Service>>,
}

/// Informer stores the manager reads from.
pub struct NewDeployStores {
    pub functions: Arc<Store<Function>>,
    pub environments: Arc<Store<Environment>>,
    pub deployments: Arc<Store<Deployment>>,
    pub services: Arc<Store<Service>>,
}

fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or_default()
}

fn spec_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1)
}

impl NewDeployManager {
    pub fn new(
        cluster: Cluster,
        config: Arc<ServerConfig>,
        cache: FunctionServiceCache,
        throttler: Arc<Throttler>,
        instance_id: String,
        stores: NewDeployStores,
    ) -> Self {
        Self {
            cluster,
            fetcher_config: FetcherConfig::new(&config),
            config,
            cache,
            throttler,
            instance_id,
            functions: stores.functions,
            environments: stores.environments,
            deployments: stores.deployments,
            services: stores.services,
        }
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// Namespace the function's objects live in.
    pub fn object_namespace(&self, function: &Function) -> String {
        self.config
            .resolve_function_namespace(&function.namespace().unwrap_or_default())
    }

    async fn resolve_environment(&self, function: &Function) -> ExecutorResult<Arc<Environment>> {
        let env_ref = &function.spec.environment;
        let namespace = if env_ref.namespace.is_empty() {
            function.namespace().unwrap_or_default()
        } else {
            env_ref.namespace.clone()
        };
        if let Some(env) = self.environments.get(&namespace, &env_ref.name) {
            return Ok(env);
        }
        Ok(Arc::new(
            self.cluster.environments.get(&namespace, &env_ref.name).await?,
        ))
    }

    /// Creates or adopts the function's objects, waits for the deployment
    /// to become available and records the service in the cache.
    pub async fn fn_create(&self, function: &Function) -> ExecutorResult<FuncSvc> {
        let env = self.resolve_environment(function).await?;
        let namespace = self.object_namespace(function);
        let name = object_name(function);
        setup_fetcher_access(&self.cluster, function, &namespace).await?;

        let objects = match self.create_objects(function, &env, &name, &namespace).await {
            Ok(objects) => objects,
            Err(err) => {
                error!(
                    function_name = %function.name_any(),
                    function_namespace = %function.namespace().unwrap_or_default(),
                    phase = "create",
                    error = %err,
                    "failed to create function objects, cleaning up"
                );
                self.delete_objects(&name, &namespace).await;
                return Err(err);
            }
        };

        let fsvc = FuncSvcBuilder::default()
            .name(name.clone())
            .function(FunctionMeta::from_function(function))
            .environment(EnvironmentMeta::from_environment(&env))
            .address(format!("{name}.{namespace}"))
            .kube_objects(objects)
            .executor(ExecutorType::Newdeploy)
            .build()?;
        match self.cache.add(fsvc).await? {
            AddResult::Inserted(entry) | AddResult::NameExists(entry) => Ok(entry),
        }
    }

    async fn create_objects(
        &self,
        function: &Function,
        env: &Environment,
        name: &str,
        namespace: &str,
    ) -> ExecutorResult<Vec<ObjectRef>> {
        let (svc, _) = create_or_adopt(
            self.cluster.services.as_ref(),
            namespace,
            &service(function, env, name, namespace, &self.instance_id),
            &self.instance_id,
        )
        .await?;

        let min = min_replicas(function);
        let current = self.cluster.deployments.get_opt(namespace, name).await?;
        let replicas = current.as_ref().map(spec_replicas).unwrap_or(min).max(min);
        let desired = deployment(
            function,
            env,
            name,
            namespace,
            replicas,
            resource_version_count(&self.cluster, function).await,
            &self.config,
            &self.fetcher_config,
            &self.instance_id,
        )?;
        let (mut deployed, claim) = create_or_adopt(
            self.cluster.deployments.as_ref(),
            namespace,
            &desired,
            &self.instance_id,
        )
        .await?;
        if claim == Claim::Owned && spec_replicas(&deployed) < min {
            deployed = self.scale(namespace, name, min).await?;
        }
        debug!(deployment = %name, namespace, claim = ?claim, "function deployment in place");

        let deployed = self.wait_available(function, &deployed, min).await?;

        let (hpa, _) = create_or_adopt(
            self.cluster.hpas.as_ref(),
            namespace,
            &autoscaler(function, env, name, namespace, &self.instance_id),
            &self.instance_id,
        )
        .await?;

        Ok(vec![
            ObjectRef::from_meta(ObjectKind::Deployment, &deployed.metadata),
            ObjectRef::from_meta(ObjectKind::Service, &svc.metadata),
            ObjectRef::from_meta(ObjectKind::HorizontalPodAutoscaler, &hpa.metadata),
        ])
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> ClusterResult<Deployment> {
        let patch = json!({ "spec": { "replicas": replicas } });
        let scaled = self.cluster.deployments.patch(namespace, name, &patch).await?;
        info!(deployment = %name, namespace, replicas, "scaled function deployment");
        Ok(scaled)
    }

    async fn wait_available(
        &self,
        function: &Function,
        deployment: &Deployment,
        min: i32,
    ) -> ExecutorResult<Deployment> {
        if available_replicas(deployment) >= min {
            return Ok(deployment.clone());
        }
        let timeout_secs = function
            .spec
            .strategy()
            .specialization_timeout
            .max(DEFAULT_SPECIALIZATION_TIMEOUT_SECS);
        let timeout = Duration::from_secs(timeout_secs as u64);
        let namespace = deployment.namespace().unwrap_or_default();
        let name = deployment.name_any();
        let deployments = self.cluster.deployments.as_ref();
        let (ns, n) = (namespace.as_str(), name.as_str());
        let ready = poll_until_deadline(
            Instant::now() + timeout,
            self.config.deployment_poll_interval,
            "function deployment availability",
            move || async move {
                let current = deployments.get(ns, n).await?;
                Ok::<_, ExecutorError>((available_replicas(&current) >= min).then_some(current))
            },
        )
        .await?;
        ready.ok_or_else(|| {
            ExecutorError::timeout(format!(
                "waiting for deployment {namespace}/{name} to have {min} available replicas after {timeout:?}"
            ))
        })
    }

    /// Deletes the function's objects by name. Missing objects are fine.
    async fn delete_objects(&self, name: &str, namespace: &str) {
        if let Err(err) =
            delete_ignore_missing(self.cluster.hpas.as_ref(), namespace, name, Propagation::Background).await
        {
            error!(autoscaler = %name, namespace, error = %err, "failed to delete autoscaler");
        }
        if let Err(err) =
            delete_ignore_missing(self.cluster.services.as_ref(), namespace, name, Propagation::Background)
                .await
        {
            error!(service = %name, namespace, error = %err, "failed to delete service");
        }
        if let Err(err) = delete_ignore_missing(
            self.cluster.deployments.as_ref(),
            namespace,
            name,
            Propagation::Background,
        )
        .await
        {
            error!(deployment = %name, namespace, error = %err, "failed to delete deployment");
        }
    }

    /// Drops the cache entry and deletes the function's objects.
    pub async fn fn_delete(&self, function: &Function) -> ExecutorResult<()> {
        let dropped = self
            .cache
            .delete_by_function_uid(&function.uid().unwrap_or_default())
            .await?;
        self.delete_objects(&object_name(function), &self.object_namespace(function))
            .await;
        info!(
            function_name = %function.name_any(),
            function_namespace = %function.namespace().unwrap_or_default(),
            dropped = dropped.len(),
            "deleted function objects"
        );
        Ok(())
    }

    /// Reconciles the function's objects with a changed function.
    pub async fn update_function(&self, old: &Function, new: &Function) -> ExecutorResult<()> {
        if old.metadata.generation == new.metadata.generation {
            return Ok(());
        }
        let was_newdeploy = old.spec.executor_type() == ExecutorType::Newdeploy;
        let is_newdeploy = new.spec.executor_type() == ExecutorType::Newdeploy;
        match (was_newdeploy, is_newdeploy) {
            (false, false) => return Ok(()),
            (true, false) => return self.fn_delete(old).await,
            (false, true) => {
                let key = FunctionKey::for_function(new).to_string();
                return self
                    .throttler
                    .run_once_strict(&key, || self.fn_create(new))
                    .await
                    .map(|_| ());
            }
            (true, true) => {}
        }

        let (old_strategy, new_strategy) = (old.spec.strategy(), new.spec.strategy());
        if old_strategy.min_scale != new_strategy.min_scale
            || old_strategy.max_scale != new_strategy.max_scale
            || old_strategy.target_cpu_percent != new_strategy.target_cpu_percent
        {
            self.update_scaling(new).await?;
        }

        let (old_spec, new_spec) = (&old.spec, &new.spec);
        if old_spec.environment != new_spec.environment
            || old_spec.package != new_spec.package
            || old_spec.secrets != new_spec.secrets
            || old_spec.configmaps != new_spec.configmaps
            || old_spec.resources != new_spec.resources
        {
            self.update_deployment(new).await?;
        }
        Ok(())
    }

    async fn update_scaling(&self, function: &Function) -> ExecutorResult<()> {
        let env = self.resolve_environment(function).await?;
        let namespace = self.object_namespace(function);
        let name = object_name(function);
        let desired = autoscaler(function, &env, &name, &namespace, &self.instance_id);
        let hpas = self.cluster.hpas.as_ref();
        let (ns, n, desired) = (namespace.as_str(), name.as_str(), &desired);
        retry_on_conflict(&format!("autoscaler {ns}/{n}"), move || async move {
            let mut current = hpas.get(ns, n).await?;
            current.spec = desired.spec.clone();
            hpas.replace(ns, &current).await
        })
        .await?;

        let min = min_replicas(function);
        if let Some(current) = self.cluster.deployments.get_opt(&namespace, &name).await? {
            if spec_replicas(&current) < min {
                self.scale(&namespace, &name, min).await?;
            }
        }
        Ok(())
    }

    /// Regenerates the deployment spec. Replica count is left as is unless
    /// it is below the minimum.
    pub async fn update_deployment(&self, function: &Function) -> ExecutorResult<()> {
        let env = self.resolve_environment(function).await?;
        let namespace = self.object_namespace(function);
        let name = object_name(function);
        let min = min_replicas(function);
        let count = resource_version_count(&self.cluster, function).await;
        let desired = deployment(
            function,
            &env,
            &name,
            &namespace,
            min,
            count,
            &self.config,
            &self.fetcher_config,
            &self.instance_id,
        )?;
        let deployments = self.cluster.deployments.as_ref();
        let (ns, n, desired) = (namespace.as_str(), name.as_str(), &desired);
        retry_on_conflict(&format!("deployment {ns}/{n}"), move || async move {
            let mut current = deployments.get(ns, n).await?;
            let replicas = spec_replicas(&current).max(min);
            current.metadata.labels = desired.metadata.labels.clone();
            current.metadata.annotations = desired.metadata.annotations.clone();
            current.spec = desired.spec.clone();
            if let Some(spec) = current.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
            deployments.replace(ns, &current).await
        })
        .await?;
        info!(deployment = %name, namespace, resource_version_count = count, "updated function deployment");
        Ok(())
    }

    /// Scales idle functions down to their minimum. Entries are kept.
    pub async fn reap_idle_once(&self) -> ExecutorResult<usize> {
        let now = Instant::now();
        let mut scaled = 0;
        for entry in self.cache.list_all().await? {
            if entry.executor != ExecutorType::Newdeploy
                || entry.environment.functions_per_container.is_infinite()
            {
                continue;
            }
            let Some(function) = self
                .functions
                .get(&entry.function.namespace, &entry.function.name)
            else {
                continue;
            };
            if function.spec.once_only {
                continue;
            }
            let idle_timeout = function
                .spec
                .idle_timeout
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(secs as u64))
                .unwrap_or(self.config.default_idle_timeout);
            if entry.idle_for(now) < idle_timeout {
                continue;
            }
            if self
                .environments
                .get(&entry.environment.namespace, &entry.environment.name)
                .is_none()
            {
                warn!(
                    function_name = %entry.function.name,
                    environment = %entry.environment.name,
                    "environment of idle function is gone, scaling down anyway"
                );
            }
            let min_scale = function.spec.strategy().min_scale.max(0);
            for obj in entry.kube_objects.iter().filter(|o| o.kind == ObjectKind::Deployment) {
                let current = match self.cluster.deployments.get_opt(&obj.namespace, &obj.name).await {
                    Ok(Some(current)) => current,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(deployment = %obj.name, namespace = %obj.namespace, error = %err, "failed to read idle function deployment");
                        continue;
                    }
                };
                if spec_replicas(&current) <= min_scale {
                    continue;
                }
                match self.scale(&obj.namespace, &obj.name, min_scale).await {
                    Ok(_) => scaled += 1,
                    Err(err) => {
                        warn!(deployment = %obj.name, namespace = %obj.namespace, error = %err, "failed to scale down idle function");
                    }
                }
            }
        }
        Ok(scaled)
    }

    async fn idle_reaper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.object_reaper_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.reap_idle_once().await {
                        warn!(error = %err, "new-deploy idle reaper failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ExecutorStrategy for NewDeployManager {
    fn executor_type(&self) -> ExecutorType {
        ExecutorType::Newdeploy
    }

    async fn get_func_svc(&self, function: Arc<Function>) -> ExecutorResult<FuncSvc> {
        self.fn_create(&function).await
    }

    async fn is_valid(&self, fsvc: &FuncSvc) -> bool {
        let mut has_service = false;
        let mut has_deployment = false;
        for obj in &fsvc.kube_objects {
            match obj.kind {
                ObjectKind::Service => {
                    has_service = self.services.get(&obj.namespace, &obj.name).is_some();
                }
                ObjectKind::Deployment => {
                    has_deployment = self
                        .deployments
                        .get(&obj.namespace, &obj.name)
                        .is_some_and(|d| available_replicas(&d) >= 1);
                }
                _ => {}
            }
        }
        has_service && has_deployment
    }

    async fn delete_func_svc(&self, fsvc: &FuncSvc) -> ExecutorResult<()> {
        self.cache.delete_entry(fsvc).await
    }

    async fn tap(&self, address: &str) -> ExecutorResult<()> {
        self.cache.touch_by_address(address).await
    }

    async fn release(&self, _address: &str) -> ExecutorResult<()> {
        Ok(())
    }

    async fn adopt_existing_resources(&self) -> ExecutorResult<()> {
        let functions: Vec<Arc<Function>> = self
            .functions
            .list()
            .into_iter()
            .filter(|f| f.spec.executor_type() == ExecutorType::Newdeploy)
            .collect();
        let mut adopted = 0;
        for function in functions {
            let key = FunctionKey::for_function(&function).to_string();
            match self
                .throttler
                .run_once_strict(&key, || self.fn_create(&function))
                .await
            {
                Ok(_) => adopted += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(
                    function_name = %function.name_any(),
                    function_namespace = %function.namespace().unwrap_or_default(),
                    error = %err,
                    "failed to adopt function objects"
                ),
            }
        }
        info!(adopted, "adopted new-deploy functions");
        Ok(())
    }

    async fn cleanup_old_executor_objects(&self) -> ExecutorResult<()> {
        let id = &self.instance_id;
        let services = cleanup_orphans(self.cluster.services.as_ref(), ExecutorType::Newdeploy, id).await?;
        let hpas = cleanup_orphans(self.cluster.hpas.as_ref(), ExecutorType::Newdeploy, id).await?;
        let deployments =
            cleanup_orphans(self.cluster.deployments.as_ref(), ExecutorType::Newdeploy, id).await?;
        info!(services, hpas, deployments, "cleaned up new-deploy objects of earlier executors");
        Ok(())
    }

    async fn refresh_function(&self, function: &Function) -> ExecutorResult<()> {
        self.update_deployment(function).await
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.idle_reaper(cancel).await;
        debug!("new-deploy manager stopped");
    }
}

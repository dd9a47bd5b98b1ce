//! Pool strategy: per-environment pools of generic pods that are
//! specialized for a function on first use.

pub mod controller;
pub mod deployment;
pub mod handlers;
pub mod pool;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
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
    LABEL_ENVIRONMENT_NAME,
    LABEL_ENVIRONMENT_NAMESPACE,
    LABEL_EXECUTOR_TYPE,
    LABEL_FUNCTION_NAME,
    LABEL_FUNCTION_NAMESPACE,
    LABEL_FUNCTION_UID,
    LABEL_MANAGED,
};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use pool::{is_pod_ready, pod_ip, GenericPool};
use serde_json::json;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{delete_ignore_missing, informer::Store, labels, Cluster, Propagation},
    config::ServerConfig,
    error::{ExecutorError, ExecutorResult},
    executor::ExecutorStrategy,
    fetcher::{FetcherClient, FetcherConfig},
    fscache::{AddResult, FunctionServiceCache},
    reaper::{cleanup_kube_objects, cleanup_orphans},
};

/// Everything a pool needs from the process around it.
pub struct PoolContext {
    pub cluster: Cluster,
    pub config: Arc<ServerConfig>,
    pub fetcher_config: FetcherConfig,
    pub fetcher: FetcherClient,
    pub cache: FunctionServiceCache,
    pub instance_id: String,
    pub pods: Arc<Store<Pod>>,
}

pub struct GenericPoolManager {
    ctx: Arc<PoolContext>,
    pools: Mutex<HashMap<String, Arc<OnceCell<Arc<GenericPool>>>>>,
    functions: Arc<Store<Function>>,
    environments: Arc<Store<Environment>>,
    cancel: CancellationToken,
}

impl GenericPoolManager {
    pub fn new(
        ctx: PoolContext,
        functions: Arc<Store<Function>>,
        environments: Arc<Store<Environment>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            pools: Mutex::new(HashMap::new()),
            functions,
            environments,
            cancel,
        }
    }

    pub fn context(&self) -> &PoolContext {
        &self.ctx
    }

    pub fn functions(&self) -> &Store<Function> {
        &self.functions
    }

    pub fn environments(&self) -> &Store<Environment> {
        &self.environments
    }

    /// Namespace the pool of `env` runs in.
    pub fn pool_namespace(&self, env: &Environment) -> String {
        self.ctx
            .config
            .resolve_function_namespace(&env.namespace().unwrap_or_default())
    }

    /// Returns the pool of `env`, creating or adopting its deployment on
    /// first use. The flag tells whether the pool was created by this call.
    /// Concurrent callers for one environment share one creation, which
    /// runs outside the map lock.
    pub async fn get_pool(&self, env: Arc<Environment>) -> ExecutorResult<(Arc<GenericPool>, bool)> {
        let uid = env.uid().unwrap_or_default();
        let cell = self.pools.lock().await.entry(uid.clone()).or_default().clone();
        let mut created = false;
        let pool = cell
            .get_or_try_init(|| {
                created = true;
                let ctx = self.ctx.clone();
                let namespace = self.pool_namespace(&env);
                let cancel = self.cancel.clone();
                async move { GenericPool::create(ctx, env, &namespace, &cancel).await.map(Arc::new) }
            })
            .await?
            .clone();
        if created {
            let tracked = self
                .pools
                .lock()
                .await
                .get(&uid)
                .is_some_and(|current| Arc::ptr_eq(current, &cell));
            if !tracked {
                pool.destroy().await?;
                return Err(ExecutorError::not_found(format!(
                    "pool of environment {uid} was removed while it was being created"
                )));
            }
        }
        Ok((pool, created))
    }

    /// Tears down the pool of the environment with `env_uid`, if any.
    pub async fn cleanup_pool(&self, env_uid: &str) -> ExecutorResult<()> {
        let cell = self.pools.lock().await.remove(env_uid);
        if let Some(pool) = cell.as_ref().and_then(|cell| cell.get()) {
            pool.destroy().await?;
        }
        Ok(())
    }

    pub async fn has_pool(&self, env_uid: &str) -> bool {
        self.pools
            .lock()
            .await
            .get(env_uid)
            .is_some_and(|cell| cell.initialized())
    }

    /// The function's environment, from the informer store or the API.
    pub async fn resolve_environment(&self, function: &Function) -> ExecutorResult<Arc<Environment>> {
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
            self.ctx.cluster.environments.get(&namespace, &env_ref.name).await?,
        ))
    }

    /// Deletes the specialized pods of the function with `uid`.
    pub async fn delete_function_pods(&self, uid: &str) -> ExecutorResult<usize> {
        let selector = labels([
            (LABEL_EXECUTOR_TYPE, ExecutorType::Poolmgr.as_ref()),
            (LABEL_FUNCTION_UID, uid),
        ]);
        let pods = self.ctx.cluster.pods.list(None, &selector).await?;
        let mut deleted = 0;
        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            match delete_ignore_missing(
                self.ctx.cluster.pods.as_ref(),
                &namespace,
                &name,
                Propagation::Background,
            )
            .await
            {
                Ok(()) => deleted += 1,
                Err(err) => error!(pod = %name, namespace, error = %err, "failed to delete function pod"),
            }
        }
        Ok(deleted)
    }

    /// Removes idle entries and deletes their pods.
    pub async fn reap_idle_once(&self) -> ExecutorResult<usize> {
        let now = tokio::time::Instant::now();
        let mut reaped = 0;
        for entry in self.ctx.cache.list_all().await? {
            if entry.executor != ExecutorType::Poolmgr
                || entry.environment.functions_per_container.is_infinite()
            {
                continue;
            }
            let idle_timeout = self
                .functions
                .get(&entry.function.namespace, &entry.function.name)
                .and_then(|function| function.spec.idle_timeout)
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(secs as u64))
                .unwrap_or(self.ctx.config.default_idle_timeout);
            if entry.idle_for(now) < idle_timeout {
                continue;
            }
            if self.ctx.cache.delete_old(&entry, idle_timeout).await? {
                info!(
                    function_name = %entry.function.name,
                    function_namespace = %entry.function.namespace,
                    address = %entry.address,
                    idle_secs = entry.idle_for(now).as_secs(),
                    "reaping idle function pod"
                );
                cleanup_kube_objects(&self.ctx.cluster, &entry.kube_objects).await;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn idle_reaper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.poolmgr_object_reaper_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.reap_idle_once().await {
                        warn!(error = %err, "pool idle reaper failed");
                    }
                }
            }
        }
    }

    /// Creates pools for every environment that should have one.
    pub async fn create_pools_once(&self) {
        for env in self.environments.list() {
            if env.spec.pool_size() <= 0 {
                continue;
            }
            let uid = env.uid().unwrap_or_default();
            if self.has_pool(&uid).await {
                continue;
            }
            if let Err(err) = self.get_pool(env.clone()).await {
                warn!(environment = %env.name_any(), error = %err, "failed to create pool eagerly");
            }
        }
    }

    async fn eager_pool_creator(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.eager_pool_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.create_pools_once().await,
            }
        }
    }

    /// Deletes a specialized pod no cache entry can be rebuilt from. Nothing
    /// would route to it or reap it otherwise.
    async fn discard_unadoptable_pod(&self, namespace: &str, name: &str) {
        match delete_ignore_missing(self.ctx.cluster.pods.as_ref(), namespace, name, Propagation::Background).await
        {
            Ok(()) => info!(pod = %name, namespace, "deleted specialized pod that could not be adopted"),
            Err(err) => error!(pod = %name, namespace, error = %err, "failed to delete unadoptable pod"),
        }
    }

    /// Rebuilds a cache entry from a pod specialized by an earlier process.
    /// Returns `None` when the pod is missing its function labels, its
    /// environment is gone or another pod already serves the function.
    async fn adopt_specialized_pod(&self, pod: &Pod) -> ExecutorResult<Option<FuncSvc>> {
        let labels = pod.labels();
        let annotations = pod.annotations();
        let (Some(function_name), Some(function_namespace), Some(function_uid), Some(svc_host)) = (
            labels.get(LABEL_FUNCTION_NAME),
            labels.get(LABEL_FUNCTION_NAMESPACE),
            labels.get(LABEL_FUNCTION_UID),
            annotations.get(ANNOTATION_SVC_HOST),
        ) else {
            return Ok(None);
        };
        let (Some(env_name), Some(env_namespace)) = (
            labels.get(LABEL_ENVIRONMENT_NAME),
            labels.get(LABEL_ENVIRONMENT_NAMESPACE),
        ) else {
            return Ok(None);
        };
        let Some(env) = self.environments.get(env_namespace, env_name) else {
            debug!(pod = %pod.name_any(), environment = %env_name, "environment of specialized pod is gone");
            return Ok(None);
        };

        let live = self.functions.get(function_namespace, function_name);
        let generation = annotations
            .get(ANNOTATION_FUNCTION_GENERATION)
            .and_then(|generation| generation.parse::<i64>().ok())
            .or_else(|| live.as_ref().and_then(|f| f.metadata.generation))
            .unwrap_or_default();
        let requests_per_pod = live.as_ref().map(|f| f.spec.request_slots()).unwrap_or_default();

        let fsvc = FuncSvcBuilder::default()
            .name(pod.name_any())
            .function(FunctionMeta {
                name: function_name.clone(),
                namespace: function_namespace.clone(),
                uid: function_uid.clone(),
                generation,
                resource_version: annotations
                    .get(ANNOTATION_FUNCTION_RESOURCE_VERSION)
                    .cloned()
                    .unwrap_or_default(),
            })
            .environment(EnvironmentMeta::from_environment(&env))
            .address(svc_host.clone())
            .kube_objects(vec![ObjectRef::from_meta(ObjectKind::Pod, &pod.metadata)])
            .executor(ExecutorType::Poolmgr)
            .requests_per_pod(requests_per_pod)
            .build()?;
        match self.ctx.cache.add(fsvc).await? {
            AddResult::Inserted(entry) => {
                info!(
                    function_name = %entry.function.name,
                    function_namespace = %entry.function.namespace,
                    address = %entry.address,
                    "adopted specialized pod"
                );
                Ok(Some(entry))
            }
            AddResult::NameExists(_) => Ok(None),
        }
    }

    async fn validate_pod(&self, fsvc: &FuncSvc) -> ExecutorResult<bool> {
        let Some(obj) = fsvc.kube_objects.iter().find(|obj| obj.kind == ObjectKind::Pod) else {
            return Ok(false);
        };
        let pod = match self.ctx.pods.get(&obj.namespace, &obj.name) {
            Some(pod) => pod,
            None => match self.ctx.cluster.pods.get_opt(&obj.namespace, &obj.name).await? {
                Some(pod) => Arc::new(pod),
                None => return Ok(false),
            },
        };
        if !obj.uid.is_empty() && pod.uid().as_deref() != Some(obj.uid.as_str()) {
            return Ok(false);
        }
        if !is_pod_ready(&pod) {
            return Ok(false);
        }
        if self.ctx.config.enable_istio {
            return Ok(true);
        }
        Ok(pod_ip(&pod).is_some_and(|ip| fsvc.address.contains(ip)))
    }
}

#[async_trait]
impl ExecutorStrategy for GenericPoolManager {
    fn executor_type(&self) -> ExecutorType {
        ExecutorType::Poolmgr
    }

    async fn get_func_svc(&self, function: Arc<Function>) -> ExecutorResult<FuncSvc> {
        let env = self.resolve_environment(&function).await?;
        if env.spec.pool_size() <= 0 {
            return Err(ExecutorError::invalid(format!(
                "environment {} has no pool",
                env.name_any()
            )));
        }
        let (pool, created) = self.get_pool(env).await?;
        if created {
            debug!(pool = %pool.deployment_name(), "created pool on demand");
        }
        pool.get_func_svc(function).await
    }

    async fn is_valid(&self, fsvc: &FuncSvc) -> bool {
        match self.validate_pod(fsvc).await {
            Ok(valid) => valid,
            Err(err) => {
                warn!(address = %fsvc.address, error = %err, "failed to validate function pod");
                false
            }
        }
    }

    /// Drops the entry only. The pod is left to the idle reaper and the
    /// replica-set cleanup.
    async fn delete_func_svc(&self, fsvc: &FuncSvc) -> ExecutorResult<()> {
        self.ctx.cache.delete_entry(fsvc).await
    }

    async fn tap(&self, address: &str) -> ExecutorResult<()> {
        self.ctx.cache.touch_by_address(address).await
    }

    async fn release(&self, address: &str) -> ExecutorResult<()> {
        self.ctx.cache.release(address).await
    }

    async fn adopt_existing_resources(&self) -> ExecutorResult<()> {
        for env in self.environments.list() {
            if env.spec.pool_size() <= 0 {
                continue;
            }
            if let Err(err) = self.get_pool(env.clone()).await {
                warn!(environment = %env.name_any(), error = %err, "failed to adopt pool");
            }
        }

        let selector = labels([(LABEL_EXECUTOR_TYPE, ExecutorType::Poolmgr.as_ref())]);
        let pods = self.ctx.cluster.pods.list(None, &selector).await?;
        let mut adopted = 0;
        for pod in pods.iter().filter(|pod| is_pod_ready(pod)) {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            let specialized = pod.labels().get(LABEL_MANAGED).map(String::as_str) == Some("false");
            let entry = if specialized {
                match self.adopt_specialized_pod(pod).await {
                    Ok(Some(entry)) => Some(entry),
                    Ok(None) => {
                        self.discard_unadoptable_pod(&namespace, &name).await;
                        continue;
                    }
                    Err(err) => {
                        warn!(pod = %name, error = %err, "failed to adopt specialized pod");
                        continue;
                    }
                }
            } else {
                None
            };
            let patch = json!({
                "metadata": { "annotations": { ANNOTATION_EXECUTOR_INSTANCE_ID: self.ctx.instance_id } }
            });
            if let Err(err) = self.ctx.cluster.pods.patch(&namespace, &name, &patch).await {
                warn!(pod = %name, namespace, error = %err, "failed to claim pool pod");
                if let Some(entry) = entry {
                    self.ctx.cache.delete_entry(&entry).await?;
                }
                continue;
            }
            if entry.is_some() {
                adopted += 1;
            }
        }
        info!(adopted, "adopted specialized pool pods");
        Ok(())
    }

    async fn cleanup_old_executor_objects(&self) -> ExecutorResult<()> {
        let instance_id = &self.ctx.instance_id;
        let deployments =
            cleanup_orphans(self.ctx.cluster.deployments.as_ref(), ExecutorType::Poolmgr, instance_id).await?;
        let pods = cleanup_orphans(self.ctx.cluster.pods.as_ref(), ExecutorType::Poolmgr, instance_id).await?;
        info!(deployments, pods, "cleaned up pool objects of earlier executors");
        Ok(())
    }

    async fn refresh_function(&self, function: &Function) -> ExecutorResult<()> {
        let uid = function.uid().unwrap_or_default();
        let dropped = self.ctx.cache.delete_by_function_uid(&uid).await?;
        let deleted = self.delete_function_pods(&uid).await?;
        info!(
            function_name = %function.name_any(),
            function_namespace = %function.namespace().unwrap_or_default(),
            dropped = dropped.len(),
            deleted,
            "refreshed function"
        );
        Ok(())
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let reaper = {
            let manager = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.idle_reaper(cancel).await })
        };
        let creator = {
            let manager = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.eager_pool_creator(cancel).await })
        };
        let _ = tokio::join!(reaper, creator);
        debug!("pool manager stopped");
    }
}

//! Function and package event handlers of the pool strategy.

use std::sync::Arc;

use async_trait::async_trait;
use data_model::{
    crd::{Function, Package},
    ExecutorType,
    FunctionKey,
    FunctionMeta,
    FETCHER_SERVICE_ACCOUNT,
};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{
    pool::{ensure_istio_service, istio_service_name},
    GenericPoolManager,
};
use crate::{
    cluster::{delete_ignore_missing, informer::{EventHandler, Store}, Cluster, Propagation},
    config::ServerConfig,
    error::ExecutorResult,
    rbac::{
        ensure_fetcher_service_account,
        setup_fetcher_access,
        setup_role_binding,
        PACKAGE_GETTER_CLUSTER_ROLE,
        PACKAGE_GETTER_ROLE_BINDING,
    },
    reaper::cleanup_kube_objects,
};

pub struct PoolFunctionHandler {
    manager: Arc<GenericPoolManager>,
}

impl PoolFunctionHandler {
    pub fn new(manager: Arc<GenericPoolManager>) -> Self {
        Self { manager }
    }

    /// Namespace the function's pods run in. Falls back to the environment
    /// reference when the environment itself is gone.
    async fn pod_namespace(&self, function: &Function) -> String {
        match self.manager.resolve_environment(function).await {
            Ok(env) => self.manager.pool_namespace(&env),
            Err(_) => {
                let env_ns = &function.spec.environment.namespace;
                let env_ns = if env_ns.is_empty() {
                    function.namespace().unwrap_or_default()
                } else {
                    env_ns.clone()
                };
                self.manager.context().config.resolve_function_namespace(&env_ns)
            }
        }
    }

    async fn provision(&self, function: &Function) -> ExecutorResult<()> {
        let ctx = self.manager.context();
        let namespace = self.pod_namespace(function).await;
        setup_fetcher_access(&ctx.cluster, function, &namespace).await?;
        if ctx.config.enable_istio {
            ensure_istio_service(&ctx.cluster, function, &namespace, ctx.fetcher_config.port()).await?;
        }
        Ok(())
    }

    async fn teardown(&self, function: &Function) -> ExecutorResult<()> {
        let ctx = self.manager.context();
        let uid = function.uid().unwrap_or_default();
        for entry in ctx.cache.delete_by_function_uid(&uid).await? {
            cleanup_kube_objects(&ctx.cluster, &entry.kube_objects).await;
        }
        let deleted = self.manager.delete_function_pods(&uid).await?;
        if ctx.config.enable_istio {
            let namespace = self.pod_namespace(function).await;
            delete_ignore_missing(
                ctx.cluster.services.as_ref(),
                &namespace,
                &istio_service_name(function),
                Propagation::Background,
            )
            .await?;
        }
        info!(
            function_name = %function.name_any(),
            function_namespace = %function.namespace().unwrap_or_default(),
            deleted,
            "cleaned up pool function"
        );
        Ok(())
    }

    /// Drops the pod specialized for the previous generation of a function.
    async fn retire_generation(&self, old: &Function) -> ExecutorResult<()> {
        let ctx = self.manager.context();
        let key = FunctionKey::new(ExecutorType::Poolmgr, &FunctionMeta::from_function(old));
        match ctx.cache.get_by_function(&key).await {
            Ok(entry) => {
                ctx.cache.delete_entry(&entry).await?;
                cleanup_kube_objects(&ctx.cluster, &entry.kube_objects).await;
                debug!(function = %key, address = %entry.address, "retired previous function generation");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl EventHandler<Function> for PoolFunctionHandler {
    async fn on_add(&self, function: Arc<Function>) {
        if function.spec.executor_type() != ExecutorType::Poolmgr {
            return;
        }
        if let Err(err) = self.provision(&function).await {
            error!(
                function_name = %function.name_any(),
                function_namespace = %function.namespace().unwrap_or_default(),
                phase = "provision",
                error = %err,
                "failed to prepare pool function"
            );
        }
    }

    async fn on_update(&self, old: Arc<Function>, new: Arc<Function>) {
        let was_pool = old.spec.executor_type() == ExecutorType::Poolmgr;
        let is_pool = new.spec.executor_type() == ExecutorType::Poolmgr;
        let result = match (was_pool, is_pool) {
            (true, false) => self.teardown(&old).await,
            (false, true) => self.provision(&new).await,
            (true, true) if old.metadata.generation != new.metadata.generation => {
                match self.provision(&new).await {
                    Ok(()) => self.retire_generation(&old).await,
                    Err(err) => Err(err),
                }
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            error!(
                function_name = %new.name_any(),
                function_namespace = %new.namespace().unwrap_or_default(),
                phase = "update",
                error = %err,
                "failed to reconcile pool function"
            );
        }
    }

    async fn on_delete(&self, function: Arc<Function>) {
        if function.spec.executor_type() != ExecutorType::Poolmgr {
            return;
        }
        if let Err(err) = self.teardown(&function).await {
            error!(
                function_name = %function.name_any(),
                function_namespace = %function.namespace().unwrap_or_default(),
                phase = "delete",
                error = %err,
                "failed to clean up pool function"
            );
        }
    }
}

/// Grants fetchers access to packages and mirrors package build status
/// onto the functions using them.
pub struct PackageHandler {
    cluster: Cluster,
    config: Arc<ServerConfig>,
    functions: Arc<Store<Function>>,
}

impl PackageHandler {
    pub fn new(cluster: Cluster, config: Arc<ServerConfig>, functions: Arc<Store<Function>>) -> Self {
        Self {
            cluster,
            config,
            functions,
        }
    }

    async fn grant_access(&self, package: &Package) -> ExecutorResult<()> {
        let package_namespace = package.namespace().unwrap_or_default();
        let env_namespace = if package.spec.environment.namespace.is_empty() {
            package_namespace.clone()
        } else {
            package.spec.environment.namespace.clone()
        };
        let sa_namespace = self.config.resolve_function_namespace(&env_namespace);
        ensure_fetcher_service_account(&self.cluster, &sa_namespace).await?;
        setup_role_binding(
            &self.cluster,
            PACKAGE_GETTER_ROLE_BINDING,
            &package_namespace,
            PACKAGE_GETTER_CLUSTER_ROLE,
            FETCHER_SERVICE_ACCOUNT,
            &sa_namespace,
        )
        .await
    }

    /// Copies the build status into every function referencing `package`.
    /// Returns the number of functions patched.
    pub async fn sync_build_status(&self, package: &Package) -> ExecutorResult<usize> {
        let Some(status) = package.status.as_ref() else {
            return Ok(0);
        };
        let package_name = package.name_any();
        let package_namespace = package.namespace().unwrap_or_default();
        let mut patched = 0;
        for function in self.functions.list_namespace(&package_namespace) {
            let package_ref = &function.spec.package.package_ref;
            let ref_namespace = if package_ref.namespace.is_empty() {
                function.namespace().unwrap_or_default()
            } else {
                package_ref.namespace.clone()
            };
            if package_ref.name != package_name || ref_namespace != package_namespace {
                continue;
            }
            let current = function.status.clone().unwrap_or_default();
            if current.package_build_status == Some(status.buildstatus)
                && current.package_build_log.as_deref() == Some(status.buildlog.as_str())
            {
                continue;
            }
            let patch = json!({
                "status": {
                    "packageBuildStatus": status.buildstatus,
                    "packageBuildLog": status.buildlog,
                }
            });
            let name = function.name_any();
            match self
                .cluster
                .functions
                .patch_status(&package_namespace, &name, &patch)
                .await
            {
                Ok(_) => patched += 1,
                Err(err) => warn!(function_name = %name, package = %package_name, error = %err, "failed to copy package build status"),
            }
        }
        Ok(patched)
    }

    async fn reconcile(&self, package: &Package) {
        if let Err(err) = self.grant_access(package).await {
            error!(package = %package.name_any(), error = %err, "failed to set up package access");
        }
        match self.sync_build_status(package).await {
            Ok(0) => {}
            Ok(patched) => debug!(package = %package.name_any(), patched, "copied package build status"),
            Err(err) => error!(package = %package.name_any(), error = %err, "failed to copy package build status"),
        }
    }
}

#[async_trait]
impl EventHandler<Package> for PackageHandler {
    async fn on_add(&self, package: Arc<Package>) {
        self.reconcile(&package).await;
    }

    async fn on_update(&self, _old: Arc<Package>, new: Arc<Package>) {
        self.reconcile(&new).await;
    }
}

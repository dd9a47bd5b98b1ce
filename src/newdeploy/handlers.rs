use std::sync::Arc;

use async_trait::async_trait;
use data_model::{crd::Function, ExecutorType, FunctionKey};
use kube::ResourceExt;
use tracing::{debug, error};

use super::NewDeployManager;
use crate::cluster::informer::EventHandler;

/// Creates new-deploy functions eagerly and keeps their objects in line
/// with function changes.
pub struct NewDeployFunctionHandler {
    manager: Arc<NewDeployManager>,
}

impl NewDeployFunctionHandler {
    pub fn new(manager: Arc<NewDeployManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler<Function> for NewDeployFunctionHandler {
    async fn on_add(&self, function: Arc<Function>) {
        if function.spec.executor_type() != ExecutorType::Newdeploy {
            return;
        }
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let key = FunctionKey::for_function(&function).to_string();
            match manager
                .throttler()
                .run_once_strict(&key, || manager.fn_create(&function))
                .await
            {
                Ok(fsvc) => debug!(function = %key, address = %fsvc.address, "eagerly created function"),
                Err(err) if err.is_not_found() => {}
                Err(err) => error!(
                    function_name = %function.name_any(),
                    function_namespace = %function.namespace().unwrap_or_default(),
                    phase = "create",
                    error = %err,
                    "failed to eagerly create function"
                ),
            }
        });
    }

    async fn on_update(&self, old: Arc<Function>, new: Arc<Function>) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.update_function(&old, &new).await {
                error!(
                    function_name = %new.name_any(),
                    function_namespace = %new.namespace().unwrap_or_default(),
                    phase = "update",
                    error = %err,
                    "failed to update function objects"
                );
            }
        });
    }

    async fn on_delete(&self, function: Arc<Function>) {
        if function.spec.executor_type() != ExecutorType::Newdeploy {
            return;
        }
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.fn_delete(&function).await {
                error!(
                    function_name = %function.name_any(),
                    function_namespace = %function.namespace().unwrap_or_default(),
                    phase = "delete",
                    error = %err,
                    "failed to delete function objects"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use data_model::test_objects::tests::{test_environment, test_function, TEST_NAMESPACE};

    use super::*;
    use crate::{
        cluster::{informer::Informer, memory::MemoryCluster, ObjectApi},
        config::ServerConfig,
        fscache::FunctionServiceCache,
        newdeploy::{objects::object_name, NewDeployStores},
        testing::wait_for,
        throttler::Throttler,
    };

    fn manager(memory: &MemoryCluster) -> Arc<NewDeployManager> {
        let cluster = memory.cluster();
        let config = Arc::new(ServerConfig::default());
        let stores = NewDeployStores {
            functions: Informer::new("functions", cluster.functions.clone()).store(),
            environments: Informer::new("environments", cluster.environments.clone()).store(),
            deployments: Informer::new("deployments", cluster.deployments.clone()).store(),
            services: Informer::new("services", cluster.services.clone()).store(),
        };
        let throttler = Arc::new(Throttler::new(config.throttler_expiry));
        Arc::new(NewDeployManager::new(
            cluster,
            config,
            FunctionServiceCache::new(),
            throttler,
            "instance-a".to_string(),
            stores,
        ))
    }

    #[tokio::test]
    async fn test_update_returns_before_objects_are_ready() -> Result<()> {
        let memory = MemoryCluster::default();
        memory
            .environments
            .create(TEST_NAMESPACE, &test_environment("nodejs", "e-1"))
            .await?;
        let manager = manager(&memory);
        let handler = NewDeployFunctionHandler::new(manager.clone());

        // Nothing makes the deployment available here, so creating the
        // function's objects waits out the whole specialization timeout.
        let old = test_function("api", "u-2", ExecutorType::Poolmgr);
        let mut new = old.clone();
        new.metadata.generation = Some(2);
        new.spec.invoke_strategy.execution_strategy.executor_type = ExecutorType::Newdeploy;
        let (namespace, name) = (manager.object_namespace(&new), object_name(&new));

        tokio::time::timeout(
            Duration::from_secs(1),
            handler.on_update(Arc::new(old), Arc::new(new)),
        )
        .await?;

        let deployments = memory.deployments.clone();
        let (namespace, name) = (namespace.as_str(), name.as_str());
        wait_for("function deployment created", Duration::from_secs(5), move || {
            let deployments = deployments.clone();
            async move { Ok(deployments.get_opt(namespace, name).await?.is_some()) }
        })
        .await
    }
}

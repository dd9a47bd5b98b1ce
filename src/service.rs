use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use data_model::crd::{Environment, Function, Package};
use k8s_openapi::api::{
    apps::v1::{Deployment, ReplicaSet},
    core::v1::{ConfigMap, Pod, Secret, Service as KubeService},
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cluster::{
        informer::Informer,
        Cluster,
        ClusterObject,
    },
    config::ServerConfig,
    config_secret_controller::ConfigSecretController,
    executor::{Executor, ExecutorStrategy},
    fetcher::{FetcherClient, FetcherConfig},
    fscache::FunctionServiceCache,
    newdeploy::{handlers::NewDeployFunctionHandler, NewDeployManager, NewDeployStores},
    poolmgr::{
        controller::PoolPodController,
        handlers::{PackageHandler, PoolFunctionHandler},
        GenericPoolManager,
        PoolContext,
    },
    reaper::RoleBindingReaper,
    routes::{create_routes, RouteState},
    throttler::Throttler,
};

/// One informer per watched kind.
pub struct Informers {
    pub functions: Arc<Informer<Function>>,
    pub environments: Arc<Informer<Environment>>,
    pub packages: Arc<Informer<Package>>,
    pub pods: Arc<Informer<Pod>>,
    pub deployments: Arc<Informer<Deployment>>,
    pub services: Arc<Informer<KubeService>>,
    pub replica_sets: Arc<Informer<ReplicaSet>>,
    pub secrets: Arc<Informer<Secret>>,
    pub config_maps: Arc<Informer<ConfigMap>>,
}

impl Informers {
    fn new(cluster: &Cluster) -> Self {
        Self {
            functions: Informer::new("functions", cluster.functions.clone()),
            environments: Informer::new("environments", cluster.environments.clone()),
            packages: Informer::new("packages", cluster.packages.clone()),
            pods: Informer::new("pods", cluster.pods.clone()),
            deployments: Informer::new("deployments", cluster.deployments.clone()),
            services: Informer::new("services", cluster.services.clone()),
            replica_sets: Informer::new("replicasets", cluster.replica_sets.clone()),
            secrets: Informer::new("secrets", cluster.secrets.clone()),
            config_maps: Informer::new("configmaps", cluster.config_maps.clone()),
        }
    }

    fn spawn(&self, cancel: &CancellationToken) {
        tokio::spawn(self.functions.clone().run(cancel.clone()));
        tokio::spawn(self.environments.clone().run(cancel.clone()));
        tokio::spawn(self.packages.clone().run(cancel.clone()));
        tokio::spawn(self.pods.clone().run(cancel.clone()));
        tokio::spawn(self.deployments.clone().run(cancel.clone()));
        tokio::spawn(self.services.clone().run(cancel.clone()));
        tokio::spawn(self.replica_sets.clone().run(cancel.clone()));
        tokio::spawn(self.secrets.clone().run(cancel.clone()));
        tokio::spawn(self.config_maps.clone().run(cancel.clone()));
    }

    async fn wait_synced(&self, timeout: Duration) -> Result<()> {
        wait_synced(&self.functions, timeout).await?;
        wait_synced(&self.environments, timeout).await?;
        wait_synced(&self.packages, timeout).await?;
        wait_synced(&self.pods, timeout).await?;
        wait_synced(&self.deployments, timeout).await?;
        wait_synced(&self.services, timeout).await?;
        wait_synced(&self.replica_sets, timeout).await?;
        wait_synced(&self.secrets, timeout).await?;
        wait_synced(&self.config_maps, timeout).await
    }
}

async fn wait_synced<K: ClusterObject>(informer: &Informer<K>, timeout: Duration) -> Result<()> {
    if !informer.wait_synced(timeout).await {
        anyhow::bail!("{} informer did not sync within {timeout:?}", K::kind(&()));
    }
    Ok(())
}

pub struct Service {
    pub config: Arc<ServerConfig>,
    pub cluster: Cluster,
    pub cancel: CancellationToken,
    pub cache: FunctionServiceCache,
    pub throttler: Arc<Throttler>,
    pub executor: Arc<Executor>,
    pub pool_manager: Arc<GenericPoolManager>,
    pub newdeploy_manager: Arc<NewDeployManager>,
    pub informers: Informers,
    instance_id: String,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let cluster = Cluster::from_kube()
            .await
            .context("error connecting to the orchestrator")?;
        Self::with_cluster(config, cluster)
    }

    /// Wires every component against `cluster`. Nothing runs until
    /// [`Service::start_background`].
    pub fn with_cluster(config: ServerConfig, cluster: Cluster) -> Result<Self> {
        config.validate()?;
        let instance_id = config.instance_id();
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let cache = FunctionServiceCache::new();
        let throttler = Arc::new(Throttler::new(config.throttler_expiry));
        let informers = Informers::new(&cluster);

        let pool_manager = Arc::new(GenericPoolManager::new(
            PoolContext {
                cluster: cluster.clone(),
                config: config.clone(),
                fetcher_config: FetcherConfig::new(&config),
                fetcher: FetcherClient::new().context("error building fetcher client")?,
                cache: cache.clone(),
                instance_id: instance_id.clone(),
                pods: informers.pods.store(),
            },
            informers.functions.store(),
            informers.environments.store(),
            cancel.clone(),
        ));
        let newdeploy_manager = Arc::new(NewDeployManager::new(
            cluster.clone(),
            config.clone(),
            cache.clone(),
            throttler.clone(),
            instance_id.clone(),
            NewDeployStores {
                functions: informers.functions.store(),
                environments: informers.environments.store(),
                deployments: informers.deployments.store(),
                services: informers.services.store(),
            },
        ));
        let strategies: Vec<Arc<dyn ExecutorStrategy>> =
            vec![pool_manager.clone(), newdeploy_manager.clone()];
        let executor = Arc::new(Executor::new(
            cluster.clone(),
            informers.functions.store(),
            cache.clone(),
            throttler.clone(),
            strategies,
        ));

        let pod_controller =
            PoolPodController::start(pool_manager.clone(), informers.pods.store(), cancel.clone());
        informers.environments.add_handler(pod_controller.clone());
        informers.replica_sets.add_handler(pod_controller);
        informers
            .functions
            .add_handler(Arc::new(PoolFunctionHandler::new(pool_manager.clone())));
        informers
            .functions
            .add_handler(Arc::new(NewDeployFunctionHandler::new(newdeploy_manager.clone())));
        informers.packages.add_handler(Arc::new(PackageHandler::new(
            cluster.clone(),
            config.clone(),
            informers.functions.store(),
        )));
        let config_secrets = Arc::new(ConfigSecretController::new(
            executor.clone(),
            informers.functions.store(),
        ));
        informers.secrets.add_handler(config_secrets.clone());
        informers.config_maps.add_handler(config_secrets);

        Ok(Self {
            config,
            cluster,
            cancel,
            cache,
            throttler,
            executor,
            pool_manager,
            newdeploy_manager,
            informers,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn cleanup_old_executor_objects(&self) {
        for strategy in self.executor.strategies() {
            if let Err(err) = strategy.cleanup_old_executor_objects().await {
                error!(executor = %strategy.executor_type(), error = %err, "failed to clean up objects of earlier executors");
            }
        }
    }

    /// Starts informers, adopts or cleans up what earlier executor processes
    /// left behind and starts the strategies' loops.
    pub async fn start_background(&self) -> Result<()> {
        if !self.config.adopt_existing_resources {
            self.cleanup_old_executor_objects().await;
        }
        self.informers.spawn(&self.cancel);
        self.informers
            .wait_synced(self.config.informer_sync_timeout)
            .await?;

        if self.config.adopt_existing_resources {
            for strategy in self.executor.strategies() {
                if let Err(err) = strategy.adopt_existing_resources().await {
                    warn!(executor = %strategy.executor_type(), error = %err, "failed to adopt existing resources");
                }
            }
            self.cleanup_old_executor_objects().await;
        }

        for strategy in self.executor.strategies() {
            tokio::spawn(strategy.clone().run(self.cancel.clone()));
        }
        tokio::spawn(self.throttler.clone().run(self.cancel.clone()));
        let reaper = RoleBindingReaper::new(self.cluster.clone(), self.config.clone());
        tokio::spawn(reaper.run(self.cancel.clone()));
        info!(instance_id = %self.instance_id, "executor background tasks started");
        Ok(())
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            executor: self.executor.clone(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_background().await?;

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, cancel).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("executor api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state());
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;
        self.cancel.cancel();

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    cancel.cancel();
    info!("signal received, shutting down server gracefully");
}

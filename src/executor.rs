//! Front door of the executor: resolves a function to a live address,
//! through the cache when possible and through the function's strategy
//! otherwise.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use data_model::{
    crd::Function,
    ExecutorType,
    FuncSvc,
    FunctionIdentity,
    FunctionKey,
    TapServiceRequest,
};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{informer::Store, Cluster},
    error::{ExecutorError, ExecutorResult},
    fscache::FunctionServiceCache,
    http_objects::FuncSvcInfo,
    throttler::{LeaderGuard, Throttler, Ticket},
};

/// How functions of one executor type are materialized and torn down.
#[async_trait]
pub trait ExecutorStrategy: Send + Sync {
    fn executor_type(&self) -> ExecutorType;

    /// Creates a live service for `function` and records it in the cache.
    async fn get_func_svc(&self, function: Arc<Function>) -> ExecutorResult<FuncSvc>;

    /// Whether the objects behind a cached entry still serve traffic.
    async fn is_valid(&self, fsvc: &FuncSvc) -> bool;

    async fn delete_func_svc(&self, fsvc: &FuncSvc) -> ExecutorResult<()>;

    async fn tap(&self, address: &str) -> ExecutorResult<()>;

    async fn release(&self, address: &str) -> ExecutorResult<()>;

    /// Rebuilds the cache from objects left by a previous executor process.
    async fn adopt_existing_resources(&self) -> ExecutorResult<()>;

    /// Deletes objects of previous executor processes that were not adopted.
    async fn cleanup_old_executor_objects(&self) -> ExecutorResult<()>;

    /// Drops whatever serves `function` so the next request picks up changed
    /// secrets or config maps.
    async fn refresh_function(&self, function: &Function) -> ExecutorResult<()>;

    /// Background loops of the strategy; returns once `cancel` fires.
    async fn run(self: Arc<Self>, cancel: CancellationToken);
}

const FOLLOWER_ATTEMPTS: usize = 2;

pub struct Executor {
    cluster: Cluster,
    functions: Arc<Store<Function>>,
    cache: FunctionServiceCache,
    throttler: Arc<Throttler>,
    strategies: HashMap<ExecutorType, Arc<dyn ExecutorStrategy>>,
}

impl Executor {
    pub fn new(
        cluster: Cluster,
        functions: Arc<Store<Function>>,
        cache: FunctionServiceCache,
        throttler: Arc<Throttler>,
        strategies: Vec<Arc<dyn ExecutorStrategy>>,
    ) -> Self {
        Self {
            cluster,
            functions,
            cache,
            throttler,
            strategies: strategies
                .into_iter()
                .map(|strategy| (strategy.executor_type(), strategy))
                .collect(),
        }
    }

    pub fn strategy(&self, executor: ExecutorType) -> ExecutorResult<Arc<dyn ExecutorStrategy>> {
        self.strategies.get(&executor).cloned().ok_or_else(|| {
            ExecutorError::invalid(format!("unknown executor type {executor}"))
        })
    }

    pub fn strategies(&self) -> impl Iterator<Item = &Arc<dyn ExecutorStrategy>> {
        self.strategies.values()
    }

    /// Looks the function up in the informer store, then the API. A uid
    /// that does not match the live object means the caller asked for a
    /// deleted function.
    async fn resolve_function(&self, identity: &FunctionIdentity) -> ExecutorResult<Arc<Function>> {
        let function = match self.functions.get(&identity.namespace, &identity.name) {
            Some(function) => function,
            None => Arc::new(
                self.cluster
                    .functions
                    .get(&identity.namespace, &identity.name)
                    .await?,
            ),
        };
        if let Some(uid) = identity.uid.as_deref() {
            if function.uid().as_deref() != Some(uid) {
                return Err(ExecutorError::not_found(format!(
                    "function {identity} with uid {uid} not found"
                )));
            }
        }
        Ok(function)
    }

    /// Returns a cached entry that still serves traffic. Stale entries are
    /// dropped. For pools this takes a request slot.
    async fn lookup(
        &self,
        strategy: &dyn ExecutorStrategy,
        key: &FunctionKey,
    ) -> ExecutorResult<Option<FuncSvc>> {
        let found = match strategy.executor_type() {
            ExecutorType::Poolmgr => self.cache.acquire(key).await,
            ExecutorType::Newdeploy => self.cache.get_by_function(key).await,
        };
        let fsvc = match found {
            Ok(fsvc) => fsvc,
            Err(ExecutorError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if strategy.is_valid(&fsvc).await {
            return Ok(Some(fsvc));
        }
        info!(
            function_name = %fsvc.function.name,
            function_namespace = %fsvc.function.namespace,
            address = %fsvc.address,
            "dropping stale function service"
        );
        if let Err(err) = strategy.delete_func_svc(&fsvc).await {
            warn!(address = %fsvc.address, error = %err, "failed to drop stale function service");
        }
        Ok(None)
    }

    /// Resolves `identity` to the address of a live service.
    pub async fn get_service_for_function(&self, identity: &FunctionIdentity) -> ExecutorResult<String> {
        let function = self.resolve_function(identity).await?;
        let executor = function.spec.executor_type();
        let strategy = self.strategy(executor)?;
        let key = FunctionKey::for_function(&function);

        if let Some(fsvc) = self.lookup(strategy.as_ref(), &key).await? {
            return Ok(fsvc.address);
        }

        for _ in 0..FOLLOWER_ATTEMPTS {
            match self.throttler.acquire(&key.to_string()) {
                Ticket::Leader(guard) => {
                    let fsvc = self.create(strategy.clone(), function.clone(), guard).await?;
                    if executor == ExecutorType::Poolmgr {
                        // Count this request against the new pod.
                        return Ok(self.cache.acquire(&key).await?.address);
                    }
                    return Ok(fsvc.address);
                }
                Ticket::Follower(follower) => {
                    follower.wait().await;
                    if let Some(fsvc) = self.lookup(strategy.as_ref(), &key).await? {
                        return Ok(fsvc.address);
                    }
                }
            }
        }
        Err(ExecutorError::not_found(format!(
            "no service became available for function {identity}"
        )))
    }

    /// Runs the strategy's create path on its own task so a caller going
    /// away does not abandon half-built objects. The leader guard is
    /// released when the task ends.
    async fn create(
        &self,
        strategy: Arc<dyn ExecutorStrategy>,
        function: Arc<Function>,
        guard: LeaderGuard,
    ) -> ExecutorResult<FuncSvc> {
        let function_name = function.name_any();
        let function_namespace = function.namespace().unwrap_or_default();
        let task = tokio::spawn(async move {
            let result = strategy.get_func_svc(function).await;
            drop(guard);
            result
        });
        match task.await {
            Ok(Ok(fsvc)) => {
                info!(function_name, function_namespace, address = %fsvc.address, "created function service");
                Ok(fsvc)
            }
            Ok(Err(err)) => {
                error!(function_name, function_namespace, phase = "create", error = %err, "failed to create function service");
                Err(err)
            }
            Err(err) => Err(ExecutorError::Internal(anyhow::anyhow!(
                "function service creation task failed: {err}"
            ))),
        }
    }

    /// Marks the service at `url` as used. Accepts bare addresses and URLs.
    pub async fn tap_service(&self, url: &str) -> ExecutorResult<()> {
        self.cache.touch_by_address(strip_scheme(url)).await
    }

    /// Applies every tap. Fails with the first error after trying them all.
    pub async fn tap_services(&self, requests: &[TapServiceRequest]) -> ExecutorResult<()> {
        let mut first_error = None;
        for request in requests {
            let address = strip_scheme(&request.service_url);
            let result = match self.strategy(request.fn_executor_type) {
                Ok(strategy) => strategy.tap(address).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                debug!(
                    function = %request.fn_metadata,
                    address,
                    error = %err,
                    "failed to tap function service"
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Gives back the request slot taken by `get_service_for_function`.
    pub async fn untap_service(&self, request: &TapServiceRequest) -> ExecutorResult<()> {
        if request.fn_executor_type != ExecutorType::Poolmgr {
            return Err(ExecutorError::invalid(format!(
                "unTapService is only supported for {} functions",
                ExecutorType::Poolmgr
            )));
        }
        let strategy = self.strategy(request.fn_executor_type)?;
        strategy.release(strip_scheme(&request.service_url)).await
    }

    /// Logs the cache contents and returns them.
    pub async fn debug_info(&self) -> ExecutorResult<Vec<FuncSvcInfo>> {
        self.cache.log().await?;
        Ok(self
            .cache
            .list_all()
            .await?
            .iter()
            .map(FuncSvcInfo::from)
            .collect())
    }
}

fn strip_scheme(url: &str) -> &str {
    let address = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    address.trim_end_matches('/')
}

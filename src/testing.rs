use std::{
    collections::BTreeMap,
    future::Future,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use data_model::LABEL_POD_TEMPLATE_HASH;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, ReplicaSet, ReplicaSetSpec},
        core::v1::{ContainerStatus, Pod, PodCondition, PodStatus},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use futures::stream::BoxStream;
use kube::{api::ObjectMeta, runtime::watcher, ResourceExt};
use serde_json::json;
use tokio::{
    net::TcpListener,
    sync::{Notify, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, subscriber, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    cluster::{
        delete_ignore_missing,
        labels_match,
        memory::MemoryCluster,
        Cluster,
        ClusterError,
        ClusterObject,
        ClusterResult,
        ObjectApi,
        Propagation,
    },
    config::ServerConfig,
    service::Service,
};

const OWNER_ANNOTATION: &str = "fake.deployment/owner";
const RESYNC_INTERVAL: Duration = Duration::from_millis(20);

/// Plays the orchestrator's deployment and replica-set controllers against
/// a [`MemoryCluster`]. Pods come up running and ready on distinct
/// loopback addresses.
pub struct FakeDeploymentController {
    cluster: Cluster,
    pod_counter: AtomicU32,
}

fn template_hash(deployment: &Deployment) -> String {
    let template = deployment
        .spec
        .as_ref()
        .map(|spec| serde_json::to_string(&spec.template).unwrap_or_default())
        .unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    template.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

fn owner(rs: &ReplicaSet) -> Option<&String> {
    rs.annotations().get(OWNER_ANNOTATION)
}

fn match_labels(selector: &LabelSelector) -> BTreeMap<String, String> {
    selector.match_labels.clone().unwrap_or_default()
}

impl FakeDeploymentController {
    pub fn start(cluster: Cluster, cancel: CancellationToken) -> Arc<Self> {
        let controller = Arc::new(Self {
            cluster,
            pod_counter: AtomicU32::new(0),
        });
        let runner = controller.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESYNC_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = runner.sync_all().await {
                            warn!(error = %err, "fake deployment controller sync failed");
                        }
                    }
                }
            }
        });
        controller
    }

    async fn sync_all(&self) -> Result<()> {
        let deployments = self.cluster.deployments.list(None, &BTreeMap::new()).await?;
        for deployment in &deployments {
            self.sync_deployment(deployment).await?;
        }
        for rs in self.cluster.replica_sets.list(None, &BTreeMap::new()).await? {
            let namespace = rs.namespace().unwrap_or_default();
            let owned = deployments.iter().any(|d| {
                d.namespace().as_deref() == Some(namespace.as_str()) && owner(&rs) == Some(&d.name_any())
            });
            if !owned {
                self.delete_replica_set(&rs).await?;
            }
        }
        Ok(())
    }

    async fn sync_deployment(&self, deployment: &Deployment) -> Result<()> {
        let Some(spec) = deployment.spec.as_ref() else {
            return Ok(());
        };
        let namespace = deployment.namespace().unwrap_or_default();
        let name = deployment.name_any();
        let hash = template_hash(deployment);
        let rs_name = format!("{name}-{hash}");
        let replicas = spec.replicas.unwrap_or(1);

        match self.cluster.replica_sets.get_opt(&namespace, &rs_name).await? {
            None => {
                let mut selector = match_labels(&spec.selector);
                selector.insert(LABEL_POD_TEMPLATE_HASH.to_string(), hash.clone());
                let mut template = spec.template.clone();
                let template_labels = template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .labels
                    .get_or_insert_with(BTreeMap::new);
                template_labels.insert(LABEL_POD_TEMPLATE_HASH.to_string(), hash.clone());
                let rs_labels = template_labels.clone();
                let rs = ReplicaSet {
                    metadata: ObjectMeta {
                        name: Some(rs_name.clone()),
                        labels: Some(rs_labels),
                        annotations: Some(BTreeMap::from([(OWNER_ANNOTATION.to_string(), name.clone())])),
                        ..Default::default()
                    },
                    spec: Some(ReplicaSetSpec {
                        replicas: Some(replicas),
                        selector: LabelSelector {
                            match_labels: Some(selector),
                            ..Default::default()
                        },
                        template: Some(template),
                        ..Default::default()
                    }),
                    status: None,
                };
                self.cluster.replica_sets.create(&namespace, &rs).await?;
            }
            Some(rs) if rs.spec.as_ref().and_then(|s| s.replicas) != Some(replicas) => {
                let patch = json!({ "spec": { "replicas": replicas } });
                self.cluster.replica_sets.patch(&namespace, &rs_name, &patch).await?;
            }
            Some(_) => {}
        }

        let mut available = 0;
        for rs in self.cluster.replica_sets.list(Some(&namespace), &BTreeMap::new()).await? {
            if owner(&rs) != Some(&name) {
                continue;
            }
            if rs.name_any() != rs_name && rs.spec.as_ref().and_then(|s| s.replicas) != Some(0) {
                let patch = json!({ "spec": { "replicas": 0 } });
                self.cluster.replica_sets.patch(&namespace, &rs.name_any(), &patch).await?;
                continue;
            }
            let ready = self.sync_pods(&rs).await?;
            if rs.name_any() == rs_name {
                available = ready;
            }
        }

        let status = deployment.status.clone().unwrap_or_default();
        if status.available_replicas != Some(available) || status.replicas != Some(available) {
            let patch = json!({
                "status": {
                    "replicas": available,
                    "readyReplicas": available,
                    "availableReplicas": available,
                }
            });
            self.cluster.deployments.patch_status(&namespace, &name, &patch).await?;
        }
        Ok(())
    }

    /// Creates or deletes pods until the replica set's selector matches its
    /// replica count. Returns the number of pods left.
    async fn sync_pods(&self, rs: &ReplicaSet) -> Result<i32> {
        let Some(spec) = rs.spec.as_ref() else {
            return Ok(0);
        };
        let namespace = rs.namespace().unwrap_or_default();
        let desired = spec.replicas.unwrap_or(1).max(0) as usize;
        let mut pods = self
            .cluster
            .pods
            .list(Some(&namespace), &match_labels(&spec.selector))
            .await?;
        pods.sort_by_key(|pod| pod.name_any());
        while pods.len() > desired {
            if let Some(pod) = pods.pop() {
                delete_ignore_missing(
                    self.cluster.pods.as_ref(),
                    &namespace,
                    &pod.name_any(),
                    Propagation::Background,
                )
                .await?;
            }
        }
        for _ in pods.len()..desired {
            let pod = self.new_pod(rs);
            pods.push(self.cluster.pods.create(&namespace, &pod).await?);
        }
        Ok(pods.len() as i32)
    }

    fn new_pod(&self, rs: &ReplicaSet) -> Pod {
        let n = self.pod_counter.fetch_add(1, Ordering::SeqCst);
        let template = rs
            .spec
            .as_ref()
            .and_then(|spec| spec.template.clone())
            .unwrap_or_default();
        let template_meta = template.metadata.unwrap_or_default();
        let pod_spec = template.spec.unwrap_or_default();
        let container_statuses = pod_spec
            .containers
            .iter()
            .map(|c| ContainerStatus {
                name: c.name.clone(),
                image: c.image.clone().unwrap_or_default(),
                ready: true,
                started: Some(true),
                ..Default::default()
            })
            .collect();
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-{n}", rs.name_any())),
                labels: template_meta.labels,
                annotations: template_meta.annotations,
                ..Default::default()
            },
            spec: Some(pod_spec),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(format!("127.0.0.{}", 2 + n % 250)),
                container_statuses: Some(container_statuses),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    async fn delete_replica_set(&self, rs: &ReplicaSet) -> Result<()> {
        let namespace = rs.namespace().unwrap_or_default();
        if let Some(spec) = rs.spec.as_ref() {
            let selector = match_labels(&spec.selector);
            for pod in self.cluster.pods.list(Some(&namespace), &selector).await? {
                delete_ignore_missing(
                    self.cluster.pods.as_ref(),
                    &namespace,
                    &pod.name_any(),
                    Propagation::Background,
                )
                .await?;
            }
        }
        delete_ignore_missing(
            self.cluster.replica_sets.as_ref(),
            &namespace,
            &rs.name_any(),
            Propagation::Background,
        )
        .await?;
        debug!(replica_set = %rs.name_any(), namespace, "collected orphaned replica set");
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeFetcherState {
    hang_next: Arc<AtomicUsize>,
    hanging: Arc<AtomicBool>,
    specialized: Arc<AtomicUsize>,
}

/// Stand-in for the fetcher sidecars. Listens on every local address, so
/// pods on any `127.0.0.x` reach it through the configured fetcher port.
pub struct FakeFetcher {
    pub port: u16,
    state: FakeFetcherState,
    cancel: CancellationToken,
}

async fn fake_specialize(
    State(state): State<FakeFetcherState>,
    Json(_request): Json<serde_json::Value>,
) -> StatusCode {
    let hang = state
        .hang_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if hang {
        state.hanging.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }
    state.specialized.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

impl FakeFetcher {
    pub async fn start() -> Result<Self> {
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let state = FakeFetcherState::default();
        let app = Router::new()
            .route("/specialize", post(fake_specialize))
            .with_state(state.clone());
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
        Ok(Self { port, state, cancel })
    }

    /// The next `n` specialize calls never answer.
    pub fn hang_next(&self, n: usize) {
        self.state.hang_next.store(n, Ordering::SeqCst);
    }

    pub fn hung(&self) -> bool {
        self.state.hanging.load(Ordering::SeqCst)
    }

    pub fn specialized(&self) -> usize {
        self.state.specialized.load(Ordering::SeqCst)
    }
}

impl Drop for FakeFetcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct TestService {
    pub memory: MemoryCluster,
    pub service: Service,
    pub fetcher: Arc<FakeFetcher>,
    pub controller: Arc<FakeDeploymentController>,
    cancel: CancellationToken,
}

pub fn test_config(fetcher_port: u16, instance_id: &str) -> ServerConfig {
    ServerConfig {
        instance_id: Some(instance_id.to_string()),
        fetcher_port,
        pod_ready_timeout: Duration::from_secs(3),
        poolmgr_object_reaper_interval: Duration::from_millis(100),
        object_reaper_interval: Duration::from_millis(100),
        specialize_failure_delete_delay: Duration::from_millis(100),
        deployment_poll_interval: Duration::from_millis(50),
        eager_pool_interval: Duration::from_millis(100),
        informer_sync_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(MemoryCluster::default(), |_| {}).await
    }

    /// Starts a service against `memory`, with a fresh fake fetcher.
    pub async fn with_config(memory: MemoryCluster, tweak: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        let fetcher = Arc::new(FakeFetcher::start().await?);
        let mut config = test_config(fetcher.port, "instance-a");
        tweak(&mut config);
        Self::start(memory, fetcher, config).await
    }

    /// Starts another executor process against the same cluster and
    /// fetcher, as after a restart.
    pub async fn restart(&self, instance_id: &str) -> Result<Self> {
        self.shutdown();
        let mut config = (*self.service.config).clone();
        config.instance_id = Some(instance_id.to_string());
        Self::start(self.memory.clone(), self.fetcher.clone(), config).await
    }

    async fn start(memory: MemoryCluster, fetcher: Arc<FakeFetcher>, config: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let cancel = CancellationToken::new();
        let controller = FakeDeploymentController::start(memory.cluster(), cancel.clone());
        let service = Service::with_cluster(config, memory.cluster())?;
        service.start_background().await?;
        Ok(Self {
            memory,
            service,
            fetcher,
            controller,
            cancel,
        })
    }

    /// Stops the executor and its fake controllers. The cluster state stays.
    pub fn shutdown(&self) {
        self.service.cancel.cancel();
        self.cancel.cancel();
    }

    pub fn cluster(&self) -> Cluster {
        self.memory.cluster()
    }

    pub fn pods_matching(&self, selector: &BTreeMap<String, String>) -> Vec<Pod> {
        self.memory
            .pods
            .all()
            .into_iter()
            .filter(|pod| labels_match(Some(pod.labels()), selector))
            .collect()
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wraps an [`ObjectApi`] and misbehaves for the object called `name`:
/// its patches fail, or its creation waits on a gate.
pub struct FaultyApi<K: ClusterObject> {
    inner: Arc<dyn ObjectApi<K>>,
    name: String,
    fail_patches: bool,
    create_gate: Option<Arc<Semaphore>>,
    creates: AtomicUsize,
    create_entered: Notify,
}

impl<K: ClusterObject> FaultyApi<K> {
    pub fn failing_patches(inner: Arc<dyn ObjectApi<K>>, name: &str) -> Self {
        Self::new(inner, name, true, None)
    }

    /// Creation of `name` blocks until `gate` hands out a permit.
    pub fn gated_create(inner: Arc<dyn ObjectApi<K>>, name: &str, gate: Arc<Semaphore>) -> Self {
        Self::new(inner, name, false, Some(gate))
    }

    fn new(inner: Arc<dyn ObjectApi<K>>, name: &str, fail_patches: bool, create_gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            inner,
            name: name.to_string(),
            fail_patches,
            create_gate,
            creates: AtomicUsize::new(0),
            create_entered: Notify::new(),
        }
    }

    /// Creation attempts of `name` so far.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Resolves once a creation of `name` is waiting on the gate.
    pub async fn create_entered(&self) {
        self.create_entered.notified().await
    }
}

#[async_trait]
impl<K: ClusterObject> ObjectApi<K> for FaultyApi<K> {
    async fn get(&self, namespace: &str, name: &str) -> ClusterResult<K> {
        self.inner.get(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> ClusterResult<Vec<K>> {
        self.inner.list(namespace, labels).await
    }

    async fn create(&self, namespace: &str, obj: &K) -> ClusterResult<K> {
        if obj.name_any() == self.name {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.create_gate {
                self.create_entered.notify_one();
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| ClusterError::Transient("create gate closed".to_string()))?;
            }
        }
        self.inner.create(namespace, obj).await
    }

    async fn replace(&self, namespace: &str, obj: &K) -> ClusterResult<K> {
        self.inner.replace(namespace, obj).await
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> ClusterResult<K> {
        if self.fail_patches && name == self.name {
            return Err(ClusterError::Transient(format!("patch of {name} unavailable")));
        }
        self.inner.patch(namespace, name, patch).await
    }

    async fn patch_status(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> ClusterResult<K> {
        self.inner.patch_status(namespace, name, patch).await
    }

    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation) -> ClusterResult<()> {
        self.inner.delete(namespace, name, propagation).await
    }

    fn watch(&self) -> BoxStream<'static, ClusterResult<watcher::Event<K>>> {
        self.inner.watch()
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(description: &str, timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {description}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

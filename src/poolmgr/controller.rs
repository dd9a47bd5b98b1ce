//! Reacts to environment and replica-set changes: keeps pools in line with
//! their environment and deletes specialized pods that lost their pool.

use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_trait::async_trait;
use data_model::{
    crd::Environment,
    ExecutorType,
    LABEL_ENVIRONMENT_NAME,
    LABEL_ENVIRONMENT_NAMESPACE,
    LABEL_EXECUTOR_TYPE,
    LABEL_MANAGED,
};
use k8s_openapi::api::{apps::v1::ReplicaSet, core::v1::Pod};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{pool::is_pod_active, GenericPoolManager};
use crate::cluster::{
    delete_ignore_missing,
    informer::{EventHandler, Store},
    labels,
    labels_match,
    work_queue::{WorkHandler, WorkQueue},
    Propagation,
};

const ENV_CREATE_UPDATE_WORKERS: usize = 4;

/// Pod queued for deletion, by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
        }
    }
}

/// Environment queued for reconcile, by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvKey {
    pub namespace: String,
    pub name: String,
}

/// Last state of a deleted environment, queued for teardown by uid.
#[derive(Debug, Clone)]
pub struct DeletedEnv(pub Arc<Environment>);

impl DeletedEnv {
    fn uid(&self) -> String {
        self.0.uid().unwrap_or_default()
    }
}

impl PartialEq for DeletedEnv {
    fn eq(&self, other: &Self) -> bool {
        self.uid() == other.uid()
    }
}

impl Eq for DeletedEnv {}

impl Hash for DeletedEnv {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid().hash(state);
    }
}

pub struct PoolPodController {
    manager: Arc<GenericPoolManager>,
    pods: Arc<Store<Pod>>,
    env_create_update: WorkQueue<EnvKey>,
    env_delete: WorkQueue<DeletedEnv>,
    pod_cleanup: WorkQueue<PodKey>,
}

impl PoolPodController {
    pub fn start(
        manager: Arc<GenericPoolManager>,
        pods: Arc<Store<Pod>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let pod_cleanup = WorkQueue::start(
            "pool-pod-cleanup",
            1,
            Arc::new(PodCleanup {
                manager: manager.clone(),
                pods: pods.clone(),
            }),
            cancel.clone(),
        );
        let env_create_update = WorkQueue::start(
            "pool-env-create-update",
            ENV_CREATE_UPDATE_WORKERS,
            Arc::new(EnvReconcile {
                manager: manager.clone(),
            }),
            cancel.clone(),
        );
        let env_delete = WorkQueue::start(
            "pool-env-delete",
            1,
            Arc::new(EnvTeardown {
                manager: manager.clone(),
                pods: pods.clone(),
                pod_cleanup: pod_cleanup.clone(),
            }),
            cancel,
        );
        Arc::new(Self {
            manager,
            pods,
            env_create_update,
            env_delete,
            pod_cleanup,
        })
    }

    fn queue_env(&self, env: &Environment) {
        self.env_create_update.add(EnvKey {
            namespace: env.namespace().unwrap_or_default(),
            name: env.name_any(),
        });
    }

    /// Queues the specialized pods of a replica set that was scaled to zero.
    fn queue_replica_set_pods(&self, rs: &ReplicaSet) {
        let desired = rs.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
        if desired != 0 {
            return;
        }
        let Some(mut selector) = rs
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.clone())
        else {
            return;
        };
        if selector.get(LABEL_EXECUTOR_TYPE).map(String::as_str) != Some(ExecutorType::Poolmgr.as_ref()) {
            return;
        }
        selector.insert(LABEL_MANAGED.to_string(), "false".to_string());
        let namespace = rs.namespace().unwrap_or_default();
        let mut queued = 0;
        for pod in self.pods.list_namespace(&namespace) {
            if labels_match(Some(pod.labels()), &selector) && is_pod_active(&pod) {
                self.pod_cleanup.add(PodKey::of(&pod));
                queued += 1;
            }
        }
        if queued > 0 {
            info!(replica_set = %rs.name_any(), namespace, queued, "queued specialized pods of retired replica set");
        }
    }

    pub fn manager(&self) -> &Arc<GenericPoolManager> {
        &self.manager
    }
}

#[async_trait]
impl EventHandler<Environment> for PoolPodController {
    async fn on_add(&self, env: Arc<Environment>) {
        self.queue_env(&env);
    }

    async fn on_update(&self, _old: Arc<Environment>, new: Arc<Environment>) {
        self.queue_env(&new);
    }

    async fn on_delete(&self, env: Arc<Environment>) {
        self.env_delete.add(DeletedEnv(env));
    }
}

#[async_trait]
impl EventHandler<ReplicaSet> for PoolPodController {
    async fn on_add(&self, rs: Arc<ReplicaSet>) {
        self.queue_replica_set_pods(&rs);
    }

    async fn on_update(&self, _old: Arc<ReplicaSet>, new: Arc<ReplicaSet>) {
        self.queue_replica_set_pods(&new);
    }

    async fn on_delete(&self, rs: Arc<ReplicaSet>) {
        self.queue_replica_set_pods(&rs);
    }
}

struct EnvReconcile {
    manager: Arc<GenericPoolManager>,
}

#[async_trait]
impl WorkHandler<EnvKey> for EnvReconcile {
    async fn handle(&self, key: &EnvKey) -> anyhow::Result<()> {
        let Some(env) = self.manager.environments().get(&key.namespace, &key.name) else {
            debug!(environment = %key.name, namespace = %key.namespace, "environment gone before reconcile");
            return Ok(());
        };
        let uid = env.uid().unwrap_or_default();
        if env.spec.pool_size() <= 0 {
            self.manager.cleanup_pool(&uid).await?;
            return Ok(());
        }
        let (pool, created) = self.manager.get_pool(env.clone()).await?;
        if !created {
            pool.update_deployment(env).await?;
        }
        Ok(())
    }
}

struct EnvTeardown {
    manager: Arc<GenericPoolManager>,
    pods: Arc<Store<Pod>>,
    pod_cleanup: WorkQueue<PodKey>,
}

#[async_trait]
impl WorkHandler<DeletedEnv> for EnvTeardown {
    async fn handle(&self, deleted: &DeletedEnv) -> anyhow::Result<()> {
        let env = &deleted.0;
        let uid = deleted.uid();
        self.manager.cleanup_pool(&uid).await?;
        let dropped = self.manager.context().cache.delete_by_environment(&uid).await?;

        let namespace = self.manager.pool_namespace(env);
        let selector: BTreeMap<String, String> = labels([
            (LABEL_EXECUTOR_TYPE, ExecutorType::Poolmgr.as_ref()),
            (LABEL_ENVIRONMENT_NAME, env.name_any().as_str()),
            (
                LABEL_ENVIRONMENT_NAMESPACE,
                env.namespace().unwrap_or_default().as_str(),
            ),
            (LABEL_MANAGED, "false"),
        ]);
        let mut queued = 0;
        for pod in self.pods.list_namespace(&namespace) {
            if labels_match(Some(pod.labels()), &selector) && is_pod_active(&pod) {
                self.pod_cleanup.add(PodKey::of(&pod));
                queued += 1;
            }
        }
        info!(
            environment = %env.name_any(),
            dropped = dropped.len(),
            queued,
            "tore down pool of deleted environment"
        );
        Ok(())
    }
}

struct PodCleanup {
    manager: Arc<GenericPoolManager>,
    pods: Arc<Store<Pod>>,
}

#[async_trait]
impl WorkHandler<PodKey> for PodCleanup {
    async fn handle(&self, key: &PodKey) -> anyhow::Result<()> {
        let Some(pod) = self.pods.get(&key.namespace, &key.name) else {
            return Ok(());
        };
        if !is_pod_active(&pod) {
            return Ok(());
        }
        let ctx = self.manager.context();
        if let Some(uid) = pod.uid() {
            ctx.cache.delete_by_object_uid(&uid).await?;
        }
        delete_ignore_missing(
            ctx.cluster.pods.as_ref(),
            &key.namespace,
            &key.name,
            Propagation::Background,
        )
        .await?;
        info!(pod = %key.name, namespace = %key.namespace, "deleted specialized pod");
        Ok(())
    }
}

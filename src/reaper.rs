//! Removal of objects the executor no longer needs: objects owned by a
//! cache entry, residue of previous executor processes and stale fetcher
//! role-binding subjects.

use std::{collections::BTreeSet, sync::Arc};

use data_model::{
    ExecutorType,
    ObjectKind,
    ObjectRef,
    ANNOTATION_EXECUTOR_INSTANCE_ID,
    FETCHER_SERVICE_ACCOUNT,
    LABEL_EXECUTOR_TYPE,
};
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{delete_ignore_missing, labels, Cluster, ClusterObject, ObjectApi, Propagation},
    config::ServerConfig,
    error::ExecutorResult,
    rbac::{remove_subjects, MANAGED_ROLE_BINDINGS},
};

const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Deletes the object `obj` refers to. A missing object counts as deleted.
pub async fn cleanup_kube_object(cluster: &Cluster, obj: &ObjectRef) -> ExecutorResult<()> {
    let (namespace, name) = (obj.namespace.as_str(), obj.name.as_str());
    match obj.kind {
        ObjectKind::Pod => {
            delete_ignore_missing(cluster.pods.as_ref(), namespace, name, Propagation::Background)
                .await?
        }
        ObjectKind::Service => {
            delete_ignore_missing(
                cluster.services.as_ref(),
                namespace,
                name,
                Propagation::Background,
            )
            .await?
        }
        ObjectKind::Deployment => {
            delete_ignore_missing(
                cluster.deployments.as_ref(),
                namespace,
                name,
                Propagation::Background,
            )
            .await?
        }
        ObjectKind::HorizontalPodAutoscaler => {
            delete_ignore_missing(cluster.hpas.as_ref(), namespace, name, Propagation::Background)
                .await?
        }
    }
    debug!(object = %obj, "deleted kube object");
    Ok(())
}

/// Deletes every object in `objects`, logging failures instead of stopping.
pub async fn cleanup_kube_objects(cluster: &Cluster, objects: &[ObjectRef]) {
    for obj in objects {
        if let Err(err) = cleanup_kube_object(cluster, obj).await {
            error!(object = %obj, error = %err, "failed to delete kube object");
        }
    }
}

/// Instance id stamped on an object, from its annotations or, for objects
/// written by older executors, its labels.
pub fn owner_instance_id<K: Resource>(obj: &K) -> Option<String> {
    obj.annotations()
        .get(ANNOTATION_EXECUTOR_INSTANCE_ID)
        .or_else(|| obj.labels().get(ANNOTATION_EXECUTOR_INSTANCE_ID))
        .cloned()
}

/// True when `obj` was stamped by another executor process.
pub fn is_orphan<K: Resource>(obj: &K, instance_id: &str) -> bool {
    owner_instance_id(obj).is_some_and(|owner| owner != instance_id)
}

/// Deletes the objects of `executor` left behind by earlier executor
/// processes. Returns how many were deleted.
pub async fn cleanup_orphans<K: ClusterObject>(
    api: &dyn ObjectApi<K>,
    executor: ExecutorType,
    instance_id: &str,
) -> ExecutorResult<usize> {
    let kind = K::kind(&());
    let selector = labels([(LABEL_EXECUTOR_TYPE, executor.as_ref())]);
    let mut deleted = 0;
    for obj in api.list(None, &selector).await? {
        if !is_orphan(&obj, instance_id) {
            continue;
        }
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        match delete_ignore_missing(api, &namespace, &name, Propagation::Background).await {
            Ok(()) => {
                info!(kind = %kind, namespace, name, executor = %executor, "deleted orphaned object");
                deleted += 1;
            }
            Err(err) => {
                error!(kind = %kind, namespace, name, error = %err, "failed to delete orphaned object")
            }
        }
    }
    Ok(deleted)
}

/// Prunes fetcher subjects from the executor's role bindings once no
/// function needs them anymore.
pub struct RoleBindingReaper {
    cluster: Cluster,
    config: Arc<ServerConfig>,
}

impl RoleBindingReaper {
    pub fn new(cluster: Cluster, config: Arc<ServerConfig>) -> Self {
        Self { cluster, config }
    }

    /// One pass over every managed role binding. Returns the number of
    /// removed subjects.
    pub async fn run_once(&self) -> ExecutorResult<usize> {
        let mut removed = 0;
        let bindings = self
            .cluster
            .role_bindings
            .list(None, &Default::default())
            .await?;
        for binding in bindings {
            let name = binding.name_any();
            let namespace = binding.namespace().unwrap_or_default();
            if namespace == KUBE_SYSTEM_NAMESPACE || !MANAGED_ROLE_BINDINGS.contains(&name.as_str()) {
                continue;
            }

            // Namespaces whose fetchers still read from this namespace.
            let functions = self
                .cluster
                .functions
                .list(Some(&namespace), &Default::default())
                .await?;
            let needed: BTreeSet<String> = functions
                .iter()
                .flat_map(|function| {
                    let function_ns = function.namespace().unwrap_or_default();
                    let env_ns = if function.spec.environment.namespace.is_empty() {
                        function_ns.clone()
                    } else {
                        function.spec.environment.namespace.clone()
                    };
                    [
                        self.config.resolve_function_namespace(&function_ns),
                        self.config.resolve_function_namespace(&env_ns),
                    ]
                })
                .collect();

            removed += remove_subjects(&self.cluster, &name, &namespace, |subject| {
                subject.name == FETCHER_SERVICE_ACCOUNT
                    && !subject
                        .namespace
                        .as_ref()
                        .is_some_and(|ns| needed.contains(ns))
            })
            .await?;
        }
        Ok(removed)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.role_binding_cleanup_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "pruned role binding subjects"),
                        Err(err) => warn!(error = %err, "role binding cleanup failed"),
                    }
                }
            }
        }
        debug!("role binding reaper stopped");
    }
}

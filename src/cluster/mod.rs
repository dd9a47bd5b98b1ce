//! Typed access to orchestrator objects.
//!
//! Everything the executor reads or writes goes through [`ObjectApi`]. The
//! production implementation wraps `kube::Api`; tests use the in-memory one.

pub mod informer;
pub mod kube_api;
#[cfg(test)]
pub mod memory;
pub mod work_queue;

use std::{collections::BTreeMap, fmt::Debug, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::{
    crd::{Environment, Function, Package},
    ANNOTATION_EXECUTOR_INSTANCE_ID,
};
use executor_utils::retry::{retry_with_backoff, Backoff};
use futures::stream::BoxStream;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, ReplicaSet},
        autoscaling::v1::HorizontalPodAutoscaler,
        core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount},
        rbac::v1::RoleBinding,
    },
    NamespaceResourceScope,
};
use kube::{runtime::watcher, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("cluster unavailable: {0}")]
    Transient(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => ClusterError::NotFound(resp.message),
                409 if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
                409 => ClusterError::Conflict(resp.message),
                400 | 422 => ClusterError::Invalid(resp.message),
                _ => ClusterError::Transient(resp.message),
            },
            other => ClusterError::Transient(other.to_string()),
        }
    }
}

impl From<watcher::Error> for ClusterError {
    fn from(err: watcher::Error) -> Self {
        ClusterError::Transient(err.to_string())
    }
}

/// Bounds shared by every object type the executor handles.
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Deletion propagation for dependents (replica sets and pods).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Background,
    Foreground,
    Orphan,
}

#[async_trait]
pub trait ObjectApi<K: ClusterObject>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> ClusterResult<K>;

    /// Lists objects carrying every label in `labels`, across all namespaces
    /// when `namespace` is `None`.
    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<K>>;

    async fn create(&self, namespace: &str, obj: &K) -> ClusterResult<K>;

    /// Replaces the object; a stale resourceVersion yields `Conflict`.
    async fn replace(&self, namespace: &str, obj: &K) -> ClusterResult<K>;

    /// Applies a JSON merge patch.
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> ClusterResult<K>;

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> ClusterResult<K>;

    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation)
        -> ClusterResult<()>;

    fn watch(&self) -> BoxStream<'static, ClusterResult<watcher::Event<K>>>;

    async fn get_opt(&self, namespace: &str, name: &str) -> ClusterResult<Option<K>> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(ClusterError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Typed handles to every object kind the executor reads or writes.
#[derive(Clone)]
pub struct Cluster {
    pub pods: Arc<dyn ObjectApi<Pod>>,
    pub deployments: Arc<dyn ObjectApi<Deployment>>,
    pub replica_sets: Arc<dyn ObjectApi<ReplicaSet>>,
    pub services: Arc<dyn ObjectApi<Service>>,
    pub hpas: Arc<dyn ObjectApi<HorizontalPodAutoscaler>>,
    pub role_bindings: Arc<dyn ObjectApi<RoleBinding>>,
    pub service_accounts: Arc<dyn ObjectApi<ServiceAccount>>,
    pub secrets: Arc<dyn ObjectApi<Secret>>,
    pub config_maps: Arc<dyn ObjectApi<ConfigMap>>,
    pub functions: Arc<dyn ObjectApi<Function>>,
    pub environments: Arc<dyn ObjectApi<Environment>>,
    pub packages: Arc<dyn ObjectApi<Package>>,
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// True when every pair in `selector` is present in `labels`.
pub fn labels_match(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Re-runs a read-modify-write sequence when it loses an optimistic lock.
pub async fn retry_on_conflict<T, F, Fut>(description: &str, attempt_fn: F) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClusterResult<T>>,
{
    retry_with_backoff(
        3,
        Backoff::Fixed(Duration::from_millis(50)),
        description,
        attempt_fn,
        |err: &ClusterError| err.is_conflict(),
    )
    .await
}

/// Deletes an object, treating an already missing object as deleted.
pub async fn delete_ignore_missing<K: ClusterObject>(
    api: &dyn ObjectApi<K>,
    namespace: &str,
    name: &str,
    propagation: Propagation,
) -> ClusterResult<()> {
    match api.delete(namespace, name, propagation).await {
        Err(ClusterError::NotFound(_)) => Ok(()),
        other => other,
    }
}

/// How [`create_or_adopt`] came by the object it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Created,
    /// Existed under another executor instance and was rewritten to ours.
    Adopted,
    /// Already carried our instance id.
    Owned,
}

/// Overlays `desired` onto `current`. Fields `desired` leaves unset, such as
/// an allocated cluster IP, keep their current value. Labels and
/// annotations are replaced by the desired sets.
fn claimed<K: ClusterObject>(current: &K, desired: &K) -> ClusterResult<K> {
    let invalid = |e: serde_json::Error| ClusterError::Invalid(e.to_string());
    let mut doc = serde_json::to_value(current).map_err(invalid)?;
    let overlay = serde_json::to_value(desired).map_err(invalid)?;
    json_patch::merge(&mut doc, &overlay);
    let mut claimed: K = serde_json::from_value(doc).map_err(invalid)?;
    let meta = claimed.meta_mut();
    meta.labels = desired.meta().labels.clone();
    meta.annotations = desired.meta().annotations.clone();
    Ok(claimed)
}

/// Creates `desired`, or claims an existing object of the same name that
/// another executor instance stamped.
pub async fn create_or_adopt<K: ClusterObject>(
    api: &dyn ObjectApi<K>,
    namespace: &str,
    desired: &K,
    instance_id: &str,
) -> ClusterResult<(K, Claim)> {
    let name = desired.name_any();
    let name = name.as_str();
    let description = format!("{} {namespace}/{name}", K::kind(&()));
    for _ in 0..2 {
        if let Some(existing) = api.get_opt(namespace, name).await? {
            if existing
                .annotations()
                .get(ANNOTATION_EXECUTOR_INSTANCE_ID)
                .is_some_and(|owner| owner == instance_id)
            {
                return Ok((existing, Claim::Owned));
            }
            let adopted = retry_on_conflict(&description, move || async move {
                let current = api.get(namespace, name).await?;
                api.replace(namespace, &claimed(&current, desired)?).await
            })
            .await?;
            return Ok((adopted, Claim::Adopted));
        }
        match api.create(namespace, desired).await {
            Ok(created) => return Ok((created, Claim::Created)),
            // Lost a creation race; claim the winner.
            Err(ClusterError::AlreadyExists(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(ClusterError::Conflict(format!(
        "{description} keeps changing while being claimed"
    )))
}

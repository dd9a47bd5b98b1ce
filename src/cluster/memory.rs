//! In-memory [`ObjectApi`] used by tests.
//!
//! Objects are stored as typed values keyed by `(namespace, name)`. Every
//! write bumps a cluster-wide resourceVersion counter, and watchers receive
//! the initial listing followed by live events.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use async_trait::async_trait;
use data_model::crd::{Environment, Function, Package};
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, ReplicaSet},
        autoscaling::v1::HorizontalPodAutoscaler,
        core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount},
        rbac::v1::RoleBinding,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{runtime::watcher, ResourceExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    labels_match,
    Cluster,
    ClusterError,
    ClusterObject,
    ClusterResult,
    ObjectApi,
    Propagation,
};

#[derive(Clone)]
enum Change<K> {
    Apply(K),
    Delete(K),
}

type Key = (String, String);

pub struct MemoryApi<K> {
    objects: Mutex<BTreeMap<Key, K>>,
    versions: Arc<AtomicU64>,
    changes: broadcast::Sender<Change<K>>,
}

impl<K: ClusterObject> MemoryApi<K> {
    fn new(versions: Arc<AtomicU64>) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            versions,
            changes,
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn describe(namespace: &str, name: &str) -> String {
        format!("{} {}/{}", K::kind(&()), namespace, name)
    }

    fn spec_of(obj: &K) -> serde_json::Value {
        serde_json::to_value(obj)
            .ok()
            .and_then(|v| v.get("spec").cloned())
            .unwrap_or_default()
    }

    /// Stores `obj` as the new state of an existing object, keeping its
    /// identity and bumping resourceVersion and, on spec changes, generation.
    fn commit(&self, previous: &K, mut obj: K) -> K {
        let version = self.next_version();
        let spec_changed = Self::spec_of(previous) != Self::spec_of(&obj);
        let meta = obj.meta_mut();
        meta.uid = previous.meta().uid.clone();
        meta.namespace = previous.meta().namespace.clone();
        meta.name = previous.meta().name.clone();
        meta.creation_timestamp = previous.meta().creation_timestamp.clone();
        meta.resource_version = Some(version.to_string());
        let generation = previous.meta().generation.unwrap_or(1);
        meta.generation = Some(if spec_changed {
            generation + 1
        } else {
            generation
        });
        obj
    }

    fn publish(&self, change: Change<K>) {
        let _ = self.changes.send(change);
    }

    /// Test helper: every stored object, regardless of namespace.
    pub fn all(&self) -> Vec<K> {
        self.objects
            .lock()
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> ClusterResult<std::sync::MutexGuard<'_, BTreeMap<Key, K>>> {
        self.objects
            .lock()
            .map_err(|_| ClusterError::Transient("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl<K: ClusterObject> ObjectApi<K> for MemoryApi<K> {
    async fn get(&self, namespace: &str, name: &str) -> ClusterResult<K> {
        self.lock()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(Self::describe(namespace, name)))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<K>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |n| n == ns))
            .filter(|(_, obj)| labels_match(obj.meta().labels.as_ref(), labels))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, obj: &K) -> ClusterResult<K> {
        let mut obj = obj.clone();
        let version = self.next_version();
        let meta = obj.meta_mut();
        if meta.name.is_none() {
            meta.name = meta
                .generate_name
                .as_ref()
                .map(|prefix| format!("{prefix}{version}"));
        }
        let name = meta
            .name
            .clone()
            .ok_or_else(|| ClusterError::Invalid("name is required".to_string()))?;
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(format!("uid-{version}"));
        meta.resource_version = Some(version.to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));

        {
            let mut objects = self.lock()?;
            let key = (namespace.to_string(), name.clone());
            if objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists(Self::describe(namespace, &name)));
            }
            objects.insert(key, obj.clone());
        }
        self.publish(Change::Apply(obj.clone()));
        Ok(obj)
    }

    async fn replace(&self, namespace: &str, obj: &K) -> ClusterResult<K> {
        let name = obj.name_any();
        let stored = {
            let mut objects = self.lock()?;
            let key = (namespace.to_string(), name.clone());
            let previous = objects
                .get(&key)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(Self::describe(namespace, &name)))?;
            if let Some(rv) = obj.meta().resource_version.as_ref() {
                if previous.meta().resource_version.as_ref() != Some(rv) {
                    return Err(ClusterError::Conflict(format!(
                        "{} has been modified",
                        Self::describe(namespace, &name)
                    )));
                }
            }
            let stored = self.commit(&previous, obj.clone());
            objects.insert(key, stored.clone());
            stored
        };
        self.publish(Change::Apply(stored.clone()));
        Ok(stored)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> ClusterResult<K> {
        let stored = {
            let mut objects = self.lock()?;
            let key = (namespace.to_string(), name.to_string());
            let previous = objects
                .get(&key)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(Self::describe(namespace, name)))?;
            let mut doc = serde_json::to_value(&previous)
                .map_err(|e| ClusterError::Invalid(e.to_string()))?;
            json_patch::merge(&mut doc, patch);
            let patched: K =
                serde_json::from_value(doc).map_err(|e| ClusterError::Invalid(e.to_string()))?;
            let stored = self.commit(&previous, patched);
            objects.insert(key, stored.clone());
            stored
        };
        self.publish(Change::Apply(stored.clone()));
        Ok(stored)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> ClusterResult<K> {
        self.patch(namespace, name, patch).await
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        _propagation: Propagation,
    ) -> ClusterResult<()> {
        let removed = self
            .lock()?
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClusterError::NotFound(Self::describe(namespace, name)))?;
        self.publish(Change::Delete(removed));
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, ClusterResult<watcher::Event<K>>> {
        // Subscribe before the snapshot so no write falls in between.
        let rx = self.changes.subscribe();
        let snapshot = self.all();

        let initial = std::iter::once(watcher::Event::Init)
            .chain(snapshot.into_iter().map(watcher::Event::InitApply))
            .chain(std::iter::once(watcher::Event::InitDone))
            .map(Ok);
        let live = BroadcastStream::new(rx).filter_map(|change| async move {
            match change {
                Ok(Change::Apply(obj)) => Some(Ok(watcher::Event::Apply(obj))),
                Ok(Change::Delete(obj)) => Some(Ok(watcher::Event::Delete(obj))),
                Err(_) => None,
            }
        });
        futures::stream::iter(initial).chain(live).boxed()
    }
}

/// An in-memory cluster with one store per object kind. Clones share the
/// stores.
#[derive(Clone)]
pub struct MemoryCluster {
    pub pods: Arc<MemoryApi<Pod>>,
    pub deployments: Arc<MemoryApi<Deployment>>,
    pub replica_sets: Arc<MemoryApi<ReplicaSet>>,
    pub services: Arc<MemoryApi<Service>>,
    pub hpas: Arc<MemoryApi<HorizontalPodAutoscaler>>,
    pub role_bindings: Arc<MemoryApi<RoleBinding>>,
    pub service_accounts: Arc<MemoryApi<ServiceAccount>>,
    pub secrets: Arc<MemoryApi<Secret>>,
    pub config_maps: Arc<MemoryApi<ConfigMap>>,
    pub functions: Arc<MemoryApi<Function>>,
    pub environments: Arc<MemoryApi<Environment>>,
    pub packages: Arc<MemoryApi<Package>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        let versions = Arc::new(AtomicU64::new(100));
        Self {
            pods: Arc::new(MemoryApi::new(versions.clone())),
            deployments: Arc::new(MemoryApi::new(versions.clone())),
            replica_sets: Arc::new(MemoryApi::new(versions.clone())),
            services: Arc::new(MemoryApi::new(versions.clone())),
            hpas: Arc::new(MemoryApi::new(versions.clone())),
            role_bindings: Arc::new(MemoryApi::new(versions.clone())),
            service_accounts: Arc::new(MemoryApi::new(versions.clone())),
            secrets: Arc::new(MemoryApi::new(versions.clone())),
            config_maps: Arc::new(MemoryApi::new(versions.clone())),
            functions: Arc::new(MemoryApi::new(versions.clone())),
            environments: Arc::new(MemoryApi::new(versions.clone())),
            packages: Arc::new(MemoryApi::new(versions)),
        }
    }
}

impl MemoryCluster {
    pub fn cluster(&self) -> Cluster {
        Cluster {
            pods: self.pods.clone(),
            deployments: self.deployments.clone(),
            replica_sets: self.replica_sets.clone(),
            services: self.services.clone(),
            hpas: self.hpas.clone(),
            role_bindings: self.role_bindings.clone(),
            service_accounts: self.service_accounts.clone(),
            secrets: self.secrets.clone(),
            config_maps: self.config_maps.clone(),
            functions: self.functions.clone(),
            environments: self.environments.clone(),
            packages: self.packages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::cluster::labels;

    fn config_map(name: &str, data: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels([("app", "test")])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("key".to_string(), data.to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_replace_conflict() -> Result<()> {
        let cluster = MemoryCluster::default();
        let api = cluster.config_maps.clone();

        let created = api.create("default", &config_map("cm", "a")).await?;
        assert!(created.metadata.uid.is_some());
        assert!(api
            .create("default", &config_map("cm", "b"))
            .await
            .unwrap_err()
            .is_already_exists());

        let mut update = created.clone();
        update.data = Some(BTreeMap::from([("key".to_string(), "b".to_string())]));
        let replaced = api.replace("default", &update).await?;
        assert_ne!(replaced.metadata.resource_version, created.metadata.resource_version);
        assert_eq!(replaced.metadata.uid, created.metadata.uid);

        // `update` still carries the old resourceVersion.
        assert!(api.replace("default", &update).await.unwrap_err().is_conflict());
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_patch_and_list() -> Result<()> {
        let cluster = MemoryCluster::default();
        let api = cluster.config_maps.clone();
        api.create("default", &config_map("one", "a")).await?;
        api.create("other", &config_map("two", "a")).await?;

        let patched = api
            .patch(
                "default",
                "one",
                &serde_json::json!({"metadata": {"labels": {"app": null, "patched": "yes"}}}),
            )
            .await?;
        let patched_labels = patched.metadata.labels.unwrap_or_default();
        assert_eq!(patched_labels.get("patched").map(String::as_str), Some("yes"));
        assert!(!patched_labels.contains_key("app"));

        assert_eq!(api.list(None, &labels([("app", "test")])).await?.len(), 1);
        assert_eq!(api.list(Some("default"), &BTreeMap::new()).await?.len(), 1);
        assert!(api.delete("default", "missing", Propagation::Background).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_lists_then_streams() -> Result<()> {
        let cluster = MemoryCluster::default();
        let api = cluster.config_maps.clone();
        api.create("default", &config_map("one", "a")).await?;

        let mut events = api.watch();
        assert!(matches!(events.next().await, Some(Ok(watcher::Event::Init))));
        assert!(matches!(events.next().await, Some(Ok(watcher::Event::InitApply(_)))));
        assert!(matches!(events.next().await, Some(Ok(watcher::Event::InitDone))));

        api.delete("default", "one", Propagation::Background).await?;
        match events.next().await {
            Some(Ok(watcher::Event::Delete(obj))) => assert_eq!(obj.name_any(), "one"),
            other => anyhow::bail!("unexpected event {:?}", other.map(|e| e.is_ok())),
        }
        Ok(())
    }
}

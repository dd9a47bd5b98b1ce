use std::{collections::BTreeMap, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
    runtime::{watcher, WatchStreamExt},
    Api,
    Client,
};

use super::{label_selector, Cluster, ClusterObject, ClusterResult, ObjectApi, Propagation};

/// [`ObjectApi`] backed by the orchestrator's API server.
pub struct KubeApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ClusterObject> KubeApi<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl From<Propagation> for PropagationPolicy {
    fn from(p: Propagation) -> Self {
        match p {
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

#[async_trait]
impl<K: ClusterObject> ObjectApi<K> for KubeApi<K> {
    async fn get(&self, namespace: &str, name: &str) -> ClusterResult<K> {
        Ok(self.namespaced(namespace).get(name).await?)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => self.namespaced(ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, namespace: &str, obj: &K) -> ClusterResult<K> {
        Ok(self
            .namespaced(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(&self, namespace: &str, obj: &K) -> ClusterResult<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        Ok(self
            .namespaced(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> ClusterResult<K> {
        Ok(self
            .namespaced(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> ClusterResult<K> {
        Ok(self
            .namespaced(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> ClusterResult<()> {
        let params = DeleteParams {
            propagation_policy: Some(propagation.into()),
            ..Default::default()
        };
        self.namespaced(namespace).delete(name, &params).await?;
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, ClusterResult<watcher::Event<K>>> {
        let api: Api<K> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(Into::into)
            .boxed()
    }
}

impl Cluster {
    /// Connects using the in-cluster service account or the local kubeconfig.
    pub async fn from_kube() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self {
            pods: Arc::new(KubeApi::new(client.clone())),
            deployments: Arc::new(KubeApi::new(client.clone())),
            replica_sets: Arc::new(KubeApi::new(client.clone())),
            services: Arc::new(KubeApi::new(client.clone())),
            hpas: Arc::new(KubeApi::new(client.clone())),
            role_bindings: Arc::new(KubeApi::new(client.clone())),
            service_accounts: Arc::new(KubeApi::new(client.clone())),
            secrets: Arc::new(KubeApi::new(client.clone())),
            config_maps: Arc::new(KubeApi::new(client.clone())),
            functions: Arc::new(KubeApi::new(client.clone())),
            environments: Arc::new(KubeApi::new(client.clone())),
            packages: Arc::new(KubeApi::new(client)),
        })
    }
}

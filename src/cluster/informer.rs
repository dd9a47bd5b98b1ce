use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{self, store::Writer, ObjectRef},
        watcher::Event,
    },
    ResourceExt,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClusterObject, ObjectApi};

/// Local read-only copy of the objects seen by an informer, backed by a
/// reflector store.
pub struct Store<K: ClusterObject> {
    reader: reflector::Store<K>,
}

impl<K: ClusterObject> Store<K> {
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.reader.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.reader.state()
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.reader
            .state()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    fn snapshot(&self) -> HashMap<ObjectRef<K>, Arc<K>> {
        self.reader
            .state()
            .into_iter()
            .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
            .collect()
    }
}

/// Callbacks invoked by an [`Informer`], in delivery order. Handlers run on
/// the informer task, so long work should be queued or spawned.
#[async_trait]
pub trait EventHandler<K: ClusterObject>: Send + Sync {
    async fn on_add(&self, _obj: Arc<K>) {}

    async fn on_update(&self, _old: Arc<K>, _new: Arc<K>) {}

    async fn on_delete(&self, _obj: Arc<K>) {}
}

pub struct Informer<K: ClusterObject> {
    name: String,
    api: Arc<dyn ObjectApi<K>>,
    store: Arc<Store<K>>,
    writer: Mutex<Option<Writer<K>>>,
    handlers: Mutex<Vec<Arc<dyn EventHandler<K>>>>,
    synced_tx: watch::Sender<bool>,
}

impl<K: ClusterObject> Informer<K> {
    pub fn new(name: &str, api: Arc<dyn ObjectApi<K>>) -> Arc<Self> {
        let (reader, writer) = reflector::store();
        let (synced_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.to_string(),
            api,
            store: Arc::new(Store { reader }),
            writer: Mutex::new(Some(writer)),
            handlers: Mutex::new(Vec::new()),
            synced_tx,
        })
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(handler);
        }
    }

    pub fn store(&self) -> Arc<Store<K>> {
        self.store.clone()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    /// Waits for the first full listing to land in the store and reach the
    /// handlers.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.synced_tx.subscribe();
        let synced = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
            Ok(Ok(_))
        );
        synced
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers
            .lock()
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }

    /// Feeds the watch into the store and dispatches the resulting changes.
    /// The store has a single writer, so only the first call runs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let writer = self.writer.lock().ok().and_then(|mut writer| writer.take());
        let Some(mut writer) = writer else {
            warn!(informer = %self.name, "informer is already running");
            return;
        };
        let mut events = self.api.watch();
        info!(informer = %self.name, "starting informer");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => event,
            };
            let event = match event {
                None => {
                    warn!(informer = %self.name, "watch stream ended");
                    break;
                }
                Some(Err(err)) => {
                    warn!(informer = %self.name, error = %err, "watch error");
                    continue;
                }
                Some(Ok(event)) => event,
            };
            match &event {
                Event::Init | Event::InitApply(_) => writer.apply_watcher_event(&event),
                Event::InitDone => {
                    let previous = self.store.snapshot();
                    writer.apply_watcher_event(&event);
                    self.dispatch_relist(previous).await;
                    if !self.synced_tx.send_replace(true) {
                        info!(informer = %self.name, objects = self.store.len(), "informer synced");
                    }
                }
                Event::Apply(obj) => {
                    let old = self.store.reader.get(&ObjectRef::from_obj(obj));
                    writer.apply_watcher_event(&event);
                    self.dispatch_apply(old, Arc::new(obj.clone())).await;
                }
                Event::Delete(obj) => {
                    let old = self.store.reader.get(&ObjectRef::from_obj(obj));
                    writer.apply_watcher_event(&event);
                    let removed = old.unwrap_or_else(|| Arc::new(obj.clone()));
                    for handler in self.handlers() {
                        handler.on_delete(removed.clone()).await;
                    }
                }
            }
        }
        debug!(informer = %self.name, "informer stopped");
    }

    async fn dispatch_apply(&self, old: Option<Arc<K>>, obj: Arc<K>) {
        match old {
            None => {
                for handler in self.handlers() {
                    handler.on_add(obj.clone()).await;
                }
            }
            Some(old) if old.resource_version() != obj.resource_version() => {
                for handler in self.handlers() {
                    handler.on_update(old.clone(), obj.clone()).await;
                }
            }
            Some(_) => {}
        }
    }

    /// Synthesizes the events missed while the watch was down by diffing
    /// the store before and after a full listing.
    async fn dispatch_relist(&self, mut previous: HashMap<ObjectRef<K>, Arc<K>>) {
        let changes: Vec<(Option<Arc<K>>, Arc<K>)> = self
            .store
            .list()
            .into_iter()
            .map(|obj| (previous.remove(&ObjectRef::from_obj(obj.as_ref())), obj))
            .collect();
        for gone in previous.into_values() {
            for handler in self.handlers() {
                handler.on_delete(gone.clone()).await;
            }
        }
        for (old, obj) in changes {
            self.dispatch_apply(old, obj).await;
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
    use crate::{
        cluster::{memory::MemoryCluster, Propagation},
        testing::wait_for,
    };

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<ConfigMap> for Recorder {
        async fn on_add(&self, obj: Arc<ConfigMap>) {
            self.events.lock().unwrap().push(format!("add {}", obj.name_any()));
        }

        async fn on_update(&self, _old: Arc<ConfigMap>, new: Arc<ConfigMap>) {
            self.events.lock().unwrap().push(format!("update {}", new.name_any()));
        }

        async fn on_delete(&self, obj: Arc<ConfigMap>) {
            self.events.lock().unwrap().push(format!("delete {}", obj.name_any()));
        }
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_informer_dispatches_events() -> Result<()> {
        let cluster = MemoryCluster::default();
        cluster.config_maps.create("default", &config_map("early")).await?;

        let informer = Informer::new("configmaps", cluster.config_maps.clone());
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());
        let cancel = CancellationToken::new();
        tokio::spawn(informer.clone().run(cancel.clone()));
        assert!(informer.wait_synced(Duration::from_secs(5)).await);
        assert!(informer.store().get("default", "early").is_some());

        cluster.config_maps.create("default", &config_map("late")).await?;
        cluster
            .config_maps
            .patch(
                "default",
                "late",
                &serde_json::json!({"data": {"k": "v"}}),
            )
            .await?;
        cluster
            .config_maps
            .delete("default", "early", Propagation::Background)
            .await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["add early", "add late", "update late", "delete early"]
        );
        assert!(informer.store().get("default", "early").is_none());
        assert_eq!(informer.store().list_namespace("default").len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_has_a_single_writer() -> Result<()> {
        let cluster = MemoryCluster::default();
        cluster.config_maps.create("default", &config_map("one")).await?;

        let informer = Informer::new("configmaps", cluster.config_maps.clone());
        let cancel = CancellationToken::new();
        tokio::spawn(informer.clone().run(cancel.clone()));
        assert!(informer.wait_synced(Duration::from_secs(5)).await);

        // The writer is taken, so a second run returns at once.
        tokio::time::timeout(Duration::from_secs(1), informer.clone().run(cancel.clone())).await?;

        cluster.config_maps.create("other", &config_map("two")).await?;
        let store = informer.store();
        let store = &store;
        wait_for("second object in store", Duration::from_secs(5), move || async move {
            Ok(store.get("other", "two").is_some())
        })
        .await?;
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.list_namespace("other").len(), 1);
        assert!(store.get("default", "two").is_none());
        cancel.cancel();
        Ok(())
    }
}

//! Refreshes functions whose secrets or config maps changed.

use std::sync::Arc;

use async_trait::async_trait;
use data_model::crd::Function;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Resource, ResourceExt};
use tracing::{error, info};

use crate::{
    cluster::informer::{EventHandler, Store},
    executor::Executor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    Secret,
    ConfigMap,
}

impl RefKind {
    fn as_str(self) -> &'static str {
        match self {
            RefKind::Secret => "secret",
            RefKind::ConfigMap => "configmap",
        }
    }
}

pub struct ConfigSecretController {
    executor: Arc<Executor>,
    functions: Arc<Store<Function>>,
}

fn references(function: &Function, kind: RefKind, namespace: &str, name: &str) -> bool {
    let function_namespace = function.namespace().unwrap_or_default();
    let matches = |ref_namespace: &str, ref_name: &str| {
        let ref_namespace = if ref_namespace.is_empty() {
            function_namespace.as_str()
        } else {
            ref_namespace
        };
        ref_name == name && ref_namespace == namespace
    };
    match kind {
        RefKind::Secret => function
            .spec
            .secrets
            .iter()
            .any(|s| matches(&s.namespace, &s.name)),
        RefKind::ConfigMap => function
            .spec
            .configmaps
            .iter()
            .any(|c| matches(&c.namespace, &c.name)),
    }
}

impl ConfigSecretController {
    pub fn new(executor: Arc<Executor>, functions: Arc<Store<Function>>) -> Self {
        Self {
            executor,
            functions,
        }
    }

    /// Refreshes every function referencing the changed object. Returns how
    /// many were refreshed.
    async fn refresh_referencing<K: Resource>(&self, kind: RefKind, old: &K, new: &K) -> usize {
        if old.resource_version() == new.resource_version() {
            return 0;
        }
        let namespace = new.namespace().unwrap_or_default();
        let name = new.name_any();
        let mut refreshed = 0;
        for function in self.functions.list_namespace(&namespace) {
            if !references(&function, kind, &namespace, &name) {
                continue;
            }
            let result = match self.executor.strategy(function.spec.executor_type()) {
                Ok(strategy) => strategy.refresh_function(&function).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => refreshed += 1,
                Err(err) => error!(
                    function_name = %function.name_any(),
                    function_namespace = %namespace,
                    phase = "refresh",
                    error = %err,
                    "failed to refresh function after {} change",
                    kind.as_str()
                ),
            }
        }
        if refreshed > 0 {
            info!(kind = kind.as_str(), name, namespace, refreshed, "refreshed functions");
        }
        refreshed
    }
}

#[async_trait]
impl EventHandler<Secret> for ConfigSecretController {
    async fn on_update(&self, old: Arc<Secret>, new: Arc<Secret>) {
        self.refresh_referencing(RefKind::Secret, old.as_ref(), new.as_ref())
            .await;
    }
}

#[async_trait]
impl EventHandler<ConfigMap> for ConfigSecretController {
    async fn on_update(&self, old: Arc<ConfigMap>, new: Arc<ConfigMap>) {
        self.refresh_referencing(RefKind::ConfigMap, old.as_ref(), new.as_ref())
            .await;
    }
}

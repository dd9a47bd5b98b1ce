//! Service account and role binding plumbing for the fetcher sidecar.
//!
//! Fetchers run under the `fission-fetcher` service account of the namespace
//! their pod lives in. Reading packages, secrets and config maps from other
//! namespaces is granted by adding that account as a subject of a role
//! binding in the namespace being read.

use std::collections::BTreeMap;

use data_model::{crd::Function, FETCHER_SERVICE_ACCOUNT};
use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{RoleBinding, RoleRef, Subject},
};
use kube::{api::ObjectMeta, ResourceExt};
use tracing::{debug, info};

use crate::{
    cluster::{delete_ignore_missing, retry_on_conflict, Cluster, ClusterError, Propagation},
    error::ExecutorResult,
};

pub const PACKAGE_GETTER_ROLE_BINDING: &str = "package-getter-rb";
pub const PACKAGE_GETTER_CLUSTER_ROLE: &str = "package-getter";
pub const SECRET_CONFIGMAP_GETTER_ROLE_BINDING: &str = "secret-configmap-getter-rb";
pub const SECRET_CONFIGMAP_GETTER_CLUSTER_ROLE: &str = "secret-configmap-getter";

/// Role bindings the executor manages and the reaper may prune.
pub const MANAGED_ROLE_BINDINGS: [&str; 2] = [
    PACKAGE_GETTER_ROLE_BINDING,
    SECRET_CONFIGMAP_GETTER_ROLE_BINDING,
];

const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";
const CLUSTER_ROLE_KIND: &str = "ClusterRole";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

fn subject(service_account: &str, namespace: &str) -> Subject {
    Subject {
        kind: SERVICE_ACCOUNT_KIND.to_string(),
        name: service_account.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

fn has_subject(binding: &RoleBinding, service_account: &str, namespace: &str) -> bool {
    binding.subjects.iter().flatten().any(|s| {
        s.kind == SERVICE_ACCOUNT_KIND
            && s.name == service_account
            && s.namespace.as_deref() == Some(namespace)
    })
}

/// Creates the fetcher service account in `namespace` unless it exists.
pub async fn ensure_fetcher_service_account(cluster: &Cluster, namespace: &str) -> ExecutorResult<()> {
    if cluster
        .service_accounts
        .get_opt(namespace, FETCHER_SERVICE_ACCOUNT)
        .await?
        .is_some()
    {
        return Ok(());
    }
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(FETCHER_SERVICE_ACCOUNT.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match cluster.service_accounts.create(namespace, &account).await {
        Ok(_) => {
            info!(namespace, "created fetcher service account");
            Ok(())
        }
        Err(ClusterError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Makes `service_account` of `sa_namespace` a subject of the role binding
/// `binding` in `namespace`, creating the binding when missing.
pub async fn setup_role_binding(
    cluster: &Cluster,
    binding: &str,
    namespace: &str,
    cluster_role: &str,
    service_account: &str,
    sa_namespace: &str,
) -> ExecutorResult<()> {
    let description = format!("role binding {namespace}/{binding}");
    retry_on_conflict(&description, move || async move {
        match cluster.role_bindings.get_opt(namespace, binding).await? {
            Some(existing) if has_subject(&existing, service_account, sa_namespace) => Ok(()),
            Some(mut existing) => {
                existing
                    .subjects
                    .get_or_insert_with(Vec::new)
                    .push(subject(service_account, sa_namespace));
                cluster.role_bindings.replace(namespace, &existing).await?;
                debug!(binding, namespace, service_account, sa_namespace, "added role binding subject");
                Ok(())
            }
            None => {
                let new_binding = RoleBinding {
                    metadata: ObjectMeta {
                        name: Some(binding.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    role_ref: RoleRef {
                        api_group: RBAC_API_GROUP.to_string(),
                        kind: CLUSTER_ROLE_KIND.to_string(),
                        name: cluster_role.to_string(),
                    },
                    subjects: Some(vec![subject(service_account, sa_namespace)]),
                };
                match cluster.role_bindings.create(namespace, &new_binding).await {
                    Ok(_) => {
                        info!(binding, namespace, "created role binding");
                        Ok(())
                    }
                    // Lost a creation race; go around again and add the subject.
                    Err(ClusterError::AlreadyExists(msg)) => Err(ClusterError::Conflict(msg)),
                    Err(err) => Err(err),
                }
            }
        }
    })
    .await?;
    Ok(())
}

/// Drops the subjects for which `remove` returns true. The binding is
/// deleted once no subject is left. Returns the number of removed subjects.
pub async fn remove_subjects<F>(
    cluster: &Cluster,
    binding: &str,
    namespace: &str,
    remove: F,
) -> ExecutorResult<usize>
where
    F: Fn(&Subject) -> bool + Sync,
{
    let description = format!("role binding {namespace}/{binding}");
    let remove = &remove;
    let removed = retry_on_conflict(&description, move || async move {
        let Some(mut existing) = cluster.role_bindings.get_opt(namespace, binding).await? else {
            return Ok(0);
        };
        let subjects = existing.subjects.take().unwrap_or_default();
        let before = subjects.len();
        let kept: Vec<Subject> = subjects.into_iter().filter(|s| !remove(s)).collect();
        let removed = before - kept.len();
        if kept.is_empty() {
            delete_ignore_missing(
                cluster.role_bindings.as_ref(),
                namespace,
                binding,
                Propagation::Background,
            )
            .await?;
            info!(binding, namespace, "deleted role binding without subjects");
        } else if removed > 0 {
            existing.subjects = Some(kept);
            cluster.role_bindings.replace(namespace, &existing).await?;
        }
        Ok(removed)
    })
    .await?;
    Ok(removed)
}

/// Grants the fetcher running in `pod_namespace` read access to the
/// function's package, secrets and config maps.
pub async fn setup_fetcher_access(
    cluster: &Cluster,
    function: &Function,
    pod_namespace: &str,
) -> ExecutorResult<()> {
    ensure_fetcher_service_account(cluster, pod_namespace).await?;

    let package_namespace = &function.spec.package.package_ref.namespace;
    let package_namespace = if package_namespace.is_empty() {
        function.namespace().unwrap_or_default()
    } else {
        package_namespace.clone()
    };
    setup_role_binding(
        cluster,
        PACKAGE_GETTER_ROLE_BINDING,
        &package_namespace,
        PACKAGE_GETTER_CLUSTER_ROLE,
        FETCHER_SERVICE_ACCOUNT,
        pod_namespace,
    )
    .await?;

    if !function.spec.secrets.is_empty() || !function.spec.configmaps.is_empty() {
        let function_namespace = function.namespace().unwrap_or_default();
        setup_role_binding(
            cluster,
            SECRET_CONFIGMAP_GETTER_ROLE_BINDING,
            &function_namespace,
            SECRET_CONFIGMAP_GETTER_CLUSTER_ROLE,
            FETCHER_SERVICE_ACCOUNT,
            pod_namespace,
        )
        .await?;
    }
    Ok(())
}

/// Subjects grouped by the namespace their service account lives in.
pub fn subjects_by_namespace(binding: &RoleBinding) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for s in binding.subjects.iter().flatten() {
        if s.kind != SERVICE_ACCOUNT_KIND {
            continue;
        }
        grouped
            .entry(s.namespace.clone().unwrap_or_default())
            .or_default()
            .push(s.name.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, time::Duration};

    use anyhow::Result;
    use data_model::{
        crd::{ConfigMapReference, Environment, Function},
        test_objects::tests::{test_environment, test_function, TEST_NAMESPACE},
        ExecutorType,
        FunctionIdentity,
        FunctionKey,
        ANNOTATION_EXECUTOR_INSTANCE_ID,
        ANNOTATION_SVC_HOST,
        ENV_RESOURCE_VERSION_COUNT,
        LABEL_FUNCTION_UID,
    };
    use executor_client::ExecutorClient;
    use futures::future::join_all;
    use k8s_openapi::api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Pod},
    };
    use kube::{api::ObjectMeta, ResourceExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use crate::{
        cluster::{labels, memory::MemoryCluster, ObjectApi, Propagation},
        error::ExecutorError,
        newdeploy::objects::object_name,
        poolmgr::{
            deployment::{pool_deployment_name, pool_selector},
            pool::{is_pod_ready, pod_ip},
        },
        reaper::owner_instance_id,
        routes::create_routes,
        testing::{wait_for, TestService},
    };

    const POOL_NAMESPACE: &str = "fission-function";
    const WAIT: Duration = Duration::from_secs(10);

    async fn create_environment(ts: &TestService) -> Result<Environment> {
        Ok(ts
            .memory
            .environments
            .create(TEST_NAMESPACE, &test_environment("nodejs", "e-1"))
            .await?)
    }

    async fn create_function(ts: &TestService, function: Function) -> Result<Function> {
        Ok(ts.memory.functions.create(TEST_NAMESPACE, &function).await?)
    }

    async fn wait_for_pool(ts: &TestService, env: &Environment, ready: usize) -> Result<()> {
        let selector = pool_selector(env);
        let selector = &selector;
        wait_for("ready pool pods", WAIT, move || async move {
            Ok(ts
                .pods_matching(selector)
                .iter()
                .filter(|pod| is_pod_ready(pod))
                .count()
                >= ready)
        })
        .await
    }

    fn function_pods(ts: &TestService, function: &Function) -> Vec<Pod> {
        ts.pods_matching(&labels([(
            LABEL_FUNCTION_UID,
            function.uid().unwrap_or_default().as_str(),
        )]))
    }

    fn address_of(pod: &Pod) -> String {
        format!("{}:8888", pod_ip(pod).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_cold_start_specializes_one_pool_pod() -> Result<()> {
        let ts = TestService::new().await?;
        let env = create_environment(&ts).await?;
        let function = create_function(&ts, test_function("hello", "u-1", ExecutorType::Poolmgr)).await?;
        wait_for_pool(&ts, &env, 3).await?;

        let identity = FunctionIdentity::from_function(&function);
        let address = ts.service.executor.get_service_for_function(&identity).await?;

        let pods = function_pods(&ts, &function);
        assert_eq!(pods.len(), 1);
        assert_eq!(address, address_of(&pods[0]));
        assert_eq!(
            pods[0].annotations().get(ANNOTATION_EXECUTOR_INSTANCE_ID).map(String::as_str),
            Some(ts.service.instance_id())
        );
        assert_eq!(ts.fetcher.specialized(), 1);

        let entries = ts.service.cache.list_all().await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key(), FunctionKey::for_function(&function));

        // A warm request is served from the cache.
        let again = ts.service.executor.get_service_for_function(&identity).await?;
        assert_eq!(again, address);
        assert_eq!(ts.fetcher.specialized(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_burst_specializes_once() -> Result<()> {
        let ts = TestService::new().await?;
        let env = create_environment(&ts).await?;
        let function = create_function(&ts, test_function("hello", "u-1", ExecutorType::Poolmgr)).await?;
        wait_for_pool(&ts, &env, 3).await?;

        let identity = FunctionIdentity::from_function(&function);
        let executor = &ts.service.executor;
        let results = join_all((0..50).map(|_| executor.get_service_for_function(&identity))).await;
        let addresses = results.into_iter().collect::<Result<BTreeSet<_>, ExecutorError>>()?;

        assert_eq!(addresses.len(), 1);
        assert_eq!(ts.fetcher.specialized(), 1);
        assert_eq!(function_pods(&ts, &function).len(), 1);
        assert_eq!(ts.service.cache.list_all().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_newdeploy_create_idle_and_delete() -> Result<()> {
        let ts = TestService::new().await?;
        create_environment(&ts).await?;
        let mut function = test_function("api", "u-2", ExecutorType::Newdeploy);
        function.spec.idle_timeout = Some(1);
        let function = create_function(&ts, function).await?;
        let name = object_name(&function);

        let identity = FunctionIdentity::from_function(&function);
        let address = ts.service.executor.get_service_for_function(&identity).await?;
        assert_eq!(address, format!("{name}.{POOL_NAMESPACE}"));

        let cluster = ts.cluster();
        assert!(cluster.services.get_opt(POOL_NAMESPACE, &name).await?.is_some());
        let deployment = cluster.deployments.get(POOL_NAMESPACE, &name).await?;
        assert_eq!(deployment.spec.as_ref().and_then(|s| s.replicas), Some(1));
        let hpa = cluster.hpas.get(POOL_NAMESPACE, &name).await?;
        let hpa_spec = hpa.spec.unwrap_or_default();
        assert_eq!(hpa_spec.min_replicas, Some(1));
        assert_eq!(hpa_spec.max_replicas, 5);

        // Scaled up by the autoscaler, then idle.
        cluster
            .deployments
            .patch(POOL_NAMESPACE, &name, &json!({ "spec": { "replicas": 3 } }))
            .await?;
        let deployments = cluster.deployments.clone();
        let (ns, n) = (POOL_NAMESPACE, name.as_str());
        wait_for("idle scale down", WAIT, move || {
            let deployments = deployments.clone();
            async move {
                let current = deployments.get(ns, n).await?;
                Ok(current.spec.and_then(|s| s.replicas) == Some(1))
            }
        })
        .await?;
        let key = FunctionKey::for_function(&function);
        assert_eq!(ts.service.cache.get_by_function(&key).await?.address, address);

        ts.memory
            .functions
            .delete(TEST_NAMESPACE, "api", Propagation::Background)
            .await?;
        let uid = function.uid().unwrap_or_default();
        let memory = &ts.memory;
        let uid = uid.as_str();
        wait_for("function objects deleted", WAIT, move || async move {
            let labeled = |l: &std::collections::BTreeMap<String, String>| {
                l.get(LABEL_FUNCTION_UID).map(String::as_str) == Some(uid)
            };
            Ok(!memory.deployments.all().iter().any(|d| labeled(d.labels()))
                && !memory.services.all().iter().any(|s| labeled(s.labels()))
                && !memory.hpas.all().iter().any(|h| labeled(h.labels())))
        })
        .await?;
        assert!(ts.service.cache.get_by_function(&key).await.is_err());
        Ok(())
    }

    fn fetcher_command(deployment: &Deployment) -> Vec<String> {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.get(1))
            .and_then(|c| c.command.clone())
            .unwrap_or_default()
    }

    fn resource_version_count_of(deployment: &Deployment) -> Option<String> {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|var| var.name == ENV_RESOURCE_VERSION_COUNT))
            .and_then(|var| var.value.clone())
    }

    #[tokio::test]
    async fn test_newdeploy_function_update_rules() -> Result<()> {
        let ts = TestService::new().await?;
        create_environment(&ts).await?;
        let function = create_function(&ts, test_function("api", "u-2", ExecutorType::Newdeploy)).await?;
        let name = object_name(&function);
        ts.service
            .executor
            .get_service_for_function(&FunctionIdentity::from_function(&function))
            .await?;
        let manager = &ts.service.newdeploy_manager;
        let cluster = ts.cluster();

        // Same generation: nothing is touched.
        let mut unchanged = function.clone();
        unchanged.spec.invoke_strategy.execution_strategy.max_scale = 9;
        manager.update_function(&function, &unchanged).await?;
        let hpa = cluster.hpas.get(POOL_NAMESPACE, &name).await?;
        assert_eq!(hpa.spec.map(|s| s.max_replicas), Some(5));

        // Scale change patches the autoscaler and raises replicas to the new
        // minimum.
        let mut scaled = function.clone();
        scaled.metadata.generation = Some(2);
        scaled.spec.invoke_strategy.execution_strategy.min_scale = 2;
        scaled.spec.invoke_strategy.execution_strategy.max_scale = 8;
        scaled.spec.invoke_strategy.execution_strategy.target_cpu_percent = 60;
        let template_before = cluster.deployments.get(POOL_NAMESPACE, &name).await?.spec.map(|s| s.template);
        manager.update_function(&function, &scaled).await?;
        let hpa_spec = cluster.hpas.get(POOL_NAMESPACE, &name).await?.spec.unwrap_or_default();
        assert_eq!(hpa_spec.min_replicas, Some(2));
        assert_eq!(hpa_spec.max_replicas, 8);
        assert_eq!(hpa_spec.target_cpu_utilization_percentage, Some(60));
        let deployment = cluster.deployments.get(POOL_NAMESPACE, &name).await?;
        assert_eq!(deployment.spec.as_ref().and_then(|s| s.replicas), Some(2));
        assert_eq!(deployment.spec.map(|s| s.template), template_before);

        // Package change rolls the deployment.
        let mut repackaged = scaled.clone();
        repackaged.metadata.generation = Some(3);
        repackaged.spec.package.package_ref.resource_version = "2".to_string();
        manager.update_function(&scaled, &repackaged).await?;
        let deployment = cluster.deployments.get(POOL_NAMESPACE, &name).await?;
        assert!(fetcher_command(&deployment)
            .iter()
            .any(|arg| arg.contains(r#""resourceVersion":"2""#)));
        assert_eq!(deployment.spec.as_ref().and_then(|s| s.replicas), Some(2));

        // Switching to the pool strategy removes every new-deploy object.
        let mut pooled = repackaged.clone();
        pooled.metadata.generation = Some(4);
        pooled.spec.invoke_strategy.execution_strategy.executor_type = ExecutorType::Poolmgr;
        manager.update_function(&repackaged, &pooled).await?;
        assert!(cluster.deployments.get_opt(POOL_NAMESPACE, &name).await?.is_none());
        assert!(cluster.services.get_opt(POOL_NAMESPACE, &name).await?.is_none());
        assert!(cluster.hpas.get_opt(POOL_NAMESPACE, &name).await?.is_none());
        assert!(ts
            .service
            .cache
            .get_by_function(&FunctionKey::for_function(&function))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_config_map_update_rolls_newdeploy_function() -> Result<()> {
        let ts = TestService::new().await?;
        create_environment(&ts).await?;
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some("api-config".to_string()),
                ..Default::default()
            },
            data: Some(std::collections::BTreeMap::from([("mode".to_string(), "a".to_string())])),
            ..Default::default()
        };
        let config_map = ts.memory.config_maps.create(TEST_NAMESPACE, &config_map).await?;
        let mut function = test_function("api", "u-2", ExecutorType::Newdeploy);
        function.spec.configmaps = vec![ConfigMapReference {
            name: "api-config".to_string(),
            namespace: String::new(),
        }];
        let function = create_function(&ts, function).await?;
        let name = object_name(&function);
        ts.service
            .executor
            .get_service_for_function(&FunctionIdentity::from_function(&function))
            .await?;

        let deployment = ts.memory.deployments.get(POOL_NAMESPACE, &name).await?;
        assert_eq!(resource_version_count_of(&deployment), config_map.resource_version());

        let updated = ts
            .memory
            .config_maps
            .patch(TEST_NAMESPACE, "api-config", &json!({ "data": { "mode": "b" } }))
            .await?;
        let expected = updated.resource_version();
        let memory = &ts.memory;
        let (name, expected) = (name.as_str(), &expected);
        wait_for("deployment rolled with the new config map", WAIT, move || async move {
            let deployment = memory.deployments.get(POOL_NAMESPACE, name).await?;
            Ok(resource_version_count_of(&deployment) == *expected)
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_environment_update_retires_specialized_pods() -> Result<()> {
        let ts = TestService::new().await?;
        let env = create_environment(&ts).await?;
        let function = create_function(&ts, test_function("hello", "u-1", ExecutorType::Poolmgr)).await?;
        wait_for_pool(&ts, &env, 3).await?;

        let identity = FunctionIdentity::from_function(&function);
        ts.service.executor.get_service_for_function(&identity).await?;
        let old_pod = function_pods(&ts, &function)
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no specialized pod"))?;

        ts.memory
            .environments
            .patch(
                TEST_NAMESPACE,
                "nodejs",
                &json!({ "spec": { "runtime": { "image": "example/node-env:v2" } } }),
            )
            .await?;

        let pool_name = pool_deployment_name(&env);
        let deployments = ts.memory.deployments.clone();
        let pool_name_ref = pool_name.as_str();
        wait_for("pool deployment update", WAIT, move || {
            let deployments = deployments.clone();
            async move {
                let deployment = deployments.get(POOL_NAMESPACE, pool_name_ref).await?;
                let image = deployment
                    .spec
                    .and_then(|s| s.template.spec)
                    .and_then(|s| s.containers.first().and_then(|c| c.image.clone()));
                Ok(image.as_deref() == Some("example/node-env:v2"))
            }
        })
        .await?;

        let ts_ref = &ts;
        let old_name = old_pod.name_any();
        let old_name = old_name.as_str();
        wait_for("specialized pod retired", WAIT, move || async move {
            let gone = !ts_ref.memory.pods.all().iter().any(|p| p.name_any() == old_name);
            Ok(gone && ts_ref.service.cache.list_all().await?.is_empty())
        })
        .await?;

        let selector = pool_selector(&env);
        let selector = &selector;
        wait_for("pool rolled to the new image", WAIT, move || async move {
            let pods = ts_ref.pods_matching(selector);
            let on_new_image = |pod: &Pod| {
                pod.spec
                    .as_ref()
                    .and_then(|s| s.containers.first())
                    .and_then(|c| c.image.as_deref())
                    == Some("example/node-env:v2")
            };
            Ok(!pods.is_empty() && pods.iter().all(|pod| on_new_image(pod) && is_pod_ready(pod)))
        })
        .await?;

        let address = ts.service.executor.get_service_for_function(&identity).await?;
        let pod = function_pods(&ts, &function)
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no specialized pod"))?;
        assert_ne!(pod.name_any(), old_pod.name_any());
        assert_eq!(address, address_of(&pod));
        let image = pod
            .spec
            .and_then(|s| s.containers.first().and_then(|c| c.image.clone()));
        assert_eq!(image.as_deref(), Some("example/node-env:v2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_adopts_existing_resources() -> Result<()> {
        let first = TestService::new().await?;
        let env = create_environment(&first).await?;
        let x = create_function(&first, test_function("x", "u-x", ExecutorType::Poolmgr)).await?;
        let y = create_function(&first, test_function("y", "u-y", ExecutorType::Poolmgr)).await?;
        let z = create_function(&first, test_function("z", "u-z", ExecutorType::Newdeploy)).await?;
        wait_for_pool(&first, &env, 3).await?;

        let executor = &first.service.executor;
        let x_address = executor.get_service_for_function(&FunctionIdentity::from_function(&x)).await?;
        let y_address = executor.get_service_for_function(&FunctionIdentity::from_function(&y)).await?;
        let z_address = executor.get_service_for_function(&FunctionIdentity::from_function(&z)).await?;
        let specialized = first.fetcher.specialized();
        let deployments_before: BTreeSet<String> =
            first.memory.deployments.all().iter().map(|d| d.name_any()).collect();

        let second = first.restart("instance-b").await?;
        let mut adopted: Vec<(String, String)> = second
            .service
            .cache
            .list_all()
            .await?
            .into_iter()
            .map(|entry| (entry.function.name, entry.address))
            .collect();
        adopted.sort();
        assert_eq!(
            adopted,
            vec![
                ("x".to_string(), x_address.clone()),
                ("y".to_string(), y_address),
                ("z".to_string(), z_address),
            ]
        );

        let again = second
            .service
            .executor
            .get_service_for_function(&FunctionIdentity::from_function(&x))
            .await?;
        assert_eq!(again, x_address);
        assert_eq!(second.fetcher.specialized(), specialized);

        let memory = &second.memory;
        wait_for("deployments adopted", WAIT, move || async move {
            Ok(memory
                .deployments
                .all()
                .iter()
                .all(|d| owner_instance_id(d).as_deref() == Some("instance-b")))
        })
        .await?;
        let deployments_after: BTreeSet<String> =
            second.memory.deployments.all().iter().map(|d| d.name_any()).collect();
        assert_eq!(deployments_before, deployments_after);
        for function in [&x, &y] {
            let pods = function_pods(&second, function);
            assert_eq!(pods.len(), 1);
            assert_eq!(owner_instance_id(&pods[0]).as_deref(), Some("instance-b"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_removes_duplicate_specialized_pod() -> Result<()> {
        let first = TestService::new().await?;
        let env = create_environment(&first).await?;
        let x = create_function(&first, test_function("x", "u-x", ExecutorType::Poolmgr)).await?;
        wait_for_pool(&first, &env, 3).await?;
        first
            .service
            .executor
            .get_service_for_function(&FunctionIdentity::from_function(&x))
            .await?;

        // A second pod specialized for the same function, as left by a
        // specialization that raced another one.
        let original = function_pods(&first, &x)
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no specialized pod"))?;
        let mut duplicate = original.clone();
        duplicate.metadata.name = Some(format!("{}-dup", original.name_any()));
        duplicate.metadata.uid = None;
        duplicate.metadata.resource_version = None;
        duplicate
            .annotations_mut()
            .insert(ANNOTATION_SVC_HOST.to_string(), "127.0.0.251:8888".to_string());
        if let Some(status) = duplicate.status.as_mut() {
            status.pod_ip = Some("127.0.0.251".to_string());
        }
        first.memory.pods.create(POOL_NAMESPACE, &duplicate).await?;
        assert_eq!(function_pods(&first, &x).len(), 2);

        let second = first.restart("instance-b").await?;
        let entries = second.service.cache.list_all().await?;
        assert_eq!(entries.len(), 1);

        let pods = function_pods(&second, &x);
        assert_eq!(pods.len(), 1);
        assert_eq!(owner_instance_id(&pods[0]).as_deref(), Some("instance-b"));
        assert_eq!(entries[0].address, address_of(&pods[0]));
        assert!(entries[0].kube_objects.iter().any(|obj| obj.name == pods[0].name_any()));
        Ok(())
    }

    #[tokio::test]
    async fn test_specialization_timeout_moves_to_another_pod() -> Result<()> {
        let ts = TestService::with_config(MemoryCluster::default(), |config| {
            config.pod_ready_timeout = Duration::from_secs(1);
            config.specialize_failure_delete_delay = Duration::from_millis(500);
        })
        .await?;
        let env = create_environment(&ts).await?;
        let function = create_function(&ts, test_function("hello", "u-1", ExecutorType::Poolmgr)).await?;
        wait_for_pool(&ts, &env, 3).await?;

        ts.fetcher.hang_next(1);
        let identity = FunctionIdentity::from_function(&function);
        let err = match ts.service.executor.get_service_for_function(&identity).await {
            Ok(address) => anyhow::bail!("expected a timeout, got {address}"),
            Err(err) => err,
        };
        assert!(ts.fetcher.hung());
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("timeout"));

        let failed = function_pods(&ts, &function)
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no pod was chosen"))?;
        let memory = &ts.memory;
        let failed_name = failed.name_any();
        let failed_name = failed_name.as_str();
        wait_for("failed pod deleted", WAIT, move || async move {
            Ok(!memory.pods.all().iter().any(|p| p.name_any() == failed_name))
        })
        .await?;

        let address = ts.service.executor.get_service_for_function(&identity).await?;
        assert_ne!(address, address_of(&failed));
        assert_eq!(ts.fetcher.specialized(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_http_api_round_trip() -> Result<()> {
        let ts = TestService::new().await?;
        let env = create_environment(&ts).await?;
        let function = create_function(&ts, test_function("hello", "u-1", ExecutorType::Poolmgr)).await?;
        wait_for_pool(&ts, &env, 3).await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let app = create_routes(ts.service.route_state());
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });

        let client = ExecutorClient::new(&base_url, cancel.clone())?;
        let identity = FunctionIdentity::from_function(&function);
        let address = client.get_service_for_function(&identity).await?;
        assert_eq!(address, address_of(&function_pods(&ts, &function)[0]));

        client
            .tap_services(&[data_model::TapServiceRequest {
                fn_metadata: identity.clone(),
                fn_executor_type: ExecutorType::Poolmgr,
                service_url: format!("http://{address}"),
            }])
            .await?;
        client
            .untap_service(identity.clone(), ExecutorType::Poolmgr, &format!("http://{address}"))
            .await?;

        let err = client
            .untap_service(identity.clone(), ExecutorType::Newdeploy, "http://svc.ns")
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("untap of a new-deploy service should fail"))?;
        assert_eq!(err.status_code(), Some(400));

        let err = client
            .tap_services(&[data_model::TapServiceRequest {
                fn_metadata: identity.clone(),
                fn_executor_type: ExecutorType::Poolmgr,
                service_url: "http://10.9.9.9:8888".to_string(),
            }])
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("tap of an unknown service should fail"))?;
        assert_eq!(err.status_code(), Some(404));

        let missing = FunctionIdentity {
            name: "missing".to_string(),
            namespace: TEST_NAMESPACE.to_string(),
            ..Default::default()
        };
        let err = client
            .get_service_for_function(&missing)
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("unknown function should fail"))?;
        assert_eq!(err.status_code(), Some(404));

        let http = reqwest::Client::builder().no_proxy().build()?;
        let health = http.get(format!("{base_url}/healthz")).send().await?;
        assert!(health.status().is_success());
        let debug: Vec<serde_json::Value> = http
            .get(format!("{base_url}/v2/debugInfo"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(debug.len(), 1);

        cancel.cancel();
        Ok(())
    }
}

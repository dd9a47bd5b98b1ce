//! The fetcher sidecar: pod-spec injection, specialize requests and the HTTP
//! client used to trigger specialization of pool pods.

use std::{collections::BTreeMap, time::Duration};

use data_model::{
    crd::{ConfigMapReference, Environment, Function, SecretReference},
    FETCHER_SERVICE_ACCOUNT,
};
use executor_utils::retry::{retry_with_backoff, Backoff};
use k8s_openapi::{
    api::core::v1::{
        ContainerPort,
        DownwardAPIVolumeFile,
        DownwardAPIVolumeSource,
        EmptyDirVolumeSource,
        ExecAction,
        HTTPGetAction,
        Lifecycle,
        LifecycleHandler,
        ObjectFieldSelector,
        PodSpec,
        Probe,
        ResourceRequirements,
        Volume,
        VolumeMount,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::{ImagePullPolicy, ServerConfig},
    error::{ExecutorError, ExecutorResult},
};

pub const FETCHER_CONTAINER_NAME: &str = "fetcher";
pub const FETCHER_PORT_NAME: &str = "http-fetcher";
pub const SHARED_MOUNT_PATH: &str = "/userfunc";
const SHARED_SECRET_PATH: &str = "/secrets";
const SHARED_CONFIGMAP_PATH: &str = "/configs";
const PODINFO_MOUNT_PATH: &str = "/etc/podinfo";

pub const VOLUME_USERFUNC: &str = "userfunc";
pub const VOLUME_SECRETS: &str = "secrets";
pub const VOLUME_CONFIGMAPS: &str = "configmaps";
pub const VOLUME_PODINFO: &str = "podinfo";

/// Fetch type asking the fetcher for the deployment archive of a package.
pub const FETCH_DEPLOYMENT: i32 = 1;

const SPECIALIZE_MAX_RETRIES: u32 = 19;
const SPECIALIZE_BACKOFF: Backoff = Backoff::Exponential {
    initial: Duration::from_millis(50),
    max: Duration::from_secs(2),
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecializeRequest {
    #[serde(rename = "fetchReq")]
    pub fetch: FetchRequest,
    #[serde(rename = "loadReq")]
    pub load: LoadRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub fetch_type: i32,
    pub package: ObjectMeta,
    pub filename: String,
    #[serde(rename = "secretList", default)]
    pub secrets: Vec<SecretReference>,
    #[serde(rename = "configMapList", default)]
    pub configmaps: Vec<ConfigMapReference>,
    #[serde(rename = "keeparchive", default)]
    pub keep_archive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    #[serde(rename = "filepath")]
    pub file_path: String,
    pub function_name: String,
    pub function_metadata: ObjectMeta,
    pub env_version: i32,
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    image: String,
    pull_policy: ImagePullPolicy,
    resources: ResourceRequirements,
    shared_mount_path: String,
    port: u16,
}

fn quantities(pairs: [(&str, &Option<String>); 2]) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<String, Quantity> = pairs
        .into_iter()
        .filter_map(|(resource, value)| {
            value
                .as_ref()
                .map(|v| (resource.to_string(), Quantity(v.clone())))
        })
        .collect();
    (!map.is_empty()).then_some(map)
}

impl FetcherConfig {
    pub fn new(config: &ServerConfig) -> Self {
        let resources = ResourceRequirements {
            requests: quantities([
                ("cpu", &config.fetcher_min_cpu),
                ("memory", &config.fetcher_min_mem),
            ]),
            limits: quantities([
                ("cpu", &config.fetcher_max_cpu),
                ("memory", &config.fetcher_max_mem),
            ]),
            ..Default::default()
        };
        Self {
            image: config.fetcher_image.clone(),
            pull_policy: config.fetcher_image_pull_policy,
            resources,
            shared_mount_path: SHARED_MOUNT_PATH.to_string(),
            port: config.fetcher_port,
        }
    }

    pub fn shared_mount_path(&self) -> &str {
        &self.shared_mount_path
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn new_specialize_request(&self, function: &Function, env: &Environment) -> SpecializeRequest {
        let target_filename = if env.spec.version < 2 {
            "user".to_string()
        } else if env.spec.allowed_functions_per_container.shares_container() {
            // Several archives land in the same container.
            function.metadata.uid.clone().unwrap_or_default()
        } else {
            "deployarchive".to_string()
        };
        let package_ref = &function.spec.package.package_ref;

        SpecializeRequest {
            fetch: FetchRequest {
                fetch_type: FETCH_DEPLOYMENT,
                package: ObjectMeta {
                    name: Some(package_ref.name.clone()),
                    namespace: Some(package_ref.namespace.clone()),
                    resource_version: Some(package_ref.resource_version.clone())
                        .filter(|rv| !rv.is_empty()),
                    ..Default::default()
                },
                filename: target_filename.clone(),
                secrets: function.spec.secrets.clone(),
                configmaps: function.spec.configmaps.clone(),
                keep_archive: env.spec.keep_archive,
            },
            load: LoadRequest {
                file_path: format!(
                    "{}/{}",
                    self.shared_mount_path.trim_end_matches('/'),
                    target_filename
                ),
                function_name: function.spec.package.function_name.clone(),
                function_metadata: function.metadata.clone(),
                env_version: env.spec.version,
            },
        }
    }

    /// Adds a fetcher that waits for a specialize call (pool pods).
    pub fn add_fetcher_to_pod_spec(
        &self,
        pod_spec: &mut PodSpec,
        main_container: &str,
    ) -> ExecutorResult<()> {
        self.add_with_command(pod_spec, main_container, self.fetcher_command(&[]))
    }

    /// Adds a fetcher that specializes the pod for `function` as soon as it
    /// starts (new-deploy pods).
    pub fn add_specializing_fetcher_to_pod_spec(
        &self,
        pod_spec: &mut PodSpec,
        main_container: &str,
        function: &Function,
        env: &Environment,
    ) -> ExecutorResult<()> {
        let request = self.new_specialize_request(function, env);
        let payload =
            serde_json::to_string(&request).map_err(|e| ExecutorError::Internal(e.into()))?;
        let command = self.fetcher_command(&[
            "-specialize-on-startup".to_string(),
            "-specialize-request".to_string(),
            payload,
        ]);
        self.add_with_command(pod_spec, main_container, command)
    }

    fn fetcher_command(&self, extra: &[String]) -> Vec<String> {
        let mut command = vec![
            "/fetcher".to_string(),
            "-secret-dir".to_string(),
            SHARED_SECRET_PATH.to_string(),
            "-cfgmap-dir".to_string(),
            SHARED_CONFIGMAP_PATH.to_string(),
        ];
        command.extend_from_slice(extra);
        command.push(self.shared_mount_path.clone());
        command
    }

    fn volumes_with_mounts(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        let field = |path: &str, field_path: &str| DownwardAPIVolumeFile {
            path: path.to_string(),
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let empty_dir = |name: &str| Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };
        let volumes = vec![
            empty_dir(VOLUME_USERFUNC),
            empty_dir(VOLUME_SECRETS),
            empty_dir(VOLUME_CONFIGMAPS),
            Volume {
                name: VOLUME_PODINFO.to_string(),
                downward_api: Some(DownwardAPIVolumeSource {
                    items: Some(vec![
                        field("name", "metadata.name"),
                        field("namespace", "metadata.namespace"),
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        let mount = |name: &str, path: &str| VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        };
        let mounts = vec![
            mount(VOLUME_USERFUNC, &self.shared_mount_path),
            mount(VOLUME_SECRETS, SHARED_SECRET_PATH),
            mount(VOLUME_CONFIGMAPS, SHARED_CONFIGMAP_PATH),
            mount(VOLUME_PODINFO, PODINFO_MOUNT_PATH),
        ];
        (volumes, mounts)
    }

    fn http_probe(&self, path: &str, period: i32, failure_threshold: Option<i32>) -> Probe {
        Probe {
            initial_delay_seconds: Some(1),
            period_seconds: Some(period),
            failure_threshold,
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(i32::from(self.port)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn add_with_command(
        &self,
        pod_spec: &mut PodSpec,
        main_container: &str,
        command: Vec<String>,
    ) -> ExecutorResult<()> {
        let (volumes, mounts) = self.volumes_with_mounts();

        let Some(main) = pod_spec
            .containers
            .iter_mut()
            .find(|c| c.name == main_container)
        else {
            let found: Vec<&str> = pod_spec.containers.iter().map(|c| c.name.as_str()).collect();
            return Err(ExecutorError::invalid(format!(
                "could not find main container {main_container:?} in pod spec, found {found:?}"
            )));
        };
        main.volume_mounts
            .get_or_insert_with(Vec::new)
            .extend(mounts.iter().cloned());

        // Endpoints drain while the fetcher sleeps out the grace period.
        let lifecycle = pod_spec.termination_grace_period_seconds.map(|grace| Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec!["/bin/sleep".to_string(), grace.to_string()]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        let fetcher = k8s_openapi::api::core::v1::Container {
            name: FETCHER_CONTAINER_NAME.to_string(),
            command: Some(command),
            image: Some(self.image.clone()),
            image_pull_policy: Some(self.pull_policy.as_str().to_string()),
            termination_message_path: Some("/dev/termination-log".to_string()),
            volume_mounts: Some(mounts),
            resources: Some(self.resources.clone()),
            ports: Some(vec![ContainerPort {
                name: Some(FETCHER_PORT_NAME.to_string()),
                container_port: i32::from(self.port),
                ..Default::default()
            }]),
            readiness_probe: Some(self.http_probe("/readiness-healthz", 1, Some(30))),
            liveness_probe: Some(self.http_probe("/healthz", 5, None)),
            lifecycle,
            ..Default::default()
        };

        pod_spec.volumes.get_or_insert_with(Vec::new).extend(volumes);
        pod_spec.containers.push(fetcher);
        if pod_spec
            .service_account_name
            .as_deref()
            .map_or(true, str::is_empty)
        {
            pod_spec.service_account_name = Some(FETCHER_SERVICE_ACCOUNT.to_string());
        }
        Ok(())
    }
}

/// Base URL of the fetcher listening on `ip`.
pub fn fetcher_url(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("http://[{ip}]:{port}")
    } else {
        format!("http://{ip}:{port}")
    }
}

#[derive(Debug, thiserror::Error)]
enum SpecializeError {
    #[error("error reaching fetcher: {0}")]
    Connect(#[from] reqwest::Error),
    #[error("fetcher returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl SpecializeError {
    fn is_retryable(&self) -> bool {
        match self {
            SpecializeError::Connect(_) => true,
            SpecializeError::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

#[derive(Clone)]
pub struct FetcherClient {
    http: reqwest::Client,
}

impl FetcherClient {
    pub fn new() -> ExecutorResult<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| ExecutorError::Internal(e.into()))?;
        Ok(Self { http })
    }

    /// Asks the fetcher at `base_url` to load the function. Unreachable
    /// fetchers are retried, since a pod may report ready before the
    /// fetcher accepts connections.
    pub async fn specialize(&self, base_url: &str, request: &SpecializeRequest) -> ExecutorResult<()> {
        let url = format!("{}/specialize", base_url.trim_end_matches('/'));
        debug!(url, "sending specialize request");
        retry_with_backoff(
            SPECIALIZE_MAX_RETRIES,
            SPECIALIZE_BACKOFF,
            "specialize",
            || self.post(&url, request),
            SpecializeError::is_retryable,
        )
        .await
        .map_err(|err| match err {
            SpecializeError::Status { status: 400, body } => ExecutorError::invalid(format!(
                "error specializing function pod: {body}"
            )),
            other => ExecutorError::Internal(anyhow::anyhow!(
                "error specializing function pod: {other}"
            )),
        })?;
        info!(url, "specialized function pod");
        Ok(())
    }

    async fn post(&self, url: &str, request: &SpecializeRequest) -> Result<(), SpecializeError> {
        let resp = self.http.post(url).json(request).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SpecializeError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

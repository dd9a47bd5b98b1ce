use std::fmt;

use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::ExecutorType;

pub const DEFAULT_SPECIALIZATION_TIMEOUT_SECS: i32 = 120;
pub const DEFAULT_TARGET_CPU_PERCENT: i32 = 80;
pub const DEFAULT_TERMINATION_GRACE_SECS: i64 = 360;
pub const DEFAULT_POOL_SIZE: i32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigMapReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub resource_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionPackageRef {
    pub package_ref: PackageRef,
    /// Entry point inside the package, handed to the runtime loader.
    #[serde(default)]
    pub function_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStrategy {
    #[serde(default)]
    pub executor_type: ExecutorType,
    #[serde(default)]
    pub min_scale: i32,
    #[serde(default)]
    pub max_scale: i32,
    #[serde(default, rename = "targetCPUPercent")]
    pub target_cpu_percent: i32,
    #[serde(default)]
    pub specialization_timeout: i32,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self {
            executor_type: ExecutorType::Poolmgr,
            min_scale: 0,
            max_scale: 0,
            target_cpu_percent: 0,
            specialization_timeout: DEFAULT_SPECIALIZATION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeStrategy {
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fission.io",
    version = "v1",
    kind = "Function",
    namespaced,
    status = "FunctionStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub environment: EnvironmentReference,
    pub package: FunctionPackageRef,
    #[serde(default)]
    pub secrets: Vec<SecretReference>,
    #[serde(default)]
    pub configmaps: Vec<ConfigMapReference>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub invoke_strategy: InvokeStrategy,
    /// Seconds without traffic before the function is considered idle.
    #[serde(default)]
    pub idle_timeout: Option<i32>,
    /// Upper bound of specialized pods serving this function at once.
    #[serde(default)]
    pub concurrency: Option<i32>,
    /// Concurrent requests a single specialized pod may serve; unset means
    /// unlimited.
    #[serde(default)]
    pub requests_per_pod: Option<i32>,
    /// A specialized pod serves exactly one request and is then discarded.
    #[serde(default)]
    pub once_only: bool,
}

impl FunctionSpec {
    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.invoke_strategy.execution_strategy
    }

    pub fn executor_type(&self) -> ExecutorType {
        self.strategy().executor_type
    }

    /// Request slots per specialized pod. Zero means unlimited; negative
    /// values count as unlimited too.
    pub fn request_slots(&self) -> u32 {
        self.requests_per_pod
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    #[serde(default)]
    pub package_build_status: Option<BuildStatus>,
    #[serde(default)]
    pub package_build_log: Option<String>,
}

/// How many distinct functions may be loaded into one runtime container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionsPerContainer {
    Limit(u32),
    Infinite,
}

impl Default for FunctionsPerContainer {
    fn default() -> Self {
        FunctionsPerContainer::Limit(1)
    }
}

impl FunctionsPerContainer {
    pub fn is_infinite(&self) -> bool {
        matches!(self, FunctionsPerContainer::Infinite)
    }

    /// True when several functions may coexist in one container, which
    /// requires every function archive to land under a distinct filename.
    pub fn shares_container(&self) -> bool {
        match self {
            FunctionsPerContainer::Infinite => true,
            FunctionsPerContainer::Limit(n) => *n > 1,
        }
    }
}

impl fmt::Display for FunctionsPerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionsPerContainer::Limit(n) => write!(f, "{n}"),
            FunctionsPerContainer::Infinite => write!(f, "infinite"),
        }
    }
}

impl Serialize for FunctionsPerContainer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FunctionsPerContainer::Limit(n) => serializer.serialize_u32(*n),
            FunctionsPerContainer::Infinite => serializer.serialize_str("infinite"),
        }
    }
}

impl<'de> Deserialize<'de> for FunctionsPerContainer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(0) => Err(de::Error::custom(
                "allowedFunctionsPerContainer must be at least 1",
            )),
            Raw::Number(n) => Ok(FunctionsPerContainer::Limit(n)),
            Raw::Text(text) => match text.to_lowercase().as_str() {
                "infinite" => Ok(FunctionsPerContainer::Infinite),
                "single" | "" => Ok(FunctionsPerContainer::Limit(1)),
                other => other
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .map(FunctionsPerContainer::Limit)
                    .ok_or_else(|| {
                        de::Error::custom(format!(
                            "invalid allowedFunctionsPerContainer value: {other}"
                        ))
                    }),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub image: String,
    #[serde(default)]
    pub container: Option<Container>,
    #[serde(default)]
    pub pod_spec: Option<PodSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Builder {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: String,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fission.io",
    version = "v1",
    kind = "Environment",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Interface version of the runtime: 1, 2 or 3.
    #[serde(default = "default_env_version")]
    pub version: i32,
    pub runtime: Runtime,
    #[serde(default)]
    pub builder: Option<Builder>,
    #[serde(default)]
    pub poolsize: Option<i32>,
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub allowed_functions_per_container: FunctionsPerContainer,
    #[serde(default)]
    pub allow_access_to_external_network: bool,
    #[serde(default)]
    pub termination_grace_period: Option<i64>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub keep_archive: bool,
    #[serde(default)]
    pub image_pull_secret: Option<String>,
}

fn default_env_version() -> i32 {
    1
}

impl EnvironmentSpec {
    /// Number of generic pods kept warm for this environment.
    pub fn pool_size(&self) -> i32 {
        if self.allowed_functions_per_container.is_infinite() {
            return 1;
        }
        match self.poolsize {
            Some(size) if self.version >= 3 => size.max(0),
            _ => DEFAULT_POOL_SIZE,
        }
    }

    pub fn termination_grace(&self) -> i64 {
        self.termination_grace_period
            .unwrap_or(DEFAULT_TERMINATION_GRACE_SECS)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Checksum {
    #[serde(default, rename = "type")]
    pub checksum_type: String,
    #[serde(default)]
    pub sum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Archive {
    #[serde(default, rename = "type")]
    pub archive_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fission.io",
    version = "v1",
    kind = "Package",
    namespaced,
    status = "PackageStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    pub environment: EnvironmentReference,
    #[serde(default)]
    pub source: Archive,
    #[serde(default)]
    pub deployment: Archive,
    #[serde(default)]
    pub build_command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(default)]
    pub buildstatus: BuildStatus,
    #[serde(default)]
    pub buildlog: String,
}

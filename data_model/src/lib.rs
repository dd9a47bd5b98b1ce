pub mod crd;
pub mod test_objects;

use std::fmt::{self, Display};

use crd::{Environment, Function, FunctionsPerContainer};
use derive_builder::Builder;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};
use tokio::time::Instant;

pub const LABEL_EXECUTOR_TYPE: &str = "executorType";
pub const LABEL_ENVIRONMENT_NAME: &str = "environmentName";
pub const LABEL_ENVIRONMENT_NAMESPACE: &str = "environmentNamespace";
pub const LABEL_ENVIRONMENT_UID: &str = "environmentUid";
pub const LABEL_FUNCTION_NAME: &str = "functionName";
pub const LABEL_FUNCTION_NAMESPACE: &str = "functionNamespace";
pub const LABEL_FUNCTION_UID: &str = "functionUid";
pub const LABEL_MANAGED: &str = "managed";
pub const LABEL_POD_TEMPLATE_HASH: &str = "pod-template-hash";

pub const ANNOTATION_EXECUTOR_INSTANCE_ID: &str = "executorInstanceId";
pub const ANNOTATION_SVC_HOST: &str = "svcHost";
pub const ANNOTATION_FUNCTION_RESOURCE_VERSION: &str = "functionResourceVersion";
pub const ANNOTATION_FUNCTION_GENERATION: &str = "functionGeneration";

pub const ENV_RESOURCE_VERSION_COUNT: &str = "RESOURCE_VERSION_COUNT";
pub const FETCHER_SERVICE_ACCOUNT: &str = "fission-fetcher";

pub const RUNTIME_PORT: u16 = 8888;
pub const RUNTIME_PORT_NAME: &str = "http-env";

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    StrumDisplay,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecutorType {
    #[default]
    Poolmgr,
    Newdeploy,
}

/// Kinds of orchestrator objects a function service may own.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ObjectKind {
    Pod,
    Service,
    Deployment,
    HorizontalPodAutoscaler,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
}

impl ObjectRef {
    pub fn from_meta(kind: ObjectKind, meta: &ObjectMeta) -> Self {
        Self {
            kind,
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone().unwrap_or_default(),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Identity snapshot of the function a service was materialized for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub generation: i64,
    pub resource_version: String,
}

impl FunctionMeta {
    pub fn from_function(function: &Function) -> Self {
        Self {
            name: function.name_any(),
            namespace: function.namespace().unwrap_or_default(),
            uid: function.uid().unwrap_or_default(),
            generation: function.metadata.generation.unwrap_or_default(),
            resource_version: function.resource_version().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub version: i32,
    pub functions_per_container: FunctionsPerContainer,
}

impl EnvironmentMeta {
    pub fn from_environment(env: &Environment) -> Self {
        Self {
            name: env.name_any(),
            namespace: env.namespace().unwrap_or_default(),
            uid: env.uid().unwrap_or_default(),
            resource_version: env.resource_version().unwrap_or_default(),
            version: env.spec.version,
            functions_per_container: env.spec.allowed_functions_per_container,
        }
    }
}

/// Cache key of a function service. Pool-backed services are keyed by
/// generation so an updated function never reuses a pod specialized for an
/// older revision; new-deploy services share one key across generations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionKey {
    pub uid: String,
    pub generation: Option<i64>,
}

impl FunctionKey {
    pub fn new(executor: ExecutorType, function: &FunctionMeta) -> Self {
        let generation = match executor {
            ExecutorType::Poolmgr => Some(function.generation),
            ExecutorType::Newdeploy => None,
        };
        Self {
            uid: function.uid.clone(),
            generation,
        }
    }

    pub fn for_function(function: &Function) -> Self {
        Self::new(
            function.spec.executor_type(),
            &FunctionMeta::from_function(function),
        )
    }
}

impl Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.generation {
            Some(generation) => write!(f, "{}_{}", self.uid, generation),
            None => write!(f, "{}", self.uid),
        }
    }
}

/// A live, addressable service for one function.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct FuncSvc {
    pub name: String,
    pub function: FunctionMeta,
    pub environment: EnvironmentMeta,
    pub address: String,
    pub kube_objects: Vec<ObjectRef>,
    pub executor: ExecutorType,
    pub ctime: Instant,
    pub atime: Instant,
    pub requests_per_pod: u32,
    pub active_requests: u32,
}

impl FuncSvcBuilder {
    pub fn build(&self) -> anyhow::Result<FuncSvc> {
        let name = self
            .name
            .clone()
            .ok_or(anyhow::anyhow!("name is required"))?;
        let function = self
            .function
            .clone()
            .ok_or(anyhow::anyhow!("function is required"))?;
        let environment = self
            .environment
            .clone()
            .ok_or(anyhow::anyhow!("environment is required"))?;
        let address = self
            .address
            .clone()
            .ok_or(anyhow::anyhow!("address is required"))?;
        let executor = self
            .executor
            .ok_or(anyhow::anyhow!("executor is required"))?;
        let now = Instant::now();
        let ctime = self.ctime.unwrap_or(now);
        Ok(FuncSvc {
            name,
            function,
            environment,
            address,
            kube_objects: self.kube_objects.clone().unwrap_or_default(),
            executor,
            ctime,
            atime: self.atime.unwrap_or(ctime).max(ctime),
            requests_per_pod: self.requests_per_pod.unwrap_or_default(),
            active_requests: self.active_requests.unwrap_or_default(),
        })
    }
}

impl FuncSvc {
    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(self.executor, &self.function)
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.atime)
    }
}

/// Function identity as sent by callers of the executor API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionIdentity {
    pub name: String,
    #[serde(alias = "ns", default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(
        default,
        rename = "resourceVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_version: Option<String>,
}

impl FunctionIdentity {
    pub fn from_function(function: &Function) -> Self {
        Self {
            name: function.name_any(),
            namespace: function.namespace().unwrap_or_default(),
            uid: function.uid(),
            generation: function.metadata.generation,
            resource_version: function.resource_version(),
        }
    }
}

impl Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Body of `getServiceForFunction`: either a bare identity or a full function
/// object whose `metadata` carries the identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GetServiceRequest {
    Object { metadata: FunctionIdentity },
    Identity(FunctionIdentity),
}

impl GetServiceRequest {
    pub fn into_identity(self) -> FunctionIdentity {
        match self {
            GetServiceRequest::Object { metadata } => metadata,
            GetServiceRequest::Identity(identity) => identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapServiceRequest {
    #[serde(alias = "FnMetadata")]
    pub fn_metadata: FunctionIdentity,
    #[serde(alias = "FnExecutorType")]
    pub fn_executor_type: ExecutorType,
    #[serde(rename = "serviceUrl", alias = "ServiceURL")]
    pub service_url: String,
}

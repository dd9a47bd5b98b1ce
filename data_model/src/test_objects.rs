pub mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::{
        crd::{
            Archive,
            BuildStatus,
            Environment,
            EnvironmentReference,
            EnvironmentSpec,
            ExecutionStrategy,
            Function,
            FunctionPackageRef,
            FunctionSpec,
            InvokeStrategy,
            Package,
            PackageRef,
            PackageSpec,
            PackageStatus,
            Runtime,
        },
        ExecutorType,
    };

    pub const TEST_NAMESPACE: &str = "default";
    pub const TEST_ENV_NAME: &str = "nodejs";
    pub const TEST_ENV_IMAGE: &str = "example/node-env";

    fn meta(name: &str, uid: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            uid: Some(uid.to_string()),
            generation: Some(1),
            resource_version: Some("1".to_string()),
            ..Default::default()
        }
    }

    pub fn test_environment(name: &str, uid: &str) -> Environment {
        Environment {
            metadata: meta(name, uid),
            spec: EnvironmentSpec {
                version: 3,
                runtime: Runtime {
                    image: TEST_ENV_IMAGE.to_string(),
                    ..Default::default()
                },
                poolsize: Some(3),
                ..Default::default()
            },
        }
    }

    pub fn test_function(name: &str, uid: &str, executor_type: ExecutorType) -> Function {
        Function {
            metadata: meta(name, uid),
            spec: FunctionSpec {
                environment: EnvironmentReference {
                    name: TEST_ENV_NAME.to_string(),
                    namespace: TEST_NAMESPACE.to_string(),
                },
                package: FunctionPackageRef {
                    package_ref: PackageRef {
                        name: format!("{name}-pkg"),
                        namespace: TEST_NAMESPACE.to_string(),
                        resource_version: "1".to_string(),
                    },
                    function_name: name.to_string(),
                },
                invoke_strategy: InvokeStrategy {
                    execution_strategy: ExecutionStrategy {
                        executor_type,
                        min_scale: 1,
                        max_scale: 5,
                        ..Default::default()
                    },
                },
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn test_package(name: &str, uid: &str, status: BuildStatus) -> Package {
        Package {
            metadata: meta(name, uid),
            spec: PackageSpec {
                environment: EnvironmentReference {
                    name: TEST_ENV_NAME.to_string(),
                    namespace: TEST_NAMESPACE.to_string(),
                },
                deployment: Archive {
                    archive_type: "url".to_string(),
                    url: format!("http://storage/{name}.zip"),
                    checksum: None,
                },
                ..Default::default()
            },
            status: Some(PackageStatus {
                buildstatus: status,
                buildlog: String::new(),
            }),
        }
    }
}

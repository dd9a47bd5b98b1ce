use std::{fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Yaml},
    value::Uncased,
    Figment,
};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

const LOCAL_ENV: &str = "local";
pub const DEFAULT_FETCHER_IMAGE: &str = "ghcr.io/fission/fetcher";

const INSTANCE_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

// Environment variables that override config file fields.
const ENV_OVERRIDES: [(&str, &str); 13] = [
    ("FETCHER_IMAGE", "fetcher_image"),
    ("FETCHER_IMAGE_PULL_POLICY", "fetcher_image_pull_policy"),
    ("RUNTIME_IMAGE_PULL_POLICY", "runtime_image_pull_policy"),
    ("FETCHER_MINCPU", "fetcher_min_cpu"),
    ("FETCHER_MAXCPU", "fetcher_max_cpu"),
    ("FETCHER_MINMEM", "fetcher_min_mem"),
    ("FETCHER_MAXMEM", "fetcher_max_mem"),
    ("ENABLE_ISTIO", "enable_istio"),
    ("POD_READY_TIMEOUT", "pod_ready_timeout"),
    (
        "POOLMGR_OBJECT_REAPER_INTERVAL",
        "poolmgr_object_reaper_interval",
    ),
    ("OBJECT_REAPER_INTERVAL", "object_reaper_interval"),
    ("ENV_FUNCTION_NAMESPACE", "function_namespace"),
    ("ENV_DEFAULT_NAMESPACE", "default_namespace"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::Never => "Never",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde_inline_default("0.0.0.0:8888".to_string())]
    pub listen_addr: String,
    /// Identity written on every object this process owns. A random id is
    /// generated per process when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Namespace for function pods of environments living in the default
    /// namespace.
    #[serde_inline_default("fission-function".to_string())]
    pub function_namespace: String,
    #[serde_inline_default("default".to_string())]
    pub default_namespace: String,

    #[serde_inline_default(DEFAULT_FETCHER_IMAGE.to_string())]
    pub fetcher_image: String,
    #[serde(default)]
    pub fetcher_image_pull_policy: ImagePullPolicy,
    #[serde(default)]
    pub runtime_image_pull_policy: ImagePullPolicy,
    #[serde(default, with = "quantity_serde")]
    pub fetcher_min_cpu: Option<String>,
    #[serde(default, with = "quantity_serde")]
    pub fetcher_max_cpu: Option<String>,
    #[serde(default, with = "quantity_serde")]
    pub fetcher_min_mem: Option<String>,
    #[serde(default, with = "quantity_serde")]
    pub fetcher_max_mem: Option<String>,
    #[serde_inline_default(8000)]
    pub fetcher_port: u16,
    #[serde(default)]
    pub enable_istio: bool,

    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(300))]
    pub pod_ready_timeout: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(5))]
    pub poolmgr_object_reaper_interval: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(5))]
    pub object_reaper_interval: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(120))]
    pub default_idle_timeout: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(60))]
    pub throttler_expiry: Duration,
    /// Grace period before a pod that failed specialization is deleted, so
    /// its logs can still be collected.
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(120))]
    pub specialize_failure_delete_delay: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(1))]
    pub deployment_poll_interval: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(2))]
    pub eager_pool_interval: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(1800))]
    pub role_binding_cleanup_interval: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(60))]
    pub informer_sync_timeout: Duration,
    #[serde_inline_default(true)]
    pub adopt_existing_resources: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:8888".to_string(),
            instance_id: None,
            function_namespace: "fission-function".to_string(),
            default_namespace: "default".to_string(),
            fetcher_image: DEFAULT_FETCHER_IMAGE.to_string(),
            fetcher_image_pull_policy: ImagePullPolicy::IfNotPresent,
            runtime_image_pull_policy: ImagePullPolicy::IfNotPresent,
            fetcher_min_cpu: None,
            fetcher_max_cpu: None,
            fetcher_min_mem: None,
            fetcher_max_mem: None,
            fetcher_port: 8000,
            enable_istio: false,
            pod_ready_timeout: Duration::from_secs(300),
            poolmgr_object_reaper_interval: Duration::from_secs(5),
            object_reaper_interval: Duration::from_secs(5),
            default_idle_timeout: Duration::from_secs(120),
            throttler_expiry: Duration::from_secs(60),
            specialize_failure_delete_delay: Duration::from_secs(120),
            deployment_poll_interval: Duration::from_secs(1),
            eager_pool_interval: Duration::from_secs(2),
            role_binding_cleanup_interval: Duration::from_secs(1800),
            informer_sync_timeout: Duration::from_secs(60),
            adopt_existing_resources: true,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    /// Defaults overridden by the environment only.
    pub fn from_env() -> Result<ServerConfig> {
        Self::from_yaml_str("{}")
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .merge(env_overrides())
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.fetcher_image.is_empty() {
            return Err(anyhow::anyhow!("fetcher image must not be empty"));
        }
        for (name, quantity) in [
            ("fetcher_min_cpu", &self.fetcher_min_cpu),
            ("fetcher_max_cpu", &self.fetcher_max_cpu),
            ("fetcher_min_mem", &self.fetcher_min_mem),
            ("fetcher_max_mem", &self.fetcher_max_mem),
        ] {
            if let Some(q) = quantity {
                if !is_quantity(q) {
                    return Err(anyhow::anyhow!("invalid quantity for {}: {}", name, q));
                }
            }
        }
        if self.pod_ready_timeout.is_zero() {
            return Err(anyhow::anyhow!("pod_ready_timeout must be positive"));
        }
        if self.poolmgr_object_reaper_interval.is_zero() || self.object_reaper_interval.is_zero()
        {
            return Err(anyhow::anyhow!("reaper intervals must be positive"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| nanoid!(8, &INSTANCE_ID_ALPHABET))
    }

    /// Namespace where objects for functions or environments living in
    /// `namespace` are created.
    pub fn resolve_function_namespace(&self, namespace: &str) -> String {
        if namespace == self.default_namespace {
            self.function_namespace.clone()
        } else {
            namespace.to_string()
        }
    }
}

fn env_overrides() -> Env {
    Env::raw().filter_map(|key| {
        ENV_OVERRIDES
            .iter()
            .find(|(env, _)| key.as_str().eq_ignore_ascii_case(env))
            .map(|(_, field)| Uncased::from_borrowed(field))
    })
}

// Accepts `1.5`, `500m`, `128Mi` and friends.
fn is_quantity(q: &str) -> bool {
    let digits_end = q
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(digits_end);
    !number.is_empty()
        && number.parse::<f64>().is_ok()
        && matches!(
            suffix,
            "" | "m" | "k" | "M" | "G" | "T" | "Ki" | "Mi" | "Gi" | "Ti"
        )
}

/// Parses `300`, `300s`, `5m`, `1h30m` or `250ms`. A bare number is seconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_secs = match &rest[..unit_end] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        rest = &rest[unit_end..];
        let part = Duration::try_from_secs_f64(value * unit_secs).ok()?;
        total = total.checked_add(part)?;
    }
    Some(total)
}

mod duration_serde {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text)
                .ok_or_else(|| de::Error::custom(format!("invalid duration: {text}"))),
        }
    }
}

mod quantity_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(quantity: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        quantity.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Integer(u64),
            Float(f64),
            Text(String),
        }

        Ok(match Option::<Raw>::deserialize(deserializer)? {
            None => None,
            Some(Raw::Integer(n)) => Some(n.to_string()),
            Some(Raw::Float(f)) => Some(f.to_string()),
            Some(Raw::Text(text)) if text.trim().is_empty() => None,
            Some(Raw::Text(text)) => Some(text.trim().to_string()),
        })
    }
}

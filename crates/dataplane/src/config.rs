use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    engine::ResourceLimits,
    isolation::RuntimeKind,
    language::Language,
    pool::PoolConfig,
    runtime::RuntimeConfig,
};

const LOCAL_ENV: &str = "local";
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Stdout,
    Otlp,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enable_metrics: bool,
    /// OpenTelemetry collector grpc endpoint for traces and metrics.
    /// Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to
    /// localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Exporter for tracing spans. Spans are not exported when unset.
    #[serde(default)]
    pub tracing_exporter: Option<TracingExporter>,
    /// Metrics export interval in seconds.
    #[serde_inline_default(Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS))]
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
        }
    }
}

/// Durations written as whole seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&d.as_secs()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
        }
    }
}

/// How to reach the container engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon address. Supports `unix:///path`, `/path`,
    /// `http://host:port`, `tcp://host:port` and `https://host:port`.
    /// Defaults to the platform's local socket.
    #[serde(default)]
    pub address: Option<String>,
}

impl DockerConfig {
    fn validate(&self) -> Result<()> {
        let Some(address) = &self.address else {
            return Ok(());
        };
        let recognised = ["unix://", "http://", "tcp://", "https://", "/"]
            .iter()
            .any(|prefix| address.starts_with(prefix));
        if !recognised {
            anyhow::bail!(
                "docker.address must be a unix socket path or an http(s)/tcp URL, got: {}",
                address
            );
        }
        Ok(())
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Language served by the pool and used when a request names none.
    #[serde(default)]
    pub language: Language,
    /// Timeout for executions that do not set their own, in seconds.
    #[serde_inline_default(Duration::from_secs(60))]
    #[serde(with = "duration_serde")]
    pub default_timeout: Duration,
    /// Reuse warm pooled containers.
    #[serde_inline_default(true)]
    pub use_pool: bool,
    /// Executions allowed to run at once. Further requests wait up to
    /// `queue_timeout_ms` and then fail with a capacity error.
    #[serde_inline_default(64)]
    pub max_concurrent: usize,
    #[serde_inline_default(5000)]
    pub queue_timeout_ms: u64,
    /// Runtime used when a request does not name one.
    #[serde(default)]
    pub runtime: RuntimeKind,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            language: Language::default(),
            default_timeout: Duration::from_secs(60),
            use_pool: true,
            max_concurrent: 64,
            queue_timeout_ms: 5000,
            runtime: RuntimeKind::Docker,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde_inline_default(3)]
    pub min_size: usize,
    #[serde_inline_default(10)]
    pub max_size: usize,
    /// Seconds an idle container may sit unused before eviction.
    #[serde_inline_default(Duration::from_secs(300))]
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub warm_up_enabled: bool,
    /// Milliseconds `acquire` waits for an idle container.
    #[serde_inline_default(1000)]
    pub acquire_timeout_ms: u64,
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "duration_serde")]
    pub reconcile_interval: Duration,
    #[serde_inline_default(Duration::from_secs(60))]
    #[serde(with = "duration_serde")]
    pub max_reconcile_interval: Duration,
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "duration_serde")]
    pub warm_up_interval: Duration,
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "duration_serde")]
    pub warm_up_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 3,
            max_size: 10,
            idle_timeout: Duration::from_secs(300),
            warm_up_enabled: false,
            acquire_timeout_ms: 1000,
            reconcile_interval: Duration::from_secs(5),
            max_reconcile_interval: Duration::from_secs(60),
            warm_up_interval: Duration::from_secs(30),
            warm_up_grace: Duration::from_secs(10),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde_inline_default(128)]
    pub memory_mb: u64,
    /// 1000 = one CPU core.
    #[serde_inline_default(500)]
    pub cpu_millicores: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpu_millicores: 500,
        }
    }
}

impl LimitsConfig {
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: self.memory_mb * 1024 * 1024,
            cpu_millicores: self.cpu_millicores,
        }
    }
}

/// Configuration for the dataplane.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataplaneConfig {
    /// Environment name (e.g., "local", "staging", "production").
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Per-language image overrides.
    #[serde(default)]
    pub images: HashMap<Language, String>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        DataplaneConfig {
            env: LOCAL_ENV.to_string(),
            docker: DockerConfig::default(),
            execution: ExecutionConfig::default(),
            pool: PoolSettings::default(),
            limits: LimitsConfig::default(),
            images: HashMap::new(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DataplaneConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<DataplaneConfig> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<DataplaneConfig> {
        let mut config: DataplaneConfig =
            serde_yaml::from_str(config_str).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        self.docker.validate()?;

        if self.pool.max_size == 0 {
            anyhow::bail!("pool.max_size must be positive");
        }
        if self.pool.min_size > self.pool.max_size {
            anyhow::bail!(
                "pool.min_size ({}) must not exceed pool.max_size ({})",
                self.pool.min_size,
                self.pool.max_size
            );
        }
        if self.execution.default_timeout.is_zero() {
            anyhow::bail!("execution.default_timeout must be positive");
        }
        if self.execution.max_concurrent == 0 {
            anyhow::bail!("execution.max_concurrent must be positive");
        }
        if self.limits.memory_mb == 0 || self.limits.cpu_millicores == 0 {
            anyhow::bail!("limits.memory_mb and limits.cpu_millicores must be positive");
        }
        if self.pool.reconcile_interval.is_zero() {
            anyhow::bail!("pool.reconcile_interval must be positive");
        }
        if self.telemetry.metrics_interval.is_zero() {
            anyhow::bail!("telemetry.metrics_interval must be positive");
        }
        if self.pool.warm_up_enabled && self.pool.warm_up_interval.is_zero() {
            anyhow::bail!("pool.warm_up_interval must be positive");
        }
        // The cap can't sit below the base interval.
        if self.pool.max_reconcile_interval < self.pool.reconcile_interval {
            self.pool.max_reconcile_interval = self.pool.reconcile_interval;
        }

        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    /// Image used for `language`, honouring overrides.
    pub fn image_for(&self, language: Language) -> String {
        self.images
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }

    /// Pool configuration for the configured execution language.
    pub fn pool_config(&self) -> PoolConfig {
        let language = self.execution.language;
        PoolConfig {
            language,
            base_image: self.image_for(language),
            min_size: self.pool.min_size,
            max_size: self.pool.max_size,
            idle_timeout: self.pool.idle_timeout,
            warm_up_enabled: self.pool.warm_up_enabled,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            reconcile_interval: self.pool.reconcile_interval,
            max_reconcile_interval: self.pool.max_reconcile_interval,
            warm_up_interval: self.pool.warm_up_interval,
            warm_up_grace: self.pool.warm_up_grace,
            limits: self.limits.resource_limits(),
            ..PoolConfig::default()
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            language: self.execution.language,
            default_timeout: self.execution.default_timeout,
            limits: self.limits.resource_limits(),
            images: self.images.clone(),
        }
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.queue_timeout_ms)
    }
}

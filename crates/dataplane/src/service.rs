//! The caller-facing function service.
//!
//! Wires the engine, the warm pool, the execution runtime and the isolation
//! selector together, bounds how many executions run at once, and owns the
//! background tasks.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use crate::{
    config::DataplaneConfig,
    engine::{ContainerEngine, DockerEngine},
    isolation::{IsolationSelector, RuntimeAvailability, probe_runtime_availability},
    language::Language,
    metrics::{ExecutionRecord, MetricsSink, NoopMetricsSink, OtelMetricsSink},
    pool::{ContainerPool, PoolMetrics},
    runtime::{
        DEFAULT_RUNTIME_LABEL,
        ExecutionError,
        ExecutionRequest,
        ExecutionResult,
        ExecutionRuntime,
    },
};

pub struct FunctionService {
    config: DataplaneConfig,
    engine: Arc<dyn ContainerEngine>,
    pool: Option<Arc<ContainerPool>>,
    selector: IsolationSelector,
    metrics: Arc<dyn MetricsSink>,
    permits: Arc<Semaphore>,
    cancel_token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl FunctionService {
    /// Connect to Docker and start the service.
    pub async fn new(config: DataplaneConfig) -> Result<Self> {
        let engine = DockerEngine::connect(config.docker.address.as_deref())
            .await
            .context("Failed to connect to the container engine")?;
        let metrics: Arc<dyn MetricsSink> = if config.telemetry.enable_metrics {
            Arc::new(OtelMetricsSink::new())
        } else {
            Arc::new(NoopMetricsSink)
        };
        Self::with_engine(config, Arc::new(engine), metrics).await
    }

    /// Start the service on an existing engine.
    ///
    /// Removes containers left behind by a previous process, then starts the
    /// pool when pooling is enabled.
    pub async fn with_engine(
        config: DataplaneConfig,
        engine: Arc<dyn ContainerEngine>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let cleaned = cleanup_orphans(engine.as_ref()).await;
        if cleaned > 0 {
            info!(cleaned, "Cleaned up orphaned containers");
        }

        let pool = if config.execution.use_pool {
            let pool_config = config.pool_config();
            if let Err(e) = engine.ensure_image(&pool_config.base_image).await {
                warn!(image = %pool_config.base_image, error = ?e, "Failed to ensure pool image");
            }
            let pool = Arc::new(
                ContainerPool::new(pool_config, engine.clone())
                    .context("Invalid pool configuration")?,
            );
            pool.start().await;
            Some(pool)
        } else {
            None
        };

        let runtime = Arc::new(ExecutionRuntime::new(
            engine.clone(),
            config.runtime_config(),
            pool.clone(),
        ));
        let selector =
            IsolationSelector::new(runtime, config.execution.runtime, metrics.clone());

        let cancel_token = CancellationToken::new();
        let mut tasks = JoinSet::new();
        if let Some(pool) = &pool {
            let span = tracing::Span::current();
            tasks.spawn({
                let pool = pool.clone();
                let metrics = metrics.clone();
                let interval = config.telemetry.metrics_interval;
                let cancel_token = cancel_token.clone();
                async move { run_pool_gauge_loop(pool, metrics, interval, cancel_token).await }
                    .instrument(span)
            });
        }

        info!(
            env = %config.env,
            language = %config.execution.language,
            use_pool = config.execution.use_pool,
            runtime = %config.execution.runtime,
            max_concurrent = config.execution.max_concurrent,
            "Function service started"
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.execution.max_concurrent)),
            config,
            engine,
            pool,
            selector,
            metrics,
            cancel_token,
            tasks: Mutex::new(tasks),
        })
    }

    /// Run one request. Waits up to `execution.queue_timeout_ms` for a free
    /// execution slot, failing with a capacity error otherwise.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let permit = match tokio::time::timeout(
            self.config.queue_timeout(),
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(
                    max_concurrent = self.config.execution.max_concurrent,
                    event = "capacity_exhausted",
                    "No execution slot available"
                );
                return self.capacity_exhausted(&request);
            }
        };

        let result = self.selector.execute(request).await;
        drop(permit);
        result
    }

    fn capacity_exhausted(&self, request: &ExecutionRequest) -> ExecutionResult {
        let language = request.language.unwrap_or(self.config.execution.language);
        let mut result = ExecutionResult::failure(&ExecutionError::CapacityExhausted, language);
        result.runtime = DEFAULT_RUNTIME_LABEL.to_string();
        result.runtime_requested = Some(
            request
                .runtime
                .clone()
                .unwrap_or_else(|| self.config.execution.runtime.to_string()),
        );
        self.metrics.record_execution(&ExecutionRecord::from_result(
            uuid::Uuid::new_v4().to_string(),
            &result,
        ));
        result
    }

    /// Pool snapshot, or `None` when pooling is disabled.
    pub async fn pool_metrics(&self) -> Option<PoolMetrics> {
        match &self.pool {
            Some(pool) => Some(pool.metrics().await),
            None => None,
        }
    }

    /// Make sure every language image is present locally, pulling missing
    /// ones.
    pub async fn preload_images(&self) -> Result<()> {
        preload_images(self.engine.as_ref(), &self.config).await
    }

    pub async fn runtime_availability(&self) -> RuntimeAvailability {
        probe_runtime_availability(self.engine.as_ref()).await
    }

    /// Stop accepting work, stop background tasks and remove pooled
    /// containers.
    pub async fn shutdown(&self) {
        info!("Shutting down function service");
        self.permits.close();
        self.cancel_token.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while tasks.join_next().await.is_some() {}
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }
}

/// Ensure the image of every language is present on `engine`.
pub async fn preload_images(engine: &dyn ContainerEngine, config: &DataplaneConfig) -> Result<()> {
    for language in Language::ALL {
        let image = config.image_for(language);
        engine
            .ensure_image(&image)
            .await
            .with_context(|| format!("Failed to preload {} image {}", language, image))?;
        info!(language = %language, image = %image, "Image ready");
    }
    Ok(())
}

/// Remove managed containers that no live pool owns. Runs before the pool
/// starts, so every managed container is an orphan.
async fn cleanup_orphans(engine: &dyn ContainerEngine) -> usize {
    let containers = match engine.list_managed().await {
        Ok(containers) => containers,
        Err(e) => {
            warn!(error = ?e, "Failed to list containers for orphan cleanup");
            return 0;
        }
    };

    let mut cleaned = 0;
    for container_id in containers {
        info!(container_id = %container_id, "Removing orphaned container");
        if let Err(e) = engine.remove(&container_id).await {
            warn!(container_id = %container_id, error = ?e, "Failed to remove orphaned container");
        } else {
            cleaned += 1;
        }
    }
    cleaned
}

/// Push pool sizes into the metrics sink until cancelled.
async fn run_pool_gauge_loop(
    pool: Arc<ContainerPool>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = ticker.tick() => {
                metrics.update_pool(&pool.metrics().await);
            }
        }
    }
}

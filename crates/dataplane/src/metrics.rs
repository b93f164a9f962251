//! Execution metrics.
//!
//! Every execution produces one [`ExecutionRecord`], handed to a
//! [`MetricsSink`]. [`OtelMetricsSink`] turns records into OTLP counters and
//! a latency histogram, and exposes pool gauges read from the latest
//! [`PoolMetrics`] snapshot.

use std::sync::Arc;

use anyhow::Result;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, ObservableGauge},
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    config::TelemetryConfig,
    language::Language,
    pool::PoolMetrics,
    runtime::{ErrorKind, ExecutionResult, ExecutionStatus},
};

const METER_NAME: &str = "faas-dataplane";

/// Initialize the OpenTelemetry metrics provider.
///
/// Installs the global meter provider with OTLP export when metrics are
/// enabled. Must be called before any sink is built.
pub fn init_provider(config: &TelemetryConfig, env: &str) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "faas"))
        .with_attribute(KeyValue::new("service.name", METER_NAME))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new("deployment.environment", env.to_string()))
        .build();

    let mut exporter_builder = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint.clone());
    }
    let exporter = exporter_builder.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.metrics_interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);

    tracing::info!(
        endpoint = ?config.endpoint,
        interval_secs = config.metrics_interval.as_secs(),
        "Metrics provider initialized"
    );

    Ok(())
}

/// One execution, as reported to the metrics sink.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub language: Language,
    /// Runtime that actually executed the function.
    pub runtime: String,
    pub runtime_requested: Option<String>,
    pub runtime_fallback: bool,
    pub status: ExecutionStatus,
    pub error_kind: Option<ErrorKind>,
    pub warm_start: bool,
    pub execution_time: f64,
    /// Unix timestamp in seconds.
    pub timestamp: f64,
}

impl ExecutionRecord {
    pub fn from_result(execution_id: String, result: &ExecutionResult) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            execution_id,
            language: result.language,
            runtime: result.runtime.clone(),
            runtime_requested: result.runtime_requested.clone(),
            runtime_fallback: result.runtime_fallback,
            status: result.status,
            error_kind: result.error_kind,
            warm_start: result.warm_start,
            execution_time: result.execution_time,
            timestamp,
        }
    }
}

/// Receives one record per execution.
pub trait MetricsSink: Send + Sync {
    fn record_execution(&self, record: &ExecutionRecord);

    /// Latest pool snapshot, for gauges. Ignored by default.
    fn update_pool(&self, _metrics: &PoolMetrics) {}
}

/// Drops every record.
#[derive(Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_execution(&self, _record: &ExecutionRecord) {}
}

/// Pool sizes read by the observable gauges.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolGaugeState {
    pub total: u64,
    pub idle: u64,
    pub busy: u64,
    pub queued: u64,
}

#[derive(Clone)]
struct ExecutionCounters {
    executions: Counter<u64>,
    execution_errors: Counter<u64>,
    warm_starts: Counter<u64>,
    cold_starts: Counter<u64>,
    runtime_fallbacks: Counter<u64>,
    execution_latency_seconds: Histogram<f64>,
}

impl ExecutionCounters {
    fn new() -> Self {
        let meter = opentelemetry::global::meter(METER_NAME);

        Self {
            executions: meter
                .u64_counter("faas.dataplane.executions")
                .with_description("Number of function executions")
                .build(),
            execution_errors: meter
                .u64_counter("faas.dataplane.execution_errors")
                .with_description("Number of function executions that returned an error")
                .build(),
            warm_starts: meter
                .u64_counter("faas.dataplane.warm_starts")
                .with_description("Number of executions served by a pooled container")
                .build(),
            cold_starts: meter
                .u64_counter("faas.dataplane.cold_starts")
                .with_description("Number of executions that created a container")
                .build(),
            runtime_fallbacks: meter
                .u64_counter("faas.dataplane.runtime_fallbacks")
                .with_description("Number of executions that fell back from the requested runtime")
                .build(),
            execution_latency_seconds: meter
                .f64_histogram("faas.dataplane.execution_latency_seconds")
                .with_description("Wall-clock execution latency")
                .with_unit("s")
                .build(),
        }
    }
}

#[allow(dead_code)] // Gauges must stay alive to keep their callbacks registered.
struct PoolGauges {
    total: ObservableGauge<u64>,
    idle: ObservableGauge<u64>,
    busy: ObservableGauge<u64>,
    queued: ObservableGauge<u64>,
}

impl PoolGauges {
    fn new(state: Arc<Mutex<PoolGaugeState>>) -> Self {
        let meter = opentelemetry::global::meter(METER_NAME);
        let gauge = |name: &'static str, description: &'static str, read: fn(&PoolGaugeState) -> u64| {
            let state = state.clone();
            meter
                .u64_observable_gauge(name)
                .with_description(description)
                .with_callback(move |observer| {
                    if let Ok(state) = state.try_lock() {
                        observer.observe(read(&state), &[]);
                    }
                })
                .build()
        };

        Self {
            total: gauge(
                "faas.dataplane.pool.containers",
                "Containers tracked by the pool",
                |s| s.total,
            ),
            idle: gauge(
                "faas.dataplane.pool.idle",
                "Idle pooled containers",
                |s| s.idle,
            ),
            busy: gauge(
                "faas.dataplane.pool.busy",
                "Busy pooled containers",
                |s| s.busy,
            ),
            queued: gauge(
                "faas.dataplane.pool.queue_size",
                "Containers waiting in the available queue",
                |s| s.queued,
            ),
        }
    }
}

/// Records executions as OpenTelemetry metrics.
pub struct OtelMetricsSink {
    counters: ExecutionCounters,
    pool_state: Arc<Mutex<PoolGaugeState>>,
    _gauges: PoolGauges,
}

impl OtelMetricsSink {
    pub fn new() -> Self {
        let pool_state = Arc::new(Mutex::new(PoolGaugeState::default()));
        Self {
            counters: ExecutionCounters::new(),
            _gauges: PoolGauges::new(pool_state.clone()),
            pool_state,
        }
    }
}

impl Default for OtelMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for OtelMetricsSink {
    fn record_execution(&self, record: &ExecutionRecord) {
        let attrs = [
            KeyValue::new("language", record.language.to_string()),
            KeyValue::new("runtime", record.runtime.clone()),
            KeyValue::new("status", record.status.to_string()),
        ];

        self.counters.executions.add(1, &attrs);
        if record.status == ExecutionStatus::Error {
            let mut error_attrs = attrs.to_vec();
            if let Some(kind) = record.error_kind {
                error_attrs.push(KeyValue::new("error_kind", kind.to_string()));
            }
            self.counters.execution_errors.add(1, &error_attrs);
        }
        if record.warm_start {
            self.counters.warm_starts.add(1, &attrs);
        } else {
            self.counters.cold_starts.add(1, &attrs);
        }
        if record.runtime_fallback {
            self.counters.runtime_fallbacks.add(1, &attrs);
        }
        self.counters
            .execution_latency_seconds
            .record(record.execution_time, &attrs);
    }

    fn update_pool(&self, metrics: &PoolMetrics) {
        if let Ok(mut state) = self.pool_state.try_lock() {
            *state = PoolGaugeState {
                total: metrics.total_containers as u64,
                idle: metrics.idle_containers as u64,
                busy: metrics.busy_containers as u64,
                queued: metrics.queue_size as u64,
            };
        }
    }
}

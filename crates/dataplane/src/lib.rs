//! Warm-pooled container execution for user-supplied functions.
//!
//! This module exposes the dataplane components for the binary, for tests
//! and for embedding in other services.

pub mod config;
pub mod engine;
pub mod isolation;
pub mod language;
pub mod metrics;
pub mod otel_tracing;
pub mod pool;
pub mod retry;
pub mod runtime;
pub mod service;

pub use config::DataplaneConfig;
pub use engine::{ContainerEngine, DockerEngine};
pub use isolation::{IsolationSelector, RuntimeAvailability, RuntimeKind, probe_runtime_availability};
pub use language::Language;
pub use metrics::{ExecutionRecord, MetricsSink, NoopMetricsSink, OtelMetricsSink};
pub use pool::{ContainerPool, PoolConfig, PoolMetrics};
pub use runtime::{
    ErrorKind,
    ExecutionError,
    ExecutionRequest,
    ExecutionResult,
    ExecutionRuntime,
    ExecutionStatus,
    RuntimeConfig,
};
pub use service::FunctionService;

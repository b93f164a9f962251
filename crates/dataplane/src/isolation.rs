//! Isolation runtime selection.
//!
//! A request may ask for the hardened gVisor runtime. The engine is probed
//! before every execution; when `runsc` is registered the execution runs
//! under it, otherwise it runs on the standard runtime and the result is
//! flagged as a fallback. Either way it gets a fresh container.

use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{Instrument, info_span, warn};

use crate::{
    engine::ContainerEngine,
    metrics::{ExecutionRecord, MetricsSink},
    runtime::{DEFAULT_RUNTIME_LABEL, ExecutionRequest, ExecutionResult, ExecutionRuntime},
};

/// OCI runtime name gVisor registers with the engine.
pub const GVISOR_RUNTIME: &str = "runsc";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RuntimeKind {
    #[default]
    Docker,
    Gvisor,
}

/// What the engine can run, as of one probe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeAvailability {
    pub gvisor: bool,
    /// OCI runtimes registered with the engine.
    pub runtimes: Vec<String>,
    /// Set when the engine could not be asked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ask the engine which OCI runtimes it has. A failed probe reports gVisor
/// as unavailable.
pub async fn probe_runtime_availability(engine: &dyn ContainerEngine) -> RuntimeAvailability {
    match engine.runtimes().await {
        Ok(runtimes) => RuntimeAvailability {
            gvisor: runtimes.iter().any(|r| r == GVISOR_RUNTIME),
            runtimes,
            error: None,
        },
        Err(e) => {
            warn!(error = ?e, "Failed to probe container runtimes");
            RuntimeAvailability {
                error: Some(format!("{:#}", e)),
                ..Default::default()
            }
        }
    }
}

/// Where one execution ended up running.
struct Selection {
    oci_runtime: Option<&'static str>,
    label: &'static str,
    /// gVisor requests always get a fresh container, fallback included.
    pooled: bool,
    note: Option<String>,
}

impl Selection {
    fn standard(note: Option<String>) -> Self {
        Self {
            oci_runtime: None,
            label: DEFAULT_RUNTIME_LABEL,
            pooled: true,
            note,
        }
    }
}

pub struct IsolationSelector {
    runtime: Arc<ExecutionRuntime>,
    default_kind: RuntimeKind,
    metrics: Arc<dyn MetricsSink>,
}

impl IsolationSelector {
    pub fn new(
        runtime: Arc<ExecutionRuntime>,
        default_kind: RuntimeKind,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            runtime,
            default_kind,
            metrics,
        }
    }

    pub fn runtime(&self) -> &Arc<ExecutionRuntime> {
        &self.runtime
    }

    /// Run one request under the runtime it asked for, or the closest one
    /// available.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let language = request.language.unwrap_or(self.runtime.language());
        let span = info_span!(
            "execution",
            execution_id = %execution_id,
            language = %language,
            function = %request.function_name,
        );

        async {
            let requested = request
                .runtime
                .clone()
                .unwrap_or_else(|| self.default_kind.to_string());
            let selection = self.select(&requested).await;

            let mut result = if selection.pooled {
                self.runtime.execute(&request, selection.oci_runtime).await
            } else {
                self.runtime
                    .execute_fresh(&request, selection.oci_runtime)
                    .await
            };
            result.runtime = selection.label.to_string();
            result.runtime_requested = Some(requested);
            result.runtime_fallback = selection.note.is_some();
            result.runtime_note = selection.note;

            self.metrics
                .record_execution(&ExecutionRecord::from_result(execution_id.clone(), &result));
            result
        }
        .instrument(span)
        .await
    }

    async fn select(&self, requested: &str) -> Selection {
        match RuntimeKind::from_str(requested) {
            Ok(RuntimeKind::Docker) => Selection::standard(None),
            Ok(RuntimeKind::Gvisor) => {
                let availability = probe_runtime_availability(self.runtime.engine().as_ref()).await;
                if availability.gvisor {
                    Selection {
                        oci_runtime: Some(GVISOR_RUNTIME),
                        label: "gvisor",
                        pooled: false,
                        note: None,
                    }
                } else {
                    warn!(
                        event = "runtime_fallback",
                        requested = %requested,
                        "gVisor requested but not available, falling back to docker"
                    );
                    Selection {
                        pooled: false,
                        ..Selection::standard(Some(
                            "gVisor runtime requested but not available; ran on docker"
                                .to_string(),
                        ))
                    }
                }
            }
            Err(_) => {
                warn!(
                    event = "runtime_fallback",
                    requested = %requested,
                    "Unknown runtime requested, falling back to docker"
                );
                Selection::standard(Some(format!(
                    "Unknown runtime '{}' requested; ran on docker",
                    requested
                )))
            }
        }
    }
}

//! Execution requests, results and the failure taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::language::Language;

/// Prefix the function host puts on errors raised while loading user code.
const LOAD_ERROR_PREFIX: &str = "Failed to load function";

/// One function invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default = "default_function_name")]
    pub function_name: String,
    #[serde(default = "default_input")]
    pub input: serde_json::Value,
    /// Falls back to the configured default when unset.
    #[serde(default, with = "crate::config::duration_serde::option")]
    pub timeout: Option<Duration>,
    /// Falls back to the runtime's language when unset.
    #[serde(default)]
    pub language: Option<Language>,
    /// Requested isolation runtime kind (`docker` or `gvisor`).
    #[serde(default)]
    pub runtime: Option<String>,
}

fn default_function_name() -> String {
    "handler".to_string()
}

fn default_input() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            function_name: default_function_name(),
            input: default_input(),
            timeout: None,
            language: None,
            runtime: None,
        }
    }

    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Machine-readable class of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// User code could not be loaded (syntax error, missing entry point).
    FunctionLoad,
    /// User code raised.
    FunctionRuntime,
    Timeout,
    /// The engine failed to create, start, or talk to a container.
    Infrastructure,
    /// The function host printed something that is not a result.
    InvalidOutput,
    /// No capacity was left to run the execution.
    CapacityExhausted,
}

/// Every way an execution can fail. Surfaced as an error result, never
/// raised to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("{message}")]
    FunctionLoad {
        message: String,
        traceback: Option<String>,
    },

    #[error("{message}")]
    FunctionRuntime {
        message: String,
        traceback: Option<String>,
    },

    #[error("Function execution timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Function execution failed: {0}")]
    Infrastructure(String),

    #[error("Failed to parse function output")]
    InvalidOutput { logs: String },

    #[error("No execution capacity available")]
    CapacityExhausted,
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::FunctionLoad { .. } => ErrorKind::FunctionLoad,
            ExecutionError::FunctionRuntime { .. } => ErrorKind::FunctionRuntime,
            ExecutionError::Timeout(_) => ErrorKind::Timeout,
            ExecutionError::Infrastructure(_) => ErrorKind::Infrastructure,
            ExecutionError::InvalidOutput { .. } => ErrorKind::InvalidOutput,
            ExecutionError::CapacityExhausted => ErrorKind::CapacityExhausted,
        }
    }

    pub fn infrastructure(err: &anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        ExecutionError::Infrastructure(format!("{:#}", err))
    }

    fn traceback(&self) -> Option<String> {
        match self {
            ExecutionError::FunctionLoad { traceback, .. } |
            ExecutionError::FunctionRuntime { traceback, .. } => traceback.clone(),
            _ => None,
        }
    }

    fn logs(&self) -> Option<String> {
        match self {
            ExecutionError::InvalidOutput { logs } => Some(logs.clone()),
            _ => None,
        }
    }
}

/// Outcome of one execution, as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Raw container output, attached when it could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Wall-clock seconds measured by the runtime.
    pub execution_time: f64,
    /// Seconds the function itself ran, as reported by the function host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub warm_start: bool,
    /// Runtime that actually executed the function.
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_requested: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub runtime_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_note: Option<String>,
    pub language: Language,
}

impl ExecutionResult {
    pub fn success(result: serde_json::Value, language: Language) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result: Some(result),
            ..Self::empty(ExecutionStatus::Success, language)
        }
    }

    pub fn failure(error: &ExecutionError, language: Language) -> Self {
        Self {
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            traceback: error.traceback(),
            logs: error.logs(),
            ..Self::empty(ExecutionStatus::Error, language)
        }
    }

    fn empty(status: ExecutionStatus, language: Language) -> Self {
        Self {
            status,
            result: None,
            error: None,
            error_kind: None,
            traceback: None,
            logs: None,
            execution_time: 0.0,
            function_execution_time: None,
            container_id: None,
            warm_start: false,
            runtime: String::new(),
            runtime_requested: None,
            runtime_fallback: false,
            runtime_note: None,
            language,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// What the function host prints on stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub(crate) enum HostOutput {
    Success {
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        execution_time: Option<f64>,
    },
    Error {
        error: String,
        #[serde(default)]
        traceback: Option<String>,
        #[serde(default)]
        execution_time: Option<f64>,
    },
}

impl HostOutput {
    /// Parse the host's stdout. The result is expected to be the whole
    /// output; if user code printed before it, the last line is tried.
    pub fn parse(stdout: &str) -> Option<Self> {
        let trimmed = stdout.trim();
        if let Ok(output) = serde_json::from_str(trimmed) {
            return Some(output);
        }
        let last_line = trimmed.lines().rev().find(|l| !l.trim().is_empty())?;
        serde_json::from_str(last_line.trim()).ok()
    }

    pub fn execution_time(&self) -> Option<f64> {
        match self {
            HostOutput::Success { execution_time, .. } |
            HostOutput::Error { execution_time, .. } => *execution_time,
        }
    }

    /// Convert into a result for `language`.
    pub fn into_result(self, language: Language) -> ExecutionResult {
        let function_execution_time = self.execution_time();
        let mut result = match self {
            HostOutput::Success { result, .. } => ExecutionResult::success(result, language),
            HostOutput::Error {
                error, traceback, ..
            } => {
                let error = if error.starts_with(LOAD_ERROR_PREFIX) {
                    ExecutionError::FunctionLoad {
                        message: error,
                        traceback,
                    }
                } else {
                    ExecutionError::FunctionRuntime {
                        message: error,
                        traceback,
                    }
                };
                ExecutionResult::failure(&error, language)
            }
        };
        result.function_execution_time = function_execution_time;
        result
    }
}

//! Execution runtime.
//!
//! Turns one invocation into a container lifecycle event. The warm path
//! reuses a pooled container: the code is copied in and the function host is
//! exec'd. The cold path creates a single-use container with the code bind
//! mounted read-only, waits for it under the timeout and always removes it.
//! Every outcome, including infrastructure failures, comes back as an
//! [`ExecutionResult`].

mod code_file;
mod result;

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use self::{
    code_file::CodeFile,
    result::{ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult, ExecutionStatus},
};
pub(crate) use self::result::HostOutput;
use crate::{
    engine::{
        ContainerEngine,
        ContainerRole,
        ContainerSpec,
        ExecOutput,
        ResourceLimits,
        container_labels,
    },
    language::{FUNCTION_DIR, Language},
    pool::{CachedFunction, ContainerPool, ExecutionStats},
};

/// Runtime label for containers run under the engine's default runtime.
pub const DEFAULT_RUNTIME_LABEL: &str = "docker";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Language served by the pool and used when a request names none.
    pub language: Language,
    pub default_timeout: Duration,
    pub limits: ResourceLimits,
    /// Per-language image overrides.
    pub images: HashMap<Language, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            language: Language::default(),
            default_timeout: Duration::from_secs(60),
            limits: ResourceLimits::default(),
            images: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn image_for(&self, language: Language) -> String {
        self.images
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }
}

pub struct ExecutionRuntime {
    engine: Arc<dyn ContainerEngine>,
    config: RuntimeConfig,
    pool: Option<Arc<ContainerPool>>,
}

impl ExecutionRuntime {
    /// Build a runtime. Without a pool every execution takes the cold path.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: RuntimeConfig,
        pool: Option<Arc<ContainerPool>>,
    ) -> Self {
        Self {
            engine,
            config,
            pool,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn pool(&self) -> Option<&Arc<ContainerPool>> {
        self.pool.as_ref()
    }

    pub fn language(&self) -> Language {
        self.config.language
    }

    /// Run one invocation.
    ///
    /// `isolation_runtime` names an OCI runtime (e.g. `runsc`) to run under.
    /// Pooled containers run under the default runtime, so requesting one
    /// forces the cold path.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        isolation_runtime: Option<&str>,
    ) -> ExecutionResult {
        self.execute_with(request, isolation_runtime, true).await
    }

    /// Run one invocation on a single-use container, never the pool.
    pub async fn execute_fresh(
        &self,
        request: &ExecutionRequest,
        isolation_runtime: Option<&str>,
    ) -> ExecutionResult {
        self.execute_with(request, isolation_runtime, false).await
    }

    async fn execute_with(
        &self,
        request: &ExecutionRequest,
        isolation_runtime: Option<&str>,
        pooled: bool,
    ) -> ExecutionResult {
        let language = request.language.unwrap_or(self.config.language);
        // The pool only holds containers for the runtime's own language;
        // other languages run non-pooled.
        let pool = self.pool.as_deref().filter(|_| {
            pooled && language == self.config.language && isolation_runtime.is_none()
        });
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let started = Instant::now();
        let mut result = self.run(request, language, pool, isolation_runtime, timeout).await;
        result.execution_time = started.elapsed().as_secs_f64();
        result.runtime = isolation_runtime
            .unwrap_or(DEFAULT_RUNTIME_LABEL)
            .to_string();

        info!(
            status = %result.status,
            error_kind = ?result.error_kind,
            warm_start = result.warm_start,
            container_id = ?result.container_id,
            execution_time = result.execution_time,
            event = "execution_finished",
            "Execution finished"
        );
        result
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        language: Language,
        pool: Option<&ContainerPool>,
        isolation_runtime: Option<&str>,
        timeout: Duration,
    ) -> ExecutionResult {
        let code_file = match CodeFile::write(&request.code, language) {
            Ok(file) => file,
            Err(e) => {
                return ExecutionResult::failure(&ExecutionError::infrastructure(&e), language);
            }
        };

        if let Some(pool) = pool &&
            let Some(id) = pool.acquire().await &&
            let Some(result) = self
                .run_warm(pool, &id, &code_file, request, language, timeout)
                .await
        {
            return result;
        }

        self.run_cold(&code_file, request, language, isolation_runtime, timeout)
            .await
    }

    /// Run in a pooled container. `None` means the warm path failed and the
    /// caller should fall back to a fresh container.
    async fn run_warm(
        &self,
        pool: &ContainerPool,
        id: &str,
        code_file: &CodeFile,
        request: &ExecutionRequest,
        language: Language,
        timeout: Duration,
    ) -> Option<ExecutionResult> {
        debug!(container_id = %id, "Running on pooled container");
        let started = Instant::now();

        let output = match tokio::time::timeout(
            timeout,
            self.exec_in_container(id, code_file, request, language),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(container_id = %id, error = ?e, "Warm execution failed, falling back to a new container");
                pool.release(
                    id,
                    Some(ExecutionStats::failure(started.elapsed(), format!("{:#}", e))),
                )
                .await;
                return None;
            }
            Err(_) => {
                // The exec may still be running inside it.
                warn!(container_id = %id, "Warm execution timed out, removing container");
                pool.remove(id).await;
                let mut result =
                    ExecutionResult::failure(&ExecutionError::Timeout(timeout), language);
                result.container_id = Some(id.to_string());
                result.warm_start = true;
                return Some(result);
            }
        };
        let elapsed = started.elapsed();

        let Some(host_output) = HostOutput::parse(&output.stdout) else {
            warn!(
                container_id = %id,
                exit_code = ?output.exit_code,
                "Unparsable output from pooled container, falling back to a new container"
            );
            pool.release(
                id,
                Some(ExecutionStats::failure(elapsed, "Failed to parse function output")),
            )
            .await;
            return None;
        };

        let mut result = host_output.into_result(language);
        let stats = match &result.error {
            None => ExecutionStats::success(elapsed),
            Some(error) => ExecutionStats::failure(elapsed, error.clone()),
        };
        pool.release(id, Some(stats)).await;

        if result.is_success() && pool.config().warm_up_enabled {
            pool.remember_function(CachedFunction {
                code: request.code.clone(),
                function_name: request.function_name.clone(),
                input: request.input.clone(),
            })
            .await;
        }

        result.container_id = Some(id.to_string());
        result.warm_start = true;
        Some(result)
    }

    async fn exec_in_container(
        &self,
        id: &str,
        code_file: &CodeFile,
        request: &ExecutionRequest,
        language: Language,
    ) -> anyhow::Result<ExecOutput> {
        let code = tokio::fs::read(code_file.path()).await?;
        self.engine
            .copy_file(id, FUNCTION_DIR, &language.code_file_name(), &code)
            .await?;
        let env = language.host_env(
            &language.container_code_path(),
            &request.function_name,
            &request.input,
        );
        self.engine.exec(id, language.host_command(), env).await
    }

    /// Run in a fresh single-use container, always removed afterwards.
    async fn run_cold(
        &self,
        code_file: &CodeFile,
        request: &ExecutionRequest,
        language: Language,
        isolation_runtime: Option<&str>,
        timeout: Duration,
    ) -> ExecutionResult {
        let code_path = language.container_code_path();
        let spec = ContainerSpec {
            name: ContainerRole::Ephemeral.container_name(),
            image: self.config.image_for(language),
            command: None,
            env: language.host_env(&code_path, &request.function_name, &request.input),
            binds: vec![code_file.read_only_bind(&code_path)],
            limits: self.config.limits.clone(),
            network_disabled: true,
            runtime: isolation_runtime.map(str::to_string),
            labels: container_labels(language, ContainerRole::Ephemeral),
        };
        let name = spec.name.clone();

        let id = match self.engine.create(spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(container = %name, error = ?e, "Failed to create function container");
                return ExecutionResult::failure(&ExecutionError::infrastructure(&e), language);
            }
        };
        debug!(container_id = %id, container = %name, "Running on new container");

        let mut result = match self.run_to_completion(&id, timeout).await {
            Ok(host_output) => host_output.into_result(language),
            Err(error) => ExecutionResult::failure(&error, language),
        };

        if let Err(e) = self.engine.remove(&id).await {
            warn!(container_id = %id, error = ?e, "Failed to remove function container");
        }

        result.container_id = Some(id);
        result.warm_start = false;
        result
    }

    async fn run_to_completion(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<HostOutput, ExecutionError> {
        self.engine
            .start(id)
            .await
            .map_err(|e| ExecutionError::infrastructure(&e))?;

        let output = match tokio::time::timeout(timeout, self.engine.wait(id)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecutionError::infrastructure(&e)),
            Err(_) => {
                warn!(container_id = %id, timeout_secs = timeout.as_secs_f64(), "Function timed out");
                return Err(ExecutionError::Timeout(timeout));
            }
        };

        HostOutput::parse(&output.stdout).ok_or_else(|| {
            warn!(container_id = %id, exit_code = output.exit_code, "Unparsable function output");
            let mut logs = output.stdout.trim().to_string();
            if !output.stderr.trim().is_empty() {
                if !logs.is_empty() {
                    logs.push('\n');
                }
                logs.push_str(output.stderr.trim());
            }
            ExecutionError::InvalidOutput { logs }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::{
        engine::ContainerOutput,
        pool::tests::{MockEngine, test_config},
    };

    const FIXED_POINT: &str = "def handler(event):\n    return event\n";

    fn success_stdout(result: serde_json::Value) -> String {
        json!({"status": "success", "result": result, "execution_time": 0.001}).to_string()
    }

    fn error_stdout(error: &str) -> String {
        json!({"status": "error", "error": error, "traceback": "Traceback (most recent call last): ...", "execution_time": 0.002})
            .to_string()
    }

    async fn pooled_runtime(min_size: usize) -> (ExecutionRuntime, Arc<ContainerPool>, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::default());
        let pool = Arc::new(ContainerPool::new(test_config(min_size, 4), engine.clone()).unwrap());
        pool.reconcile_once().await;
        let runtime = ExecutionRuntime::new(engine.clone(), RuntimeConfig::default(), Some(pool.clone()));
        (runtime, pool, engine)
    }

    fn cold_runtime() -> (ExecutionRuntime, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::default());
        let runtime = ExecutionRuntime::new(engine.clone(), RuntimeConfig::default(), None);
        (runtime, engine)
    }

    fn set_exec(engine: &MockEngine, stdout: String) {
        *engine.exec_output.lock().unwrap() = ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        };
    }

    fn set_wait(engine: &MockEngine, stdout: String) {
        *engine.wait_output.lock().unwrap() = ContainerOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        };
    }

    #[tokio::test]
    async fn test_fixed_point_function_runs_warm() {
        let (runtime, pool, engine) = pooled_runtime(1).await;
        let input = json!({"a": [1, 2, 3]});
        set_exec(&engine, success_stdout(input.clone()));

        let request = ExecutionRequest::new(FIXED_POINT).input(input.clone());
        let result = runtime.execute(&request, None).await;

        assert!(result.is_success());
        assert_eq!(result.result, Some(input.clone()));
        assert!(result.warm_start);
        assert_eq!(result.runtime, "docker");
        assert_eq!(result.function_execution_time, Some(0.001));
        let id = result.container_id.clone().unwrap();

        let copies = engine.copies.lock().unwrap().clone();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, id);
        assert_eq!(copies[0].1, "/function/function_code.py");
        assert_eq!(copies[0].2, FIXED_POINT.as_bytes());
        let execs = engine.execs.lock().unwrap().clone();
        assert!(execs[0].1.contains(&("INPUT_DATA".to_string(), input.to_string())));

        let metrics = pool.metrics().await;
        assert_eq!(metrics.queue_size, 1);
        assert_eq!(metrics.per_container_metrics[&id].metrics.executions, 1);
        assert_eq!(metrics.per_container_metrics[&id].metrics.error_count, 0);
    }

    #[tokio::test]
    async fn test_fixed_point_function_runs_cold() {
        let (runtime, engine) = cold_runtime();
        let input = json!({"k": "v"});
        set_wait(&engine, success_stdout(input.clone()));

        let request = ExecutionRequest::new(FIXED_POINT).input(input.clone());
        let result = runtime.execute(&request, None).await;

        assert!(result.is_success());
        assert_eq!(result.result, Some(input));
        assert!(!result.warm_start);
        let id = result.container_id.clone().unwrap();
        assert_eq!(*engine.removed.lock().unwrap(), vec![id]);

        let spec = engine.specs.lock().unwrap()[0].clone();
        assert!(spec.name.starts_with("faas-fn-"));
        assert!(spec.network_disabled);
        assert_eq!(spec.image, "python-function:latest");
        assert_eq!(spec.command, None);
        assert_eq!(spec.runtime, None);
        assert!(spec.binds[0].ends_with(":/function/function_code.py:ro"));
        assert!(spec.env.contains(&("FUNCTION_NAME".to_string(), "handler".to_string())));
        assert_eq!(spec.limits, ResourceLimits::default());
    }

    #[tokio::test]
    async fn test_user_error_releases_pooled_container_with_error_stats() {
        let (runtime, pool, engine) = pooled_runtime(1).await;
        set_exec(&engine, error_stdout("division by zero"));

        let result = runtime.execute(&ExecutionRequest::new("def handler(e): 1/0"), None).await;

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error.as_deref(), Some("division by zero"));
        assert_eq!(result.error_kind, Some(ErrorKind::FunctionRuntime));
        assert!(result.traceback.unwrap().starts_with("Traceback"));
        assert!(result.warm_start);

        let id = result.container_id.unwrap();
        let metrics = pool.metrics().await;
        let container = &metrics.per_container_metrics[&id];
        assert_eq!(container.metrics.error_count, 1);
        assert_eq!(container.metrics.last_error.as_deref(), Some("division by zero"));
        assert_eq!(metrics.queue_size, 1);
        assert_eq!(engine.removed_count(), 0);
    }

    #[tokio::test]
    async fn test_user_error_on_cold_path_removes_container() {
        let (runtime, engine) = cold_runtime();
        set_wait(&engine, error_stdout("Failed to load function: Function 'handler' not found in module"));

        let result = runtime.execute(&ExecutionRequest::new("x = 1"), None).await;

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::FunctionLoad));
        assert_eq!(engine.removed_count(), 1);
    }

    #[tokio::test]
    async fn test_cold_timeout_returns_error_and_removes_container() {
        let (runtime, engine) = cold_runtime();
        *engine.wait_delay.lock().unwrap() = Duration::from_secs(5);

        let request = ExecutionRequest::new("while True: pass").timeout(Duration::from_millis(50));
        let result = runtime.execute(&request, None).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.execution_time < 1.0);
        assert_eq!(engine.removed_count(), 1);
    }

    #[tokio::test]
    async fn test_warm_timeout_removes_pooled_container() {
        let (runtime, pool, engine) = pooled_runtime(1).await;
        *engine.exec_delay.lock().unwrap() = Duration::from_secs(5);

        let request = ExecutionRequest::new("while True: pass").timeout(Duration::from_millis(50));
        let result = runtime.execute(&request, None).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.warm_start);
        assert_eq!(pool.metrics().await.total_containers, 0);
        assert_eq!(engine.removed_count(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_warm_output_falls_back_to_cold() {
        let (runtime, pool, engine) = pooled_runtime(1).await;
        set_exec(&engine, "Segmentation fault".to_string());
        set_wait(&engine, success_stdout(json!(7)));

        let result = runtime.execute(&ExecutionRequest::new("def handler(e): return 7"), None).await;

        assert!(result.is_success());
        assert_eq!(result.result, Some(json!(7)));
        assert!(!result.warm_start);

        // The pooled container went back with an error recorded.
        let metrics = pool.metrics().await;
        assert_eq!(metrics.queue_size, 1);
        let pooled = metrics.per_container_metrics.values().next().unwrap();
        assert_eq!(pooled.metrics.error_count, 1);
    }

    #[tokio::test]
    async fn test_copy_failure_falls_back_to_cold() {
        let (runtime, _pool, engine) = pooled_runtime(1).await;
        engine.fail_copy.store(true, Ordering::SeqCst);
        set_wait(&engine, success_stdout(json!("cold")));

        let result = runtime.execute(&ExecutionRequest::new(FIXED_POINT), None).await;
        assert!(result.is_success());
        assert!(!result.warm_start);
    }

    #[tokio::test]
    async fn test_unparsable_cold_output_carries_logs() {
        let (runtime, engine) = cold_runtime();
        *engine.wait_output.lock().unwrap() = ContainerOutput {
            exit_code: 1,
            stdout: "partial".to_string(),
            stderr: "Killed".to_string(),
        };

        let result = runtime.execute(&ExecutionRequest::new(FIXED_POINT), None).await;

        assert_eq!(result.error_kind, Some(ErrorKind::InvalidOutput));
        assert_eq!(result.error.as_deref(), Some("Failed to parse function output"));
        assert_eq!(result.logs.as_deref(), Some("partial\nKilled"));
        assert_eq!(engine.removed_count(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_an_infrastructure_error() {
        let (runtime, engine) = cold_runtime();
        engine.fail_create.store(true, Ordering::SeqCst);

        let result = runtime.execute(&ExecutionRequest::new(FIXED_POINT), None).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Infrastructure));
        assert!(result.error.unwrap().contains("create failed"));
        assert!(result.container_id.is_none());
    }

    #[tokio::test]
    async fn test_other_language_skips_pool() {
        let (runtime, pool, engine) = pooled_runtime(1).await;
        set_wait(&engine, success_stdout(json!(1)));

        let request = ExecutionRequest::new("module.exports = { handler: e => 1 }")
            .language(Language::JavaScript);
        let result = runtime.execute(&request, None).await;

        assert!(!result.warm_start);
        assert_eq!(result.language, Language::JavaScript);
        let spec = engine.specs.lock().unwrap().last().cloned().unwrap();
        assert_eq!(spec.image, "javascript-function:latest");
        assert!(spec.binds[0].ends_with(":/function/function_code.js:ro"));
        assert_eq!(pool.metrics().await.busy_containers, 0);
    }

    #[tokio::test]
    async fn test_isolation_runtime_bypasses_pool() {
        let (runtime, _pool, engine) = pooled_runtime(1).await;
        set_wait(&engine, success_stdout(json!(1)));

        let result = runtime.execute(&ExecutionRequest::new(FIXED_POINT), Some("runsc")).await;

        assert!(!result.warm_start);
        assert_eq!(result.runtime, "runsc");
        let spec = engine.specs.lock().unwrap().last().cloned().unwrap();
        assert_eq!(spec.runtime.as_deref(), Some("runsc"));
        assert!(engine.execs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_execution_leaves_pool_idle() {
        let (runtime, pool, engine) = pooled_runtime(1).await;
        set_wait(&engine, success_stdout(json!(1)));

        let result = runtime
            .execute_fresh(&ExecutionRequest::new(FIXED_POINT), None)
            .await;

        assert!(result.is_success());
        assert!(!result.warm_start);
        assert_eq!(result.runtime, "docker");
        let spec = engine.specs.lock().unwrap().last().cloned().unwrap();
        assert!(spec.name.starts_with("faas-fn-"));
        assert_eq!(spec.runtime, None);
        assert!(engine.execs.lock().unwrap().is_empty());
        assert_eq!(pool.metrics().await.idle_containers, 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_falls_back_to_cold() {
        let engine = Arc::new(MockEngine::default());
        let pool = Arc::new(ContainerPool::new(test_config(1, 1), engine.clone()).unwrap());
        pool.reconcile_once().await;
        let _held = pool.acquire().await.unwrap();
        let runtime = ExecutionRuntime::new(engine.clone(), RuntimeConfig::default(), Some(pool));
        set_wait(&engine, success_stdout(json!(1)));

        let result = runtime.execute(&ExecutionRequest::new(FIXED_POINT), None).await;
        assert!(result.is_success());
        assert!(!result.warm_start);
    }
}

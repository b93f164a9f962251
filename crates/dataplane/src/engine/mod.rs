mod docker;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
pub use docker::DockerEngine;

use crate::language::Language;

/// Label attached to every container this process creates. Used to find
/// orphans left behind by a previous run.
pub const MANAGED_LABEL: &str = "faas.managed";
pub const LANGUAGE_LABEL: &str = "faas.language";
pub const ROLE_LABEL: &str = "faas.role";

/// What a container is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ContainerRole {
    /// Long-lived pooled container reused across executions.
    Pool,
    /// Single-use container removed after one execution.
    Ephemeral,
}

impl ContainerRole {
    /// Prefix of container names created for this role.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            ContainerRole::Pool => "faas-pool",
            ContainerRole::Ephemeral => "faas-fn",
        }
    }

    /// A fresh, unique container name, e.g. `faas-fn-<uuid>`.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.name_prefix(), uuid::Uuid::new_v4())
    }
}

/// Labels identifying a container's language and role. The engine adds
/// [`MANAGED_LABEL`] itself.
pub fn container_labels(language: Language, role: ContainerRole) -> Vec<(String, String)> {
    vec![
        (LANGUAGE_LABEL.to_string(), language.to_string()),
        (ROLE_LABEL.to_string(), role.to_string()),
    ]
}

/// Resource limits applied to every function container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// CPU limit in millicores (1000 = 1 CPU core).
    pub cpu_millicores: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            cpu_millicores: 500,
        }
    }
}

/// Configuration for creating a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    pub image: String,
    /// Command overriding the image default. `None` keeps the image's
    /// entrypoint and command.
    pub command: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
    /// Bind mounts in Docker's `host:container[:ro]` form.
    pub binds: Vec<String>,
    pub limits: ResourceLimits,
    /// Disables all networking for the container.
    pub network_disabled: bool,
    /// OCI runtime to run the container under (e.g. `runsc`). `None` uses the
    /// engine default.
    pub runtime: Option<String>,
    pub labels: Vec<(String, String)>,
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

/// Output of a container that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct ContainerOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// The container engine operations the pool and runtime depend on.
///
/// Every call is blocking I/O from the caller's point of view and must not be
/// issued while holding the pool lock.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Ensure an image is available locally, pulling it if necessary.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its id. The container is not started.
    async fn create(&self, spec: ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Whether the container is running. A container the engine does not
    /// know about is reported as not running rather than as an error.
    async fn is_running(&self, id: &str) -> Result<bool>;

    /// Gracefully stop a container, killing it after `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Force-remove a container. Removing an unknown container succeeds.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Write a single file into `dir` inside the container.
    async fn copy_file(
        &self,
        id: &str,
        dir: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<()>;

    /// Run a command inside a running container and collect its output.
    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecOutput>;

    /// Wait for a started container to exit and collect its output.
    async fn wait(&self, id: &str) -> Result<ContainerOutput>;

    /// Names of the OCI runtimes the engine can run containers under.
    async fn runtimes(&self) -> Result<Vec<String>>;

    /// Ids of every container carrying [`MANAGED_LABEL`].
    async fn list_managed(&self) -> Result<Vec<String>>;
}

/// Render environment variables in Docker's `KEY=value` form.
pub(crate) fn env_strings(env: &[(String, String)]) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    Docker,
    body_full,
    container::LogOutput,
    exec::{CreateExecOptions, StartExecResults},
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptions,
        CreateImageOptions,
        InspectContainerOptions,
        ListContainersOptions,
        LogsOptions,
        RemoveContainerOptions,
        StartContainerOptions,
        StopContainerOptions,
        UploadToContainerOptions,
        WaitContainerOptions,
    },
};
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{
    ContainerEngine,
    ContainerOutput,
    ContainerSpec,
    ExecOutput,
    MANAGED_LABEL,
    ResourceLimits,
    env_strings,
};
use crate::retry::{Backoff, retry_with_backoff};

/// Timeout for requests to the Docker daemon, in seconds.
const DOCKER_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Attempts made to reach the daemon on connect.
const CONNECT_RETRIES: u32 = 3;

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon and verify it answers.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    /// - HTTPS: `https://localhost:2376` (TLS settings from `DOCKER_*` env)
    ///
    /// Without an address the platform default is used (the local socket, or
    /// the named pipe on Windows).
    pub async fn connect(address: Option<&str>) -> Result<Self> {
        let docker = match address {
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
            Some(address) => connect_with_address(address)?,
        };
        let engine = Self { docker };

        retry_with_backoff(
            CONNECT_RETRIES,
            Backoff::Exponential {
                initial: Duration::from_millis(250),
                max: Duration::from_secs(2),
            },
            "pinging docker daemon",
            || engine.ping(),
            |_| true,
        )
        .await?;

        info!(address = ?address, "Connected to Docker daemon");
        Ok(engine)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).context("Failed to inspect image"),
        }
    }

    async fn collect_logs(&self, id: &str) -> Result<(String, String)> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.context("Failed to read container logs")? {
                LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                _ => {}
            }
        }
        Ok((stdout, stderr))
    }
}

fn connect_with_address(address: &str) -> Result<Docker> {
    let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
        let addr = address
            .trim_start_matches("http://")
            .trim_start_matches("tcp://");
        Docker::connect_with_http(
            &format!("http://{}", addr),
            DOCKER_REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .context("Failed to connect to Docker daemon via HTTP")?
    } else if address.starts_with("https://") {
        Docker::connect_with_defaults().context("Failed to connect to Docker daemon via HTTPS")?
    } else {
        let socket_path = address.trim_start_matches("unix://");
        Docker::connect_with_socket(
            socket_path,
            DOCKER_REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .context("Failed to connect to Docker daemon via Unix socket")?
    };
    Ok(docker)
}

/// Translate resource limits into Docker's memory bytes and nano CPUs.
fn docker_limits(limits: &ResourceLimits) -> (i64, i64) {
    // Docker uses nano CPUs (1 CPU = 1e9 nano CPUs), millicores * 1e6.
    (
        limits.memory_bytes as i64,
        (limits.cpu_millicores as i64) * 1_000_000,
    )
}

/// Build a tar archive holding one file, as the upload API expects.
fn single_file_archive(file_name: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_path(file_name)?;
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    let mut archive = tar::Builder::new(Vec::new());
    archive.append(&header, contents)?;
    archive.into_inner().context("Failed to finish code archive")
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            info!(image = %image, "Image already exists locally");
            return Ok(());
        }

        info!(image = %image, event = "image_pull_started", "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.with_context(|| format!("Failed to pull image {}", image))?;
            if let Some(status) = progress.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }
        info!(image = %image, event = "image_pull_completed", "Docker image pull completed");
        Ok(())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String> {
        let (memory, nano_cpus) = docker_limits(&spec.limits);

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            memory: Some(memory),
            // Swap would let code bypass the memory ceiling.
            memory_swap: Some(memory),
            nano_cpus: Some(nano_cpus),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            runtime: spec.runtime.clone(),
            ..Default::default()
        };

        let mut labels: HashMap<String, String> = spec.labels.iter().cloned().collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(env_strings(&spec.env)),
            labels: Some(labels),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;

        debug!(
            container = %spec.name,
            container_id = %response.id,
            image = %spec.image,
            runtime = ?spec.runtime,
            "Container created"
        );
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .context("Failed to start container")?;
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).context("Failed to inspect container"),
        }
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(timeout.as_secs() as i32),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to stop container"),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to remove container"),
        }
    }

    async fn copy_file(
        &self,
        id: &str,
        dir: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<()> {
        let archive = single_file_archive(file_name, contents)?;
        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), body_full(Bytes::from(archive)))
            .await
            .with_context(|| format!("Failed to copy {} into container", file_name))?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    env: Some(env_strings(&env)),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.context("Failed to read exec output")? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => anyhow::bail!("Exec unexpectedly detached"),
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }

    async fn wait(&self, id: &str) -> Result<ContainerOutput> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        let exit_code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // Non-zero exits surface as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e).context("Failed to wait for container"),
            None => anyhow::bail!("Container wait stream ended without a status"),
        };

        let (stdout, stderr) = self.collect_logs(id).await?;
        Ok(ContainerOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn runtimes(&self) -> Result<Vec<String>> {
        let info = self
            .docker
            .info()
            .await
            .context("Failed to query Docker info")?;
        Ok(info
            .runtimes
            .map(|runtimes| runtimes.into_keys().collect())
            .unwrap_or_default())
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

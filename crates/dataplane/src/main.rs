use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use faas_dataplane::{
    DataplaneConfig,
    DockerEngine,
    ExecutionRequest,
    FunctionService,
    Language,
    metrics,
    otel_tracing::setup_tracing,
    probe_runtime_availability,
    service::preload_images,
};
use tracing::{info, instrument};

#[derive(Parser)]
#[command(name = "faas-dataplane")]
#[command(version, about = "Run user functions in warm-pooled containers", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a function once and print the result as JSON.
    Invoke {
        /// File holding the function source.
        #[arg(long, value_name = "FILE")]
        code_file: PathBuf,
        #[arg(long, default_value = "handler")]
        function: String,
        /// JSON input passed to the function.
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long)]
        language: Option<Language>,
        /// Isolation runtime: docker or gvisor.
        #[arg(long)]
        runtime: Option<String>,
        /// Timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Pull every language image that is not present locally.
    Preload,
    /// Report which isolation runtimes the engine offers.
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => DataplaneConfig::from_path(path)?,
        None => {
            let mut config = DataplaneConfig::default();
            config
                .validate()
                .context("Failed to validate default config")?;
            config
        }
    };

    setup_tracing(&config)?;
    metrics::init_provider(&config.telemetry, &config.env)?;

    run(config, cli.command).await
}

#[instrument(skip_all, fields(env = config.env))]
async fn run(config: DataplaneConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Invoke {
            code_file,
            function,
            input,
            language,
            runtime,
            timeout,
        } => {
            let code = std::fs::read_to_string(&code_file)
                .with_context(|| format!("Failed to read {}", code_file.display()))?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;

            let mut request = ExecutionRequest::new(code)
                .function_name(function)
                .input(input);
            if let Some(language) = language {
                request = request.language(language);
            }
            if let Some(runtime) = runtime {
                request = request.runtime(runtime);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(Duration::from_secs(timeout));
            }

            let service = FunctionService::new(config)
                .await
                .context("Failed to create service")?;
            let result = service.execute(request).await;
            service.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Command::Preload => {
            let engine = DockerEngine::connect(config.docker.address.as_deref()).await?;
            preload_images(&engine, &config).await?;
            info!("All images ready");
        }
        Command::Probe => {
            let engine = DockerEngine::connect(config.docker.address.as_deref()).await?;
            let availability = probe_runtime_availability(&engine).await;
            println!("{}", serde_json::to_string_pretty(&availability)?);
        }
    }
    Ok(())
}

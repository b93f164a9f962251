use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{SpanExporter as OtlpSpanExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider, TracerProviderBuilder},
};
use opentelemetry_stdout::SpanExporter as StdoutSpanExporter;
use tracing::Metadata;
use tracing_subscriber::{
    Layer,
    filter::FilterExt,
    layer::{self, Filter, SubscriberExt},
};

use crate::config::{DataplaneConfig, TelemetryConfig, TracingExporter};

const SERVICE_NAME: &str = "faas-dataplane";

/// Targets whose spans are never exported.
const NOISY_TARGETS: [&str; 4] = ["h2::", "hyper::", "hyper_util::", "tokio::"];

struct NoisyModulesFilter;

impl<S> Filter<S> for NoisyModulesFilter {
    fn enabled(&self, metadata: &Metadata<'_>, _: &layer::Context<'_, S>) -> bool {
        let target = metadata.target();
        !NOISY_TARGETS.iter().any(|prefix| target.starts_with(prefix))
    }
}

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG controls the level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

/// JSON lines outside of local, compact human output otherwise.
pub fn get_log_layer<S>(structured: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if structured {
        return Box::new(
            json_subscriber::fmt::layer()
                .with_span_list(false)
                .flatten_event(true)
                .flatten_current_span_on_top_level(true),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .compact(),
    )
}

fn build_tracer_provider(
    telemetry: &TelemetryConfig,
    exporter: &TracingExporter,
) -> Result<SdkTracerProvider> {
    let mut tracer_provider = TracerProviderBuilder::default().with_resource(
        Resource::builder_empty()
            .with_service_name(SERVICE_NAME)
            .build(),
    );
    match exporter {
        TracingExporter::Otlp => {
            let mut otlp = OtlpSpanExporter::builder()
                .with_tonic()
                .with_compression(opentelemetry_otlp::Compression::Gzip);
            if let Some(endpoint) = &telemetry.endpoint {
                otlp = otlp.with_endpoint(endpoint);
            }
            // Executions carry large input attributes; keep batches small.
            let batch_config = BatchConfigBuilder::default()
                .with_max_export_batch_size(128)
                .build();
            let batch_processor =
                BatchSpanProcessor::builder(otlp.build()?).with_batch_config(batch_config);
            tracer_provider = tracer_provider.with_span_processor(batch_processor.build());
        }
        TracingExporter::Stdout => {
            tracer_provider = tracer_provider.with_simple_exporter(StdoutSpanExporter::default());
        }
    }
    Ok(tracer_provider.build())
}

/// Install the global subscriber: logs always, spans when an exporter is
/// configured.
pub fn setup_tracing(config: &DataplaneConfig) -> Result<()> {
    tracing::subscriber::set_global_default(build_subscriber(config)?)?;
    Ok(())
}

fn build_subscriber(
    config: &DataplaneConfig,
) -> Result<Box<dyn tracing::Subscriber + Send + Sync>> {
    let env_filter_layer = get_env_filter();
    let base = tracing_subscriber::Registry::default();

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> =
        match &config.telemetry.tracing_exporter {
            Some(exporter) => {
                let tracer = build_tracer_provider(&config.telemetry, exporter)?.tracer(SERVICE_NAME);
                let span_layer = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(NoisyModulesFilter.and(get_env_filter()));
                let log_layer = get_log_layer(config.structured_logging())
                    .with_filter(env_filter_layer);
                Box::new(base.with(span_layer).with(log_layer))
            }
            None => {
                let log_layer = get_log_layer(config.structured_logging())
                    .with_filter(env_filter_layer);
                Box::new(base.with(log_layer))
            }
        };

    Ok(subscriber)
}

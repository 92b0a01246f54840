//! Provides helper functions for initializing telemetry collection and publication.
use std::time::Duration;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, runtime, trace, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Registry};

/// Handle to the installed telemetry pipelines.
///
/// Logging is always installed. Traces and metrics are only exported when an
/// OTLP endpoint was provided.
pub struct Telemetry {
    meter_provider: Option<MeterProvider>,
}

impl Telemetry {
    /// Report whether traces and metrics are exported over OTLP.
    pub fn exporting(&self) -> bool {
        self.meter_provider.is_some()
    }

    /// Flush traces and metrics before shutdown
    pub fn shutdown(self) -> Result<()> {
        if let Some(meter_provider) = self.meter_provider {
            global::shutdown_tracer_provider();
            meter_provider.shutdown()?;
        }
        Ok(())
    }
}

fn resource(service_name: &'static str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            "hostname",
            gethostname::gethostname().to_string_lossy().into_owned(),
        ),
        KeyValue::new("service.name", service_name),
    ])
}

/// Initialize tracing and metrics
pub async fn init(service_name: &'static str, otlp_endpoint: Option<String>) -> Result<Telemetry> {
    let (tracer, meter_provider) = match otlp_endpoint {
        Some(otlp_endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(otlp_endpoint.clone()),
                )
                .with_trace_config(trace::config().with_resource(resource(service_name)))
                .install_batch(runtime::Tokio)?;

            let meter_provider = opentelemetry_otlp::new_pipeline()
                .metrics(runtime::Tokio)
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(otlp_endpoint),
                )
                .with_resource(resource(service_name))
                .with_period(Duration::from_secs(10))
                .build()?;
            global::set_meter_provider(meter_provider.clone());
            (Some(tracer), Some(meter_provider))
        }
        None => (None, None),
    };

    // Setup filters
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let otlp_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    // Setup tracing layers
    let telemetry = tracer.map(|tracer| {
        tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter)
    });
    let logger = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .compact()
        .with_filter(log_filter);

    let collector = Registry::default().with(telemetry).with(logger);

    #[cfg(feature = "tokio-console")]
    let collector = {
        let console_filter = EnvFilter::builder().parse("tokio=trace,runtime=trace")?;
        let console_layer = console_subscriber::spawn().with_filter(console_filter);
        collector.with(console_layer)
    };

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)?;

    Ok(Telemetry { meter_provider })
}

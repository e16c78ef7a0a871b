//! Process-wide logging for the router.
//!
//! Log lines always go to stderr through `tracing_subscriber::fmt`. Span
//! export over OTLP is compiled in only with the `telemetry` feature and
//! switched on by `telemetry.enabled`.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// `RUST_LOG` takes precedence; otherwise the configured directive is used.
fn log_filter(config: &TelemetryConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter '{}'", config.log_filter))
}

#[cfg(feature = "telemetry")]
mod export {
    use anyhow::Result;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::TracerProvider;
    use opentelemetry_sdk::Resource;
    use tracing_opentelemetry::OpenTelemetryLayer;
    use tracing_subscriber::registry::LookupSpan;

    use crate::config::TelemetryConfig;

    pub(super) fn span_layer<S>(
        config: &TelemetryConfig,
    ) -> Result<OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>
    where
        S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(config.endpoint.clone())
            .build()?;

        let resource = Resource::new(vec![
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]);
        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(resource)
            .build();
        let tracer = provider.tracer("sluice");
        opentelemetry::global::set_tracer_provider(provider);

        Ok(OpenTelemetryLayer::new(tracer))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let registry = tracing_subscriber::registry()
        .with(log_filter(config)?)
        .with(tracing_subscriber::fmt::layer().with_target(true));

    #[cfg(feature = "telemetry")]
    {
        let spans = if config.enabled {
            Some(export::span_layer(config)?)
        } else {
            None
        };
        registry.with(spans).try_init()?;
    }
    #[cfg(not(feature = "telemetry"))]
    {
        if config.enabled {
            tracing::warn!(
                endpoint = %config.endpoint,
                "Span export requested but sluice was built without the telemetry feature"
            );
        }
        registry.try_init()?;
    }

    tracing::debug!(service = %config.service_name, "Tracing initialised");
    Ok(())
}

/// Flush pending spans. A no-op when export is not compiled in.
pub fn shutdown_telemetry() {
    #[cfg(feature = "telemetry")]
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_reported() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = TelemetryConfig {
            log_filter: "sluice=loud".into(),
            ..TelemetryConfig::default()
        };
        let err = log_filter(&config).unwrap_err();
        assert!(err.to_string().contains("invalid log filter"));
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(log_filter(&TelemetryConfig::default()).is_ok());
    }
}

//! Subscriber setup: human-readable logs always, OTLP span export when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use anyhow::{anyhow, Result};
use base64ct::{Base64, Encoding};
use opentelemetry::{
    global, propagation::TextMapCompositePropagator, trace::TracerProvider as _, KeyValue,
};
use opentelemetry_otlp::{WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TraceContextPropagator},
    runtime,
    trace::{self, Tracer, TracerProvider},
    Resource,
};
use std::{collections::BTreeMap, env::var, sync::OnceLock, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use ulid::Ulid;

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

static PROVIDER: OnceLock<TracerProvider> = OnceLock::new();

/// `k1=v1,k2=v2` as found in `OTEL_EXPORTER_OTLP_HEADERS`. Pairs without `=`
/// are skipped.
fn parse_headers(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

/// Keys ending in `-bin` carry base64 values and become binary metadata.
fn to_metadata(headers: &BTreeMap<String, String>) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::with_capacity(headers.len());

    for (key, value) in headers {
        if key.ends_with("-bin") {
            let bytes = Base64::decode_vec(value)
                .map_err(|e| anyhow!("invalid base64 value for metadata key {key}: {e}"))?;
            let name = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                .map_err(|e| anyhow!("invalid binary metadata key {key}: {e}"))?;
            metadata.insert_bin(name, MetadataValue::from_bytes(&bytes));
        } else {
            let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|e| anyhow!("invalid metadata key {key}: {e}"))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|e| anyhow!("invalid metadata value for key {key}: {e}"))?;
            metadata.insert(name, value);
        }
    }

    Ok(metadata)
}

/// Endpoints without a scheme are assumed to be TLS.
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    }
}

fn tls_domain(endpoint: &str) -> Option<&str> {
    endpoint
        .strip_prefix("https://")
        .and_then(|rest| rest.split('/').next())
        .and_then(|authority| authority.split(':').next())
        .filter(|host| !host.is_empty())
}

fn init_tracer() -> Result<Tracer> {
    if let Ok(protocol) = var("OTEL_EXPORTER_OTLP_PROTOCOL") {
        if protocol != "grpc" {
            debug!("OTEL_EXPORTER_OTLP_PROTOCOL={protocol} ignored, exporting over grpc");
        }
    }

    let endpoint = normalize_endpoint(
        &var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
    );

    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.as_str())
        .with_timeout(EXPORT_TIMEOUT);

    if let Some(domain) = tls_domain(&endpoint) {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(domain.to_string())
                .with_native_roots(),
        );
    }

    let headers = var("OTEL_EXPORTER_OTLP_HEADERS")
        .map(|raw| parse_headers(&raw))
        .unwrap_or_default();
    if !headers.is_empty() {
        builder = builder.with_metadata(to_metadata(&headers)?);
    }

    let exporter = builder.build()?;

    let instance_id = var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance_id),
        ])))
        .build();

    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));

    let _ = PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider);
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(tracer)
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity level.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or a subscriber is
/// already installed.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false);

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.unwrap_or(Level::ERROR).into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?);

    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = tracing_opentelemetry::layer().with_tracer(init_tracer()?);
        let subscriber = Registry::default()
            .with(fmt_layer)
            .with(otel_layer)
            .with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(fmt_layer).with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Flush pending spans. Does nothing when export was never enabled.
pub fn shutdown_tracer() {
    if let Some(provider) = PROVIDER.get() {
        if let Err(err) = provider.shutdown() {
            debug!("tracer provider shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_headers_skips_malformed_pairs() {
        assert!(parse_headers("").is_empty());

        let headers = parse_headers("Authorization = Bearer abc , broken,x-team=gw,=nokey");
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get("authorization").map(String::as_str),
            Some("Bearer abc")
        );
        assert_eq!(headers.get("x-team").map(String::as_str), Some("gw"));
    }

    #[test]
    fn parse_headers_keeps_equals_in_values() {
        let headers = parse_headers("x-sig=a=b=");
        assert_eq!(headers.get("x-sig").map(String::as_str), Some("a=b="));
    }

    #[test]
    fn metadata_accepts_ascii_and_binary() -> Result<()> {
        let headers = parse_headers("authorization=Bearer abc,trace-bin=YmluYXJ5");
        let metadata = to_metadata(&headers)?;
        assert_eq!(metadata.len(), 2);
        assert!(metadata.get_bin("trace-bin").is_some());
        Ok(())
    }

    #[test]
    fn metadata_rejects_bad_base64() {
        let headers = parse_headers("trace-bin=***");
        let err = to_metadata(&headers).err().map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("invalid base64")));
    }

    #[test]
    fn endpoints_default_to_https() {
        assert_eq!(normalize_endpoint("http://collector:4317"), "http://collector:4317");
        assert_eq!(normalize_endpoint("collector:4317/"), "https://collector:4317");
        assert_eq!(
            normalize_endpoint("https://otel.example.com/v1/traces"),
            "https://otel.example.com/v1/traces"
        );
    }

    #[test]
    fn tls_domain_only_for_https() {
        assert_eq!(tls_domain("https://otel.example.com:4317"), Some("otel.example.com"));
        assert_eq!(tls_domain("http://collector:4317"), None);
    }

    #[test]
    fn shutdown_without_provider_is_noop() {
        shutdown_tracer();
    }
}

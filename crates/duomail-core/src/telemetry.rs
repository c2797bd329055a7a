//! Process-wide tracing setup. Everything is written to stderr: stdout belongs to the stdio
//! protocol transport.

use std::fmt as StdFmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::{Resource, trace};
use serde_json::json;
use thiserror::Error;
use tracing::Subscriber;
use tracing_opentelemetry::{OpenTelemetrySpanExt, OtelData};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{self, FmtContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::reload;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{AppConfig, TelemetryConfig};

const OTLP_EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Field names whose values never reach the log output.
const REDACTED_FIELDS: &[&str] = &[
    "access_token",
    "refresh_token",
    "client_secret",
    "authorization_code",
    "code_verifier",
    "authorization",
];
const REDACTED: &str = "[redacted]";

type InstallTracer = Box<dyn Fn(trace::Tracer) -> Result<(), TelemetryError> + Send + Sync>;

static INSTALL_TRACER: OnceLock<InstallTracer> = OnceLock::new();
static GLOBAL_GUARD: OnceLock<Mutex<Option<TelemetryGuard>>> = OnceLock::new();

/// Keeps the tracer provider alive; the last guard flushes pending spans on drop.
#[derive(Clone)]
pub struct TelemetryGuard {
    provider: Option<Arc<SdkTracerProvider>>,
    shutdown_on_drop: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if !self.shutdown_on_drop {
            return;
        }
        if let Some(provider) = self.provider.take() {
            if Arc::strong_count(&provider) == 1 {
                let _ = provider.shutdown();
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
}

impl TelemetryError {
    pub fn code(&self) -> &'static str {
        match self {
            TelemetryError::SubscriberInit(_) => "telemetry.subscriber",
            TelemetryError::ExporterBuild(_) => "telemetry.exporter",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, TelemetryError::ExporterBuild(_))
    }
}

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`), pretty output in
/// `dev`, JSON lines elsewhere, and an OTLP span exporter when configured. Calling it again
/// only swaps in a new exporter.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let (tracer, provider) = build_tracer(app, telemetry)?;

    if app.env.eq_ignore_ascii_case("dev") {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr);
        install_subscriber(fmt_layer, env_filter, tracer)?;
    } else {
        let fmt_layer = fmt::layer()
            .event_format(JsonTraceFormatter)
            .with_writer(std::io::stderr);
        install_subscriber(fmt_layer, env_filter, tracer)?;
    }

    Ok(match provider {
        Some(provider) => retain_provider(provider),
        None => TelemetryGuard {
            provider: None,
            shutdown_on_drop: false,
        },
    })
}

/// Logging only, for binaries that run before (or without) a config file.
pub fn init_logging(service_name: &str, env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: service_name.to_string(),
        env: env.to_string(),
    };
    init_telemetry(&app, &TelemetryConfig::default()).map(|_guard| ())
}

/// Flushes and drops the process-wide provider. Safe to call when tracing was never exported.
pub fn shutdown_telemetry() {
    if let Some(slot) = GLOBAL_GUARD.get() {
        let guard = slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(guard);
    }
}

fn build_tracer(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<(Option<trace::Tracer>, Option<Arc<SdkTracerProvider>>), TelemetryError> {
    if !telemetry.export_traces {
        return Ok((None, None));
    }

    let endpoint = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => endpoint,
        _ => return Ok((None, None)),
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(OTLP_EXPORT_TIMEOUT)
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::ExporterBuild(err.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", app.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", app.env.clone()),
            KeyValue::new("os.type", std::env::consts::OS.to_string()),
        ])
        .build();
    let provider = Arc::new(
        SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter).build())
            .with_resource(resource)
            .build(),
    );

    global::set_tracer_provider(provider.as_ref().clone());
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    let tracer = provider.tracer(app.service_name.clone());
    Ok((Some(tracer), Some(provider)))
}

fn retain_provider(provider: Arc<SdkTracerProvider>) -> TelemetryGuard {
    let slot = GLOBAL_GUARD.get_or_init(|| Mutex::new(None));
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(TelemetryGuard {
        provider: Some(provider.clone()),
        shutdown_on_drop: true,
    });

    TelemetryGuard {
        provider: Some(provider),
        shutdown_on_drop: false,
    }
}

fn install_subscriber(
    fmt_layer: impl tracing_subscriber::Layer<Registry> + Send + Sync + 'static,
    env_filter: EnvFilter,
    tracer: Option<trace::Tracer>,
) -> Result<(), TelemetryError> {
    if let Some(install) = INSTALL_TRACER.get() {
        if let Some(tracer) = tracer {
            install(tracer)?;
        }
        return Ok(());
    }

    let (otel_layer, otel_reload) =
        reload::Layer::new(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)));

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let _ = INSTALL_TRACER.set(Box::new(move |tracer: trace::Tracer| {
        otel_reload
            .modify(|layer| {
                *layer = Some(tracing_opentelemetry::layer().with_tracer(tracer));
            })
            .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))
    }));

    Ok(())
}

/// One JSON object per event: timestamp, level, target, span, trace_id, fields.
#[derive(Default)]
struct JsonTraceFormatter;

impl<S, N> FormatEvent<S, N> for JsonTraceFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> StdFmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let current = ctx.lookup_current();
        let trace_id = current
            .as_ref()
            .and_then(|span| {
                span.extensions()
                    .get::<OtelData>()
                    .and_then(|data| data.trace_id())
            })
            .or_else(|| {
                let ctx = tracing::Span::current().context();
                let span_ctx = ctx.span().span_context().clone();
                span_ctx.is_valid().then(|| span_ctx.trace_id())
            })
            .map(|id| id.to_string());

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": event.metadata().level().as_str().to_lowercase(),
            "target": event.metadata().target(),
            "span": current.map(|span| span.name().to_string()),
            "trace_id": trace_id,
            "fields": visitor.fields,
        });

        let serialized = serde_json::to_string(&payload).map_err(|_| StdFmt::Error)?;
        writer.write_str(&serialized)?;
        writer.write_str("\n")
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &tracing::field::Field, value: serde_json::Value) {
        let name = field.name();
        let value = if REDACTED_FIELDS.contains(&name) {
            REDACTED.into()
        } else {
            value
        };
        self.fields.insert(name.to_string(), value);
    }
}

impl tracing_subscriber::field::Visit for JsonVisitor {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.insert(field, value.into());
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        let mut chain = vec![value.to_string()];
        let mut source = value.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        self.insert(field, chain.join(": ").into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn StdFmt::Debug) {
        self.insert(field, format!("{value:?}").into());
    }
}

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::Response,
};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as _,
    KeyValue,
};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    trace::{self, Sampler, Tracer, TracerProvider},
    Resource,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;
use tracing_subscriber::registry::LookupSpan;

use crate::{
    configs::{
        build_config_from_file_in_package, from_str_or_value, ConfigError, Package,
        APPLICATION_CONFIG_FILENAME,
    },
    dependency_injection::{Binder, Module},
    logging,
    plugin::{ApplicationView, Plugin},
    web::strip_root_path,
};

pub const TELEMETRY_PLUGIN_NAME: &str = "telemetry";
pub const TELEMETRY_CONFIG_KEY: &str = "telemetry";

/// Instrumentation scope of the tracer and the meter.
const INSTRUMENTATION_SCOPE: &str = "app-factory";

/// Route attribute of requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// The `telemetry` section of `application.yaml`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Requests whose path, without the root path, starts with one of these
    /// are not instrumented.
    #[serde(default)]
    pub excluded_urls: Vec<String>,
    /// Seconds allowed for flushing telemetry on shutdown.
    #[serde(
        default = "default_closing_timeout",
        deserialize_with = "from_str_or_value"
    )]
    pub closing_timeout: u64,
}

fn default_closing_timeout() -> u64 {
    10
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            excluded_urls: vec![],
            closing_timeout: default_closing_timeout(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_package(package: &Package) -> Result<Self, ConfigError> {
        build_config_from_file_in_package(package, APPLICATION_CONFIG_FILENAME, TELEMETRY_CONFIG_KEY)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_urls
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Request counter and duration histogram, attributed by method, route
/// template and status code.
#[derive(Clone)]
pub struct RequestInstruments {
    requests: Counter<u64>,
    duration: Histogram<f64>,
}

impl RequestInstruments {
    pub fn new(meter: &Meter) -> Self {
        Self {
            requests: meter
                .u64_counter("http.server.requests")
                .with_description("Requests answered by the application")
                .init(),
            duration: meter
                .f64_histogram("http.server.duration")
                .with_description("Seconds spent answering a request")
                .init(),
        }
    }

    pub fn record(&self, method: &Method, route: &str, status: StatusCode, elapsed: Duration) {
        let attributes = [
            KeyValue::new("http.request.method", method.to_string()),
            KeyValue::new("http.route", route.to_owned()),
            KeyValue::new("http.response.status_code", i64::from(status.as_u16())),
        ];
        self.requests.add(1, &attributes);
        self.duration.record(elapsed.as_secs_f64(), &attributes);
    }
}

/// The tracer and meter providers of one application.
pub struct Telemetry {
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
    instruments: RequestInstruments,
}

impl Telemetry {
    pub fn new(service_name: &str, service_version: &str) -> Self {
        let resource = Resource::new([
            KeyValue::new("service.name", service_name.to_owned()),
            KeyValue::new("service.version", service_version.to_owned()),
        ]);
        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::config()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_resource(resource.clone()),
            )
            .build();
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        let instruments = RequestInstruments::new(&meter_provider.meter(INSTRUMENTATION_SCOPE));
        Self {
            tracer_provider,
            meter_provider,
            instruments,
        }
    }

    pub fn tracer(&self) -> Tracer {
        self.tracer_provider.tracer(INSTRUMENTATION_SCOPE)
    }

    /// Bridges `tracing` spans into this tracer provider.
    pub fn layer<S>(&self) -> tracing_opentelemetry::OpenTelemetryLayer<S, Tracer>
    where
        S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    {
        tracing_opentelemetry::layer().with_tracer(self.tracer())
    }

    pub fn instruments(&self) -> &RequestInstruments {
        &self.instruments
    }

    /// Makes the providers global so libraries using the `opentelemetry` api
    /// report through them.
    pub fn install_global(&self) {
        global::set_tracer_provider(self.tracer_provider.clone());
        global::set_meter_provider(self.meter_provider.clone());
    }

    /// Exports everything recorded so far. Blocks until the exporters answer.
    pub fn flush(&self) -> anyhow::Result<()> {
        for result in self.tracer_provider.force_flush() {
            result.context("flushing spans")?;
        }
        self.meter_provider.force_flush().context("flushing metrics")?;
        Ok(())
    }
}

/// The route template a request matched, or [`UNMATCHED_ROUTE`].
///
/// Only set once routing happened, that is in layers added to the router.
pub fn route_label(request: &Request) -> &str {
    request
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED_ROUTE, MatchedPath::as_str)
}

#[derive(Clone)]
struct RequestTracker {
    config: Arc<TelemetryConfig>,
    telemetry: Arc<Telemetry>,
    root_path: String,
}

impl RequestTracker {
    fn tracks(&self, path: &str) -> bool {
        !self.config.is_excluded(strip_root_path(&self.root_path, path))
    }
}

async fn track_request(
    State(tracker): State<RequestTracker>,
    request: Request,
    next: Next,
) -> Response {
    if !tracker.tracks(request.uri().path()) {
        return next.run(request).await;
    }
    let method = request.method().clone();
    let route = route_label(&request).to_owned();
    let span = tracing::info_span!(
        "http_request",
        %method,
        http.route = %route,
        status = tracing::field::Empty
    );
    let started = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    span.record("status", response.status().as_u16());
    tracker
        .telemetry
        .instruments()
        .record(&method, &route, response.status(), started.elapsed());
    response
}

struct TelemetryModule;

impl Module for TelemetryModule {
    fn configure(&self, binder: &mut Binder) {
        binder
            .bind_singleton::<Arc<TelemetryConfig>, _>(|injector| {
                let application: Arc<dyn ApplicationView> = injector.get()?;
                Ok(Arc::new(TelemetryConfig::from_package(application.package())?))
            })
            .bind_singleton::<Arc<Telemetry>, _>(|injector| {
                let application: Arc<dyn ApplicationView> = injector.get()?;
                let config = application.config();
                let settings = config.application();
                Ok(Arc::new(Telemetry::new(&settings.title, &settings.version)))
            });
    }
}

/// Traces and measures incoming requests through OpenTelemetry.
#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetryPlugin;

#[async_trait]
impl Plugin for TelemetryPlugin {
    fn name(&self) -> &str {
        TELEMETRY_PLUGIN_NAME
    }

    fn module(&self) -> Option<Arc<dyn Module>> {
        Some(Arc::new(TelemetryModule))
    }

    fn pre_conditions_check(&self, application: &dyn ApplicationView) -> bool {
        match TelemetryConfig::from_package(application.package()) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Invalid telemetry configuration: {e}");
                false
            }
        }
    }

    fn on_load(&self, application: &dyn ApplicationView) -> anyhow::Result<()> {
        let injector = application
            .injector()
            .ok_or_else(|| anyhow!("the telemetry plugin needs an injector"))?;
        let telemetry: Arc<Telemetry> = injector.get()?;
        telemetry.install_global();
        if !logging::install_layer(Box::new(telemetry.layer())) {
            tracing::debug!("No reloadable subscriber installed, spans stay local.");
        }

        let web_app = application.web_app();
        let tracker = RequestTracker {
            config: injector.get()?,
            telemetry,
            root_path: web_app.metadata().root_path.clone(),
        };
        web_app.add_layer(move |router| {
            router.layer(middleware::from_fn_with_state(tracker.clone(), track_request))
        });
        tracing::debug!("Telemetry layer installed.");
        Ok(())
    }

    async fn on_startup(&self, application: &dyn ApplicationView) -> anyhow::Result<()> {
        tracing::info!(
            "Telemetry enabled for `{}`.",
            application.config().application().title
        );
        Ok(())
    }

    async fn on_shutdown(&self, application: &dyn ApplicationView) -> anyhow::Result<()> {
        let injector = application
            .injector()
            .ok_or_else(|| anyhow!("the telemetry plugin needs an injector"))?;
        let config: Arc<TelemetryConfig> = injector.get()?;
        let telemetry: Arc<Telemetry> = injector.get()?;
        let timeout = Duration::from_secs(config.closing_timeout);
        let flushing = tokio::task::spawn_blocking(move || telemetry.flush());
        tokio::time::timeout(timeout, flushing)
            .await
            .with_context(|| format!("flushing telemetry took more than {timeout:?}"))?
            .context("telemetry flush panicked")?
    }
}

//! Process-wide observability for the parser.
//!
//! Residency transfers and parses report through the `metrics` facade
//! (`residency_*` and `vision_parse_*` series); installing the Prometheus
//! recorder here makes them scrapable. Spans `residency.run` and
//! `residency.evict` go to the fmt subscriber and, optionally, a Chrome trace.

use std::{fs::File, io, path::Path, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_chrome::{ChromeLayer, ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    Registry,
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::config::TelemetryOptions;

/// Interval between Prometheus histogram upkeep passes.
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the thread-local subscriber and the Chrome trace writer alive.
pub struct TelemetryGuard {
    _subscriber: tracing::subscriber::DefaultGuard,
    _chrome: Option<FlushGuard>,
}

/// Install the Prometheus recorder for residency and parse metrics on first
/// call; later calls return the same handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    RECORDER.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if let Err(err) = metrics::set_global_recorder(recorder) {
            tracing::warn!("another metrics recorder is installed; residency metrics go there: {err}");
        }

        let upkeep = handle.clone();
        if let Err(err) = spawn_thread("metrics-upkeep", move || {
            loop {
                thread::sleep(UPKEEP_INTERVAL);
                upkeep.run_upkeep();
            }
        }) {
            tracing::warn!("metrics upkeep thread not started: {err}");
        }
        handle
    })
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    RECORDER.get()
}

/// Route parser logs and spans to a subscriber scoped to the calling thread.
/// Threads started with [`spawn_thread`] afterwards, such as the idle
/// eviction timer, report to it as well.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome, chrome_guard) = match opts.chrome_trace_path.as_deref().map(chrome_trace_layer) {
        Some(Ok((layer, guard))) => (Some(layer), Some(guard)),
        Some(Err(err)) => {
            tracing::warn!("chrome trace disabled: {err}");
            (None, None)
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(chrome.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span()))))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(filter),
        )
        .with(tracing_error::ErrorLayer::default());

    TelemetryGuard {
        _subscriber: tracing::subscriber::set_default(subscriber),
        _chrome: chrome_guard,
    }
}

/// Start a named thread reporting to the caller's current subscriber.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(Clone::clone);
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn chrome_trace_layer(path: &Path) -> io::Result<(ChromeLayer<Registry>, FlushGuard)> {
    let file = File::create(path).map_err(|err| {
        io::Error::new(err.kind(), format!("cannot create {}: {err}", path.display()))
    })?;
    Ok(ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(TraceStyle::Threaded)
        .build())
}

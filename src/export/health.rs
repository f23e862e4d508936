use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::error::ExportError;

const NAMESPACE: &str = "viewstat";

/// Prometheus self-metrics of the export pipeline.
///
/// All metrics use the "viewstat" namespace.
pub struct ExporterHealth {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// View snapshots whose points were handed to the backend.
    pub views_exported: Counter,
    /// Time series points uploaded successfully.
    pub points_exported: Counter,
    /// Upload calls that succeeded.
    pub requests_sent: Counter,
    /// Failed backend calls by kind (transport/timeout).
    pub request_errors: CounterVec,
    /// Views skipped because of descriptor validation.
    pub validation_errors: Counter,
    /// Snapshots dropped because the export queue was full or closed.
    pub queue_dropped: Counter,
    /// Duration of one bundle upload (1ms-10s buckets).
    pub upload_duration: Histogram,
    /// Snapshots per uploaded bundle.
    pub bundle_size: Histogram,
}

impl ExporterHealth {
    /// Creates the metrics and registers them with a private registry.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let views_exported = Counter::with_opts(
            Opts::new("views_exported_total", "View snapshots exported.").namespace(NAMESPACE),
        )?;
        let points_exported = Counter::with_opts(
            Opts::new(
                "points_exported_total",
                "Time series points uploaded successfully.",
            )
            .namespace(NAMESPACE),
        )?;
        let requests_sent = Counter::with_opts(
            Opts::new("requests_sent_total", "Successful upload requests.").namespace(NAMESPACE),
        )?;
        let request_errors = CounterVec::new(
            Opts::new(
                "request_errors_total",
                "Failed backend requests by error kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let validation_errors = Counter::with_opts(
            Opts::new(
                "validation_errors_total",
                "Views skipped because their descriptor did not validate.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_dropped = Counter::with_opts(
            Opts::new(
                "queue_dropped_total",
                "View snapshots dropped before reaching the exporter.",
            )
            .namespace(NAMESPACE),
        )?;
        let upload_duration = Histogram::with_opts(
            HistogramOpts::new(
                "upload_duration_seconds",
                "Time to upload one bundle of view snapshots.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let bundle_size = Histogram::with_opts(
            HistogramOpts::new("bundle_size", "View snapshots per uploaded bundle.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
        )?;

        registry.register(Box::new(views_exported.clone()))?;
        registry.register(Box::new(points_exported.clone()))?;
        registry.register(Box::new(requests_sent.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;
        registry.register(Box::new(validation_errors.clone()))?;
        registry.register(Box::new(queue_dropped.clone()))?;
        registry.register(Box::new(upload_duration.clone()))?;
        registry.register(Box::new(bundle_size.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            views_exported,
            points_exported,
            requests_sent,
            request_errors,
            validation_errors,
            queue_dropped,
            upload_duration,
            bundle_size,
        })
    }

    /// Counts an export failure under the matching metric.
    pub fn record_error(&self, err: &ExportError) {
        match err {
            ExportError::UnsupportedAggregation { .. } | ExportError::DescriptorMismatch { .. } => {
                self.validation_errors.inc()
            }
            ExportError::QueueFull { .. } | ExportError::NotRunning { .. } => {
                self.queue_dropped.inc()
            }
            ExportError::Transport { .. } => {
                self.request_errors.with_label_values(&[err.kind()]).inc()
            }
        }
    }

    /// Records one finished bundle upload.
    pub fn observe_upload(&self, bundle_len: usize, elapsed: Duration) {
        self.bundle_size.observe(bundle_len as f64);
        self.upload_duration.observe(elapsed.as_secs_f64());
    }

    /// Renders the registry in Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

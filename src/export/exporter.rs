use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::client::MetricClient;
use super::convert::{make_requests, RequestOptions};
use super::descriptor::{check_descriptor_shape, descriptor_for_view, descriptor_shape};
use super::error::{ExportError, TransportError};
use super::health::ExporterHealth;
use super::wire::UploadRequest;
use crate::config::ExporterConfig;
use crate::stats::{View, ViewData, ViewExporter};

/// Callback invoked for every export failure.
pub type ErrorHandler = Arc<dyn Fn(&ExportError) + Send + Sync>;

/// Outcome of one upload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    /// Snapshots handed to the upload.
    pub views: usize,
    /// Snapshots skipped because their descriptor could not be ensured.
    pub views_skipped: usize,
    pub requests_sent: usize,
    pub requests_failed: usize,
    /// Points in successfully sent requests.
    pub points: usize,
}

enum Command {
    View(ViewData),
    Flush(oneshot::Sender<()>),
}

/// Bundles view snapshots and uploads them through a [`MetricClient`].
///
/// Snapshots arrive through [`ViewExporter::export_view`] onto a bounded
/// queue. An accumulator task cuts bundles by count and delay and uploads
/// each bundle on its own task, so a slow upload never blocks the queue.
pub struct Exporter<C: MetricClient> {
    cfg: ExporterConfig,
    uploader: Arc<Uploader<C>>,
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: MetricClient> Exporter<C> {
    pub fn new(cfg: ExporterConfig, client: Arc<C>) -> Self {
        Self::with_hooks(cfg, client, None, None)
    }

    /// Creates an exporter reporting failures to `on_error` and `health`.
    pub fn with_hooks(
        cfg: ExporterConfig,
        client: Arc<C>,
        on_error: Option<ErrorHandler>,
        health: Option<Arc<ExporterHealth>>,
    ) -> Self {
        let opts = RequestOptions {
            project_id: cfg.project_id.clone(),
            metric_prefix: cfg.metric_prefix.clone(),
            resource_type: cfg.resource_type.clone(),
        };

        let uploader = Arc::new(Uploader {
            client,
            opts,
            max_per_request: cfg.max_time_series_per_request,
            upload_timeout: cfg.upload_timeout,
            workers: Semaphore::new(cfg.workers.max(1)),
            known: Mutex::new(HashMap::new()),
            on_error,
            health,
        });

        Self {
            cfg,
            uploader,
            tx: Mutex::new(None),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Starts the background accumulator task.
    pub fn start(&self, ctx: CancellationToken) -> Result<()> {
        if self.cfg.max_queue_size == 0 {
            bail!("exporter max_queue_size must be positive");
        }
        if self.cfg.workers == 0 {
            bail!("exporter workers must be positive");
        }
        if self.cfg.bundle_count == 0 {
            bail!("exporter bundle_count must be positive");
        }
        if self.cfg.bundle_delay.is_zero() {
            bail!("exporter bundle_delay must be positive");
        }

        let mut tx_slot = self.tx.lock();
        if tx_slot.is_some() {
            bail!("exporter already started");
        }

        let (tx, rx) = mpsc::channel::<Command>(self.cfg.max_queue_size);
        *tx_slot = Some(tx);

        let ctx = ctx.child_token();
        *self.cancel.lock() = Some(ctx.clone());

        let accumulator = Accumulator {
            uploader: Arc::clone(&self.uploader),
            bundle: Vec::with_capacity(self.cfg.bundle_count),
            bundle_count: self.cfg.bundle_count,
            in_flight: JoinSet::new(),
        };
        let task = tokio::spawn(accumulator.run(rx, ctx, self.cfg.bundle_delay));
        *self.task.lock() = Some(task);

        tracing::info!(
            project = %self.cfg.project_id,
            bundle_count = self.cfg.bundle_count,
            bundle_delay = ?self.cfg.bundle_delay,
            workers = self.cfg.workers,
            "exporter started",
        );

        Ok(())
    }

    /// Waits until every snapshot queued before the call has been uploaded.
    pub async fn flush(&self) -> Result<()> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            bail!("exporter not started");
        };

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Command::Flush(done_tx))
            .await
            .map_err(|_| anyhow::anyhow!("exporter accumulator stopped"))?;
        done_rx.await.context("waiting for flush")?;

        Ok(())
    }

    /// Stops the exporter, uploading everything still queued.
    pub async fn stop(&self) -> Result<()> {
        // Drop the sender so the accumulator drains and exits.
        self.tx.lock().take();

        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("joining exporter task")?;
        }

        tracing::info!("exporter stopped");

        Ok(())
    }

    /// Uploads snapshots right away, bypassing the queue.
    pub async fn upload(&self, data: Vec<ViewData>) -> UploadReport {
        self.uploader.upload(data).await
    }
}

impl<C: MetricClient> ViewExporter for Exporter<C> {
    fn name(&self) -> &str {
        "metric"
    }

    fn export_view(&self, data: ViewData) {
        let view = Arc::clone(&data.view);

        let err = match self.tx.lock().as_ref() {
            None => ExportError::NotRunning {
                view: view.name().to_string(),
            },
            Some(tx) => match tx.try_send(Command::View(data)) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => ExportError::QueueFull {
                    view: view.name().to_string(),
                },
                Err(TrySendError::Closed(_)) => ExportError::NotRunning {
                    view: view.name().to_string(),
                },
            },
        };

        self.uploader.report_error(&err);
    }
}

struct Accumulator<C: MetricClient> {
    uploader: Arc<Uploader<C>>,
    bundle: Vec<ViewData>,
    bundle_count: usize,
    in_flight: JoinSet<()>,
}

impl<C: MetricClient> Accumulator<C> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        ctx: CancellationToken,
        bundle_delay: Duration,
    ) {
        let mut interval = tokio::time::interval(bundle_delay);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    // Drain queue and upload remaining snapshots.
                    while let Ok(cmd) = rx.try_recv() {
                        self.handle(cmd).await;
                    }
                    self.dispatch();
                    self.wait_in_flight().await;
                    return;
                }

                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => {
                            self.dispatch();
                            self.wait_in_flight().await;
                            return;
                        }
                    }
                }

                _ = interval.tick() => {
                    self.dispatch();
                }

                joined = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Some(Err(e)) = joined {
                        tracing::warn!(error = %e, "export upload task failed");
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::View(data) => {
                self.bundle.push(data);
                if self.bundle.len() >= self.bundle_count {
                    self.dispatch();
                }
            }
            Command::Flush(done) => {
                self.dispatch();
                self.wait_in_flight().await;
                let _ = done.send(());
            }
        }
    }

    /// Uploads the current bundle on its own task.
    fn dispatch(&mut self) {
        if self.bundle.is_empty() {
            return;
        }

        let data = std::mem::replace(&mut self.bundle, Vec::with_capacity(self.bundle_count));
        let uploader = Arc::clone(&self.uploader);
        self.in_flight.spawn(async move {
            uploader.upload(data).await;
        });
    }

    async fn wait_in_flight(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "export upload task failed");
            }
        }
    }
}

struct Uploader<C: MetricClient> {
    client: Arc<C>,
    opts: RequestOptions,
    max_per_request: usize,
    upload_timeout: Duration,
    workers: Semaphore,
    /// Views whose descriptor is known to match, by metric type.
    known: Mutex<HashMap<String, Arc<View>>>,
    on_error: Option<ErrorHandler>,
    health: Option<Arc<ExporterHealth>>,
}

impl<C: MetricClient> Uploader<C> {
    async fn upload(self: &Arc<Self>, data: Vec<ViewData>) -> UploadReport {
        let started = Instant::now();
        let mut report = UploadReport {
            views: data.len(),
            ..Default::default()
        };

        let mut accepted = Vec::with_capacity(data.len());
        for vd in data {
            match self.ensure_descriptor(&vd.view).await {
                Ok(()) => accepted.push(vd),
                Err(e) => {
                    report.views_skipped += 1;
                    self.report_error(&e);
                }
            }
        }

        let requests = make_requests(&self.opts, &accepted, self.max_per_request);
        let mut sends = JoinSet::new();
        for request in requests {
            let this = Arc::clone(self);
            sends.spawn(async move { this.send(request).await });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(Ok(points)) => {
                    report.requests_sent += 1;
                    report.points += points;
                }
                Ok(Err(e)) => {
                    report.requests_failed += 1;
                    self.report_error(&e);
                }
                Err(e) => {
                    report.requests_failed += 1;
                    tracing::warn!(error = %e, "upload request task failed");
                }
            }
        }

        if let Some(health) = &self.health {
            health.views_exported.inc_by(accepted.len() as f64);
            health.observe_upload(report.views, started.elapsed());
        }

        tracing::debug!(
            views = report.views,
            skipped = report.views_skipped,
            requests = report.requests_sent,
            failed = report.requests_failed,
            points = report.points,
            elapsed = ?started.elapsed(),
            "uploaded view bundle",
        );

        report
    }

    /// Makes sure the backend has a descriptor matching the view, creating
    /// one when it has none.
    async fn ensure_descriptor(&self, view: &Arc<View>) -> Result<(), ExportError> {
        let metric_type = self.opts.metric_type(view.name());

        descriptor_shape(view.aggregation(), view.window()).map_err(|reason| {
            ExportError::UnsupportedAggregation {
                metric_type: metric_type.clone(),
                reason,
            }
        })?;

        if self
            .known
            .lock()
            .get(&metric_type)
            .is_some_and(|known| known == view)
        {
            return Ok(());
        }

        let existing = self
            .call(
                "get metric descriptor",
                &metric_type,
                self.client.get_metric_descriptor(&metric_type),
            )
            .await?;

        match existing {
            Some(descriptor) => check_descriptor_shape(
                &descriptor,
                view.aggregation(),
                view.window(),
                view.group_keys(),
            )?,
            None => {
                let descriptor = descriptor_for_view(&self.opts, view)?;
                self.call(
                    "create metric descriptor",
                    &metric_type,
                    self.client.create_metric_descriptor(&descriptor),
                )
                .await?;
                tracing::info!(metric_type = %metric_type, "metric descriptor created");
            }
        }

        self.known.lock().insert(metric_type, Arc::clone(view));
        Ok(())
    }

    /// Sends one request under a worker permit. Returns the number of points.
    async fn send(&self, request: UploadRequest) -> Result<usize, ExportError> {
        let _permit = self.workers.acquire().await.map_err(|e| ExportError::Transport {
            operation: "create time series",
            target: request.target.clone(),
            source: TransportError::Request(e.to_string()),
        })?;

        let points = request.time_series.len();
        self.call(
            "create time series",
            &request.target,
            self.client.create_time_series(&request),
        )
        .await?;

        if let Some(health) = &self.health {
            health.requests_sent.inc();
            health.points_exported.inc_by(points as f64);
        }

        Ok(points)
    }

    /// Runs one backend call under the upload timeout.
    async fn call<T>(
        &self,
        operation: &'static str,
        target: &str,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, ExportError> {
        let result = match tokio::time::timeout(self.upload_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.upload_timeout)),
        };

        result.map_err(|source| ExportError::Transport {
            operation,
            target: target.to_string(),
            source,
        })
    }

    fn report_error(&self, err: &ExportError) {
        tracing::warn!(kind = err.kind(), error = %err, "export failed");

        if let Some(health) = &self.health {
            health.record_error(err);
        }
        if let Some(on_error) = &self.on_error {
            on_error(err);
        }
    }
}

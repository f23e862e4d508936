use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::Registry;
use super::view::ViewData;

/// Receives view snapshots from the [`Reporter`].
///
/// Implementations must not block: the reporter calls them inline from its
/// tick loop.
pub trait ViewExporter: Send + Sync {
    /// Returns the exporter name for logging.
    fn name(&self) -> &str;

    /// Accepts one snapshot.
    fn export_view(&self, data: ViewData);
}

type ExporterList = Arc<RwLock<Vec<Arc<dyn ViewExporter>>>>;

/// Periodically snapshots every registered view and hands the snapshots to
/// the registered exporters.
pub struct Reporter {
    registry: Arc<Registry>,
    period: Duration,
    exporters: ExporterList,
    cancel: Option<CancellationToken>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl Reporter {
    pub fn new(registry: Arc<Registry>, period: Duration) -> Self {
        Self {
            registry,
            period,
            exporters: Arc::new(RwLock::new(Vec::new())),
            cancel: None,
            run_task: Mutex::new(None),
        }
    }

    pub fn register_exporter(&self, exporter: Arc<dyn ViewExporter>) {
        tracing::debug!(exporter = exporter.name(), "view exporter registered");
        self.exporters.write().push(exporter);
    }

    pub fn unregister_exporters(&self) {
        self.exporters.write().clear();
    }

    /// Runs one reporting cycle immediately. Returns the number of views
    /// handed to exporters.
    pub fn report_once(&self) -> usize {
        report(&self.registry, &self.exporters)
    }

    /// Starts the periodic reporting task. A final cycle runs on cancellation.
    pub fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        if self.period.is_zero() {
            bail!("reporting period must be positive");
        }

        self.cancel = Some(ctx.clone());

        let registry = Arc::clone(&self.registry);
        let exporters = Arc::clone(&self.exporters);
        let period = self.period;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        let views = report(&registry, &exporters);
                        tracing::debug!(views, "final report cycle");
                        return;
                    }

                    _ = ticker.tick() => {
                        let views = report(&registry, &exporters);
                        tracing::trace!(views, "report cycle");
                    }
                }
            }
        });
        *self.run_task.lock() = Some(task);

        tracing::info!(period = ?self.period, "reporter started");

        Ok(())
    }

    /// Stops the reporting task after its final cycle.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        let task = self.run_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "reporter task join failed");
            }
        }

        Ok(())
    }
}

fn report(registry: &Registry, exporters: &ExporterList) -> usize {
    let exporters: Vec<Arc<dyn ViewExporter>> = exporters.read().clone();
    if exporters.is_empty() {
        return 0;
    }

    let mut reported = 0;
    for data in registry.retrieve_all() {
        if data.rows.is_empty() {
            continue;
        }
        reported += 1;

        if let Some((last, rest)) = exporters.split_last() {
            for exporter in rest {
                exporter.export_view(data.clone());
            }
            last.export_view(data);
        }
    }

    reported
}

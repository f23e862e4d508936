use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use viewstat::config::Config;
use viewstat::export::{Exporter, ExporterHealth, HttpMetricClient};
use viewstat::rpc::{RpcError, Side, StatsHandler};
use viewstat::stats::{Registry, Reporter};

/// Methods the traffic simulator rotates through.
const SIMULATED_METHODS: [&str; 3] = [
    "/helloworld.Greeter/SayHello",
    "/helloworld.Greeter/SayGoodbye",
    "/store.Inventory/ListItems",
];

/// Daemon wires the registry, RPC handlers, reporter, exporter and health
/// server together.
pub struct Daemon {
    cfg: Config,
    registry: Arc<Registry>,
    health: Option<Arc<ExporterHealth>>,
    handlers: Vec<StatsHandler>,
    reporter: Reporter,
    exporter: Option<Arc<Exporter<HttpMetricClient>>>,
    simulator: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(cfg: Config) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let reporter = Reporter::new(Arc::clone(&registry), cfg.reporting_period);

        let health = if cfg.health.enabled {
            Some(Arc::new(
                ExporterHealth::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        } else {
            None
        };

        Ok(Self {
            cfg,
            registry,
            health,
            handlers: Vec::new(),
            reporter,
            exporter: None,
            simulator: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so health checks respond during startup.
        if let Some(health) = &self.health {
            health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. RPC measures and views.
        let sides = [
            (Side::Server, self.cfg.rpc.server_views),
            (Side::Client, self.cfg.rpc.client_views),
        ];
        for (side, enabled) in sides {
            if !enabled {
                continue;
            }
            let handler = StatsHandler::new(Arc::clone(&self.registry), side)
                .with_context(|| format!("registering {} measures", side.as_str()))?;
            handler
                .register_default_views()
                .with_context(|| format!("registering {} views", side.as_str()))?;
            self.handlers.push(handler);
        }

        // 2. Exporter, on its own token so it outlives the reporter's final cycle.
        if self.cfg.exporter.enabled {
            let client = HttpMetricClient::new(&self.cfg.exporter)
                .context("creating metric backend client")?;
            let exporter = Arc::new(Exporter::with_hooks(
                self.cfg.exporter.clone(),
                Arc::new(client),
                None,
                self.health.clone(),
            ));
            exporter
                .start(CancellationToken::new())
                .context("starting exporter")?;
            self.reporter.register_exporter(exporter.clone());
            self.exporter = Some(exporter);
        } else {
            info!("exporter disabled, snapshots are not uploaded");
        }

        // 3. Periodic reporting.
        self.reporter
            .start(self.cancel.child_token())
            .context("starting reporter")?;

        // 4. Optional synthetic traffic.
        if self.cfg.simulate.rps > 0 {
            if let Some(handler) = self.handlers.first() {
                self.simulator = Some(spawn_simulator(
                    handler.clone(),
                    self.cfg.simulate.rps,
                    self.cancel.child_token(),
                ));
            }
        }

        info!(
            views = self.registry.registered_views().len(),
            "daemon fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stops the simulator and triggers the reporter's final cycle.
        self.cancel.cancel();

        if let Some(simulator) = self.simulator.take() {
            if let Err(e) = simulator.await {
                warn!(error = %e, "simulator task join failed");
            }
        }

        self.reporter.stop().await?;

        // Exporter drains what the final report queued.
        if let Some(exporter) = self.exporter.take() {
            if let Err(e) = exporter.stop().await {
                error!(error = %e, "error stopping exporter");
            }
        }
        self.reporter.unregister_exporters();

        for handler in &self.handlers {
            if let Err(e) = handler.unregister_default_views() {
                warn!(side = handler.side().as_str(), error = %e, "unregistering views");
            }
        }

        if let Some(health) = &self.health {
            health.stop();
        }

        Ok(())
    }
}

/// Spawns a task that issues `rps` synthetic calls per second through the
/// handler.
fn spawn_simulator(handler: StatsHandler, rps: u32, cancel: CancellationToken) -> JoinHandle<()> {
    info!(rps, side = handler.side().as_str(), "simulating RPC traffic");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / rps.max(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut seq: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(calls = seq, "simulator stopped");
                    return;
                }
                _ = ticker.tick() => {
                    seq += 1;
                    if let Err(e) = simulate_call(&handler, seq) {
                        warn!(error = %e, "simulated call failed");
                    }
                }
            }
        }
    })
}

/// Runs one synthetic call. Payload sizes and counts vary with `seq`; every
/// tenth call ends with an error.
fn simulate_call(handler: &StatsHandler, seq: u64) -> Result<(), RpcError> {
    let idx = (seq % SIMULATED_METHODS.len() as u64) as usize;
    let mut call = handler.tag_rpc_current(SIMULATED_METHODS[idx])?;

    call.in_payload(64 + (seq % 7) as usize * 512)?;
    for i in 0..seq % 4 {
        call.out_payload(128 << i)?;
    }

    let error = (seq % 10 == 0).then_some("Unavailable");
    call.end(error)
}

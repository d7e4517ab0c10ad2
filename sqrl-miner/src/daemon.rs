//! Daemon lifecycle management.
//!
//! Enumerates devices, connects their transports, and spawns one mining
//! task per board plus the shared telemetry ticker, work dispatcher, and
//! solution sink. Shutdown is cooperative: a signal cancels the token,
//! every miner is kicked out of its wait, and the task tracker drains.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::device;
use crate::miner::{Miner, MinerHandle};
use crate::transport::tcp::TcpAxi;
use crate::work::{work_channel, DummyEpochs, DummySource, EpochSource, Solution};

/// Cadence of the telemetry/status sampler.
const TELEMETRY_PERIOD: Duration = Duration::from_secs(10);

/// Emission interval of the dummy bring-up source.
const DUMMY_WORK_PERIOD: Duration = Duration::from_secs(30);

/// The main daemon.
pub struct Daemon {
    settings: Arc<Settings>,
    dummy_work: bool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(settings: Settings, dummy_work: bool) -> Self {
        Self {
            settings: Arc::new(settings),
            dummy_work,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let devices = device::enumerate(&self.settings);
        anyhow::ensure!(!devices.is_empty(), "no devices configured");

        let (work_tx, work_rx) = work_channel();
        let (solution_tx, mut solution_rx) = mpsc::unbounded_channel::<Solution>();
        let epochs: Arc<dyn EpochSource> = Arc::new(DummyEpochs);

        let connect_timeout = Duration::from_millis(self.settings.axi_timeout_ms.max(1000));
        let mut handles: Vec<MinerHandle<TcpAxi>> = Vec::new();
        for (index, descriptor) in devices.into_iter().enumerate() {
            let axi = match TcpAxi::connect(&descriptor.host, descriptor.port, connect_timeout).await
            {
                Ok(axi) => axi,
                Err(e) => {
                    error!(device = %descriptor.name, error = %e, "failed to connect");
                    continue;
                }
            };
            info!(device = %descriptor.name, "connected");

            let miner = Miner::new(
                index,
                descriptor,
                Arc::clone(&self.settings),
                axi,
                work_rx.clone(),
                Arc::new(solution_tx.clone()),
                Arc::clone(&epochs),
                self.shutdown.clone(),
            );
            handles.push(miner.handle());
            self.tracker.spawn(async move {
                if let Err(e) = miner.run().await {
                    error!(error = %e, "miner task ended with error");
                }
            });
        }
        anyhow::ensure!(!handles.is_empty(), "no devices connected");

        // Dispatcher: kick every miner whenever new work lands.
        self.tracker.spawn({
            let mut work_rx = work_rx.clone();
            let handles = handles.clone();
            let shutdown = self.shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        changed = work_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            for handle in &handles {
                                handle.kick();
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        });

        // Telemetry ticker.
        self.tracker.spawn({
            let handles = handles.clone();
            let shutdown = self.shutdown.clone();
            async move {
                let mut ticker = tokio::time::interval(TELEMETRY_PERIOD);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for handle in &handles {
                                handle.report_telemetry().await;
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        });

        // Solution sink: hand-off point to the farm dispatcher.
        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        solution = solution_rx.recv() => {
                            let Some(solution) = solution else { break };
                            info!(
                                miner = solution.miner_index,
                                nonce = format_args!("{:#018x}", solution.nonce),
                                epoch = solution.work.epoch,
                                "submitting solution"
                            );
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        });

        if self.dummy_work {
            self.tracker.spawn(
                DummySource::new(work_tx.clone(), DUMMY_WORK_PERIOD, self.shutdown.clone()).run(),
            );
        } else {
            warn!("no work source configured; devices stay idle (use --dummy-work for bring-up)");
        }

        wait_for_shutdown_signal().await;
        info!("shutting down");
        self.shutdown.cancel();
        for handle in &handles {
            handle.kick();
        }
        drop(work_tx);

        self.tracker.close();
        self.tracker.wait().await;
        info!("all tasks stopped");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}

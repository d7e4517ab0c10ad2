//! Per-device driver state machine.
//!
//! One [`Miner`] owns one board: the transport handle, the voltage table,
//! clock bookkeeping, and the work loop that sequences epoch initialization
//! and nonce searching. The transport sits inside the AXI lock, so holding
//! the guard is the only way to touch registers; the interrupt path keeps
//! its own clone of the handle, matching the hardware's out-of-band nonce
//! delivery.
//!
//! The work loop is cooperative: the farm pushes packages over a watch
//! channel and calls [`MinerHandle::kick`] to interrupt an idle wait or a
//! running search.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{self, ClockChange};
use crate::config::Settings;
use crate::device::DeviceDescriptor;
use crate::power::{self, VoltageTable};
use crate::regs::{ethcore, ident, IRQ_NONCE};
use crate::stats::HashrateAverages;
use crate::telemetry::TelemetrySnapshot;
use crate::transport::{Axi, AxiResult};
use crate::tuner::Tuner;
use crate::work::{EpochSource, SolutionSink, WorkReceiver, ALGO_ETHASH};
use crate::{dag, search};

/// Idle wait between polls for work when the farm has nothing queued.
const IDLE_WAIT: Duration = Duration::from_secs(3);

/// State shared between the work loop, the telemetry reader, and the farm's
/// kick path.
pub struct MinerShared<A: Axi> {
    pub index: usize,
    pub descriptor: DeviceDescriptor,
    pub settings: Arc<Settings>,
    /// The AXI lock. Register traffic happens only through this guard.
    pub axi: tokio::sync::Mutex<A>,
    /// Interrupt-path clone of the transport, used without the AXI lock.
    pub irq: A,
    pub tuner: Tuner,
    pub voltage_table: VoltageTable,
    /// Tune-file key: DNA, bitstream, and voltage targets. Set at bring-up.
    pub setting_id: OnceLock<String>,
    /// Most recently confirmed core clock, MHz.
    pub last_clk: AtomicU32,
    /// True while the epoch initializer owns the core, and latched true by
    /// the HBM interlock to refuse further work.
    pub dagging: AtomicBool,
    pub new_work: AtomicBool,
    pub wake: Notify,
    pub shutdown: CancellationToken,
    pub stats: parking_lot::Mutex<HashrateAverages>,
    pub telemetry: parking_lot::Mutex<TelemetrySnapshot>,
}

impl<A: Axi> MinerShared<A> {
    /// Interrupt the idle wait and any in-progress search.
    pub fn kick(&self) {
        self.new_work.store(true, Ordering::Relaxed);
        if !self.dagging.load(Ordering::Relaxed) {
            self.irq.kick_interrupts();
        }
        self.wake.notify_one();
    }

    /// Log, and terminate the process when configured to treat transport
    /// errors as fatal.
    pub(crate) fn die_on_error(&self, context: &str) {
        if self.settings.die_on_error {
            error!(device = %self.descriptor.unique_id, context, "fatal transport error");
            std::process::exit(1);
        }
    }
}

/// Cloneable handle for the daemon's telemetry and kick paths.
pub struct MinerHandle<A: Axi> {
    shared: Arc<MinerShared<A>>,
}

impl<A: Axi> Clone for MinerHandle<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A: Axi> MinerHandle<A> {
    pub fn kick(&self) {
        self.shared.kick();
    }

    pub fn unique_id(&self) -> &str {
        &self.shared.descriptor.unique_id
    }

    /// Sample telemetry and run the safety interlock.
    pub async fn report_telemetry(&self) -> TelemetrySnapshot {
        crate::telemetry::sample(&self.shared).await
    }
}

/// One driven device.
pub struct Miner<A: Axi> {
    shared: Arc<MinerShared<A>>,
    work_rx: WorkReceiver,
    solutions: Arc<dyn SolutionSink>,
    epochs: Arc<dyn EpochSource>,
}

impl<A: Axi> Miner<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        descriptor: DeviceDescriptor,
        settings: Arc<Settings>,
        axi: A,
        work_rx: WorkReceiver,
        solutions: Arc<dyn SolutionSink>,
        epochs: Arc<dyn EpochSource>,
        shutdown: CancellationToken,
    ) -> Self {
        let tuner = Tuner::new(settings.auto_tune);
        let shared = Arc::new(MinerShared {
            index,
            descriptor,
            axi: tokio::sync::Mutex::new(axi.clone()),
            irq: axi,
            tuner,
            voltage_table: VoltageTable::new(),
            setting_id: OnceLock::new(),
            last_clk: AtomicU32::new(0),
            dagging: AtomicBool::new(false),
            new_work: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown,
            stats: parking_lot::Mutex::new(HashrateAverages::new()),
            telemetry: parking_lot::Mutex::new(TelemetrySnapshot::default()),
            settings,
        });
        Self {
            shared,
            work_rx,
            solutions,
            epochs,
        }
    }

    pub fn handle(&self) -> MinerHandle<A> {
        MinerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Identify the board, program voltages and the stock clock, and load
    /// any saved tune.
    async fn init_device(&self) -> anyhow::Result<()> {
        let shared = &self.shared;
        let descriptor = &shared.descriptor;
        info!(
            device = %descriptor.unique_id,
            name = %descriptor.name,
            memory = descriptor.total_memory,
            "using FPGA"
        );

        let axi = shared.axi.lock().await;
        axi.set_timeout(Duration::from_millis(shared.settings.axi_timeout_ms));
        // Only affects interrupts from the multi-client bridge.
        if let Err(e) = axi.enable_interrupts(IRQ_NONCE).await {
            warn!(error = %e, "error arming nonce interrupts");
        }

        let dna_lo = read_or_default(&*axi, ident::DNA_LO, 0, "dna").await;
        let dna_mid = read_or_default(&*axi, ident::DNA_MID, 0, "dna").await;
        let dna_hi = read_or_default(&*axi, ident::DNA_HI, 0, "dna").await;
        let dna = format!("{dna_lo:08x}{dna_mid:08x}{dna_hi:08x}");
        info!(dna = %dna, "device DNA");

        // 'unkn' when the magic cannot be read.
        let magic = read_or_default(&*axi, ident::DEVICE_MAGIC, 0x756e_6b6e, "device type").await;
        let bitstream = read_or_default(&*axi, ident::BITSTREAM, 0, "bitstream version").await;
        let fpga_name: String = magic.to_be_bytes().iter().map(|b| *b as char).collect();
        info!(fpga = %fpga_name, bitstream = format_args!("{bitstream:08x}"), "bitstream identity");

        let setting_id = format!(
            "{dna}_{bitstream:08x}_{:.2}{:.2}",
            shared.settings.fk_vccint_mv as f64, shared.settings.jc_vccint_mv as f64
        );
        let _ = shared.setting_id.set(setting_id.clone());

        if let Err(e) = power::set_voltage(
            &*axi,
            &shared.voltage_table,
            shared.settings.fk_vccint_mv,
            shared.settings.jc_vccint_mv,
        )
        .await
        {
            warn!(error = %e, "error programming VCCINT setpoints");
        }

        let stock = clock::apply(&*axi, ClockChange::Stock, &shared.last_clk).await?;
        info!(mhz = stock as u32, "stock clock");
        if descriptor.target_clk != 0 {
            info!(mhz = descriptor.target_clk, "target clock set, applied after DAG generation");
            shared.last_clk.store(descriptor.target_clk, Ordering::Relaxed);
        } else {
            let measured = clock::apply(&*axi, ClockChange::Query, &shared.last_clk).await?;
            shared.last_clk.store(measured as u32, Ordering::Relaxed);
        }
        drop(axi);

        info!(tune_id = %setting_id, "tune identity");
        if shared.settings.auto_tune > 0 {
            if let Some(path) = &shared.settings.tune_file {
                match Tuner::load_saved_tune(path, &setting_id) {
                    Ok(Some(record)) => {
                        shared.tuner.apply_saved(record);
                        shared.settings.set_intensity(record.intensity);
                        if record.clock_mhz != 0 {
                            shared.last_clk.store(record.clock_mhz, Ordering::Relaxed);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "could not read tune file"),
                }
            }
        }

        let intensity = shared.settings.intensity();
        info!(
            work_delay = shared.settings.work_delay_us,
            patience = intensity.patience,
            intensity_n = intensity.intensity_n,
            intensity_d = intensity.intensity_d,
            skip_stall_detect = shared.settings.skip_stall_detection,
            "effective settings"
        );
        Ok(())
    }

    /// The work loop: pull work, stage epochs, search. Runs until shutdown
    /// or a fatal condition ends this device's task.
    pub async fn run(self) -> anyhow::Result<()> {
        self.init_device().await?;

        let mut current: Option<crate::work::WorkPackage> = None;
        loop {
            if self.shared.shutdown.is_cancelled() {
                break;
            }

            let latest = self.work_rx.borrow().clone();
            let Some(w) = latest else {
                self.idle_wait().await;
                continue;
            };

            if w.algo != ALGO_ETHASH {
                anyhow::bail!("algo {} not yet implemented", w.algo);
            }

            if current.as_ref().map(|c| c.epoch) != Some(w.epoch) {
                let context = self.epochs.context(w.epoch)?;
                if !dag::initialize(&self.shared, &context).await? {
                    anyhow::bail!("epoch {} initialization failed", w.epoch);
                }
                // DAG generation takes a while; re-read the queue so the
                // search starts on the latest job, not the one that
                // triggered the epoch change.
                current = Some(w);
                continue;
            }
            current = Some(w.clone());

            // Latched by the HBM interlock: refuse work until reinit.
            if self.shared.dagging.load(Ordering::Relaxed) {
                self.idle_wait().await;
                continue;
            }

            search::run(&self.shared, &w, self.solutions.as_ref()).await?;
        }

        info!(device = %self.shared.descriptor.unique_id, "work loop ended");
        Ok(())
    }

    async fn idle_wait(&self) {
        let _ = tokio::time::timeout(IDLE_WAIT, self.shared.wake.notified()).await;
    }
}

/// Stop the hashcore. A soft stop ramps the intensity field down in eight
/// steps before the reset write, keeping the VRM out of a load-dump spike;
/// if the flags register cannot be read the reset is issued directly.
pub(crate) async fn stop_hashcore<A: Axi>(axi: &A, soft: bool) -> AxiResult<()> {
    if soft {
        match axi.read(ethcore::FLAGS).await {
            Ok(flags) => {
                let mut intensity = i32::from((flags >> 24) as u8);
                let step = (intensity + 7) / 8;
                while intensity > 0 {
                    let word = (flags & 0x00FF_FFFF) | ((intensity as u32) << 24);
                    axi.write(word, ethcore::FLAGS, false).await?;
                    intensity -= step;
                }
                if intensity != 0 {
                    axi.write(flags & 0x00FF_FFFF, ethcore::FLAGS, false).await?;
                }
            }
            Err(e) => {
                warn!(error = %e, "error gracefully resetting core, using hard reset");
            }
        }
    }
    axi.write(ethcore::CTRL_RESET, ethcore::CTRL, false).await
}

pub(crate) async fn read_or_default<A: Axi>(axi: &A, addr: u32, default: u32, what: &str) -> u32 {
    match axi.read(addr).await {
        Ok(v) => v,
        Err(e) => {
            warn!(addr = format_args!("{addr:#x}"), error = %e, "error reading {what}");
            default
        }
    }
}

//! Daemon configuration.
//!
//! CLI flags map one-to-one onto [`Settings`], which every per-device task
//! shares through an `Arc`. Everything is fixed after startup except the
//! intensity triple, which a tune may rewrite; it sits behind its own small
//! lock so the search loop always reads a consistent set.

use std::path::PathBuf;

use clap::Parser;
use parking_lot::Mutex;

use crate::tuner::IntensitySettings;

/// Command-line surface of `minerd`.
#[derive(Parser, Debug)]
#[command(name = "minerd", about = "SQRL TCP-FPGA Ethash mining daemon", version)]
pub struct Opts {
    /// Boards to drive, as `host[:port[-endPort]]`. A single spec with a
    /// port range expands into one device per port.
    #[arg(required = true)]
    pub hosts: Vec<String>,

    /// Per-request transport timeout (ms).
    #[arg(long, default_value_t = 500)]
    pub axi_timeout_ms: u64,

    /// Interrupt-wait granularity (µs). The search loop wakes at least this
    /// often to sample counters.
    #[arg(long, default_value_t = 100_000)]
    pub work_delay: u64,

    /// Hashcore patience field; 0 leaves the core default.
    #[arg(long, default_value_t = 0)]
    pub patience: u8,

    /// Hashcore intensity numerator; 0 leaves the core default.
    #[arg(long, default_value_t = 0)]
    pub intensity_n: u8,

    /// Hashcore intensity denominator.
    #[arg(long, default_value_t = 1)]
    pub intensity_d: u8,

    /// DAG mixer lanes baked into the bitstream. Must match the bitstream.
    #[arg(long, default_value_t = 8)]
    pub dag_mixers: u32,

    /// Regenerate the DAG even if the board reports a matching epoch.
    #[arg(long)]
    pub force_dag: bool,

    /// Skip waiting for DAG generation (development; expect failed hashes).
    #[arg(long)]
    pub skip_dag: bool,

    /// Disable the stall-counter watchdog.
    #[arg(long)]
    pub skip_stall_detection: bool,

    /// Exit the process on any transport error.
    #[arg(long)]
    pub die_on_error: bool,

    /// Always include HBM details in the status line.
    #[arg(long)]
    pub show_hbm_stats: bool,

    /// Core clock target (MHz), applied after DAG generation. 0 keeps the
    /// stock clock.
    #[arg(long, default_value_t = 0)]
    pub target_clk: u32,

    /// Saved-tune file; a record matching the board's setting ID is applied
    /// and disables auto-tuning.
    #[arg(long)]
    pub tune_file: Option<PathBuf>,

    /// Auto-tune mode; 0 disables.
    #[arg(long, default_value_t = 0)]
    pub auto_tune: u32,

    /// FK-board VCCINT setpoint (mV, 501..=920); 0 leaves the rail alone.
    #[arg(long, default_value_t = 0)]
    pub fk_vccint: u32,

    /// JC-board VCCINT setpoint (mV, 501..=920); 0 leaves the rail alone.
    #[arg(long, default_value_t = 0)]
    pub jc_vccint: u32,

    /// Drive boards from the built-in dummy work source instead of a farm.
    #[arg(long)]
    pub dummy_work: bool,
}

impl Opts {
    pub fn into_settings(self) -> Settings {
        Settings {
            hosts: self.hosts,
            axi_timeout_ms: self.axi_timeout_ms,
            work_delay_us: self.work_delay,
            intensity: Mutex::new(IntensitySettings {
                patience: self.patience,
                intensity_n: self.intensity_n,
                intensity_d: self.intensity_d,
            }),
            dag_mixers: self.dag_mixers,
            force_dag: self.force_dag,
            skip_dag: self.skip_dag,
            skip_stall_detection: self.skip_stall_detection,
            die_on_error: self.die_on_error,
            show_hbm_stats: self.show_hbm_stats,
            target_clk: self.target_clk,
            tune_file: self.tune_file,
            auto_tune: self.auto_tune,
            fk_vccint_mv: self.fk_vccint,
            jc_vccint_mv: self.jc_vccint,
        }
    }
}

/// Runtime settings shared by every per-device task.
#[derive(Debug)]
pub struct Settings {
    pub hosts: Vec<String>,
    pub axi_timeout_ms: u64,
    pub work_delay_us: u64,
    /// Tuner-writable core flag fields.
    pub intensity: Mutex<IntensitySettings>,
    pub dag_mixers: u32,
    pub force_dag: bool,
    pub skip_dag: bool,
    pub skip_stall_detection: bool,
    pub die_on_error: bool,
    pub show_hbm_stats: bool,
    pub target_clk: u32,
    pub tune_file: Option<PathBuf>,
    pub auto_tune: u32,
    pub fk_vccint_mv: u32,
    pub jc_vccint_mv: u32,
}

impl Settings {
    /// Current intensity triple, read atomically as a set.
    pub fn intensity(&self) -> IntensitySettings {
        *self.intensity.lock()
    }

    /// Replace the intensity triple as a set.
    pub fn set_intensity(&self, intensity: IntensitySettings) {
        *self.intensity.lock() = intensity;
    }
}

#[cfg(test)]
impl Default for Settings {
    fn default() -> Self {
        Opts::parse_from(["minerd", "127.0.0.1"]).into_settings()
    }
}

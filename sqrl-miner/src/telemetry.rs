//! Telemetry sampling and the HBM safety interlock.
//!
//! A periodic caller samples die temperature, core voltage, the current
//! clock, and the HBM stack status word, then logs the per-device status
//! line. A stack reporting a catastrophic temperature trip or lost
//! calibration powers the device down and latches it out of the work loop;
//! only a device reinit recovers.

use std::sync::atomic::Ordering;

use tracing::{error, info};

use crate::clock::{self, ClockChange};
use crate::miner::{stop_hashcore, MinerShared};
use crate::regs::{daggen, hbm, sysmon};
use crate::transport::Axi;

/// HBM temperature considered worth surfacing even without
/// `show_hbm_stats`.
const HBM_TEMP_ATTENTION_C: u8 = 70;

/// Decoded HBM stack status word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HbmStatus {
    pub left_calibrated: bool,
    pub right_calibrated: bool,
    pub left_cattrip: bool,
    pub right_cattrip: bool,
    pub left_temp_c: u8,
    pub right_temp_c: u8,
}

impl HbmStatus {
    pub fn decode(raw: u32) -> Self {
        Self {
            left_calibrated: raw & hbm::LEFT_CALIBRATED != 0,
            right_calibrated: raw & hbm::RIGHT_CALIBRATED != 0,
            left_cattrip: raw & hbm::LEFT_CATTRIP != 0,
            right_cattrip: raw & hbm::RIGHT_CATTRIP != 0,
            left_temp_c: ((raw >> 3) & 0x7F) as u8,
            right_temp_c: ((raw >> 11) & 0x7F) as u8,
        }
    }

    /// Whether the stacks allow mining at all.
    pub fn healthy(&self) -> bool {
        self.left_calibrated && self.right_calibrated && !self.left_cattrip && !self.right_cattrip
    }

    fn needs_attention(&self) -> bool {
        !self.healthy()
            || self.left_temp_c > HBM_TEMP_ATTENTION_C
            || self.right_temp_c > HBM_TEMP_ATTENTION_C
    }
}

/// One telemetry sample, also cached on the miner for API consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetrySnapshot {
    pub die_temp_c: u32,
    pub core_millivolts: u32,
    pub clock_mhz: u32,
    pub hbm: HbmStatus,
}

/// Sample the device, log the status line, and run the safety interlock.
pub async fn sample<A: Axi>(shared: &MinerShared<A>) -> TelemetrySnapshot {
    let axi = shared.axi.lock().await;

    let die_temp_c = match axi.read(sysmon::TEMP_RAW).await {
        Ok(raw) => (f64::from(raw) * 507.6 / 65536.0 - 279.43) as u32,
        Err(_) => 0,
    };
    let clock_mhz = clock::apply(&*axi, ClockChange::Query, &shared.last_clk)
        .await
        .unwrap_or(0.0) as u32;
    let core_millivolts = match axi.read(sysmon::VOLT_RAW).await {
        Ok(raw) => (f64::from(raw) * 3.0 / 65536.0 * 1000.0) as u32,
        Err(_) => 0,
    };
    // Assume calibrated-and-cool when the read fails so a transport blip
    // does not cascade into a shutdown.
    let hbm_raw = axi.read(hbm::STATUS).await.unwrap_or(hbm::STATUS_FALLBACK);
    drop(axi);

    let snapshot = TelemetrySnapshot {
        die_temp_c,
        core_millivolts,
        clock_mhz,
        hbm: HbmStatus::decode(hbm_raw),
    };
    *shared.telemetry.lock() = snapshot;

    log_status_line(shared, &snapshot);

    if !snapshot.hbm.healthy() {
        safety_shutdown(shared, &snapshot.hbm).await;
    }
    snapshot
}

fn log_status_line<A: Axi>(shared: &MinerShared<A>, snapshot: &TelemetrySnapshot) {
    let slots = shared.stats.lock().slots();
    let intensity = shared.settings.intensity();

    let mut extras = String::new();
    if shared.settings.show_hbm_stats || snapshot.hbm.needs_attention() {
        let h = &snapshot.hbm;
        extras = format!(
            " HBM {}{}{}{}{}C {}C",
            if h.left_calibrated { "" } else { "LCAL:0 " },
            if h.right_calibrated { "" } else { "RCAL:0 " },
            if h.left_cattrip { "LCATTRIP " } else { "" },
            if h.right_cattrip { "RCATTRIP " } else { "" },
            h.left_temp_c,
            h.right_temp_c,
        );
    }
    let stage = shared.tuner.stage();
    if stage > 0 {
        extras.push_str(&format!(
            " tuning S{stage} ({} samples)",
            shared.tuner.samples()
        ));
    }

    info!(
        "{} avg 1m:{:.2} 10m:{:.2} 60m:{:.2} MH/s err={:.2}% [P={} N={} D={}] {}MHz {:.2}V {}C{}",
        shared.descriptor.unique_id,
        slots[0],
        slots[1],
        slots[2],
        slots[3],
        intensity.patience,
        intensity.intensity_n,
        intensity.intensity_d,
        shared.last_clk.load(Ordering::Relaxed),
        f64::from(snapshot.core_millivolts) / 1000.0,
        snapshot.die_temp_c,
        extras,
    );
}

/// Power the device down and latch it out of the work loop.
async fn safety_shutdown<A: Axi>(shared: &MinerShared<A>, status: &HbmStatus) {
    let axi = shared.axi.lock().await;
    if let Err(e) = stop_hashcore(&*axi, true).await {
        error!(error = %e, "error stopping hashcore during safety shutdown");
    }
    if let Err(e) = axi.write(daggen::POWER_OFF, daggen::POWER, true).await {
        error!(error = %e, "error powering down DAG generator during safety shutdown");
    }
    drop(axi);

    if status.left_cattrip || status.right_cattrip {
        error!(
            device = %shared.descriptor.unique_id,
            "HBM stack catastrophic temperature, powered off, refusing work"
        );
    } else {
        error!(
            device = %shared.descriptor.unique_id,
            "HBM calibration failed, refusing work"
        );
    }

    shared.dagging.store(true, Ordering::Relaxed);
    shared.kick();
}

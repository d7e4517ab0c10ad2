//! The nonce search loop.
//!
//! One call programs the hashcore with a work package, starts it in
//! interrupt mode, and harvests candidate nonces until new work arrives,
//! shutdown is requested, or the stall watchdog trips. Candidates come in
//! over the interrupt path while the AXI lock is released, so telemetry and
//! kicks interleave freely with a running search.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::miner::{read_or_default, stop_hashcore, MinerShared};
use crate::regs::{ethcore, IRQ_NONCE};
use crate::transport::{Axi, AxiResult, InterruptWait};
use crate::tuner::IntensitySettings;
use crate::work::{Solution, SolutionSink, WorkPackage};

/// Floor under the programmed boundary. Pool boundaries below this are
/// quietly raised: the hashcore reports every candidate under the
/// programmed target, and an unbounded target would flood the interrupt
/// path. The farm re-checks candidates against the true boundary.
const BOUNDARY_FLOOR: [u8; 32] = [
    0x00, 0x00, 0x00, 0x1F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF,
];

/// Search one work package until it is superseded. Returns an error only
/// when the transport fails while programming the core; in-loop failures
/// degrade to logged defaults as usual.
pub(crate) async fn run<A: Axi>(
    shared: &MinerShared<A>,
    w: &WorkPackage,
    solutions: &dyn SolutionSink,
) -> AxiResult<()> {
    use std::sync::atomic::Ordering;

    shared.new_work.store(false, Ordering::Relaxed);

    let mut axi = shared.axi.lock().await;

    if let Err(e) = axi.write_bulk(&w.header, ethcore::HEADER, true).await {
        warn!(error = %e, "failed setting ethcore header");
    }
    let boundary = effective_boundary(&w.boundary);
    if let Err(e) = axi.write_bulk(&boundary, ethcore::BOUNDARY, true).await {
        warn!(error = %e, "failed setting ethcore target");
    }
    axi.write((w.start_nonce >> 32) as u32, ethcore::NONCE_START_HI, false).await?;
    axi.write(w.start_nonce as u32, ethcore::NONCE_START_LO, false).await?;

    // A completed tune overrides the configured triple.
    if let Some(tuned) = shared.tuner.intensity() {
        shared.settings.set_intensity(tuned);
    }
    let flags = core_flags(shared.settings.intensity());
    if let Err(e) = axi.write(flags, ethcore::FLAGS, false).await {
        error!(error = %e, "failed setting ethcore flags");
        shared.die_on_error("core flags");
    }

    axi.write(ethcore::CTRL_START_IRQ, ethcore::CTRL, false).await?;

    let skip_stall = shared.settings.skip_stall_detection;
    let wait_for = Duration::from_millis(shared.settings.work_delay_us / 1000);
    let mut last_stall_count = 0u32;
    let mut last_target_checks = 0u64;

    loop {
        if shared.new_work.load(Ordering::Relaxed) {
            shared.new_work.store(false, Ordering::Relaxed);
            break;
        }
        if shared.shutdown.is_cancelled() {
            break;
        }

        // The interrupt wait runs without the AXI lock so telemetry and
        // kicks can interleave.
        drop(axi);
        let wait = shared.irq.wait_for_interrupt(IRQ_NONCE, wait_for).await;
        axi = shared.axi.lock().await;

        let candidate = match wait {
            Ok(InterruptWait::Data(nonce)) => Some(nonce),
            Ok(InterruptWait::TimedOut) => None,
            Err(e) => {
                error!(error = %e, "FPGA interrupt error");
                shared.die_on_error("interrupt wait");
                None
            }
        };

        let stall_count = if skip_stall {
            0
        } else {
            read_or_default(&*axi, ethcore::STALL, 0, "hashcore stall counter").await
        };
        let check_lo = read_or_default(&*axi, ethcore::TCHECK_LO, 0, "target check counter").await;
        let check_hi = read_or_default(&*axi, ethcore::TCHECK_HI, 0, "target check counter").await;
        let (target_checks, delta) = advance_target_checks(last_target_checks, check_lo, check_hi);
        last_target_checks = target_checks;

        let should_reset = !skip_stall && stall_count == last_stall_count;
        last_stall_count = stall_count;

        if let Some(nonce) = candidate {
            info!(
                device = %shared.descriptor.unique_id,
                job = format_args!("{:02x}{:02x}{:02x}{:02x}…", w.header[0], w.header[1], w.header[2], w.header[3]),
                nonce = format_args!("{nonce:#018x}"),
                "solution found"
            );
            solutions.submit(Solution {
                nonce,
                mix_hash: [0u8; 32],
                work: w.clone(),
                found_at: Instant::now(),
                miner_index: shared.index,
            });
        }

        shared
            .stats
            .lock()
            .record(delta, shared.tuner.hardware_error_rate());
        shared.tuner.observe(delta);

        if should_reset {
            warn!(device = %shared.descriptor.unique_id, "hashcore stalled, resetting core");
            break;
        }
    }

    if let Err(e) = stop_hashcore(&*axi, true).await {
        warn!(error = %e, "error stopping hashcore");
    }
    Ok(())
}

/// The boundary actually programmed: the pool's, floored at the sentinel.
fn effective_boundary(boundary: &[u8; 32]) -> [u8; 32] {
    if *boundary > BOUNDARY_FLOOR {
        *boundary
    } else {
        BOUNDARY_FLOOR
    }
}

/// Build the core flags word from the intensity triple.
///
/// Layout: bit 0 enables intensity with the numerator in [31:24] and
/// `denominator*8 - 1` in [21:16]; bit 6 enables patience with its value in
/// [15:8].
fn core_flags(intensity: IntensitySettings) -> u32 {
    let mut flags = 0u32;
    if intensity.patience != 0 {
        flags |= (1 << 6) | (u32::from(intensity.patience) << 8);
    }
    if intensity.intensity_n != 0 {
        flags |= (1 << 0) | (u32::from(intensity.intensity_n) << 24);
        flags |= ((u32::from(intensity.intensity_d & 0x3F) * 8).wrapping_sub(1) & 0x3F) << 16;
    }
    flags
}

/// Merge the hardware's split target-check counter into a monotonic 64-bit
/// count. The low word wraps long before the high word latches, so a value
/// below the previous sample means a rollover the high half has not caught
/// up with yet. Returns the merged counter and the delta since `last`; an
/// all-zero readout (core in reset) contributes no delta.
fn advance_target_checks(last: u64, lo: u32, hi: u32) -> (u64, u64) {
    let mut merged = (u64::from(hi) << 32) + u64::from(lo);
    if lo == 0 && hi == 0 {
        return (merged, 0);
    }
    if merged < last {
        merged = ((u64::from(hi) + 1) << 32) + u64::from(lo);
    }
    (merged, merged - last)
}

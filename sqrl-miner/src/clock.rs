//! Core clock control through the bitstream's PLL reconfiguration port.
//!
//! The hashcore clock comes out of a fractional PLL: a VCO running at
//! `200 MHz × (mult + frac) / gdiv`, divided down by the clk0 output
//! divider. Retargeting only ever touches the divider, rounded up to the
//! PLL's 1/8 step so the result never overshoots the request.
//!
//! A divider relock resets part of the fabric and clobbers the Ethash
//! parameter registers, so any change snapshots nItems, rnItems, and the
//! DAG-gen power gate first and restores them after the PLL reports lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::regs::{daggen, ethcore, pll};
use crate::transport::{Axi, AxiResult};

/// Iterations of the lock-status poll before giving up.
const RELOCK_POLL_LIMIT: u32 = 1000;

/// Requested clock operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockChange {
    /// Read-only query of the current frequency.
    Query,
    /// Reset the PLL to the bitstream's stock configuration.
    Stock,
    /// Retarget the core clock to the given MHz.
    Target(u32),
}

/// Apply a clock change and return the resulting frequency in MHz.
///
/// `last_clk` is updated only when a target is actually programmed, so it
/// always reflects the most recently confirmed frequency. Decode failures
/// abort the change and return 0.0, matching the driver-wide policy of
/// substituting a safe default for failed reads.
pub async fn apply<A: Axi>(
    axi: &A,
    change: ClockChange,
    last_clk: &AtomicU32,
) -> AxiResult<f64> {
    let vco_word = match axi.read(pll::VCO).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "error checking current VCO, aborting clock change");
            return Ok(0.0);
        }
    };
    let mult = f64::from((vco_word >> 8) & 0xFF);
    let frac = f64::from((vco_word >> 16) & 0x3FF) / 1000.0;
    let gdiv = f64::from(vco_word & 0xF);
    if gdiv == 0.0 {
        warn!(vco_word, "implausible VCO configuration, aborting clock change");
        return Ok(0.0);
    }
    let vco = 200.0 * (mult + frac) / gdiv;

    let clk0_word = match axi.read(pll::CLK0).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "error checking current clock divider, aborting clock change");
            return Ok(0.0);
        }
    };
    let div = f64::from(clk0_word & 0xF) + f64::from((clk0_word >> 8) & 0x3FF) / 1000.0;
    if div == 0.0 {
        warn!(clk0_word, "implausible clock divider, aborting clock change");
        return Ok(0.0);
    }
    let mut current = vco / div;

    if change == ClockChange::Query {
        return Ok(current);
    }

    // A relock wipes these three; snapshot with logged-zero fallbacks.
    let n_items = read_or_zero(axi, ethcore::N_ITEMS).await;
    let rn_items = read_or_zero(axi, ethcore::RN_ITEMS).await;
    let daggen_power = read_or_zero(axi, daggen::POWER).await;
    axi.write(daggen::POWER_ON, daggen::POWER, true).await?;

    match change {
        // A zero target programs nothing; only the snapshot/restore runs.
        ClockChange::Target(0) => {}
        ClockChange::Target(mhz) => {
            // +1 absorbs the UI convention of asking for e.g. 399 to get 400.
            let desired_div = ceil_to_eighth(vco / (f64::from(mhz) + 1.0));
            if desired_div < 2.0 {
                warn!(mhz, "core clock would exceed limit");
            } else {
                let new_div = (desired_div as u8 as u32)
                    | ((((desired_div - desired_div.floor()) * 1000.0) as u32) << 8);
                axi.write(vco_word, pll::VCO, true).await?;
                axi.write(new_div, pll::CLK0, true).await?;
                axi.write(0x7, pll::CTRL, true).await?;
                axi.write(0x3, pll::CTRL, true).await?;
                current = vco / desired_div;
                info!(mhz = current as u32, "setting core clock");
                last_clk.store(current as u32, Ordering::Relaxed);
            }
        }
        ClockChange::Stock => {
            info!("resetting core clock to stock");
            axi.write(0x5, pll::CTRL, true).await?;
            axi.write(0x1, pll::CTRL, true).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            axi.write(pll::RESET_MAGIC, pll::RESET, true).await?;
        }
        ClockChange::Query => unreachable!(),
    }

    let mut locked = false;
    for _ in 0..RELOCK_POLL_LIMIT {
        if axi.read(pll::LOCK).await.unwrap_or(0) & 1 == 1 {
            locked = true;
            break;
        }
    }
    if !locked {
        warn!("timed out waiting for clock change to re-lock");
    }

    axi.write(n_items, ethcore::N_ITEMS, true).await?;
    axi.write(rn_items, ethcore::RN_ITEMS, true).await?;
    axi.write(daggen_power, daggen::POWER, true).await?;

    Ok(current)
}

/// Round a divider up to the PLL's 1/8 granularity without going over the
/// requested frequency.
fn ceil_to_eighth(div: f64) -> f64 {
    ((div * 8.0 + 0.99) as i64) as f64 / 8.0
}

async fn read_or_zero<A: Axi>(axi: &A, addr: u32) -> u32 {
    match axi.read(addr).await {
        Ok(v) => v,
        Err(e) => {
            warn!(addr = format_args!("{addr:#x}"), error = %e, "fatal error preserving settings for clock change");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeAxi;

    /// VCO word: mult=6, frac=0, gdiv=1 → VCO 1200 MHz.
    const VCO_1200: u32 = (6 << 8) | 1;

    fn fake_with_pll() -> FakeAxi {
        let axi = FakeAxi::new();
        axi.seed(pll::VCO, VCO_1200)
            .seed(pll::CLK0, 4) // divider 4.0 → 300 MHz
            .seed(pll::LOCK, 1)
            .seed(ethcore::N_ITEMS, 0x0AAA)
            .seed(ethcore::RN_ITEMS, 0x0BBB)
            .seed(daggen::POWER, 0);
        axi
    }

    #[tokio::test]
    async fn query_decodes_without_writes() {
        let axi = fake_with_pll();
        let last_clk = AtomicU32::new(0);
        let mhz = apply(&axi, ClockChange::Query, &last_clk).await.expect("query");
        assert_eq!(mhz, 300.0);
        assert_eq!(axi.writes_to(pll::CTRL), Vec::<u32>::new());
        assert_eq!(last_clk.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn fractional_divider_decodes() {
        let axi = FakeAxi::new();
        // divider 2.5 → 1200 / 2.5 = 480 MHz
        axi.seed(pll::VCO, VCO_1200).seed(pll::CLK0, 2 | (500 << 8));
        let last_clk = AtomicU32::new(0);
        let mhz = apply(&axi, ClockChange::Query, &last_clk).await.expect("query");
        assert_eq!(mhz, 480.0);
    }

    #[tokio::test]
    async fn retarget_programs_divider_and_restores_mining_registers() {
        let axi = fake_with_pll();
        let last_clk = AtomicU32::new(0);

        // 1200 / (399+1) = 3.0, already on an eighth.
        let mhz = apply(&axi, ClockChange::Target(399), &last_clk).await.expect("set");
        assert_eq!(mhz, 400.0);
        assert_eq!(last_clk.load(Ordering::Relaxed), 400);

        assert_eq!(axi.writes_to(pll::CLK0), vec![3]);
        assert_eq!(axi.writes_to(pll::CTRL), vec![0x7, 0x3]);

        // The three relock-clobbered registers come back unchanged.
        assert_eq!(axi.reg(ethcore::N_ITEMS), 0x0AAA);
        assert_eq!(axi.reg(ethcore::RN_ITEMS), 0x0BBB);
        assert_eq!(axi.reg(daggen::POWER), 0);
    }

    #[tokio::test]
    async fn retarget_rejects_overclock_beyond_divider_floor() {
        let axi = fake_with_pll();
        let last_clk = AtomicU32::new(0);

        // 1200 / 701 ≈ 1.71 → divider below 2.0 is rejected.
        apply(&axi, ClockChange::Target(700), &last_clk).await.expect("set");
        assert_eq!(axi.writes_to(pll::CLK0), Vec::<u32>::new());
        assert_eq!(last_clk.load(Ordering::Relaxed), 0);

        // Snapshot/restore still ran.
        assert_eq!(axi.reg(ethcore::N_ITEMS), 0x0AAA);
    }

    #[tokio::test(start_paused = true)]
    async fn stock_reset_issues_strobe_sequence() {
        let axi = fake_with_pll();
        let last_clk = AtomicU32::new(0);
        apply(&axi, ClockChange::Stock, &last_clk).await.expect("reset");

        assert_eq!(axi.writes_to(pll::CTRL), vec![0x5, 0x1]);
        assert_eq!(axi.writes_to(pll::RESET), vec![pll::RESET_MAGIC]);
        assert_eq!(axi.reg(ethcore::RN_ITEMS), 0x0BBB);
    }

    #[test]
    fn eighth_rounding_lands_on_eighths() {
        assert_eq!(ceil_to_eighth(3.0), 3.0);
        assert_eq!(ceil_to_eighth(3.01), 3.125);
        assert_eq!(ceil_to_eighth(2.874), 2.875);
        assert_eq!(ceil_to_eighth(2.9), 3.0);
    }
}

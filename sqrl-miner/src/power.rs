//! VCCINT regulator control.
//!
//! SQRL boards ship with one of two regulator arrangements. FK boards carry
//! a wiper-style VRM: the driver picks a VID code from a resistor-network
//! voltage table and programs it through a small sequencer at 0x9xxx. JC
//! boards carry a PMBus-style PMIC behind an I²C bridge at 0xAxxx; the
//! driver fires multi-byte transactions (loop-compensation hot fix,
//! overvoltage fault limits, then VOUT_COMMAND) with a settle delay between
//! each. Both rails accept setpoints in millivolts, clamped to (500, 920];
//! a zero setpoint leaves the rail untouched.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::regs::{fk_vrm, jc_pmic};
use crate::transport::{Axi, AxiResult};

/// Accepted setpoint range, millivolts. The lower bound is exclusive: 500
/// itself is rejected.
const VOLT_LIMIT_LOW_MV: u32 = 500;
const VOLT_LIMIT_HIGH_MV: u32 = 920;

/// PMIC settle time between I²C transactions.
const PMIC_SETTLE: Duration = Duration::from_secs(1);

/// PMIC bus address shifted into write position.
const PMIC_WRITE: u8 = jc_pmic::ADDR << 1;

/// Map of all 256 wiper codes to regulator output volts.
///
/// Derived from the FK board's feedback network: R101 ∥ R29 on top, R30 in
/// parallel with the rheostat branch (R81 + 50Ω·VID/256) on the bottom,
/// reduced to `V(VID) = 0.6 + 2.661 / (20 − 2048/(VID + 153.6))`. Output is
/// strictly decreasing in VID.
pub struct VoltageTable {
    volts: [f64; 256],
}

impl VoltageTable {
    pub fn new() -> Self {
        let mut volts = [0.0; 256];
        for (vid, v) in volts.iter_mut().enumerate() {
            *v = 0.6 + 2.661 / (20.0 - 2048.0 / (vid as f64 + 153.6));
        }
        Self { volts }
    }

    /// Output voltage for a wiper code.
    pub fn lookup(&self, vid: u8) -> f64 {
        self.volts[vid as usize]
    }

    /// The VID whose stored voltage is the closest representable to the
    /// request. Requests outside the table's range clamp to the end codes;
    /// inside, a halving search walks the monotonic table from the middle.
    pub fn closest_vid(&self, volts: f64) -> u8 {
        if volts <= self.volts[0xFF] {
            return 0xFF;
        }
        if volts >= self.volts[0x00] {
            return 0x00;
        }

        let mut idx: u8 = 0x80;
        let mut half: u8 = 0x40;
        while half > 0 {
            let here = self.volts[idx as usize];
            if volts < here {
                idx += half;
            } else if volts > here {
                idx -= half;
            } else {
                return idx;
            }
            half >>= 1;
        }
        idx
    }
}

impl Default for VoltageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Program both rails. Either setpoint may be zero to leave that rail as-is.
pub async fn set_voltage<A: Axi>(
    axi: &A,
    table: &VoltageTable,
    fk_mv: u32,
    jc_mv: u32,
) -> AxiResult<()> {
    if fk_mv != 0 {
        if !setpoint_in_range(fk_mv) {
            warn!(
                mv = fk_mv,
                "asking to set fkVCCINT out of bounds! [{}-{}]", VOLT_LIMIT_LOW_MV, VOLT_LIMIT_HIGH_MV
            );
        } else {
            program_fk(axi, table, fk_mv).await?;
        }
    }
    if jc_mv != 0 {
        if !setpoint_in_range(jc_mv) {
            warn!(
                mv = jc_mv,
                "asking to set jcVCCINT out of bounds! [{}-{}]", VOLT_LIMIT_LOW_MV, VOLT_LIMIT_HIGH_MV
            );
        } else {
            program_jc(axi, jc_mv).await?;
        }
    }
    Ok(())
}

fn setpoint_in_range(mv: u32) -> bool {
    mv > VOLT_LIMIT_LOW_MV && mv <= VOLT_LIMIT_HIGH_MV
}

/// FK wiper sequence: soft-reset the sequencer, queue the three-byte wiper
/// setup, then start it.
async fn program_fk<A: Axi>(axi: &A, table: &VoltageTable, mv: u32) -> AxiResult<()> {
    let wiper = table.closest_vid(mv as f64 / 1000.0);
    let actual_mv = (table.lookup(wiper) * 1000.0) as u32;
    info!(
        requested_mv = mv,
        wiper,
        actual_mv,
        "instructing FK VRM, if present, to target setpoint"
    );

    axi.write(fk_vrm::SOFT_RESET_MAGIC, fk_vrm::SOFT_RESET, false).await?;
    axi.write(0x158, fk_vrm::TX_FIFO, false).await?;
    axi.write(0x00, fk_vrm::TX_FIFO, false).await?;
    axi.write(0x200 | u32::from(wiper), fk_vrm::TX_FIFO, false).await?;
    axi.write(fk_vrm::GO, fk_vrm::CONTROL, false).await
}

/// JC PMIC sequence: loop-compensation hot fix for the VCCBRAM and VCCINT
/// PID loops, OV_FAULT limits for both rails, then the VOUT_COMMAND
/// setpoint encoded as 1/256 V steps.
async fn program_jc<A: Axi>(axi: &A, mv: u32) -> AxiResult<()> {
    debug!("applying JC PMIC loop hot fix");
    pmic_transaction(
        axi,
        &[
            // SinglePage write, CMD 0x22: VCCBRAM loop PID parameters
            &[PMIC_WRITE, 0xD0, 0x04, 0x22, 0x08, 0x1C, 0x5C],
            // SinglePage write, CMD 0x24: VCCINT loop PID parameters
            &[PMIC_WRITE, 0xD0, 0x04, 0x24, 0x08, 0x22, 0x2C],
        ],
    )
    .await?;
    tokio::time::sleep(PMIC_SETTLE).await;

    // VCCBRAM OV_FAULT limit
    pmic_transaction(axi, &[&[PMIC_WRITE, 0xD0, 0x04, 0xAA, 0x0A, 0xF3, 0xE0]]).await?;
    tokio::time::sleep(PMIC_SETTLE).await;

    // VCCINT OV_FAULT limit
    pmic_transaction(axi, &[&[PMIC_WRITE, 0xD0, 0x04, 0xAA, 0x06, 0xF3, 0xE0]]).await?;

    info!(mv, "asking JC VRM, if present, to target setpoint");
    tokio::time::sleep(PMIC_SETTLE).await;

    let v_enc = ((mv as f64 / 1000.0) * 256.0).round() as u16;
    pmic_transaction(
        axi,
        &[&[
            PMIC_WRITE,
            0xD0,
            0x04,
            0x21 << 1,
            0x06, // VOUT_COMMAND
            (v_enc & 0xFF) as u8,
            (v_enc >> 8) as u8,
        ]],
    )
    .await
}

/// Queue one or more I²C messages into the bridge's TX FIFO and fire the
/// transaction. The first byte of each message carries the start marker, the
/// last the stop marker.
async fn pmic_transaction<A: Axi>(axi: &A, messages: &[&[u8]]) -> AxiResult<()> {
    axi.write(jc_pmic::SOFT_RESET_MAGIC, jc_pmic::SOFT_RESET, false).await?;
    for message in messages {
        for (i, byte) in message.iter().enumerate() {
            let mut word = u32::from(*byte);
            if i == 0 {
                word |= jc_pmic::FLAG_START;
            }
            if i == message.len() - 1 {
                word |= jc_pmic::FLAG_STOP;
            }
            axi.write(word, jc_pmic::TX_FIFO, false).await?;
        }
    }
    axi.write(jc_pmic::GO, jc_pmic::CONTROL, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeAxi;

    #[test]
    fn table_is_bounded_and_strictly_decreasing() {
        let table = VoltageTable::new();
        for vid in 0..=255u16 {
            let v = table.lookup(vid as u8);
            assert!(v > 0.7 && v < 1.0, "VID {vid} out of range: {v}");
        }
        for vid in 1..=255u16 {
            assert!(
                table.lookup(vid as u8) < table.lookup((vid - 1) as u8),
                "table not strictly decreasing at VID {vid}"
            );
        }
    }

    #[test]
    fn closest_vid_finds_every_representable_voltage() {
        let table = VoltageTable::new();
        for vid in 0..=255u16 {
            let vid = vid as u8;
            assert_eq!(table.closest_vid(table.lookup(vid)), vid);
        }
    }

    #[test]
    fn closest_vid_clamps_at_table_edges() {
        let table = VoltageTable::new();
        assert_eq!(table.closest_vid(table.lookup(0xFF)), 0xFF);
        assert_eq!(table.closest_vid(table.lookup(0x00)), 0x00);
        assert_eq!(table.closest_vid(0.0), 0xFF);
        assert_eq!(table.closest_vid(5.0), 0x00);
    }

    #[test]
    fn closest_vid_tie_breaks_to_lower_vid() {
        let table = VoltageTable::new();
        // Midway between two adjacent entries the halving search lands on
        // first, the lower VID (higher voltage) wins.
        let midpoint = (table.lookup(129) + table.lookup(130)) / 2.0;
        assert_eq!(table.closest_vid(midpoint), 129);
    }

    #[tokio::test]
    async fn out_of_bounds_setpoints_touch_no_registers() {
        let axi = FakeAxi::new();
        let table = VoltageTable::new();
        set_voltage(&axi, &table, 499, 1000).await.expect("set_voltage");
        assert!(!axi.wrote_in_range(0x9000, 0x9FFF));
        assert!(!axi.wrote_in_range(0xA000, 0xAFFF));
    }

    #[tokio::test]
    async fn lower_clamp_is_exclusive() {
        let axi = FakeAxi::new();
        let table = VoltageTable::new();
        set_voltage(&axi, &table, 500, 0).await.expect("set_voltage");
        assert!(!axi.wrote_in_range(0x9000, 0x9FFF));

        set_voltage(&axi, &table, 501, 0).await.expect("set_voltage");
        assert!(axi.wrote_in_range(0x9000, 0x9FFF));
    }

    #[tokio::test]
    async fn fk_sequence_programs_wiper() {
        let axi = FakeAxi::new();
        let table = VoltageTable::new();
        set_voltage(&axi, &table, 850, 0).await.expect("set_voltage");

        let wiper = table.closest_vid(0.850);
        assert_eq!(axi.writes_to(fk_vrm::SOFT_RESET), vec![0xA]);
        assert_eq!(
            axi.writes_to(fk_vrm::TX_FIFO),
            vec![0x158, 0x00, 0x200 | u32::from(wiper)]
        );
        assert_eq!(axi.writes_to(fk_vrm::CONTROL), vec![0x1]);
        assert!(!axi.wrote_in_range(0xA000, 0xAFFF));
    }

    #[tokio::test(start_paused = true)]
    async fn jc_sequence_ends_with_vout_command() {
        let axi = FakeAxi::new();
        let table = VoltageTable::new();
        set_voltage(&axi, &table, 0, 850).await.expect("set_voltage");

        // Four transactions fired, each preceded by a soft reset.
        assert_eq!(axi.writes_to(jc_pmic::SOFT_RESET).len(), 4);
        assert_eq!(axi.writes_to(jc_pmic::CONTROL), vec![0x1; 4]);

        // Final FIFO bytes carry VOUT_COMMAND with the encoded setpoint:
        // 0.850 V * 256 ≈ 218.
        let fifo = axi.writes_to(jc_pmic::TX_FIFO);
        let v_enc = 218u32;
        assert_eq!(
            &fifo[fifo.len() - 7..],
            &[
                0x100 | u32::from(PMIC_WRITE),
                0xD0,
                0x04,
                0x42,
                0x06,
                v_enc & 0xFF,
                0x200 | (v_enc >> 8),
            ]
        );
        assert!(!axi.wrote_in_range(0x9000, 0x9FFF));
    }
}

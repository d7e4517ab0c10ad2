//! Register map of the SQRL Ethash bitstream.
//!
//! Single symbolic table consumed by both the driver and its tests. All
//! registers are 32-bit unless a bulk or CDMA transfer is called out at the
//! use site. Grouped by hardware block.

/// Identity block: device magic, bitstream version, device DNA.
pub mod ident {
    /// Device-type magic, four ASCII bytes (e.g. "JCM2").
    pub const DEVICE_MAGIC: u32 = 0x0000;
    /// Bitstream version word.
    pub const BITSTREAM: u32 = 0x0008;
    /// Device DNA, low word.
    pub const DNA_LO: u32 = 0x1000;
    /// Device DNA, middle word.
    pub const DNA_MID: u32 = 0x1008;
    /// Device DNA, high word.
    pub const DNA_HI: u32 = 0x7000;
}

/// System monitor: die temperature and core voltage, raw 16-bit samples in
/// the low half of each word.
pub mod sysmon {
    pub const TEMP_RAW: u32 = 0x3400;
    pub const VOLT_RAW: u32 = 0x3404;
}

/// On-device DAG generator.
pub mod daggen {
    /// Control/status. Write 0x1 to start, 0x2 to halt; bit 1 reads as done.
    pub const CTRL: u32 = 0x4000;
    pub const CTRL_START: u32 = 0x1;
    pub const CTRL_HALT: u32 = 0x2;
    pub const STATUS_DONE: u32 = 0x2;

    /// num_parent_nodes on write; DAG item progress on read.
    pub const PARENT_NODES: u32 = 0x4008;

    /// Mixer `i` DAG-item range: start at `MIXER_START + 8*i`, end at
    /// `MIXER_END + 8*i`.
    pub const MIXER_START: u32 = 0x400C;
    pub const MIXER_END: u32 = 0x4010;

    /// Persisted epoch tag: bit 31 = valid, low 16 bits = epoch number.
    pub const EPOCH_TAG: u32 = 0x40B8;
    pub const EPOCH_TAG_VALID: u32 = 1 << 31;

    /// Light-cache build control/status. Write 0x2 to reset, 0x1 to start;
    /// bit 1 reads as done.
    pub const CACHE_CTRL: u32 = 0x40BC;
    pub const CACHE_RESET: u32 = 0x2;
    pub const CACHE_START: u32 = 0x1;
    pub const CACHE_DONE: u32 = 0x2;

    /// Cache seed, 32 bytes, byte-swapped bulk write.
    pub const CACHE_SEED: u32 = 0x40C0;

    /// Power gate for the whole generator block. 0xFFFFFFFF = on, 0 = off;
    /// 0xFFFFFFFD pulses the generator reset while powered.
    pub const POWER: u32 = 0xB000;
    pub const POWER_ON: u32 = 0xFFFF_FFFF;
    pub const POWER_RESET: u32 = 0xFFFF_FFFD;
    pub const POWER_OFF: u32 = 0x0;
}

/// Ethash hashcore.
pub mod ethcore {
    /// Block header, 32 bytes, byte-swapped bulk write.
    pub const HEADER: u32 = 0x5000;
    /// Boundary/target, 32 bytes, byte-swapped bulk write.
    pub const BOUNDARY: u32 = 0x5020;
    /// DAG item count (dagSize / 128).
    pub const N_ITEMS: u32 = 0x5040;
    /// Target-check counter, high word.
    pub const TCHECK_HI: u32 = 0x5044;
    /// Target-check counter, low word (wraps).
    pub const TCHECK_LO: u32 = 0x5048;
    pub const NONCE_START_LO: u32 = 0x5064;
    pub const NONCE_START_HI: u32 = 0x5068;
    /// Core control: `CTRL_START_IRQ` starts with interrupt delivery,
    /// `CTRL_CLEAR_NONCE` acknowledges polled nonces, 0 holds in reset.
    pub const CTRL: u32 = 0x506C;
    pub const CTRL_START_IRQ: u32 = 0x0001_0001;
    pub const CTRL_RESET: u32 = 0x0;
    /// Flags word: intensity and patience fields, see `search::core_flags`.
    pub const FLAGS: u32 = 0x5080;
    /// Liveness counter; unchanged across samples means the core is stuck.
    pub const STALL: u32 = 0x5084;
    /// Fixed-point reciprocal of N_ITEMS.
    pub const RN_ITEMS: u32 = 0x5088;
}

/// HBM stack status word.
pub mod hbm {
    pub const STATUS: u32 = 0x7008;
    pub const LEFT_CALIBRATED: u32 = 1 << 0;
    pub const RIGHT_CALIBRATED: u32 = 1 << 1;
    pub const LEFT_CATTRIP: u32 = 1 << 2;
    pub const RIGHT_CATTRIP: u32 = 1 << 10;
    /// Value assumed when the read fails, to avoid cascading a transport
    /// error into a spurious safety shutdown.
    pub const STATUS_FALLBACK: u32 = 0x3;
}

/// Core clock PLL.
pub mod pll {
    /// Stock-reset strobe.
    pub const RESET: u32 = 0x8000;
    pub const RESET_MAGIC: u32 = 0xA;
    /// Lock status, bit 0.
    pub const LOCK: u32 = 0x8004;
    /// VCO configuration: multiplier, fraction, global divider.
    pub const VCO: u32 = 0x8200;
    /// clk0 output divider: integer low nibble, thousandths in [17:8].
    pub const CLK0: u32 = 0x8208;
    /// Reconfiguration strobe register.
    pub const CTRL: u32 = 0x825C;
}

/// FK-board VRM: wiper-style regulator behind a small sequencer.
pub mod fk_vrm {
    pub const SOFT_RESET: u32 = 0x9040;
    pub const SOFT_RESET_MAGIC: u32 = 0xA;
    pub const TX_FIFO: u32 = 0x9108;
    pub const CONTROL: u32 = 0x9100;
    pub const GO: u32 = 0x1;
}

/// JC-board PMIC behind an I²C bridge. Bytes pushed to the TX FIFO carry a
/// start marker (0x100) on the first byte of a message and a stop marker
/// (0x200) on the last; writing 1 to CONTROL fires the queued transaction.
pub mod jc_pmic {
    pub const SOFT_RESET: u32 = 0xA040;
    pub const SOFT_RESET_MAGIC: u32 = 0xA;
    pub const TX_FIFO: u32 = 0xA108;
    pub const CONTROL: u32 = 0xA100;
    pub const GO: u32 = 0x1;
    pub const FLAG_START: u32 = 0x100;
    pub const FLAG_STOP: u32 = 0x200;
    /// 7-bit PMIC bus address.
    pub const ADDR: u8 = 0x4D;
}

/// Interrupt mask bit delivering candidate nonces.
pub const IRQ_NONCE: u32 = 1 << 0;

//! AXI transport abstraction.
//!
//! The driver talks to the board exclusively through the [`Axi`] trait:
//! 32-bit register reads and writes, bulk writes with optional byte-swap,
//! CDMA block moves, and the interrupt path. The production implementation
//! is the TCP bridge client in [`tcp`]; tests script a fake.
//!
//! Locking contract: register, bulk, and CDMA operations are issued only
//! while the caller holds the miner's AXI lock. The interrupt operations
//! (`wait_for_interrupt`, `kick_interrupts`) are the exception — they run on
//! a separate path so a kick can interrupt a wait while another task holds
//! the lock.

pub mod tcp;

#[cfg(test)]
pub mod fake;

use std::io;
use std::time::Duration;

use async_trait::async_trait;

/// Transport failure. The driver treats every kind the same way (log,
/// substitute a safe default, optionally die), so the variants exist for
/// diagnostics only.
#[derive(Debug, thiserror::Error)]
pub enum AxiError {
    #[error("bridge I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bridge request timed out")]
    Timeout,

    #[error("bridge connection closed")]
    Closed,

    #[error("bridge protocol violation: {0}")]
    Protocol(String),

    #[error("device rejected request (status {0:#x})")]
    Device(u8),
}

pub type AxiResult<T> = Result<T, AxiError>;

/// Outcome of an interrupt wait. A timeout is an expected outcome, not a
/// transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptWait {
    /// An interrupt matching the mask fired; carries its 64-bit payload.
    Data(u64),
    /// No matching interrupt within the timeout (or the wait was kicked).
    TimedOut,
}

/// Register-level transport to one board.
///
/// Implementations are cheap-to-clone handles onto a shared connection; the
/// miner keeps one clone inside its AXI lock for register traffic and one
/// outside it for the interrupt path.
#[async_trait]
pub trait Axi: Clone + Send + Sync + 'static {
    /// Read a 32-bit register.
    async fn read(&self, addr: u32) -> AxiResult<u32>;

    /// Write a 32-bit register. `confirmed` waits for the device to
    /// acknowledge completion; posted writes return once queued.
    async fn write(&self, value: u32, addr: u32, confirmed: bool) -> AxiResult<()>;

    /// Write a byte buffer to consecutive registers, optionally swapping
    /// byte order per 32-bit word on the device side.
    async fn write_bulk(&self, data: &[u8], addr: u32, swap: bool) -> AxiResult<()>;

    /// On-board CDMA copy of `len` bytes from `src` to `dst`.
    async fn cdma_copy(&self, src: u64, dst: u64, len: u64) -> AxiResult<()>;

    /// CDMA write of host bytes into board memory at `addr`.
    async fn cdma_write(&self, data: &[u8], addr: u64) -> AxiResult<()>;

    /// Arm interrupt delivery for the given mask.
    async fn enable_interrupts(&self, mask: u32) -> AxiResult<()>;

    /// Wait for an interrupt matching `mask`, up to `timeout`.
    async fn wait_for_interrupt(&self, mask: u32, timeout: Duration) -> AxiResult<InterruptWait>;

    /// Make any outstanding `wait_for_interrupt` return `TimedOut` now.
    fn kick_interrupts(&self);

    /// Set the per-request timeout for subsequent register operations.
    fn set_timeout(&self, timeout: Duration);
}

//! Scripted in-memory transport for driver tests.
//!
//! Registers live in a map seeded by the test; every operation is recorded
//! in a transcript so tests can assert on exact write sequences and
//! ordering. Interrupt waits pop scripted outcomes and fall back to
//! `TimedOut` when the script runs dry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Axi, AxiError, AxiResult, InterruptWait};

/// One recorded transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Read(u32),
    Write { addr: u32, value: u32 },
    Bulk { addr: u32, data: Vec<u8>, swap: bool },
    CdmaCopy { src: u64, dst: u64, len: u64 },
    CdmaWrite { addr: u64, len: usize },
    IrqEnable(u32),
    IrqWait(u32),
}

#[derive(Default)]
struct State {
    regs: HashMap<u32, u32>,
    failing_reads: HashSet<u32>,
    scripted_reads: HashMap<u32, VecDeque<u32>>,
    cdma_write_failures: usize,
    interrupts: VecDeque<AxiResult<InterruptWait>>,
    ops: Vec<Op>,
}

/// Cloneable handle onto shared fake state.
#[derive(Clone, Default)]
pub struct FakeAxi {
    state: Arc<Mutex<State>>,
}

impl FakeAxi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a register value.
    pub fn seed(&self, addr: u32, value: u32) -> &Self {
        self.state.lock().regs.insert(addr, value);
        self
    }

    /// Make reads of `addr` fail with a transport error.
    pub fn fail_reads_of(&self, addr: u32) -> &Self {
        self.state.lock().failing_reads.insert(addr);
        self
    }

    /// Queue a one-shot read result for `addr`, consumed before the
    /// register map. Lets a test script status-poll progressions that
    /// plain writes-become-reads state cannot express.
    pub fn script_read(&self, addr: u32, value: u32) -> &Self {
        self.state
            .lock()
            .scripted_reads
            .entry(addr)
            .or_default()
            .push_back(value);
        self
    }

    /// Make the next `count` CDMA writes fail.
    pub fn fail_next_cdma_writes(&self, count: usize) -> &Self {
        self.state.lock().cdma_write_failures = count;
        self
    }

    /// Script the next interrupt-wait outcome.
    pub fn script_interrupt(&self, outcome: InterruptWait) -> &Self {
        self.state.lock().interrupts.push_back(Ok(outcome));
        self
    }

    /// Script the next interrupt wait to fail with a transport error.
    pub fn script_interrupt_error(&self) -> &Self {
        self.state.lock().interrupts.push_back(Err(AxiError::Closed));
        self
    }

    /// Current value of a register (0 if never seeded or written).
    pub fn reg(&self, addr: u32) -> u32 {
        self.state.lock().regs.get(&addr).copied().unwrap_or(0)
    }

    /// Full transcript of operations so far.
    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    /// All 32-bit values written to `addr`, in order.
    pub fn writes_to(&self, addr: u32) -> Vec<u32> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Write { addr: a, value } if *a == addr => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Whether any write (32-bit or bulk) touched the address range.
    pub fn wrote_in_range(&self, lo: u32, hi: u32) -> bool {
        self.state.lock().ops.iter().any(|op| match op {
            Op::Write { addr, .. } => (lo..=hi).contains(addr),
            Op::Bulk { addr, .. } => (lo..=hi).contains(addr),
            _ => false,
        })
    }

    /// All CDMA copies, in order.
    pub fn cdma_copies(&self) -> Vec<(u64, u64, u64)> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::CdmaCopy { src, dst, len } => Some((*src, *dst, *len)),
                _ => None,
            })
            .collect()
    }

    /// Index of the first transcript entry matching `pred`, if any.
    pub fn position<F: Fn(&Op) -> bool>(&self, pred: F) -> Option<usize> {
        self.state.lock().ops.iter().position(|op| pred(op))
    }

    /// Number of recorded operations.
    pub fn op_count(&self) -> usize {
        self.state.lock().ops.len()
    }
}

#[async_trait]
impl Axi for FakeAxi {
    async fn read(&self, addr: u32) -> AxiResult<u32> {
        let mut s = self.state.lock();
        s.ops.push(Op::Read(addr));
        if s.failing_reads.contains(&addr) {
            return Err(AxiError::Timeout);
        }
        if let Some(queue) = s.scripted_reads.get_mut(&addr) {
            if let Some(value) = queue.pop_front() {
                return Ok(value);
            }
        }
        Ok(s.regs.get(&addr).copied().unwrap_or(0))
    }

    async fn write(&self, value: u32, addr: u32, _confirmed: bool) -> AxiResult<()> {
        let mut s = self.state.lock();
        s.ops.push(Op::Write { addr, value });
        s.regs.insert(addr, value);
        Ok(())
    }

    async fn write_bulk(&self, data: &[u8], addr: u32, swap: bool) -> AxiResult<()> {
        let mut s = self.state.lock();
        s.ops.push(Op::Bulk {
            addr,
            data: data.to_vec(),
            swap,
        });
        Ok(())
    }

    async fn cdma_copy(&self, src: u64, dst: u64, len: u64) -> AxiResult<()> {
        self.state.lock().ops.push(Op::CdmaCopy { src, dst, len });
        Ok(())
    }

    async fn cdma_write(&self, data: &[u8], addr: u64) -> AxiResult<()> {
        let mut s = self.state.lock();
        s.ops.push(Op::CdmaWrite {
            addr,
            len: data.len(),
        });
        if s.cdma_write_failures > 0 {
            s.cdma_write_failures -= 1;
            return Err(AxiError::Timeout);
        }
        Ok(())
    }

    async fn enable_interrupts(&self, mask: u32) -> AxiResult<()> {
        self.state.lock().ops.push(Op::IrqEnable(mask));
        Ok(())
    }

    async fn wait_for_interrupt(&self, mask: u32, _timeout: Duration) -> AxiResult<InterruptWait> {
        let mut s = self.state.lock();
        s.ops.push(Op::IrqWait(mask));
        s.interrupts
            .pop_front()
            .unwrap_or(Ok(InterruptWait::TimedOut))
    }

    fn kick_interrupts(&self) {}

    fn set_timeout(&self, _timeout: Duration) {}
}

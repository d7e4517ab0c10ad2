//! Work packages, solutions, and the farm-facing seams.
//!
//! The upstream dispatcher (a pool farm in production) pushes the latest
//! work package over a watch channel and receives solutions through the
//! [`SolutionSink`] seam. Epoch geometry comes from an [`EpochSource`] — the
//! light-cache builder lives outside this crate, the driver only needs the
//! sizes and seed it reports.
//!
//! A development [`DummySource`] emits a fixed package on an interval so a
//! board can be exercised without a farm attached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The only algorithm the hashcore implements.
pub const ALGO_ETHASH: &str = "ethash";

/// One unit of work from the farm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPackage {
    pub algo: String,
    pub epoch: u32,
    pub header: [u8; 32],
    pub boundary: [u8; 32],
    pub start_nonce: u64,
}

/// Per-epoch DAG geometry, produced by the external light-cache builder.
#[derive(Debug, Clone)]
pub struct EpochContext {
    pub epoch: u32,
    pub seed: [u8; 32],
    pub light_size: u64,
    pub dag_size: u64,
    /// Host-side light cache bytes; only present when the board cannot
    /// build the cache itself and the upload fallback is in use.
    pub light_cache: Option<Arc<Vec<u8>>>,
}

/// A candidate nonce harvested from the hashcore.
///
/// The FPGA does not return a mix hash; `mix_hash` is always zero and the
/// farm side must accept that from FPGA miners.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nonce: u64,
    pub mix_hash: [u8; 32],
    pub work: WorkPackage,
    pub found_at: Instant,
    pub miner_index: usize,
}

/// Where the driver reports solutions.
pub trait SolutionSink: Send + Sync + 'static {
    fn submit(&self, solution: Solution);
}

impl SolutionSink for mpsc::UnboundedSender<Solution> {
    fn submit(&self, solution: Solution) {
        // A closed sink means the farm is gone; the work loop will stop on
        // its own shortly.
        let _ = self.send(solution);
    }
}

/// Resolver from epoch number to DAG geometry.
pub trait EpochSource: Send + Sync + 'static {
    fn context(&self, epoch: u32) -> anyhow::Result<EpochContext>;
}

/// Latest-work channel: the farm keeps only the newest package.
pub type WorkSender = watch::Sender<Option<WorkPackage>>;
pub type WorkReceiver = watch::Receiver<Option<WorkPackage>>;

pub fn work_channel() -> (WorkSender, WorkReceiver) {
    watch::channel(None)
}

/// Development work source: emits a fixed Ethash package on an interval,
/// bumping the start nonce each round so the core re-covers fresh nonce
/// space. Pairs with a fixed epoch-0 geometry so a board can run a full
/// DAG cycle end to end.
pub struct DummySource {
    work_tx: WorkSender,
    interval: Duration,
    shutdown: CancellationToken,
}

/// Epoch-0 light cache size, bytes.
const EPOCH0_LIGHT_SIZE: u64 = 16_776_896;
/// Epoch-0 DAG size, bytes.
const EPOCH0_DAG_SIZE: u64 = 1_073_739_904;

impl DummySource {
    pub fn new(work_tx: WorkSender, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            work_tx,
            interval,
            shutdown,
        }
    }

    fn package(round: u64) -> WorkPackage {
        // An easy all-ones boundary so even a briefly-running core pops
        // candidates worth looking at in bring-up.
        WorkPackage {
            algo: ALGO_ETHASH.into(),
            epoch: 0,
            header: [0x11; 32],
            boundary: [0xFF; 32],
            start_nonce: round << 40,
        }
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "dummy work source starting");
        let mut round = 0u64;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    debug!(round, "emitting dummy work");
                    if self.work_tx.send(Some(Self::package(round))).is_err() {
                        break;
                    }
                    round += 1;
                }
                _ = self.shutdown.cancelled() => {
                    info!("dummy work source shutting down");
                    break;
                }
            }
        }
    }
}

/// Epoch geometry matching [`DummySource`]'s fixed epoch-0 work.
pub struct DummyEpochs;

impl EpochSource for DummyEpochs {
    fn context(&self, epoch: u32) -> anyhow::Result<EpochContext> {
        anyhow::ensure!(epoch == 0, "dummy source only carries epoch 0");
        Ok(EpochContext {
            epoch: 0,
            seed: [0u8; 32],
            light_size: EPOCH0_LIGHT_SIZE,
            dag_size: EPOCH0_DAG_SIZE,
            light_cache: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dummy_source_emits_and_advances_nonce_space() {
        let (tx, mut rx) = work_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(DummySource::new(tx, Duration::from_secs(30), shutdown.clone()).run());

        rx.changed().await.expect("first emit");
        let first = rx.borrow().clone().expect("package");
        assert_eq!(first.algo, ALGO_ETHASH);
        assert_eq!(first.epoch, 0);

        rx.changed().await.expect("second emit");
        let second = rx.borrow().clone().expect("package");
        assert!(second.start_nonce > first.start_nonce);

        shutdown.cancel();
    }

    #[test]
    fn dummy_epoch_geometry_is_dag_shaped() {
        let ctx = DummyEpochs.context(0).expect("epoch 0");
        // The DAG staging math depends on these dividing cleanly.
        assert_eq!(ctx.dag_size % 128, 0);
        assert_eq!(ctx.light_size % 64, 0);
        assert!(DummyEpochs.context(7).is_err());
    }
}

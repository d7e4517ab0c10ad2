//! Control-plane driver for SQRL TCP-attached Ethash FPGAs.
//!
//! The driver connects to a board's AXI bridge over TCP, stages the
//! per-epoch DAG on-device, programs the hashcore with work packages, and
//! harvests candidate nonces over the interrupt path. Around that core sit
//! clock and voltage control, thermal/HBM safety interlocks, hash-rate
//! statistics, and the auto-tuner surface.
//!
//! [`daemon::Daemon`] wires everything together for the `minerd` binary;
//! embedders can instead drive [`miner::Miner`] directly against any
//! [`transport::Axi`] implementation.

pub mod clock;
pub mod config;
pub mod daemon;
pub mod dag;
pub mod device;
pub mod endian;
pub mod logging;
pub mod miner;
pub mod power;
pub mod regs;
pub mod search;
pub mod stats;
pub mod telemetry;
pub mod transport;
pub mod tuner;
pub mod work;

//! Epoch initialization: staging the DAG on the board.
//!
//! For a new epoch the driver stops the hashcore, powers the on-device DAG
//! generator, and either adopts an already-staged DAG (the board persists
//! an epoch tag across reconnects) or rebuilds: light cache first, then the
//! mixer-parallel DAG fill, then a duplication pass that swizzles the 4 GiB
//! dataset into the access pattern the hashcore wants and mirrors it onto
//! the second HBM stack.
//!
//! Both polling loops release the AXI lock between samples so telemetry
//! keeps flowing during the minutes a rebuild takes.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::clock::{self, ClockChange};
use crate::endian::reverse32;
use crate::miner::{read_or_default, stop_hashcore, MinerShared};
use crate::regs::{daggen, ethcore};
use crate::transport::{Axi, AxiResult};
use crate::work::EpochContext;

/// Newer bitstreams build the light cache on-module; the host-upload path
/// remains for the older ones.
const MAKE_CACHE_ON_CHIP: bool = true;

const CACHE_POLL: Duration = Duration::from_millis(100);
const DAG_POLL: Duration = Duration::from_secs(1);

/// Host-upload chunk size, bytes.
const UPLOAD_CHUNK: usize = 65536;

/// Base address of the DAG mirror on the second HBM stack.
const MIRROR_BASE: u64 = 0x1_0000_0000;
/// One swizzle chunk: 16 MiB.
const SWIZZLE_CHUNK: u64 = 0x100_0000;
/// Full dataset size moved by the mirror copy.
const MIRROR_LEN: u64 = 4 * 1024 * 1024 * 1024;

/// Stage the DAG for `ctx`. Returns `Ok(false)` when the light-cache upload
/// fallback gives up; transport failures on the critical sequence surface
/// as errors and abort the epoch.
pub(crate) async fn initialize<A: Axi>(
    shared: &MinerShared<A>,
    ctx: &EpochContext,
) -> AxiResult<bool> {
    shared.dagging.store(true, Ordering::Relaxed);

    let mut axi = shared.axi.lock().await;

    // Stock clock before any core is stopped or reset.
    clock::apply(&*axi, ClockChange::Stock, &shared.last_clk).await?;

    info!(device = %shared.descriptor.unique_id, epoch = ctx.epoch, "changing epoch");
    if let Err(e) = stop_hashcore(&*axi, true).await {
        warn!(error = %e, "error stopping hashcore for epoch change");
    }

    axi.write(daggen::POWER_ON, daggen::POWER, true).await?;

    // Mining parameters are set even when the DAG survives: the core may
    // have been reset since they were last programmed.
    let n_items = (ctx.dag_size / 128) as u32;
    axi.write(n_items, ethcore::N_ITEMS, true).await?;
    let reciprocal = (1.0 / f64::from(n_items)) * 0x1000_0000_0000_0000u64 as f64;
    let rn_items = ((reciprocal as u64) >> 4) as u32;
    axi.write(rn_items, ethcore::RN_ITEMS, true).await?;

    let tag = read_or_default(&*axi, daggen::EPOCH_TAG, 0, "persisted DAG epoch").await;
    if tag & daggen::EPOCH_TAG_VALID != 0 && !shared.settings.force_dag {
        info!(epoch = tag & 0xFFFF, "board holds a DAG for a previous session");
        if tag & 0xFFFF == ctx.epoch {
            info!("no DAG generation needed");
            axi.write(daggen::POWER_OFF, daggen::POWER, true).await?;
            shared.dagging.store(false, Ordering::Relaxed);
            drop(axi);
            restore_clock(shared).await;
            shared.tuner.start(shared.last_clk.load(Ordering::Relaxed));
            return Ok(true);
        }
    }

    // Rebuilding: halt anything the generator was doing and pulse its reset.
    axi.write(daggen::CTRL_HALT, daggen::CTRL, true).await?;
    axi.write(daggen::POWER_RESET, daggen::POWER, true).await?;
    axi.write(daggen::POWER_ON, daggen::POWER, true).await?;

    // Generation is fastest at the bitstream default; only keep the target
    // clock if it is already below it.
    let current = clock::apply(&*axi, ClockChange::Query, &shared.last_clk).await?;
    let target = shared.last_clk.load(Ordering::Relaxed);
    if current < f64::from(target) {
        info!("resetting clock to bitstream default for DAG generation");
        clock::apply(&*axi, ClockChange::Stock, &shared.last_clk).await?;
    } else {
        clock::apply(&*axi, ClockChange::Target(target), &shared.last_clk).await?;
    }

    let parent_nodes = (ctx.light_size / 64) as u32;
    if MAKE_CACHE_ON_CHIP {
        info!("generating light cache");
        let started = Instant::now();
        axi.write(daggen::CACHE_RESET, daggen::CACHE_CTRL, true).await?;
        axi.write(parent_nodes, daggen::PARENT_NODES, true).await?;
        axi.write_bulk(&reverse32(&ctx.seed), daggen::CACHE_SEED, true).await?;
        axi.write(daggen::CACHE_START, daggen::CACHE_CTRL, true).await?;

        let mut status = 0u32;
        while status & daggen::CACHE_DONE == 0 {
            drop(axi);
            tokio::time::sleep(CACHE_POLL).await;
            axi = shared.axi.lock().await;
            match axi.read(daggen::CACHE_CTRL).await {
                Ok(s) => status = s,
                Err(e) => {
                    error!(error = %e, "error polling light cache build");
                    shared.die_on_error("light cache poll");
                }
            }
        }
        info!(
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "light cache generated"
        );
    } else {
        let Some(cache) = ctx.light_cache.as_deref() else {
            error!("no host light cache available for upload");
            shared.dagging.store(false, Ordering::Relaxed);
            return Ok(false);
        };
        if !upload_light_cache(&*axi, cache).await? {
            shared.dagging.store(false, Ordering::Relaxed);
            return Ok(false);
        }
    }

    info!(
        parent_nodes,
        mixers = shared.settings.dag_mixers,
        "preparing DAG generator parameters"
    );
    axi.write(parent_nodes, daggen::PARENT_NODES, true).await?;

    let mixers = shared.settings.dag_mixers;
    let dag_items = (ctx.dag_size / 64) as u32;
    let mixer_size = dag_items / mixers;
    let leftover = dag_items - mixer_size * mixers;
    debug!(mixer_size, leftover, "DAG items per mixer");

    let mut dag_pos = 0u32;
    for i in 0..mixers {
        let mut mixer_end = dag_pos + mixer_size;
        if i == 0 {
            mixer_end += leftover;
        }
        axi.write(dag_pos, daggen::MIXER_START + 8 * i, true).await?;
        axi.write(mixer_end, daggen::MIXER_END + 8 * i, true).await?;
        dag_pos = mixer_end;
    }

    info!("generating DAG");
    let started = Instant::now();
    axi.write(daggen::CTRL_START, daggen::CTRL, true).await?;
    let mut status = read_or_default(&*axi, daggen::CTRL, 0, "DAG status").await;

    if shared.settings.skip_dag {
        warn!("skipping DAG wait, expect failed hashes");
    } else {
        let mut polls = 0u32;
        while status & daggen::STATUS_DONE == 0 {
            drop(axi);
            tokio::time::sleep(DAG_POLL).await;
            axi = shared.axi.lock().await;
            match axi.read(daggen::CTRL).await {
                Ok(s) => status = s,
                Err(e) => {
                    error!(error = %e, "error polling DAG generation");
                    shared.die_on_error("DAG poll");
                }
            }
            polls += 1;
            if polls % 5 == 0 {
                let progress = read_or_default(&*axi, daggen::PARENT_NODES, 0, "DAG progress").await;
                let percent = f64::from(progress) / f64::from(mixer_size + leftover) * 100.0;
                info!("DAG {percent:.2}%");
            }
        }
    }
    info!(
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "DAG data generated"
    );

    // Duplication swizzle: 16 MiB chunks move from the mirror stack back to
    // stack 0 with their chunk index nibble-swapped, then the whole dataset
    // is copied back over the mirror.
    info!("duplicating DAG items for performance");
    let started = Instant::now();
    let mut swizzle_ok = true;
    for i in 0..256u64 {
        let src = MIRROR_BASE | (i << 24);
        let dst = (((i & 0x0F) << 4) | ((i & 0xF0) >> 4)) << 24;
        if let Err(e) = axi.cdma_copy(src, dst, SWIZZLE_CHUNK).await {
            error!(error = %e, chunk = i, "failed to swizzle DAG");
            swizzle_ok = false;
            break;
        }
    }
    if swizzle_ok {
        if let Err(e) = axi.cdma_copy(0, MIRROR_BASE, MIRROR_LEN).await {
            error!(error = %e, "failed to mirror DAG");
        }
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "DAG duplication done");

    // Persist the tag so the next epoch change can skip all of this.
    axi.write(daggen::EPOCH_TAG_VALID | ctx.epoch, daggen::EPOCH_TAG, true).await?;
    shared.dagging.store(false, Ordering::Relaxed);

    info!("putting DAG generator in low power mode");
    axi.write(daggen::POWER_OFF, daggen::POWER, true).await?;

    let target = shared.last_clk.load(Ordering::Relaxed);
    if target != 0 {
        info!(mhz = target, "restoring clock target");
        clock::apply(&*axi, ClockChange::Target(target), &shared.last_clk).await?;
    }
    drop(axi);

    shared.tuner.start(shared.last_clk.load(Ordering::Relaxed));
    Ok(true)
}

async fn restore_clock<A: Axi>(shared: &MinerShared<A>) {
    let target = shared.last_clk.load(Ordering::Relaxed);
    if target == 0 {
        return;
    }
    let axi = shared.axi.lock().await;
    if let Err(e) = clock::apply(&*axi, ClockChange::Target(target), &shared.last_clk).await {
        warn!(error = %e, "error restoring clock after epoch change");
    }
}

/// Push the host-built light cache into board memory in small CDMA chunks.
/// Each chunk gets one retry; a second failure abandons the epoch.
async fn upload_light_cache<A: Axi>(axi: &A, cache: &[u8]) -> AxiResult<bool> {
    info!(bytes = cache.len(), "uploading light cache, this may take some time");
    let started = Instant::now();
    for (step, chunk) in cache.chunks(UPLOAD_CHUNK).enumerate() {
        let pos = (step * UPLOAD_CHUNK) as u64;
        if axi.cdma_write(chunk, pos).await.is_err() {
            warn!(pos, "upload packet error, retrying");
            if let Err(e) = axi.cdma_write(chunk, pos).await {
                error!(pos, error = %e, "cache upload failed");
                return Ok(false);
            }
        }
        if step % 100 == 0 {
            let percent = (pos + chunk.len() as u64) as f64 / cache.len() as f64 * 100.0;
            debug!("cache upload {percent:.1}%");
        }
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "cache uploaded");
    Ok(true)
}

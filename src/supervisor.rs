/*
 *  Copyright (C) 2025 Pierre Contributors
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Owns every subsystem and the handles between them. SIGINT requests a
//! graceful teardown, SIGHUP is ignored. A watchdog verifies the pipeline
//! keeps moving while a sender plays; persistent stalls are not self-healed
//! but end the process with a non-zero code so a process supervisor can
//! restart it.

use crate::{
    anchor::Anchor,
    clock::{self, MasterClock},
    config::Config,
    error::{SupervisorError, SupervisorResult},
    racked::Racked,
    render::{RenderLoop, run_desk_writer},
    rtsp::SessionCore,
    stats::Stats,
};
use std::sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}};
use tokio::{select, sync::mpsc, time::{Duration, interval}};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

const WATCHDOG_PERIOD: Duration = Duration::from_secs(2);
const WATCHDOG_STALL_MAX: u32 = 5;

/// Wire up and start every subsystem under `subsys`. Teardown cascades in
/// reverse: RTSP sessions and their net servers first, then render, then
/// the passive state, the clock mapping last.
#[instrument(skip(subsys, config))]
pub async fn start(subsys: &SubsystemHandle, config: Config) -> SupervisorResult<()> {
    info!(
        "Starting {} '{}' as {}",
        config.app.name, config.app.instance.name, config.app.device_id
    );

    let stats = Stats::new();
    let anchor = Arc::new(Anchor::new());
    let racked = Arc::new(Mutex::new(Racked::new(stats.clone())));
    let playing = Arc::new(AtomicBool::new(false));
    let dsp = Arc::new(crate::frame::dsp::DspPool::new(
        config.dsp.concurrency_factor,
        config.dsp.window,
        stats.clone(),
    ));

    let (peers_tx, peers_rx) = mpsc::channel(16);
    let clock = Arc::new(MasterClock::new(config.shm_name(), peers_tx));
    {
        let shm_name = config.shm_name();
        let ctrl_port = config.clock.ctrl_port;
        subsys.start(SubsystemBuilder::new("clock-peers", move |s| {
            clock::run_peer_updater(s, shm_name, ctrl_port, peers_rx)
        }));
    }

    let (desk_tx, desk_rx) = mpsc::channel(128);
    {
        let endpoint = config.desk.endpoint;
        subsys.start(SubsystemBuilder::new("desk-writer", move |s| {
            run_desk_writer(s, endpoint, desk_rx)
        }));
    }

    {
        let render = RenderLoop {
            racked: racked.clone(),
            anchor: anchor.clone(),
            clock: clock.clone(),
            desk_tx,
            playing: playing.clone(),
            stats: stats.clone(),
        };
        subsys.start(SubsystemBuilder::new("render", move |s| render.run(s)));
    }

    let core = SessionCore {
        config: config.clone(),
        anchor: anchor.clone(),
        clock: clock.clone(),
        racked: racked.clone(),
        dsp,
        playing: playing.clone(),
        stats: stats.clone(),
    };
    crate::rtsp::start_rtsp(subsys, core).await?;

    {
        let stats = stats.clone();
        let playing = playing.clone();
        subsys.start(SubsystemBuilder::new("watchdog", move |s| {
            run_watchdog(s, stats, playing)
        }));
    }

    ignore_sighup();

    Ok(())
}

/// Every two seconds verify the pipeline is alive: while a sender plays and
/// frames keep arriving, something must leave the render stage too.
async fn run_watchdog(
    subsys: SubsystemHandle,
    stats: Stats,
    playing: Arc<AtomicBool>,
) -> SupervisorResult<()> {
    let mut ticker = interval(WATCHDOG_PERIOD);
    let mut last = stats.snapshot();
    let mut stalled = 0u32;

    loop {
        select! {
            _ = ticker.tick() => {
                let snap = stats.snapshot();
                debug!(
                    "stats: rtsp={} in={} out={} silent={} outdated={} flushed={} mac_fail={}",
                    snap.rtsp_requests,
                    snap.frames_ingested,
                    snap.frames_rendered,
                    snap.frames_silent,
                    snap.frames_outdated,
                    snap.frames_flushed,
                    snap.decipher_failures,
                );

                let ingesting = snap.frames_ingested > last.frames_ingested;
                let emitting = snap.frames_rendered > last.frames_rendered
                    || snap.frames_silent > last.frames_silent
                    || snap.frames_outdated > last.frames_outdated
                    || snap.frames_flushed > last.frames_flushed;

                if playing.load(Ordering::Acquire) && ingesting && !emitting {
                    stalled += 1;
                    warn!("pipeline not emitting ({stalled}/{WATCHDOG_STALL_MAX})");
                } else {
                    stalled = 0;
                }

                if stalled >= WATCHDOG_STALL_MAX {
                    return Err(SupervisorError::PipelineStalled(format!(
                        "no render progress for {} checks while ingesting",
                        stalled
                    )));
                }

                last = snap;
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("Watchdog stopped.");
    Ok(())
}

/// SIGHUP means "reload" to some init systems; this process has no live
/// reload and must not die for it either.
fn ignore_sighup() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(mut hangup) => {
            tokio::spawn(async move {
                while hangup.recv().await.is_some() {
                    info!("SIGHUP ignored");
                }
            });
        }
        Err(e) => warn!("could not install SIGHUP handler: {e}"),
    }
}

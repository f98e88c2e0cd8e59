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

//! Timestamp-driven render dispatch. Every lead-time tick the loop fuses the
//! anchor, asks Racked for a due frame and emits a data message towards the
//! lighting controller; while no usable anchor exists during playback it
//! substitutes silent frames at the same cadence.

pub mod msg;

use crate::{
    anchor::Anchor,
    clock::MasterClock,
    error::SupervisorResult,
    frame::Frame,
    racked::Racked,
    render::msg::{DmxDataMsg, parse_data_reply, split_message},
    stats::Stats,
    time::{self, InputInfo},
};
use bytes::BytesMut;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
    time::{Duration, MissedTickBehavior, interval, sleep},
};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, instrument, trace, warn};

pub struct RenderLoop {
    pub racked: Arc<Mutex<Racked>>,
    pub anchor: Arc<Anchor>,
    pub clock: Arc<MasterClock>,
    pub desk_tx: mpsc::Sender<Vec<u8>>,
    pub playing: Arc<AtomicBool>,
    pub stats: Stats,
}

impl RenderLoop {
    #[instrument(skip(self, subsys))]
    pub async fn run(self, subsys: SubsystemHandle) -> SupervisorResult<()> {
        let mut ticker = interval(InputInfo::lead_time());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Render loop started.");
        loop {
            select! {
                _ = ticker.tick() => self.tick()?,
                _ = subsys.on_shutdown_requested() => break,
            }
        }
        info!("Render loop stopped.");

        Ok(())
    }

    fn tick(&self) -> SupervisorResult<()> {
        let now_ns = time::monotonic_ns();
        let clock_info = self.clock.info()?;
        let anchor = self.anchor.current(&clock_info, now_ns);

        let Some(anchor) = anchor else {
            if self.playing.load(Ordering::Acquire) {
                self.emit_silence()?;
            }
            return Ok(());
        };

        let due = {
            let Ok(mut racked) = self.racked.lock() else {
                return Ok(());
            };
            racked.peek_due(Some(&anchor), now_ns)
        };

        if let Some(frame) = due {
            // refresh the cached sync wait between pick and send; the
            // difference is the measured drift
            let picked_wait = frame.sync_wait_ns();
            let send_wait = frame.refresh_sync_wait(&anchor, time::monotonic_ns());
            trace!(
                "render sn={} drift={}µs",
                frame.seq_num,
                (picked_wait - send_wait) / 1_000
            );

            self.emit(&frame)?;
            frame.mark_rendered();
            self.stats.incr(|s| &s.frames_rendered);
        }

        Ok(())
    }

    fn emit(&self, frame: &Frame) -> SupervisorResult<()> {
        let wire = DmxDataMsg::for_frame(frame).serialize()?;
        if self.desk_tx.try_send(wire).is_err() {
            debug!("desk channel full, dropping data message");
        }
        Ok(())
    }

    fn emit_silence(&self) -> SupervisorResult<()> {
        let frame = Frame::silence();
        self.emit(&frame)?;
        frame.mark_rendered();
        self.stats.incr(|s| &s.frames_silent);
        Ok(())
    }
}

/// Owns the TCP connection to the lighting controller: drains the message
/// channel into the socket and reads `data_reply` echoes back.
#[instrument(skip(subsys, desk_rx))]
pub async fn run_desk_writer(
    subsys: SubsystemHandle,
    endpoint: std::net::SocketAddr,
    mut desk_rx: mpsc::Receiver<Vec<u8>>,
) -> SupervisorResult<()> {
    info!("Desk writer started for {endpoint}.");

    'outer: loop {
        let stream = select! {
            connect = TcpStream::connect(endpoint) => match connect {
                Ok(it) => it,
                Err(e) => {
                    debug!("could not reach lighting controller at {endpoint}: {e}");
                    select! {
                        _ = sleep(Duration::from_secs(2)) => continue,
                        _ = subsys.on_shutdown_requested() => break,
                    }
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        };

        info!("Connected to lighting controller at {endpoint}.");
        let mut stream = stream;
        let mut inbound = BytesMut::with_capacity(1024);
        let mut read_buf = [0u8; 1024];

        loop {
            select! {
                outbound = desk_rx.recv() => {
                    let Some(wire) = outbound else { break 'outer };
                    if let Err(e) = stream.write_all(&wire).await {
                        warn!("lighting controller write failed: {e}");
                        break;
                    }
                },
                read = stream.read(&mut read_buf) => match read {
                    Ok(0) => {
                        warn!("lighting controller closed the connection");
                        break;
                    }
                    Ok(n) => {
                        inbound.extend_from_slice(&read_buf[..n]);
                        while let Some(body) = split_message(&mut inbound) {
                            match parse_data_reply(&body) {
                                Ok(reply) => trace!(
                                    "data_reply echo={}µs elapsed={}µs",
                                    reply.echo_now_us,
                                    reply.elapsed_us
                                ),
                                Err(e) => debug!("unparseable desk reply: {e}"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!("lighting controller read failed: {e}");
                        break;
                    }
                },
                _ = subsys.on_shutdown_requested() => break 'outer,
            }
        }
    }

    info!("Desk writer stopped.");
    Ok(())
}

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

//! Buffered audio ingress. The sender opens one TCP connection and writes
//! length-prefixed RTP packets (u16 big-endian payload length, then the
//! packet). Raw packets go through a bounded channel into the ingest stage,
//! which parses the header, racks the frame and hands the bytes to the DSP
//! pool.

use crate::{
    frame::{Frame, dsp::{DspJob, DspPool}},
    racked::Racked,
    stats::Stats,
    time,
};
use bytes::{Buf, BytesMut};
use std::{
    net::IpAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PACKET_QUEUE_DEPTH: usize = 256;

pub type SharedKey = Arc<Mutex<Option<[u8; 32]>>>;

pub struct AudioServer {
    listener: TcpListener,
    local_port: u16,
}

impl AudioServer {
    pub fn bind(bind_addr: IpAddr) -> std::io::Result<Self> {
        let listener = super::init_tcp_listener(bind_addr, 0)?;
        let local_port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Accept one sender at a time and pump its packets into the pipeline.
    #[instrument(skip(self, cancel, racked, dsp, key, stats))]
    pub async fn run(
        self,
        cancel: CancellationToken,
        racked: Arc<Mutex<Racked>>,
        dsp: Arc<DspPool>,
        key: SharedKey,
        stats: Stats,
    ) {
        let (packet_tx, packet_rx) = mpsc::channel::<Vec<u8>>(PACKET_QUEUE_DEPTH);

        let ingest_cancel = cancel.clone();
        let ingest = tokio::spawn(run_ingest(
            ingest_cancel,
            packet_rx,
            racked,
            dsp,
            key,
            stats,
        ));

        info!("Audio server listening on port {}.", self.local_port);
        loop {
            select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("audio session from {peer}");
                        read_session(stream, &packet_tx, &cancel).await;
                        info!("audio session from {peer} ended");
                    }
                    Err(e) => {
                        warn!("audio accept failed: {e}");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }

        drop(packet_tx);
        ingest.await.ok();
        info!("Audio server stopped.");
    }
}

/// Read length-prefixed packets until disconnect or cancellation.
async fn read_session(mut stream: TcpStream, packet_tx: &mpsc::Sender<Vec<u8>>, cancel: &CancellationToken) {
    let mut wire = BytesMut::with_capacity(16 * 1024);
    let mut read_buf = [0u8; 4096];

    loop {
        select! {
            read = stream.read(&mut read_buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    wire.extend_from_slice(&read_buf[..n]);
                    while let Some(packet) = split_packet(&mut wire) {
                        if packet_tx.try_send(packet).is_err() {
                            debug!("packet queue full, dropping audio packet");
                        }
                    }
                }
                Err(e) => {
                    debug!("audio read ended: {e}");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
}

/// Split one length-prefixed packet out of the wire buffer, when whole.
pub fn split_packet(wire: &mut BytesMut) -> Option<Vec<u8>> {
    if wire.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
    if wire.len() < 2 + len {
        return None;
    }
    wire.advance(2);
    Some(wire.split_to(len).to_vec())
}

/// Ingest stage: header parse, rack, dispatch to DSP. Frames ingress in
/// RTP-packet order; the spool structure preserves that order downstream.
pub async fn run_ingest(
    cancel: CancellationToken,
    mut packet_rx: mpsc::Receiver<Vec<u8>>,
    racked: Arc<Mutex<Racked>>,
    dsp: Arc<DspPool>,
    key: SharedKey,
    stats: Stats,
) {
    loop {
        let packet = select! {
            packet = packet_rx.recv() => match packet {
                Some(it) => it,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let frame = match Frame::from_packet(&packet) {
            Ok(it) => Arc::new(it),
            Err(e) => {
                debug!("malformed audio packet: {e}");
                continue;
            }
        };
        stats.incr(|s| &s.frames_ingested);

        let Some(session_key) = *key.lock().unwrap_or_else(|e| e.into_inner()) else {
            debug!("no session key yet, dropping sn={}", frame.seq_num);
            continue;
        };

        let racked_ok = {
            let Ok(mut racked) = racked.lock() else { continue };
            racked.insert(frame.clone())
        };
        if !racked_ok {
            continue;
        }

        dsp.dispatch(DspJob {
            frame,
            packet,
            key: session_key,
        });
    }

    debug!("audio ingest stopped at {}", time::monotonic_us());
}

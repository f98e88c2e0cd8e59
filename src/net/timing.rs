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

//! Timing UDP endpoint: NTP-over-UDP exchange. Each 32 byte request is
//! answered by echoing the sender's transmit timestamp as our origin and
//! stamping receive/transmit with local monotonic time. Clock duties proper
//! belong to the PTP helper; this endpoint only keeps legacy senders happy.

use crate::time;
use std::net::IpAddr;
use tokio::{net::UdpSocket, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const REQUEST_LEN: usize = 32;

pub struct TimingServer {
    socket: UdpSocket,
    local_port: u16,
}

impl TimingServer {
    pub async fn bind(bind_addr: IpAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((bind_addr, 0)).await?;
        let local_port = socket.local_addr()?.port();
        Ok(Self { socket, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[instrument(skip(self, cancel))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut buf = [0u8; 128];
        info!("Timing server listening on port {}.", self.local_port);

        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if len < REQUEST_LEN {
                            debug!("short timing request from {peer}: {len} bytes");
                            continue;
                        }
                        let reply = build_reply(&buf[..REQUEST_LEN], time::monotonic_ns());
                        if let Err(e) = self.socket.send_to(&reply, peer).await {
                            debug!("timing reply to {peer} failed: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("timing receive failed: {e}");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }

        info!("Timing server stopped.");
    }
}

/// NTP short-format reply: the request's transmit timestamp becomes our
/// origin; receive and transmit carry local monotonic time.
fn build_reply(request: &[u8], now_ns: i64) -> [u8; REQUEST_LEN] {
    let mut reply = [0u8; REQUEST_LEN];
    reply[0] = request[0];
    reply[1] = 0xd3; // response marker

    // origin <- request transmit
    reply[8..16].copy_from_slice(&request[24..32]);

    let now = ntp_timestamp(now_ns);
    reply[16..24].copy_from_slice(&now);
    reply[24..32].copy_from_slice(&now);
    reply
}

fn ntp_timestamp(ns: i64) -> [u8; 8] {
    let secs = (ns / 1_000_000_000) as u32;
    let frac_ns = (ns % 1_000_000_000) as u64;
    let frac = ((frac_ns << 32) / 1_000_000_000) as u32;

    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..].copy_from_slice(&frac.to_be_bytes());
    out
}

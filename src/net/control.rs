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

//! Control UDP endpoint. Resend datagrams carry a retransmitted RTP packet
//! after a four byte preamble; those are forwarded into the receive path so
//! recovered frames are processed at least once.

use std::net::IpAddr;
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Retransmit payload type in the second preamble byte.
const TYPE_RESEND: u8 = 0x56;
const PREAMBLE_LEN: usize = 4;

pub struct ControlServer {
    socket: UdpSocket,
    local_port: u16,
}

impl ControlServer {
    pub async fn bind(bind_addr: IpAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((bind_addr, 0)).await?;
        let local_port = socket.local_addr()?.port();
        Ok(Self { socket, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[instrument(skip(self, cancel, packet_tx))]
    pub async fn run(self, cancel: CancellationToken, packet_tx: mpsc::Sender<Vec<u8>>) {
        let mut buf = [0u8; 4096];
        info!("Control server listening on port {}.", self.local_port);

        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        let datagram = &buf[..len];
                        if len > PREAMBLE_LEN && (datagram[1] & 0x7f) == TYPE_RESEND {
                            debug!("resend datagram from {peer}, {len} bytes");
                            if packet_tx.try_send(datagram[PREAMBLE_LEN..].to_vec()).is_err() {
                                debug!("receive path full, dropping resend");
                            }
                        } else {
                            debug!("control datagram from {peer}, {len} bytes");
                        }
                    }
                    Err(e) => {
                        warn!("control receive failed: {e}");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }

        info!("Control server stopped.");
    }
}

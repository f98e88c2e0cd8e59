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

//! Event TCP server. The sender opens this channel after SETUP and uses it
//! for control notifications framed like RTSP; each request is acknowledged
//! with 200 OK.

use crate::rtsp::codec::{Pending, Reply};
use bytes::BytesMut;
use std::net::IpAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub struct EventServer {
    listener: TcpListener,
    local_port: u16,
}

impl EventServer {
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

    #[instrument(skip(self, cancel))]
    pub async fn run(self, cancel: CancellationToken) {
        info!("Event server listening on port {}.", self.local_port);

        loop {
            select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("event session from {peer}");
                        event_session(stream, &cancel).await;
                    }
                    Err(e) => {
                        debug!("event accept failed: {e}");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }

        info!("Event server stopped.");
    }
}

async fn event_session(mut stream: TcpStream, cancel: &CancellationToken) {
    let mut wire = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 2048];
    let mut pending = Pending::new();

    loop {
        select! {
            read = stream.read(&mut read_buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    wire.extend_from_slice(&read_buf[..n]);
                    loop {
                        match pending.load_more(&mut wire) {
                            Ok(0) => {
                                let Some(request) = pending.take() else { break };
                                debug!("event message: {} {}", request.method, request.path);
                                let reply = Reply::ok().serialize(request.cseq());
                                if stream.write_all(&reply).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => break,
                            Err(e) => {
                                debug!("unparseable event message: {e}");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("event read ended: {e}");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::rtsp::codec::parse_reply;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn event_messages_are_acknowledged() {
        let server = EventServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let port = server.local_port();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(server.run(cancel.clone()));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"POST /command RTSP/1.0\r\nCSeq: 11\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            stream.read(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();

        let reply = parse_reply(&buf[..n]).unwrap();
        assert_eq!(reply.code.code(), 200);
        assert_eq!(reply.headers.get("CSeq"), Some("11"));

        cancel.cancel();
        run.await.unwrap();
    }
}

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

//! Per-stream network servers opened on SETUP: the audio-buffered TCP
//! server, the control and timing UDP endpoints and the event TCP server.
//! Each binds eagerly so its port can be reported in the SETUP reply and
//! runs until its session's cancellation token fires.

pub mod audio;
pub mod control;
pub mod event;
pub mod timing;

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::instrument;

#[instrument]
pub fn init_tcp_listener(bind_addr: IpAddr, port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::new(bind_addr, port);
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_tcp_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn listener_binds_an_ephemeral_port() {
        let listener = init_tcp_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
    }
}

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

//! RTSP-over-TCP sessions. Each accepted connection is a task that owns its
//! session state: cipher context, request assembly and the dispatcher with
//! everything it spawned. Session-fatal errors terminate the task and
//! release its resources; the listener keeps serving new connections.

pub mod aplist;
pub mod codec;
pub mod dispatch;
pub mod fairplay;

use crate::{
    anchor::Anchor,
    cipher::CipherContext,
    clock::MasterClock,
    config::Config,
    error::{CipherError, RtspResult, SupervisorResult},
    frame::dsp::DspPool,
    net,
    racked::Racked,
    rtsp::{
        codec::{Pending, Reply, RespCode},
        dispatch::Dispatcher,
    },
    stats::Stats,
};
use bytes::BytesMut;
use std::sync::{Arc, Mutex, atomic::AtomicBool};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handles a session needs to act on the core; owned by the supervisor,
/// shared read-mostly.
#[derive(Clone)]
pub struct SessionCore {
    pub config: Config,
    pub anchor: Arc<Anchor>,
    pub clock: Arc<MasterClock>,
    pub racked: Arc<Mutex<Racked>>,
    pub dsp: Arc<DspPool>,
    pub playing: Arc<AtomicBool>,
    pub stats: Stats,
}

/// Start the RTSP listener subsystem and report its bound port.
pub async fn start_rtsp(subsys: &SubsystemHandle, core: SessionCore) -> SupervisorResult<u16> {
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    subsys.start(SubsystemBuilder::new("rtsp", move |s| {
        run_rtsp_listener(s, core, ready_tx)
    }));
    let port = ready_rx.await?;
    info!("RTSP server started on port {port}.");
    Ok(port)
}

/// Accept loop. One session task per connection; sessions die with the
/// subsystem through a shared cancellation token.
#[instrument(skip(subsys, core, ready_tx))]
pub async fn run_rtsp_listener(
    subsys: SubsystemHandle,
    core: SessionCore,
    ready_tx: tokio::sync::oneshot::Sender<u16>,
) -> SupervisorResult<()> {
    let listener = net::init_tcp_listener(core.config.rtsp.bind_address, core.config.rtsp.port)?;
    let local = listener.local_addr()?;
    ready_tx.send(local.port()).ok();
    info!("RTSP listening on {local}.");

    let cancel = CancellationToken::new();

    loop {
        select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("RTSP session from {peer}");
                    let core = core.clone();
                    let session_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        run_session(stream, core, session_cancel).await;
                        info!("RTSP session from {peer} ended");
                    });
                }
                Err(e) => {
                    warn!("RTSP accept failed: {e}");
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    cancel.cancel();
    info!("RTSP listener stopped.");
    Ok(())
}

async fn run_session(mut stream: TcpStream, core: SessionCore, cancel: CancellationToken) {
    let device_id = core.config.app.device_id.clone();
    let mut cipher = CipherContext::new(&device_id);
    let mut dispatcher = Dispatcher::new(core, cancel.clone());

    let mut wire = BytesMut::with_capacity(8 * 1024);
    let mut plain = BytesMut::with_capacity(8 * 1024);
    let mut pending = Pending::new();
    let mut read_buf = [0u8; 4096];

    'session: loop {
        let n = select! {
            read = stream.read(&mut read_buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("session read ended: {e}");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };
        wire.extend_from_slice(&read_buf[..n]);

        // a MAC failure here is fatal for the session; no partial
        // plaintext is delivered upstream
        match cipher.decrypt(&mut wire, &mut plain) {
            Ok(_) => {}
            Err(CipherError::CipherFailure) | Err(CipherError::BlockTooLong(_)) => {
                warn!("sealed channel integrity failure, dropping session");
                break;
            }
            Err(e) => {
                warn!("decrypt error: {e}");
                break;
            }
        }

        loop {
            match pending.load_more(&mut plain) {
                Ok(0) => {
                    let Some(request) = pending.take() else { break };
                    debug!("{} {} cseq={}", request.method, request.path, request.cseq());

                    let reply = dispatcher.handle(&request, &mut cipher).await;
                    if write_reply(&mut stream, &mut cipher, &reply, request.cseq())
                        .await
                        .is_err()
                    {
                        break 'session;
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("unparseable request: {e}");
                    let reply = Reply::new(RespCode::BadRequest);
                    write_reply(&mut stream, &mut cipher, &reply, "0").await.ok();
                    break 'session;
                }
            }
        }
    }

    dispatcher.shutdown();
}

async fn write_reply(
    stream: &mut TcpStream,
    cipher: &mut CipherContext,
    reply: &Reply,
    cseq: &str,
) -> RtspResult<()> {
    let bytes = reply.serialize(cseq);
    let sealed = cipher.encrypt(&bytes)?;
    stream.write_all(&sealed).await?;
    // the final pair-verify reply leaves in the clear; everything after is
    // sealed
    cipher.activate_pending();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::{
        config::{Config, WindowConfig},
        rtsp::{
            aplist::{Aplist, AplistBuilder},
            codec::parse_reply,
        },
    };
    use tokio::sync::mpsc;

    fn core() -> SessionCore {
        let stats = Stats::new();
        let (peers_tx, _peers_rx) = mpsc::channel(8);
        SessionCore {
            config: Config::default(),
            anchor: Arc::new(Anchor::new()),
            clock: Arc::new(MasterClock::new("/pierre-session-test".into(), peers_tx)),
            racked: Arc::new(Mutex::new(Racked::new(stats.clone()))),
            dsp: Arc::new(DspPool::new(0.1, WindowConfig::Hann, stats.clone())),
            playing: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }

    async fn start_listener(core: SessionCore) -> (u16, CancellationToken) {
        let listener = net::init_tcp_listener(
            "127.0.0.1".parse().unwrap(),
            0,
        )
        .unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let core = core.clone();
                            let session_cancel = accept_cancel.child_token();
                            tokio::spawn(run_session(stream, core, session_cancel));
                        }
                        Err(_) => break,
                    },
                    _ = accept_cancel.cancelled() => break,
                }
            }
        });
        (port, cancel)
    }

    async fn transact(stream: &mut TcpStream, request: &[u8]) -> Vec<u8> {
        stream.write_all(request).await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn options_lists_public_methods() {
        let (port, cancel) = start_listener(core()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let raw = transact(&mut stream, b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.code, RespCode::Ok);
        assert_eq!(reply.headers.get("CSeq"), Some("1"));
        assert!(reply.headers.get("Public").unwrap().contains("SETRATEANCHORTIME"));
        assert_eq!(reply.headers.get("Server"), Some(codec::SERVER_NAME));

        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_method_is_501() {
        let (port, cancel) = start_listener(core()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let raw = transact(&mut stream, b"DESCRIBE * RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.code, RespCode::NotImplemented);

        cancel.cancel();
    }

    #[tokio::test]
    async fn get_info_returns_accessory_plist() {
        let (port, cancel) = start_listener(core()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let raw = transact(&mut stream, b"GET /info RTSP/1.0\r\nCSeq: 3\r\n\r\n").await;
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.code, RespCode::Ok);
        assert_eq!(
            reply.headers.get("Content-Type"),
            Some(codec::content_type::BINARY_PLIST)
        );

        let plist = Aplist::from_bytes(&reply.body).unwrap();
        assert_eq!(plist.uint(&["features"]), Some(dispatch::FEATURES));
        assert_eq!(plist.string(&["model"]), Some("Pierre3,1"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn setup_with_wrong_timing_protocol_is_rejected() {
        let (port, cancel) = start_listener(core()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let body = AplistBuilder::new().string("timingProtocol", "NTP").to_binary();
        let mut request = Vec::new();
        request.extend_from_slice(
            format!(
                "SETUP rtsp://x RTSP/1.0\r\nCSeq: 4\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        request.extend_from_slice(&body);

        let raw = transact(&mut stream, &request).await;
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.code, RespCode::BadRequest);

        cancel.cancel();
    }

    #[tokio::test]
    async fn ptp_setup_reports_event_and_timing_ports() {
        let (port, cancel) = start_listener(core()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let body = AplistBuilder::new()
            .string("timingProtocol", "PTP")
            .string("groupUUID", "A0-11")
            .to_binary();
        let mut request = Vec::new();
        request.extend_from_slice(
            format!(
                "SETUP rtsp://x RTSP/1.0\r\nCSeq: 5\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        request.extend_from_slice(&body);

        let raw = transact(&mut stream, &request).await;
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.code, RespCode::Ok);

        let plist = Aplist::from_bytes(&reply.body).unwrap();
        assert!(plist.uint(&["eventPort"]).unwrap() > 0);
        assert!(plist.contains(&["timingPort"]));

        cancel.cancel();
    }

    #[tokio::test]
    async fn stream_setup_stores_key_and_reports_data_port() {
        let session_core = core();
        let (port, cancel) = start_listener(session_core.clone()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let stream_dict = AplistBuilder::new()
            .uint("type", 103)
            .uint("spf", 1024)
            .data("shk", vec![7u8; 32]);
        let body = AplistBuilder::new()
            .dict_array("streams", vec![stream_dict])
            .to_binary();
        let mut request = Vec::new();
        request.extend_from_slice(
            format!(
                "SETUP rtsp://x RTSP/1.0\r\nCSeq: 6\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        request.extend_from_slice(&body);

        let raw = transact(&mut stream, &request).await;
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.code, RespCode::Ok);

        let plist = Aplist::from_bytes(&reply.body).unwrap();
        let streams = plist.dict_array(&["streams"]).unwrap();
        assert_eq!(streams[0].uint(&["type"]), Some(103));
        assert!(streams[0].uint(&["dataPort"]).unwrap() > 0);
        assert!(streams[0].uint(&["controlPort"]).unwrap() > 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn record_enables_playing() {
        let session_core = core();
        let (port, cancel) = start_listener(session_core.clone()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let raw = transact(&mut stream, b"RECORD rtsp://x RTSP/1.0\r\nCSeq: 7\r\n\r\n").await;
        let reply = parse_reply(&raw).unwrap();
        assert_eq!(reply.code, RespCode::Ok);
        assert!(session_core.playing.load(std::sync::atomic::Ordering::Acquire));

        cancel.cancel();
    }
}

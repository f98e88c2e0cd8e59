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

//! Request routing. Every endpoint maps onto a core action: pairing steps
//! into the cipher, anchor and peer updates into the clock domain, stream
//! setup into the net servers, flush windows into Racked.

use crate::{
    anchor::AnchorData,
    cipher::{CipherContext, pairing::StepStatus},
    net::{audio::AudioServer, control::ControlServer, event::EventServer, timing::TimingServer},
    racked::FlushRequest,
    rtsp::{
        SessionCore,
        aplist::{Aplist, AplistBuilder},
        codec::{Reply, Request, RespCode, content_type},
        fairplay,
    },
    time,
};
use std::sync::{Arc, Mutex, atomic::Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// AirPlay feature bits advertised in GET /info: buffered audio, PTP
/// timing, HomeKit pairing and unified advertisement.
pub const FEATURES: u64 = 0x1C340445F8A00;
pub const SYSTEM_FLAGS: u64 = 4;
pub const PROTOCOL_VERSION: &str = "1.1";
pub const SOURCE_VERSION: &str = "366.0";
pub const AUDIO_BUFFER_SIZE: u64 = 8 * 1024 * 1024;

const STREAM_TYPE_BUFFERED: u64 = 103;

pub struct Dispatcher {
    core: SessionCore,
    session_cancel: CancellationToken,
    services_cancel: Option<CancellationToken>,
    stream_cancel: Option<CancellationToken>,
    shared_key: Arc<Mutex<Option<[u8; 32]>>>,
    event_port: Option<u16>,
    timing_port: Option<u16>,
    audio_port: Option<u16>,
    control_port: Option<u16>,
    volume: f32,
}

impl Dispatcher {
    pub fn new(core: SessionCore, session_cancel: CancellationToken) -> Self {
        Self {
            core,
            session_cancel,
            services_cancel: None,
            stream_cancel: None,
            shared_key: Arc::new(Mutex::new(None)),
            event_port: None,
            timing_port: None,
            audio_port: None,
            control_port: None,
            volume: 0.0,
        }
    }

    #[instrument(skip(self, request, cipher), fields(method = %request.method, path = %request.path))]
    pub async fn handle(&mut self, request: &Request, cipher: &mut CipherContext) -> Reply {
        self.core.stats.incr(|s| &s.rtsp_requests);

        match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/pair-setup") => self.pair_setup(request, cipher),
            ("POST", "/pair-verify") => self.pair_verify(request, cipher),
            ("POST", "/fp-setup") => self.fp_setup(request),
            ("POST", "/feedback") | ("POST", "/command") => Reply::ok(),
            ("GET", "/info") => self.info(request),
            ("OPTIONS", _) => Reply::ok().with_header(
                "Public",
                "ANNOUNCE, SETUP, RECORD, PAUSE, FLUSH, FLUSHBUFFERED, TEARDOWN, \
                 OPTIONS, POST, GET, PUT, SET_PARAMETER, GET_PARAMETER, SETPEERS, \
                 SETRATEANCHORTIME",
            ),
            ("SETUP", _) => self.setup(request).await,
            ("RECORD", _) => self.record(),
            ("SETRATEANCHORTIME", _) | ("SET_RATE_ANCHOR_TIME", _) => self.set_rate_anchor_time(request),
            ("SETPEERS", _) => self.set_peers(request),
            ("SET_PARAMETER", _) => self.set_parameter(request),
            ("GET_PARAMETER", _) => self.get_parameter(request),
            ("FLUSHBUFFERED", _) | ("FLUSH_BUFFERED", _) => self.flush_buffered(request),
            ("TEARDOWN", _) => self.teardown(request),
            (method, path) => {
                warn!("unhandled request {method} {path}");
                Reply::new(RespCode::NotImplemented)
            }
        }
    }

    pub fn shared_key(&self) -> Arc<Mutex<Option<[u8; 32]>>> {
        self.shared_key.clone()
    }

    /// Stop everything this session spawned; called on socket close too.
    pub fn shutdown(&mut self) {
        if let Some(cancel) = self.stream_cancel.take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.services_cancel.take() {
            cancel.cancel();
        }
        self.event_port = None;
        self.timing_port = None;
        self.core.playing.store(false, Ordering::Release);
    }

    fn pair_setup(&mut self, request: &Request, cipher: &mut CipherContext) -> Reply {
        match cipher.setup(&request.body) {
            Ok(step) => {
                let code = if step.status == StepStatus::Failed {
                    RespCode::AuthRequired
                } else {
                    RespCode::Ok
                };
                Reply::new(code).with_body(content_type::OCTET_STREAM, step.body)
            }
            Err(e) => {
                warn!("pair-setup rejected: {e}");
                Reply::new(RespCode::BadRequest)
            }
        }
    }

    fn pair_verify(&mut self, request: &Request, cipher: &mut CipherContext) -> Reply {
        match cipher.verify(&request.body) {
            Ok(step) => {
                let code = if step.status == StepStatus::Failed {
                    RespCode::AuthRequired
                } else {
                    RespCode::Ok
                };
                Reply::new(code).with_body(content_type::OCTET_STREAM, step.body)
            }
            Err(e) => {
                warn!("pair-verify rejected: {e}");
                Reply::new(RespCode::BadRequest)
            }
        }
    }

    fn fp_setup(&self, request: &Request) -> Reply {
        match fairplay::response(&request.body) {
            Some(body) => Reply::ok().with_body(content_type::OCTET_STREAM, body),
            None => Reply::new(RespCode::BadRequest),
        }
    }

    fn info(&self, request: &Request) -> Reply {
        // stage 1 carries a qualifier plist, stage 2 an empty body
        let stage1 = !request.body.is_empty()
            && Aplist::from_bytes(&request.body)
                .ok()
                .and_then(|plist| plist.string_array(&["qualifier"]))
                .map(|quals| quals.iter().any(|q| q == "txtAirPlay"))
                .unwrap_or(false);

        let app = &self.core.config.app;
        let mut builder = AplistBuilder::new()
            .uint("features", FEATURES)
            .uint("statusFlags", SYSTEM_FLAGS)
            .string("deviceID", &app.device_id)
            .string("name", &app.instance.name)
            .string("model", &app.model)
            .string("protocolVersion", PROTOCOL_VERSION)
            .string("sourceVersion", SOURCE_VERSION);

        if stage1 {
            let txt = format!(
                "acl=0deviceid={}features={:#X}model={}",
                app.device_id, FEATURES, app.model
            );
            builder = builder.data("qualifier", txt.into_bytes());
        }

        Reply::ok().with_body(content_type::BINARY_PLIST, builder.to_binary())
    }

    async fn setup(&mut self, request: &Request) -> Reply {
        let Ok(plist) = Aplist::from_bytes(&request.body) else {
            return Reply::new(RespCode::BadRequest);
        };

        if plist.contains(&["streams"]) {
            self.setup_streams(&plist).await
        } else {
            self.setup_session(&plist).await
        }
    }

    /// First SETUP: timing protocol, group info, timing peers.
    async fn setup_session(&mut self, plist: &Aplist) -> Reply {
        match plist.string(&["timingProtocol"]) {
            Some("PTP") => {}
            Some(other) => {
                warn!("unsupported timing protocol: {other}");
                return Reply::new(RespCode::BadRequest);
            }
            None => return Reply::new(RespCode::BadRequest),
        }

        if let Some(group) = plist.string(&["groupUUID"]) {
            debug!(
                "group {group} leader={}",
                plist.boolean(&["groupContainsGroupLeader"]).unwrap_or(false)
            );
        }

        if let Some(peers) = plist.string_array(&["timingPeerInfo", "Addresses"]) {
            self.core.clock.update_peers(peers);
        }

        let bind = self.core.config.rtsp.bind_address;
        let cancel = self
            .services_cancel
            .get_or_insert_with(|| self.session_cancel.child_token())
            .clone();

        if self.event_port.is_none() {
            match EventServer::bind(bind) {
                Ok(server) => {
                    self.event_port = Some(server.local_port());
                    tokio::spawn(server.run(cancel.clone()));
                }
                Err(e) => {
                    warn!("could not bind event server: {e}");
                    return Reply::new(RespCode::InternalError);
                }
            }
        }

        if self.timing_port.is_none() {
            match TimingServer::bind(bind).await {
                Ok(server) => {
                    self.timing_port = Some(server.local_port());
                    tokio::spawn(server.run(cancel.clone()));
                }
                Err(e) => {
                    warn!("could not bind timing server: {e}");
                    return Reply::new(RespCode::InternalError);
                }
            }
        }

        let body = AplistBuilder::new()
            .uint("eventPort", self.event_port.unwrap_or_default() as u64)
            .uint("timingPort", self.timing_port.unwrap_or_default() as u64)
            .to_binary();
        Reply::ok().with_body(content_type::BINARY_PLIST, body)
    }

    /// Subsequent SETUP: open the audio stream described in the plist.
    async fn setup_streams(&mut self, plist: &Aplist) -> Reply {
        let Some(streams) = plist.dict_array(&["streams"]) else {
            return Reply::new(RespCode::BadRequest);
        };

        let mut replies = Vec::new();
        for stream in &streams {
            let stream_type = stream.uint(&["type"]).unwrap_or(0);
            if stream_type != STREAM_TYPE_BUFFERED {
                warn!("unsupported stream type {stream_type}");
                continue;
            }

            let spf = stream.uint(&["spf"]).unwrap_or(1024);
            let Some(shk) = stream.data(&["shk"]) else {
                warn!("stream carries no shared key");
                return Reply::new(RespCode::BadRequest);
            };
            let Ok(shk) = <[u8; 32]>::try_from(shk) else {
                return Reply::new(RespCode::BadRequest);
            };

            if let Ok(mut key) = self.shared_key.lock() {
                *key = Some(shk);
            }

            let bind = self.core.config.rtsp.bind_address;
            let cancel = self.session_cancel.child_token();

            let audio = match AudioServer::bind(bind) {
                Ok(it) => it,
                Err(e) => {
                    warn!("could not bind audio server: {e}");
                    return Reply::new(RespCode::InternalError);
                }
            };
            let control = match ControlServer::bind(bind).await {
                Ok(it) => it,
                Err(e) => {
                    warn!("could not bind control server: {e}");
                    return Reply::new(RespCode::InternalError);
                }
            };

            self.audio_port = Some(audio.local_port());
            self.control_port = Some(control.local_port());
            info!(
                "stream type={stream_type} spf={spf} audio={} control={}",
                audio.local_port(),
                control.local_port()
            );

            let racked = self.core.racked.clone();
            let dsp = self.core.dsp.clone();
            let key = self.shared_key.clone();
            let stats = self.core.stats.clone();

            // control resends run through their own ingest into the same rack
            let (resend_tx, resend_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
            tokio::spawn(control.run(cancel.clone(), resend_tx));
            tokio::spawn(crate::net::audio::run_ingest(
                cancel.clone(),
                resend_rx,
                racked.clone(),
                dsp.clone(),
                key.clone(),
                stats.clone(),
            ));

            tokio::spawn(audio.run(cancel.clone(), racked, dsp, key, stats));
            self.stream_cancel = Some(cancel);

            replies.push(
                AplistBuilder::new()
                    .uint("type", stream_type)
                    .uint("dataPort", self.audio_port.unwrap_or_default() as u64)
                    .uint("controlPort", self.control_port.unwrap_or_default() as u64)
                    .uint("audioBufferSize", AUDIO_BUFFER_SIZE),
            );
        }

        if replies.is_empty() {
            return Reply::new(RespCode::BadRequest);
        }

        let body = AplistBuilder::new().dict_array("streams", replies).to_binary();
        Reply::ok().with_body(content_type::BINARY_PLIST, body)
    }

    fn record(&mut self) -> Reply {
        info!("record, playback enabled");
        self.core.playing.store(true, Ordering::Release);
        Reply::ok().with_header("Audio-Latency", "11035")
    }

    fn set_rate_anchor_time(&mut self, request: &Request) -> Reply {
        let Ok(plist) = Aplist::from_bytes(&request.body) else {
            return Reply::new(RespCode::BadRequest);
        };

        if let Some(clock_id) = plist.uint(&["networkTimeTimelineID"]) {
            let data = AnchorData::new(
                clock_id,
                plist.uint(&["networkTimeSecs"]).unwrap_or(0),
                plist.uint(&["networkTimeFrac"]).unwrap_or(0),
                plist.uint(&["rtpTime"]).unwrap_or(0) as u32,
                plist.uint(&["networkTimeFlags"]).unwrap_or(0),
            );
            self.core.anchor.save(data, time::monotonic_ns());
        }

        let rate = plist.uint(&["rate"]).unwrap_or(0);
        self.core.playing.store(rate > 0, Ordering::Release);
        debug!("rate={rate}");

        Reply::ok()
    }

    fn set_peers(&self, request: &Request) -> Reply {
        let Ok(plist) = Aplist::from_bytes(&request.body) else {
            return Reply::new(RespCode::BadRequest);
        };
        // body is a root-level array of peer addresses
        let Some(peers) = plist.string_array(&[]) else {
            return Reply::new(RespCode::BadRequest);
        };
        self.core.clock.update_peers(peers);
        Reply::ok()
    }

    fn set_parameter(&mut self, request: &Request) -> Reply {
        if request.content_type() != Some(content_type::TEXT_PARAMETERS) {
            return Reply::ok();
        }
        let Ok(text) = std::str::from_utf8(&request.body) else {
            return Reply::new(RespCode::BadRequest);
        };

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "volume" => {
                    if let Ok(volume) = value.trim().parse::<f32>() {
                        debug!("volume={volume}");
                        self.volume = volume;
                    }
                }
                "progress" => debug!("progress={}", value.trim()),
                other => debug!("unhandled parameter {other}"),
            }
        }
        Reply::ok()
    }

    fn get_parameter(&self, request: &Request) -> Reply {
        let body = std::str::from_utf8(&request.body).unwrap_or_default();
        if body.trim() == "volume" {
            let text = format!("volume: {:.6}\r\n", self.volume);
            Reply::ok().with_body(content_type::TEXT_PARAMETERS, text.into_bytes())
        } else {
            Reply::ok()
        }
    }

    fn flush_buffered(&self, request: &Request) -> Reply {
        let Ok(plist) = Aplist::from_bytes(&request.body) else {
            return Reply::new(RespCode::BadRequest);
        };

        let request = FlushRequest {
            until_seq: plist.uint(&["flushUntilSeq"]).unwrap_or(u32::MAX as u64) as u32,
            until_ts: plist.uint(&["flushUntilTS"]).unwrap_or(u32::MAX as u64) as u32,
        };
        info!(
            "flush until_seq={} until_ts={}",
            request.until_seq, request.until_ts
        );

        if let Ok(mut racked) = self.core.racked.lock() {
            racked.flush(request);
        }
        Reply::ok()
    }

    fn teardown(&mut self, request: &Request) -> Reply {
        let streams_only = Aplist::from_bytes(&request.body)
            .map(|plist| plist.contains(&["streams"]))
            .unwrap_or(false);

        if streams_only {
            info!("teardown: audio stream");
            if let Some(cancel) = self.stream_cancel.take() {
                cancel.cancel();
            }
            if let Ok(mut key) = self.shared_key.lock() {
                *key = None;
            }
            self.audio_port = None;
            self.control_port = None;
        } else {
            info!("teardown: session");
            self.shutdown();
            self.core.anchor.teardown();
            if let Ok(mut racked) = self.core.racked.lock() {
                racked.clear();
            }
        }

        Reply::ok()
    }
}

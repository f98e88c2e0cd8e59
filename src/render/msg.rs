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

//! Wire format towards the lighting controller: length-prefixed msgpack
//! maps. The first two bytes of every message are the big-endian body
//! length; the body is a map whose final key is a magic value confirming a
//! complete message. The controller may answer with a small `data_reply`
//! map.

use crate::{
    error::{DeskError, DeskResult},
    frame::Frame,
    time::{self, InputInfo},
};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const MSG_TYPE_DATA: &str = "data";
pub const MSG_TYPE_DATA_REPLY: &str = "data_reply";
pub const MAGIC_VAL: u16 = 0x033c;
pub const DMX_FRAME_LEN: usize = 16;

/// Per-frame data message. Field order is the map key order on the wire;
/// the magic trailer key stays last.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmxDataMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub seq_num: u32,
    pub timestamp: u32,
    pub silence: bool,
    #[serde(rename = "lead_time_µs")]
    pub lead_time_us: i64,
    #[serde(rename = "sync_wait_µs")]
    pub sync_wait_us: i64,
    /// DMX payload, populated downstream by the FX layer.
    pub dframe: [u8; DMX_FRAME_LEN],
    #[serde(rename = "now_µs")]
    pub now_us: i64,
    #[serde(rename = "now_real_µs")]
    pub now_real_us: i64,
    pub ma: u16,
}

impl DmxDataMsg {
    pub fn for_frame(frame: &Frame) -> Self {
        Self {
            msg_type: MSG_TYPE_DATA.to_owned(),
            seq_num: frame.seq_num,
            timestamp: frame.timestamp,
            silence: frame.silent(),
            lead_time_us: InputInfo::LEAD_TIME_US,
            sync_wait_us: frame.sync_wait_ns() / 1_000,
            dframe: [0u8; DMX_FRAME_LEN],
            now_us: time::monotonic_us(),
            now_real_us: time::realtime_us(),
            ma: MAGIC_VAL,
        }
    }

    /// Serialize with the u16 network-order length header.
    pub fn serialize(&self) -> DeskResult<Vec<u8>> {
        let body = rmp_serde::to_vec_named(self)?;
        let mut out = Vec::with_capacity(2 + body.len());
        out.put_u16(body.len() as u16);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataReply {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "echo_now_µs", default)]
    pub echo_now_us: i64,
    #[serde(rename = "elapsed_µs", default)]
    pub elapsed_us: i64,
}

/// Split one length-prefixed message out of an inbound buffer, when whole.
pub fn split_message(buf: &mut BytesMut) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let body_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + body_len {
        return None;
    }
    buf.advance(2);
    Some(buf.split_to(body_len).to_vec())
}

pub fn parse_data_reply(body: &[u8]) -> DeskResult<DataReply> {
    let reply: DataReply = rmp_serde::from_slice(body)?;
    if reply.msg_type != MSG_TYPE_DATA_REPLY {
        return Err(DeskError::DecodeError(rmp_serde::decode::Error::OutOfRange));
    }
    Ok(reply)
}

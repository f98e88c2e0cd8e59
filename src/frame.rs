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

//! The central unit of the pipeline: one RTP packet's worth of audio and the
//! metadata required to render it at the right instant.
//!
//! Header layout is RFC 3550 with Apple's variations: the sequence number is
//! the low 24 bits of header bytes 1..4, whose top byte doubles as the
//! marker/type byte (kept separately as `mpt`). AAD for payload decryption
//! is header bytes 4..12, the timestamp and SSRC.

pub mod av;
pub mod dsp;
pub mod peaks;
pub mod state;

use crate::{
    anchor::AnchorLast,
    error::{FrameError, FrameResult},
    frame::{
        peaks::Peaks,
        state::{AtomicFrameState, FrameState},
    },
    time::InputInfo,
};
use std::sync::{
    OnceLock,
    atomic::{AtomicBool, AtomicI64, Ordering},
};

pub const RTP_HEADER_LEN: usize = 12;
pub const NONCE_MINI_LEN: usize = 8;
pub const TAG_LEN: usize = 16;
pub const SEQ_NUM_MASK: u32 = 0x00ff_ffff;

const SYNC_WAIT_UNSET: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub channels: usize,
    pub samp_per_ch: usize,
}

#[derive(Debug)]
pub struct Frame {
    state: AtomicFrameState,
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub ssrc_count: u8,
    pub mpt: u8,
    pub seq_num: u32,
    pub timestamp: u32,
    pub ssrc: u32,
    silence: AtomicBool,
    sync_wait_ns: AtomicI64,
    sample_info: OnceLock<SampleInfo>,
    peaks: OnceLock<Peaks>,
}

impl Frame {
    /// Parse the 12 byte header of a raw packet. Only RTP v2 is accepted.
    pub fn from_packet(packet: &[u8]) -> FrameResult<Frame> {
        if packet.len() < RTP_HEADER_LEN + TAG_LEN + NONCE_MINI_LEN {
            return Err(FrameError::PacketTooShort(packet.len()));
        }

        let version = (packet[0] & 0b1100_0000) >> 6;
        if version != 2 {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let seq_num = u32::from_be_bytes([0, packet[1], packet[2], packet[3]]) & SEQ_NUM_MASK;

        Ok(Frame {
            state: AtomicFrameState::new(FrameState::HeaderParsed),
            version,
            padding: (packet[0] & 0b0010_0000) != 0,
            extension: (packet[0] & 0b0001_0000) != 0,
            ssrc_count: packet[0] & 0b0000_1111,
            mpt: packet[1],
            seq_num,
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            silence: AtomicBool::new(false),
            sync_wait_ns: AtomicI64::new(SYNC_WAIT_UNSET),
            sample_info: OnceLock::new(),
            peaks: OnceLock::new(),
        })
    }

    fn synthetic_with(state: FrameState) -> Frame {
        Frame {
            state: AtomicFrameState::new(state),
            version: 2,
            padding: false,
            extension: false,
            ssrc_count: 0,
            mpt: 0,
            seq_num: 0,
            timestamp: 0,
            ssrc: 0,
            silence: AtomicBool::new(true),
            sync_wait_ns: AtomicI64::new(InputInfo::LEAD_TIME_NS),
            sample_info: OnceLock::new(),
            peaks: OnceLock::new(),
        }
    }

    /// Synthetic silent frame, emitted when no usable anchor exists.
    pub fn silence() -> Frame {
        Self::synthetic_with(FrameState::Ready)
    }

    pub fn sentinel() -> Frame {
        Self::synthetic_with(FrameState::Sentinel)
    }

    /// Frames without a sender seq_num or timestamp carry no peaks and skip
    /// decode and DSP.
    pub fn synthetic(&self) -> bool {
        self.seq_num == 0 || self.timestamp == 0
    }

    /// AAD for payload decryption: the big-endian timestamp and SSRC.
    pub fn aad(&self) -> [u8; 8] {
        let mut aad = [0u8; 8];
        aad[..4].copy_from_slice(&self.timestamp.to_be_bytes());
        aad[4..].copy_from_slice(&self.ssrc.to_be_bytes());
        aad
    }

    pub fn state(&self) -> FrameState {
        self.state.load()
    }

    pub(crate) fn state_handle(&self) -> &AtomicFrameState {
        &self.state
    }

    pub fn silent(&self) -> bool {
        self.silence.load(Ordering::Acquire)
    }

    pub fn set_silent(&self, silent: bool) {
        self.silence.store(silent, Ordering::Release);
    }

    /// Peaks must not be read before DSP completes.
    pub fn peaks(&self) -> Option<&Peaks> {
        if self.state() >= FrameState::DspComplete && !self.state().terminal() {
            self.peaks.get()
        } else {
            None
        }
    }

    pub(crate) fn set_peaks(&self, peaks: Peaks) {
        self.set_silent(peaks.silence());
        self.peaks.set(peaks).ok();
    }

    pub fn sample_info(&self) -> Option<SampleInfo> {
        self.sample_info.get().copied()
    }

    pub(crate) fn save_sample_info(&self, info: SampleInfo) {
        self.sample_info.set(info).ok();
    }

    /// Cached duration until this frame's render instant.
    pub fn sync_wait_ns(&self) -> i64 {
        match self.sync_wait_ns.load(Ordering::Acquire) {
            SYNC_WAIT_UNSET => InputInfo::LEAD_TIME_NS,
            cached => cached,
        }
    }

    /// Evaluate the frame's state as of `now`. Synthetic frames are never
    /// recalculated; live frames move between DSP_COMPLETE, NO_CLK_ANC,
    /// FUTURE, READY and OUTDATED based on the fused anchor.
    pub fn state_now(&self, anchor: Option<&AnchorLast>, now_ns: i64) -> FrameState {
        if self.synthetic() {
            return self.state();
        }

        let current = self.state();
        if !current.updatable() {
            return current;
        }

        let Some(anchor) = anchor else {
            self.state.transition(current, FrameState::NoClkAnc);
            return FrameState::NoClkAnc;
        };

        let sync_wait = anchor.sync_wait_ns(self.timestamp, now_ns);
        self.sync_wait_ns.store(sync_wait, Ordering::Release);

        if sync_wait < -InputInfo::LEAD_TIME_MIN_NS {
            self.state.terminate(FrameState::Outdated)
        } else if sync_wait <= InputInfo::LEAD_TIME_NS {
            if self.state.transition(current, FrameState::Ready) {
                FrameState::Ready
            } else {
                self.state()
            }
        } else {
            self.state.transition(current, FrameState::Future);
            FrameState::Future
        }
    }

    /// Refresh the cached sync wait without changing state; used between
    /// picking a frame and sending its message to measure drift.
    pub fn refresh_sync_wait(&self, anchor: &AnchorLast, now_ns: i64) -> i64 {
        if self.synthetic() {
            return self.sync_wait_ns();
        }
        let sync_wait = anchor.sync_wait_ns(self.timestamp, now_ns);
        self.sync_wait_ns.store(sync_wait, Ordering::Release);
        sync_wait
    }

    pub fn mark_rendered(&self) -> FrameState {
        let to = if self.silent() {
            FrameState::Silence
        } else {
            FrameState::Rendered
        };
        self.state.store(to);
        to
    }

    pub fn flush(&self) -> FrameState {
        self.state.terminate(FrameState::Flushed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// A frame in DSP_COMPLETE state, as if it had traversed the pipeline.
    pub fn dsp_complete_frame(seq_num: u32, timestamp: u32) -> Arc<Frame> {
        let frame = Frame {
            state: AtomicFrameState::new(FrameState::DspComplete),
            version: 2,
            padding: false,
            extension: false,
            ssrc_count: 0,
            mpt: 0x60,
            seq_num,
            timestamp,
            ssrc: 0xdead_beef,
            silence: AtomicBool::new(false),
            sync_wait_ns: AtomicI64::new(SYNC_WAIT_UNSET),
            sample_info: OnceLock::new(),
            peaks: OnceLock::new(),
        };
        Arc::new(frame)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::anchor::AnchorLast;

    fn packet(seq: u32, ts: u32, ssrc: u32, payload_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; RTP_HEADER_LEN + payload_len + TAG_LEN + NONCE_MINI_LEN];
        pkt[0] = 0x80; // V=2
        pkt[1] = (seq >> 16) as u8;
        pkt[2] = (seq >> 8) as u8;
        pkt[3] = seq as u8;
        pkt[4..8].copy_from_slice(&ts.to_be_bytes());
        pkt[8..12].copy_from_slice(&ssrc.to_be_bytes());
        pkt
    }

    fn anchor_at(rtp_time: u32, local_ns: i64) -> AnchorLast {
        AnchorLast {
            clock_id: 0xAAAA,
            rtp_time,
            local_ns,
            at_ns: local_ns,
            valid_at_ns: local_ns,
        }
    }

    #[test]
    fn header_parse_extracts_apple_fields() {
        let frame = Frame::from_packet(&packet(0x60_1234, 0x8000_0001, 0xdead_beef, 64)).unwrap();
        assert_eq!(frame.state(), FrameState::HeaderParsed);
        assert_eq!(frame.version, 2);
        assert_eq!(frame.seq_num, 0x60_1234);
        assert_eq!(frame.mpt, 0x60);
        assert_eq!(frame.timestamp, 0x8000_0001);
        assert_eq!(frame.ssrc, 0xdead_beef);
        assert!(!frame.synthetic());
    }

    #[test]
    fn aad_is_timestamp_then_ssrc() {
        let frame = Frame::from_packet(&packet(1, 0x0102_0304, 0x0a0b_0c0d, 8)).unwrap();
        assert_eq!(frame.aad(), [0x01, 0x02, 0x03, 0x04, 0x0a, 0x0b, 0x0c, 0x0d]);
    }

    #[test]
    fn non_v2_packets_are_rejected() {
        let mut pkt = packet(1, 2, 3, 8);
        pkt[0] = 0x40;
        assert!(matches!(
            Frame::from_packet(&pkt),
            Err(FrameError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn short_packets_are_rejected() {
        assert!(matches!(
            Frame::from_packet(&[0x80; 20]),
            Err(FrameError::PacketTooShort(20))
        ));
    }

    #[test]
    fn silence_frames_are_synthetic_and_ready() {
        let frame = Frame::silence();
        assert!(frame.synthetic());
        assert!(frame.silent());
        assert_eq!(frame.state(), FrameState::Ready);
        assert_eq!(frame.sync_wait_ns(), InputInfo::LEAD_TIME_NS);
        assert!(frame.peaks().is_none());
    }

    #[test]
    fn state_now_without_anchor_is_no_clk_anc() {
        let frame = test_support::dsp_complete_frame(1000, 88_200);
        assert_eq!(frame.state_now(None, 0), FrameState::NoClkAnc);
        // re-evaluable once an anchor shows up
        let anchor = anchor_at(88_200, 1_000_000);
        assert_eq!(frame.state_now(Some(&anchor), 1_000_000), FrameState::Ready);
    }

    #[test]
    fn state_now_ready_within_render_window() {
        let frame = test_support::dsp_complete_frame(1000, 88_200);
        let anchor = anchor_at(44_100, 0);
        // frame is due 1s after the anchor instant
        let due_ns = 44_100 * InputInfo::FRAME_NS;

        let now = due_ns - InputInfo::LEAD_TIME_NS / 2;
        assert_eq!(frame.state_now(Some(&anchor), now), FrameState::Ready);
        assert_eq!(frame.sync_wait_ns(), due_ns - now);
    }

    #[test]
    fn state_now_future_beyond_lead_time() {
        let frame = test_support::dsp_complete_frame(1000, 88_200);
        let anchor = anchor_at(44_100, 0);
        let state = frame.state_now(Some(&anchor), 0);
        assert_eq!(state, FrameState::Future);
    }

    #[test]
    fn state_now_outdated_past_tolerance() {
        let frame = test_support::dsp_complete_frame(1000, 88_200);
        let anchor = anchor_at(44_100, 0);
        let due_ns = 44_100 * InputInfo::FRAME_NS;

        let now = due_ns + InputInfo::LEAD_TIME_MIN_NS + 1_000_000;
        assert_eq!(frame.state_now(Some(&anchor), now), FrameState::Outdated);
        // absorbing
        assert_eq!(frame.state_now(Some(&anchor), due_ns), FrameState::Outdated);
    }

    #[test]
    fn rendered_marks_by_silence_flag() {
        let frame = test_support::dsp_complete_frame(1000, 88_200);
        frame.set_silent(false);
        assert_eq!(frame.mark_rendered(), FrameState::Rendered);

        let silent = Frame::silence();
        assert_eq!(silent.mark_rendered(), FrameState::Silence);
    }
}

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

//! Timebases used throughout the pipeline. Protocol and render timing use the
//! monotonic clock; wall time only appears in outbound desk messages.

use crate::error::{SystemClockError, SystemClockResult};
use libc::{CLOCK_MONOTONIC, CLOCK_REALTIME, clock_gettime, clockid_t, timespec};
use std::time::Duration;

/// Stream parameters of the single supported input format.
pub struct InputInfo;

impl InputInfo {
    pub const RATE: u32 = 44_100;
    pub const CHANNELS: usize = 2;
    pub const FRAMES_PER_PACKET: u32 = 1024;

    /// Nanoseconds covered by one audio frame (one sample per channel).
    pub const FRAME_NS: i64 = 1_000_000_000 / Self::RATE as i64;

    /// Horizon at which a frame must be ready before its render instant.
    pub const LEAD_TIME_NS: i64 = Self::FRAME_NS * Self::FRAMES_PER_PACKET as i64;
    pub const LEAD_TIME_US: i64 = Self::LEAD_TIME_NS / 1_000;

    /// Frames rendered up to this far past their instant are still emitted.
    pub const LEAD_TIME_MIN_NS: i64 = (Self::LEAD_TIME_NS * 15) / 100;

    pub const fn lead_time() -> Duration {
        Duration::from_nanos(Self::LEAD_TIME_NS as u64)
    }
}

pub fn system_time_monotonic() -> SystemClockResult<timespec> {
    system_time_for_clock_id(CLOCK_MONOTONIC)
}

pub fn system_time_real() -> SystemClockResult<timespec> {
    system_time_for_clock_id(CLOCK_REALTIME)
}

fn system_time_for_clock_id(clock_id: clockid_t) -> SystemClockResult<timespec> {
    let mut tp = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { clock_gettime(clock_id, &mut tp) } == -1 {
        Err(SystemClockError::ClockGetTime(
            "could not get system time".to_owned(),
        ))
    } else {
        Ok(tp)
    }
}

fn nanos(tp: timespec) -> i64 {
    tp.tv_sec * 1_000_000_000 + tp.tv_nsec
}

/// Nanoseconds on the local monotonic timeline, the timeline all anchor and
/// sync-wait math is expressed in.
pub fn monotonic_ns() -> i64 {
    system_time_monotonic().map(nanos).unwrap_or_default()
}

pub fn monotonic_us() -> i64 {
    monotonic_ns() / 1_000
}

pub fn realtime_us() -> i64 {
    system_time_real().map(nanos).unwrap_or_default() / 1_000
}

/// Local render instant of an RTP timestamp relative to an anchor sample.
pub fn frame_local_ns(anchor_local_ns: i64, anchor_rtp: u32, rtp_ts: u32) -> i64 {
    let frame_diff = rtp_ts.wrapping_sub(anchor_rtp) as i32 as i64;
    anchor_local_ns + frame_diff * InputInfo::FRAME_NS
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lead_time_is_1024_frames() {
        assert_eq!(InputInfo::LEAD_TIME_NS, 23_219_200);
        assert_eq!(InputInfo::LEAD_TIME_US, 23_219);
    }

    #[test]
    fn frame_local_time_scales_by_sample_rate() {
        // one full second of audio ahead of the anchor
        let local = frame_local_ns(1_000, 10_000, 10_000 + InputInfo::RATE);
        assert_eq!(local, 1_000 + InputInfo::FRAME_NS * InputInfo::RATE as i64);
    }

    #[test]
    fn frame_local_time_handles_rtp_wraparound() {
        let local = frame_local_ns(0, u32::MAX - 99, 100);
        assert_eq!(local, 200 * InputInfo::FRAME_NS);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}

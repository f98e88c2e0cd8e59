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

//! Pipeline counters. External metric shipping is out of scope; the watchdog
//! logs snapshots of these and uses them to judge liveness.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
pub struct StatsInner {
    pub rtsp_requests: AtomicU64,
    pub frames_ingested: AtomicU64,
    pub frames_deciphered: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_dsp_complete: AtomicU64,
    pub frames_rendered: AtomicU64,
    pub frames_silent: AtomicU64,
    pub frames_outdated: AtomicU64,
    pub frames_flushed: AtomicU64,
    pub decipher_failures: AtomicU64,
    pub decode_failures: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct Stats(Arc<StatsInner>);

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: impl Fn(&StatsInner) -> &AtomicU64) {
        counter(&self.0).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: impl Fn(&StatsInner) -> &AtomicU64) -> u64 {
        counter(&self.0).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rtsp_requests: self.get(|s| &s.rtsp_requests),
            frames_ingested: self.get(|s| &s.frames_ingested),
            frames_rendered: self.get(|s| &s.frames_rendered),
            frames_silent: self.get(|s| &s.frames_silent),
            frames_outdated: self.get(|s| &s.frames_outdated),
            frames_flushed: self.get(|s| &s.frames_flushed),
            decipher_failures: self.get(|s| &s.decipher_failures),
            decode_failures: self.get(|s| &s.decode_failures),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rtsp_requests: u64,
    pub frames_ingested: u64,
    pub frames_rendered: u64,
    pub frames_silent: u64,
    pub frames_outdated: u64,
    pub frames_flushed: u64,
    pub decipher_failures: u64,
    pub decode_failures: u64,
}

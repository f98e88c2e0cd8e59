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

//! Timestamp-ordered staging between DSP completion and render dispatch.
//!
//! Frames are stored in spools: contiguous runs of adjacent sequence
//! numbers. A gap or rollover opens a new spool; the back spool is the live
//! one. A flush window that points into the future is latched and applied
//! as frames arrive.

use crate::{
    anchor::AnchorLast,
    frame::{Frame, state::FrameState},
    stats::Stats,
};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest {
    pub until_seq: u32,
    pub until_ts: u32,
}

impl FlushRequest {
    pub fn all() -> Self {
        Self {
            until_seq: u32::MAX,
            until_ts: u32::MAX,
        }
    }

    /// A frame is discarded when both its sequence number and timestamp lie
    /// inside the window.
    pub fn covers(&self, seq_num: u32, timestamp: u32) -> bool {
        seq_num <= self.until_seq && timestamp <= self.until_ts
    }
}

#[derive(Debug, Default)]
struct Spool {
    frames: VecDeque<Arc<Frame>>,
}

impl Spool {
    fn back_seq(&self) -> Option<u32> {
        self.frames.back().map(|f| f.seq_num)
    }
}

#[derive(Debug, Default)]
pub struct Racked {
    spools: VecDeque<Spool>,
    latched_flush: Option<FlushRequest>,
    stats: Stats,
}

impl Racked {
    pub fn new(stats: Stats) -> Self {
        Self {
            spools: VecDeque::new(),
            latched_flush: None,
            stats,
        }
    }

    /// Store a frame, appending to the live spool when its sequence number
    /// is adjacent, otherwise opening a new spool. Returns false when the
    /// frame was covered by a latched flush or is a duplicate.
    pub fn insert(&mut self, frame: Arc<Frame>) -> bool {
        if let Some(flush) = self.latched_flush {
            if flush.covers(frame.seq_num, frame.timestamp) {
                frame.flush();
                self.stats.incr(|s| &s.frames_flushed);
                return false;
            }
            // first frame past the window consumes the latch
            debug!("latched flush satisfied at sn={}", frame.seq_num);
            self.latched_flush = None;
        }

        match self.spools.back_mut() {
            Some(spool) if spool.back_seq() == Some(frame.seq_num.wrapping_sub(1)) => {
                spool.frames.push_back(frame);
            }
            Some(spool) if spool.back_seq() == Some(frame.seq_num) => {
                // identical (seq, ts) frames may not coexist
                return false;
            }
            _ => {
                let mut spool = Spool::default();
                spool.frames.push_back(frame);
                self.spools.push_back(spool);
            }
        }
        true
    }

    /// Apply a flush window: keep only frames past it. A window whose
    /// `until_seq` lies beyond every known frame references the future and
    /// is latched for ingress, whether or not this call also discarded
    /// already-known frames.
    pub fn flush(&mut self, request: FlushRequest) {
        let count_before = self.size();
        let max_seq = self
            .spools
            .iter()
            .flat_map(|s| s.frames.iter())
            .map(|f| f.seq_num)
            .max();

        for spool in &mut self.spools {
            spool.frames.retain(|f| {
                if request.covers(f.seq_num, f.timestamp) {
                    f.flush();
                    false
                } else {
                    true
                }
            });
        }
        self.spools.retain(|s| !s.frames.is_empty());

        let flushed = count_before - self.size();
        for _ in 0..flushed {
            self.stats.incr(|s| &s.frames_flushed);
        }
        info!("flushed {flushed} frame(s), {} remain", self.size());

        // an until_seq past the sequence space is a flush-everything-now,
        // not a reference to a frame that could still arrive
        let future = request.until_seq <= crate::frame::SEQ_NUM_MASK
            && max_seq.is_none_or(|max| request.until_seq > max);
        if future {
            info!(
                "latching future flush until_seq={} until_ts={}",
                request.until_seq, request.until_ts
            );
            self.latched_flush = Some(request);
        }
    }

    /// Earliest frame whose render window has opened, moved out of the
    /// queue. Outdated and failed frames encountered on the way are
    /// discarded eagerly; frames not yet due stay put.
    pub fn peek_due(&mut self, anchor: Option<&AnchorLast>, now_ns: i64) -> Option<Arc<Frame>> {
        loop {
            let spool = self.spools.front_mut()?;
            let Some(frame) = spool.frames.front() else {
                self.spools.pop_front();
                continue;
            };

            match frame.state_now(anchor, now_ns) {
                FrameState::Ready => {
                    let frame = spool.frames.pop_front();
                    if spool.frames.is_empty() {
                        self.spools.pop_front();
                    }
                    return frame;
                }
                FrameState::Outdated => {
                    self.stats.incr(|s| &s.frames_outdated);
                    spool.frames.pop_front();
                    if spool.frames.is_empty() {
                        self.spools.pop_front();
                    }
                }
                FrameState::DecipherFail | FrameState::DecodeFail | FrameState::Flushed => {
                    spool.frames.pop_front();
                    if spool.frames.is_empty() {
                        self.spools.pop_front();
                    }
                }
                // not yet due, still decoding, or no usable anchor
                _ => return None,
            }
        }
    }

    pub fn size(&self) -> usize {
        self.spools.iter().map(|s| s.frames.len()).sum()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    pub fn spool_count(&self) -> usize {
        self.spools.len()
    }

    pub fn clear(&mut self) {
        self.spools.clear();
        self.latched_flush = None;
    }
}

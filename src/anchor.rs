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

//! Reconciliation of sender anchor declarations with the PTP master clock.
//!
//! Three slots: RECENT holds the latest sender declaration, LAST the best
//! usable fused reading, ACTUAL the reconciliation target. Fusing only
//! succeeds while the master clock is usable and the sender references the
//! same clock; a sender clock that changes quickly invalidates LAST so a
//! flapping source cannot jitter the render timeline.

use crate::{
    clock::{ClockInfo, MASTER_MIN_NS},
    time,
};
use std::sync::Mutex;
use tracing::{debug, info};

/// Sender-declared mapping: at sender time `anchor_time_ns` the stream's RTP
/// timestamp was `rtp_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorData {
    pub clock_id: u64,
    pub flags: u64,
    pub rtp_time: u32,
    pub anchor_time_ns: i64,
}

impl AnchorData {
    pub fn new(clock_id: u64, secs: u64, fracs: u64, rtp_time: u32, flags: u64) -> Self {
        // fractional part is a 64 bit binary fraction of a second
        let frac_ns = ((fracs >> 32) * 1_000_000_000) >> 32;
        Self {
            clock_id,
            flags,
            rtp_time,
            anchor_time_ns: (secs * 1_000_000_000 + frac_ns) as i64,
        }
    }
}

/// Best usable fused reading: RECENT localized through the master clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorLast {
    pub clock_id: u64,
    pub rtp_time: u32,
    /// Local monotonic instant at which `rtp_time` plays.
    pub local_ns: i64,
    /// When this reading was produced.
    pub at_ns: i64,
    /// When this reading first became valid.
    pub valid_at_ns: i64,
}

impl AnchorLast {
    /// Duration until `rtp_ts` is due, negative once its instant has passed.
    pub fn sync_wait_ns(&self, rtp_ts: u32, now_ns: i64) -> i64 {
        time::frame_local_ns(self.local_ns, self.rtp_time, rtp_ts) - now_ns
    }
}

#[derive(Debug, Default)]
struct Slots {
    recent: Option<Recent>,
    last: Option<AnchorLast>,
    actual: Option<AnchorData>,
    is_new: bool,
}

#[derive(Debug, Clone, Copy)]
struct Recent {
    data: AnchorData,
    at_ns: i64,
}

#[derive(Debug, Default)]
pub struct Anchor {
    slots: Mutex<Slots>,
}

impl Anchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a sender anchor declaration.
    pub fn save(&self, data: AnchorData, now_ns: i64) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };

        let clock_changed = slots
            .recent
            .map(|r| r.data.clock_id != data.clock_id)
            .unwrap_or(true);
        let details_changed = slots
            .recent
            .map(|r| r.data != data)
            .unwrap_or(false);

        if clock_changed {
            info!("new anchor clock 0x{:x}", data.clock_id);
            slots.is_new = true;
        }

        // a declaration that changes before LAST had 5s to settle is a
        // flapping source, drop the fused reading
        if clock_changed || details_changed {
            if let Some(last) = slots.last {
                if now_ns - last.valid_at_ns < MASTER_MIN_NS {
                    debug!("anchor changed before settling, invalidating fused reading");
                    slots.last = None;
                }
            }
        }

        slots.recent = Some(Recent { data, at_ns: now_ns });
        slots.actual = Some(data);
    }

    /// Produce the current usable fused anchor, or `None` while reconciling.
    pub fn current(&self, clock: &ClockInfo, now_ns: i64) -> Option<AnchorLast> {
        let Ok(mut slots) = self.slots.lock() else {
            return None;
        };

        if !clock.ok(now_ns) {
            return None;
        }

        let recent = slots.recent?;

        if recent.data.clock_id == clock.clock_id {
            // prefer the master clock when anchor and master match, but only
            // once it has been master long enough to trust
            if !clock.stable(now_ns) {
                return None;
            }

            let valid_at_ns = slots.last.map(|l| l.valid_at_ns).unwrap_or(now_ns);
            let fused = AnchorLast {
                clock_id: recent.data.clock_id,
                rtp_time: recent.data.rtp_time,
                local_ns: clock.local_time(recent.data.anchor_time_ns),
                at_ns: now_ns,
                valid_at_ns,
            };

            if slots.is_new {
                slots.is_new = false;
                info!(
                    "anchor valid: clock=0x{:x} rtp_time={}",
                    fused.clock_id, fused.rtp_time
                );
            }

            slots.last = Some(fused);
            return Some(fused);
        }

        // sender references a clock other than the PTP master; ride the
        // previous fused reading briefly, nudged by the current offset
        match slots.last {
            Some(last) if now_ns - last.valid_at_ns < MASTER_MIN_NS => {
                let adjusted = AnchorLast {
                    local_ns: last.local_ns + clock.raw_offset,
                    at_ns: now_ns,
                    ..last
                };
                Some(adjusted)
            }
            _ => None,
        }
    }

    /// The sender anchor most recently declared, unfused.
    pub fn recent(&self) -> Option<AnchorData> {
        self.slots.lock().ok().and_then(|s| s.recent.map(|r| r.data))
    }

    pub fn teardown(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            *slots = Slots::default();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::clock::AGE_MAX_NS;

    const NOW: i64 = 100_000_000_000;

    fn stable_clock(clock_id: u64) -> ClockInfo {
        ClockInfo {
            clock_id,
            master_ip: "10.0.0.1".into(),
            sample_time: NOW - 1_000,
            raw_offset: 500_000,
            master_start_time: NOW - MASTER_MIN_NS - 1,
        }
    }

    fn young_clock(clock_id: u64) -> ClockInfo {
        ClockInfo {
            master_start_time: NOW - 1_000_000,
            ..stable_clock(clock_id)
        }
    }

    #[test]
    fn invalid_without_any_declaration() {
        let anchor = Anchor::new();
        assert!(anchor.current(&stable_clock(0xAAAA), NOW).is_none());
    }

    #[test]
    fn invalid_when_clock_not_ok() {
        let anchor = Anchor::new();
        anchor.save(AnchorData::new(0xAAAA, 90, 0, 4096, 0), NOW);

        let mut clock = stable_clock(0xAAAA);
        clock.sample_time = NOW - AGE_MAX_NS - 1;
        assert!(anchor.current(&clock, NOW).is_none());
    }

    #[test]
    fn invalid_while_master_is_young() {
        let anchor = Anchor::new();
        anchor.save(AnchorData::new(0xAAAA, 90, 0, 4096, 0), NOW);
        assert!(anchor.current(&young_clock(0xAAAA), NOW).is_none());
    }

    #[test]
    fn fuses_when_sender_matches_stable_master() {
        let anchor = Anchor::new();
        let data = AnchorData::new(0xAAAA, 90, 0, 4096, 0);
        anchor.save(data, NOW);

        let clock = stable_clock(0xAAAA);
        let last = anchor.current(&clock, NOW).unwrap();
        assert_eq!(last.clock_id, 0xAAAA);
        assert_eq!(last.rtp_time, 4096);
        assert_eq!(last.local_ns, clock.local_time(data.anchor_time_ns));
    }

    #[test]
    fn sync_wait_follows_sample_rate() {
        let anchor = Anchor::new();
        anchor.save(AnchorData::new(0xAAAA, 90, 0, 4096, 0), NOW);
        let last = anchor.current(&stable_clock(0xAAAA), NOW).unwrap();

        let one_second_later = last.sync_wait_ns(4096 + 44_100, last.local_ns);
        assert_eq!(one_second_later, 44_100 * crate::time::InputInfo::FRAME_NS);
    }

    #[test]
    fn flapping_sender_clock_invalidates_for_five_seconds() {
        let anchor = Anchor::new();
        anchor.save(AnchorData::new(0xAAAA, 90, 0, 4096, 0), NOW);

        let clock = stable_clock(0xAAAA);
        assert!(anchor.current(&clock, NOW).is_some());

        // 100ms later the sender declares a different clock
        let t1 = NOW + 100_000_000;
        anchor.save(AnchorData::new(0xBBBB, 91, 0, 8192, 0), t1);

        // neither the old fused reading nor the new clock is usable until
        // the master follows and stabilizes
        assert!(anchor.current(&clock, t1).is_none());

        let mut flipped = stable_clock(0xBBBB);
        flipped.master_start_time = t1;
        for dt in [0i64, 1_000_000_000, 4_900_000_000] {
            flipped.sample_time = t1 + dt - 1_000;
            assert!(anchor.current(&flipped, t1 + dt).is_none(), "dt={dt}");
        }

        flipped.sample_time = t1 + MASTER_MIN_NS + 1_000;
        assert!(anchor.current(&flipped, t1 + MASTER_MIN_NS + 2_000).is_some());
    }

    #[test]
    fn foreign_master_rides_recent_fused_reading() {
        let anchor = Anchor::new();
        anchor.save(AnchorData::new(0xAAAA, 90, 0, 4096, 0), NOW);

        let clock = stable_clock(0xAAAA);
        let fused = anchor.current(&clock, NOW).unwrap();

        // master flips to a clock the sender does not reference
        let foreign = stable_clock(0xCCCC);
        let t1 = NOW + 1_000_000_000;
        let ride = anchor.current(&foreign, t1).unwrap();
        assert_eq!(ride.clock_id, 0xAAAA);
        assert_eq!(ride.local_ns, fused.local_ns + foreign.raw_offset);

        // but not after the fused reading has aged out
        let t2 = fused.valid_at_ns + MASTER_MIN_NS + 1;
        assert!(anchor.current(&foreign, t2).is_none());
    }

    #[test]
    fn teardown_clears_all_slots() {
        let anchor = Anchor::new();
        anchor.save(AnchorData::new(0xAAAA, 90, 0, 4096, 0), NOW);
        anchor.teardown();
        assert!(anchor.recent().is_none());
        assert!(anchor.current(&stable_clock(0xAAAA), NOW).is_none());
    }
}

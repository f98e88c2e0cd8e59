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

//! Spectral peaks of one frame. Peaks per channel live in a mapping ordered
//! by descending magnitude; the major peak is the first entry. Immutable
//! once DSP completes.

use std::collections::BTreeMap;

pub const MAG_FLOOR: f32 = 0.9;
pub const MAG_CEIL: f32 = 128.0;
pub const FREQ_MIN: f32 = 40.0;
pub const FREQ_MAX: f32 = 11_500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Left = 0,
    Right = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Peak {
    pub freq: f32,
    pub mag: f32,
}

impl Peak {
    pub fn new(freq: f32, mag: f32) -> Self {
        Self { freq, mag }
    }

    pub fn usable(&self) -> bool {
        (MAG_FLOOR..=MAG_CEIL).contains(&self.mag) && (FREQ_MIN..=FREQ_MAX).contains(&self.freq)
    }
}

/// Map key ordering magnitudes descending with a total order over f32.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MagKey(f32);

impl Eq for MagKey {}

impl PartialOrd for MagKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MagKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.total_cmp(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Peaks {
    maps: [BTreeMap<MagKey, Peak>; 2],
}

impl Peaks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peak when it lies within the usable bounds.
    pub fn insert(&mut self, channel: Channel, peak: Peak) -> bool {
        if !peak.usable() {
            return false;
        }
        self.maps[channel as usize]
            .insert(MagKey(peak.mag), peak)
            .is_none()
    }

    /// Highest magnitude peak of a channel.
    pub fn major(&self, channel: Channel) -> Option<&Peak> {
        self.maps[channel as usize].values().next()
    }

    pub fn size(&self, channel: Channel) -> usize {
        self.maps[channel as usize].len()
    }

    fn empty(&self, channel: Channel) -> bool {
        self.maps[channel as usize].is_empty()
    }

    /// Audible means both channels carry at least one in-bounds peak.
    pub fn audible(&self) -> bool {
        !self.silence()
    }

    pub fn silence(&self) -> bool {
        self.empty(Channel::Left) || self.empty(Channel::Right)
    }

    /// Peaks of a channel in descending magnitude order.
    pub fn iter(&self, channel: Channel) -> impl Iterator<Item = &Peak> {
        self.maps[channel as usize].values()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn major_peak_is_highest_magnitude() {
        let mut peaks = Peaks::new();
        assert!(peaks.insert(Channel::Left, Peak::new(440.0, 3.5)));
        assert!(peaks.insert(Channel::Left, Peak::new(880.0, 12.0)));
        assert!(peaks.insert(Channel::Left, Peak::new(1320.0, 1.1)));

        let major = peaks.major(Channel::Left).unwrap();
        assert_eq!(major.freq, 880.0);
        assert_eq!(major.mag, 12.0);

        let mags: Vec<f32> = peaks.iter(Channel::Left).map(|p| p.mag).collect();
        assert_eq!(mags, vec![12.0, 3.5, 1.1]);
    }

    #[test]
    fn out_of_bounds_peaks_are_rejected() {
        let mut peaks = Peaks::new();
        assert!(!peaks.insert(Channel::Left, Peak::new(440.0, 0.5)));
        assert!(!peaks.insert(Channel::Left, Peak::new(440.0, 300.0)));
        assert!(!peaks.insert(Channel::Left, Peak::new(20.0, 5.0)));
        assert!(!peaks.insert(Channel::Left, Peak::new(15_000.0, 5.0)));
        assert_eq!(peaks.size(Channel::Left), 0);
    }

    #[test]
    fn audible_requires_both_channels() {
        let mut peaks = Peaks::new();
        assert!(peaks.silence());

        peaks.insert(Channel::Left, Peak::new(440.0, 5.0));
        assert!(!peaks.audible());

        peaks.insert(Channel::Right, Peak::new(440.0, 5.0));
        assert!(peaks.audible());
    }
}

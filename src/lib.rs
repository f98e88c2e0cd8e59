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

//! Pierre is an AirPlay 2 receiver that turns a sender's audio stream into
//! per-frame spectral peaks and drives a DMX lighting rig in sync with
//! playback.

pub mod anchor;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod net;
pub mod racked;
pub mod render;
pub mod rtsp;
pub mod stats;
pub mod supervisor;
pub mod time;

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

//! Frame lifecycle as an atomic state machine. Workers advance a frame with
//! compare-exchange so a flush or teardown can short-circuit work that is
//! already obsolete.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FrameState {
    None = 0,
    HeaderParsed = 1,
    Deciphered = 2,
    Decoded = 3,
    DspInProgress = 4,
    DspComplete = 5,
    // re-evaluable holding states
    NoClkAnc = 6,
    Future = 7,
    // renderable / rendered
    Ready = 8,
    Rendered = 9,
    Silence = 10,
    Sentinel = 11,
    // terminal error states
    DecipherFail = 12,
    DecodeFail = 13,
    Outdated = 14,
    Flushed = 15,
}

impl FrameState {
    fn from_u8(v: u8) -> FrameState {
        match v {
            1 => FrameState::HeaderParsed,
            2 => FrameState::Deciphered,
            3 => FrameState::Decoded,
            4 => FrameState::DspInProgress,
            5 => FrameState::DspComplete,
            6 => FrameState::NoClkAnc,
            7 => FrameState::Future,
            8 => FrameState::Ready,
            9 => FrameState::Rendered,
            10 => FrameState::Silence,
            11 => FrameState::Sentinel,
            12 => FrameState::DecipherFail,
            13 => FrameState::DecodeFail,
            14 => FrameState::Outdated,
            15 => FrameState::Flushed,
            _ => FrameState::None,
        }
    }

    /// States the render-time evaluation may move away from again.
    pub fn updatable(&self) -> bool {
        matches!(
            self,
            FrameState::DspComplete | FrameState::NoClkAnc | FrameState::Future
        )
    }

    pub fn ready(&self) -> bool {
        *self == FrameState::Ready
    }

    pub fn renderable(&self) -> bool {
        matches!(self, FrameState::Ready | FrameState::Silence)
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            FrameState::DecipherFail
                | FrameState::DecodeFail
                | FrameState::Outdated
                | FrameState::Flushed
        )
    }

    pub fn flushed(&self) -> bool {
        *self == FrameState::Flushed
    }

    pub fn outdated(&self) -> bool {
        *self == FrameState::Outdated
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameState::None => "NONE",
            FrameState::HeaderParsed => "HEADER_PARSED",
            FrameState::Deciphered => "DECIPHERED",
            FrameState::Decoded => "DECODED",
            FrameState::DspInProgress => "DSP_IN_PROGRESS",
            FrameState::DspComplete => "DSP_COMPLETE",
            FrameState::NoClkAnc => "NO_CLK_ANC",
            FrameState::Future => "FUTURE",
            FrameState::Ready => "READY",
            FrameState::Rendered => "RENDERED",
            FrameState::Silence => "SILENCE",
            FrameState::Sentinel => "SENTINEL",
            FrameState::DecipherFail => "DECIPHER_FAIL",
            FrameState::DecodeFail => "DECODE_FAIL",
            FrameState::Outdated => "OUTDATED",
            FrameState::Flushed => "FLUSHED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct AtomicFrameState(AtomicU8);

impl AtomicFrameState {
    pub fn new(state: FrameState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> FrameState {
        FrameState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: FrameState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Store-if-equal; returns whether the transition happened.
    pub fn transition(&self, from: FrameState, to: FrameState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark terminal unless already terminal; terminal states absorb.
    pub fn terminate(&self, to: FrameState) -> FrameState {
        let mut current = self.load();
        loop {
            if current.terminal() {
                return current;
            }
            match self.0.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return to,
                Err(actual) => current = FrameState::from_u8(actual),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transition_is_store_if_equal() {
        let state = AtomicFrameState::new(FrameState::Deciphered);
        assert!(state.transition(FrameState::Deciphered, FrameState::Decoded));
        assert!(!state.transition(FrameState::Deciphered, FrameState::DspInProgress));
        assert_eq!(state.load(), FrameState::Decoded);
    }

    #[test]
    fn terminal_states_absorb() {
        let state = AtomicFrameState::new(FrameState::DspComplete);
        assert_eq!(state.terminate(FrameState::Outdated), FrameState::Outdated);
        // a later flush does not overwrite the outdated record
        assert_eq!(state.terminate(FrameState::Flushed), FrameState::Outdated);
        assert!(state.load().outdated());
    }

    #[test]
    fn updatable_set_is_narrow() {
        assert!(FrameState::DspComplete.updatable());
        assert!(FrameState::NoClkAnc.updatable());
        assert!(FrameState::Future.updatable());
        assert!(!FrameState::Ready.updatable());
        assert!(!FrameState::Flushed.updatable());
    }
}

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

//! TLV8 codec for the HomeKit pairing sub-protocol. Values longer than 255
//! bytes are carried as consecutive fragments of the same type and coalesced
//! on parse.

use crate::error::{CipherError, CipherResult};

pub mod tag {
    pub const METHOD: u8 = 0x00;
    pub const IDENTIFIER: u8 = 0x01;
    pub const SALT: u8 = 0x02;
    pub const PUBLIC_KEY: u8 = 0x03;
    pub const PROOF: u8 = 0x04;
    pub const ENCRYPTED_DATA: u8 = 0x05;
    pub const STATE: u8 = 0x06;
    pub const ERROR: u8 = 0x07;
    pub const SIGNATURE: u8 = 0x0a;
}

pub mod err {
    pub const AUTHENTICATION: u8 = 0x02;
    pub const UNKNOWN: u8 = 0x01;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tlv8 {
    entries: Vec<(u8, Vec<u8>)>,
}

impl Tlv8 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(data: &[u8]) -> CipherResult<Self> {
        let mut entries: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut at = 0;

        while at < data.len() {
            if at + 2 > data.len() {
                return Err(CipherError::InvalidTlv);
            }
            let typ = data[at];
            let len = data[at + 1] as usize;
            at += 2;

            if at + len > data.len() {
                return Err(CipherError::InvalidTlv);
            }
            let value = &data[at..at + len];
            at += len;

            // a full-length fragment followed by the same type continues it
            match entries.last_mut() {
                Some((prev_typ, prev_val)) if *prev_typ == typ && prev_val.len() % 255 == 0 && !prev_val.is_empty() => {
                    prev_val.extend_from_slice(value);
                }
                _ => entries.push((typ, value.to_vec())),
            }
        }

        Ok(Self { entries })
    }

    pub fn get(&self, typ: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == typ)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_u8(&self, typ: u8) -> Option<u8> {
        match self.get(typ) {
            Some([b]) => Some(*b),
            _ => None,
        }
    }

    pub fn push(&mut self, typ: u8, value: impl AsRef<[u8]>) -> &mut Self {
        self.entries.push((typ, value.as_ref().to_vec()));
        self
    }

    pub fn push_u8(&mut self, typ: u8, value: u8) -> &mut Self {
        self.push(typ, [value])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (typ, value) in &self.entries {
            if value.is_empty() {
                out.push(*typ);
                out.push(0);
                continue;
            }
            for chunk in value.chunks(255) {
                out.push(*typ);
                out.push(chunk.len() as u8);
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    /// A one-entry error TLV, the body of failed pair-step replies.
    pub fn error(state: u8, code: u8) -> Vec<u8> {
        let mut tlv = Self::new();
        tlv.push_u8(tag::STATE, state).push_u8(tag::ERROR, code);
        tlv.encode()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn short_entries_round_trip() {
        let mut tlv = Tlv8::new();
        tlv.push_u8(tag::STATE, 2)
            .push(tag::SALT, [0xaa; 16])
            .push(tag::PUBLIC_KEY, [0x55; 32]);

        let parsed = Tlv8::parse(&tlv.encode()).unwrap();
        assert_eq!(parsed.get_u8(tag::STATE), Some(2));
        assert_eq!(parsed.get(tag::SALT), Some(&[0xaa; 16][..]));
        assert_eq!(parsed.get(tag::PUBLIC_KEY), Some(&[0x55; 32][..]));
    }

    #[test]
    fn long_values_fragment_and_coalesce() {
        let value = (0..=255u8).cycle().take(600).collect::<Vec<_>>();
        let mut tlv = Tlv8::new();
        tlv.push(tag::PUBLIC_KEY, &value);

        let encoded = tlv.encode();
        // 600 bytes -> fragments of 255 + 255 + 90
        assert_eq!(encoded.len(), 600 + 3 * 2);

        let parsed = Tlv8::parse(&encoded).unwrap();
        assert_eq!(parsed.get(tag::PUBLIC_KEY), Some(value.as_slice()));
    }

    #[test]
    fn adjacent_distinct_types_stay_separate() {
        let mut tlv = Tlv8::new();
        tlv.push_u8(tag::STATE, 4).push_u8(tag::ERROR, err::AUTHENTICATION);

        let parsed = Tlv8::parse(&tlv.encode()).unwrap();
        assert_eq!(parsed.get_u8(tag::STATE), Some(4));
        assert_eq!(parsed.get_u8(tag::ERROR), Some(err::AUTHENTICATION));
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(Tlv8::parse(&[tag::SALT, 16, 0xaa]).is_err());
        assert!(Tlv8::parse(&[tag::SALT]).is_err());
    }
}

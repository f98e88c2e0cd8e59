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

//! Key/value access against Apple binary property lists plus the builders
//! used for reply bodies.

use crate::error::{RtspError, RtspResult};
use plist::{Dictionary, Value};
use std::io::Cursor;

#[derive(Debug, Clone)]
pub struct Aplist(Value);

impl Aplist {
    pub fn from_bytes(data: &[u8]) -> RtspResult<Self> {
        Value::from_reader(Cursor::new(data))
            .map(Aplist)
            .map_err(|_| RtspError::InvalidPlist)
    }

    pub fn empty() -> Self {
        Aplist(Value::Dictionary(Dictionary::new()))
    }

    fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut node = &self.0;
        for key in path {
            node = node.as_dictionary()?.get(key)?;
        }
        Some(node)
    }

    pub fn boolean(&self, path: &[&str]) -> Option<bool> {
        self.lookup(path)?.as_boolean()
    }

    pub fn uint(&self, path: &[&str]) -> Option<u64> {
        match self.lookup(path)? {
            Value::Integer(i) => i.as_unsigned().or_else(|| i.as_signed().map(|s| s as u64)),
            _ => None,
        }
    }

    pub fn string(&self, path: &[&str]) -> Option<&str> {
        self.lookup(path)?.as_string()
    }

    pub fn data(&self, path: &[&str]) -> Option<&[u8]> {
        match self.lookup(path)? {
            Value::Data(d) => Some(d.as_slice()),
            _ => None,
        }
    }

    pub fn string_array(&self, path: &[&str]) -> Option<Vec<String>> {
        let array = self.lookup(path)?.as_array()?;
        Some(
            array
                .iter()
                .filter_map(|v| v.as_string().map(ToOwned::to_owned))
                .collect(),
        )
    }

    pub fn dict_array(&self, path: &[&str]) -> Option<Vec<Aplist>> {
        let array = self.lookup(path)?.as_array()?;
        Some(
            array
                .iter()
                .filter(|v| v.as_dictionary().is_some())
                .map(|v| Aplist(v.clone()))
                .collect(),
        )
    }

    pub fn contains(&self, path: &[&str]) -> bool {
        self.lookup(path).is_some()
    }
}

/// Builder for reply dictionaries, serialized as `bplist00`.
#[derive(Debug, Default)]
pub struct AplistBuilder {
    dict: Dictionary,
}

impl AplistBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uint(mut self, key: &str, value: u64) -> Self {
        self.dict.insert(key.to_owned(), Value::Integer(value.into()));
        self
    }

    pub fn string(mut self, key: &str, value: &str) -> Self {
        self.dict.insert(key.to_owned(), Value::String(value.to_owned()));
        self
    }

    pub fn boolean(mut self, key: &str, value: bool) -> Self {
        self.dict.insert(key.to_owned(), Value::Boolean(value));
        self
    }

    pub fn data(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.dict.insert(key.to_owned(), Value::Data(value.into()));
        self
    }

    pub fn dict_array(mut self, key: &str, values: Vec<AplistBuilder>) -> Self {
        let array = values
            .into_iter()
            .map(|b| Value::Dictionary(b.dict))
            .collect();
        self.dict.insert(key.to_owned(), Value::Array(array));
        self
    }

    pub fn string_array(mut self, key: &str, values: &[&str]) -> Self {
        let array = values
            .iter()
            .map(|s| Value::String((*s).to_owned()))
            .collect();
        self.dict.insert(key.to_owned(), Value::Array(array));
        self
    }

    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // serializing an in-memory dictionary cannot fail
        Value::Dictionary(self.dict.clone())
            .to_writer_binary(&mut out)
            .ok();
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn builder_output_parses_back() {
        let bytes = AplistBuilder::new()
            .string("timingProtocol", "PTP")
            .uint("type", 103)
            .boolean("groupContainsGroupLeader", true)
            .data("shk", vec![9u8; 32])
            .string_array("Addresses", &["10.0.0.7", "10.0.0.8"])
            .to_binary();

        assert_eq!(&bytes[..8], b"bplist00");

        let plist = Aplist::from_bytes(&bytes).unwrap();
        assert_eq!(plist.string(&["timingProtocol"]), Some("PTP"));
        assert_eq!(plist.uint(&["type"]), Some(103));
        assert_eq!(plist.boolean(&["groupContainsGroupLeader"]), Some(true));
        assert_eq!(plist.data(&["shk"]), Some(&[9u8; 32][..]));
        assert_eq!(
            plist.string_array(&["Addresses"]).unwrap(),
            vec!["10.0.0.7", "10.0.0.8"]
        );
    }

    #[test]
    fn nested_dict_and_dict_arrays() {
        let stream = AplistBuilder::new().uint("type", 103).uint("spf", 1024);
        let bytes = AplistBuilder::new()
            .dict_array("streams", vec![stream])
            .to_binary();

        let plist = Aplist::from_bytes(&bytes).unwrap();
        let streams = plist.dict_array(&["streams"]).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].uint(&["spf"]), Some(1024));
        assert_eq!(streams[0].uint(&["type"]), Some(103));
    }

    #[test]
    fn missing_paths_are_none() {
        let plist = Aplist::from_bytes(&AplistBuilder::new().to_binary()).unwrap();
        assert_eq!(plist.string(&["timingPeerInfo", "ID"]), None);
        assert!(!plist.contains(&["streams"]));
    }

    #[test]
    fn junk_is_invalid_plist() {
        assert!(matches!(
            Aplist::from_bytes(b"not a plist"),
            Err(RtspError::InvalidPlist)
        ));
    }
}

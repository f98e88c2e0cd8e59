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

//! Incremental RTSP-over-TCP codec. The parser tracks whether the blank line
//! separating headers from body has been seen and how many body bytes are
//! still outstanding, so a request may arrive across any number of reads.

use crate::error::{RtspError, RtspResult};
use bytes::{Buf, BytesMut};

pub const SERVER_NAME: &str = "AirPierre/366.0";

pub mod content_type {
    pub const TEXT_PARAMETERS: &str = "text/parameters";
    pub const OCTET_STREAM: &str = "application/octet-stream";
    pub const BINARY_PLIST: &str = "application/x-apple-binary-plist";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespCode {
    Ok,
    BadRequest,
    AuthRequired,
    InternalError,
    NotImplemented,
}

impl RespCode {
    pub fn code(&self) -> u16 {
        match self {
            RespCode::Ok => 200,
            RespCode::BadRequest => 400,
            RespCode::AuthRequired => 470,
            RespCode::InternalError => 500,
            RespCode::NotImplemented => 501,
        }
    }

    pub fn phrase(&self) -> &'static str {
        match self {
            RespCode::Ok => "OK",
            RespCode::BadRequest => "Bad Request",
            RespCode::AuthRequired => "Connection Authorization Required",
            RespCode::InternalError => "Internal Server Error",
            RespCode::NotImplemented => "Not Implemented",
        }
    }
}

/// Ordered, case-preserving header map. Lookups are exact; this side of the
/// protocol controls the spelling of every header it cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn cseq(&self) -> &str {
        self.headers.get("CSeq").unwrap_or("0")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: RespCode,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(code: RespCode) -> Self {
        Self {
            code,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(RespCode::Ok)
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers.add("Content-Type", content_type);
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Wire form. CSeq is mirrored from the request; Server and
    /// Content-Length are always present (the latter when a body is).
    pub fn serialize(&self, cseq: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("RTSP/1.0 {} {}\r\n", self.code.code(), self.code.phrase()).as_bytes(),
        );
        out.extend_from_slice(format!("CSeq: {cseq}\r\n").as_bytes());
        out.extend_from_slice(format!("Server: {SERVER_NAME}\r\n").as_bytes());
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// One request being assembled from the deciphered byte stream.
#[derive(Debug, Default)]
pub struct Pending {
    parsed: Option<Request>,
    body_remaining: usize,
}

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more deciphered bytes. Returns the number of bytes still needed
    /// before a complete request is assembled; zero means `take()` will
    /// produce one. Unconsumed bytes stay in `buf`.
    pub fn load_more(&mut self, buf: &mut BytesMut) -> RtspResult<usize> {
        if self.parsed.is_none() {
            let Some(header_end) = find_separator(buf) else {
                // no blank line yet, need at least one more byte
                return Ok(1);
            };

            let head = &buf[..header_end];
            let request = parse_head(head)?;
            self.body_remaining = request
                .headers
                .get("Content-Length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            self.parsed = Some(request);
            buf.advance(header_end + 4);
        }

        if let Some(request) = self.parsed.as_mut() {
            let take = self.body_remaining.min(buf.len());
            if take > 0 {
                request.body.extend_from_slice(&buf[..take]);
                buf.advance(take);
                self.body_remaining -= take;
            }
        }

        Ok(self.body_remaining)
    }

    pub fn take(&mut self) -> Option<Request> {
        if self.body_remaining == 0 {
            self.parsed.take()
        } else {
            None
        }
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> RtspResult<Request> {
    let text = std::str::from_utf8(head)
        .map_err(|_| RtspError::InvalidRequest("header block is not UTF-8".to_owned()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RtspError::InvalidRequest("empty request".to_owned()))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(protocol)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(RtspError::InvalidRequest(format!(
            "malformed request line: {request_line}"
        )));
    };

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(RtspError::InvalidRequest(format!("malformed header: {line}")));
        };
        headers.add(name.trim(), value.trim());
    }

    Ok(Request {
        method: method.to_owned(),
        path: path.to_owned(),
        protocol: protocol.to_owned(),
        headers,
        body: Vec::new(),
    })
}

/// Parse a serialized reply back into its parts. The session never receives
/// replies; this is the codec's inverse used by the event channel and tests.
pub fn parse_reply(data: &[u8]) -> RtspResult<Reply> {
    let separator = find_separator(data)
        .ok_or_else(|| RtspError::InvalidRequest("reply missing separator".to_owned()))?;
    let text = std::str::from_utf8(&data[..separator])
        .map_err(|_| RtspError::InvalidRequest("reply head is not UTF-8".to_owned()))?;

    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| RtspError::InvalidRequest("empty reply".to_owned()))?;
    let code = match status_line.split_whitespace().nth(1) {
        Some("200") => RespCode::Ok,
        Some("400") => RespCode::BadRequest,
        Some("470") => RespCode::AuthRequired,
        Some("500") => RespCode::InternalError,
        Some("501") => RespCode::NotImplemented,
        other => {
            return Err(RtspError::InvalidRequest(format!(
                "unknown status: {other:?}"
            )));
        }
    };

    let mut headers = Headers::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.add(name.trim(), value.trim());
        }
    }

    Ok(Reply {
        code,
        headers,
        body: data[separator + 4..].to_vec(),
    })
}

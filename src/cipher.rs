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

//! Per-session cipher state: the two pairing phases and, once pair-verify
//! succeeds, AEAD sealing of the RTSP byte stream.
//!
//! Sealed framing is block-at-a-time because RTSP messages may span several
//! TCP segments: each block is a little-endian u16 plaintext length, the
//! ciphertext and a 16 byte tag. The length bytes are the AAD. Decrypt only
//! ever consumes whole blocks, leaving a partial tail in the input buffer.

pub mod pairing;
pub mod tlv;

use crate::{
    cipher::pairing::{Pairing, StepResult, hkdf_sha512},
    error::{CipherError, CipherResult},
};
use aes_gcm::{
    Aes256Gcm, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use bytes::{Buf, BytesMut};
use tracing::debug;

const BLOCK_LEN_MAX: usize = 0x400;
const TAG_LEN: usize = 16;

/// One direction of the sealed channel: a 32 byte key and a nonce counter
/// that never repeats under that key. Sealed blobs carry the low 8 bytes of
/// the 12 byte nonce.
struct SessionKeys {
    cipher: Aes256Gcm,
    nonce_count: u64,
}

impl SessionKeys {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_count: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.nonce_count.to_le_bytes());
        self.nonce_count += 1;
        nonce
    }
}

pub struct CipherContext {
    pairing: Pairing,
    inbound: Option<SessionKeys>,
    outbound: Option<SessionKeys>,
    pending_secret: Option<[u8; 32]>,
}

impl CipherContext {
    pub fn new(device_id: &str) -> Self {
        Self {
            pairing: Pairing::new(device_id),
            inbound: None,
            outbound: None,
            pending_secret: None,
        }
    }

    pub fn have_shared_secret(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn setup(&mut self, body: &[u8]) -> CipherResult<StepResult> {
        self.pairing.setup_step(body)
    }

    pub fn verify(&mut self, body: &[u8]) -> CipherResult<StepResult> {
        let (result, secret) = self.pairing.verify_step(body)?;
        if let Some(secret) = secret {
            self.pending_secret = Some(secret);
        }
        Ok(result)
    }

    /// The reply to the final pair-verify step leaves in the clear; sealing
    /// starts with the first message after it.
    pub fn activate_pending(&mut self) {
        if let Some(secret) = self.pending_secret.take() {
            let write_key = hkdf_sha512(&secret, b"Control-Salt", b"Control-Write-Encryption-Key");
            let read_key = hkdf_sha512(&secret, b"Control-Salt", b"Control-Read-Encryption-Key");
            self.inbound = Some(SessionKeys::new(&write_key));
            self.outbound = Some(SessionKeys::new(&read_key));
            debug!("RTSP channel sealing enabled");
        }
    }

    /// Seal an outbound reply. Pass-through until a shared secret exists.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CipherResult<Vec<u8>> {
        let Some(keys) = self.outbound.as_mut() else {
            return Ok(plaintext.to_vec());
        };

        let mut out = Vec::with_capacity(plaintext.len() + (plaintext.len() / BLOCK_LEN_MAX + 1) * (2 + TAG_LEN));
        for chunk in plaintext.chunks(BLOCK_LEN_MAX) {
            let len_bytes = (chunk.len() as u16).to_le_bytes();
            let mut block = chunk.to_vec();
            let nonce = keys.next_nonce();
            let tag = keys
                .cipher
                .encrypt_in_place_detached(Nonce::from_slice(&nonce), &len_bytes, &mut block)
                .map_err(|_| CipherError::CipherFailure)?;
            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(&block);
            out.extend_from_slice(&tag);
        }
        Ok(out)
    }

    /// Open as many whole inbound blocks as `wire` holds, appending plaintext
    /// to `out`. Returns the number of wire bytes consumed. Pass-through
    /// until a shared secret exists. A MAC failure is fatal for the session.
    pub fn decrypt(&mut self, wire: &mut BytesMut, out: &mut BytesMut) -> CipherResult<usize> {
        let Some(keys) = self.inbound.as_mut() else {
            let consumed = wire.len();
            out.extend_from_slice(wire);
            wire.clear();
            return Ok(consumed);
        };

        let mut consumed = 0;
        loop {
            if wire.len() < 2 {
                break;
            }
            let block_len = u16::from_le_bytes([wire[0], wire[1]]) as usize;
            if block_len > BLOCK_LEN_MAX {
                return Err(CipherError::BlockTooLong(block_len));
            }
            let frame_len = 2 + block_len + TAG_LEN;
            if wire.len() < frame_len {
                break;
            }

            let len_bytes = [wire[0], wire[1]];
            let mut block = wire[2..2 + block_len].to_vec();
            let tag = Tag::from_slice(&wire[2 + block_len..frame_len]).to_owned();

            let nonce = keys.next_nonce();
            keys.cipher
                .decrypt_in_place_detached(Nonce::from_slice(&nonce), &len_bytes, &mut block, &tag)
                .map_err(|_| CipherError::CipherFailure)?;

            out.extend_from_slice(&block);
            wire.advance(frame_len);
            consumed += frame_len;
        }

        Ok(consumed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn sealed_pair() -> (CipherContext, CipherContext) {
        // two contexts sharing a secret, with mirrored directions
        let mut a = CipherContext::new("AA:AA:AA:AA:AA:AA");
        let mut b = CipherContext::new("BB:BB:BB:BB:BB:BB");
        let secret = [0x42u8; 32];

        a.pending_secret = Some(secret);
        a.activate_pending();

        // b plays the sender: its outbound key must match a's inbound key
        let write_key = hkdf_sha512(&secret, b"Control-Salt", b"Control-Write-Encryption-Key");
        let read_key = hkdf_sha512(&secret, b"Control-Salt", b"Control-Read-Encryption-Key");
        b.outbound = Some(SessionKeys::new(&write_key));
        b.inbound = Some(SessionKeys::new(&read_key));

        (a, b)
    }

    #[test]
    fn pass_through_before_secret() {
        let mut ctx = CipherContext::new("AA:AA:AA:AA:AA:AA");
        assert!(!ctx.have_shared_secret());

        assert_eq!(ctx.encrypt(b"OPTIONS * RTSP/1.0").unwrap(), b"OPTIONS * RTSP/1.0");

        let mut wire = BytesMut::from(&b"SETUP rtsp://x RTSP/1.0\r\n"[..]);
        let mut out = BytesMut::new();
        let consumed = ctx.decrypt(&mut wire, &mut out).unwrap();
        assert_eq!(consumed, 25);
        assert_eq!(&out[..], b"SETUP rtsp://x RTSP/1.0\r\n");
        assert!(wire.is_empty());
    }

    #[test]
    fn sealed_round_trip() {
        let (mut rx, mut tx) = sealed_pair();

        let sealed = tx.encrypt(b"RECORD rtsp://x RTSP/1.0\r\nCSeq: 4\r\n\r\n").unwrap();
        assert_ne!(&sealed[2..], b"RECORD rtsp://x RTSP/1.0\r\nCSeq: 4\r\n\r\n");

        let mut wire = BytesMut::from(&sealed[..]);
        let mut out = BytesMut::new();
        let consumed = rx.decrypt(&mut wire, &mut out).unwrap();
        assert_eq!(consumed, sealed.len());
        assert_eq!(&out[..], b"RECORD rtsp://x RTSP/1.0\r\nCSeq: 4\r\n\r\n");
    }

    #[test]
    fn decrypt_is_idempotent_over_partial_blocks() {
        let (mut rx, mut tx) = sealed_pair();
        let sealed = tx.encrypt(b"SET_PARAMETER rtsp://x RTSP/1.0\r\n\r\n").unwrap();

        let mut wire = BytesMut::from(&sealed[..sealed.len() - 5]);
        let mut out = BytesMut::new();
        assert_eq!(rx.decrypt(&mut wire, &mut out).unwrap(), 0);
        assert!(out.is_empty());

        wire.extend_from_slice(&sealed[sealed.len() - 5..]);
        assert_eq!(rx.decrypt(&mut wire, &mut out).unwrap(), sealed.len());
        assert_eq!(&out[..], b"SET_PARAMETER rtsp://x RTSP/1.0\r\n\r\n");
    }

    #[test]
    fn long_messages_split_into_max_blocks() {
        let (mut rx, mut tx) = sealed_pair();
        let plaintext = vec![0x5au8; BLOCK_LEN_MAX * 2 + 100];
        let sealed = tx.encrypt(&plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + 3 * (2 + TAG_LEN));

        let mut wire = BytesMut::from(&sealed[..]);
        let mut out = BytesMut::new();
        rx.decrypt(&mut wire, &mut out).unwrap();
        assert_eq!(&out[..], &plaintext[..]);
    }

    #[test]
    fn tampered_tag_is_fatal() {
        let (mut rx, mut tx) = sealed_pair();
        let mut sealed = tx.encrypt(b"TEARDOWN rtsp://x RTSP/1.0\r\n\r\n").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let mut wire = BytesMut::from(&sealed[..]);
        let mut out = BytesMut::new();
        assert!(matches!(
            rx.decrypt(&mut wire, &mut out),
            Err(CipherError::CipherFailure)
        ));
        assert!(out.is_empty());
    }
}

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

//! Payload decipher and AAC decode.
//!
//! The RTP payload's last 8 bytes are an apple-mini nonce (zero padded to
//! the cipher's 12), preceded by the 16 byte Poly1305 tag. The plaintext is
//! one AAC-LC frame which decodes to planar f32, two channels at 44100 Hz.

use crate::{
    error::{FrameError, FrameResult},
    frame::{Frame, NONCE_MINI_LEN, RTP_HEADER_LEN, SampleInfo, TAG_LEN},
    time::InputInfo,
};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use symphonia::core::{
    audio::{Channels, SampleBuffer},
    codecs::{CODEC_TYPE_AAC, CodecParameters, Decoder, DecoderOptions},
    formats::Packet,
};
use tracing::debug;

/// AudioSpecificConfig for AAC-LC, 44100 Hz, two channels.
const AAC_ASC: [u8; 2] = [0x12, 0x10];

/// Strip the trailer from a raw packet and decrypt the payload in place.
/// Returns the plaintext AAC frame. AAD is the frame's timestamp and SSRC.
pub fn decipher(frame: &Frame, packet: &[u8], key: &[u8; 32]) -> FrameResult<Vec<u8>> {
    let len = packet.len();
    if len < RTP_HEADER_LEN + TAG_LEN + NONCE_MINI_LEN {
        return Err(FrameError::PacketTooShort(len));
    }

    let nonce_mini = &packet[len - NONCE_MINI_LEN..];
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(nonce_mini);

    let tag_start = len - NONCE_MINI_LEN - TAG_LEN;
    let tag = &packet[tag_start..len - NONCE_MINI_LEN];

    let mut payload = packet[RTP_HEADER_LEN..tag_start].to_vec();

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &frame.aad(),
            &mut payload,
            Tag::from_slice(tag),
        )
        .map_err(|_| FrameError::DecipherFailed)?;

    Ok(payload)
}

pub struct Decoded {
    /// Planar samples, all of channel 0 then all of channel 1.
    pub samples: Vec<f32>,
    pub info: SampleInfo,
}

impl Decoded {
    pub fn channel(&self, ch: usize) -> &[f32] {
        let n = self.info.samp_per_ch;
        &self.samples[ch * n..(ch + 1) * n]
    }
}

/// Small AV decoder context. Must stay single threaded; each DSP worker owns
/// its own.
pub struct Av {
    decoder: Box<dyn Decoder>,
    ts: u64,
}

impl Av {
    pub fn new() -> FrameResult<Self> {
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_AAC)
            .with_sample_rate(InputInfo::RATE)
            .with_channels(Channels::FRONT_LEFT | Channels::FRONT_RIGHT)
            .with_extra_data(Box::new(AAC_ASC));

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| FrameError::DecodeFailed(e.to_string()))?;

        Ok(Self { decoder, ts: 0 })
    }

    pub fn decode(&mut self, payload: &[u8]) -> FrameResult<Decoded> {
        let packet = Packet::new_from_slice(0, self.ts, InputInfo::FRAMES_PER_PACKET as u64, payload);
        self.ts += InputInfo::FRAMES_PER_PACKET as u64;

        let decoded = self
            .decoder
            .decode(&packet)
            .map_err(|e| FrameError::DecodeFailed(e.to_string()))?;

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let frames = decoded.frames();

        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_planar_ref(decoded);

        let samples = buf.samples()[..channels * frames].to_vec();
        debug!("decoded {frames} frames x {channels} channels");

        Ok(Decoded {
            samples,
            info: SampleInfo {
                channels,
                samp_per_ch: frames,
            },
        })
    }
}

/// Build a sealed packet the way a sender would; test helper.
#[cfg(test)]
pub fn test_build_packet(seq: u32, ts: u32, ssrc: u32, plaintext: &[u8], key: &[u8; 32]) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.push(0x80u8);
    pkt.push((seq >> 16) as u8);
    pkt.push((seq >> 8) as u8);
    pkt.push(seq as u8);
    pkt.extend_from_slice(&ts.to_be_bytes());
    pkt.extend_from_slice(&ssrc.to_be_bytes());

    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&ts.to_be_bytes());
    aad[4..].copy_from_slice(&ssrc.to_be_bytes());

    let nonce_mini = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&nonce_mini);

    let mut payload = plaintext.to_vec();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut payload)
        .expect("sealing cannot fail");

    pkt.extend_from_slice(&payload);
    pkt.extend_from_slice(&tag);
    pkt.extend_from_slice(&nonce_mini);
    pkt
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn decipher_round_trip() {
        let key = [3u8; 32];
        let plaintext = b"not really aac but good enough";
        let pkt = test_build_packet(1000, 2_000_000, 0xfeed_f00d, plaintext, &key);

        let frame = Frame::from_packet(&pkt).unwrap();
        let deciphered = decipher(&frame, &pkt, &key).unwrap();
        assert_eq!(deciphered, plaintext);
    }

    #[test]
    fn tampered_tag_fails_decipher() {
        let key = [3u8; 32];
        let mut pkt = test_build_packet(1000, 2_000_000, 0xfeed_f00d, b"payload bytes here", &key);
        let tag_at = pkt.len() - NONCE_MINI_LEN - 1;
        pkt[tag_at] ^= 0x01;

        let frame = Frame::from_packet(&pkt).unwrap();
        assert!(matches!(
            decipher(&frame, &pkt, &key),
            Err(FrameError::DecipherFailed)
        ));
    }

    #[test]
    fn wrong_aad_fails_decipher() {
        let key = [3u8; 32];
        let mut pkt = test_build_packet(1000, 2_000_000, 0xfeed_f00d, b"payload bytes here", &key);
        // corrupt the timestamp, which is part of the AAD
        pkt[5] ^= 0xff;

        let frame = Frame::from_packet(&pkt).unwrap();
        assert!(decipher(&frame, &pkt, &key).is_err());
    }

    #[test]
    fn decoder_context_builds() {
        assert!(Av::new().is_ok());
    }

    #[test]
    fn garbage_payload_fails_decode() {
        let mut av = Av::new().unwrap();
        assert!(av.decode(&[0u8; 16]).is_err());
    }
}

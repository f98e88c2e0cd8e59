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

//! FairPlay setup stand-in. The real exchange needs a licensed state
//! machine; senders are satisfied by a canned reply chosen from the known
//! request shapes: a 16 byte first phase carrying a mode byte, and a 164
//! byte second phase whose reply echoes the request's trailing 20 bytes.

const FP_HEADER: [u8; 12] = [
    0x46, 0x50, 0x4c, 0x59, // "FPLY"
    0x03, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x14,
];

const SETUP1_LEN: usize = 16;
const SETUP2_LEN: usize = 164;
const SETUP2_SUFFIX_LEN: usize = 20;
const REPLY1_LEN: usize = 142;
const MODE_AT: usize = 14;

pub fn response(body: &[u8]) -> Option<Vec<u8>> {
    match body.len() {
        SETUP1_LEN => {
            let mode = body[MODE_AT];
            if mode > 3 {
                return None;
            }
            let mut reply = vec![0u8; REPLY1_LEN];
            reply[..4].copy_from_slice(&FP_HEADER[..4]);
            reply[4] = 0x02;
            reply[5] = 0x01;
            reply[6] = 0x02;
            reply[13] = 0x82;
            reply[MODE_AT] = mode;
            Some(reply)
        }
        SETUP2_LEN => {
            let mut reply = Vec::with_capacity(FP_HEADER.len() + SETUP2_SUFFIX_LEN);
            reply.extend_from_slice(&FP_HEADER);
            reply.extend_from_slice(&body[SETUP2_LEN - SETUP2_SUFFIX_LEN..]);
            Some(reply)
        }
        _ => None,
    }
}

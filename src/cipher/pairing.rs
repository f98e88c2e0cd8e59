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

//! HomeKit accessory pairing: pair-setup (SRP-6a, group 3072, SHA-512) and
//! pair-verify (x25519 + ed25519). A failed step produces an error TLV reply
//! and leaves prior state intact so the sender can retry.

use crate::{
    cipher::tlv::{Tlv8, err, tag},
    error::{CipherError, CipherResult},
};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha512;
use srp::{client::SrpClient, groups::G_3072, server::SrpServer};
use tracing::{info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

const SRP_USER: &[u8] = b"Pair-Setup";
const SRP_PIN: &[u8] = b"3939";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    InProgress,
    Complete,
    Failed,
}

/// Outcome of one pair-setup or pair-verify exchange step.
pub struct StepResult {
    pub body: Vec<u8>,
    pub status: StepStatus,
}

impl StepResult {
    fn in_progress(body: Vec<u8>) -> Self {
        Self {
            body,
            status: StepStatus::InProgress,
        }
    }

    fn complete(body: Vec<u8>) -> Self {
        Self {
            body,
            status: StepStatus::Complete,
        }
    }

    fn failed(state: u8) -> Self {
        Self {
            body: Tlv8::error(state, err::AUTHENTICATION),
            status: StepStatus::Failed,
        }
    }
}

pub struct Pairing {
    device_id: String,
    ltsk: SigningKey,
    salt: [u8; 16],
    srp_b: [u8; 64],
    srp_verifier: Vec<u8>,
    srp_key: Option<Vec<u8>>,
    device_ltpk: Option<VerifyingKey>,
    verify_eph: Option<VerifySession>,
}

struct VerifySession {
    our_pub: [u8; 32],
    their_pub: [u8; 32],
    shared: [u8; 32],
    session_key: [u8; 32],
}

impl Pairing {
    pub fn new(device_id: &str) -> Self {
        let mut salt = [0u8; 16];
        let mut srp_b = [0u8; 64];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut srp_b);

        let srp_verifier = SrpClient::<Sha512>::new(&G_3072).compute_verifier(SRP_USER, SRP_PIN, &salt);

        Self {
            device_id: device_id.to_owned(),
            ltsk: SigningKey::generate(&mut OsRng),
            salt,
            srp_b,
            srp_verifier,
            srp_key: None,
            device_ltpk: None,
            verify_eph: None,
        }
    }

    /// Consume one pair-setup request body, producing the reply body and
    /// whether the exchange finished.
    pub fn setup_step(&mut self, body: &[u8]) -> CipherResult<StepResult> {
        let tlv = Tlv8::parse(body)?;
        let state = tlv.get_u8(tag::STATE).unwrap_or(0);

        match state {
            1 => Ok(self.setup_m1()),
            3 => Ok(self.setup_m3(&tlv)),
            5 => Ok(self.setup_m5(&tlv)),
            other => Err(CipherError::StepOutOfSequence {
                phase: "setup",
                state: other,
            }),
        }
    }

    fn setup_m1(&mut self) -> StepResult {
        let server = SrpServer::<Sha512>::new(&G_3072);
        let b_pub = server.compute_public_ephemeral(&self.srp_b, &self.srp_verifier);

        let mut reply = Tlv8::new();
        reply
            .push_u8(tag::STATE, 2)
            .push(tag::SALT, self.salt)
            .push(tag::PUBLIC_KEY, b_pub);

        StepResult::in_progress(reply.encode())
    }

    fn setup_m3(&mut self, tlv: &Tlv8) -> StepResult {
        let (Some(a_pub), Some(client_proof)) = (tlv.get(tag::PUBLIC_KEY), tlv.get(tag::PROOF))
        else {
            return StepResult::failed(4);
        };

        let server = SrpServer::<Sha512>::new(&G_3072);
        let verifier = match server.process_reply(&self.srp_b, &self.srp_verifier, a_pub) {
            Ok(it) => it,
            Err(_) => return StepResult::failed(4),
        };

        if verifier.verify_client(client_proof).is_err() {
            warn!("pair-setup SRP proof rejected");
            return StepResult::failed(4);
        }

        self.srp_key = Some(verifier.key().to_vec());

        let mut reply = Tlv8::new();
        reply.push_u8(tag::STATE, 4).push(tag::PROOF, verifier.proof());

        StepResult::in_progress(reply.encode())
    }

    fn setup_m5(&mut self, tlv: &Tlv8) -> StepResult {
        let (Some(encrypted), Some(srp_key)) = (tlv.get(tag::ENCRYPTED_DATA), self.srp_key.as_ref())
        else {
            return StepResult::failed(6);
        };

        let session_key = hkdf_sha512(srp_key, b"Pair-Setup-Encrypt-Salt", b"Pair-Setup-Encrypt-Info");

        let Ok(plain) = open_chacha(&session_key, b"PS-Msg05", encrypted) else {
            return StepResult::failed(6);
        };

        let Ok(sub) = Tlv8::parse(&plain) else {
            return StepResult::failed(6);
        };

        let (Some(ios_id), Some(ios_ltpk), Some(ios_sig)) = (
            sub.get(tag::IDENTIFIER),
            sub.get(tag::PUBLIC_KEY),
            sub.get(tag::SIGNATURE),
        ) else {
            return StepResult::failed(6);
        };

        // iOSDeviceInfo = iOSDeviceX || identifier || ltpk
        let ios_x = hkdf_sha512(
            srp_key,
            b"Pair-Setup-Controller-Sign-Salt",
            b"Pair-Setup-Controller-Sign-Info",
        );
        let mut info = Vec::with_capacity(32 + ios_id.len() + ios_ltpk.len());
        info.extend_from_slice(&ios_x);
        info.extend_from_slice(ios_id);
        info.extend_from_slice(ios_ltpk);

        let Ok(ltpk_bytes) = <[u8; 32]>::try_from(ios_ltpk) else {
            return StepResult::failed(6);
        };
        let Ok(ltpk) = VerifyingKey::from_bytes(&ltpk_bytes) else {
            return StepResult::failed(6);
        };
        let Ok(sig) = Signature::from_slice(ios_sig) else {
            return StepResult::failed(6);
        };
        if ltpk.verify(&info, &sig).is_err() {
            warn!("pair-setup device signature rejected");
            return StepResult::failed(6);
        }

        self.device_ltpk = Some(ltpk);

        // AccessoryInfo = AccessoryX || identifier || ltpk
        let accessory_x = hkdf_sha512(
            srp_key,
            b"Pair-Setup-Accessory-Sign-Salt",
            b"Pair-Setup-Accessory-Sign-Info",
        );
        let ltpk = self.ltsk.verifying_key();
        let mut info = Vec::with_capacity(32 + self.device_id.len() + 32);
        info.extend_from_slice(&accessory_x);
        info.extend_from_slice(self.device_id.as_bytes());
        info.extend_from_slice(ltpk.as_bytes());
        let signature = self.ltsk.sign(&info);

        let mut sub = Tlv8::new();
        sub.push(tag::IDENTIFIER, self.device_id.as_bytes())
            .push(tag::PUBLIC_KEY, ltpk.as_bytes())
            .push(tag::SIGNATURE, signature.to_bytes());

        let encrypted = seal_chacha(&session_key, b"PS-Msg06", &sub.encode());

        let mut reply = Tlv8::new();
        reply.push_u8(tag::STATE, 6).push(tag::ENCRYPTED_DATA, encrypted);

        info!("pair-setup complete, accessory long term key established");
        StepResult::complete(reply.encode())
    }

    /// Consume one pair-verify request body. On the final step the returned
    /// option carries the 32 byte session shared secret.
    pub fn verify_step(&mut self, body: &[u8]) -> CipherResult<(StepResult, Option<[u8; 32]>)> {
        let tlv = Tlv8::parse(body)?;
        let state = tlv.get_u8(tag::STATE).unwrap_or(0);

        match state {
            1 => Ok((self.verify_m1(&tlv), None)),
            3 => Ok(self.verify_m3(&tlv)),
            other => Err(CipherError::StepOutOfSequence {
                phase: "verify",
                state: other,
            }),
        }
    }

    fn verify_m1(&mut self, tlv: &Tlv8) -> StepResult {
        let Some(their_pub) = tlv.get(tag::PUBLIC_KEY).and_then(|pk| <[u8; 32]>::try_from(pk).ok())
        else {
            return StepResult::failed(2);
        };

        let eph = StaticSecret::random_from_rng(OsRng);
        let our_pub = PublicKey::from(&eph);
        let shared = eph.diffie_hellman(&PublicKey::from(their_pub));

        // AccessoryInfo = our curve pub || identifier || their curve pub
        let mut info = Vec::with_capacity(32 + self.device_id.len() + 32);
        info.extend_from_slice(our_pub.as_bytes());
        info.extend_from_slice(self.device_id.as_bytes());
        info.extend_from_slice(&their_pub);
        let signature = self.ltsk.sign(&info);

        let mut sub = Tlv8::new();
        sub.push(tag::IDENTIFIER, self.device_id.as_bytes())
            .push(tag::SIGNATURE, signature.to_bytes());

        let session_key = hkdf_sha512(
            shared.as_bytes(),
            b"Pair-Verify-Encrypt-Salt",
            b"Pair-Verify-Encrypt-Info",
        );
        let encrypted = seal_chacha(&session_key, b"PV-Msg02", &sub.encode());

        self.verify_eph = Some(VerifySession {
            our_pub: *our_pub.as_bytes(),
            their_pub,
            shared: *shared.as_bytes(),
            session_key,
        });

        let mut reply = Tlv8::new();
        reply
            .push_u8(tag::STATE, 2)
            .push(tag::PUBLIC_KEY, our_pub.as_bytes())
            .push(tag::ENCRYPTED_DATA, encrypted);

        StepResult::in_progress(reply.encode())
    }

    fn verify_m3(&mut self, tlv: &Tlv8) -> (StepResult, Option<[u8; 32]>) {
        let Some(session) = self.verify_eph.as_ref() else {
            return (StepResult::failed(4), None);
        };
        let Some(encrypted) = tlv.get(tag::ENCRYPTED_DATA) else {
            return (StepResult::failed(4), None);
        };

        let Ok(plain) = open_chacha(&session.session_key, b"PV-Msg03", encrypted) else {
            return (StepResult::failed(4), None);
        };
        let Ok(sub) = Tlv8::parse(&plain) else {
            return (StepResult::failed(4), None);
        };

        // verify against the long term key learned during pair-setup when we
        // have one; a transient session carries no registered controller key
        if let (Some(ltpk), Some(ios_id), Some(ios_sig)) = (
            self.device_ltpk.as_ref(),
            sub.get(tag::IDENTIFIER),
            sub.get(tag::SIGNATURE),
        ) {
            let mut info = Vec::with_capacity(32 + ios_id.len() + 32);
            info.extend_from_slice(&session.their_pub);
            info.extend_from_slice(ios_id);
            info.extend_from_slice(&session.our_pub);

            let Ok(sig) = Signature::from_slice(ios_sig) else {
                return (StepResult::failed(4), None);
            };
            if ltpk.verify(&info, &sig).is_err() {
                warn!("pair-verify device signature rejected");
                return (StepResult::failed(4), None);
            }
        }

        let shared = session.shared;
        let mut reply = Tlv8::new();
        reply.push_u8(tag::STATE, 4);

        info!("pair-verify complete, session shared secret established");
        (StepResult::complete(reply.encode()), Some(shared))
    }
}

pub fn hkdf_sha512(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    // expand only fails for oversized outputs, 32 bytes always fits
    hk.expand(info, &mut okm).ok();
    okm
}

fn chacha_nonce(nonce8: &[u8; 8]) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(nonce8);
    Nonce::from(nonce)
}

fn seal_chacha(key: &[u8; 32], nonce8: &[u8; 8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut buf = plaintext.to_vec();
    match cipher.encrypt_in_place_detached(&chacha_nonce(nonce8), &[], &mut buf) {
        Ok(tag) => {
            buf.extend_from_slice(&tag);
            buf
        }
        Err(_) => Vec::new(),
    }
}

fn open_chacha(key: &[u8; 32], nonce8: &[u8; 8], data: &[u8]) -> CipherResult<Vec<u8>> {
    if data.len() < 16 {
        return Err(CipherError::CipherFailure);
    }
    let (ciphertext, tag) = data.split_at(data.len() - 16);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(&chacha_nonce(nonce8), &[], &mut buf, Tag::from_slice(tag))
        .map_err(|_| CipherError::CipherFailure)?;
    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use srp::client::SrpClient;

    #[test]
    fn chacha_seal_open_round_trip() {
        let key = [7u8; 32];
        let sealed = seal_chacha(&key, b"PS-Msg05", b"attack at dawn");
        assert_eq!(open_chacha(&key, b"PS-Msg05", &sealed).unwrap(), b"attack at dawn");
        assert!(open_chacha(&key, b"PS-Msg06", &sealed).is_err());
    }

    #[test]
    fn setup_m1_reply_carries_salt_and_server_key() {
        let mut pairing = Pairing::new("AA:BB:CC:DD:EE:FF");
        let mut m1 = Tlv8::new();
        m1.push_u8(tag::STATE, 1).push_u8(tag::METHOD, 0);

        let result = pairing.setup_step(&m1.encode()).unwrap();
        assert_eq!(result.status, StepStatus::InProgress);

        let reply = Tlv8::parse(&result.body).unwrap();
        assert_eq!(reply.get_u8(tag::STATE), Some(2));
        assert_eq!(reply.get(tag::SALT).unwrap().len(), 16);
        // group 3072 public ephemeral
        assert_eq!(reply.get(tag::PUBLIC_KEY).unwrap().len(), 384);
    }

    #[test]
    fn setup_full_srp_exchange_with_reference_client() {
        let mut pairing = Pairing::new("AA:BB:CC:DD:EE:FF");

        let mut m1 = Tlv8::new();
        m1.push_u8(tag::STATE, 1);
        let m2 = Tlv8::parse(&pairing.setup_step(&m1.encode()).unwrap().body).unwrap();
        let salt = m2.get(tag::SALT).unwrap().to_vec();
        let b_pub = m2.get(tag::PUBLIC_KEY).unwrap().to_vec();

        let client = SrpClient::<Sha512>::new(&G_3072);
        let mut a = [0u8; 64];
        OsRng.fill_bytes(&mut a);
        let a_pub = client.compute_public_ephemeral(&a);
        let verifier = client
            .process_reply(&a, SRP_USER, SRP_PIN, &salt, &b_pub)
            .unwrap();

        let mut m3 = Tlv8::new();
        m3.push_u8(tag::STATE, 3)
            .push(tag::PUBLIC_KEY, &a_pub)
            .push(tag::PROOF, verifier.proof());

        let result = pairing.setup_step(&m3.encode()).unwrap();
        assert_eq!(result.status, StepStatus::InProgress);

        let m4 = Tlv8::parse(&result.body).unwrap();
        assert_eq!(m4.get_u8(tag::STATE), Some(4));
        verifier.verify_server(m4.get(tag::PROOF).unwrap()).unwrap();
    }

    #[test]
    fn setup_rejects_bad_proof_but_stays_retryable() {
        let mut pairing = Pairing::new("AA:BB:CC:DD:EE:FF");

        let mut m1 = Tlv8::new();
        m1.push_u8(tag::STATE, 1);
        pairing.setup_step(&m1.encode()).unwrap();

        let mut m3 = Tlv8::new();
        m3.push_u8(tag::STATE, 3)
            .push(tag::PUBLIC_KEY, vec![3u8; 384])
            .push(tag::PROOF, [0u8; 64]);

        let result = pairing.setup_step(&m3.encode()).unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        let reply = Tlv8::parse(&result.body).unwrap();
        assert_eq!(reply.get_u8(tag::ERROR), Some(err::AUTHENTICATION));

        // the server ephemeral survives, a fresh M1 still works
        let result = pairing.setup_step(&m1.encode()).unwrap();
        assert_eq!(result.status, StepStatus::InProgress);
    }

    #[test]
    fn verify_round_trip_produces_shared_secret() {
        let mut pairing = Pairing::new("AA:BB:CC:DD:EE:FF");

        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_pub = PublicKey::from(&client_secret);

        let mut m1 = Tlv8::new();
        m1.push_u8(tag::STATE, 1).push(tag::PUBLIC_KEY, client_pub.as_bytes());

        let (result, secret) = pairing.verify_step(&m1.encode()).unwrap();
        assert_eq!(result.status, StepStatus::InProgress);
        assert!(secret.is_none());

        let m2 = Tlv8::parse(&result.body).unwrap();
        let accessory_pub: [u8; 32] = m2.get(tag::PUBLIC_KEY).unwrap().try_into().unwrap();
        let shared = client_secret.diffie_hellman(&PublicKey::from(accessory_pub));

        // decrypt the accessory sub-TLV like a sender would
        let session_key = hkdf_sha512(
            shared.as_bytes(),
            b"Pair-Verify-Encrypt-Salt",
            b"Pair-Verify-Encrypt-Info",
        );
        let sub = open_chacha(&session_key, b"PV-Msg02", m2.get(tag::ENCRYPTED_DATA).unwrap()).unwrap();
        assert!(Tlv8::parse(&sub).unwrap().get(tag::SIGNATURE).is_some());

        let mut client_sub = Tlv8::new();
        client_sub.push(tag::IDENTIFIER, b"client-1");
        let encrypted = seal_chacha(&session_key, b"PV-Msg03", &client_sub.encode());

        let mut m3 = Tlv8::new();
        m3.push_u8(tag::STATE, 3).push(tag::ENCRYPTED_DATA, encrypted);

        let (result, secret) = pairing.verify_step(&m3.encode()).unwrap();
        assert_eq!(result.status, StepStatus::Complete);
        assert_eq!(secret.unwrap(), *shared.as_bytes());
    }
}

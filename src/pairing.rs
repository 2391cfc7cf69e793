//! Pairing: a separate pre-connection flow that enrols an RSA identity with the
//! daemon using a 6-digit pairing code (§4.5).
//!
//! The reference pairing protocol is SPAKE2-over-TLS and out of reach from
//! source alone; the construction below is this crate's own documented answer
//! (see §4.5.1 and DESIGN.md), not a reverse-engineering of real adbd.

use crate::error::{AdbError, Result};
use crate::keystore::Identity;
use crate::transport::Transport;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity as SpakeIdentity, Password, Spake2};
use zeroize::Zeroizing;

const PAIR_ENVELOPE_TYPE: u32 = 0x5249_4150; // "PAIR" read as bytes, big-endian framed
const HOST_IDENTITY: &[u8] = b"adb pair client\0";
const DEVICE_IDENTITY: &[u8] = b"adb pair server\0";
const HKDF_INFO: &[u8] = b"adb pairing key";
const NONCE_LEN: usize = 12;

/// The identity the daemon now trusts, returned once pairing completes.
pub struct TrustedIdentity {
    pub encoded_public_key: Vec<u8>,
}

/// The daemon hanging up mid-exchange is a distinct failure from a rejected
/// code: callers need to tell "wrong code" apart from "connection dropped".
fn as_pairing_error(err: AdbError) -> AdbError {
    match err {
        AdbError::TransportClosed => AdbError::PairingAborted,
        AdbError::Io(_) => AdbError::PairingAborted,
        other => other,
    }
}

fn send_envelope(transport: &mut dyn Transport, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.write_u32::<BE>(PAIR_ENVELOPE_TYPE)?;
    buf.write_u32::<BE>(payload.len() as u32)?;
    buf.extend_from_slice(payload);
    transport.send_all(&buf).map_err(as_pairing_error)
}

fn recv_envelope(transport: &mut dyn Transport) -> Result<Vec<u8>> {
    let mut header = [0u8; 8];
    transport.recv_exact(&mut header).map_err(as_pairing_error)?;
    let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    transport.recv_exact(&mut payload).map_err(as_pairing_error)?;
    Ok(payload)
}

fn seal(key: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = key
        .encrypt(nonce, Payload::from(plaintext))
        .map_err(|_| AdbError::Crypto("AES-GCM seal failed".into()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &Aes256Gcm, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(AdbError::Crypto("pairing envelope too short".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    key.decrypt(nonce, Payload::from(ciphertext))
        .map_err(|_| AdbError::PairingRejected)
}

/// Perform the pairing exchange over `transport`, enrolling `identity` with the
/// daemon using `pairing_code` (the 6-digit code shown on the device screen).
pub fn pair(
    mut transport: Box<dyn Transport>,
    pairing_code: &str,
    identity: &Identity,
) -> Result<TrustedIdentity> {
    let password = Zeroizing::new(pairing_code.as_bytes().to_vec());

    let (spake, host_msg) = Spake2::<Ed25519Group>::start_a(
        &Password::new(&password),
        &SpakeIdentity::new(HOST_IDENTITY),
        &SpakeIdentity::new(DEVICE_IDENTITY),
    );

    log::debug!("pairing: sending SPAKE2 key-exchange message");
    send_envelope(transport.as_mut(), &host_msg)?;

    let device_msg = recv_envelope(transport.as_mut())?;

    let shared_secret = Zeroizing::new(
        spake
            .finish(&device_msg)
            .map_err(|_| AdbError::PairingRejected)?,
    );

    let hk = Hkdf::<Sha256>::new(None, &shared_secret);
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, key_bytes.as_mut())
        .map_err(|_| AdbError::Crypto("HKDF expand failed".into()))?;
    let key = Aes256Gcm::new_from_slice(key_bytes.as_ref())
        .map_err(|_| AdbError::Crypto("invalid AES-256-GCM key length".into()))?;

    let encoded_public_key = identity.encoded_public()?;
    log::debug!("pairing: sending sealed public key envelope");
    let sealed = seal(&key, &encoded_public_key)?;
    send_envelope(transport.as_mut(), &sealed)?;

    let ack_sealed = recv_envelope(transport.as_mut())?;
    let ack = open(&key, &ack_sealed)?;
    if ack != b"ok" {
        log::warn!("pairing: daemon did not acknowledge enrolment");
        return Err(AdbError::PairingRejected);
    }

    log::debug!("pairing: complete");
    Ok(TrustedIdentity { encoded_public_key })
}

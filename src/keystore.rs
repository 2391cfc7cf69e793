//! RSA identities and the adbd Montgomery-form public-key encoding (§4.2).

use crate::error::{AdbError, Result};
use num_bigint_dig::traits::ModInverse;
use num_bigint_dig::{BigUint, IntoBigInt};
use num_traits::ToPrimitive;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

const KEY_LEN_WORDS: u32 = 64;
const MODULUS_BYTES: usize = 256;
const ENCODED_LEN: usize = 4 + 4 + MODULUS_BYTES + MODULUS_BYTES + 4;

/// adbd's RSA-2048 public key blob: modulus length, Montgomery `n0inv`, modulus,
/// Barrett `rr`, exponent. No base64 layer — see DESIGN.md for why this departs
/// from the reference encoder's wire framing.
#[derive(Debug, Eq, PartialEq)]
pub struct EncodedPublicKey {
    modulus_size_words: u32,
    n0inv: u32,
    modulus: [u8; MODULUS_BYTES],
    rr: [u8; MODULUS_BYTES],
    exponent: u32,
}

impl EncodedPublicKey {
    pub fn from_public(public: &RsaPublicKey) -> Result<Self> {
        use rsa::traits::PublicKeyParts;

        let n = public.n();
        let n_bytes = n.to_bytes_le();
        if n_bytes.len() > MODULUS_BYTES {
            return Err(AdbError::Crypto("modulus larger than RSA-2048".into()));
        }
        let mut modulus = [0u8; MODULUS_BYTES];
        modulus[..n_bytes.len()].copy_from_slice(&n_bytes);

        let r32 = BigUint::from(1u8) << 32;
        let n0 = n % &r32;
        let n0inv = n0
            .mod_inverse(&r32)
            .ok_or_else(|| AdbError::Crypto("modulus not invertible mod 2^32".into()))?;
        let n0inv = r32
            .into_bigint()
            .map_err(|_| AdbError::Crypto("bigint conversion failed".into()))?
            - n0inv;
        let n0inv = n0inv
            .to_u32()
            .ok_or_else(|| AdbError::Crypto("n0inv did not fit in u32".into()))?;

        let r = BigUint::from(1u8) << (MODULUS_BYTES * 8);
        let rr = (&r * &r) % n;
        let rr_bytes = rr.to_bytes_le();
        let mut rr_buf = [0u8; MODULUS_BYTES];
        rr_buf[..rr_bytes.len()].copy_from_slice(&rr_bytes);

        let exponent = public
            .e()
            .to_u32()
            .ok_or_else(|| AdbError::Crypto("exponent did not fit in u32".into()))?;

        Ok(Self {
            modulus_size_words: KEY_LEN_WORDS,
            n0inv,
            modulus,
            rr: rr_buf,
            exponent,
        })
    }

    /// Serialize as the raw binary struct plus a trailing NUL-terminated label
    /// (e.g. `b"unknown@host\0"`). No base64 layer.
    pub fn encode(&self, label: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_LEN + label.len() + 1);
        buf.extend_from_slice(&self.modulus_size_words.to_le_bytes());
        buf.extend_from_slice(&self.n0inv.to_le_bytes());
        buf.extend_from_slice(&self.modulus);
        buf.extend_from_slice(&self.rr);
        buf.extend_from_slice(&self.exponent.to_le_bytes());
        buf.extend_from_slice(label.as_bytes());
        buf.push(0);
        buf
    }
}

/// One RSA-2048 identity the handshake may try, in order.
pub struct Identity {
    private: RsaPrivateKey,
    label: String,
}

impl Identity {
    pub fn new(private: RsaPrivateKey, label: impl Into<String>) -> Self {
        Self {
            private,
            label: label.into(),
        }
    }

    pub fn from_pkcs1_pem(pem: &str, label: impl Into<String>) -> Result<Self> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        let private = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| AdbError::Crypto(format!("invalid PKCS#1 PEM key: {e}")))?;
        Ok(Self::new(private, label))
    }

    /// Sign `token` (the raw bytes from `AUTH(TOKEN, ...)`) with PKCS#1 v1.5 / SHA-1.
    ///
    /// adbd treats the 20-byte token itself as the pre-computed digest, so this
    /// signs `token` directly with the SHA-1 `DigestInfo` prefix rather than
    /// hashing it again — the prehashed `Pkcs1v15Sign` padding, not `SigningKey`.
    pub fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        let padding = Pkcs1v15Sign::new::<Sha1>();
        self.private
            .sign(padding, token)
            .map_err(|e| AdbError::Crypto(format!("RSA signing failed: {e}")))
    }

    pub fn encoded_public(&self) -> Result<Vec<u8>> {
        let public = RsaPublicKey::from(&self.private);
        let encoded = EncodedPublicKey::from_public(&public)?;
        Ok(encoded.encode(&self.label))
    }
}

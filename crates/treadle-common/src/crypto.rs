//! Crypto primitives for commit signing
//!
//! SHA-256 and HMAC-SHA-256 hashing plus ECDSA over P-256 and K-256
//! (secp256k1). Signatures are always the fixed 64-byte `R ‖ S` form with
//! `S` normalized to the low half of the curve order, so a given key and
//! digest have exactly one canonical signature; verification rejects
//! high-S encodings outright.
//!
//! Public keys travel as compressed SEC1 bytes and can be rendered as
//! Multikey strings (multicodec varint + base58btc multibase), the text
//! form used in DID documents.

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of a byte sequence.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute HMAC-SHA-256 over `data` with the given key.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    use hmac::{Hmac, Mac};
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Multicodec code for a compressed secp256k1 public key
const SECP256K1_PUB: u64 = 0xE7;
/// Multicodec code for a compressed P-256 public key
const P256_PUB: u64 = 0x1200;

/// The two signature curves repository commits may be signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCurve {
    /// NIST P-256 (secp256r1)
    P256,
    /// K-256 (secp256k1)
    K256,
}

/// Errors from key handling and signing
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CryptoError {
    /// Signing failed (oversized scalar or RNG-level fault)
    #[error("signing failed: {0}")]
    Signing(String),

    /// Secret key bytes were not a valid scalar for the curve
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    /// Public key bytes were not a valid SEC1 point
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Multibase decode failed
    #[error("failed to decode multibase")]
    MultibaseDecode,

    /// Multicodec varint decode failed
    #[error("failed to decode multicodec varint")]
    MulticodecDecode,

    /// Multikey carried a codec this implementation does not sign with
    #[error("unsupported key codec: {0:#x}")]
    UnsupportedCodec(u64),
}

/// An ECDSA signing keypair for one repository.
#[derive(Clone)]
pub enum SigningKeypair {
    /// P-256 signing key
    P256(p256::ecdsa::SigningKey),
    /// K-256 signing key
    K256(k256::ecdsa::SigningKey),
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print secret material
        write!(f, "SigningKeypair({:?})", self.curve())
    }
}

impl SigningKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate(curve: KeyCurve) -> Self {
        match curve {
            KeyCurve::P256 => {
                Self::P256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng))
            }
            KeyCurve::K256 => {
                Self::K256(k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng))
            }
        }
    }

    /// The curve this keypair signs with.
    pub fn curve(&self) -> KeyCurve {
        match self {
            Self::P256(_) => KeyCurve::P256,
            Self::K256(_) => KeyCurve::K256,
        }
    }

    /// Sign a precomputed 32-byte digest.
    ///
    /// Returns the 64-byte `R ‖ S` encoding with `S` in the low half of
    /// the curve order.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Bytes, CryptoError> {
        match self {
            Self::P256(key) => {
                use p256::ecdsa::signature::hazmat::PrehashSigner;
                let sig: p256::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| CryptoError::Signing(e.to_string()))?;
                let sig = sig.normalize_s().unwrap_or(sig);
                Ok(Bytes::copy_from_slice(&sig.to_bytes()))
            }
            Self::K256(key) => {
                use k256::ecdsa::signature::hazmat::PrehashSigner;
                let sig: k256::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| CryptoError::Signing(e.to_string()))?;
                let sig = sig.normalize_s().unwrap_or(sig);
                Ok(Bytes::copy_from_slice(&sig.to_bytes()))
            }
        }
    }

    /// The matching public key, as compressed SEC1 bytes.
    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::P256(key) => PublicKey {
                curve: KeyCurve::P256,
                bytes: Bytes::copy_from_slice(
                    key.verifying_key().to_encoded_point(true).as_bytes(),
                ),
            },
            Self::K256(key) => PublicKey {
                curve: KeyCurve::K256,
                bytes: Bytes::copy_from_slice(
                    key.verifying_key().to_encoded_point(true).as_bytes(),
                ),
            },
        }
    }

    /// Export the 32-byte secret scalar for persistence.
    pub fn to_secret_bytes(&self) -> [u8; 32] {
        match self {
            Self::P256(key) => key.to_bytes().into(),
            Self::K256(key) => key.to_bytes().into(),
        }
    }

    /// Rebuild a keypair from a persisted secret scalar.
    pub fn from_secret_bytes(curve: KeyCurve, secret: &[u8]) -> Result<Self, CryptoError> {
        match curve {
            KeyCurve::P256 => p256::ecdsa::SigningKey::from_slice(secret)
                .map(Self::P256)
                .map_err(|e| CryptoError::InvalidSecretKey(e.to_string())),
            KeyCurve::K256 => k256::ecdsa::SigningKey::from_slice(secret)
                .map(Self::K256)
                .map_err(|e| CryptoError::InvalidSecretKey(e.to_string())),
        }
    }
}

/// A verification key: curve tag plus compressed SEC1 point bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Curve the key belongs to
    pub curve: KeyCurve,
    /// Compressed SEC1 encoding (33 bytes, 0x02/0x03 prefix)
    pub bytes: Bytes,
}

impl PublicKey {
    /// Verify a canonical 64-byte `R ‖ S` signature over a 32-byte digest.
    ///
    /// Returns `false` for wrong-length signatures, high-S encodings, and
    /// signatures that fail curve verification.
    pub fn verify(&self, digest: &[u8; 32], sig: &[u8]) -> bool {
        if sig.len() != 64 {
            return false;
        }
        match self.curve {
            KeyCurve::P256 => {
                use p256::ecdsa::signature::hazmat::PrehashVerifier;
                use p256::elliptic_curve::scalar::IsHigh;
                let Ok(key) = p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.bytes) else {
                    return false;
                };
                let Ok(sig) = p256::ecdsa::Signature::from_slice(sig) else {
                    return false;
                };
                if bool::from(sig.s().is_high()) {
                    return false;
                }
                key.verify_prehash(digest, &sig).is_ok()
            }
            KeyCurve::K256 => {
                use k256::ecdsa::signature::hazmat::PrehashVerifier;
                use k256::elliptic_curve::scalar::IsHigh;
                let Ok(key) = k256::ecdsa::VerifyingKey::from_sec1_bytes(&self.bytes) else {
                    return false;
                };
                let Ok(sig) = k256::ecdsa::Signature::from_slice(sig) else {
                    return false;
                };
                if bool::from(sig.s().is_high()) {
                    return false;
                }
                key.verify_prehash(digest, &sig).is_ok()
            }
        }
    }

    /// Render as a Multikey string: multicodec varint + key bytes,
    /// base58btc multibase.
    pub fn to_multikey(&self) -> String {
        let code = match self.curve {
            KeyCurve::P256 => P256_PUB,
            KeyCurve::K256 => SECP256K1_PUB,
        };
        let mut buf = encode_uvarint(code);
        buf.extend_from_slice(&self.bytes);
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    /// Decode a Multikey string produced by [`PublicKey::to_multikey`]
    /// (or any DID document carrying a P-256/K-256 key).
    pub fn from_multikey(s: &str) -> Result<Self, CryptoError> {
        let (_base, data) = multibase::decode(s).map_err(|_| CryptoError::MultibaseDecode)?;
        let (code, offset) = decode_uvarint(&data).ok_or(CryptoError::MulticodecDecode)?;
        let curve = match code {
            P256_PUB => KeyCurve::P256,
            SECP256K1_PUB => KeyCurve::K256,
            other => return Err(CryptoError::UnsupportedCodec(other)),
        };
        let bytes = &data[offset..];
        if !(bytes.len() == 33 || bytes.len() == 65) {
            return Err(CryptoError::InvalidPublicKey(format!(
                "SEC1 point must be 33 or 65 bytes, got {}",
                bytes.len()
            )));
        }
        let first = bytes[0];
        if first != 0x02 && first != 0x03 && first != 0x04 {
            return Err(CryptoError::InvalidPublicKey(
                "SEC1 point must start with 0x02, 0x03 or 0x04".into(),
            ));
        }
        Ok(Self {
            curve,
            bytes: Bytes::copy_from_slice(bytes),
        })
    }
}

fn encode_uvarint(mut x: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while x >= 0x80 {
        out.push(((x as u8) & 0x7F) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
    out
}

fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, b) in data.iter().copied().enumerate() {
        if b < 0x80 {
            if i > 9 || (i == 9 && b > 1) {
                return None;
            }
            return Some((x | ((b as u64) << s), i + 1));
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
    }
    None
}

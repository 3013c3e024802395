//! Signing capability and `did:key` verification
//!
//! The rest of the crate only needs two things from cryptography: something
//! that can sign bytes ([`Keypair`]) and a way to check a signature against a
//! `did:key` string ([`verify_signature`]). Three curves are supported:
//! secp256k1, NIST P-256 and Ed25519. ECDSA signatures are 64-byte compact
//! `r || s` with low-S enforced.
//!
//! Multikey decoding and curve conversion come from `jacquard-common`; the
//! encoding direction and the signers live here.

use crate::error::{CommitError, Result};
use bytes::Bytes;
use integer_encoding::VarInt;
use std::borrow::Cow;

pub use jacquard_common::types::crypto::{KeyCodec, PublicKey};

/// Prefix of `did:key` identifiers
pub const DID_KEY_PREFIX: &str = "did:key:";

fn multicodec(codec: KeyCodec) -> u64 {
    match codec {
        KeyCodec::Secp256k1 => 0xE7,
        KeyCodec::P256 => 0x1200,
        KeyCodec::Ed25519 => 0xED,
        KeyCodec::Unknown(code) => code,
    }
}

/// Decode a `did:key:z...` string, or a bare multibase multikey
pub fn decode_did_key(did_key: &str) -> Result<PublicKey<'static>> {
    let multikey = did_key.strip_prefix(DID_KEY_PREFIX).unwrap_or(did_key);
    if !multikey.starts_with('z') {
        return Err(CommitError::InvalidKey("did:key must use base58btc".into()).into());
    }
    PublicKey::decode(multikey).map_err(|e| match e {
        jacquard_common::types::crypto::CryptoError::UnsupportedCodec(code) => {
            CommitError::UnsupportedKeyType(code).into()
        }
        other => CommitError::InvalidKey(other.to_string()).into(),
    })
}

/// Encode a public key as a bare multibase multikey (`z...`)
pub fn to_multikey(key: &PublicKey<'_>) -> String {
    let mut buf = multicodec(key.codec).encode_var_vec();
    buf.extend_from_slice(&key.bytes);
    multibase::encode(multibase::Base::Base58Btc, buf)
}

/// Encode a public key as a `did:key` string
pub fn to_did_key(key: &PublicKey<'_>) -> String {
    format!("{}{}", DID_KEY_PREFIX, to_multikey(key))
}

/// Check `sig` over `data` with `key`.
///
/// A malformed signature is reported as `Ok(false)`; only an unusable key is an error.
pub fn verify_with_key(key: &PublicKey<'_>, data: &[u8], sig: &[u8]) -> Result<bool> {
    let valid = match key.codec {
        KeyCodec::Secp256k1 => {
            use k256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
            let pk = key
                .to_k256()
                .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
            let vk = VerifyingKey::from(&pk);
            match Signature::from_slice(sig) {
                Ok(sig) if sig.normalize_s().is_none() => vk.verify(data, &sig).is_ok(),
                _ => false,
            }
        }
        KeyCodec::P256 => {
            use p256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
            let pk = key
                .to_p256()
                .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
            let vk = VerifyingKey::from(&pk);
            match Signature::from_slice(sig) {
                Ok(sig) if sig.normalize_s().is_none() => vk.verify(data, &sig).is_ok(),
                _ => false,
            }
        }
        KeyCodec::Ed25519 => {
            let vk = key
                .to_ed25519()
                .map_err(|e| CommitError::InvalidKey(e.to_string()))?;
            match ed25519_dalek::Signature::from_slice(sig) {
                Ok(sig) => vk.verify_strict(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        KeyCodec::Unknown(code) => return Err(CommitError::UnsupportedKeyType(code).into()),
    };
    Ok(valid)
}

/// Verify `sig` over `data` against a `did:key`
pub fn verify_signature(did_key: &str, data: &[u8], sig: &[u8]) -> Result<bool> {
    verify_with_key(&decode_did_key(did_key)?, data, sig)
}

/// A private key that can sign repository commits.
///
/// Implemented for `k256::ecdsa::SigningKey`, `p256::ecdsa::SigningKey` and
/// `ed25519_dalek::SigningKey`.
pub trait Keypair: Send + Sync {
    /// Sign `data`, returning the raw signature bytes
    fn sign(&self, data: &[u8]) -> Result<Bytes>;

    /// The matching public key
    fn public_key(&self) -> PublicKey<'static>;

    /// The public key as a `did:key`
    fn did_key(&self) -> String {
        to_did_key(&self.public_key())
    }
}

impl Keypair for k256::ecdsa::SigningKey {
    fn sign(&self, data: &[u8]) -> Result<Bytes> {
        use k256::ecdsa::{Signature, signature::Signer};
        let sig: Signature = Signer::sign(self, data);
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey<'static> {
        let point = self.verifying_key().to_encoded_point(true);
        PublicKey {
            codec: KeyCodec::Secp256k1,
            bytes: Cow::Owned(point.as_bytes().to_vec()),
        }
    }
}

impl Keypair for p256::ecdsa::SigningKey {
    fn sign(&self, data: &[u8]) -> Result<Bytes> {
        use p256::ecdsa::{Signature, signature::Signer};
        let sig: Signature = Signer::sign(self, data);
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey<'static> {
        let point = self.verifying_key().to_encoded_point(true);
        PublicKey {
            codec: KeyCodec::P256,
            bytes: Cow::Owned(point.as_bytes().to_vec()),
        }
    }
}

impl Keypair for ed25519_dalek::SigningKey {
    fn sign(&self, data: &[u8]) -> Result<Bytes> {
        use ed25519_dalek::Signer;
        let sig = Signer::sign(self, data);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey<'static> {
        PublicKey {
            codec: KeyCodec::Ed25519,
            bytes: Cow::Owned(self.verifying_key().as_bytes().to_vec()),
        }
    }
}

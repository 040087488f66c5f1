// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! secp256k1 signing over keccak-256 digests. Every payload crossing a trust
//! boundary (task dispatch, peer score records, chain transactions) is signed
//! with the node key and verified by recovering the signer address against
//! the on-chain registry.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ethereum_types::{H160, H256};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signature recovery failed")]
    Recovery,
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
}

/// 65-byte recoverable ECDSA signature: `r || s || recovery_id`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature(pub [u8; 65]);

impl RecoverableSignature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn recovery_id(&self) -> u8 {
        self.0[64]
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSignature({})", self.to_hex())
    }
}

impl FromStr for RecoverableSignature {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| KeyError::InvalidSignature)?;
        let bytes: [u8; 65] = raw.try_into().map_err(|_| KeyError::InvalidSignature)?;
        Ok(RecoverableSignature(bytes))
    }
}

impl Serialize for RecoverableSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecoverableSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Node signing key with its derived EVM address.
pub struct Signer {
    key: SigningKey,
    address: H160,
}

impl Signer {
    pub fn random() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, KeyError> {
        let key = SigningKey::from_slice(raw).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    pub fn from_hex(raw: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn address(&self) -> H160 {
        self.address
    }

    /// Sign a 32-byte digest, producing a recoverable signature with a
    /// low-`s` component.
    pub fn sign_digest(&self, digest: H256) -> Result<RecoverableSignature, KeyError> {
        let (mut sig, mut recid) = self
            .key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|_| KeyError::Recovery)?;
        if let Some(normalized) = sig.normalize_s() {
            sig = normalized;
            recid = RecoveryId::from_byte(recid.to_byte() ^ 1).ok_or(KeyError::Recovery)?;
        }

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        Ok(RecoverableSignature(out))
    }

    /// Load the key from `path`, generating and persisting a fresh one when
    /// the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            return Self::from_hex(&raw);
        }

        let signer = Self::random();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, signer.to_hex())?;
        // Restrict permissions on files containing private keys
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        log::info!("generated new node key at {}", path.display());
        Ok(signer)
    }
}

/// Recover the signer address of `sig` over `digest`.
pub fn recover_address(digest: H256, sig: &RecoverableSignature) -> Result<H160, KeyError> {
    let signature =
        Signature::from_slice(&sig.0[..64]).map_err(|_| KeyError::InvalidSignature)?;
    let recid = RecoveryId::from_byte(sig.recovery_id()).ok_or(KeyError::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recid)
        .map_err(|_| KeyError::Recovery)?;
    Ok(address_of(&key))
}

fn address_of(key: &VerifyingKey) -> H160 {
    let point = key.to_encoded_point(false);
    let hash = keccak_hash::keccak(&point.as_bytes()[1..]);
    H160::from_slice(&hash.as_bytes()[12..])
}

/// keccak-256 convenience over arbitrary bytes, returned as an
/// `ethereum_types::H256`.
pub fn keccak256(data: impl AsRef<[u8]>) -> H256 {
    let hash = keccak_hash::keccak(data.as_ref());
    H256::from_slice(hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover() {
        let signer = Signer::random();
        let digest = keccak256(b"payload");
        let sig = signer.sign_digest(digest).unwrap();
        let recovered = recover_address(digest, &sig).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn recover_rejects_wrong_digest() {
        let signer = Signer::random();
        let sig = signer.sign_digest(keccak256(b"a")).unwrap();
        // Recovery over a different digest yields a different address (or an
        // error), never the signer.
        match recover_address(keccak256(b"b"), &sig) {
            Ok(addr) => assert_ne!(addr, signer.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn hex_round_trip() {
        let signer = Signer::random();
        let back = Signer::from_hex(&signer.to_hex()).unwrap();
        assert_eq!(signer.address(), back.address());
    }

    #[test]
    fn load_or_generate_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyfile");
        let first = Signer::load_or_generate(&path).unwrap();
        let second = Signer::load_or_generate(&path).unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn signature_serde_round_trip() {
        let signer = Signer::random();
        let sig = signer.sign_digest(keccak256(b"x")).unwrap();
        let raw = serde_json::to_string(&sig).unwrap();
        let back: RecoverableSignature = serde_json::from_str(&raw).unwrap();
        assert_eq!(sig, back);
    }

    #[test]
    fn known_address_derivation() {
        // Private key 0x...01 has the well-known address
        // 0x7e5f4552091a69125d5dfcb7b8c2659029395bdf.
        let mut raw = [0u8; 32];
        raw[31] = 1;
        let signer = Signer::from_slice(&raw).unwrap();
        assert_eq!(
            signer.address(),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
                .parse()
                .unwrap()
        );
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Core identifier and registry types shared across the node. These mirror
//! the on-chain registry layout; all score-like quantities cross the chain
//! boundary in scaled integer form (divisor [`SCALE_DIVISOR`]).

use std::fmt;
use std::str::FromStr;

use ethereum_types::{H160, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

/// Fixed-point divisor for on-chain trust and performance values.
pub const SCALE_DIVISOR: u64 = 1_000_000;

pub type SubnetId = u64;
pub type SlotNumber = u64;

/// Convert a quality score in `[0, 1]` to scaled integer form. Values are
/// clamped first, then rounded half to even so equal inputs always commit to
/// equal integers across validators.
pub fn scale_score(score: f64) -> u64 {
    let clamped = score.clamp(0.0, 1.0);
    (clamped * SCALE_DIVISOR as f64).round_ties_even() as u64
}

/// Inverse of [`scale_score`].
pub fn unscale_score(scaled: u64) -> f64 {
    scaled.min(SCALE_DIVISOR) as f64 / SCALE_DIVISOR as f64
}

/// 32-byte opaque UID matching the on-chain registry. Serialized as a hex
/// string in JSON payloads and used raw in store keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uid(pub [u8; 32]);

impl Uid {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Uid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs, full form is available through `to_hex`.
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.to_hex())
    }
}

impl FromStr for Uid {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Uid(bytes))
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        Uid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Registry status of a miner or validator hotkey.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Inactive,
    Active,
    Jailed,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStatus::Inactive => write!(f, "inactive"),
            RegistrationStatus::Active => write!(f, "active"),
            RegistrationStatus::Jailed => write!(f, "jailed"),
        }
    }
}

/// Miner registry entry, cached locally from the chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MinerEntry {
    pub uid: Uid,
    pub subnet: SubnetId,
    pub owner: H160,
    pub stake: U256,
    pub btc_stake: U256,
    pub scaled_last_performance: u64,
    pub scaled_trust_score: u64,
    pub accumulated_rewards: U256,
    pub last_update_time: u64,
    pub api_endpoint: Option<Url>,
    pub status: RegistrationStatus,
    pub registration_time: u64,
}

impl MinerEntry {
    pub fn is_active(&self) -> bool {
        self.status == RegistrationStatus::Active
    }

    /// Trust score in `[0, 1]`.
    pub fn trust(&self) -> f64 {
        unscale_score(self.scaled_trust_score)
    }
}

/// Validator registry entry. Same shape as a miner entry plus the stake- and
/// performance-derived weight the chain assigns to the validator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorEntry {
    pub uid: Uid,
    pub subnet: SubnetId,
    pub owner: H160,
    pub stake: U256,
    pub btc_stake: U256,
    pub scaled_last_performance: u64,
    pub scaled_trust_score: u64,
    pub accumulated_rewards: U256,
    pub last_update_time: u64,
    pub api_endpoint: Option<Url>,
    pub status: RegistrationStatus,
    pub registration_time: u64,
    pub weight: u64,
}

impl ValidatorEntry {
    pub fn is_active(&self) -> bool {
        self.status == RegistrationStatus::Active
    }

    pub fn trust(&self) -> f64 {
        unscale_score(self.scaled_trust_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn scale_rounds_half_to_even() {
        // 0.0000005 * 1e6 = 0.5 exactly; ties round to even (0).
        assert_eq!(scale_score(0.000_000_5), 0);
        assert_eq!(scale_score(0.000_001_5), 2);
        assert_eq!(scale_score(1.5), SCALE_DIVISOR);
        assert_eq!(scale_score(-0.25), 0);
        assert_eq!(scale_score(2.0 / 3.0), 666_667);
    }

    #[test]
    fn uid_hex_round_trip() {
        let uid = Uid([0xab; 32]);
        let s = serde_json::to_string(&uid).unwrap();
        let back: Uid = serde_json::from_str(&s).unwrap();
        assert_eq!(uid, back);
        assert_eq!(uid.to_hex().parse::<Uid>().unwrap(), uid);
    }

    #[test]
    fn uid_rejects_bad_length() {
        assert!("abcd".parse::<Uid>().is_err());
    }

    #[quickcheck]
    fn unscale_stays_in_unit_interval(scaled: u64) -> bool {
        let v = unscale_score(scaled);
        (0.0..=1.0).contains(&v)
    }

    #[quickcheck]
    fn scale_unscale_is_identity_on_scaled(scaled: u64) -> bool {
        let scaled = scaled % (SCALE_DIVISOR + 1);
        scale_score(unscale_score(scaled)) == scaled
    }
}

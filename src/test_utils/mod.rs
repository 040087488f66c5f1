// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared fixtures for unit tests.

use ethereum_types::{H160, U256};

use crate::key::Signer;
use crate::types::{MinerEntry, RegistrationStatus, Uid, ValidatorEntry};

pub fn uid(seed: u8) -> Uid {
    Uid([seed; 32])
}

pub fn miner_entry(seed: u8, scaled_trust: u64) -> MinerEntry {
    MinerEntry {
        uid: uid(seed),
        subnet: 7,
        owner: H160::repeat_byte(seed),
        stake: U256::from(1_000u64),
        btc_stake: U256::zero(),
        scaled_last_performance: 0,
        scaled_trust_score: scaled_trust,
        accumulated_rewards: U256::zero(),
        last_update_time: 0,
        api_endpoint: Some(
            format!("http://miner-{seed}.example:8080")
                .parse()
                .expect("static url"),
        ),
        status: RegistrationStatus::Active,
        registration_time: 0,
    }
}

pub fn validator_entry(seed: u8, scaled_trust: u64) -> ValidatorEntry {
    ValidatorEntry {
        uid: uid(seed),
        subnet: 7,
        owner: H160::repeat_byte(seed),
        stake: U256::from(10_000u64),
        btc_stake: U256::zero(),
        scaled_last_performance: 0,
        scaled_trust_score: scaled_trust,
        accumulated_rewards: U256::zero(),
        last_update_time: 0,
        api_endpoint: Some(
            format!("http://validator-{seed}.example:9944")
                .parse()
                .expect("static url"),
        ),
        status: RegistrationStatus::Active,
        registration_time: 0,
        weight: scaled_trust,
    }
}

/// A validator entry whose owner address matches a usable signing key.
pub fn validator_with_signer(seed: u8, scaled_trust: u64) -> (ValidatorEntry, Signer) {
    let mut raw = [0u8; 32];
    raw[31] = seed.max(1);
    let signer = Signer::from_slice(&raw).expect("static key material");
    let mut entry = validator_entry(seed, scaled_trust);
    entry.owner = signer.address();
    (entry, signer)
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Minimal ABI encoding for the one contract call the node makes:
//! `updateScores(uint64,uint64,address[],uint64[],uint64[])`.

use ethereum_types::H160;

use super::ScoreBatch;
use crate::key::keccak256;

const UPDATE_SCORES_SIGNATURE: &str = "updateScores(uint64,uint64,address[],uint64[],uint64[])";
const WORD: usize = 32;

fn word_u64(value: u64) -> [u8; WORD] {
    let mut out = [0u8; WORD];
    out[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    out
}

fn word_address(address: &H160) -> [u8; WORD] {
    let mut out = [0u8; WORD];
    out[WORD - 20..].copy_from_slice(address.as_bytes());
    out
}

fn append_u64_array(out: &mut Vec<u8>, values: &[u64]) {
    out.extend_from_slice(&word_u64(values.len() as u64));
    for v in values {
        out.extend_from_slice(&word_u64(*v));
    }
}

/// Four-byte selector of the update call.
pub fn update_scores_selector() -> [u8; 4] {
    let hash = keccak256(UPDATE_SCORES_SIGNATURE.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&hash.as_bytes()[..4]);
    selector
}

/// ABI-encode the full calldata for one batch update.
pub fn encode_update_scores(batch: &ScoreBatch) -> Vec<u8> {
    // Head: two static words plus three offsets into the tail section.
    let head_len = 5 * WORD;
    let array_len = |n: usize| (1 + n) * WORD;

    let miners_offset = head_len;
    let perf_offset = miners_offset + array_len(batch.miners.len());
    let trust_offset = perf_offset + array_len(batch.perf.len());

    let mut out = Vec::with_capacity(4 + trust_offset + array_len(batch.trust.len()));
    out.extend_from_slice(&update_scores_selector());
    out.extend_from_slice(&word_u64(batch.subnet));
    out.extend_from_slice(&word_u64(batch.slot));
    out.extend_from_slice(&word_u64(miners_offset as u64));
    out.extend_from_slice(&word_u64(perf_offset as u64));
    out.extend_from_slice(&word_u64(trust_offset as u64));

    out.extend_from_slice(&word_u64(batch.miners.len() as u64));
    for address in &batch.miners {
        out.extend_from_slice(&word_address(address));
    }
    append_u64_array(&mut out, &batch.perf);
    append_u64_array(&mut out, &batch.trust);
    out
}

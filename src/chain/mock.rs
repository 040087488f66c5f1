// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;

use async_trait::async_trait;
use ethereum_types::H256;
use parking_lot::Mutex;

use super::{ChainClient, Error, ScoreBatch, SubmitFailure, SubnetParams, TxReceipt};
use crate::key::keccak256;
use crate::types::{MinerEntry, SubnetId, ValidatorEntry};

#[derive(Default)]
struct MockState {
    params: SubnetParams,
    miners: Vec<MinerEntry>,
    validators: Vec<ValidatorEntry>,
    head_timestamp: u64,
    submitted: Vec<(H256, ScoreBatch)>,
    receipts: HashMap<H256, TxReceipt>,
    /// Count of submissions that fail with a transport error before landing.
    fail_submits: u32,
    /// Count of submissions that land on chain but whose response is lost.
    lose_responses: u32,
    /// Fail every submission once this many batches have landed.
    fail_after: Option<u64>,
    /// Count of receipt polls answered with `None` even though the receipt
    /// exists; models a lost response reconciled by hash lookup.
    defer_receipts: u32,
    /// Count of refreshes that fail, for staleness tests.
    fail_reads: u32,
    block_number: u64,
}

/// In-memory chain used by tests: registry state is set directly, submissions
/// succeed immediately and receipts are served from a map. Failure injection
/// covers transport errors and lost receipt responses.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_params(&self, params: SubnetParams) {
        self.state.lock().params = params;
    }

    pub fn set_miners(&self, miners: Vec<MinerEntry>) {
        self.state.lock().miners = miners;
    }

    pub fn set_validators(&self, validators: Vec<ValidatorEntry>) {
        self.state.lock().validators = validators;
    }

    pub fn set_head_timestamp(&self, ts: u64) {
        self.state.lock().head_timestamp = ts;
    }

    pub fn fail_next_submits(&self, n: u32) {
        self.state.lock().fail_submits = n;
    }

    pub fn lose_next_submit_responses(&self, n: u32) {
        self.state.lock().lose_responses = n;
    }

    /// Accept `n` batches, then fail submissions until cleared with `None`.
    pub fn fail_submits_after(&self, n: Option<u64>) {
        self.state.lock().fail_after = n;
    }

    pub fn defer_next_receipts(&self, n: u32) {
        self.state.lock().defer_receipts = n;
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().fail_reads = n;
    }

    /// Batches accepted on chain, in submission order.
    pub fn submitted(&self) -> Vec<ScoreBatch> {
        self.state
            .lock()
            .submitted
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }
}

fn read_guard(state: &mut MockState) -> Result<(), Error> {
    if state.fail_reads > 0 {
        state.fail_reads -= 1;
        return Err(Error::Transport("mock chain read failure".into()));
    }
    Ok(())
}

#[async_trait]
impl ChainClient for MockChain {
    async fn subnet_params(&self, _subnet: SubnetId) -> Result<SubnetParams, Error> {
        let mut state = self.state.lock();
        read_guard(&mut state)?;
        Ok(state.params)
    }

    async fn subnet_miners(&self, _subnet: SubnetId) -> Result<Vec<MinerEntry>, Error> {
        let mut state = self.state.lock();
        read_guard(&mut state)?;
        Ok(state.miners.clone())
    }

    async fn subnet_validators(&self, _subnet: SubnetId) -> Result<Vec<ValidatorEntry>, Error> {
        let mut state = self.state.lock();
        read_guard(&mut state)?;
        Ok(state.validators.clone())
    }

    async fn chain_head_timestamp(&self) -> Result<u64, Error> {
        let mut state = self.state.lock();
        read_guard(&mut state)?;
        Ok(state.head_timestamp)
    }

    async fn submit_score_batch(&self, batch: &ScoreBatch) -> Result<H256, SubmitFailure> {
        let mut state = self.state.lock();
        if state.fail_submits > 0 {
            state.fail_submits -= 1;
            return Err(SubmitFailure {
                tx_hash: None,
                error: Error::Transport("mock chain submit failure".into()),
            });
        }
        if let Some(limit) = state.fail_after {
            if state.submitted.len() as u64 >= limit {
                return Err(SubmitFailure {
                    tx_hash: None,
                    error: Error::Transport("mock chain submit failure".into()),
                });
            }
        }

        let seq = state.submitted.len() as u64;
        let mut preimage = serde_json::to_vec(batch).expect("batch must serialize");
        preimage.extend_from_slice(&seq.to_be_bytes());
        let hash = keccak256(&preimage);

        state.block_number += 1;
        let block_number = state.block_number;
        state.submitted.push((hash, batch.clone()));
        state.receipts.insert(
            hash,
            TxReceipt {
                transaction_hash: hash,
                block_number,
                success: true,
            },
        );

        if state.lose_responses > 0 {
            state.lose_responses -= 1;
            return Err(SubmitFailure {
                tx_hash: Some(hash),
                error: Error::Transport("mock chain response lost".into()),
            });
        }
        Ok(hash)
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, Error> {
        let mut state = self.state.lock();
        if state.defer_receipts > 0 && state.receipts.contains_key(&tx_hash) {
            state.defer_receipts -= 1;
            return Ok(None);
        }
        Ok(state.receipts.get(&tx_hash).copied())
    }

    async fn transaction_exists(&self, tx_hash: H256) -> Result<bool, Error> {
        Ok(self.state.lock().receipts.contains_key(&tx_hash))
    }
}

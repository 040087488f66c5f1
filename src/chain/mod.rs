// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain access. [`ChainClient`] is the only path to the chain: the
//! metagraph cache reads through it and the committer writes through it, so
//! the rest of the pipeline stays free of live chain references.

pub mod abi;
mod mock;
mod rpc;
mod tx;

pub use mock::MockChain;
pub use rpc::EthRpcClient;

use async_trait::async_trait;
use ethereum_types::{H160, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MinerEntry, SlotNumber, SubnetId, ValidatorEntry};

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed chain response: {0}")]
    Decode(String),
    #[error("transaction build failed: {0}")]
    Tx(String),
}

impl Error {
    /// Transient errors are worth retrying within the phase budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            // Server-side failures are treated as transient, well-known
            // client errors are final.
            Error::Rpc { code, .. } => *code == -32005 || *code >= -32099 && *code <= -32000,
            Error::Decode(_) | Error::Tx(_) => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Subnet-level parameters read from the registry contract.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubnetParams {
    pub subnet_id: SubnetId,
    /// Starvation bonus factor for miner selection.
    pub selection_beta: f64,
    /// Cap on the starvation bonus, in slots.
    pub selection_bmax: u64,
    /// Contract-side ceiling on entries per batch update call.
    pub max_update_batch: usize,
}

impl Default for SubnetParams {
    fn default() -> Self {
        Self {
            subnet_id: 0,
            selection_beta: 0.1,
            selection_bmax: 16,
            max_update_batch: 64,
        }
    }
}

/// One batch score-update call: parallel arrays of miner addresses and their
/// new scaled performance and trust values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBatch {
    pub subnet: SubnetId,
    pub slot: SlotNumber,
    pub miners: Vec<H160>,
    pub perf: Vec<u64>,
    pub trust: Vec<u64>,
}

impl ScoreBatch {
    pub fn len(&self) -> usize {
        self.miners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.miners.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub success: bool,
}

/// A failed submission. When the transaction was signed locally its hash is
/// known even if the response was lost, which lets the committer reconcile
/// by hash lookup instead of submitting twice.
#[derive(Debug)]
pub struct SubmitFailure {
    pub tx_hash: Option<H256>,
    pub error: Error,
}

impl std::fmt::Display for SubmitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

/// Interface to the chain node and the registry contract. Reads are served
/// from the node's JSON-RPC surface; the single write is the batch score
/// update.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn subnet_params(&self, subnet: SubnetId) -> Result<SubnetParams, Error>;

    async fn subnet_miners(&self, subnet: SubnetId) -> Result<Vec<MinerEntry>, Error>;

    async fn subnet_validators(&self, subnet: SubnetId) -> Result<Vec<ValidatorEntry>, Error>;

    /// Timestamp of the latest chain head; the drift guard compares it
    /// against the local clock.
    async fn chain_head_timestamp(&self) -> Result<u64, Error>;

    /// Submit one signed batch update, returning the transaction hash.
    async fn submit_score_batch(&self, batch: &ScoreBatch) -> Result<H256, SubmitFailure>;

    /// Fetch the receipt for a transaction, `None` while still pending.
    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, Error>;

    /// Whether the transaction is known to the node (mempool or mined). Used
    /// to reconcile a submission whose response was lost.
    async fn transaction_exists(&self, tx_hash: H256) -> Result<bool, Error>;
}

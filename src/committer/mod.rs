// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! On-chain batch commit. One logical commit per (validator, slot): the
//! SlotAck gates resubmission, oversized batches split into ordered chunks,
//! and a submission whose response was lost is reconciled by transaction
//! hash before anything is sent twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainClient, ScoreBatch, TxReceipt};
use crate::consensus::MinerUpdate;
use crate::db::Store;
use crate::metrics;
use crate::state::{MinerSlotUpdate, StateStore};
use crate::types::{SlotNumber, SubnetId};

/// Ack payload written for a slot that required no chain transaction.
const LOCAL_ONLY_RECEIPT: &[u8] = b"local-only";

#[derive(Clone, Debug)]
pub struct CommitterConfig {
    pub retries: u32,
    pub poll_interval: Duration,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Terminal result of a slot's commit phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { receipts: Vec<H256> },
    /// A SlotAck already existed; the prior receipt is returned unchanged.
    AlreadyCommitted { receipt: Vec<u8> },
    /// Some chunks landed, some did not; recorded durably for resumption.
    Incomplete { done: usize, total: usize },
    Failed { reason: String },
    /// Nothing was evaluated and nothing was selected.
    NothingToCommit,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct ChunkRecord {
    batch: ScoreBatch,
    tx_hash: Option<H256>,
    receipt_hash: Option<H256>,
}

/// Durable record of a partially committed slot.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct PendingCommit {
    state_updates: Vec<MinerSlotUpdate>,
    chunks: Vec<ChunkRecord>,
}

pub struct ChainCommitter<DB> {
    chain: Arc<dyn ChainClient>,
    state: Arc<StateStore<DB>>,
    subnet: SubnetId,
    config: CommitterConfig,
}

impl<DB: Store> ChainCommitter<DB> {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        state: Arc<StateStore<DB>>,
        subnet: SubnetId,
        config: CommitterConfig,
    ) -> Self {
        Self {
            chain,
            state,
            subnet,
            config,
        }
    }

    fn build_chunks(
        &self,
        slot: SlotNumber,
        evaluated: &[MinerUpdate],
        max_batch: usize,
    ) -> Vec<ChunkRecord> {
        let max_batch = max_batch.max(1);
        evaluated
            .chunks(max_batch)
            .map(|piece| ChunkRecord {
                batch: ScoreBatch {
                    subnet: self.subnet,
                    slot,
                    miners: piece.iter().map(|u| u.address).collect(),
                    perf: piece.iter().map(|u| u.scaled_performance).collect(),
                    trust: piece.iter().map(|u| u.scaled_trust).collect(),
                },
                tx_hash: None,
                receipt_hash: None,
            })
            .collect()
    }

    /// Commit the slot's updates. `evaluated` drives the chain batch,
    /// `state_updates` is what lands in the local store once the chain
    /// accepted everything.
    pub async fn commit_slot(
        &self,
        slot: SlotNumber,
        evaluated: &[MinerUpdate],
        state_updates: &[MinerSlotUpdate],
        max_batch: usize,
        deadline: DateTime<Utc>,
    ) -> CommitOutcome {
        match self.state.get_slot_ack(slot) {
            Ok(Some(receipt)) => {
                log::info!("slot {slot} already committed, returning prior receipt");
                return CommitOutcome::AlreadyCommitted { receipt };
            }
            Ok(None) => {}
            Err(e) => {
                return CommitOutcome::Failed {
                    reason: format!("slot ack lookup failed: {e}"),
                }
            }
        }

        if evaluated.is_empty() {
            if state_updates.is_empty() {
                return CommitOutcome::NothingToCommit;
            }
            // Selection happened but nothing was evaluated; the slot still
            // acks locally so selection history advances exactly once.
            return match self.state.apply_slot_update(slot, state_updates, LOCAL_ONLY_RECEIPT) {
                Ok(_) => CommitOutcome::Committed { receipts: vec![] },
                Err(e) => CommitOutcome::Failed {
                    reason: format!("state application failed: {e}"),
                },
            };
        }

        let chunks = self.build_chunks(slot, evaluated, max_batch);
        self.drive_chunks(slot, state_updates.to_vec(), chunks, deadline)
            .await
    }

    /// Resume a slot previously left `commit_incomplete`. Returns `None`
    /// when there is nothing pending.
    pub async fn resume_pending(
        &self,
        slot: SlotNumber,
        deadline: DateTime<Utc>,
    ) -> Option<CommitOutcome> {
        let raw = match self.state.get_pending_commit(slot) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                return Some(CommitOutcome::Failed {
                    reason: format!("pending commit lookup failed: {e}"),
                })
            }
        };
        let pending: PendingCommit = match serde_json::from_slice(&raw) {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("corrupt pending commit record for slot {slot}: {e}");
                let _ = self.state.clear_pending_commit(slot);
                return Some(CommitOutcome::Failed {
                    reason: "corrupt pending commit record".into(),
                });
            }
        };
        log::info!("resuming incomplete commit of slot {slot}");
        Some(
            self.drive_chunks(slot, pending.state_updates, pending.chunks, deadline)
                .await,
        )
    }

    async fn drive_chunks(
        &self,
        slot: SlotNumber,
        state_updates: Vec<MinerSlotUpdate>,
        mut chunks: Vec<ChunkRecord>,
        deadline: DateTime<Utc>,
    ) -> CommitOutcome {
        let total = chunks.len();
        let mut failure: Option<String> = None;

        for chunk in chunks.iter_mut() {
            if chunk.receipt_hash.is_some() {
                continue;
            }
            match self.complete_chunk(chunk, deadline).await {
                Ok(receipt) => chunk.receipt_hash = Some(receipt.transaction_hash),
                Err(reason) => {
                    failure = Some(reason);
                    break;
                }
            }
        }

        let done = chunks.iter().filter(|c| c.receipt_hash.is_some()).count();
        if done == total {
            let receipts: Vec<H256> = chunks
                .iter()
                .filter_map(|c| c.receipt_hash)
                .collect();
            let ack = serde_json::to_vec(&receipts).expect("receipt hashes must serialize");
            return match self.state.apply_slot_update(slot, &state_updates, &ack) {
                Ok(_) => CommitOutcome::Committed { receipts },
                Err(e) => CommitOutcome::Failed {
                    reason: format!("state application failed: {e}"),
                },
            };
        }

        let reason = failure.unwrap_or_else(|| "commit deadline elapsed".into());
        if done == 0 {
            metrics::COMMIT_FAILURE_TOTAL.inc();
            log::warn!("slot {slot} commit failed, local state untouched: {reason}");
            return CommitOutcome::Failed { reason };
        }

        // Partial success: keep what landed, resume next slot.
        let pending = PendingCommit {
            state_updates,
            chunks,
        };
        let raw = serde_json::to_vec(&pending).expect("pending commit must serialize");
        if let Err(e) = self.state.set_pending_commit(slot, &raw) {
            log::error!("failed to persist pending commit for slot {slot}: {e}");
        }
        log::warn!("slot {slot} commit incomplete ({done}/{total} chunks): {reason}");
        CommitOutcome::Incomplete { done, total }
    }

    /// Drive one chunk to a receipt, retrying within the configured budget.
    /// Before resubmitting after a lost response the transaction is looked
    /// up by hash, so a landed submission is adopted rather than repeated.
    async fn complete_chunk(
        &self,
        chunk: &mut ChunkRecord,
        deadline: DateTime<Utc>,
    ) -> Result<TxReceipt, String> {
        let mut attempt: u32 = 0;
        loop {
            if attempt > self.config.retries {
                return Err("commit retries exhausted".into());
            }
            if Utc::now() >= deadline {
                return Err("commit deadline elapsed".into());
            }
            if attempt > 0 {
                let backoff = self.config.poll_interval * 2u32.pow(attempt.min(6));
                tokio::time::sleep(backoff).await;
            }
            attempt += 1;

            if chunk.tx_hash.is_none() {
                match self.chain.submit_score_batch(&chunk.batch).await {
                    Ok(hash) => chunk.tx_hash = Some(hash),
                    Err(failure) => {
                        chunk.tx_hash = failure.tx_hash;
                        if chunk.tx_hash.is_none() {
                            if !failure.error.is_transient() {
                                return Err(format!("submission failed: {}", failure.error));
                            }
                            continue;
                        }
                        log::debug!(
                            "submission response lost, reconciling by hash: {}",
                            failure.error
                        );
                    }
                }
            }
            let hash = chunk.tx_hash.expect("hash is set before polling");

            // Poll for the receipt within this attempt's window.
            let window = chrono::Duration::from_std(self.config.poll_interval * 4)
                .unwrap_or_else(|_| chrono::Duration::seconds(2));
            let window_end = (Utc::now() + window).min(deadline);
            loop {
                match self.chain.receipt(hash).await {
                    Ok(Some(receipt)) if receipt.success => return Ok(receipt),
                    Ok(Some(_)) => return Err("transaction reverted".into()),
                    Ok(None) => {}
                    Err(e) => log::debug!("receipt poll failed: {e}"),
                }
                if Utc::now() >= window_end {
                    break;
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }

            // Still no receipt. A transaction unknown to the node was lost
            // in transit and is safe to submit again.
            if let Ok(false) = self.chain.transaction_exists(hash).await {
                chunk.tx_hash = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::consensus::MinerUpdate;
    use crate::db::MemoryDB;
    use crate::state::ScaledScores;
    use crate::test_utils::uid;
    use ethereum_types::H160;

    fn fast_config() -> CommitterConfig {
        CommitterConfig {
            retries: 3,
            poll_interval: Duration::from_millis(5),
        }
    }

    fn committer(
        chain: Arc<MockChain>,
    ) -> (ChainCommitter<MemoryDB>, Arc<StateStore<MemoryDB>>) {
        let state = Arc::new(StateStore::new(MemoryDB::default(), 8));
        (
            ChainCommitter::new(chain, state.clone(), 7, fast_config()),
            state,
        )
    }

    fn update(seed: u8, perf: u64, trust: u64) -> MinerUpdate {
        MinerUpdate {
            miner: uid(seed),
            address: H160::repeat_byte(seed),
            p_agg: perf as f64 / 1e6,
            trust: trust as f64 / 1e6,
            scaled_performance: perf,
            scaled_trust: trust,
        }
    }

    fn state_update(seed: u8, perf: u64, trust: u64) -> MinerSlotUpdate {
        MinerSlotUpdate {
            miner: uid(seed),
            selected: true,
            scores: Some(ScaledScores {
                performance: perf,
                trust,
            }),
        }
    }

    fn deadline() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(20)
    }

    #[tokio::test]
    async fn commit_writes_batch_and_state() {
        let chain = Arc::new(MockChain::new());
        let (committer, state) = committer(chain.clone());

        let outcome = committer
            .commit_slot(
                9,
                &[update(1, 900_000, 542_419)],
                &[state_update(1, 900_000, 542_419)],
                64,
                deadline(),
            )
            .await;
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));

        let submitted = chain.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].slot, 9);
        assert_eq!(submitted[0].miners, vec![H160::repeat_byte(1)]);
        assert_eq!(submitted[0].perf, vec![900_000]);
        assert_eq!(submitted[0].trust, vec![542_419]);

        let trust = state.get_trust_state(&uid(1)).unwrap().unwrap();
        assert_eq!(trust.scaled_trust, 542_419);
        assert!(state.get_slot_ack(9).unwrap().is_some());
    }

    #[tokio::test]
    async fn replay_returns_prior_receipt_without_submitting() {
        let chain = Arc::new(MockChain::new());
        let (committer, state) = committer(chain.clone());
        let evaluated = [update(1, 900_000, 542_419)];
        let updates = [state_update(1, 900_000, 542_419)];

        let first = committer
            .commit_slot(9, &evaluated, &updates, 64, deadline())
            .await;
        assert!(matches!(first, CommitOutcome::Committed { .. }));
        let ack = state.get_slot_ack(9).unwrap().unwrap();

        let second = committer
            .commit_slot(9, &evaluated, &updates, 64, deadline())
            .await;
        assert_eq!(second, CommitOutcome::AlreadyCommitted { receipt: ack });
        assert_eq!(chain.submitted().len(), 1);
    }

    #[tokio::test]
    async fn transient_submit_failure_is_retried() {
        let chain = Arc::new(MockChain::new());
        chain.fail_next_submits(2);
        let (committer, _state) = committer(chain.clone());

        let outcome = committer
            .commit_slot(
                9,
                &[update(1, 900_000, 542_419)],
                &[state_update(1, 900_000, 542_419)],
                64,
                deadline(),
            )
            .await;
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        assert_eq!(chain.submitted().len(), 1);
    }

    /// A submission whose response is lost is found again by hash; no second
    /// transaction goes out.
    #[tokio::test]
    async fn lost_response_reconciled_by_hash_lookup() {
        let chain = Arc::new(MockChain::new());
        chain.lose_next_submit_responses(1);
        let (committer, state) = committer(chain.clone());

        let outcome = committer
            .commit_slot(
                9,
                &[update(1, 900_000, 542_419)],
                &[state_update(1, 900_000, 542_419)],
                64,
                deadline(),
            )
            .await;
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        assert_eq!(chain.submitted().len(), 1);
        assert!(state.get_slot_ack(9).unwrap().is_some());
    }

    #[tokio::test]
    async fn persistent_failure_leaves_state_untouched() {
        let chain = Arc::new(MockChain::new());
        chain.fail_next_submits(64);
        let (committer, state) = committer(chain.clone());

        let outcome = committer
            .commit_slot(
                9,
                &[update(1, 900_000, 542_419)],
                &[state_update(1, 900_000, 542_419)],
                64,
                deadline(),
            )
            .await;
        assert!(matches!(outcome, CommitOutcome::Failed { .. }));
        assert_eq!(state.get_trust_state(&uid(1)).unwrap(), None);
        assert_eq!(state.get_slot_ack(9).unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_batch_is_chunked_in_order() {
        let chain = Arc::new(MockChain::new());
        let (committer, _state) = committer(chain.clone());

        let evaluated: Vec<MinerUpdate> =
            (1u8..=5).map(|i| update(i, 100_000, 200_000)).collect();
        let state_updates: Vec<MinerSlotUpdate> =
            (1u8..=5).map(|i| state_update(i, 100_000, 200_000)).collect();

        let outcome = committer
            .commit_slot(9, &evaluated, &state_updates, 2, deadline())
            .await;
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));

        let submitted = chain.submitted();
        assert_eq!(submitted.len(), 3);
        assert_eq!(submitted[0].miners.len(), 2);
        assert_eq!(submitted[1].miners.len(), 2);
        assert_eq!(submitted[2].miners.len(), 1);
        assert_eq!(submitted[0].miners[0], H160::repeat_byte(1));
        assert_eq!(submitted[2].miners[0], H160::repeat_byte(5));
    }

    #[tokio::test]
    async fn partial_chunks_resume_in_next_commit_phase() {
        let chain = Arc::new(MockChain::new());
        let (committer, state) = committer(chain.clone());

        let evaluated: Vec<MinerUpdate> =
            (1u8..=4).map(|i| update(i, 100_000, 200_000)).collect();
        let state_updates: Vec<MinerSlotUpdate> =
            (1u8..=4).map(|i| state_update(i, 100_000, 200_000)).collect();

        // The first chunk lands, everything after fails this slot.
        chain.fail_submits_after(Some(1));
        let outcome = committer
            .commit_slot(9, &evaluated, &state_updates, 2, deadline())
            .await;
        assert_eq!(outcome, CommitOutcome::Incomplete { done: 1, total: 2 });
        // Nothing applied locally yet.
        assert_eq!(state.get_slot_ack(9).unwrap(), None);
        assert!(state.get_pending_commit(9).unwrap().is_some());

        // Next slot's commit phase: chain healthy again, resume completes.
        chain.fail_submits_after(None);
        let outcome = committer.resume_pending(9, deadline()).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        assert!(state.get_slot_ack(9).unwrap().is_some());
        assert_eq!(state.get_pending_commit(9).unwrap(), None);
        assert_eq!(chain.submitted().len(), 2);
        let trust = state.get_trust_state(&uid(4)).unwrap().unwrap();
        assert_eq!(trust.scaled_trust, 200_000);
    }

    #[tokio::test]
    async fn selection_only_slot_acks_locally() {
        let chain = Arc::new(MockChain::new());
        let (committer, state) = committer(chain.clone());

        let state_updates = [MinerSlotUpdate {
            miner: uid(3),
            selected: true,
            scores: None,
        }];
        let outcome = committer
            .commit_slot(9, &[], &state_updates, 64, deadline())
            .await;
        assert_eq!(outcome, CommitOutcome::Committed { receipts: vec![] });
        assert!(chain.submitted().is_empty());
        assert_eq!(
            state.get_trust_state(&uid(3)).unwrap().unwrap().last_selected_slot,
            Some(9)
        );
    }

    #[tokio::test]
    async fn empty_slot_is_nothing_to_commit() {
        let chain = Arc::new(MockChain::new());
        let (committer, state) = committer(chain.clone());
        let outcome = committer.commit_slot(9, &[], &[], 64, deadline()).await;
        assert_eq!(outcome, CommitOutcome::NothingToCommit);
        assert_eq!(state.get_slot_ack(9).unwrap(), None);
    }
}

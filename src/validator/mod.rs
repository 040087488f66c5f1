// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The validator slot driver. One long-lived task walks the slot phases in
//! program order, feeding the dispatcher, scorer, exchange, consensus engine
//! and committer; commits serialize across slots.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::committer::{ChainCommitter, CommitOutcome};
use crate::config::ConsensusConfig;
use crate::consensus::{ConsensusEngine, SlotInputs, TrustView};
use crate::db::Store;
use crate::dispatch::{select_miners, SelectionCandidate, TaskAssignment, TaskDispatcher};
use crate::exchange::{
    broadcast_scores, default_record_bound, sign_local_scores, PeerSender, ScoreIndex, ScoresBody,
};
use crate::health::{NodeState, StatusHandle};
use crate::key::Signer;
use crate::metagraph::{MetagraphCache, MetagraphSnapshot, RefreshOutcome};
use crate::metrics;
use crate::scheduler::{Phase, SlotClock};
use crate::scoring::{grade_with_budget, GradeOutcome, SubnetCapability};
use crate::state::{MinerSlotUpdate, ScaledScores, StateStore};
use crate::types::{SlotNumber, Uid};

/// Per-slot pipeline stage; terminal stages are monotonic.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Pending,
    Dispatching,
    Scoring,
    Exchanging,
    Aggregating,
    Committing,
    Committed,
    Failed,
    Skipped,
}

impl PipelineStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStage::Committed | PipelineStage::Failed | PipelineStage::Skipped
        )
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Pending => write!(f, "pending"),
            PipelineStage::Dispatching => write!(f, "dispatching"),
            PipelineStage::Scoring => write!(f, "scoring"),
            PipelineStage::Exchanging => write!(f, "exchanging"),
            PipelineStage::Aggregating => write!(f, "aggregating"),
            PipelineStage::Committing => write!(f, "committing"),
            PipelineStage::Committed => write!(f, "committed"),
            PipelineStage::Failed => write!(f, "failed"),
            PipelineStage::Skipped => write!(f, "skipped"),
        }
    }
}

/// Everything a validator node needs, threaded in at construction. No
/// component reaches for ambient state.
pub struct ValidatorNode<DB> {
    pub consensus_config: ConsensusConfig,
    pub chain_max_batch: usize,
    pub clock: Arc<SlotClock>,
    pub metagraph: Arc<MetagraphCache>,
    pub dispatcher: TaskDispatcher,
    pub capability: SubnetCapability,
    pub index: ScoreIndex,
    pub peer_sender: Arc<dyn PeerSender>,
    pub engine: ConsensusEngine,
    pub committer: ChainCommitter<DB>,
    pub state: Arc<StateStore<DB>>,
    pub signer: Arc<Signer>,
    pub status: StatusHandle,
    pub self_uid: Uid,
    /// Slot left `commit_incomplete`, resumed ahead of the next commit.
    pub incomplete_slot: Option<SlotNumber>,
}

impl<DB: Store> ValidatorNode<DB> {
    /// Main loop: wait for the metagraph, then drive slots until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.status.set_state(NodeState::Syncing);
        loop {
            if *shutdown.borrow() {
                self.status.set_state(NodeState::Stopping);
                return Ok(());
            }
            let slot = self.clock.current().map(|p| p.slot).unwrap_or(0);
            if self.metagraph.refresh(slot).await == RefreshOutcome::Fresh {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
        }
        self.status.set_state(NodeState::Active);

        let mut last_slot: Option<SlotNumber> = None;
        loop {
            let tick = tokio::select! {
                _ = shutdown.changed() => {
                    self.status.set_state(NodeState::Stopping);
                    return Ok(());
                }
                tick = self.clock.next_slot(last_slot) => tick?,
            };
            for missed in tick.missed.clone() {
                log::warn!("slot {missed} missed, skipped");
                metrics::SLOTS_SKIPPED_TOTAL.inc();
            }
            last_slot = Some(tick.slot);
            let stage = self.run_slot(tick.slot).await;
            log::info!("slot {} finished: {stage}", tick.slot);
        }
    }

    /// Execute one slot from its task phase. Returns the stage the slot
    /// ended in.
    pub async fn run_slot(&mut self, slot: SlotNumber) -> PipelineStage {
        let started = std::time::Instant::now();
        let stage = self.run_slot_inner(slot).await;
        metrics::PHASE_PROCESSING_TIME.observe(started.elapsed().as_secs_f64());
        if stage == PipelineStage::Skipped {
            metrics::SLOTS_SKIPPED_TOTAL.inc();
        }
        stage
    }

    async fn run_slot_inner(&mut self, slot: SlotNumber) -> PipelineStage {
        // Refresh before phase 0; a degraded registry view suppresses the
        // whole slot while receive-side P2P stays up.
        match self.metagraph.refresh(slot).await {
            RefreshOutcome::Fresh => {
                // Only a fresh head is a usable drift reference; a stale one
                // would read as drift on a healthy clock.
                let head = self.metagraph.snapshot().map(|s| s.head_timestamp);
                if let Some(head) = head {
                    if let Err(e) = self.clock.verify_drift(head, Utc::now()) {
                        self.status.set_degraded(e.to_string());
                        return PipelineStage::Skipped;
                    }
                }
                self.status.clear_degraded();
            }
            RefreshOutcome::Stale(n) => {
                log::warn!("slot {slot}: serving stale metagraph ({n} slots)");
            }
            RefreshOutcome::Degraded(n) => {
                self.status
                    .set_degraded(format!("metagraph stale for {n} slots"));
                return PipelineStage::Skipped;
            }
        }
        let Some(snapshot) = self.metagraph.snapshot() else {
            return PipelineStage::Skipped;
        };

        let peers = snapshot.peers_of(self.metagraph.self_address());
        let miners: Vec<_> = snapshot.active_miners().cloned().collect();
        let record_bound = self
            .consensus_config
            .max_peer_records_per_slot
            .unwrap_or_else(|| default_record_bound(peers.len(), miners.len()));
        self.index.begin_slot(slot, record_bound);

        if miners.is_empty() {
            log::info!("slot {slot}: no active miners, skipping");
            return PipelineStage::Skipped;
        }

        // Phase 0: selection and dispatch.
        let selected = self.select_targets(slot, &snapshot, &miners);
        let targets: Vec<_> = miners
            .iter()
            .filter(|m| selected.contains(&m.uid))
            .cloned()
            .collect();
        log::info!(
            "slot {slot}: dispatching to {} of {} active miners",
            targets.len(),
            miners.len()
        );

        let task_deadline = self.clock.deadline_for(slot, Phase::Task);
        let task_timeout = self
            .consensus_config
            .task_timeout_s
            .map(Duration::from_secs)
            .unwrap_or_else(|| {
                let phase = self.clock.phase_length(Phase::Task);
                phase.saturating_sub(phase / 10)
            });
        let assignments = self
            .dispatcher
            .dispatch_slot(slot, task_deadline, &targets, task_timeout)
            .await;

        // Phase 1: local scoring.
        if self.clock.await_phase(slot, Phase::LocalScoring).await.is_err() {
            log::warn!("slot {slot}: scoring phase already over, slot abandoned");
            return PipelineStage::Failed;
        }
        let self_scores = self.score_locally(slot, &assignments).await;

        // Phase 2: exchange.
        if self.clock.await_phase(slot, Phase::PeerExchange).await.is_err() {
            log::warn!("slot {slot}: exchange phase already over, slot abandoned");
            return PipelineStage::Failed;
        }
        let exchange_deadline = self.clock.deadline_for(slot, Phase::PeerExchange);
        if !self_scores.is_empty() && !peers.is_empty() {
            let records = sign_local_scores(&self.signer, &self.self_uid, slot, &self_scores);
            let endpoints: Vec<_> = peers
                .iter()
                .filter_map(|p| p.api_endpoint.clone().map(|url| (p.uid, url)))
                .collect();
            let outcomes = broadcast_scores(
                self.peer_sender.clone(),
                endpoints,
                ScoresBody { records },
                self.consensus_config.peer_concurrency,
                exchange_deadline,
            )
            .await;
            let delivered = outcomes.iter().filter(|o| o.delivered).count();
            log::debug!(
                "slot {slot}: scores delivered to {delivered}/{} peers",
                outcomes.len()
            );
        }
        let quorum = ((peers.len() as f64) * self.consensus_config.peer_quorum_fraction).ceil()
            as usize;
        let reporters = self.index.await_quorum(slot, quorum, exchange_deadline).await;
        log::debug!("slot {slot}: {reporters} peer reporters by exchange end");

        // Phase 3: aggregate and commit.
        if self.clock.await_phase(slot, Phase::Commit).await.is_err() {
            log::warn!("slot {slot}: commit phase already over, slot abandoned");
            return PipelineStage::Failed;
        }
        let peer_scores = self.index.snapshot(slot);
        let trust_views = self.trust_views(&snapshot);
        let flagged = self.flagged_validators(&snapshot);

        let evaluation = self.engine.evaluate_slot(&SlotInputs {
            slot,
            self_uid: self.self_uid,
            self_scores: &self_scores,
            peer_scores: &peer_scores,
            snapshot: &snapshot,
            trust_views: &trust_views,
            flagged: &flagged,
            active_peers: peers.len(),
        });
        for validator in &evaluation.fraud_flags {
            if let Err(e) = self.state.record_fraud_flag(validator, slot) {
                log::error!("failed to record fraud flag for {validator}: {e}");
            }
        }
        if !evaluation.excluded.is_empty() {
            log::debug!(
                "slot {slot}: {} miners excluded from the update",
                evaluation.excluded.len()
            );
        }

        // Commits serialize: finish an earlier incomplete slot first.
        let commit_deadline = self.clock.deadline_for(slot, Phase::Commit);
        if let Some(pending_slot) = self.incomplete_slot.take() {
            match self.committer.resume_pending(pending_slot, commit_deadline).await {
                Some(CommitOutcome::Committed { .. }) => {
                    self.status.record_commit(pending_slot);
                    log::info!("slot {pending_slot}: resumed commit completed");
                }
                Some(CommitOutcome::Incomplete { .. }) => {
                    self.incomplete_slot = Some(pending_slot);
                }
                Some(outcome) => {
                    log::warn!("slot {pending_slot}: resumed commit ended as {outcome:?}");
                }
                None => {}
            }
        }

        if self.status.node_state() == NodeState::Degraded {
            log::warn!("slot {slot}: degraded, commit suppressed");
            return PipelineStage::Skipped;
        }

        let state_updates = build_state_updates(&selected, &evaluation.updates);
        let max_batch = self.chain_max_batch.min(snapshot.params.max_update_batch.max(1));
        match self
            .committer
            .commit_slot(
                slot,
                &evaluation.updates,
                &state_updates,
                max_batch,
                commit_deadline,
            )
            .await
        {
            CommitOutcome::Committed { .. } => {
                self.status.record_commit(slot);
                PipelineStage::Committed
            }
            CommitOutcome::AlreadyCommitted { .. } => PipelineStage::Committed,
            CommitOutcome::NothingToCommit => PipelineStage::Skipped,
            CommitOutcome::Incomplete { done, total } => {
                self.incomplete_slot = Some(slot);
                log::warn!("slot {slot}: commit incomplete ({done}/{total} chunks)");
                PipelineStage::Committing
            }
            CommitOutcome::Failed { reason } => {
                log::warn!("slot {slot}: commit failed: {reason}");
                PipelineStage::Failed
            }
        }
    }

    fn select_targets(
        &self,
        slot: SlotNumber,
        snapshot: &MetagraphSnapshot,
        miners: &[crate::types::MinerEntry],
    ) -> HashSet<Uid> {
        let bmax = snapshot.params.selection_bmax;
        let candidates: Vec<SelectionCandidate> = miners
            .iter()
            .map(|m| {
                let local = self.state.get_trust_state(&m.uid).ok().flatten();
                let trust = local
                    .as_ref()
                    .map(|s| s.trust())
                    .unwrap_or_else(|| m.trust());
                let slots_since_selection = local
                    .as_ref()
                    .and_then(|s| s.last_selected_slot)
                    .map(|s| slot.saturating_sub(s))
                    // Never-selected miners get the full starvation bonus.
                    .unwrap_or(bmax);
                SelectionCandidate {
                    uid: m.uid,
                    trust,
                    slots_since_selection,
                }
            })
            .collect();
        let k = self.consensus_config.selection_k.min(candidates.len());
        let picked = select_miners(
            candidates,
            k,
            snapshot.params.selection_beta,
            bmax,
            &mut rand::thread_rng(),
        );
        log::debug!(
            "slot {slot}: selected miners [{}]",
            picked.iter().format(", ")
        );
        picked.into_iter().collect()
    }

    /// Grade every response within the phase-1 budget. Miners without a
    /// usable response score 0; a grading job that blows its budget leaves
    /// the miner locally unevaluated.
    async fn score_locally(
        &self,
        slot: SlotNumber,
        assignments: &[TaskAssignment],
    ) -> Vec<(Uid, f64)> {
        let deadline = self.clock.deadline_for(slot, Phase::LocalScoring);
        let mut scores = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            match &assignment.result {
                Some(result) => {
                    let budget = (deadline - Utc::now()).to_std().unwrap_or_default();
                    if budget.is_zero() {
                        metrics::TASK_FAILURE_TOTAL
                            .with_label_values(&[metrics::values::SCORING_FAILED])
                            .inc();
                        continue;
                    }
                    match grade_with_budget(
                        &self.capability,
                        assignment.payload.clone(),
                        result.clone(),
                        budget,
                    )
                    .await
                    {
                        GradeOutcome::Valid(score) => scores.push((assignment.miner, score)),
                        GradeOutcome::Invalid => {
                            log::debug!(
                                "slot {slot}: invalid response from miner {}",
                                assignment.miner
                            );
                            metrics::TASK_FAILURE_TOTAL
                                .with_label_values(&[metrics::values::INVALID_RESULT])
                                .inc();
                            scores.push((assignment.miner, 0.0));
                        }
                        GradeOutcome::ScoringFailed => {
                            log::warn!(
                                "slot {slot}: scoring budget exceeded for miner {}",
                                assignment.miner
                            );
                            metrics::TASK_FAILURE_TOTAL
                                .with_label_values(&[metrics::values::SCORING_FAILED])
                                .inc();
                        }
                    }
                }
                // No response within the task phase: scored 0.
                None => scores.push((assignment.miner, 0.0)),
            }
        }
        scores
    }

    fn trust_views(&self, snapshot: &MetagraphSnapshot) -> HashMap<Uid, TrustView> {
        snapshot
            .miners
            .iter()
            .filter_map(|m| {
                let state = self.state.get_trust_state(&m.uid).ok().flatten()?;
                Some((
                    m.uid,
                    TrustView {
                        trust: state.trust(),
                        last_evaluated_slot: state.last_evaluated_slot(),
                    },
                ))
            })
            .collect()
    }

    fn flagged_validators(&self, snapshot: &MetagraphSnapshot) -> HashSet<Uid> {
        snapshot
            .validators
            .iter()
            .filter(|v| {
                matches!(self.state.latest_fraud_flag(&v.uid), Ok(Some(_)))
            })
            .map(|v| v.uid)
            .collect()
    }
}

/// Combine selection and evaluation into the slot's state updates: every
/// evaluated miner gets its new scores, selected-but-unevaluated miners only
/// advance their selection slot.
fn build_state_updates(
    selected: &HashSet<Uid>,
    evaluated: &[crate::consensus::MinerUpdate],
) -> Vec<MinerSlotUpdate> {
    let mut updates: Vec<MinerSlotUpdate> = evaluated
        .iter()
        .map(|u| MinerSlotUpdate {
            miner: u.miner,
            selected: selected.contains(&u.miner),
            scores: Some(ScaledScores {
                performance: u.scaled_performance,
                trust: u.scaled_trust,
            }),
        })
        .collect();
    let evaluated_set: HashSet<Uid> = evaluated.iter().map(|u| u.miner).collect();
    for miner in selected {
        if !evaluated_set.contains(miner) {
            updates.push(MinerSlotUpdate {
                miner: *miner,
                selected: true,
                scores: None,
            });
        }
    }
    updates.sort_by(|a, b| a.miner.cmp(&b.miner));
    updates
}

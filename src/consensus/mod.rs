// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Consensus aggregation. At phase-3 start the engine folds the slot's local
//! and peer scores into one trust-weighted aggregate per miner, flags
//! persistently deviant reporters, and derives the new trust and performance
//! values that the committer sends on chain.

use std::collections::{BTreeMap, HashMap, HashSet};

use ethereum_types::H160;
use serde::{Deserialize, Serialize};

use crate::exchange::SlotScores;
use crate::metagraph::MetagraphSnapshot;
use crate::types::{scale_score, SlotNumber, Uid};

/// One reporter's contribution to a miner's aggregate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReporterScore {
    pub reporter: Uid,
    /// Reporter's trust weight at aggregation time.
    pub trust: f64,
    pub score: f64,
}

/// Trust-weighted aggregate over the reporters of one miner. `None` when the
/// combined trust weight is zero; such miners are excluded rather than
/// dividing by zero.
pub fn aggregate(reports: &[ReporterScore]) -> Option<f64> {
    let total: f64 = reports.iter().map(|r| r.trust).sum();
    if total <= 0.0 {
        return None;
    }
    let weighted: f64 = reports.iter().map(|r| r.trust * r.score).sum();
    Some(weighted / total)
}

/// Time-decayed trust update:
/// `T_new = T_old * exp(-delta * slots) + alpha * f(p_agg)`, with `f` the
/// identity clipped to the unit interval, clamped to `[0, 1]` afterwards.
pub fn updated_trust(
    t_old: f64,
    delta_trust: f64,
    slots_since_evaluation: u64,
    alpha: f64,
    p_agg: f64,
) -> f64 {
    let decayed = t_old.clamp(0.0, 1.0) * (-delta_trust * slots_since_evaluation as f64).exp();
    (decayed + alpha * p_agg.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Local view of a miner's trust going into the update.
#[derive(Clone, Copy, Debug)]
pub struct TrustView {
    pub trust: f64,
    pub last_evaluated_slot: Option<SlotNumber>,
}

/// New values for one miner, in both float and scaled form. The scaled form
/// is what goes on chain and into the local store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinerUpdate {
    pub miner: Uid,
    pub address: H160,
    pub p_agg: f64,
    pub trust: f64,
    pub scaled_performance: u64,
    pub scaled_trust: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Combined reporter trust weight was zero.
    ZeroTrustWeight,
    /// Not enough reports to aggregate.
    InsufficientReports,
}

/// Everything phase 3 produced for one slot.
#[derive(Clone, Debug, Default)]
pub struct SlotEvaluation {
    pub updates: Vec<MinerUpdate>,
    pub excluded: Vec<(Uid, ExclusionReason)>,
    /// Reporters whose deviation streak crossed the strike threshold this
    /// slot.
    pub fraud_flags: Vec<Uid>,
}

/// Inputs to one slot evaluation. Snapshots only; the engine holds no live
/// references into other components.
pub struct SlotInputs<'a> {
    pub slot: SlotNumber,
    pub self_uid: Uid,
    /// Locally computed scores, one entry per assigned miner.
    pub self_scores: &'a [(Uid, f64)],
    /// Peer score snapshot for the slot.
    pub peer_scores: &'a SlotScores,
    pub snapshot: &'a MetagraphSnapshot,
    /// Local trust view per miner; miners absent here fall back to the
    /// registry trust with a one-slot decay window.
    pub trust_views: &'a HashMap<Uid, TrustView>,
    /// Validators carrying an active fraud flag.
    pub flagged: &'a HashSet<Uid>,
    /// Number of active peer validators this slot.
    pub active_peers: usize,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub min_peer_reports: usize,
    pub deviation_threshold: f64,
    pub deviation_strikes: u32,
    pub delta_trust: f64,
    pub alpha_trust: f64,
    /// Multiplier applied to a flagged reporter's trust weight.
    pub fraud_penalty: f64,
}

pub struct ConsensusEngine {
    config: EngineConfig,
    /// Consecutive deviant slots per reporter. In-memory: strikes restart
    /// with the process, recorded flags are durable.
    strikes: HashMap<Uid, u32>,
}

impl ConsensusEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            strikes: HashMap::new(),
        }
    }

    /// Effective trust weight of a reporter, honoring fraud flags.
    fn reporter_trust(&self, inputs: &SlotInputs<'_>, reporter: &Uid) -> f64 {
        let base = inputs
            .snapshot
            .validator_by_uid(reporter)
            .map(|v| v.trust())
            .unwrap_or(0.0);
        if inputs.flagged.contains(reporter) {
            base * self.config.fraud_penalty
        } else {
            base
        }
    }

    pub fn evaluate_slot(&mut self, inputs: &SlotInputs<'_>) -> SlotEvaluation {
        // Collect reports per miner, self first so a duplicate peer record
        // under the local UID can never displace the local score.
        let mut reports: BTreeMap<Uid, Vec<ReporterScore>> = BTreeMap::new();

        let self_trust = self.reporter_trust(inputs, &inputs.self_uid);
        for (miner, score) in inputs.self_scores {
            reports.entry(*miner).or_default().push(ReporterScore {
                reporter: inputs.self_uid,
                trust: self_trust,
                score: *score,
            });
        }
        for (miner, reporter, score) in inputs.peer_scores.iter() {
            if reporter == inputs.self_uid {
                continue;
            }
            reports.entry(miner).or_default().push(ReporterScore {
                reporter,
                trust: self.reporter_trust(inputs, &reporter),
                score,
            });
        }

        let mut evaluation = SlotEvaluation::default();
        for (miner, miner_reports) in &reports {
            // With active peers around, an aggregate needs a minimum number
            // of reports; a lone validator proceeds on its own score.
            let enough = inputs.active_peers == 0
                || miner_reports.len() >= self.config.min_peer_reports;
            if !enough {
                evaluation
                    .excluded
                    .push((*miner, ExclusionReason::InsufficientReports));
                continue;
            }
            let Some(p_agg) = aggregate(miner_reports) else {
                evaluation
                    .excluded
                    .push((*miner, ExclusionReason::ZeroTrustWeight));
                continue;
            };

            let Some(entry) = inputs.snapshot.miner_by_uid(miner) else {
                // Scored by peers but unknown to our registry snapshot;
                // nothing to commit for it.
                continue;
            };
            let view = inputs
                .trust_views
                .get(miner)
                .copied()
                .unwrap_or(TrustView {
                    trust: entry.trust(),
                    last_evaluated_slot: None,
                });
            let slots_since = view
                .last_evaluated_slot
                .map(|last| inputs.slot.saturating_sub(last).max(1))
                .unwrap_or(1);
            let trust = updated_trust(
                view.trust,
                self.config.delta_trust,
                slots_since,
                self.config.alpha_trust,
                p_agg,
            );

            evaluation.updates.push(MinerUpdate {
                miner: *miner,
                address: entry.owner,
                p_agg,
                trust,
                scaled_performance: scale_score(p_agg),
                scaled_trust: scale_score(trust),
            });
        }

        evaluation.fraud_flags = self.update_strikes(&reports, &evaluation.updates);
        evaluation
    }

    /// Per-slot deviation bookkeeping. A reporter whose average sits more
    /// than `deviation_threshold` cross-reporter standard deviations away
    /// from the aggregate average accumulates a strike; `deviation_strikes`
    /// consecutive strikes raise a flag.
    fn update_strikes(
        &mut self,
        reports: &BTreeMap<Uid, Vec<ReporterScore>>,
        updates: &[MinerUpdate],
    ) -> Vec<Uid> {
        if updates.is_empty() {
            return Vec::new();
        }
        let updated: HashMap<Uid, f64> =
            updates.iter().map(|u| (u.miner, u.p_agg)).collect();

        // Average reported score per reporter over the updated miners.
        let mut sums: BTreeMap<Uid, (f64, usize)> = BTreeMap::new();
        for (miner, miner_reports) in reports {
            if !updated.contains_key(miner) {
                continue;
            }
            for report in miner_reports {
                let entry = sums.entry(report.reporter).or_insert((0.0, 0));
                entry.0 += report.score;
                entry.1 += 1;
            }
        }
        if sums.is_empty() {
            return Vec::new();
        }
        let averages: BTreeMap<Uid, f64> = sums
            .into_iter()
            .map(|(reporter, (sum, n))| (reporter, sum / n as f64))
            .collect();

        let aggregate_avg: f64 =
            updated.values().sum::<f64>() / updated.len() as f64;
        let mean_of_averages: f64 =
            averages.values().sum::<f64>() / averages.len() as f64;
        let variance: f64 = averages
            .values()
            .map(|avg| (avg - mean_of_averages).powi(2))
            .sum::<f64>()
            / averages.len() as f64;
        let sigma = variance.sqrt();

        let mut flagged = Vec::new();
        for (reporter, avg) in &averages {
            let deviant =
                sigma > 0.0 && (avg - aggregate_avg).abs() / sigma > self.config.deviation_threshold;
            if deviant {
                let strikes = self.strikes.entry(*reporter).or_insert(0);
                *strikes += 1;
                if *strikes >= self.config.deviation_strikes {
                    flagged.push(*reporter);
                    *strikes = 0;
                }
            } else {
                self.strikes.insert(*reporter, 0);
            }
        }
        flagged
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use rand::Rng;

use crate::types::{SlotNumber, Uid};

/// Per-miner selection input: current trust and how long the miner has gone
/// unselected.
#[derive(Clone, Debug)]
pub struct SelectionCandidate {
    pub uid: Uid,
    pub trust: f64,
    pub slots_since_selection: SlotNumber,
}

/// Unnormalized selection weight. Reliable miners are preferred while the
/// starvation bonus keeps long-unselected miners in rotation.
pub fn selection_weight(candidate: &SelectionCandidate, beta: f64, bmax: u64) -> f64 {
    let bonus = candidate.slots_since_selection.min(bmax) as f64;
    candidate.trust.max(0.0) * (1.0 + beta * bonus)
}

/// Draw up to `k` miners without replacement, proportionally to
/// [`selection_weight`]. Candidates are ordered by UID first so equal-weight
/// ties resolve lexicographically and seeded runs reproduce exactly. When
/// every weight is zero (a cold subnet) the draw falls back to uniform.
pub fn select_miners<R: Rng>(
    mut candidates: Vec<SelectionCandidate>,
    k: usize,
    beta: f64,
    bmax: u64,
    rng: &mut R,
) -> Vec<Uid> {
    candidates.sort_by(|a, b| a.uid.cmp(&b.uid));
    candidates.dedup_by(|a, b| a.uid == b.uid);

    let k = k.min(candidates.len());
    if k == 0 {
        return Vec::new();
    }

    let mut weights: Vec<f64> = candidates
        .iter()
        .map(|c| selection_weight(c, beta, bmax))
        .collect();
    let mut total: f64 = weights.iter().sum();
    if total <= 0.0 {
        weights.iter_mut().for_each(|w| *w = 1.0);
        total = weights.len() as f64;
    }

    let mut selected = Vec::with_capacity(k);
    for _ in 0..k {
        let mut point = rng.gen_range(0.0..total);
        let mut picked = None;
        for (i, weight) in weights.iter().enumerate() {
            if *weight <= 0.0 {
                continue;
            }
            if point < *weight {
                picked = Some(i);
                break;
            }
            point -= *weight;
        }
        // Floating point accumulation can leave `point` past the last
        // positive weight; take that candidate.
        let i = picked.unwrap_or_else(|| {
            weights
                .iter()
                .rposition(|w| *w > 0.0)
                .expect("at least one positive weight remains")
        });
        selected.push(candidates[i].uid);
        total -= weights[i];
        weights[i] = 0.0;
        if total <= 0.0 && selected.len() < k {
            // Remaining candidates all have zero weight; fill uniformly.
            for (j, weight) in weights.iter_mut().enumerate() {
                if !selected.contains(&candidates[j].uid) {
                    *weight = 1.0;
                }
            }
            total = weights.iter().sum();
            if total <= 0.0 {
                break;
            }
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::uid;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn candidate(seed: u8, trust: f64, since: u64) -> SelectionCandidate {
        SelectionCandidate {
            uid: uid(seed),
            trust,
            slots_since_selection: since,
        }
    }

    #[test]
    fn weight_formula() {
        let c = candidate(1, 0.5, 4);
        assert_eq!(selection_weight(&c, 0.1, 16), 0.5 * 1.4);
        // The starvation bonus caps at bmax.
        let c = candidate(1, 0.5, 100);
        assert_eq!(selection_weight(&c, 0.1, 16), 0.5 * 2.6);
        // Negative trust never produces a negative weight.
        let c = candidate(1, -1.0, 0);
        assert_eq!(selection_weight(&c, 0.1, 16), 0.0);
    }

    #[test]
    fn selects_at_most_k_distinct() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let candidates: Vec<_> = (1u8..=10).map(|i| candidate(i, 0.5, 0)).collect();
        let selected = select_miners(candidates.clone(), 4, 0.1, 16, &mut rng);
        assert_eq!(selected.len(), 4);
        let mut dedup = selected.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 4);

        // k larger than the candidate set selects everyone.
        let selected = select_miners(candidates, 64, 0.1, 16, &mut rng);
        assert_eq!(selected.len(), 10);
    }

    #[test]
    fn zero_trust_subnet_bootstraps_uniformly() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let candidates: Vec<_> = (1u8..=5).map(|i| candidate(i, 0.0, 0)).collect();
        let selected = select_miners(candidates, 3, 0.1, 16, &mut rng);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn seeded_runs_reproduce() {
        let candidates: Vec<_> = (1u8..=20).map(|i| candidate(i, i as f64 / 20.0, 0)).collect();
        let a = select_miners(candidates.clone(), 8, 0.1, 16, &mut ChaCha8Rng::seed_from_u64(7));
        let b = select_miners(candidates, 8, 0.1, 16, &mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn high_trust_dominates_over_many_draws() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let candidates = vec![candidate(1, 0.95, 0), candidate(2, 0.05, 0)];
        let mut hits = 0;
        for _ in 0..200 {
            let selected = select_miners(candidates.clone(), 1, 0.0, 0, &mut rng);
            if selected[0] == uid(1) {
                hits += 1;
            }
        }
        assert!(hits > 150, "expected heavy bias toward trusted miner, got {hits}");
    }

    #[test]
    fn empty_input() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        assert!(select_miners(Vec::new(), 4, 0.1, 16, &mut rng).is_empty());
    }
}

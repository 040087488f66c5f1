// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-subnet scoring capabilities. A capability is a record of three
//! functions: `prepare` builds the slot's task payload, `solve` is the miner
//! side, and `grade` turns a (task, response) pair into a quality score.
//! Adding a subnet means registering a new record; there is no trait
//! hierarchy to extend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::key::keccak256;
use crate::types::{SlotNumber, SubnetId, Uid};

/// Outcome of grading one response.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Grade {
    /// Quality score in `[0, 1]`.
    Valid(f64),
    /// The response is structurally unusable; recorded as score 0.
    Invalid,
}

/// Outcome of grading under the phase-1 budget.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GradeOutcome {
    Valid(f64),
    Invalid,
    /// Grading exceeded its budget and was cancelled.
    ScoringFailed,
}

type PrepareFn = dyn Fn(SlotNumber, &Uid) -> Value + Send + Sync;
type SolveFn = dyn Fn(&Value) -> Value + Send + Sync;
type GradeFn = dyn Fn(&Value, &Value) -> Grade + Send + Sync;

/// Capability record for one subnet. `grade` must be deterministic: equal
/// (task, response) pairs yield equal scores on every validator.
#[derive(Clone)]
pub struct SubnetCapability {
    pub name: &'static str,
    pub prepare: Arc<PrepareFn>,
    pub solve: Arc<SolveFn>,
    pub grade: Arc<GradeFn>,
}

/// Look up the capability registered for a subnet. Unknown subnets fall back
/// to the digest-chain capability.
pub fn capability_for(_subnet: SubnetId) -> SubnetCapability {
    digest_chain_capability()
}

/// Reference capability: the task is an iterated keccak digest chain seeded
/// from the slot and validator UID. Cheap to verify, impossible to answer
/// without doing the work, and fully deterministic.
pub fn digest_chain_capability() -> SubnetCapability {
    SubnetCapability {
        name: "digest-chain",
        prepare: Arc::new(|slot, validator| {
            let mut seed = Vec::with_capacity(40);
            seed.extend_from_slice(&slot.to_be_bytes());
            seed.extend_from_slice(validator.as_bytes());
            json!({
                "kind": "digest-chain",
                "seed": hex::encode(keccak256(&seed).as_bytes()),
                "rounds": 64,
            })
        }),
        solve: Arc::new(|task| {
            let seed = task.get("seed").and_then(Value::as_str).unwrap_or("");
            let rounds = task.get("rounds").and_then(Value::as_u64).unwrap_or(0);
            let Ok(mut digest) = hex::decode(seed) else {
                return json!({ "error": "bad seed" });
            };
            for _ in 0..rounds {
                digest = keccak256(&digest).as_bytes().to_vec();
            }
            json!({ "digest": hex::encode(digest) })
        }),
        grade: Arc::new(|task, response| {
            let Some(answer) = response.get("digest").and_then(Value::as_str) else {
                return Grade::Invalid;
            };
            let expected = (digest_chain_capability().solve)(task);
            let expected = expected
                .get("digest")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if answer == expected {
                Grade::Valid(1.0)
            } else {
                Grade::Valid(0.0)
            }
        }),
    }
}

/// Run `grade` on a blocking thread with a deadline. Grading is CPU-bound;
/// a job that overruns its budget is abandoned and reported as
/// `ScoringFailed`.
pub async fn grade_with_budget(
    capability: &SubnetCapability,
    task: Value,
    response: Value,
    budget: Duration,
) -> GradeOutcome {
    let grade = capability.grade.clone();
    let job = tokio::task::spawn_blocking(move || grade(&task, &response));
    match tokio::time::timeout(budget, job).await {
        Ok(Ok(Grade::Valid(score))) => GradeOutcome::Valid(score.clamp(0.0, 1.0)),
        Ok(Ok(Grade::Invalid)) => GradeOutcome::Invalid,
        Ok(Err(e)) => {
            log::warn!("grading task panicked: {e}");
            GradeOutcome::Invalid
        }
        Err(_) => GradeOutcome::ScoringFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::uid;

    #[test]
    fn prepare_is_deterministic() {
        let cap = digest_chain_capability();
        let a = (cap.prepare)(9, &uid(1));
        let b = (cap.prepare)(9, &uid(1));
        assert_eq!(a, b);
        let c = (cap.prepare)(10, &uid(1));
        assert_ne!(a, c);
    }

    #[test]
    fn solve_then_grade_is_full_credit() {
        let cap = digest_chain_capability();
        let task = (cap.prepare)(3, &uid(2));
        let response = (cap.solve)(&task);
        assert_eq!((cap.grade)(&task, &response), Grade::Valid(1.0));
    }

    #[test]
    fn wrong_answer_scores_zero() {
        let cap = digest_chain_capability();
        let task = (cap.prepare)(3, &uid(2));
        let response = json!({ "digest": "00" });
        assert_eq!((cap.grade)(&task, &response), Grade::Valid(0.0));
    }

    #[test]
    fn malformed_answer_is_invalid() {
        let cap = digest_chain_capability();
        let task = (cap.prepare)(3, &uid(2));
        assert_eq!((cap.grade)(&task, &json!({})), Grade::Invalid);
        assert_eq!((cap.grade)(&task, &json!("text")), Grade::Invalid);
    }

    #[tokio::test]
    async fn budget_overrun_is_scoring_failed() {
        let cap = SubnetCapability {
            name: "slow",
            prepare: Arc::new(|_, _| json!({})),
            solve: Arc::new(|_| json!({})),
            grade: Arc::new(|_, _| {
                std::thread::sleep(Duration::from_millis(200));
                Grade::Valid(1.0)
            }),
        };
        let out = grade_with_budget(&cap, json!({}), json!({}), Duration::from_millis(10)).await;
        assert_eq!(out, GradeOutcome::ScoringFailed);
    }

    #[tokio::test]
    async fn within_budget_passes_through() {
        let cap = digest_chain_capability();
        let task = (cap.prepare)(1, &uid(1));
        let response = (cap.solve)(&task);
        let out =
            grade_with_budget(&cap, task, response, Duration::from_secs(5)).await;
        assert_eq!(out, GradeOutcome::Valid(1.0));
    }
}

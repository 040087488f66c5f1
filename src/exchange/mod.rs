// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Peer score exchange. At phase-2 start each validator broadcasts its local
//! scores to every active peer and collects theirs. Intake is a single
//! writer task feeding a per-slot index; phase 3 reads a snapshot copy.

mod server;

pub use server::{default_record_bound, exchange_router, ExchangeServerState};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethereum_types::H256;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use url::Url;

use crate::key::{keccak256, RecoverableSignature, Signer};
use crate::metrics;
use crate::types::{SlotNumber, Uid};

/// Highest wire score; scores travel as integers in `[0, 1000]`.
pub const SCORE_MILLI_MAX: u16 = 1000;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("peer request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("peer rejected the batch: {0}")]
    Rejected(u16),
}

/// Signed per-miner score record as it travels between validators.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireScoreRecord {
    pub slot: SlotNumber,
    pub reporter_uid: Uid,
    pub miner_uid: Uid,
    pub score_milli: u16,
    pub signed_at_unix: u64,
    pub signature: RecoverableSignature,
}

/// Body of `POST /scores`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoresBody {
    pub records: Vec<WireScoreRecord>,
}

/// Digest a reporter signs over one score record.
pub fn record_digest(
    slot: SlotNumber,
    reporter: &Uid,
    miner: &Uid,
    score_milli: u16,
    signed_at_unix: u64,
) -> H256 {
    let mut preimage = Vec::with_capacity(32 * 3 + 16);
    preimage.extend_from_slice(&slot.to_be_bytes());
    preimage.extend_from_slice(reporter.as_bytes());
    preimage.extend_from_slice(miner.as_bytes());
    preimage.extend_from_slice(&score_milli.to_be_bytes());
    preimage.extend_from_slice(&signed_at_unix.to_be_bytes());
    keccak256(&preimage)
}

/// Build and sign the outgoing records for this slot's local scores.
pub fn sign_local_scores(
    signer: &Signer,
    self_uid: &Uid,
    slot: SlotNumber,
    scores: &[(Uid, f64)],
) -> Vec<WireScoreRecord> {
    let signed_at_unix = Utc::now().timestamp().max(0) as u64;
    scores
        .iter()
        .map(|(miner, score)| {
            let score_milli =
                ((score.clamp(0.0, 1.0) * SCORE_MILLI_MAX as f64).round()) as u16;
            let digest = record_digest(slot, self_uid, miner, score_milli, signed_at_unix);
            WireScoreRecord {
                slot,
                reporter_uid: *self_uid,
                miner_uid: *miner,
                score_milli,
                signed_at_unix,
                signature: signer
                    .sign_digest(digest)
                    .expect("signing with a loaded key must succeed"),
            }
        })
        .collect()
}

/// Verdict returned by the intake task for one accepted-for-processing
/// record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntakeVerdict {
    Accepted,
    Duplicate,
    OutOfWindow,
}

pub struct IntakeMsg {
    pub slot: SlotNumber,
    pub reporter: Uid,
    pub miner: Uid,
    pub score: f64,
    pub reply: oneshot::Sender<IntakeVerdict>,
}

/// Scores of one slot: deduplicated by (miner, reporter), insertion order
/// kept for bounded eviction.
#[derive(Clone, Debug, Default)]
pub struct SlotScores {
    scores: HashMap<(Uid, Uid), f64>,
    order: VecDeque<(Uid, Uid)>,
    reporters: HashSet<Uid>,
}

impl SlotScores {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn reporter_count(&self) -> usize {
        self.reporters.len()
    }

    pub fn get(&self, miner: &Uid, reporter: &Uid) -> Option<f64> {
        self.scores.get(&(*miner, *reporter)).copied()
    }

    /// Iterate as (miner, reporter, score).
    pub fn iter(&self) -> impl Iterator<Item = (Uid, Uid, f64)> + '_ {
        self.scores.iter().map(|((m, r), s)| (*m, *r, *s))
    }
}

struct IndexState {
    /// Accepted records for slots in the `current ± 1` window.
    window: HashMap<SlotNumber, SlotScores>,
    current_slot: SlotNumber,
    max_per_slot: usize,
}

/// Handle to the peer score index. The intake task is the only writer;
/// phase 3 takes a copy-on-snapshot of its slot.
#[derive(Clone)]
pub struct ScoreIndex {
    state: Arc<Mutex<IndexState>>,
    reporters_tx: Arc<watch::Sender<(SlotNumber, usize)>>,
}

impl ScoreIndex {
    pub fn new() -> Self {
        let (reporters_tx, _) = watch::channel((0, 0));
        Self {
            state: Arc::new(Mutex::new(IndexState {
                window: HashMap::new(),
                current_slot: 0,
                max_per_slot: usize::MAX,
            })),
            reporters_tx: Arc::new(reporters_tx),
        }
    }

    /// Advance the accepting window to `slot` and set the per-slot buffer
    /// bound. Records for slots outside `slot ± 1` are discarded.
    pub fn begin_slot(&self, slot: SlotNumber, max_per_slot: usize) {
        let mut state = self.state.lock();
        state.current_slot = slot;
        state.max_per_slot = max_per_slot.max(1);
        state
            .window
            .retain(|s, _| *s + 1 >= slot && *s <= slot + 1);
        state.window.entry(slot).or_default();
        let count = state
            .window
            .get(&slot)
            .map(|s| s.reporter_count())
            .unwrap_or(0);
        let _ = self.reporters_tx.send((slot, count));
    }

    pub fn current_slot(&self) -> SlotNumber {
        self.state.lock().current_slot
    }

    /// Copy of the scores accepted for `slot` so far.
    pub fn snapshot(&self, slot: SlotNumber) -> SlotScores {
        self.state
            .lock()
            .window
            .get(&slot)
            .cloned()
            .unwrap_or_default()
    }

    /// Wait until at least `needed` distinct reporters delivered scores for
    /// `slot`, or the deadline passes. Returns the reporter count seen.
    pub async fn await_quorum(
        &self,
        slot: SlotNumber,
        needed: usize,
        deadline: DateTime<Utc>,
    ) -> usize {
        let mut rx = self.reporters_tx.subscribe();
        loop {
            let (seen_slot, count) = *rx.borrow();
            if seen_slot == slot && count >= needed {
                return count;
            }
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            if remaining.is_zero() {
                return self.snapshot(slot).reporter_count();
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.snapshot(slot).reporter_count();
                    }
                }
                _ = tokio::time::sleep(remaining) => {
                    return self.snapshot(slot).reporter_count();
                }
            }
        }
    }

    pub(crate) fn insert(&self, msg: &IntakeMsg) -> IntakeVerdict {
        let mut state = self.state.lock();
        let current = state.current_slot;
        if msg.slot + 1 < current || msg.slot > current + 1 {
            return IntakeVerdict::OutOfWindow;
        }
        let max_per_slot = state.max_per_slot;
        let slot_scores = state.window.entry(msg.slot).or_default();

        let key = (msg.miner, msg.reporter);
        if slot_scores.scores.contains_key(&key) {
            return IntakeVerdict::Duplicate;
        }
        if slot_scores.scores.len() >= max_per_slot {
            // Bounded buffer: drop the oldest accepted pair.
            if let Some(evicted) = slot_scores.order.pop_front() {
                slot_scores.scores.remove(&evicted);
                metrics::PEER_RECORD_OVERFLOW_TOTAL.inc();
            }
        }
        slot_scores.scores.insert(key, msg.score);
        slot_scores.order.push_back(key);
        slot_scores.reporters.insert(msg.reporter);

        if msg.slot == current {
            let count = slot_scores.reporter_count();
            let _ = self.reporters_tx.send((current, count));
        }
        IntakeVerdict::Accepted
    }
}

impl Default for ScoreIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-writer intake loop. Every accepted record flows through here so
/// deduplication and the buffer bound are applied in one place.
pub async fn run_intake(index: ScoreIndex, rx: flume::Receiver<IntakeMsg>) {
    while let Ok(msg) = rx.recv_async().await {
        let verdict = index.insert(&msg);
        let _ = msg.reply.send(verdict);
    }
    log::debug!("score intake channel closed, intake task exiting");
}

/// Per-peer delivery outcome of a broadcast.
#[derive(Clone, Debug)]
pub struct DeliveryOutcome {
    pub peer: Uid,
    pub delivered: bool,
}

/// Transport used to reach peer validators.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send_scores(
        &self,
        endpoint: &Url,
        body: &ScoresBody,
        timeout: Duration,
    ) -> Result<(), ExchangeError>;
}

pub struct HttpPeerSender {
    http: reqwest::Client,
}

impl HttpPeerSender {
    pub fn new() -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PeerSender for HttpPeerSender {
    async fn send_scores(
        &self,
        endpoint: &Url,
        body: &ScoresBody,
        timeout: Duration,
    ) -> Result<(), ExchangeError> {
        let url = endpoint
            .join("scores")
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout
                } else {
                    ExchangeError::Transport(e.to_string())
                }
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ExchangeError::Rejected(response.status().as_u16()))
        }
    }
}

/// Broadcast `body` to every peer with bounded concurrency. A delivery that
/// times out is retried once; individual peer failures never fail the slot.
pub async fn broadcast_scores(
    sender: Arc<dyn PeerSender>,
    peers: Vec<(Uid, Url)>,
    body: ScoresBody,
    concurrency: usize,
    deadline: DateTime<Utc>,
) -> Vec<DeliveryOutcome> {
    let body = Arc::new(body);
    stream::iter(peers)
        .map(|(peer, endpoint)| {
            let sender = sender.clone();
            let body = body.clone();
            async move {
                let timeout = (deadline - Utc::now())
                    .to_std()
                    .unwrap_or_default()
                    .min(Duration::from_secs(30));
                if timeout.is_zero() {
                    return DeliveryOutcome {
                        peer,
                        delivered: false,
                    };
                }
                let mut outcome = sender.send_scores(&endpoint, &body, timeout).await;
                if matches!(outcome, Err(ExchangeError::Timeout)) {
                    outcome = sender.send_scores(&endpoint, &body, timeout).await;
                }
                if let Err(e) = &outcome {
                    log::debug!("score delivery to peer {peer} failed: {e}");
                }
                DeliveryOutcome {
                    peer,
                    delivered: outcome.is_ok(),
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::uid;

    fn msg(slot: SlotNumber, reporter: u8, miner: u8, score: f64) -> (IntakeMsg, oneshot::Receiver<IntakeVerdict>) {
        let (reply, rx) = oneshot::channel();
        (
            IntakeMsg {
                slot,
                reporter: uid(reporter),
                miner: uid(miner),
                score,
                reply,
            },
            rx,
        )
    }

    #[test]
    fn duplicate_records_are_dropped() {
        let index = ScoreIndex::new();
        index.begin_slot(10, 100);

        let (first, _rx) = msg(10, 1, 2, 0.5);
        assert_eq!(index.insert(&first), IntakeVerdict::Accepted);
        let (dup, _rx) = msg(10, 1, 2, 0.9);
        assert_eq!(index.insert(&dup), IntakeVerdict::Duplicate);

        // The original score survives: duplicate delivery changes nothing.
        let snapshot = index.snapshot(10);
        assert_eq!(snapshot.get(&uid(2), &uid(1)), Some(0.5));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn slot_window_is_current_plus_minus_one() {
        let index = ScoreIndex::new();
        index.begin_slot(10, 100);

        for (slot, expected) in [
            (9, IntakeVerdict::Accepted),
            (10, IntakeVerdict::Accepted),
            (11, IntakeVerdict::Accepted),
            (8, IntakeVerdict::OutOfWindow),
            (12, IntakeVerdict::OutOfWindow),
        ] {
            let (m, _rx) = msg(slot, 1, slot as u8, 0.5);
            assert_eq!(index.insert(&m), expected, "slot {slot}");
        }
    }

    #[test]
    fn begin_slot_retires_old_slots() {
        let index = ScoreIndex::new();
        index.begin_slot(10, 100);
        let (m, _rx) = msg(10, 1, 2, 0.5);
        index.insert(&m);

        index.begin_slot(12, 100);
        assert!(index.snapshot(10).is_empty());
    }

    #[test]
    fn buffer_bound_evicts_oldest() {
        let index = ScoreIndex::new();
        index.begin_slot(5, 2);

        let (a, _rx) = msg(5, 1, 1, 0.1);
        let (b, _rx2) = msg(5, 1, 2, 0.2);
        let (c, _rx3) = msg(5, 1, 3, 0.3);
        index.insert(&a);
        index.insert(&b);
        index.insert(&c);

        let snapshot = index.snapshot(5);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&uid(1), &uid(1)), None); // oldest evicted
        assert_eq!(snapshot.get(&uid(3), &uid(1)), Some(0.3));
    }

    #[tokio::test]
    async fn quorum_completes_when_reporters_arrive() {
        let index = ScoreIndex::new();
        index.begin_slot(7, 100);

        let waiter = {
            let index = index.clone();
            tokio::spawn(async move {
                index
                    .await_quorum(7, 2, Utc::now() + chrono::Duration::seconds(5))
                    .await
            })
        };

        let (a, _rx) = msg(7, 1, 1, 0.5);
        index.insert(&a);
        let (b, _rx2) = msg(7, 2, 1, 0.6);
        index.insert(&b);

        let count = waiter.await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn quorum_returns_at_deadline() {
        let index = ScoreIndex::new();
        index.begin_slot(7, 100);
        let count = index
            .await_quorum(7, 5, Utc::now() + chrono::Duration::milliseconds(50))
            .await;
        assert_eq!(count, 0);
    }

    #[test]
    fn record_digest_binds_all_fields() {
        let base = record_digest(1, &uid(1), &uid(2), 500, 99);
        assert_ne!(base, record_digest(2, &uid(1), &uid(2), 500, 99));
        assert_ne!(base, record_digest(1, &uid(3), &uid(2), 500, 99));
        assert_ne!(base, record_digest(1, &uid(1), &uid(4), 500, 99));
        assert_ne!(base, record_digest(1, &uid(1), &uid(2), 501, 99));
        assert_ne!(base, record_digest(1, &uid(1), &uid(2), 500, 98));
    }

    #[test]
    fn signed_records_round_millis() {
        let signer = Signer::random();
        let records = sign_local_scores(&signer, &uid(9), 4, &[(uid(1), 0.6667), (uid(2), 1.5)]);
        assert_eq!(records[0].score_milli, 667);
        assert_eq!(records[1].score_milli, 1000);
    }

    struct CountingSender {
        calls: Mutex<Vec<Uid>>,
        fail_timeouts: Mutex<HashSet<Uid>>,
    }

    #[async_trait]
    impl PeerSender for CountingSender {
        async fn send_scores(
            &self,
            endpoint: &Url,
            _body: &ScoresBody,
            _timeout: Duration,
        ) -> Result<(), ExchangeError> {
            // Endpoint host carries the peer seed for the test.
            let seed: u8 = endpoint
                .host_str()
                .unwrap()
                .strip_prefix("peer-")
                .unwrap()
                .parse()
                .unwrap();
            self.calls.lock().push(uid(seed));
            if self.fail_timeouts.lock().contains(&uid(seed)) {
                Err(ExchangeError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn broadcast_retries_timeouts_once() {
        let sender = Arc::new(CountingSender {
            calls: Mutex::new(vec![]),
            fail_timeouts: Mutex::new([uid(2)].into_iter().collect()),
        });
        let peers = vec![
            (uid(1), "http://peer-1:9944".parse().unwrap()),
            (uid(2), "http://peer-2:9944".parse().unwrap()),
        ];
        let outcomes = broadcast_scores(
            sender.clone(),
            peers,
            ScoresBody { records: vec![] },
            8,
            Utc::now() + chrono::Duration::seconds(5),
        )
        .await;

        let delivered: HashMap<Uid, bool> =
            outcomes.iter().map(|o| (o.peer, o.delivered)).collect();
        assert_eq!(delivered[&uid(1)], true);
        assert_eq!(delivered[&uid(2)], false);
        // Peer 1 once, peer 2 original plus one retry.
        let calls = sender.calls.lock();
        assert_eq!(calls.iter().filter(|u| **u == uid(1)).count(), 1);
        assert_eq!(calls.iter().filter(|u| **u == uid(2)).count(), 2);
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable per-miner trust state, slot acknowledgements and fraud flags.
//! All writes for a slot land in one atomic group together with the SlotAck,
//! so a reader can never observe a half-applied slot and the ack doubles as
//! the commit-idempotence marker.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{Error as DbError, Store};
use crate::types::{unscale_score, SlotNumber, Uid};

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("state codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

fn trust_key(miner: &Uid) -> Vec<u8> {
    format!("trust/{}", miner.to_hex()).into_bytes()
}

fn history_key(miner: &Uid) -> Vec<u8> {
    format!("history/{}", miner.to_hex()).into_bytes()
}

fn slot_ack_key(slot: SlotNumber) -> Vec<u8> {
    format!("slot_ack/{slot:020}").into_bytes()
}

fn fraud_key(validator: &Uid, slot: SlotNumber) -> Vec<u8> {
    format!("fraud/{}/{slot:020}", validator.to_hex()).into_bytes()
}

fn fraud_latest_key(validator: &Uid) -> Vec<u8> {
    format!("fraud_latest/{}", validator.to_hex()).into_bytes()
}

fn pending_commit_key(slot: SlotNumber) -> Vec<u8> {
    format!("pending_commit/{slot:020}").into_bytes()
}

/// One (slot, score) pair of the bounded performance history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub slot: SlotNumber,
    pub scaled_score: u64,
}

/// Durable per-miner record. Score fields are kept in scaled integer form so
/// a round trip through the store is bit-exact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrustState {
    pub last_selected_slot: Option<SlotNumber>,
    pub scaled_trust: u64,
    pub scaled_performance: u64,
    pub history: VecDeque<HistoryEntry>,
}

impl TrustState {
    pub fn trust(&self) -> f64 {
        unscale_score(self.scaled_trust)
    }

    /// Slot of the most recent evaluation, i.e. the newest history entry.
    pub fn last_evaluated_slot(&self) -> Option<SlotNumber> {
        self.history.back().map(|e| e.slot)
    }
}

/// New scaled values for a miner evaluated this slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledScores {
    pub performance: u64,
    pub trust: u64,
}

/// Per-miner part of a slot update. A selected-but-unevaluated miner only
/// advances its selection slot; trust and history stay untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerSlotUpdate {
    pub miner: Uid,
    pub selected: bool,
    pub scores: Option<ScaledScores>,
}

#[derive(Serialize, Deserialize)]
struct StoredTrust {
    last_selected_slot: Option<SlotNumber>,
    scaled_trust: u64,
    scaled_performance: u64,
}

/// Single-writer store over a [`Store`] backend. The write lock is only held
/// inside [`StateStore::apply_slot_update`]; reads go straight to the
/// backend.
pub struct StateStore<DB> {
    db: DB,
    history_length: usize,
    write_lock: Mutex<()>,
}

impl<DB: Store> StateStore<DB> {
    pub fn new(db: DB, history_length: usize) -> Self {
        Self {
            db,
            history_length: history_length.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn get_trust_state(&self, miner: &Uid) -> Result<Option<TrustState>, StateError> {
        let Some(raw) = self.db.read(trust_key(miner))? else {
            return Ok(None);
        };
        let stored: StoredTrust = serde_json::from_slice(&raw)?;
        let history: VecDeque<HistoryEntry> = match self.db.read(history_key(miner))? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => VecDeque::new(),
        };
        Ok(Some(TrustState {
            last_selected_slot: stored.last_selected_slot,
            scaled_trust: stored.scaled_trust,
            scaled_performance: stored.scaled_performance,
            history,
        }))
    }

    pub fn get_slot_ack(&self, slot: SlotNumber) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.db.read(slot_ack_key(slot))?)
    }

    /// Apply a committed slot: every miner update plus the SlotAck in one
    /// atomic write group. Returns `false` without touching anything when
    /// the slot already carries an ack.
    pub fn apply_slot_update(
        &self,
        slot: SlotNumber,
        updates: &[MinerSlotUpdate],
        receipt: &[u8],
    ) -> Result<bool, StateError> {
        let _guard = self.write_lock.lock();
        if self.db.exists(slot_ack_key(slot))? {
            log::debug!("slot {slot} already acked, skipping state application");
            return Ok(false);
        }

        let mut group: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(updates.len() * 2 + 1);
        for update in updates {
            let mut state = self.get_trust_state(&update.miner)?.unwrap_or_default();
            if update.selected {
                state.last_selected_slot = Some(slot);
            }
            if let Some(scores) = &update.scores {
                state.scaled_trust = scores.trust;
                state.scaled_performance = scores.performance;
                state.history.push_back(HistoryEntry {
                    slot,
                    scaled_score: scores.performance,
                });
                while state.history.len() > self.history_length {
                    state.history.pop_front();
                }
                group.push((
                    history_key(&update.miner),
                    serde_json::to_vec(&state.history)?,
                ));
            }
            let stored = StoredTrust {
                last_selected_slot: state.last_selected_slot,
                scaled_trust: state.scaled_trust,
                scaled_performance: state.scaled_performance,
            };
            group.push((trust_key(&update.miner), serde_json::to_vec(&stored)?));
        }
        group.push((slot_ack_key(slot), receipt.to_vec()));

        self.db.bulk_write(&group)?;
        // The pending marker is only advisory; clearing it outside the group
        // is safe because a leftover marker is re-checked against the ack.
        self.db.delete(pending_commit_key(slot))?;
        Ok(true)
    }

    pub fn record_fraud_flag(&self, validator: &Uid, slot: SlotNumber) -> Result<(), StateError> {
        let group = [
            (fraud_key(validator, slot), slot.to_be_bytes().to_vec()),
            (fraud_latest_key(validator), slot.to_be_bytes().to_vec()),
        ];
        self.db.bulk_write(&group)?;
        log::warn!("fraud flag recorded for validator {validator} at slot {slot}");
        Ok(())
    }

    /// Latest slot at which the validator was flagged, if any.
    pub fn latest_fraud_flag(&self, validator: &Uid) -> Result<Option<SlotNumber>, StateError> {
        let Some(raw) = self.db.read(fraud_latest_key(validator))? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| DbError::Other("corrupt fraud flag entry".into()))?;
        Ok(Some(SlotNumber::from_be_bytes(bytes)))
    }

    pub fn has_fraud_flag(&self, validator: &Uid, slot: SlotNumber) -> Result<bool, StateError> {
        Ok(self.db.exists(fraud_key(validator, slot))?)
    }

    /// Durable record of a partially committed slot, consulted by the next
    /// slot's commit phase.
    pub fn set_pending_commit(&self, slot: SlotNumber, raw: &[u8]) -> Result<(), StateError> {
        Ok(self.db.write(pending_commit_key(slot), raw)?)
    }

    pub fn get_pending_commit(&self, slot: SlotNumber) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.db.read(pending_commit_key(slot))?)
    }

    pub fn clear_pending_commit(&self, slot: SlotNumber) -> Result<(), StateError> {
        Ok(self.db.delete(pending_commit_key(slot))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDB;
    use crate::test_utils::uid;
    use pretty_assertions::assert_eq;

    fn store() -> StateStore<MemoryDB> {
        StateStore::new(MemoryDB::default(), 4)
    }

    fn evaluated(miner: Uid, performance: u64, trust: u64) -> MinerSlotUpdate {
        MinerSlotUpdate {
            miner,
            selected: true,
            scores: Some(ScaledScores { performance, trust }),
        }
    }

    #[test]
    fn apply_then_read_back_is_bit_exact() {
        let store = store();
        let update = evaluated(uid(1), 900_000, 552_372);
        assert!(store.apply_slot_update(7, &[update], b"receipt").unwrap());

        let state = store.get_trust_state(&uid(1)).unwrap().unwrap();
        assert_eq!(state.scaled_performance, 900_000);
        assert_eq!(state.scaled_trust, 552_372);
        assert_eq!(state.last_selected_slot, Some(7));
        assert_eq!(
            state.history,
            VecDeque::from([HistoryEntry {
                slot: 7,
                scaled_score: 900_000
            }])
        );
        assert_eq!(store.get_slot_ack(7).unwrap().as_deref(), Some(&b"receipt"[..]));
    }

    #[test]
    fn replaying_an_acked_slot_is_a_noop() {
        let store = store();
        assert!(store
            .apply_slot_update(7, &[evaluated(uid(1), 900_000, 500_000)], b"r1")
            .unwrap());
        // Replay with different values: nothing may change.
        assert!(!store
            .apply_slot_update(7, &[evaluated(uid(1), 100_000, 100_000)], b"r2")
            .unwrap());

        let state = store.get_trust_state(&uid(1)).unwrap().unwrap();
        assert_eq!(state.scaled_performance, 900_000);
        assert_eq!(store.get_slot_ack(7).unwrap().as_deref(), Some(&b"r1"[..]));
    }

    #[test]
    fn no_ack_means_no_mutation() {
        let store = store();
        assert_eq!(store.get_slot_ack(3).unwrap(), None);
        assert_eq!(store.get_trust_state(&uid(1)).unwrap(), None);
    }

    #[test]
    fn history_is_bounded_fifo() {
        let store = store();
        for slot in 1..=6u64 {
            store
                .apply_slot_update(
                    slot,
                    &[evaluated(uid(1), slot * 100_000, 500_000)],
                    b"r",
                )
                .unwrap();
        }
        let state = store.get_trust_state(&uid(1)).unwrap().unwrap();
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.history.front().unwrap().slot, 3);
        assert_eq!(state.history.back().unwrap().slot, 6);
        assert_eq!(state.last_evaluated_slot(), Some(6));
    }

    #[test]
    fn selection_only_update_keeps_trust_and_history() {
        let store = store();
        store
            .apply_slot_update(1, &[evaluated(uid(1), 800_000, 600_000)], b"r")
            .unwrap();

        let selection_only = MinerSlotUpdate {
            miner: uid(1),
            selected: true,
            scores: None,
        };
        store.apply_slot_update(2, &[selection_only], b"r2").unwrap();

        let state = store.get_trust_state(&uid(1)).unwrap().unwrap();
        assert_eq!(state.last_selected_slot, Some(2));
        assert_eq!(state.scaled_trust, 600_000);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.last_evaluated_slot(), Some(1));
    }

    #[test]
    fn fraud_flags_round_trip() {
        let store = store();
        assert_eq!(store.latest_fraud_flag(&uid(9)).unwrap(), None);
        store.record_fraud_flag(&uid(9), 41).unwrap();
        store.record_fraud_flag(&uid(9), 43).unwrap();

        assert_eq!(store.latest_fraud_flag(&uid(9)).unwrap(), Some(43));
        assert!(store.has_fraud_flag(&uid(9), 41).unwrap());
        assert!(store.has_fraud_flag(&uid(9), 43).unwrap());
        assert!(!store.has_fraud_flag(&uid(9), 42).unwrap());
    }

    #[test]
    fn pending_commit_round_trip() {
        let store = store();
        store.set_pending_commit(5, b"chunks").unwrap();
        assert_eq!(
            store.get_pending_commit(5).unwrap().as_deref(),
            Some(&b"chunks"[..])
        );
        store.clear_pending_commit(5).unwrap();
        assert_eq!(store.get_pending_commit(5).unwrap(), None);

        // Applying the slot also clears the marker.
        store.set_pending_commit(6, b"chunks").unwrap();
        store
            .apply_slot_update(6, &[evaluated(uid(2), 1, 2)], b"r")
            .unwrap();
        assert_eq!(store.get_pending_commit(6).unwrap(), None);
    }
}

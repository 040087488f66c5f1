// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Local cache of the on-chain registry. Refreshed at most once per slot by
//! the slot driver; every other component reads immutable snapshots, so a
//! mid-slot registry change never splits a slot's view of the world.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ethereum_types::H160;
use parking_lot::RwLock;

use crate::chain::{ChainClient, SubnetParams};
use crate::types::{MinerEntry, SlotNumber, SubnetId, Uid, ValidatorEntry};

/// Immutable registry view taken at a refresh.
#[derive(Clone, Debug)]
pub struct MetagraphSnapshot {
    pub slot: SlotNumber,
    pub fetched_at: DateTime<Utc>,
    pub head_timestamp: u64,
    pub params: SubnetParams,
    pub miners: Vec<MinerEntry>,
    pub validators: Vec<ValidatorEntry>,
}

impl MetagraphSnapshot {
    pub fn active_miners(&self) -> impl Iterator<Item = &MinerEntry> {
        self.miners.iter().filter(|m| m.is_active())
    }

    pub fn active_validators(&self) -> impl Iterator<Item = &ValidatorEntry> {
        self.validators.iter().filter(|v| v.is_active())
    }

    pub fn validator_by_address(&self, address: H160) -> Option<&ValidatorEntry> {
        self.validators.iter().find(|v| v.owner == address)
    }

    pub fn validator_by_uid(&self, uid: &Uid) -> Option<&ValidatorEntry> {
        self.validators.iter().find(|v| &v.uid == uid)
    }

    pub fn miner_by_uid(&self, uid: &Uid) -> Option<&MinerEntry> {
        self.miners.iter().find(|m| &m.uid == uid)
    }

    /// Active peer validators, excluding the local one.
    pub fn peers_of(&self, self_address: H160) -> Vec<&ValidatorEntry> {
        self.active_validators()
            .filter(|v| v.owner != self_address)
            .collect()
    }
}

/// Outcome of a refresh attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Fresh,
    /// Refresh failed; the previous snapshot is still served. Carries the
    /// number of consecutive stale slots.
    Stale(u64),
    /// Stale beyond `max_stale_slots`; commits must be suppressed.
    Degraded(u64),
}

pub struct MetagraphCache {
    chain: Arc<dyn ChainClient>,
    subnet: SubnetId,
    self_address: H160,
    max_stale_slots: u64,
    snapshot: RwLock<Option<Arc<MetagraphSnapshot>>>,
    stale_slots: AtomicU64,
}

impl MetagraphCache {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        subnet: SubnetId,
        self_address: H160,
        max_stale_slots: u64,
    ) -> Self {
        Self {
            chain,
            subnet,
            self_address,
            max_stale_slots,
            snapshot: RwLock::new(None),
            stale_slots: AtomicU64::new(0),
        }
    }

    pub fn subnet(&self) -> SubnetId {
        self.subnet
    }

    pub fn self_address(&self) -> H160 {
        self.self_address
    }

    /// Pull a fresh registry snapshot for `slot`. On failure the previous
    /// snapshot keeps being served until the staleness budget runs out.
    pub async fn refresh(&self, slot: SlotNumber) -> RefreshOutcome {
        let fetched = async {
            let params = self.chain.subnet_params(self.subnet).await?;
            let miners = self.chain.subnet_miners(self.subnet).await?;
            let validators = self.chain.subnet_validators(self.subnet).await?;
            let head_timestamp = self.chain.chain_head_timestamp().await?;
            Ok::<_, crate::chain::Error>(MetagraphSnapshot {
                slot,
                fetched_at: Utc::now(),
                head_timestamp,
                params,
                miners,
                validators,
            })
        }
        .await;

        match fetched {
            Ok(snapshot) => {
                *self.snapshot.write() = Some(Arc::new(snapshot));
                self.stale_slots.store(0, Ordering::Relaxed);
                RefreshOutcome::Fresh
            }
            Err(e) => {
                let stale = self.stale_slots.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("metagraph refresh failed for slot {slot} ({stale} stale): {e}");
                if stale > self.max_stale_slots {
                    RefreshOutcome::Degraded(stale)
                } else {
                    RefreshOutcome::Stale(stale)
                }
            }
        }
    }

    pub fn snapshot(&self) -> Option<Arc<MetagraphSnapshot>> {
        self.snapshot.read().clone()
    }

    pub fn self_validator(&self) -> Option<ValidatorEntry> {
        self.snapshot()?
            .validator_by_address(self.self_address)
            .cloned()
    }

    pub fn is_degraded(&self) -> bool {
        self.stale_slots.load(Ordering::Relaxed) > self.max_stale_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::test_utils::{miner_entry, validator_entry};

    fn cache_with(chain: Arc<MockChain>, self_address: H160) -> MetagraphCache {
        MetagraphCache::new(chain, 7, self_address, 3)
    }

    #[tokio::test]
    async fn refresh_swaps_snapshot() {
        let chain = Arc::new(MockChain::new());
        let validator = validator_entry(1, 500_000);
        let self_address = validator.owner;
        chain.set_miners(vec![miner_entry(10, 400_000)]);
        chain.set_validators(vec![validator]);
        chain.set_head_timestamp(1234);

        let cache = cache_with(chain, self_address);
        assert!(cache.snapshot().is_none());
        assert_eq!(cache.refresh(5).await, RefreshOutcome::Fresh);

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot.slot, 5);
        assert_eq!(snapshot.miners.len(), 1);
        assert_eq!(cache.self_validator().unwrap().owner, self_address);
    }

    #[tokio::test]
    async fn stale_snapshot_served_until_degraded() {
        let chain = Arc::new(MockChain::new());
        chain.set_miners(vec![miner_entry(10, 400_000)]);
        let cache = cache_with(chain.clone(), H160::repeat_byte(1));
        assert_eq!(cache.refresh(1).await, RefreshOutcome::Fresh);

        chain.fail_next_reads(16);
        assert_eq!(cache.refresh(2).await, RefreshOutcome::Stale(1));
        assert_eq!(cache.refresh(3).await, RefreshOutcome::Stale(2));
        assert_eq!(cache.refresh(4).await, RefreshOutcome::Stale(3));
        assert!(!cache.is_degraded());
        assert_eq!(cache.refresh(5).await, RefreshOutcome::Degraded(4));
        assert!(cache.is_degraded());

        // The old snapshot is still readable while degraded.
        assert_eq!(cache.snapshot().unwrap().slot, 1);
    }

    #[tokio::test]
    async fn recovery_resets_staleness() {
        let chain = Arc::new(MockChain::new());
        let cache = cache_with(chain.clone(), H160::repeat_byte(1));
        // Each failed refresh trips on its first registry read.
        chain.fail_next_reads(4);
        for slot in 0..4 {
            cache.refresh(slot).await;
        }
        assert!(cache.is_degraded());

        assert_eq!(cache.refresh(5).await, RefreshOutcome::Fresh);
        assert!(!cache.is_degraded());
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Node operational state shared between the slot driver and the health
//! endpoint.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::SlotNumber;

/// Coarse node state. `Degraded` suppresses commits but keeps receive-side
/// P2P and metagraph refresh alive.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Starting,
    Syncing,
    Active,
    Degraded,
    Stopping,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Starting => write!(f, "starting"),
            NodeState::Syncing => write!(f, "syncing"),
            NodeState::Active => write!(f, "active"),
            NodeState::Degraded => write!(f, "degraded"),
            NodeState::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_state: NodeState,
    pub last_committed_slot: Option<SlotNumber>,
    pub degraded_reason: Option<String>,
}

/// Shared handle to the node status; writers are the slot driver and the
/// daemon supervisor, readers the health endpoint.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<NodeStatus>>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(NodeStatus {
                node_state: NodeState::Starting,
                last_committed_slot: None,
                degraded_reason: None,
            })),
        }
    }
}

impl StatusHandle {
    pub fn snapshot(&self) -> NodeStatus {
        self.inner.read().clone()
    }

    pub fn node_state(&self) -> NodeState {
        self.inner.read().node_state
    }

    pub fn set_state(&self, state: NodeState) {
        let mut inner = self.inner.write();
        inner.node_state = state;
        if state != NodeState::Degraded {
            inner.degraded_reason = None;
        }
        log::info!("node state: {state}");
    }

    pub fn set_degraded(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.write();
        inner.node_state = NodeState::Degraded;
        inner.degraded_reason = Some(reason.clone());
        drop(inner);
        log::warn!("node degraded: {reason}");
        crate::metrics::NODE_DEGRADED.set(1);
    }

    pub fn clear_degraded(&self) {
        let mut inner = self.inner.write();
        if inner.node_state == NodeState::Degraded {
            inner.node_state = NodeState::Active;
            inner.degraded_reason = None;
            drop(inner);
            log::info!("node recovered from degraded state");
            crate::metrics::NODE_DEGRADED.set(0);
        }
    }

    pub fn record_commit(&self, slot: SlotNumber) {
        self.inner.write().last_committed_slot = Some(slot);
        crate::metrics::LAST_COMMITTED_SLOT.set(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_reason_is_cleared_on_recovery() {
        let status = StatusHandle::default();
        status.set_degraded("metagraph stale for 3 slots");
        assert_eq!(status.node_state(), NodeState::Degraded);
        assert!(status.snapshot().degraded_reason.is_some());

        status.clear_degraded();
        assert_eq!(status.node_state(), NodeState::Active);
        assert!(status.snapshot().degraded_reason.is_none());
    }

    #[test]
    fn commit_tracks_last_slot() {
        let status = StatusHandle::default();
        assert_eq!(status.snapshot().last_committed_slot, None);
        status.record_commit(42);
        assert_eq!(status.snapshot().last_committed_slot, Some(42));
    }
}

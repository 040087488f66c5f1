// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wall-clock slot and phase scheduling. The clock assumes weak synchrony
//! between validators: every node derives the same (slot, phase) from UTC
//! time, genesis timestamp and the configured phase fractions.

use std::fmt;
use std::ops::Range;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConsensusConfig;
use crate::types::SlotNumber;

#[derive(Debug, Error)]
pub enum Error {
    #[error("current time predates genesis")]
    BeforeGenesis,
    #[error("phase {phase} of slot {slot} already elapsed")]
    PhaseMissed { slot: SlotNumber, phase: Phase },
    #[error("clock drift {skew_ms} ms exceeds tolerance {tolerance_ms} ms")]
    ClockDrift { skew_ms: i64, tolerance_ms: i64 },
    #[error("invalid slot timing configuration: {0}")]
    InvalidConfig(String),
}

/// The four consecutive phases of a slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Task,
    LocalScoring,
    PeerExchange,
    Commit,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Task,
        Phase::LocalScoring,
        Phase::PeerExchange,
        Phase::Commit,
    ];

    pub fn index(&self) -> usize {
        match self {
            Phase::Task => 0,
            Phase::LocalScoring => 1,
            Phase::PeerExchange => 2,
            Phase::Commit => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Task => write!(f, "task"),
            Phase::LocalScoring => write!(f, "local scoring"),
            Phase::PeerExchange => write!(f, "peer exchange"),
            Phase::Commit => write!(f, "consensus & commit"),
        }
    }
}

/// Where the wall clock currently sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPosition {
    pub slot: SlotNumber,
    pub phase: Phase,
    pub remaining: std::time::Duration,
}

/// Result of waiting for the next runnable slot. `missed` holds slots that
/// elapsed while the node was busy or the clock jumped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotTick {
    pub slot: SlotNumber,
    pub missed: Range<SlotNumber>,
}

pub struct SlotClock {
    genesis: DateTime<Utc>,
    slot_length_ms: i64,
    phase_lengths_ms: [i64; 4],
    drift_tolerance_ms: i64,
}

impl SlotClock {
    pub fn new(genesis_time: u64, config: &ConsensusConfig) -> Result<Self, Error> {
        let slot_length_ms = (config.slot_length_s as i64)
            .checked_mul(1000)
            .ok_or_else(|| Error::InvalidConfig("slot_length_s overflows".into()))?;

        let mut phase_lengths_ms = [0i64; 4];
        let mut assigned = 0i64;
        for i in 0..3 {
            phase_lengths_ms[i] = (slot_length_ms as f64 * config.phase_fractions[i]) as i64;
            assigned += phase_lengths_ms[i];
        }
        // Last phase takes the remainder so the four lengths always sum to
        // the slot length exactly.
        phase_lengths_ms[3] = slot_length_ms - assigned;
        if phase_lengths_ms.iter().any(|len| *len <= 0) {
            return Err(Error::InvalidConfig(
                "every phase must be at least one millisecond long".into(),
            ));
        }

        let genesis = Utc
            .timestamp_opt(genesis_time as i64, 0)
            .single()
            .ok_or_else(|| Error::InvalidConfig("genesis_time out of range".into()))?;

        Ok(Self {
            genesis,
            slot_length_ms,
            phase_lengths_ms,
            drift_tolerance_ms: config.clock_drift_tolerance_s as i64 * 1000,
        })
    }

    pub fn genesis(&self) -> DateTime<Utc> {
        self.genesis
    }

    pub fn slot_length(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slot_length_ms as u64)
    }

    pub fn phase_length(&self, phase: Phase) -> std::time::Duration {
        std::time::Duration::from_millis(self.phase_lengths_ms[phase.index()] as u64)
    }

    /// Slot and phase at an arbitrary instant.
    pub fn position_at(&self, time: DateTime<Utc>) -> Result<SlotPosition, Error> {
        let elapsed_ms = time
            .signed_duration_since(self.genesis)
            .num_milliseconds();
        if elapsed_ms < 0 {
            return Err(Error::BeforeGenesis);
        }

        let slot = (elapsed_ms / self.slot_length_ms) as SlotNumber;
        let mut within = elapsed_ms % self.slot_length_ms;
        for phase in Phase::ALL {
            let len = self.phase_lengths_ms[phase.index()];
            if within < len {
                return Ok(SlotPosition {
                    slot,
                    phase,
                    remaining: std::time::Duration::from_millis((len - within) as u64),
                });
            }
            within -= len;
        }
        unreachable!("phase lengths sum to the slot length")
    }

    pub fn current(&self) -> Result<SlotPosition, Error> {
        self.position_at(Utc::now())
    }

    pub fn slot_start(&self, slot: SlotNumber) -> DateTime<Utc> {
        self.genesis + ChronoDuration::milliseconds(slot as i64 * self.slot_length_ms)
    }

    pub fn phase_start(&self, slot: SlotNumber, phase: Phase) -> DateTime<Utc> {
        let offset: i64 = self.phase_lengths_ms[..phase.index()].iter().sum();
        self.slot_start(slot) + ChronoDuration::milliseconds(offset)
    }

    /// Instant at which the given phase ends.
    pub fn deadline_for(&self, slot: SlotNumber, phase: Phase) -> DateTime<Utc> {
        self.phase_start(slot, phase)
            + ChronoDuration::milliseconds(self.phase_lengths_ms[phase.index()])
    }

    /// Sleep until the start of `(slot, phase)`. Returns immediately when the
    /// phase is in progress and fails when it has already ended.
    pub async fn await_phase(&self, slot: SlotNumber, phase: Phase) -> Result<(), Error> {
        let now = Utc::now();
        if now >= self.deadline_for(slot, phase) {
            return Err(Error::PhaseMissed { slot, phase });
        }
        let start = self.phase_start(slot, phase);
        if let Ok(wait) = (start - now).to_std() {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Wait for the next slot whose task phase can still be entered. Slots
    /// that elapsed since `prev` are reported missed, never executed.
    pub async fn next_slot(&self, prev: Option<SlotNumber>) -> Result<SlotTick, Error> {
        let now = Utc::now();
        let position = self.position_at(now)?;

        // A slot is runnable from its start until its task phase ends.
        let first_runnable = if position.phase == Phase::Task {
            position.slot
        } else {
            position.slot + 1
        };
        let earliest = match prev {
            Some(prev) => prev + 1,
            None => first_runnable,
        };
        let target = earliest.max(first_runnable);

        let start = self.slot_start(target);
        if let Ok(wait) = (start - now).to_std() {
            tokio::time::sleep(wait).await;
        }
        Ok(SlotTick {
            slot: target,
            missed: earliest..target,
        })
    }

    /// Check the local clock against a reference timestamp (the latest chain
    /// head). The head may legitimately lag by up to one slot, so the guard
    /// trips when the local clock is behind the head by more than ε, or ahead
    /// of it by more than one slot plus ε.
    pub fn verify_drift(&self, reference_unix: u64, now: DateTime<Utc>) -> Result<(), Error> {
        let local_ms = now.timestamp_millis();
        let reference_ms = reference_unix as i64 * 1000;
        let ahead_ms = local_ms - reference_ms;

        let skew_ms = if ahead_ms < 0 {
            -ahead_ms
        } else if ahead_ms > self.slot_length_ms {
            ahead_ms - self.slot_length_ms
        } else {
            0
        };
        if skew_ms > self.drift_tolerance_ms {
            return Err(Error::ClockDrift {
                skew_ms,
                tolerance_ms: self.drift_tolerance_ms,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_clock(slot_length_s: u64) -> SlotClock {
        let config = ConsensusConfig {
            slot_length_s,
            phase_fractions: [0.4, 0.1, 0.25, 0.25],
            ..Default::default()
        };
        SlotClock::new(1_000_000, &config).unwrap()
    }

    fn at(clock: &SlotClock, offset_ms: i64) -> DateTime<Utc> {
        clock.genesis() + ChronoDuration::milliseconds(offset_ms)
    }

    #[test]
    fn genesis_is_slot_zero_phase_task() {
        let clock = test_clock(100);
        let pos = clock.position_at(clock.genesis()).unwrap();
        assert_eq!(pos.slot, 0);
        assert_eq!(pos.phase, Phase::Task);
        assert_eq!(pos.remaining, std::time::Duration::from_secs(40));
    }

    #[test]
    fn phases_partition_the_slot() {
        let clock = test_clock(100);
        // 40s task, 10s scoring, 25s exchange, 25s commit.
        assert_eq!(clock.position_at(at(&clock, 39_999)).unwrap().phase, Phase::Task);
        assert_eq!(
            clock.position_at(at(&clock, 40_000)).unwrap().phase,
            Phase::LocalScoring
        );
        assert_eq!(
            clock.position_at(at(&clock, 50_000)).unwrap().phase,
            Phase::PeerExchange
        );
        assert_eq!(clock.position_at(at(&clock, 75_000)).unwrap().phase, Phase::Commit);
        let next = clock.position_at(at(&clock, 100_000)).unwrap();
        assert_eq!(next.slot, 1);
        assert_eq!(next.phase, Phase::Task);
    }

    #[test]
    fn deadlines_are_phase_starts_of_successors() {
        let clock = test_clock(100);
        assert_eq!(
            clock.deadline_for(3, Phase::Task),
            clock.phase_start(3, Phase::LocalScoring)
        );
        assert_eq!(clock.deadline_for(3, Phase::Commit), clock.slot_start(4));
    }

    #[test]
    fn before_genesis_is_an_error() {
        let clock = test_clock(100);
        let early = clock.genesis() - ChronoDuration::seconds(1);
        assert!(matches!(
            clock.position_at(early),
            Err(Error::BeforeGenesis)
        ));
    }

    #[test]
    fn phase_lengths_sum_exactly() {
        // Fractions that do not divide the slot length evenly.
        let config = ConsensusConfig {
            slot_length_s: 10,
            phase_fractions: [1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0, 1.0 / 6.0],
            ..Default::default()
        };
        let clock = SlotClock::new(0, &config).unwrap();
        let total: std::time::Duration = Phase::ALL.iter().map(|p| clock.phase_length(*p)).sum();
        assert_eq!(total, clock.slot_length());
    }

    #[test]
    fn drift_guard() {
        let clock = test_clock(100);
        let now = at(&clock, 500_000);

        // Head equals local time: fine.
        assert!(clock.verify_drift(now.timestamp() as u64, now).is_ok());
        // Head lags by less than a slot: fine.
        assert!(clock
            .verify_drift(now.timestamp() as u64 - 90, now)
            .is_ok());
        // Local clock far behind the head: drift.
        assert!(matches!(
            clock.verify_drift(now.timestamp() as u64 + 30, now),
            Err(Error::ClockDrift { .. })
        ));
        // Local clock far ahead of a fresh head: drift.
        assert!(matches!(
            clock.verify_drift(now.timestamp() as u64 - 200, now),
            Err(Error::ClockDrift { .. })
        ));
    }

    #[tokio::test]
    async fn await_phase_rejects_elapsed_phase() {
        let config = ConsensusConfig {
            slot_length_s: 1,
            phase_fractions: [0.25, 0.25, 0.25, 0.25],
            ..Default::default()
        };
        // Genesis far in the past; slot 0 is long gone.
        let clock = SlotClock::new(0, &config).unwrap();
        assert!(matches!(
            clock.await_phase(0, Phase::Commit).await,
            Err(Error::PhaseMissed { .. })
        ));
    }

    #[tokio::test]
    async fn next_slot_reports_missed_range() {
        let config = ConsensusConfig {
            slot_length_s: 1,
            phase_fractions: [0.7, 0.1, 0.1, 0.1],
            ..Default::default()
        };
        let clock = SlotClock::new(0, &config).unwrap();
        let current = clock.current().unwrap().slot;

        // Pretend the node last ran far in the past; everything since is
        // reported missed and the tick lands on a runnable slot.
        let tick = clock.next_slot(Some(current.saturating_sub(10))).await.unwrap();
        assert!(tick.slot >= current);
        assert_eq!(tick.missed.start, current - 9);
        assert!(tick.missed.end <= tick.slot + 1);
        assert!(!tick.missed.contains(&tick.slot));
    }
}

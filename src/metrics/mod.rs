// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Prometheus metrics for the consensus pipeline, plus the HTTP listener that
//! serves them together with the health endpoint.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use lazy_static::lazy_static;
use prometheus::core::{AtomicU64, GenericCounter, GenericCounterVec, GenericGauge, Opts};
use prometheus::{Encoder, Histogram, HistogramOpts, TextEncoder};

use crate::health::{NodeStatus, StatusHandle};

lazy_static! {
    pub static ref TASKS_DISPATCHED_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let tasks_dispatched_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "tasks_dispatched_total",
                "Total number of task payloads dispatched to miners",
            )
            .expect("Defining the tasks_dispatched_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(tasks_dispatched_total.clone())
            .expect(
                "Registering the tasks_dispatched_total metric with the metrics registry must succeed",
            );
        tasks_dispatched_total
    };
    pub static ref TASK_FAILURE_TOTAL: Box<GenericCounterVec<AtomicU64>> = {
        let task_failure_total = Box::new(
            GenericCounterVec::<AtomicU64>::new(
                Opts::new(
                    "task_failure_total",
                    "Total number of miner task dispatches that yielded no usable response",
                ),
                &[labels::FAILURE_KIND],
            )
            .expect("Defining the task_failure_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(task_failure_total.clone())
            .expect(
                "Registering the task_failure_total metric with the metrics registry must succeed",
            );
        task_failure_total
    };
    pub static ref PEER_RECORDS_REJECTED_TOTAL: Box<GenericCounterVec<AtomicU64>> = {
        let peer_records_rejected_total = Box::new(
            GenericCounterVec::<AtomicU64>::new(
                Opts::new(
                    "peer_records_rejected_total",
                    "Total number of peer score records rejected at intake, by reason",
                ),
                &[labels::REJECT_REASON],
            )
            .expect("Defining the peer_records_rejected_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(peer_records_rejected_total.clone())
            .expect(
                "Registering the peer_records_rejected_total metric with the metrics registry must succeed",
            );
        peer_records_rejected_total
    };
    pub static ref PEER_RECORD_OVERFLOW_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let peer_record_overflow_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "peer_record_overflow_total",
                "Total number of peer score records evicted by the per-slot buffer bound",
            )
            .expect("Defining the peer_record_overflow_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(peer_record_overflow_total.clone())
            .expect(
                "Registering the peer_record_overflow_total metric with the metrics registry must succeed",
            );
        peer_record_overflow_total
    };
    pub static ref COMMIT_FAILURE_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let commit_failure_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "commit_failure_total",
                "Total number of slots whose on-chain commit failed after retries",
            )
            .expect("Defining the commit_failure_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(commit_failure_total.clone())
            .expect(
                "Registering the commit_failure_total metric with the metrics registry must succeed",
            );
        commit_failure_total
    };
    pub static ref SLOTS_SKIPPED_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let slots_skipped_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "slots_skipped_total",
                "Total number of slots skipped (missed by the clock or degraded metagraph)",
            )
            .expect("Defining the slots_skipped_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(slots_skipped_total.clone())
            .expect(
                "Registering the slots_skipped_total metric with the metrics registry must succeed",
            );
        slots_skipped_total
    };
    pub static ref LAST_COMMITTED_SLOT: Box<GenericGauge<AtomicU64>> = {
        let last_committed_slot = Box::new(
            GenericGauge::<AtomicU64>::new(
                "last_committed_slot",
                "Latest slot whose batch update was acknowledged on chain",
            )
            .expect("Defining the last_committed_slot metric must succeed"),
        );
        prometheus::default_registry()
            .register(last_committed_slot.clone())
            .expect(
                "Registering the last_committed_slot metric with the metrics registry must succeed",
            );
        last_committed_slot
    };
    pub static ref NODE_DEGRADED: Box<GenericGauge<AtomicU64>> = {
        let node_degraded = Box::new(
            GenericGauge::<AtomicU64>::new(
                "node_degraded",
                "1 while the node is in the degraded state, 0 otherwise",
            )
            .expect("Defining the node_degraded metric must succeed"),
        );
        prometheus::default_registry()
            .register(node_degraded.clone())
            .expect("Registering the node_degraded metric with the metrics registry must succeed");
        node_degraded
    };
    pub static ref PHASE_PROCESSING_TIME: Box<Histogram> = {
        let phase_processing_time = Box::new(
            Histogram::with_opts(HistogramOpts {
                common_opts: Opts::new(
                    "phase_processing_time",
                    "Duration of the work performed inside each slot phase",
                ),
                buckets: vec![],
            })
            .expect("Defining the phase_processing_time metric must succeed"),
        );
        prometheus::default_registry()
            .register(phase_processing_time.clone())
            .expect(
                "Registering the phase_processing_time metric with the metrics registry must succeed",
            );
        phase_processing_time
    };
}

pub mod labels {
    pub const FAILURE_KIND: &str = "kind";
    pub const REJECT_REASON: &str = "reason";
}

pub mod values {
    // task_failure_total
    pub const TIMEOUT: &str = "timeout";
    pub const TRANSPORT: &str = "transport";
    pub const REJECTED: &str = "rejected";
    pub const BAD_SIGNATURE: &str = "bad_signature";
    pub const SCORING_FAILED: &str = "scoring_failed";
    pub const INVALID_RESULT: &str = "invalid_result";

    // peer_records_rejected_total
    pub const UNKNOWN_REPORTER: &str = "unknown_reporter";
    pub const WRONG_SLOT: &str = "wrong_slot";
    pub const DUPLICATE: &str = "duplicate";
    pub const MALFORMED: &str = "malformed";
}

async fn metrics_handler() -> String {
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("failed to encode metrics: {e}");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn health_handler(State(status): State<StatusHandle>) -> Json<NodeStatus> {
    Json(status.snapshot())
}

/// Serve `/metrics` and `/healthz` on the configured metrics address until the
/// process shuts down.
pub async fn init_metrics_server(addr: SocketAddr, status: StatusHandle) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .with_state(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("metrics server started at {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Metric;

    macro_rules! test_counter {
        ($name:ident) => {
            let _ = $name.metric();
        };
    }

    macro_rules! test_counter_vec {
        ($name:ident) => {
            let _ = $name.with_label_values(&["label"]);
        };
    }

    #[test]
    fn metrics_defined_and_registered() {
        test_counter!(TASKS_DISPATCHED_TOTAL);
        test_counter_vec!(TASK_FAILURE_TOTAL);
        test_counter_vec!(PEER_RECORDS_REJECTED_TOTAL);
        test_counter!(PEER_RECORD_OVERFLOW_TOTAL);
        test_counter!(COMMIT_FAILURE_TOTAL);
        test_counter!(SLOTS_SKIPPED_TOTAL);
        test_counter!(LAST_COMMITTED_SLOT);
        test_counter!(NODE_DEGRADED);
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Receive side of the score exchange: the `POST /scores` endpoint every
//! validator serves to its peers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::oneshot;

use super::{record_digest, IntakeMsg, IntakeVerdict, ScoresBody, SCORE_MILLI_MAX};
use crate::key::recover_address;
use crate::metagraph::MetagraphCache;
use crate::metrics;

#[derive(Clone)]
pub struct ExchangeServerState {
    pub metagraph: Arc<MetagraphCache>,
    pub intake: flume::Sender<IntakeMsg>,
}

#[derive(Serialize, Default, Debug, PartialEq, Eq)]
pub struct ScoresReply {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

enum RecordOutcome {
    Accepted,
    Duplicate,
    AuthFailure(&'static str),
    Malformed(&'static str),
}

async fn evaluate_record(
    state: &ExchangeServerState,
    record: &super::WireScoreRecord,
) -> RecordOutcome {
    if record.score_milli > SCORE_MILLI_MAX {
        return RecordOutcome::Malformed(metrics::values::MALFORMED);
    }

    let Some(snapshot) = state.metagraph.snapshot() else {
        // No registry view yet; nothing can be authenticated.
        return RecordOutcome::AuthFailure(metrics::values::UNKNOWN_REPORTER);
    };
    let Some(reporter) = snapshot.validator_by_uid(&record.reporter_uid) else {
        return RecordOutcome::AuthFailure(metrics::values::UNKNOWN_REPORTER);
    };
    if !reporter.is_active() {
        return RecordOutcome::AuthFailure(metrics::values::UNKNOWN_REPORTER);
    }

    let digest = record_digest(
        record.slot,
        &record.reporter_uid,
        &record.miner_uid,
        record.score_milli,
        record.signed_at_unix,
    );
    match recover_address(digest, &record.signature) {
        Ok(address) if address == reporter.owner => {}
        _ => return RecordOutcome::AuthFailure(metrics::values::BAD_SIGNATURE),
    }

    let (reply, rx) = oneshot::channel();
    let msg = IntakeMsg {
        slot: record.slot,
        reporter: record.reporter_uid,
        miner: record.miner_uid,
        score: record.score_milli as f64 / SCORE_MILLI_MAX as f64,
        reply,
    };
    if state.intake.send_async(msg).await.is_err() {
        return RecordOutcome::Malformed(metrics::values::MALFORMED);
    }
    match rx.await {
        Ok(IntakeVerdict::Accepted) => RecordOutcome::Accepted,
        Ok(IntakeVerdict::Duplicate) => RecordOutcome::Duplicate,
        Ok(IntakeVerdict::OutOfWindow) => RecordOutcome::Malformed(metrics::values::WRONG_SLOT),
        Err(_) => RecordOutcome::Malformed(metrics::values::MALFORMED),
    }
}

/// Accept a batch of peer score records. 202 when anything was accepted,
/// otherwise 401 for authentication failures, 409 when the batch was all
/// duplicates, 400 for the rest.
async fn scores_handler(
    State(state): State<ExchangeServerState>,
    Json(body): Json<ScoresBody>,
) -> (StatusCode, Json<ScoresReply>) {
    let mut reply = ScoresReply::default();
    let mut auth_failures = 0usize;

    for record in &body.records {
        match evaluate_record(&state, record).await {
            RecordOutcome::Accepted => reply.accepted += 1,
            RecordOutcome::Duplicate => {
                metrics::PEER_RECORDS_REJECTED_TOTAL
                    .with_label_values(&[metrics::values::DUPLICATE])
                    .inc();
                reply.duplicates += 1;
            }
            RecordOutcome::AuthFailure(reason) => {
                metrics::PEER_RECORDS_REJECTED_TOTAL
                    .with_label_values(&[reason])
                    .inc();
                auth_failures += 1;
                reply.rejected += 1;
            }
            RecordOutcome::Malformed(reason) => {
                metrics::PEER_RECORDS_REJECTED_TOTAL
                    .with_label_values(&[reason])
                    .inc();
                reply.rejected += 1;
            }
        }
    }

    let status = if reply.accepted > 0 {
        StatusCode::ACCEPTED
    } else if auth_failures > 0 {
        StatusCode::UNAUTHORIZED
    } else if reply.duplicates > 0 {
        StatusCode::CONFLICT
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(reply))
}

/// Router serving the peer exchange surface of a validator node.
pub fn exchange_router(state: ExchangeServerState) -> Router {
    Router::new()
        .route("/scores", post(scores_handler))
        .with_state(state)
}

/// Helper for the slot driver: default per-slot record bound.
pub fn default_record_bound(peers: usize, miners: usize) -> usize {
    peers.saturating_mul(miners).saturating_mul(2).max(1)
}

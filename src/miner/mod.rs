// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Miner daemon: serves the task endpoint, solves the subnet task with the
//! registered capability and signs every response with the miner key.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::dispatch::{response_digest, task_digest, TaskRequest, TaskResponse};
use crate::key::{recover_address, Signer};
use crate::metagraph::MetagraphCache;
use crate::scoring::SubnetCapability;
use crate::types::SubnetId;

#[derive(Clone)]
pub struct MinerServerState {
    pub signer: Arc<Signer>,
    pub capability: SubnetCapability,
    pub subnet: SubnetId,
    pub metagraph: Arc<MetagraphCache>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn reject(status: StatusCode, error: &'static str) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::to_value(ErrorBody { error }).expect("static body")),
    )
}

/// Accept a signed task, verify the requesting validator against the
/// registry, solve and respond.
async fn task_handler(
    State(state): State<MinerServerState>,
    Json(request): Json<TaskRequest>,
) -> Result<Json<TaskResponse>, (StatusCode, Json<serde_json::Value>)> {
    if request.subnet_id != state.subnet {
        return Err(reject(StatusCode::BAD_REQUEST, "unsupported_subnet"));
    }

    let Some(snapshot) = state.metagraph.snapshot() else {
        return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "not_synced"));
    };
    let Some(validator) = snapshot.validator_by_uid(&request.validator_uid) else {
        return Err(reject(StatusCode::UNAUTHORIZED, "unknown_validator"));
    };
    if !validator.is_active() {
        return Err(reject(StatusCode::UNAUTHORIZED, "unknown_validator"));
    }

    let digest = task_digest(
        request.slot,
        request.subnet_id,
        &request.validator_uid,
        &request.task_id,
        &request.payload,
        request.nonce,
    );
    match recover_address(digest, &request.signature) {
        Ok(address) if address == validator.owner => {}
        _ => return Err(reject(StatusCode::UNAUTHORIZED, "bad_signature")),
    }

    let result = (state.capability.solve)(&request.payload);
    let signature = state
        .signer
        .sign_digest(response_digest(&request.task_id, &result))
        .map_err(|_| reject(StatusCode::INTERNAL_SERVER_ERROR, "signing_failed"))?;

    log::debug!(
        "solved task {} for validator {} in slot {}",
        request.task_id,
        request.validator_uid,
        request.slot
    );
    Ok(Json(TaskResponse {
        task_id: request.task_id,
        result,
        signature,
    }))
}

pub fn miner_router(state: MinerServerState) -> Router {
    Router::new()
        .route("/task", post(task_handler))
        .with_state(state)
}

/// Keep the miner's registry view fresh so validator authentication does not
/// go stale.
pub async fn refresh_loop(metagraph: Arc<MetagraphCache>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let _ = metagraph.refresh(0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::scoring::{digest_chain_capability, Grade};
    use crate::test_utils::{uid, validator_with_signer};
    use serde_json::Value;
    use uuid::Uuid;

    async fn setup() -> (MinerServerState, Signer, crate::types::Uid) {
        let (validator, validator_signer) = validator_with_signer(3, 600_000);
        let validator_uid = validator.uid;

        let chain = Arc::new(MockChain::new());
        chain.set_validators(vec![validator]);
        let metagraph = Arc::new(MetagraphCache::new(
            chain,
            7,
            ethereum_types::H160::zero(),
            3,
        ));
        metagraph.refresh(1).await;

        let state = MinerServerState {
            signer: Arc::new(Signer::random()),
            capability: digest_chain_capability(),
            subnet: 7,
            metagraph,
        };
        (state, validator_signer, validator_uid)
    }

    fn signed_request(
        signer: &Signer,
        validator_uid: crate::types::Uid,
        subnet: SubnetId,
        payload: Value,
    ) -> TaskRequest {
        let task_id = Uuid::new_v4();
        let nonce = 42;
        let digest = task_digest(5, subnet, &validator_uid, &task_id, &payload, nonce);
        TaskRequest {
            slot: 5,
            subnet_id: subnet,
            validator_uid,
            task_id,
            payload,
            nonce,
            signature: signer.sign_digest(digest).unwrap(),
        }
    }

    #[tokio::test]
    async fn solves_and_signs_valid_task() {
        let (state, validator_signer, validator_uid) = setup().await;
        let capability = digest_chain_capability();
        let payload = (capability.prepare)(5, &validator_uid);
        let request = signed_request(&validator_signer, validator_uid, 7, payload.clone());

        let miner_address = state.signer.address();
        let response = task_handler(State(state), Json(request.clone()))
            .await
            .expect("task must be accepted");

        // The response grades to full credit and carries a valid miner
        // signature.
        assert_eq!(response.0.task_id, request.task_id);
        assert_eq!(
            (capability.grade)(&payload, &response.0.result),
            Grade::Valid(1.0)
        );
        let digest = response_digest(&response.0.task_id, &response.0.result);
        assert_eq!(
            recover_address(digest, &response.0.signature).unwrap(),
            miner_address
        );
    }

    #[tokio::test]
    async fn rejects_wrong_subnet() {
        let (state, validator_signer, validator_uid) = setup().await;
        let request = signed_request(&validator_signer, validator_uid, 8, serde_json::json!({}));
        let err = task_handler(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_unknown_validator() {
        let (state, _signer, _uid) = setup().await;
        let stranger = Signer::random();
        let request = signed_request(&stranger, uid(42), 7, serde_json::json!({}));
        let err = task_handler(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_forged_signature() {
        let (state, _signer, validator_uid) = setup().await;
        let stranger = Signer::random();
        let request = signed_request(&stranger, validator_uid, 7, serde_json::json!({}));
        let err = task_handler(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_tampered_payload() {
        let (state, validator_signer, validator_uid) = setup().await;
        let mut request =
            signed_request(&validator_signer, validator_uid, 7, serde_json::json!({"a": 1}));
        request.payload = serde_json::json!({"a": 2});
        let err = task_handler(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Miner selection and task dispatch. Selection draws a scored subset of the
//! active miners each slot; dispatch fans the signed task payload out over
//! HTTP and collects responses until the phase deadline.

mod select;

pub use select::{select_miners, selection_weight, SelectionCandidate};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use ethereum_types::{H160, H256};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::key::{keccak256, recover_address, RecoverableSignature, Signer};
use crate::metrics;
use crate::scoring::SubnetCapability;
use crate::types::{MinerEntry, SlotNumber, SubnetId, Uid};

/// Error codes a miner may return with a final (non-retryable) meaning.
/// Unknown codes are treated as transient per the endpoint contract.
const FINAL_ERROR_CODES: &[&str] = &[
    "bad_signature",
    "unknown_validator",
    "malformed",
    "unsupported_subnet",
];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("miner rejected task: {0}")]
    Rejected(String),
    #[error("malformed miner response: {0}")]
    Malformed(String),
    #[error("response signature does not match the miner key")]
    BadSignature,
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Timeout | DispatchError::Transport(_) => true,
            DispatchError::Rejected(code) => !FINAL_ERROR_CODES.contains(&code.as_str()),
            DispatchError::Malformed(_) | DispatchError::BadSignature => false,
        }
    }
}

/// Signed task payload sent to a miner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub slot: SlotNumber,
    pub subnet_id: SubnetId,
    pub validator_uid: Uid,
    pub task_id: Uuid,
    pub payload: Value,
    pub nonce: u64,
    pub signature: RecoverableSignature,
}

/// Miner response; `signature` covers the task id and result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub result: Value,
    pub signature: RecoverableSignature,
}

/// Digest the validator signs over a task request. `serde_json` with its
/// ordered map representation gives both sides the same payload bytes.
pub fn task_digest(
    slot: SlotNumber,
    subnet_id: SubnetId,
    validator_uid: &Uid,
    task_id: &Uuid,
    payload: &Value,
    nonce: u64,
) -> H256 {
    let payload_bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut preimage = Vec::with_capacity(32 * 4);
    preimage.extend_from_slice(&slot.to_be_bytes());
    preimage.extend_from_slice(&subnet_id.to_be_bytes());
    preimage.extend_from_slice(validator_uid.as_bytes());
    preimage.extend_from_slice(task_id.as_bytes());
    preimage.extend_from_slice(keccak256(&payload_bytes).as_bytes());
    preimage.extend_from_slice(&nonce.to_be_bytes());
    keccak256(&preimage)
}

/// Digest the miner signs over its response.
pub fn response_digest(task_id: &Uuid, result: &Value) -> H256 {
    let result_bytes = serde_json::to_vec(result).unwrap_or_default();
    let mut preimage = Vec::with_capacity(48);
    preimage.extend_from_slice(task_id.as_bytes());
    preimage.extend_from_slice(keccak256(&result_bytes).as_bytes());
    keccak256(&preimage)
}

/// Terminal outcome of one task assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchFailure {
    Timeout,
    Transport,
    Rejected,
    BadSignature,
    NoEndpoint,
}

/// Slot-scoped assignment record. Owned by the slot pipeline and discarded
/// after commit.
#[derive(Clone, Debug)]
pub struct TaskAssignment {
    pub slot: SlotNumber,
    pub miner: Uid,
    pub miner_address: H160,
    pub task_id: Uuid,
    pub payload: Value,
    pub payload_hash: H256,
    pub dispatched_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub result: Option<Value>,
    pub failure: Option<DispatchFailure>,
}

/// Transport used to reach miner endpoints; HTTP in production, in-memory in
/// tests.
#[async_trait]
pub trait TaskClient: Send + Sync {
    async fn send_task(
        &self,
        endpoint: &Url,
        request: &TaskRequest,
        timeout: Duration,
    ) -> Result<TaskResponse, DispatchError>;
}

pub struct HttpTaskClient {
    http: reqwest::Client,
}

impl HttpTaskClient {
    pub fn new() -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[async_trait]
impl TaskClient for HttpTaskClient {
    async fn send_task(
        &self,
        endpoint: &Url,
        request: &TaskRequest,
        timeout: Duration,
    ) -> Result<TaskResponse, DispatchError> {
        let url = endpoint
            .join("task")
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let code = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(DispatchError::Rejected(code));
        }
        response
            .json::<TaskResponse>()
            .await
            .map_err(|e| DispatchError::Malformed(e.to_string()))
    }
}

pub struct TaskDispatcher {
    client: Arc<dyn TaskClient>,
    signer: Arc<Signer>,
    capability: SubnetCapability,
    subnet: SubnetId,
    self_uid: Uid,
    retries: u32,
}

impl TaskDispatcher {
    pub fn new(
        client: Arc<dyn TaskClient>,
        signer: Arc<Signer>,
        capability: SubnetCapability,
        subnet: SubnetId,
        self_uid: Uid,
        retries: u32,
    ) -> Self {
        Self {
            client,
            signer,
            capability,
            subnet,
            self_uid,
            retries,
        }
    }

    fn build_request(&self, slot: SlotNumber, payload: Value) -> TaskRequest {
        let task_id = Uuid::new_v4();
        let nonce: u64 = rand::random();
        let digest = task_digest(slot, self.subnet, &self.self_uid, &task_id, &payload, nonce);
        let signature = self
            .signer
            .sign_digest(digest)
            .expect("signing with a loaded key must succeed");
        TaskRequest {
            slot,
            subnet_id: self.subnet,
            validator_uid: self.self_uid,
            task_id,
            payload,
            nonce,
            signature,
        }
    }

    /// Dispatch the slot's task to every selected miner concurrently and
    /// collect responses. Assignments without a usable response carry a
    /// failure marker; the caller records those as score 0.
    pub async fn dispatch_slot(
        &self,
        slot: SlotNumber,
        deadline: DateTime<Utc>,
        targets: &[MinerEntry],
        task_timeout: Duration,
    ) -> Vec<TaskAssignment> {
        let payload = (self.capability.prepare)(slot, &self.self_uid);

        let mut jobs = FuturesUnordered::new();
        for miner in targets {
            let request = self.build_request(slot, payload.clone());
            jobs.push(self.send_one(slot, miner.clone(), request, deadline, task_timeout));
        }

        let mut assignments = Vec::with_capacity(targets.len());
        while let Some(assignment) = jobs.next().await {
            assignments.push(assignment);
        }
        // Deterministic ordering for downstream consumers.
        assignments.sort_by(|a, b| a.miner.cmp(&b.miner));
        assignments
    }

    async fn send_one(
        &self,
        slot: SlotNumber,
        miner: MinerEntry,
        request: TaskRequest,
        deadline: DateTime<Utc>,
        task_timeout: Duration,
    ) -> TaskAssignment {
        let payload_hash = keccak256(serde_json::to_vec(&request.payload).unwrap_or_default());
        let mut assignment = TaskAssignment {
            slot,
            miner: miner.uid,
            miner_address: miner.owner,
            task_id: request.task_id,
            payload: request.payload.clone(),
            payload_hash,
            dispatched_at: Utc::now(),
            deadline,
            result: None,
            failure: None,
        };

        let Some(endpoint) = miner.api_endpoint.clone() else {
            assignment.failure = Some(DispatchFailure::NoEndpoint);
            return assignment;
        };

        // Cap the per-attempt timeout by the time left in the phase.
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        let timeout = task_timeout.min(remaining);
        if timeout.is_zero() {
            assignment.failure = Some(DispatchFailure::Timeout);
            return assignment;
        }

        metrics::TASKS_DISPATCHED_TOTAL.inc();
        let send = || async { self.client.send_task(&endpoint, &request, timeout).await };
        let outcome = send
            .retry(
                ExponentialBuilder::default()
                    .with_max_times(self.retries as usize)
                    .with_max_delay(timeout / 4),
            )
            .when(DispatchError::is_transient)
            .await;

        match outcome {
            Ok(response) => {
                if response.task_id != request.task_id {
                    metrics::TASK_FAILURE_TOTAL
                        .with_label_values(&[metrics::values::INVALID_RESULT])
                        .inc();
                    assignment.failure = Some(DispatchFailure::Rejected);
                    return assignment;
                }
                let digest = response_digest(&response.task_id, &response.result);
                match recover_address(digest, &response.signature) {
                    Ok(address) if address == miner.owner => {
                        assignment.result = Some(response.result);
                    }
                    _ => {
                        metrics::TASK_FAILURE_TOTAL
                            .with_label_values(&[metrics::values::BAD_SIGNATURE])
                            .inc();
                        assignment.failure = Some(DispatchFailure::BadSignature);
                    }
                }
            }
            Err(e) => {
                let (failure, label) = match e {
                    DispatchError::Timeout => (DispatchFailure::Timeout, metrics::values::TIMEOUT),
                    DispatchError::Transport(_) => {
                        (DispatchFailure::Transport, metrics::values::TRANSPORT)
                    }
                    _ => (DispatchFailure::Rejected, metrics::values::REJECTED),
                };
                log::debug!("task for miner {} failed in slot {slot}: {e}", miner.uid);
                metrics::TASK_FAILURE_TOTAL.with_label_values(&[label]).inc();
                assignment.failure = Some(failure);
            }
        }
        assignment
    }
}

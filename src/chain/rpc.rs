// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::{H160, H256};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::tx::{sign_legacy_tx, LegacyTx};
use super::{abi, ChainClient, Error, ScoreBatch, SubmitFailure, SubnetParams, TxReceipt};
use crate::key::Signer;
use crate::types::{MinerEntry, SubnetId, ValidatorEntry};

/// JSON-RPC client against the chain node. Registry reads use the node's
/// `tensor_*` façade over the contract getters; the batch update goes out as
/// a raw signed transaction.
pub struct EthRpcClient {
    http: reqwest::Client,
    url: Url,
    contract: H160,
    chain_id: u64,
    gas_limit: u64,
    signer: Arc<Signer>,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockHead {
    timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptJson {
    transaction_hash: H256,
    block_number: String,
    status: String,
}

fn parse_hex_u64(raw: &str) -> Result<u64, Error> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| Error::Decode(format!("bad hex quantity {raw:?}: {e}")))
}

impl EthRpcClient {
    pub fn new(
        url: Url,
        contract: H160,
        chain_id: u64,
        gas_limit: u64,
        request_timeout: Duration,
        signer: Arc<Signer>,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            url,
            contract,
            chain_id,
            gas_limit,
            signer,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call_value(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let response: RpcResponse = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, Error> {
        let value = self.call_value(method, params).await?;
        serde_json::from_value(value).map_err(|e| Error::Decode(format!("{method}: {e}")))
    }

    /// JSON-RPC returns `result: null` for missing receipts and
    /// transactions; map that to `None` instead of a decode error.
    async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, Error> {
        let value = self.call_value(method, params).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Decode(format!("{method}: {e}")))
    }
}

#[async_trait]
impl ChainClient for EthRpcClient {
    async fn subnet_params(&self, subnet: SubnetId) -> Result<SubnetParams, Error> {
        self.call("tensor_getSubnet", json!([subnet])).await
    }

    async fn subnet_miners(&self, subnet: SubnetId) -> Result<Vec<MinerEntry>, Error> {
        self.call("tensor_getSubnetMiners", json!([subnet])).await
    }

    async fn subnet_validators(&self, subnet: SubnetId) -> Result<Vec<ValidatorEntry>, Error> {
        self.call("tensor_getSubnetValidators", json!([subnet]))
            .await
    }

    async fn chain_head_timestamp(&self) -> Result<u64, Error> {
        let head: BlockHead = self
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        parse_hex_u64(&head.timestamp)
    }

    async fn submit_score_batch(&self, batch: &ScoreBatch) -> Result<H256, SubmitFailure> {
        // Failures before the transaction is signed carry no hash; once the
        // raw bytes exist the locally computed hash always does.
        let pre = |error: Error| SubmitFailure {
            tx_hash: None,
            error,
        };

        let address = format!("{:?}", self.signer.address());
        let nonce_hex: String = self
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await
            .map_err(pre)?;
        let gas_price_hex: String = self.call("eth_gasPrice", json!([])).await.map_err(pre)?;

        let tx = LegacyTx {
            nonce: parse_hex_u64(&nonce_hex).map_err(pre)?,
            gas_price: parse_hex_u64(&gas_price_hex).map_err(pre)? as u128,
            gas_limit: self.gas_limit,
            to: self.contract,
            value: 0,
            data: abi::encode_update_scores(batch),
        };
        let (raw, hash) = sign_legacy_tx(&self.signer, self.chain_id, &tx).map_err(pre)?;

        let sent: H256 = self
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await
            .map_err(|error| SubmitFailure {
                tx_hash: Some(hash),
                error,
            })?;
        if sent != hash {
            log::debug!("node reported tx hash {sent:?}, locally computed {hash:?}");
        }
        Ok(sent)
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, Error> {
        let receipt: Option<ReceiptJson> = self
            .call_optional("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        receipt
            .map(|r| {
                Ok(TxReceipt {
                    transaction_hash: r.transaction_hash,
                    block_number: parse_hex_u64(&r.block_number)?,
                    success: parse_hex_u64(&r.status)? == 1,
                })
            })
            .transpose()
    }

    async fn transaction_exists(&self, tx_hash: H256) -> Result<bool, Error> {
        let tx: Option<serde_json::Value> = self
            .call_optional("eth_getTransactionByHash", json!([tx_hash]))
            .await?;
        Ok(tx.is_some())
    }
}

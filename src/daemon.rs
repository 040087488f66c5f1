// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Process wiring: builds every component from the configuration and runs
//! the long-lived services in a `JoinSet` until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use url::Url;

use crate::chain::{ChainClient, EthRpcClient};
use crate::committer::{ChainCommitter, CommitterConfig};
use crate::config::Config;
use crate::consensus::{ConsensusEngine, EngineConfig};
use crate::db::ParityDb;
use crate::dispatch::{HttpTaskClient, TaskDispatcher};
use crate::exchange::{
    exchange_router, run_intake, ExchangeServerState, HttpPeerSender, ScoreIndex,
};
use crate::health::StatusHandle;
use crate::key::Signer;
use crate::metagraph::{MetagraphCache, RefreshOutcome};
use crate::metrics;
use crate::miner::{miner_router, refresh_loop, MinerServerState};
use crate::scheduler::SlotClock;
use crate::scoring::capability_for;
use crate::state::StateStore;
use crate::types::SubnetId;
use crate::validator::ValidatorNode;

/// Structural startup failures, mapped onto exit codes by `main`.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("chain connectivity failure: {0}")]
    Chain(String),
    #[error("clock drift beyond tolerance: {0}")]
    ClockDrift(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

const STARTUP_CHAIN_ATTEMPTS: u32 = 5;

fn build_signer(config: &Config) -> Result<Arc<Signer>, NodeError> {
    let key_path = config
        .client
        .key_file
        .clone()
        .unwrap_or_else(|| config.client.data_dir.join("keyfile"));
    let signer = Signer::load_or_generate(&key_path)
        .map_err(|e| NodeError::Config(format!("cannot load key file: {e}")))?;
    log::info!("node address: {:?}", signer.address());
    Ok(Arc::new(signer))
}

fn build_chain(config: &Config, signer: Arc<Signer>) -> Result<Arc<EthRpcClient>, NodeError> {
    EthRpcClient::new(
        config.chain.rpc_url.clone(),
        config.chain.registry_contract,
        config.chain.chain_id,
        config.chain.gas_limit,
        Duration::from_secs(config.chain.request_timeout_s),
        signer,
    )
    .map(Arc::new)
    .map_err(|e| NodeError::Chain(e.to_string()))
}

/// Probe the chain head with a few retries; a node that cannot see the chain
/// at startup exits rather than spinning.
async fn probe_chain(chain: &dyn ChainClient) -> Result<u64, NodeError> {
    let mut last_error = String::new();
    for attempt in 0..STARTUP_CHAIN_ATTEMPTS {
        match chain.chain_head_timestamp().await {
            Ok(ts) => return Ok(ts),
            Err(e) => {
                last_error = e.to_string();
                log::warn!("chain probe {attempt} failed: {e}");
                tokio::time::sleep(Duration::from_secs(1 << attempt.min(4))).await;
            }
        }
    }
    Err(NodeError::Chain(last_error))
}

// returns the first error with which any of the services end
async fn propagate_error(services: &mut JoinSet<anyhow::Result<()>>) -> anyhow::Error {
    while let Some(joined) = services.join_next().await {
        match joined {
            Ok(Err(error)) => return error,
            Err(e) if e.is_panic() => return anyhow::anyhow!("service panicked: {e}"),
            _ => {}
        }
    }
    anyhow::anyhow!("all services ended unexpectedly")
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        log::info!("received interrupt, shutting down");
        let _ = tx.send(true);
    }
}

/// Start the validator daemon and run until interrupted.
pub async fn run_validator(config: Config, subnet: SubnetId) -> Result<(), NodeError> {
    log::info!(
        "starting validator daemon, version {} (subnet {subnet})",
        env!("CARGO_PKG_VERSION")
    );
    let signer = build_signer(&config)?;
    let chain = build_chain(&config, signer.clone())?;

    let clock = Arc::new(
        SlotClock::new(config.chain.genesis_time, &config.consensus)
            .map_err(|e| NodeError::Config(e.to_string()))?,
    );
    let head_timestamp = probe_chain(chain.as_ref()).await?;
    clock
        .verify_drift(head_timestamp, chrono::Utc::now())
        .map_err(|e| NodeError::ClockDrift(e.to_string()))?;

    let db = ParityDb::open(&config.client.data_dir.join("db"))
        .map_err(|e| NodeError::Config(format!("cannot open database: {e}")))?;
    let state = Arc::new(StateStore::new(db, config.consensus.history_length));

    let metagraph = Arc::new(MetagraphCache::new(
        chain.clone(),
        subnet,
        signer.address(),
        config.consensus.max_stale_slots,
    ));
    // The registry must know this validator before the loop can run.
    if metagraph.refresh(0).await != RefreshOutcome::Fresh {
        return Err(NodeError::Chain("initial metagraph refresh failed".into()));
    }
    let self_validator = metagraph.self_validator().ok_or_else(|| {
        NodeError::Config(format!(
            "address {:?} is not a registered validator on subnet {subnet}",
            signer.address()
        ))
    })?;

    let capability = capability_for(subnet);
    let index = ScoreIndex::new();
    let status = StatusHandle::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut services: JoinSet<anyhow::Result<()>> = JoinSet::new();

    {
        let status = status.clone();
        let addr = config.client.metrics_address;
        services.spawn(async move {
            metrics::init_metrics_server(addr, status)
                .await
                .context("metrics server failed")
        });
    }

    let (intake_tx, intake_rx) = flume::bounded(1024);
    {
        let index = index.clone();
        services.spawn(async move {
            run_intake(index, intake_rx).await;
            Ok(())
        });
    }
    {
        let router = exchange_router(ExchangeServerState {
            metagraph: metagraph.clone(),
            intake: intake_tx,
        });
        let addr = config.client.listen_address;
        services.spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("cannot bind peer exchange listener")?;
            log::info!("peer exchange endpoint started at {addr}");
            axum::serve(listener, router)
                .await
                .context("peer exchange server failed")
        });
    }

    let dispatcher = TaskDispatcher::new(
        Arc::new(
            HttpTaskClient::new().map_err(|e| NodeError::Config(e.to_string()))?,
        ),
        signer.clone(),
        capability.clone(),
        subnet,
        self_validator.uid,
        config.consensus.task_retries,
    );
    let committer = ChainCommitter::new(
        chain,
        state.clone(),
        subnet,
        CommitterConfig {
            retries: config.consensus.commit_retries,
            ..Default::default()
        },
    );
    let engine = ConsensusEngine::new(EngineConfig {
        min_peer_reports: config.consensus.min_peer_reports,
        deviation_threshold: config.consensus.deviation_threshold,
        deviation_strikes: config.consensus.deviation_strikes,
        delta_trust: config.consensus.delta_trust,
        alpha_trust: config.consensus.alpha_trust,
        fraud_penalty: config.consensus.fraud_penalty,
    });

    let node = ValidatorNode {
        consensus_config: config.consensus.clone(),
        chain_max_batch: config.chain.max_batch_size,
        clock,
        metagraph,
        dispatcher,
        capability,
        index,
        peer_sender: Arc::new(
            HttpPeerSender::new().map_err(|e| NodeError::Config(e.to_string()))?,
        ),
        engine,
        committer,
        state,
        signer,
        status,
        self_uid: self_validator.uid,
        incomplete_slot: None,
    };
    {
        let shutdown_rx = shutdown_rx.clone();
        services.spawn(async move { node.run(shutdown_rx).await });
    }

    tokio::select! {
        _ = shutdown_signal(shutdown_tx) => {}
        err = propagate_error(&mut services) => {
            log::error!("services failure: {err}");
            services.shutdown().await;
            return Err(NodeError::Other(err));
        }
    }
    services.shutdown().await;
    Ok(())
}

/// Start the miner daemon and run until interrupted.
pub async fn run_miner(
    config: Config,
    subnet: SubnetId,
    endpoint: Url,
) -> Result<(), NodeError> {
    log::info!(
        "starting miner daemon, version {} (subnet {subnet}, public endpoint {endpoint})",
        env!("CARGO_PKG_VERSION")
    );
    let signer = build_signer(&config)?;
    let chain = build_chain(&config, signer.clone())?;
    probe_chain(chain.as_ref()).await?;

    let metagraph = Arc::new(MetagraphCache::new(
        chain,
        subnet,
        signer.address(),
        config.consensus.max_stale_slots,
    ));
    if metagraph.refresh(0).await != RefreshOutcome::Fresh {
        return Err(NodeError::Chain("initial metagraph refresh failed".into()));
    }

    let status = StatusHandle::default();
    status.set_state(crate::health::NodeState::Active);
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let mut services: JoinSet<anyhow::Result<()>> = JoinSet::new();

    {
        let status = status.clone();
        let addr = config.client.metrics_address;
        services.spawn(async move {
            metrics::init_metrics_server(addr, status)
                .await
                .context("metrics server failed")
        });
    }
    {
        let metagraph = metagraph.clone();
        let period = Duration::from_secs(config.consensus.slot_length_s);
        services.spawn(async move {
            refresh_loop(metagraph, period).await;
            Ok(())
        });
    }
    {
        let router = miner_router(MinerServerState {
            signer,
            capability: capability_for(subnet),
            subnet,
            metagraph,
        });
        let addr = config.client.listen_address;
        services.spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("cannot bind task listener")?;
            log::info!("task endpoint started at {addr}");
            axum::serve(listener, router)
                .await
                .context("task server failed")
        });
    }

    tokio::select! {
        _ = shutdown_signal(shutdown_tx) => {}
        err = propagate_error(&mut services) => {
            log::error!("services failure: {err}");
            services.shutdown().await;
            return Err(NodeError::Other(err));
        }
    }
    services.shutdown().await;
    Ok(())
}

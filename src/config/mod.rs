// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Node configuration. Loaded once at startup from a TOML file and treated as
//! a read-only snapshot afterwards; every component receives the pieces it
//! needs at construction.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ethereum_types::H160;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct LogValue {
    pub module: String,
    pub level: LevelFilter,
}

impl LogValue {
    pub fn new(module: &str, level: LevelFilter) -> Self {
        Self {
            module: module.to_string(),
            level,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct LogConfig {
    pub filters: Vec<LogValue>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filters: vec![
                LogValue::new("hyper", LevelFilter::Warn),
                LogValue::new("reqwest", LevelFilter::Warn),
                LogValue::new("axum", LevelFilter::Warn),
            ],
        }
    }
}

/// Local node options: paths, listen addresses, key material.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct ClientConfig {
    pub data_dir: PathBuf,
    /// Hex-encoded secp256k1 key file; generated on first run when absent.
    pub key_file: Option<PathBuf>,
    /// Address serving the peer score endpoint (validator) or the task
    /// endpoint (miner).
    pub listen_address: SocketAddr,
    pub metrics_address: SocketAddr,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("luxtensor-data"),
            key_file: None,
            listen_address: "0.0.0.0:9944".parse().expect("static socket addr"),
            metrics_address: "0.0.0.0:6116".parse().expect("static socket addr"),
        }
    }
}

/// Chain connectivity and commit options.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: Url,
    pub registry_contract: H160,
    pub chain_id: u64,
    /// Unix timestamp of slot 0.
    pub genesis_time: u64,
    pub gas_limit: u64,
    /// Per-call ceiling on batch entries before the committer chunks.
    pub max_batch_size: usize,
    pub request_timeout_s: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: Url::parse("http://127.0.0.1:8545").expect("static url"),
            registry_contract: H160::zero(),
            chain_id: 3109,
            genesis_time: 1_735_689_600, // 2025-01-01T00:00:00Z
            gas_limit: 6_000_000,
            max_batch_size: 64,
            request_timeout_s: 10,
        }
    }
}

/// Consensus-loop parameters. Field names follow the recognized option list
/// of the protocol description.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct ConsensusConfig {
    pub slot_length_s: u64,
    /// Fractions of the slot given to the task, scoring, exchange and commit
    /// phases. Must be positive and sum to 1.
    pub phase_fractions: [f64; 4],
    /// Per-request task timeout override; defaults to the phase-0 length
    /// minus a safety margin.
    pub task_timeout_s: Option<u64>,
    pub task_retries: u32,
    pub selection_k: usize,
    pub selection_beta: f64,
    pub selection_bmax: u64,
    pub peer_quorum_fraction: f64,
    pub min_peer_reports: usize,
    pub deviation_threshold: f64,
    pub deviation_strikes: u32,
    pub delta_trust: f64,
    pub alpha_trust: f64,
    pub history_length: usize,
    pub max_stale_slots: u64,
    pub commit_retries: u32,
    /// Defaults to `|peers| * |miners| * 2` when unset.
    pub max_peer_records_per_slot: Option<usize>,
    pub clock_drift_tolerance_s: u64,
    /// Governance-configured multiplier applied to the trust weight of a
    /// fraud-flagged reporter.
    pub fraud_penalty: f64,
    /// Outbound peer broadcast concurrency.
    pub peer_concurrency: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            slot_length_s: 600,
            phase_fractions: [0.4, 0.1, 0.25, 0.25],
            task_timeout_s: None,
            task_retries: 2,
            selection_k: 32,
            selection_beta: 0.1,
            selection_bmax: 16,
            peer_quorum_fraction: 2.0 / 3.0,
            min_peer_reports: 2,
            deviation_threshold: 0.5,
            deviation_strikes: 3,
            delta_trust: 0.1,
            alpha_trust: 0.1,
            history_length: 32,
            max_stale_slots: 3,
            commit_retries: 3,
            max_peer_records_per_slot: None,
            clock_drift_tolerance_s: 2,
            fraud_penalty: 0.5,
            peer_concurrency: 8,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub chain: ChainConfig,
    pub consensus: ConsensusConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let c = &self.consensus;
        if c.slot_length_s == 0 {
            return invalid("slot_length_s must be positive".into());
        }
        let sum: f64 = c.phase_fractions.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return invalid(format!("phase_fractions must sum to 1, got {sum}"));
        }
        if c.phase_fractions.iter().any(|f| *f <= 0.0) {
            return invalid("every phase fraction must be positive".into());
        }
        if c.selection_k == 0 {
            return invalid("selection_k must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&c.peer_quorum_fraction) || c.peer_quorum_fraction == 0.0 {
            return invalid("peer_quorum_fraction must be in (0, 1]".into());
        }
        if !(0.0..1.0).contains(&c.delta_trust) || c.delta_trust == 0.0 {
            return invalid("delta_trust must be in (0, 1)".into());
        }
        if !(0.0..1.0).contains(&c.alpha_trust) || c.alpha_trust == 0.0 {
            return invalid("alpha_trust must be in (0, 1)".into());
        }
        if c.history_length == 0 {
            return invalid("history_length must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&c.fraud_penalty) {
            return invalid("fraud_penalty must be in [0, 1]".into());
        }
        if c.peer_concurrency == 0 {
            return invalid("peer_concurrency must be at least 1".into());
        }
        if self.chain.max_batch_size == 0 {
            return invalid("chain.max_batch_size must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_phase_fractions() {
        let mut config = Config::default();
        config.consensus.phase_fractions = [0.5, 0.5, 0.5, 0.5];
        assert!(config.validate().is_err());

        config.consensus.phase_fractions = [1.0, 0.0, 0.0, 0.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let raw = toml::to_string(&config).expect("could not serialize the configuration");
        let back: Config = toml::from_str(&raw).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn all_params_under_section() {
        let config = Config::default();
        let serialized_config =
            toml::to_string(&config).expect("could not serialize the configuration");
        assert_eq!(
            serialized_config
                .trim_start()
                .chars()
                .next()
                .expect("configuration empty"),
            '['
        )
    }

    #[test]
    fn partial_file_fills_defaults() {
        let raw = r#"
            [consensus]
            slot_length_s = 60
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.consensus.slot_length_s, 60);
        assert_eq!(config.consensus.selection_k, 32);
    }
}

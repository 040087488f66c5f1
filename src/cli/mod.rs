// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Command line surface of the node binary.

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::config::{Config, ConfigError};
use crate::types::SubnetId;

/// Exit codes of the node process.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG_ERROR: i32 = 2;
    pub const CHAIN_UNREACHABLE: i32 = 3;
    pub const CLOCK_DRIFT: i32 = 4;
}

/// CLI structure generated when interacting with the node binary.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), author = env!("CARGO_PKG_AUTHORS"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(flatten)]
    pub opts: CliOpts,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Args, Clone)]
pub struct CliOpts {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl CliOpts {
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        Config::load(self.config.as_deref())
    }
}

#[derive(Subcommand, Clone)]
pub enum Command {
    /// Run the validator consensus loop on a subnet.
    RunValidator {
        #[arg(long)]
        subnet: SubnetId,
    },
    /// Run a miner serving the subnet task endpoint.
    RunMiner {
        #[arg(long)]
        subnet: SubnetId,
        /// Publicly reachable URL of this miner's task endpoint.
        #[arg(long)]
        endpoint: Url,
    },
    /// Print the effective configuration as TOML.
    Config,
}

/// Print an error message and exit with the given code.
pub fn cli_error_and_die(msg: impl AsRef<str>, code: i32) -> ! {
    log::error!("{}", msg.as_ref());
    eprintln!("Error: {}", msg.as_ref());
    process::exit(code);
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use clap::Parser;
use luxtensor::cli::{cli_error_and_die, exit_code, Cli, Command};
use luxtensor::daemon::{self, NodeError};
use luxtensor::logger;

fn main() {
    // Capture Cli inputs
    let Cli { opts, cmd } = Cli::parse();

    let config = match opts.to_config() {
        Ok(config) => config,
        Err(e) => cli_error_and_die(
            format!("Error parsing config. Error was: {e}"),
            exit_code::CONFIG_ERROR,
        ),
    };
    logger::setup_logger(&config.log);

    if let Command::Config = cmd {
        match toml::to_string(&config) {
            Ok(raw) => {
                print!("{raw}");
                return;
            }
            Err(e) => cli_error_and_die(
                format!("Error serializing config. Error was: {e}"),
                exit_code::CONFIG_ERROR,
            ),
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => cli_error_and_die(format!("Error starting runtime: {e}"), 1),
    };

    let result = match cmd {
        Command::RunValidator { subnet } => {
            runtime.block_on(daemon::run_validator(config, subnet))
        }
        Command::RunMiner { subnet, endpoint } => {
            runtime.block_on(daemon::run_miner(config, subnet, endpoint))
        }
        Command::Config => unreachable!("handled above"),
    };

    match result {
        Ok(()) => std::process::exit(exit_code::OK),
        Err(NodeError::Config(e)) => cli_error_and_die(e, exit_code::CONFIG_ERROR),
        Err(NodeError::Chain(e)) => cli_error_and_die(e, exit_code::CHAIN_UNREACHABLE),
        Err(NodeError::ClockDrift(e)) => cli_error_and_die(e, exit_code::CLOCK_DRIFT),
        Err(NodeError::Other(e)) => cli_error_and_die(format!("{e:#}"), 1),
    }
}

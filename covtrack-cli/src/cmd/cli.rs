// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::set_max_level;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use crate::{
    client::CovtrackClient,
    server::{self, ServerConfig},
};

use super::{check, upload};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
pub struct CommonOptions {
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the covtrack web server
    RunServer {
        /// Socket to bind for server
        #[arg(long, default_value = "127.0.0.1:1323")]
        bind_socket: SocketAddr,

        /// Database URL: `postgres://...`, `file://...`, or `:memory:`
        ///
        /// When unset, a SQLite database in the user's cache directory is used.
        #[arg(long, env = "COVTRACK_DATABASE_URL")]
        database_url: Option<String>,

        /// Key that clients must present in the `X-API-Key` header to use `/api/v1`
        #[arg(long, env = "COVTRACK_API_KEY", hide_env_values = true)]
        api_key: String,
    },

    /// Upload a coverage report to a covtrack server
    Upload(UploadOptions),

    /// Check a local coverage report against a minimum, and against the latest coverage of a base branch
    Check(CheckOptions),
}

#[derive(Args, Debug)]
pub struct RemoteOptions {
    /// Base URL of the covtrack server
    #[arg(long, env = "COVTRACK_URL")]
    pub url: Option<String>,

    /// API key for the covtrack server
    #[arg(long, env = "COVTRACK_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

impl RemoteOptions {
    pub fn client(&self) -> Result<CovtrackClient> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("--url (or COVTRACK_URL) is required"))?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("--api-key (or COVTRACK_API_KEY) is required"))?;
        Ok(CovtrackClient::new(url, api_key)?)
    }
}

#[derive(Args, Debug)]
pub struct UploadOptions {
    #[command(flatten)]
    pub remote: RemoteOptions,

    #[arg(long)]
    pub repo: String,

    #[arg(long)]
    pub project: String,

    /// Branch name, or a git ref such as `refs/heads/main`
    #[arg(long)]
    pub branch: String,

    /// Commit identifier; at least 8 characters, of which the first 8 are stored
    #[arg(long)]
    pub commit: String,

    /// Coverage report in `coverage.json` format
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct CheckOptions {
    #[command(flatten)]
    pub remote: RemoteOptions,

    #[arg(long)]
    pub repo: String,

    #[arg(long)]
    pub project: String,

    /// Coverage report in `coverage.json` format
    #[arg(long)]
    pub file: PathBuf,

    /// Minimum acceptable coverage percentage
    #[arg(long, value_parser = parse_percentage)]
    pub threshold: f64,

    /// Branch (or git ref) whose latest coverage the report is compared against
    #[arg(long)]
    pub base_branch: Option<String>,

    /// Largest acceptable decrease, in percentage points, relative to the base branch
    ///
    /// When unset, the change is reported but never fails the check.
    #[arg(long, value_parser = parse_percentage, requires = "base_branch")]
    pub diff_threshold: Option<f64>,
}

fn parse_percentage(value: &str) -> Result<f64, String> {
    let percentage: f64 = value
        .parse()
        .map_err(|e| format!("`{value}` is not a number: {e}"))?;
    if (0.0..=100.0).contains(&percentage) {
        Ok(percentage)
    } else {
        Err(String::from("must be between 0 and 100"))
    }
}

pub async fn run_cli() -> ExitCode {
    let cli = Cli::parse();
    let logger = TermLogger::new(
        cli.common.verbose.log_level_filter(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    if log::set_boxed_logger(logger).is_err() {
        return ExitCode::FAILURE;
    }
    set_max_level(cli.common.verbose.log_level_filter());

    match cli.command {
        Commands::RunServer {
            bind_socket,
            database_url,
            api_key,
        } => {
            server::cli(ServerConfig {
                bind_socket,
                database_url,
                api_key,
            })
            .await
        }
        Commands::Upload(options) => upload::cli(&options).await,
        Commands::Check(options) => check::cli(&options).await,
    }
}

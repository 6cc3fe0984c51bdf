//! pvbackup snapshot controller
#![deny(
    missing_docs,
    missing_debug_implementations,
    unreachable_pub,
    unused_import_braces,
    unused_qualifications,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(clippy::multiple_crate_versions)]

mod controller;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pvbackup_core::signal::Termination;
use pvbackup_core::{AppConfig, K8sClient};
use tracing::{error, info};

/// Command line interface for the snapshot controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the mounted `AppConfig` YAML blob
    config: PathBuf,
    /// Explicit kubeconfig path, used only when in-cluster discovery fails
    #[arg(long)]
    kubeconfig: Option<String>,
    /// Validate the configuration and exit without contacting the cluster
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.test {
        info!("configuration is valid, --test set, exiting");
        return ExitCode::SUCCESS;
    }

    let client = match K8sClient::try_new(config.namespace.clone(), cli.kubeconfig.as_deref()).await {
        Ok(client) => client,
        Err(err) => {
            error!("failed to build cluster client: {err}");
            return ExitCode::FAILURE;
        }
    };

    let termination = Termination::install();
    match controller::run(&client, &config, &termination).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(n) if termination.is_cancelled() => {
            info!("terminated by signal, {n} spec(s) outstanding");
            ExitCode::from(143)
        }
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!("run failed: {err}");
            ExitCode::FAILURE
        }
    }
}

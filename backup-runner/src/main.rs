//! pvbackup backup runner: single-volume repository transfer worker run
//! inside an ephemeral backup pod (§4.7).
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
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod cache;
mod heartbeat;
mod paths;
mod repo;
mod signal;
mod ssh;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use pvbackup_core::config::RunnerConfig;
use tracing::{error, info, warn};

use crate::repo::{CreateOutcome, RepoEnv};
use crate::signal::Termination;

/// Command line interface for the backup runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the mounted runner secret's YAML payload, defaults to
    /// where the backup controller mounts it
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(paths::DEFAULT_CONFIG_PATH));
    let config = match RunnerConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load runner configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let termination = Termination::install();
    run(&config, &termination).await
}

async fn run(config: &RunnerConfig, termination: &Termination) -> ExitCode {
    if let Err(err) = ssh::write_key(&config.ssh_key) {
        error!("failed to write ssh key: {err}");
        return ExitCode::FAILURE;
    }
    let env = RepoEnv {
        repo: config.repo.clone(),
        passphrase: config.passphrase.clone(),
        rsh: ssh::rsh_command(Path::new(paths::SSH_KEY_PATH)),
        cache_dir: config
            .cache_the_cache
            .then(|| paths::LOCAL_CACHE_PATH.to_owned()),
    };
    let archive_name = format!(
        "{}-{}",
        config.archive_prefix,
        Utc::now().format("%Y-%m-%d-%H-%M-%S")
    );

    if config.cache_the_cache {
        if let Err(err) = cache::cache_in().await {
            error!("cache-the-cache rsync-in failed, aborting: {err}");
            return ExitCode::FAILURE;
        }
    }

    match repo::with_lock_preflight(&env).await {
        Ok(state) => info!(?state, "repository lock pre-flight"),
        Err(err) => warn!("repository lock pre-flight error (continuing): {err}"),
    }

    let flags = if config.borg_flags.is_empty() {
        vec!["--stats".to_owned()]
    } else {
        config.borg_flags.clone()
    };

    let mut terminated = false;
    let mut failed = false;

    match repo::create_once(&env, &archive_name, &flags, paths::CLONE_MOUNT_PATH, termination).await {
        Ok(CreateOutcome::Success) => {
            info!(archive = %archive_name, "archive created");
            if has_any_retention(config) {
                if let Err(err) = repo::prune(&env, &config.archive_prefix, &config.retention).await {
                    warn!("retention pruning failed: {err}");
                }
            }
        }
        Ok(CreateOutcome::NeedsInit(detail)) => {
            info!("repository uninitialized ({detail}), running borg init");
            match repo::init_repo(&env).await {
                Ok(()) => match repo::create_once(&env, &archive_name, &flags, paths::CLONE_MOUNT_PATH, termination).await {
                    Ok(CreateOutcome::Success) => {
                        info!(archive = %archive_name, "archive created after init");
                        if has_any_retention(config) {
                            if let Err(err) = repo::prune(&env, &config.archive_prefix, &config.retention).await {
                                warn!("retention pruning failed: {err}");
                            }
                        }
                    }
                    Ok(CreateOutcome::Terminated) => terminated = true,
                    Ok(outcome) => {
                        error!("archive create failed after init retry: {outcome:?}");
                        failed = true;
                    }
                    Err(err) => {
                        error!("archive create failed after init retry: {err}");
                        failed = true;
                    }
                },
                Err(err) => {
                    error!("borg init failed: {err}");
                    failed = true;
                }
            }
        }
        Ok(CreateOutcome::Terminated) => terminated = true,
        Ok(CreateOutcome::Failed(msg)) => {
            error!("archive create failed: {msg}");
            failed = true;
        }
        Err(err) => {
            error!("archive create failed: {err}");
            failed = true;
        }
    }

    if terminated {
        if let Err(err) = repo::break_lock(&env).await {
            warn!("break-lock after termination failed: {err}");
        }
    }

    if config.cache_the_cache {
        let cache_out = if terminated {
            cache::cache_out_verbose().await
        } else {
            cache::cache_out_normal().await
        };
        if let Err(err) = cache_out {
            error!("cache-the-cache rsync-out failed: {err}");
            failed = true;
        }
    }

    if terminated {
        ExitCode::from(143)
    } else if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn has_any_retention(config: &RunnerConfig) -> bool {
    let r = &config.retention;
    r.hourly > 0 || r.daily > 0 || r.weekly > 0 || r.monthly > 0
}

//! Repository tool invocation (§4.7, §6 "Repository tool contract").
//!
//! `borg` is treated as an opaque subprocess with a known exit-code
//! contract and SIGINT-to-checkpoint semantics. The child's pid is held
//! onto so a termination signal can be forwarded to it specifically,
//! rather than just tearing down the runner's own process tree.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pvbackup_core::config::Retention;
use pvbackup_core::error::{Error, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::heartbeat;
use crate::signal::Termination;

/// How long to wait for a checkpoint after forwarding SIGINT before SIGKILLing
const CHECKPOINT_GRACE: Duration = Duration::from_secs(10);
/// Bound on the pre-flight `with-lock` probe itself
const WITH_LOCK_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment the repository tool runs under
#[derive(Debug, Clone)]
pub struct RepoEnv {
    /// Repository endpoint, passed to `borg` verbatim
    pub repo: String,
    /// Repository passphrase
    pub passphrase: String,
    /// `BORG_RSH` value
    pub rsh: String,
    /// `BORG_CACHE_DIR` override, set only when cache-the-cache is enabled
    pub cache_dir: Option<String>,
}

impl RepoEnv {
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("borg");
        cmd.args(args);
        cmd.env("BORG_PASSPHRASE", &self.passphrase);
        cmd.env("BORG_RSH", &self.rsh);
        cmd.env("BORG_RELOCATED_REPO_ACCESS_IS_OK", "yes");
        if let Some(dir) = &self.cache_dir {
            cmd.env("BORG_CACHE_DIR", dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

/// Lock state observed by the pre-flight `with-lock` probe (§4.7 step 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The lock was acquired and released immediately
    Unlocked,
    /// Another writer currently holds the lock
    Locked,
    /// The probe itself did not return within its own bound
    Timeout,
    /// Any other non-zero exit
    Error,
}

/// Probe the repository lock with `--lock-wait 0`. Never aborts the run
/// (§4.7 step 2: "log the state ...; do not abort").
pub async fn with_lock_preflight(env: &RepoEnv) -> Result<LockState> {
    let mut cmd = env.command(&["with-lock", "--lock-wait", "0", &env.repo, "/bin/true"]);
    let child = cmd
        .spawn()
        .map_err(|e| Error::Repo(format!("failed to spawn with-lock: {e}")))?;

    match timeout(WITH_LOCK_PROBE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(LockState::Unlocked),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if output.status.code() == Some(2) && stderr.contains("Failed to create/acquire the lock") {
                Ok(LockState::Locked)
            } else {
                warn!("with-lock probe: {stderr}");
                Ok(LockState::Error)
            }
        }
        Ok(Err(err)) => Err(Error::Repo(format!("with-lock probe failed: {err}"))),
        Err(_) => Ok(LockState::Timeout),
    }
}

/// Outcome of a single archive-create attempt
#[derive(Debug)]
pub enum CreateOutcome {
    /// The archive was created
    Success,
    /// The repository is not initialized; caller should `init` and retry once
    NeedsInit(String),
    /// Any other definitive failure
    Failed(String),
    /// A termination signal arrived mid-create; the child has already been
    /// signalled/waited/killed by the time this is returned
    Terminated,
}

/// Run `borg create`, capturing the child's pid so a termination signal can
/// be forwarded to it specifically. Streams stdout to the log prefixed by
/// `archive_name` and runs a 60s heartbeat for as long as the child runs.
pub async fn create_once(
    env: &RepoEnv,
    archive_name: &str,
    flags: &[String],
    source_path: &str,
    termination: &Termination,
) -> Result<CreateOutcome> {
    let target = format!("{}::{archive_name}", env.repo);
    let mut args: Vec<&str> = vec!["create"];
    args.extend(flags.iter().map(String::as_str));
    args.push(&target);
    args.push(source_path);

    let mut cmd = env.command(&args);
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Repo(format!("failed to spawn borg create: {e}")))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Repo("borg create: missing stdout handle".to_owned()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Repo("borg create: missing stderr handle".to_owned()))?;

    let stdout_task = tokio::spawn(stream_stdout(stdout, archive_name.to_owned()));
    let stderr_task = tokio::spawn(collect_lines(stderr));
    let heartbeat_task = pid.map(|pid| tokio::spawn(heartbeat::run(pid)));

    let outcome = tokio::select! {
        status = child.wait() => {
            let stderr_text = stderr_task.await.unwrap_or_default();
            stdout_task.abort();
            match status {
                Ok(status) => classify(status.code(), &stderr_text),
                Err(err) => CreateOutcome::Failed(format!("borg create wait failed: {err}")),
            }
        }
        () = termination.cancelled() => {
            stdout_task.abort();
            stderr_task.abort();
            terminate_child(pid, &mut child).await;
            CreateOutcome::Terminated
        }
    };

    if let Some(task) = heartbeat_task {
        task.abort();
    }

    Ok(outcome)
}

fn classify(code: Option<i32>, stderr: &str) -> CreateOutcome {
    match code {
        Some(0) => CreateOutcome::Success,
        Some(2) if stderr.contains("is not a valid repository") => {
            CreateOutcome::NeedsInit(stderr.to_owned())
        }
        Some(2) if stderr.contains("Failed to create/acquire the lock") => {
            CreateOutcome::Failed(format!("repository lock unresolvable: {stderr}"))
        }
        Some(code) => CreateOutcome::Failed(format!("borg create exited {code}: {stderr}")),
        None => CreateOutcome::Failed(format!("borg create terminated by signal: {stderr}")),
    }
}

/// Forward SIGINT to the repository child so it writes a checkpoint, wait
/// up to [`CHECKPOINT_GRACE`], then SIGKILL (§4.7 "Signal handling").
async fn terminate_child(pid: Option<u32>, child: &mut Child) {
    let Some(pid) = pid else {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return;
    };
    let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
    if let Err(err) = kill(nix_pid, Signal::SIGINT) {
        warn!(pid, "failed to forward SIGINT to borg child: {err}");
    }
    if timeout(CHECKPOINT_GRACE, child.wait()).await.is_err() {
        warn!(pid, "borg child did not exit within {CHECKPOINT_GRACE:?} of SIGINT, sending SIGKILL");
        if let Err(err) = kill(nix_pid, Signal::SIGKILL) {
            warn!(pid, "failed to SIGKILL borg child: {err}");
        }
        let _ = child.wait().await;
    }
}

/// Clear the repository's lease after a SIGKILL so the next run isn't
/// blocked by a stale lock (§4.7 "Signal handling").
pub async fn break_lock(env: &RepoEnv) -> Result<()> {
    let repo = env.repo.clone();
    let mut cmd = env.command(&["break-lock", &repo]);
    let status = cmd
        .status()
        .await
        .map_err(|e| Error::Repo(format!("failed to spawn break-lock: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Repo(format!("borg break-lock exited {:?}", status.code())))
    }
}

/// Initialize a fresh repository (§4.7 step 3: retried exactly once after a
/// `create` fails with "not a valid repository")
pub async fn init_repo(env: &RepoEnv) -> Result<()> {
    let repo = env.repo.clone();
    let mut cmd = env.command(&["init", "--encryption", "repokey-blake2", &repo]);
    let output = cmd
        .output()
        .await
        .map_err(|e| Error::Repo(format!("failed to spawn borg init: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Repo(format!(
            "borg init exited {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// Build the argv for a prune invocation. A pure function so the "no
/// invocation omits `--glob-archives`" property (§8) is unit-testable
/// without spawning a process.
#[must_use]
pub fn prune_args(repo: &str, prefix: &str, retention: &Retention) -> Vec<String> {
    let mut args = vec!["prune".to_owned(), format!("--glob-archives={prefix}-*")];
    if retention.hourly > 0 {
        args.push("--keep-hourly".to_owned());
        args.push(retention.hourly.to_string());
    }
    if retention.daily > 0 {
        args.push("--keep-daily".to_owned());
        args.push(retention.daily.to_string());
    }
    if retention.weekly > 0 {
        args.push("--keep-weekly".to_owned());
        args.push(retention.weekly.to_string());
    }
    if retention.monthly > 0 {
        args.push("--keep-monthly".to_owned());
        args.push(retention.monthly.to_string());
    }
    args.push(repo.to_owned());
    args
}

/// Prune the archive prefix's expired archives (§4.7 step 4)
pub async fn prune(env: &RepoEnv, prefix: &str, retention: &Retention) -> Result<()> {
    let args = prune_args(&env.repo, prefix, retention);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut cmd = env.command(&arg_refs);
    let output = cmd
        .output()
        .await
        .map_err(|e| Error::Repo(format!("failed to spawn borg prune: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Repo(format!(
            "borg prune exited {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

async fn stream_stdout(stdout: ChildStdout, archive_name: String) -> String {
    let mut lines = BufReader::new(stdout).lines();
    let mut collected = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!("[{archive_name}] {line}");
                collected.push_str(&line);
                collected.push('\n');
            }
            Ok(None) | Err(_) => break,
        }
    }
    collected
}

async fn collect_lines(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                collected.push_str(&line);
                collected.push('\n');
            }
            Ok(None) | Err(_) => break,
        }
    }
    collected
}

#[cfg(test)]
mod test {
    use super::*;

    fn retention(hourly: u32, daily: u32, weekly: u32, monthly: u32) -> Retention {
        Retention {
            hourly,
            daily,
            weekly,
            monthly,
        }
    }

    #[test]
    fn prune_args_always_carries_glob_archives() {
        let args = prune_args("repo::", "app-data", &Retention::default());
        assert!(args.contains(&"--glob-archives=app-data-*".to_owned()));
    }

    #[test]
    fn prune_args_omits_zero_tiers() {
        let args = prune_args("repo::", "app-data", &retention(24, 0, 0, 6));
        assert!(args.contains(&"--keep-hourly".to_owned()));
        assert!(args.contains(&"24".to_owned()));
        assert!(args.contains(&"--keep-monthly".to_owned()));
        assert!(args.contains(&"6".to_owned()));
        assert!(!args.contains(&"--keep-daily".to_owned()));
        assert!(!args.contains(&"--keep-weekly".to_owned()));
    }

    #[test]
    fn classify_distinguishes_needs_init_from_lock_failure() {
        assert!(matches!(classify(Some(0), ""), CreateOutcome::Success));
        assert!(matches!(
            classify(Some(2), "Repository repo::x is not a valid repository."),
            CreateOutcome::NeedsInit(_)
        ));
        assert!(matches!(
            classify(Some(2), "Failed to create/acquire the lock"),
            CreateOutcome::Failed(_)
        ));
        assert!(matches!(classify(Some(1), "boom"), CreateOutcome::Failed(_)));
        assert!(matches!(classify(None, "signalled"), CreateOutcome::Failed(_)));
    }
}

//! Cache-the-cache acceleration (§4.6 "Cache-the-cache acceleration", §4.7
//! steps 1/5): rsyncs the repository cache between the shared cache PVC and
//! a pod-local ephemeral path so chunk-index lookups during the transfer
//! don't hit the network-backed volume on every access.

use pvbackup_core::error::{Error, Result};
use tokio::process::Command;

use crate::paths::{CACHE_MOUNT_PATH, LOCAL_CACHE_PATH};

async fn run_rsync(args: &[&str]) -> Result<()> {
    tokio::fs::create_dir_all(LOCAL_CACHE_PATH)
        .await
        .map_err(Error::Load)?;
    let output = Command::new("rsync")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Repo(format!("failed to spawn rsync: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Repo(format!(
            "rsync exited {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// Pull the shared cache into the pod-local path before the transfer starts.
/// A failure here aborts the backup (§4.6: "Rsync failures at startup abort
/// the backup").
pub async fn cache_in() -> Result<()> {
    let src = format!("{CACHE_MOUNT_PATH}/");
    let dst = format!("{LOCAL_CACHE_PATH}/");
    run_rsync(&["-a", &src, &dst]).await
}

/// Push the pod-local cache back to the shared PVC on a normal exit, with
/// summary stats.
pub async fn cache_out_normal() -> Result<()> {
    let src = format!("{LOCAL_CACHE_PATH}/");
    let dst = format!("{CACHE_MOUNT_PATH}/");
    run_rsync(&["-a", "--stats", &src, &dst]).await
}

/// Push the pod-local cache back to the shared PVC ahead of a
/// signal-driven exit, in verbose mode (§4.7: "on SIGTERM, rsyncs back in
/// verbose mode before exiting").
pub async fn cache_out_verbose() -> Result<()> {
    let src = format!("{LOCAL_CACHE_PATH}/");
    let dst = format!("{CACHE_MOUNT_PATH}/");
    run_rsync(&["-a", "-v", &src, &dst]).await
}

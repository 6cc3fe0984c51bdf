//! Hook executor: sequential or parallel pod-exec of command lists (§4.3).

use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::config::Hook;
use crate::error::{Error, Result};

/// Result of one hook invocation
#[derive(Debug, Clone)]
pub struct HookResult {
    /// Hook that produced this result
    pub pod: String,
    /// Process exit code, when the exec completed
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

/// Runs a list of hooks against pods reachable through `pods`
pub struct HookExecutor {
    pods: Api<Pod>,
}

impl HookExecutor {
    /// Build an executor scoped to `pods`
    #[must_use]
    pub fn new(pods: Api<Pod>) -> Self {
        Self { pods }
    }

    /// Run `hooks` in order, honoring each hook's own `parallel` flag only
    /// with respect to its immediate siblings: a run of consecutive hooks
    /// all marked `parallel` executes concurrently, then the run joins
    /// before the next non-parallel hook starts. The first non-zero exit
    /// aborts the remaining sequence.
    pub async fn run(&self, hooks: &[Hook]) -> Result<Vec<HookResult>> {
        let mut results = Vec::with_capacity(hooks.len());
        let mut index = 0;
        while index < hooks.len() {
            if hooks[index].parallel {
                let mut batch_end = index;
                while batch_end < hooks.len() && hooks[batch_end].parallel {
                    batch_end += 1;
                }
                let batch_results = try_join_all(
                    hooks[index..batch_end]
                        .iter()
                        .map(|hook| self.run_one(hook)),
                )
                .await?;
                for result in batch_results {
                    check_exit(&result)?;
                    results.push(result);
                }
                index = batch_end;
            } else {
                let result = self.run_one(&hooks[index]).await?;
                check_exit(&result)?;
                results.push(result);
                index += 1;
            }
        }
        Ok(results)
    }

    async fn run_one(&self, hook: &Hook) -> Result<HookResult> {
        info!(pod = %hook.pod, command = ?hook.command, "running hook");

        let params = AttachParams {
            container: hook.container.clone(),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..AttachParams::default()
        };

        let mut attached = self
            .pods
            .exec(&hook.pod, hook.command.clone(), &params)
            .await
            .map_err(|err| {
                Error::Hook(format!("failed to exec in pod {}: {err}", hook.pod))
            })?;

        let mut stdout = String::new();
        if let Some(mut stream) = attached.stdout() {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.map_err(|err| {
                Error::Hook(format!("failed to read stdout from pod {}: {err}", hook.pod))
            })?;
            stdout = String::from_utf8_lossy(&buf).into_owned();
        }

        let mut stderr = String::new();
        if let Some(mut stream) = attached.stderr() {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.map_err(|err| {
                Error::Hook(format!("failed to read stderr from pod {}: {err}", hook.pod))
            })?;
            stderr = String::from_utf8_lossy(&buf).into_owned();
        }

        let exit_code = match attached.take_status() {
            Some(status_future) => match status_future.await {
                Some(status) if status.status.as_deref() == Some("Success") => 0,
                Some(status) => status
                    .details
                    .as_ref()
                    .and_then(|d| d.causes.as_ref())
                    .and_then(|causes| causes.first())
                    .and_then(|cause| cause.message.as_ref())
                    .and_then(|message| message.parse().ok())
                    .unwrap_or(1),
                None => 1,
            },
            None => 0,
        };

        Ok(HookResult {
            pod: hook.pod.clone(),
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn check_exit(result: &HookResult) -> Result<()> {
    if result.exit_code != 0 {
        return Err(Error::Hook(format!(
            "hook in pod {} exited {}: {}",
            result.pod, result.exit_code, result.stderr
        )));
    }
    Ok(())
}

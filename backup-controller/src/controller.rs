//! Per-run orchestration for the backup controller (§4.6), the densest
//! component: two-phase clone provisioning followed by a strictly
//! sequential repository-transfer loop, with guaranteed cleanup.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use pvbackup_core::config::{AppConfig, BackupConfig, BackupSpec};
use pvbackup_core::error::Result;
use pvbackup_core::hooks::HookExecutor;
use pvbackup_core::monitor::{PodMonitor, TerminalPhase};
use pvbackup_core::signal::Termination;
use pvbackup_core::tracked::{ResourceId, ResourceKind, TrackedResources};
use pvbackup_core::K8sClient;
use tracing::{error, info, warn};

use crate::{clone, runner_pod, secret};

/// Outcome of one backup spec, printed in the final status table
struct SpecResult {
    name: String,
    outcome: Outcome,
}

enum Outcome {
    Succeeded,
    NoReadySnapshot,
    CloneFailed(String),
    RunnerFailed(String),
    Terminated,
}

/// Validate the backup configuration is present, check every clone storage
/// class exists, then run the two-phase provision-and-backup loop. Returns
/// the process exit code: the count of failed specs, capped at 1.
pub async fn run(client: &K8sClient, config: &AppConfig, termination: &Termination) -> Result<i32> {
    let Some(backup) = &config.backup else {
        error!("no backup section in configuration");
        return Ok(1);
    };

    for spec in &backup.specs {
        if !client.storage_class_exists(&spec.clone_storage_class).await? {
            error!(
                storage_class = %spec.clone_storage_class,
                spec = %spec.name,
                "clone storage class does not exist"
            );
            return Ok(1);
        }
    }

    let tracked = TrackedResources::new();
    let hooks = HookExecutor::new(client.pods());

    // Phase 1: parallel clone provisioning, no wait.
    let clone_requests = join_all(backup.specs.iter().map(|spec| {
        provision_clone(client, config, spec, &tracked)
    }))
    .await;

    // Phase 2: strictly sequential per-spec loop.
    let mut results = Vec::with_capacity(backup.specs.len());
    for (spec, clone_request) in backup.specs.iter().zip(clone_requests) {
        if termination.is_cancelled() {
            results.push(SpecResult {
                name: spec.name.clone(),
                outcome: Outcome::Terminated,
            });
            continue;
        }

        if !spec.pre_hooks.is_empty() {
            if let Err(err) = hooks.run(&spec.pre_hooks).await {
                warn!(spec = %spec.name, "pre-hooks failed: {err}");
            }
        }

        let outcome = match clone_request {
            Ok(Some(request)) => {
                run_spec(client, config, backup, spec, &request, &tracked, termination).await
            }
            Ok(None) => Outcome::NoReadySnapshot,
            Err(err) => Outcome::CloneFailed(err.to_string()),
        };

        if !spec.post_hooks.is_empty() {
            if let Err(err) = hooks.run(&spec.post_hooks).await {
                warn!(spec = %spec.name, "post-hooks failed: {err}");
            }
        }

        results.push(SpecResult {
            name: spec.name.clone(),
            outcome,
        });
    }

    // Whatever remains tracked (aborted mid-run, or a teardown step failed) is drained here.
    tracked
        .drain(|id| {
            let client = client.clone();
            async move { drain_one(&client, id).await }
        })
        .await;

    print_summary(&results);
    let failed = results
        .iter()
        .filter(|r| !matches!(r.outcome, Outcome::Succeeded))
        .count();
    Ok(i32::from(failed > 0).min(1))
}

async fn provision_clone(
    client: &K8sClient,
    config: &AppConfig,
    spec: &BackupSpec,
    tracked: &TrackedResources,
) -> Result<Option<clone::CloneRequest>> {
    let Some(snapshot) = clone::newest_ready_snapshot(client, &spec.pvc).await? else {
        return Ok(None);
    };
    let epoch_ms = Utc::now().timestamp_millis();
    let clone_pvc_name = clone::clone_pvc_name(&config.release_name, &spec.name, epoch_ms);
    tracked
        .register(ResourceId::new(
            ResourceKind::Pvc,
            client.namespace(),
            clone_pvc_name.clone(),
        ))
        .await;
    let request = clone::request_clone(client, &config.release_name, spec, &snapshot, epoch_ms).await?;
    Ok(Some(request))
}

async fn run_spec(
    client: &K8sClient,
    config: &AppConfig,
    backup: &BackupConfig,
    spec: &BackupSpec,
    request: &clone::CloneRequest,
    tracked: &TrackedResources,
    termination: &Termination,
) -> Outcome {
    let clone_deadline = Duration::from_secs(spec.clone_bind_timeout_seconds);
    if let Err(err) =
        clone::wait_for_clone_ready(client, spec, &request.clone_pvc_name, clone_deadline, termination).await
    {
        return Outcome::CloneFailed(err.to_string());
    }
    if let Err(err) = clone::wait_for_volume_ready(client, spec).await {
        return Outcome::CloneFailed(err.to_string());
    }

    let epoch_ms = Utc::now().timestamp_millis();
    let pod_name = runner_pod::runner_pod_name(&config.release_name, &spec.name, epoch_ms);
    let secret_name = secret::secret_name(&pod_name);

    tracked
        .register(ResourceId::new(ResourceKind::Secret, client.namespace(), secret_name.clone()))
        .await;
    if let Err(err) = secret::create_runner_secret(client, &config.app_name, backup, spec, &pod_name).await {
        return Outcome::RunnerFailed(err.to_string());
    }

    tracked
        .register(ResourceId::new(ResourceKind::Pod, client.namespace(), pod_name.clone()))
        .await;
    if let Err(err) = runner_pod::spawn_runner_pod(client, backup, spec, &request.clone_pvc_name, &secret_name, &pod_name).await {
        return Outcome::RunnerFailed(err.to_string());
    }

    let monitor = PodMonitor::new(client.pods(), client.events(), pod_name.clone());
    let phase = monitor.watch_until_terminal(termination.cancelled()).await;

    let outcome = match phase {
        Ok(TerminalPhase::Succeeded) => Outcome::Succeeded,
        Ok(TerminalPhase::Failed) => {
            let exit_code = runner_pod::container_exit_code(client, &pod_name).await.ok().flatten();
            Outcome::RunnerFailed(format!("runner pod exited with code {exit_code:?}"))
        }
        Err(err) => Outcome::RunnerFailed(err.to_string()),
    };

    // Tear down clone PVC, runner pod, and secret in that order (§4.6 step 7).
    if clone::delete_clone(client, &request.clone_pvc_name).await.is_ok() {
        tracked
            .deregister(&ResourceId::new(ResourceKind::Pvc, client.namespace(), request.clone_pvc_name.clone()))
            .await;
    }
    if runner_pod::delete_runner_pod(client, &pod_name).await.is_ok() {
        tracked
            .deregister(&ResourceId::new(ResourceKind::Pod, client.namespace(), pod_name.clone()))
            .await;
    }
    if secret::delete_runner_secret(client, &secret_name).await.is_ok() {
        tracked
            .deregister(&ResourceId::new(ResourceKind::Secret, client.namespace(), secret_name.clone()))
            .await;
    }

    info!(spec = %spec.name, pod = %pod_name, "backup attempt complete");
    outcome
}

async fn drain_one(client: &K8sClient, id: ResourceId) -> Result<()> {
    match id.kind {
        ResourceKind::Pod => runner_pod::delete_runner_pod(client, &id.name).await,
        ResourceKind::Pvc => clone::delete_clone(client, &id.name).await,
        ResourceKind::Secret => secret::delete_runner_secret(client, &id.name).await,
    }
}

fn print_summary(results: &[SpecResult]) {
    for result in results {
        let status = match &result.outcome {
            Outcome::Succeeded => "succeeded".to_owned(),
            Outcome::NoReadySnapshot => "failed: no ready snapshot".to_owned(),
            Outcome::CloneFailed(msg) | Outcome::RunnerFailed(msg) => format!("failed: {msg}"),
            Outcome::Terminated => "terminated".to_owned(),
        };
        info!("{:<32} {}", result.name, status);
    }
    let succeeded = results.iter().filter(|r| matches!(r.outcome, Outcome::Succeeded)).count();
    let failed = results.len() - succeeded;
    info!("summary: {succeeded} succeeded, {failed} failed");
}

//! Per-run orchestration for the snapshot controller (§4.5).

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use kube::api::PostParams;
use pvbackup_core::error::{Error, Result};
use pvbackup_core::hooks::HookExecutor;
use pvbackup_core::k8s::{new_volume_snapshot, VolumeSnapshot};
use pvbackup_core::retention::{select_keep, RetentionItem};
use pvbackup_core::signal::Termination;
use pvbackup_core::config::SnapshotSpec;
use pvbackup_core::{AppConfig, K8sClient};
use tracing::{info, warn};

/// Initial and maximum delay between readiness polls
const READY_POLL_INITIAL: Duration = Duration::from_secs(2);
const READY_POLL_MAX: Duration = Duration::from_secs(15);

/// Outcome of creating and waiting on one spec's snapshot
struct SpecOutcome {
    snapshot_name: String,
    ready: bool,
    error: Option<String>,
}

/// Run every configured snapshot spec to completion and return the process
/// exit code: 0 if every snapshot became ready, 1 otherwise.
pub async fn run(client: &K8sClient, config: &AppConfig, termination: &Termination) -> Result<i32> {
    let hooks = HookExecutor::new(client.pods());

    for spec in &config.snapshot {
        if !spec.pre_hooks.is_empty() {
            info!(pvc = %spec.pvc, "running pre-hooks");
            hooks.run(&spec.pre_hooks).await?;
        }
    }

    let tasks = config
        .snapshot
        .iter()
        .map(|spec| create_and_wait(client, config, spec, termination));
    let outcomes = join_all(tasks).await;

    for spec in &config.snapshot {
        if !spec.post_hooks.is_empty() {
            info!(pvc = %spec.pvc, "running post-hooks");
            if let Err(err) = hooks.run(&spec.post_hooks).await {
                warn!(pvc = %spec.pvc, "post-hooks failed: {err}");
            }
        }
    }

    for (spec, outcome) in config.snapshot.iter().zip(&outcomes) {
        if let Err(err) = prune(client, spec).await {
            warn!(pvc = %spec.pvc, "retention pruning failed: {err}");
        }
        match &outcome.error {
            Some(err) => warn!(pvc = %spec.pvc, "snapshot {} failed: {err}", outcome.snapshot_name),
            None => info!(pvc = %spec.pvc, "snapshot {} ready", outcome.snapshot_name),
        }
    }

    let failed = outcomes.iter().filter(|o| !o.ready).count();
    info!(succeeded = outcomes.len() - failed, failed, "run complete");
    Ok(i32::from(failed > 0))
}

async fn create_and_wait(
    client: &K8sClient,
    config: &AppConfig,
    spec: &SnapshotSpec,
    termination: &Termination,
) -> SpecOutcome {
    let name = format!("{}-{}", spec.pvc, Utc::now().format("%Y-%m-%d-%H-%M-%S"));
    match create_and_wait_inner(client, config, spec, &name, termination).await {
        Ok(ready) => SpecOutcome {
            snapshot_name: name,
            ready,
            error: None,
        },
        Err(err) => SpecOutcome {
            snapshot_name: name,
            ready: false,
            error: Some(err.to_string()),
        },
    }
}

async fn create_and_wait_inner(
    client: &K8sClient,
    config: &AppConfig,
    spec: &SnapshotSpec,
    name: &str,
    termination: &Termination,
) -> Result<bool> {
    let snapshots = client.volume_snapshots();
    let object = new_volume_snapshot(
        name,
        &config.namespace,
        &config.release_name,
        &spec.pvc,
        &spec.snapshot_class,
    );

    match snapshots.create(&PostParams::default(), &object).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(err) => return Err(Error::Kube(err)),
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(spec.ready_timeout_seconds);
    let mut delay = READY_POLL_INITIAL;
    loop {
        let object = snapshots.get(name).await?;
        if let Some(snapshot) = VolumeSnapshot::from_dynamic(&object) {
            if snapshot.is_ready() {
                return Ok(true);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!("snapshot {name} to become ready")));
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = termination.cancelled() => {
                return Err(Error::Timeout(format!("cancelled waiting for snapshot {name}")));
            }
        }
        delay = (delay * 2).min(READY_POLL_MAX);
    }
}

async fn prune(client: &K8sClient, spec: &SnapshotSpec) -> Result<()> {
    use kube::api::{DeleteParams, ListParams};
    use pvbackup_core::k8s::LABEL_SOURCE_PVC;

    let snapshots = client.volume_snapshots();
    let list = snapshots
        .list(&ListParams::default().labels(&format!("{LABEL_SOURCE_PVC}={}", spec.pvc)))
        .await?;

    let items: Vec<RetentionItem> = list
        .items
        .iter()
        .filter_map(VolumeSnapshot::from_dynamic)
        .filter(VolumeSnapshot::is_ready)
        .map(|s| RetentionItem::new(s.name, s.creation_timestamp))
        .collect();

    let keep = select_keep(&items, &spec.retention);
    for item in &items {
        if keep.contains(&item.id) {
            continue;
        }
        info!(snapshot = %item.id, "pruning expired snapshot");
        match snapshots.delete(&item.id, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(err) => warn!(snapshot = %item.id, "failed to delete: {err}"),
        }
    }

    Ok(())
}

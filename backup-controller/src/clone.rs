//! Clone-volume provisioning (§4.6 Phase 1 and Phase 2 step 1).

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, TypedLocalObjectReference};
use kube::api::{ListParams, PostParams};
use pvbackup_core::config::BackupSpec;
use pvbackup_core::error::{Error, Result};
use pvbackup_core::k8s::{VolumeSnapshot, LABEL_SOURCE_PVC};
use pvbackup_core::signal::Termination;
use pvbackup_core::K8sClient;
use tracing::{info, warn};

/// Interval between event scans while waiting for a clone PVC to bind
const EVENT_SCAN_INTERVAL: Duration = Duration::from_secs(10);
/// Substrings in a PVC event message that indicate the provisioning attempt has failed
const FAILURE_KEYWORDS: &[&str] = &["ProvisioningFailed", "not found", "failed", "cannot", "unable"];
/// Clone-PVC label values longer than this are rejected by the API server (422)
const MAX_LABEL_VALUE_LEN: usize = 63;

/// A clone PVC requested for one backup spec
#[derive(Debug, Clone)]
pub struct CloneRequest {
    /// Owning backup spec name
    pub backup_name: String,
    /// Clone PVC name
    pub clone_pvc_name: String,
    /// Source snapshot this clone was created from
    pub snapshot_name: String,
}

/// Clone PVC name: `{releaseName}-clone-{backupName}-{epochMs}`
#[must_use]
pub fn clone_pvc_name(release_name: &str, backup_name: &str, epoch_ms: i64) -> String {
    format!("{release_name}-clone-{backup_name}-{epoch_ms}")
}

fn truncate_label(value: &str) -> String {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value.to_owned()
    } else {
        value.chars().take(MAX_LABEL_VALUE_LEN).collect()
    }
}

/// Find the newest ready snapshot whose source PVC matches `pvc`
pub async fn newest_ready_snapshot(client: &K8sClient, pvc: &str) -> Result<Option<VolumeSnapshot>> {
    let list = client
        .volume_snapshots()
        .list(&ListParams::default().labels(&format!("{LABEL_SOURCE_PVC}={pvc}")))
        .await?;

    let mut ready: Vec<VolumeSnapshot> = list
        .items
        .iter()
        .filter_map(VolumeSnapshot::from_dynamic)
        .filter(VolumeSnapshot::is_ready)
        .collect();
    ready.sort_by(|a, b| b.creation_timestamp.cmp(&a.creation_timestamp));
    Ok(ready.into_iter().next())
}

/// Submit the clone PVC create for `spec`, sized from the source PVC's
/// current capacity (or the snapshot's reported restore size, if larger).
/// Does not wait for binding.
pub async fn request_clone(
    client: &K8sClient,
    release_name: &str,
    spec: &BackupSpec,
    snapshot: &VolumeSnapshot,
    epoch_ms: i64,
) -> Result<CloneRequest> {
    let clone_pvc_name = clone_pvc_name(release_name, &spec.name, epoch_ms);

    let storage = source_pvc_storage(client, &spec.pvc)
        .await?
        .or(snapshot.status.and_then(|s| s.restore_size))
        .map_or_else(|| "1Gi".to_owned(), |bytes| format!("{bytes}"));

    let mut requests = BTreeMap::new();
    let _ = requests.insert("storage".to_owned(), Quantity(storage));

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(clone_pvc_name.clone()),
            namespace: Some(client.namespace().to_owned()),
            labels: Some(
                [
                    ("pvbackup.datenlord.io/backup".to_owned(), truncate_label(&spec.name)),
                    (LABEL_SOURCE_PVC.to_owned(), truncate_label(&spec.pvc)),
                ]
                .into_iter()
                .collect(),
            ),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
            storage_class_name: Some(spec.clone_storage_class.clone()),
            data_source: Some(TypedLocalObjectReference {
                api_group: Some("snapshot.storage.k8s.io".to_owned()),
                kind: "VolumeSnapshot".to_owned(),
                name: snapshot.name.clone(),
            }),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..ResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    };

    match client.pvcs().create(&PostParams::default(), &pvc).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 409 => {}
        Err(err) => return Err(Error::Kube(err)),
    }

    Ok(CloneRequest {
        backup_name: spec.name.clone(),
        clone_pvc_name,
        snapshot_name: snapshot.name.clone(),
    })
}

async fn source_pvc_storage(client: &K8sClient, pvc_name: &str) -> Result<Option<String>> {
    match client.pvcs().get(pvc_name).await {
        Ok(pvc) => Ok(pvc
            .spec
            .and_then(|s| s.resources)
            .and_then(|r| r.requests)
            .and_then(|mut r| r.remove("storage"))
            .map(|Quantity(q)| q)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(err) => Err(Error::Kube(err)),
    }
}

/// Wait for `clone_pvc_name` to become usable: either `Bound` (immediate
/// binding storage classes) or a `WaitForFirstConsumer` event (deferred
/// binding), whichever the storage class's binding mode implies. Every
/// `EVENT_SCAN_INTERVAL` the PVC's events are scanned for failure
/// keywords, which fail fast instead of waiting out the full deadline.
pub async fn wait_for_clone_ready(
    client: &K8sClient,
    spec: &BackupSpec,
    clone_pvc_name: &str,
    deadline: Duration,
    termination: &Termination,
) -> Result<()> {
    let wait_for_first_consumer = matches!(
        client
            .storage_classes()
            .get(&spec.clone_storage_class)
            .await
            .map_err(Error::Kube)?
            .volume_binding_mode
            .as_deref(),
        Some("WaitForFirstConsumer")
    );

    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        if let Some(phase) = pvc_phase(client, clone_pvc_name).await? {
            if phase == "Bound" {
                return Ok(());
            }
        }

        if wait_for_first_consumer && has_event_reason(client, clone_pvc_name, "WaitForFirstConsumer").await? {
            return Ok(());
        }

        if let Some(message) = scan_failure_events(client, clone_pvc_name).await? {
            return Err(Error::Config(format!(
                "clone pvc {clone_pvc_name} failed to provision: {message}"
            )));
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!("clone pvc {clone_pvc_name} to become ready")));
        }

        tokio::select! {
            () = tokio::time::sleep(EVENT_SCAN_INTERVAL) => {}
            () = termination.cancelled() => {
                return Err(Error::Timeout(format!("cancelled waiting for clone pvc {clone_pvc_name}")));
            }
        }
    }
}

/// Apply the fixed CSI workload grace delay when the clone's storage class
/// provisioner is one the caller has declared requires it; otherwise a
/// no-op. There is no generic, driver-independent way to poll an arbitrary
/// CSI volume CR, so the declared driver list in configuration stands in
/// for that detection.
pub async fn wait_for_volume_ready(client: &K8sClient, spec: &BackupSpec) -> Result<()> {
    const CSI_WORKLOAD_GRACE: Duration = Duration::from_secs(15);

    if spec.csi_volume_ready_drivers.is_empty() {
        return Ok(());
    }
    let provisioner = client
        .storage_classes()
        .get(&spec.clone_storage_class)
        .await
        .map_err(Error::Kube)?
        .provisioner;
    if spec.csi_volume_ready_drivers.contains(&provisioner) {
        info!(driver = %provisioner, "waiting for CSI workload grace delay");
        tokio::time::sleep(CSI_WORKLOAD_GRACE).await;
    }
    Ok(())
}

async fn pvc_phase(client: &K8sClient, name: &str) -> Result<Option<String>> {
    match client.pvcs().get(name).await {
        Ok(pvc) => Ok(pvc.status.and_then(|s| s.phase)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(err) => Err(Error::Kube(err)),
    }
}

async fn has_event_reason(client: &K8sClient, pvc_name: &str, reason: &str) -> Result<bool> {
    let events = list_pvc_events(client, pvc_name).await?;
    Ok(events.iter().any(|e| e.reason.as_deref() == Some(reason)))
}

async fn scan_failure_events(client: &K8sClient, pvc_name: &str) -> Result<Option<String>> {
    let events = list_pvc_events(client, pvc_name).await?;
    for event in &events {
        let message = event.message.clone().unwrap_or_default();
        if FAILURE_KEYWORDS.iter().any(|kw| message.contains(kw)) {
            return Ok(Some(message));
        }
    }
    Ok(None)
}

async fn list_pvc_events(
    client: &K8sClient,
    pvc_name: &str,
) -> Result<Vec<k8s_openapi::api::core::v1::Event>> {
    let list = client
        .events()
        .list(&ListParams::default().fields(&format!("involvedObject.name={pvc_name}")))
        .await?;
    Ok(list.items)
}

/// Best-effort delete of a clone PVC; a 404 is success
pub async fn delete_clone(client: &K8sClient, clone_pvc_name: &str) -> Result<()> {
    match client
        .pvcs()
        .delete(clone_pvc_name, &kube::api::DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(err) => {
            warn!(pvc = %clone_pvc_name, "failed to delete clone pvc: {err}");
            Err(Error::Kube(err))
        }
    }
}

//! Runner pod construction and lifecycle (§4.6 Phase 2 step 4).

use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
    PersistentVolumeClaimVolumeSource, SecretVolumeSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use pvbackup_core::config::{BackupConfig, BackupSpec};
use pvbackup_core::error::{Error, Result};
use pvbackup_core::K8sClient;
use tracing::warn;

/// Path the clone PVC is mounted at inside the runner container
pub const CLONE_MOUNT_PATH: &str = "/data";
/// Path the cache PVC is mounted at inside the runner container
pub const CACHE_MOUNT_PATH: &str = "/cache";
/// Path the ephemeral secret is mounted at inside the runner container
pub const SECRET_MOUNT_PATH: &str = "/etc/pvbackup-runner";

/// Runner pod name: `{releaseName}-backup-runner-{backupName}-{epochMs}`
#[must_use]
pub fn runner_pod_name(release_name: &str, backup_name: &str, epoch_ms: i64) -> String {
    format!("{release_name}-backup-runner-{backup_name}-{epoch_ms}")
}

/// Build and create the runner pod for one backup attempt
pub async fn spawn_runner_pod(
    client: &K8sClient,
    backup: &BackupConfig,
    spec: &BackupSpec,
    clone_pvc_name: &str,
    secret_name: &str,
    pod_name: &str,
) -> Result<()> {
    let container = Container {
        name: "runner".to_owned(),
        image: Some(backup.pod_image.clone()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "clone".to_owned(),
                mount_path: CLONE_MOUNT_PATH.to_owned(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "cache".to_owned(),
                mount_path: CACHE_MOUNT_PATH.to_owned(),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: "config".to_owned(),
                mount_path: SECRET_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(backup.privileged),
            ..SecurityContext::default()
        }),
        ..Container::default()
    };

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_owned()),
            namespace: Some(client.namespace().to_owned()),
            labels: Some(
                [("pvbackup.datenlord.io/backup".to_owned(), spec.name.clone())]
                    .into_iter()
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_owned()),
            active_deadline_seconds: Some(i64::try_from(spec.timeout_seconds).unwrap_or(i64::MAX)),
            volumes: Some(vec![
                Volume {
                    name: "clone".to_owned(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: clone_pvc_name.to_owned(),
                        read_only: Some(true),
                    }),
                    ..Volume::default()
                },
                Volume {
                    name: "cache".to_owned(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: backup.cache.pvc_name.clone(),
                        read_only: Some(false),
                    }),
                    ..Volume::default()
                },
                Volume {
                    name: "config".to_owned(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(secret_name.to_owned()),
                        ..SecretVolumeSource::default()
                    }),
                    ..Volume::default()
                },
            ]),
            ..PodSpec::default()
        }),
        status: None,
    };

    match client.pods().create(&PostParams::default(), &pod).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(err) => Err(Error::Kube(err)),
    }
}

/// Best-effort delete of a runner pod; a 404 is success
pub async fn delete_runner_pod(client: &K8sClient, pod_name: &str) -> Result<()> {
    match client.pods().delete(pod_name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(err) => {
            warn!(pod = %pod_name, "failed to delete runner pod: {err}");
            Err(Error::Kube(err))
        }
    }
}

/// Exit code reported by the container, when known
pub async fn container_exit_code(client: &K8sClient, pod_name: &str) -> Result<Option<i32>> {
    let pod = client.pods().get(pod_name).await?;
    Ok(pod
        .status
        .and_then(|s| s.container_statuses)
        .and_then(|statuses| statuses.into_iter().next())
        .and_then(|status| status.state)
        .and_then(|state| state.terminated)
        .map(|terminated| terminated.exit_code))
}

//! Ephemeral runner-config secret lifecycle (§4.6 Phase 2 step 3, §6).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use pvbackup_core::config::{BackupConfig, BackupSpec, RunnerConfig};
use pvbackup_core::error::{Error, Result};
use pvbackup_core::K8sClient;
use tracing::warn;

/// Key under which the runner secret's YAML payload is stored
pub const CONFIG_SECRET_KEY: &str = "config.yaml";

/// The secret's name: the runner pod's name with a `-config` suffix
#[must_use]
pub fn secret_name(pod_name: &str) -> String {
    format!("{pod_name}-config")
}

/// Build and create the ephemeral secret for one backup attempt
pub async fn create_runner_secret(
    client: &K8sClient,
    app_name: &str,
    backup: &BackupConfig,
    spec: &BackupSpec,
    pod_name: &str,
) -> Result<String> {
    let name = secret_name(pod_name);
    let payload = RunnerConfig {
        repo: backup.repo.endpoint.clone(),
        passphrase: backup.repo.passphrase.clone(),
        ssh_key: backup.repo.ssh_key.clone(),
        archive_prefix: spec.archive_prefix(app_name),
        timeout_seconds: spec.timeout_seconds,
        borg_flags: spec
            .borg_flags
            .clone()
            .unwrap_or_else(|| vec!["--stats".to_owned()]),
        retention: backup.retention,
        cache_the_cache: backup.cache.cache_the_cache,
    };
    let yaml = serde_yaml::to_string(&payload)
        .map_err(|e| Error::Config(format!("failed to serialize runner secret: {e}")))?;

    let mut string_data = BTreeMap::new();
    let _ = string_data.insert(CONFIG_SECRET_KEY.to_owned(), yaml);

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(client.namespace().to_owned()),
            ..ObjectMeta::default()
        },
        string_data: Some(string_data),
        ..Secret::default()
    };

    match client.secrets().create(&PostParams::default(), &secret).await {
        Ok(_) => Ok(name),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(name),
        Err(err) => Err(Error::Kube(err)),
    }
}

/// Best-effort delete of a runner secret; a 404 is success
pub async fn delete_runner_secret(client: &K8sClient, name: &str) -> Result<()> {
    match client.secrets().delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(err) => {
            warn!(secret = %name, "failed to delete runner secret: {err}");
            Err(Error::Kube(err))
        }
    }
}
